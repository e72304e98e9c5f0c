//! # Runtime events emitted by the supervisor and program actors.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Lifecycle events**: program execution flow (state changes, exits)
//! - **Control events**: shutdown and kill-all requests posted by the signal router
//! - **Housekeeping events**: orphan reaps, log-loss notices
//!
//! The [`Event`] struct carries additional metadata such as timestamps,
//! program name, pid and exit status.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. This guarantees that events can be ordered correctly even
//! when delivered out-of-order through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::program::ProgramState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Control events ===
    /// Orderly shutdown requested (first SIGINT/SIGTERM/SIGHUP).
    ShutdownRequested,
    /// Immediate kill requested (second shutdown signal).
    KillAllRequested,

    // === Program lifecycle events ===
    /// A program changed state (payload in [`Event::state`]).
    StateChanged,
    /// A program reached a terminal state.
    ProgramEnded,

    // === Housekeeping events ===
    /// The reaper collected an orphaned descendant.
    OrphanReaped,
    /// A log pump ended before its child exited; output may be lost.
    LogLoss,
}

/// Runtime event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the program, if applicable.
    pub program: Option<String>,
    /// Process id, if applicable (reaps, running transitions).
    pub pid: Option<i32>,
    /// New program state for `StateChanged`/`ProgramEnded`.
    pub state: Option<ProgramState>,
    /// Free-form detail (signal name, reap status).
    pub detail: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            program: None,
            pid: None,
            state: None,
            detail: None,
        }
    }

    /// Attaches a program name.
    pub fn with_program(mut self, name: impl Into<String>) -> Self {
        self.program = Some(name.into());
        self
    }

    /// Attaches a process id.
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a program state.
    pub fn with_state(mut self, state: ProgramState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attaches a free-form detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
