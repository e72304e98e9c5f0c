//! # Program lifecycle states.
//!
//! ```text
//! Init ──► Waiting ──► Starting ──► Running ──► Exited
//!   │         │           │           │
//!   │         │           │           ├──► Stopping ──► Exited
//!   │         │           │           └──► Crashed
//!   │         │           └──► Failed
//!   └─────────┴──► Canceled
//!
//! Exited/Crashed/Failed ──► Starting   (helper restart)
//! ```
//!
//! ## Rules
//! - All transitions are logged at DEBUG and published on the bus
//! - Transitions for one program are totally ordered (single writer: its actor)
//! - Terminal states for shutdown accounting: `Exited`, `Crashed`, `Failed`,
//!   `Canceled`

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::events::{Bus, Event, EventKind};
use crate::logging::ProgramLogger;

/// State of one supervised program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramState {
    /// Not started yet.
    Init,
    /// Sleeping through its startup delay.
    Waiting,
    /// Between fork and the liveness ack.
    Starting,
    /// Process is executing; no termination requested.
    Running { pid: i32 },
    /// The supervisor asked the program to stop.
    Stopping { pid: i32 },
    /// Process exited; signal exits during a requested stop map to `128 + signo`.
    Exited { code: i32 },
    /// Process was killed by a signal the supervisor did not send.
    Crashed { signal: i32 },
    /// The program never ran (spawn, id resolution or chdir failure).
    Failed { reason: String },
    /// The spawn was canceled before the process existed (shutdown, dry run).
    Canceled,
}

impl ProgramState {
    /// True for states that end the lifecycle (modulo restart).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgramState::Exited { .. }
                | ProgramState::Crashed { .. }
                | ProgramState::Failed { .. }
                | ProgramState::Canceled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProgramState::Running { .. } | ProgramState::Stopping { .. }
        )
    }

    /// True when the startup phase is over: the supervisor may move on to the
    /// next program. A program sleeping through its startup delay counts.
    pub fn is_started(&self) -> bool {
        matches!(self, ProgramState::Waiting | ProgramState::Running { .. })
            || self.is_terminal()
    }

    /// Whether the machine permits `self → next`.
    pub fn permits(&self, next: &ProgramState) -> bool {
        use ProgramState::*;
        match (self, next) {
            (Init, Waiting | Starting | Canceled) => true,
            (Waiting, Starting | Canceled) => true,
            (Starting, Running { .. } | Failed { .. } | Crashed { .. } | Canceled) => true,
            (Running { .. }, Stopping { .. } | Exited { .. } | Crashed { .. }) => true,
            (Stopping { .. }, Exited { .. } | Crashed { .. }) => true,
            (Exited { .. } | Crashed { .. } | Failed { .. }, Waiting | Starting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramState::Init => write!(f, "Init"),
            ProgramState::Waiting => write!(f, "Waiting"),
            ProgramState::Starting => write!(f, "Starting"),
            ProgramState::Running { pid } => write!(f, "Running(pid={pid})"),
            ProgramState::Stopping { pid } => write!(f, "Stopping(pid={pid})"),
            ProgramState::Exited { code } => write!(f, "Exited(rc={code})"),
            ProgramState::Crashed { signal } => write!(f, "Crashed(signal={signal})"),
            ProgramState::Failed { reason } => write!(f, "Failed({reason})"),
            ProgramState::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Observable state holder for one program.
///
/// The owning actor is the only writer; everyone else subscribes.
pub struct StateCell {
    tx: watch::Sender<ProgramState>,
    logger: ProgramLogger,
    bus: Bus,
}

impl StateCell {
    pub fn new(logger: ProgramLogger, bus: Bus) -> Self {
        let (tx, _rx) = watch::channel(ProgramState::Init);
        Self { tx, logger, bus }
    }

    pub fn get(&self) -> ProgramState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgramState> {
        self.tx.subscribe()
    }

    /// Moves to `next`, logging the transition and publishing it on the bus.
    pub async fn set(&self, next: ProgramState) {
        let current = self.get();
        debug_assert!(
            current.permits(&next),
            "invalid transition {current} -> {next}"
        );
        self.logger
            .debug(format!("Changing state to {next}"))
            .await;
        let kind = if next.is_terminal() {
            EventKind::ProgramEnded
        } else {
            EventKind::StateChanged
        };
        self.bus.publish(
            Event::now(kind)
                .with_program(self.logger.name())
                .with_state(next.clone()),
        );
        self.tx.send_replace(next);
    }
}

/// Waits until the observed state satisfies `pred`, or the timeout elapses.
///
/// Returns the state seen last in either case.
pub async fn wait_state<F>(
    rx: &mut watch::Receiver<ProgramState>,
    mut pred: F,
    timeout: Option<Duration>,
) -> ProgramState
where
    F: FnMut(&ProgramState) -> bool,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let current = rx.borrow().clone();
        if pred(&current) {
            return current;
        }
        match deadline {
            Some(deadline) => match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender gone or deadline hit: report what we have.
                Ok(Err(_)) | Err(_) => return rx.borrow().clone(),
            },
            None => {
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        }
    }
}
