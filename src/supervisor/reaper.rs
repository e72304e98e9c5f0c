//! # Orphan reaper for PID 1 runs.
//!
//! When encab is PID 1 the kernel reparents orphaned descendants to it. The
//! reaper wakes on SIGCHLD (and a slow tick as a safety net), peeks at
//! reapable children with `waitid(..., WNOWAIT)` and consumes only those it
//! does not own.
//!
//! ## Rules
//! - Pids owned by program actors are never consumed; the actor's `wait`
//!   claims those statuses (the owned set is written only by actors)
//! - Every reap is logged at DEBUG with pid and status
//! - The reaper stops only when the supervisor enters final teardown

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};
use crate::logging::ProgramLogger;

/// Pids whose exit statuses belong to program actors.
///
/// Plain mutex over a set: insertions and removals are rare and quick, and
/// only actors write.
#[derive(Clone, Default)]
pub struct OwnedPids {
    inner: Arc<Mutex<HashSet<i32>>>,
}

impl OwnedPids {
    pub fn insert(&self, pid: i32) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(pid);
        }
    }

    pub fn remove(&self, pid: i32) {
        if let Ok(mut set) = self.inner.lock() {
            set.remove(&pid);
        }
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.inner.lock().map(|set| set.contains(&pid)).unwrap_or(false)
    }
}

/// Continuously adopts and waits on orphaned descendants.
pub struct Reaper {
    owned: OwnedPids,
    logger: ProgramLogger,
    bus: Bus,
}

impl Reaper {
    pub fn new(owned: OwnedPids, logger: ProgramLogger, bus: Bus) -> Self {
        Self { owned, logger, bus }
    }

    /// Spawns the reaper loop; it runs until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(self, token: CancellationToken) {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(stream) => stream,
            Err(err) => {
                self.logger
                    .error(format!("Failed to install SIGCHLD handler: {err}"))
                    .await;
                return;
            }
        };
        // Safety net for wakeups coalesced away while we were reaping.
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sigchld.recv() => {}
                _ = tick.tick() => {}
            }
            self.reap_orphans().await;
        }
    }

    /// Consumes every reapable status that no actor owns.
    async fn reap_orphans(&self) {
        loop {
            let peeked = waitid(
                Id::All,
                WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
            );
            let pid = match peeked {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => pid,
                    None => break,
                },
                // ECHILD: nothing left to wait for.
                Err(_) => break,
            };

            if self.owned.contains(pid.as_raw()) {
                // Leave it for its actor; SIGCHLD fires again for others.
                break;
            }

            match nix::sys::wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => {
                    self.logger
                        .debug(format!("Reaped orphan pid {pid}: {status:?}"))
                        .await;
                    self.bus.publish(
                        Event::now(EventKind::OrphanReaped)
                            .with_pid(pid.as_raw())
                            .with_detail(format!("{status:?}")),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_pids_add_remove() {
        let owned = OwnedPids::default();
        owned.insert(42);
        assert!(owned.contains(42));
        owned.remove(42);
        assert!(!owned.contains(42));
    }

    #[test]
    fn owned_pids_clones_share_state() {
        let owned = OwnedPids::default();
        let clone = owned.clone();
        owned.insert(7);
        assert!(clone.contains(7));
    }
}
