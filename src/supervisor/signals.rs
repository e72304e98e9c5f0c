//! # Signal router.
//!
//! Translates external signals into supervisor commands posted on the event
//! bus. The handlers do no work themselves; shutdown always runs on the
//! supervisor task.
//!
//! - `SIGINT`, `SIGTERM`, `SIGHUP` → [`EventKind::ShutdownRequested`];
//!   a second occurrence escalates to [`EventKind::KillAllRequested`]
//! - `SIGCHLD` wakes the reaper and waiting actors (tokio handles delivery)
//! - `SIGPIPE` is ignored process-wide

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};

/// Ignores SIGPIPE for the whole process.
///
/// A closed log reader must never kill the supervisor; writes fail with EPIPE
/// instead.
pub fn ignore_sigpipe() {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGPIPE, &action);
    }
}

/// Installs the shutdown signal listeners and spawns the router task.
pub fn spawn_router(bus: Bus, token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let mut shutdown_requested = false;
        loop {
            let name = tokio::select! {
                _ = token.cancelled() => break,
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
                _ = sighup.recv() => "SIGHUP",
            };
            if shutdown_requested {
                bus.publish(Event::now(EventKind::KillAllRequested).with_detail(name));
            } else {
                shutdown_requested = true;
                bus.publish(Event::now(EventKind::ShutdownRequested).with_detail(name));
            }
        }
    }))
}
