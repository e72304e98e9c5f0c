//! # Supervisor: orchestrates program actors and shutdown.
//!
//! The [`Supervisor`] owns the runtime components (event bus, logger handle,
//! owned-pid set) and drives the whole lifecycle from config to exit code.
//!
//! ## Architecture
//! ```text
//! Config ──► Supervisor::run()
//!               │
//!               ├──► extension hooks (validate → configure → update_environment → update_config)
//!               ├──► signal router ──► Bus (ShutdownRequested / KillAllRequested)
//!               ├──► reaper (PID 1 only)
//!               ├──► helper actors, started in declared order
//!               ├──► main actor (CLI argv override applies)
//!               │
//!               └──► wait for:
//!                     ├──► main terminal ──► halt_on_exit? park : reverse teardown
//!                     └──► shutdown signal ──► stop main ──► reverse teardown
//! ```
//!
//! ## Rules
//! - Helpers start in declared order and stop in reverse declared order
//! - `main` starts only after every helper is running, delayed, or timed out
//! - Helper teardown never begins while `main` is alive (absent a shutdown signal)
//! - Each helper gets `join_time` for graceful stop plus `join_time` for the
//!   forced kill; the waits for separate helpers overlap
//! - The supervisor's exit code reflects `main` (§ exit code mapping below)

mod reaper;
mod signals;

pub use reaper::{OwnedPids, Reaper};
pub use signals::{ignore_sigpipe, spawn_router};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, MAIN_PROGRAM};
use crate::environment::Environments;
use crate::events::{Bus, Event, EventKind};
use crate::ext::{ExtensionHost, ExtensionRuntime};
use crate::logging::{Logger, ProgramLogger, ENCAB};
use crate::program::{ProgramActor, ProgramHandle, ProgramSpec, ProgramState};

/// Capacity of the event bus channel.
const BUS_CAPACITY: usize = 1024;

/// Orchestrates program actors, extensions, signals and teardown.
pub struct Supervisor {
    config: Config,
    logger: Logger,
    elog: ProgramLogger,
    bus: Bus,
    owned: OwnedPids,
}

impl Supervisor {
    /// Creates a supervisor over a normalized config and a logger sink.
    pub fn new(config: Config, logger: Logger) -> Self {
        let elog = logger.for_program(ENCAB, config.encab.effective_loglevel());
        Self {
            config,
            logger,
            elog,
            bus: Bus::new(BUS_CAPACITY),
            owned: OwnedPids::default(),
        }
    }

    /// Event bus handle, mainly for tests observing lifecycle events.
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// Runs the full lifecycle and returns the process exit code.
    ///
    /// `args` are the positional CLI arguments; they override `main`'s
    /// command.
    pub async fn run(mut self, args: Vec<String>) -> i32 {
        let code = self.run_inner(args).await;
        self.logger.flush().await;
        code
    }

    async fn run_inner(&mut self, args: Vec<String>) -> i32 {
        self.elog.info("starting...").await;

        if let Err(err) = self.config.resolve_main(&args) {
            self.elog
                .critical(format!("Error in configuration: {err}"))
                .await;
            return 1;
        }
        if let Err(code) = self.apply_own_identity().await {
            return code;
        }

        // Extension hooks, in declared order.
        let dry_run = self.config.encab.dry_run.unwrap_or(false);
        let (mut host, unknown) = ExtensionHost::discover(&self.config);
        for name in unknown {
            self.elog
                .warning(format!("Unknown extension '{name}' ignored"))
                .await;
        }
        if let Err(err) = host.validate_all(&self.elog, dry_run).await {
            self.elog
                .critical(format!("Error in configuration: {err}"))
                .await;
            return 1;
        }
        if let Err(err) = host.configure_all(&self.elog).await {
            self.elog
                .critical(format!("Error in configuration: {err}"))
                .await;
            return 1;
        }

        // A dry run stops here: the environment hooks run scripts and spawn
        // shell children, and a dry run must have no side effects.
        if dry_run {
            self.elog.info("settings are valid.").await;
            self.elog.info("Dry run succeeded. Exiting.").await;
            return 0;
        }

        let mut envs = Environments::from_config(&self.config);
        if let Err(err) = host.update_environment(&mut envs, &self.elog).await {
            self.elog
                .critical(format!("Failed to build environment: {err}"))
                .await;
            return 1;
        }
        if let Err(err) = host.update_config(&mut self.config, &self.elog).await {
            self.elog
                .critical(format!("Error in configuration: {err}"))
                .await;
            return 1;
        }

        // Signals, reaper, extension background tasks.
        signals::ignore_sigpipe();
        let runtime_token = CancellationToken::new();
        let mut shutdown_rx = self.bus.subscribe();
        let _router = match signals::spawn_router(self.bus.clone(), runtime_token.clone()) {
            Ok(router) => router,
            Err(err) => {
                self.elog
                    .critical(format!("Failed to install signal handlers: {err}"))
                    .await;
                return 1;
            }
        };

        let mut background: Vec<JoinHandle<()>> = Vec::new();
        if std::process::id() == 1 && self.config.wants_reaping() {
            let reaper = Reaper::new(self.owned.clone(), self.elog.clone(), self.bus.clone());
            background.push(reaper.spawn(runtime_token.clone()));
        } else if self.config.wants_reaping() {
            self.elog
                .debug("reap_zombies is set but encab is not PID 1; reaper not started")
                .await;
        }

        let ext_runtime = ExtensionRuntime {
            logger: self.logger.clone(),
            env: envs.base.clone(),
            token: runtime_token.clone(),
        };
        background.extend(host.extend(&ext_runtime));

        // Second shutdown signal kills everything immediately, whatever phase
        // the supervisor is in.
        let kill_token = CancellationToken::new();
        {
            let mut rx = self.bus.subscribe();
            let kill = kill_token.clone();
            let stop = runtime_token.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        ev = rx.recv() => match ev {
                            Ok(ev) if ev.kind == EventKind::KillAllRequested => {
                                kill.cancel();
                                break;
                            }
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }
                }
            }));
        }

        let code = self
            .run_programs(&envs, kill_token, &mut shutdown_rx)
            .await;

        runtime_token.cancel();
        code
    }

    /// Starts helpers then main, supervises until teardown, returns exit code.
    async fn run_programs(
        &self,
        envs: &Environments,
        kill_token: CancellationToken,
        shutdown_rx: &mut tokio::sync::broadcast::Receiver<Event>,
    ) -> i32 {
        let mut helpers: Vec<ProgramHandle> = Vec::new();

        for (name, config) in &self.config.programs {
            if name == MAIN_PROGRAM {
                continue;
            }
            let spec = ProgramSpec::from_config(name, config, envs.effective(name));
            let plog = self
                .logger
                .for_program(name.clone(), config.effective_loglevel());
            let mut handle =
                ProgramActor::start(spec, plog, self.bus.clone(), self.owned.clone(), kill_token.clone());
            let state = handle.wait_started().await;
            helpers.push(handle);

            if matches!(
                state,
                ProgramState::Failed { .. } | ProgramState::Crashed { .. }
            ) {
                self.elog
                    .error(format!("Helper '{name}' failed to start ({state}). Shutting down."))
                    .await;
                self.stop_programs(helpers).await;
                return 1;
            }
        }

        let main_config = &self.config.programs[MAIN_PROGRAM];
        let main_spec = ProgramSpec::from_config(MAIN_PROGRAM, main_config, envs.effective(MAIN_PROGRAM));
        let main_log = self
            .logger
            .for_program(MAIN_PROGRAM, main_config.effective_loglevel());
        let mut main = ProgramActor::start(
            main_spec,
            main_log,
            self.bus.clone(),
            self.owned.clone(),
            kill_token.clone(),
        );

        // Steady state: first of main ending or a shutdown signal.
        let mut signal_shutdown = false;
        let main_state = loop {
            tokio::select! {
                state = main.wait_terminal() => break state,
                ev = shutdown_rx.recv() => {
                    if let Ok(ev) = ev {
                        if ev.kind == EventKind::ShutdownRequested {
                            let name = ev.detail.as_deref().unwrap_or("signal");
                            self.elog
                                .info(format!(
                                    "Received {name}. Interrupting/terminating programs..."
                                ))
                                .await;
                            signal_shutdown = true;
                            main.request_stop();
                        }
                    }
                }
            }
        };

        if self.config.encab.halt_on_exit && !signal_shutdown {
            self.elog.info("Programs ended. Halting for diagnose.").await;
            loop {
                match shutdown_rx.recv().await {
                    Ok(ev) if ev.kind == EventKind::ShutdownRequested => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            self.elog.info("Received shutdown signal. Exiting.").await;
        }

        main.join().await;
        self.stop_programs(helpers).await;

        exit_code(&main_state)
    }

    /// Stops programs with the stop protocol. Stop requests walk the reverse
    /// start order; the bounded waits then run concurrently, so teardown is
    /// bounded by the slowest program rather than the sum of all waits.
    async fn stop_programs(&self, mut programs: Vec<ProgramHandle>) {
        for handle in programs.iter_mut().rev() {
            self.elog
                .debug(format!("Stopping program '{}'", handle.name()))
                .await;
            handle.request_stop();
        }

        let waits = programs.iter_mut().map(|handle| async move {
            let limit = handle.join_time() * 2;
            let state = handle.wait_terminal_for(limit).await;
            (!state.is_terminal()).then(|| handle.name().to_string())
        });
        let stuck: Vec<String> = join_all(waits).await.into_iter().flatten().collect();
        for name in stuck {
            self.elog
                .warning(format!("Program '{name}' did not stop in time; moving on"))
                .await;
        }

        // Join the actor tasks so every pump has drained.
        let joins = programs.drain(..).map(|handle| {
            let limit = handle.join_time() * 2;
            async move {
                let _ = timeout(limit, handle.join()).await;
            }
        });
        join_all(joins).await;
    }

    /// Applies `encab.user` / `encab.umask` to the supervisor itself.
    async fn apply_own_identity(&self) -> Result<(), i32> {
        use crate::config::NameOrId;

        if let Some(umask) = &self.config.encab.umask {
            nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(umask.value()));
        }
        if let Some(user) = &self.config.encab.user {
            let uid = match user {
                NameOrId::Id(id) => nix::unistd::Uid::from_raw(*id),
                NameOrId::Name(name) => match nix::unistd::User::from_name(name) {
                    Ok(Some(user)) => user.uid,
                    _ => {
                        self.elog
                            .critical(format!("Error in configuration: unknown user {name}"))
                            .await;
                        return Err(1);
                    }
                },
            };
            if uid != nix::unistd::Uid::current() {
                if let Err(err) = nix::unistd::setuid(uid) {
                    self.elog
                        .critical(format!(
                            "Failed to set the encab user: {err}. \
                             To set the user, you have to run encab as root."
                        ))
                        .await;
                    return Err(1);
                }
            }
        }
        Ok(())
    }
}

/// Exit code mapping: main's code, `128 + signo` for signal deaths, 1 for
/// programs that never ran, 0 for canceled spawns (orderly shutdown).
fn exit_code(state: &ProgramState) -> i32 {
    match state {
        ProgramState::Exited { code } => *code,
        ProgramState::Crashed { signal } => 128 + signal,
        ProgramState::Failed { .. } => 1,
        ProgramState::Canceled => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code(&ProgramState::Exited { code: 0 }), 0);
        assert_eq!(exit_code(&ProgramState::Exited { code: 7 }), 7);
        assert_eq!(exit_code(&ProgramState::Crashed { signal: 9 }), 137);
        assert_eq!(
            exit_code(&ProgramState::Failed {
                reason: "exec".into()
            }),
            1
        );
        assert_eq!(exit_code(&ProgramState::Canceled), 0);
    }
}
