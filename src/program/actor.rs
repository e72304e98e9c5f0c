//! # Program actor: drives one program through its lifecycle.
//!
//! One actor task per configured program. The actor owns the child process
//! and the state cell; the supervisor holds a [`ProgramHandle`] with a watch
//! receiver and the stop token.
//!
//! ## Stop protocol
//! 1. supervisor cancels the stop token
//! 2. actor sends SIGTERM to the child's process group, enters `Stopping`
//! 3. up to `join_time` of graceful wait, then SIGKILL and unbounded wait
//! 4. up to `join_time` for both pumps to drain, then pipes are dropped
//!
//! A cancelled kill token (second shutdown signal) skips the graceful wait.
//!
//! ## Restart
//! Helpers with `restart_delay` re-enter the loop after the delay unless a
//! stop was requested; `main` never restarts.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::state::{wait_state, ProgramState, StateCell};
use crate::config::{NameOrId, OneOrMany, ProgramConfig, MAIN_PROGRAM};
use crate::environment::EnvMap;
use crate::events::{Bus, Event, EventKind};
use crate::logging::{Level, ProgramLogger};
use crate::process::{self, ChildSpec, Invocation, RunningChild};
use crate::supervisor::OwnedPids;

/// Resolved, immutable description of one program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub invocation: Invocation,
    pub env: EnvMap,
    pub directory: Option<PathBuf>,
    pub user: Option<NameOrId>,
    pub group: Option<NameOrId>,
    pub umask: Option<u32>,
    pub startup_delay: Duration,
    pub join_time: Duration,
    pub restart_delay: Option<Duration>,
    pub loglevel: Level,
}

impl ProgramSpec {
    /// Builds the spec from a normalized program config and its effective
    /// environment.
    pub fn from_config(name: &str, config: &ProgramConfig, env: EnvMap) -> Self {
        let invocation = match (&config.command, &config.sh) {
            (Some(OneOrMany::Many(argv)), _) => Invocation::Argv(argv.clone()),
            (Some(OneOrMany::One(cmd)), _) => Invocation::Argv(vec![cmd.clone()]),
            (None, Some(OneOrMany::One(script))) => Invocation::Shell(script.clone()),
            (None, Some(OneOrMany::Many(snippets))) => {
                Invocation::Shell(snippets.join("; "))
            }
            // resolve_main rejects this shape before any spec is built
            (None, None) => Invocation::Argv(Vec::new()),
        };
        Self {
            name: name.to_string(),
            invocation,
            env,
            directory: config.directory.clone(),
            user: config.user.clone(),
            group: config.group.clone(),
            umask: config.umask.as_ref().map(|u| u.value()),
            startup_delay: config.startup_delay(),
            join_time: config.join_time(),
            restart_delay: config.restart_delay(),
            loglevel: config.effective_loglevel(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_PROGRAM
    }

    fn child_spec(&self) -> ChildSpec {
        ChildSpec {
            name: self.name.clone(),
            invocation: self.invocation.clone(),
            env: self.env.clone(),
            directory: self.directory.clone(),
            user: self.user.clone(),
            group: self.group.clone(),
            umask: self.umask,
            stdout_level: self.loglevel,
        }
    }
}

/// Supervisor-side handle to a running program actor.
pub struct ProgramHandle {
    name: String,
    state: watch::Receiver<ProgramState>,
    stop: CancellationToken,
    join_time: Duration,
    join: JoinHandle<()>,
}

impl ProgramHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProgramState {
        self.state.borrow().clone()
    }

    pub fn join_time(&self) -> Duration {
        self.join_time
    }

    /// Requests the stop protocol; idempotent.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Waits until the startup phase is over (running, delayed, or failed).
    pub async fn wait_started(&mut self) -> ProgramState {
        let join_time = self.join_time;
        wait_state(&mut self.state, ProgramState::is_started, Some(join_time)).await
    }

    /// Waits for a terminal state without a bound.
    pub async fn wait_terminal(&mut self) -> ProgramState {
        wait_state(&mut self.state, ProgramState::is_terminal, None).await
    }

    /// Waits for a terminal state up to `limit`, returning the last seen state.
    pub async fn wait_terminal_for(&mut self, limit: Duration) -> ProgramState {
        wait_state(&mut self.state, ProgramState::is_terminal, Some(limit)).await
    }

    /// Waits for the actor task itself to end (all pumps drained).
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// The per-program lifecycle task.
pub struct ProgramActor {
    spec: ProgramSpec,
    state: StateCell,
    logger: ProgramLogger,
    bus: Bus,
    owned: OwnedPids,
    stop: CancellationToken,
    kill: CancellationToken,
}

impl ProgramActor {
    /// Spawns the actor and returns the supervisor-side handle.
    pub fn start(
        spec: ProgramSpec,
        logger: ProgramLogger,
        bus: Bus,
        owned: OwnedPids,
        kill: CancellationToken,
    ) -> ProgramHandle {
        let stop = CancellationToken::new();
        let state = StateCell::new(logger.clone(), bus.clone());
        let state_rx = state.subscribe();
        let name = spec.name.clone();
        let join_time = spec.join_time;

        let actor = ProgramActor {
            spec,
            state,
            logger,
            bus,
            owned,
            stop: stop.clone(),
            kill,
        };
        let join = tokio::spawn(actor.run());

        ProgramHandle {
            name,
            state: state_rx,
            stop,
            join_time,
            join,
        }
    }

    async fn run(self) {
        let mut restarts: u64 = 0;
        loop {
            if self.stop.is_cancelled() {
                if !self.state.get().is_terminal() {
                    self.state.set(ProgramState::Canceled).await;
                }
                return;
            }

            if !self.attempt().await {
                return;
            }

            // Restart path: helpers with a restart delay only.
            let delay = match self.spec.restart_delay {
                Some(delay) if !self.spec.is_main() => delay,
                _ => return,
            };
            restarts += 1;
            self.logger
                .debug(format!(
                    "Restarting in {:.2} seconds (restart {restarts})...",
                    delay.as_secs_f64()
                ))
                .await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => return,
            }
        }
    }

    /// One spawn attempt. Returns false when the lifecycle is over for good
    /// (canceled or failed before exec), true when a restart may follow.
    async fn attempt(&self) -> bool {
        if !self.spec.startup_delay.is_zero() {
            self.state.set(ProgramState::Waiting).await;
            self.logger
                .debug(format!(
                    "Waiting {:.2} seconds to start...",
                    self.spec.startup_delay.as_secs_f64()
                ))
                .await;
            tokio::select! {
                _ = tokio::time::sleep(self.spec.startup_delay) => {}
                _ = self.stop.cancelled() => {
                    self.logger.info("Program start canceled.").await;
                    self.state.set(ProgramState::Canceled).await;
                    return false;
                }
            }
        }

        self.state.set(ProgramState::Starting).await;
        self.logger
            .debug(format!("Executing {}", self.spec.invocation.describe()))
            .await;

        let (mut child, pumps) = match process::spawn(&self.spec.child_spec(), &self.logger) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.logger
                    .error(format!(
                        "Failed to execute command {}: {err}",
                        self.spec.invocation.describe()
                    ))
                    .await;
                self.state
                    .set(ProgramState::Failed {
                        reason: err.to_string(),
                    })
                    .await;
                return true;
            }
        };

        let pid = child.pid();
        self.owned.insert(pid);
        self.state.set(ProgramState::Running { pid }).await;
        self.logger.debug(format!("Process pid {pid}")).await;

        let (status, was_stopped) = tokio::select! {
            status = child.wait() => (status, false),
            _ = self.stop.cancelled() => {
                self.state.set(ProgramState::Stopping { pid }).await;
                (self.stop_child(&mut child, pid).await, true)
            }
        };
        self.owned.remove(pid);

        // Bounded drain; a stuck pump is log loss, not child failure.
        if timeout(self.spec.join_time, pumps.join()).await.is_err() {
            self.bus
                .publish(Event::now(EventKind::LogLoss).with_program(self.spec.name.as_str()));
        }

        let next = exit_state(status, was_stopped);
        match &next {
            ProgramState::Exited { .. } if was_stopped => {
                self.logger.info("Program has stopped.").await;
            }
            ProgramState::Exited { code } => {
                let level = if *code == 0 { Level::Info } else { Level::Error };
                self.logger.log(level, format!("Exited with rc: {code}")).await;
            }
            ProgramState::Crashed { signal } => {
                self.logger
                    .error(format!("Terminated by signal {signal}"))
                    .await;
            }
            ProgramState::Failed { reason } => {
                self.logger.error(format!("Wait failed: {reason}")).await;
            }
            _ => {}
        }
        self.state.set(next).await;

        !was_stopped
    }

    /// SIGTERM, graceful wait bounded by `join_time`, then SIGKILL and an
    /// unbounded wait. A cancelled kill token short-circuits the grace.
    async fn stop_child(
        &self,
        child: &mut RunningChild,
        pid: i32,
    ) -> std::io::Result<ExitStatus> {
        self.logger
            .debug(format!("Terminating process {pid}"))
            .await;
        child.terminate();

        let graceful = tokio::select! {
            res = timeout(self.spec.join_time, child.wait()) => res.ok(),
            _ = self.kill.cancelled() => None,
        };
        match graceful {
            Some(status) => status,
            None => {
                self.logger.debug(format!("Killing process {pid}")).await;
                child.kill();
                child.wait().await
            }
        }
    }
}

/// Maps a wait result onto the state machine.
fn exit_state(status: std::io::Result<ExitStatus>, was_stopped: bool) -> ProgramState {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                ProgramState::Exited { code }
            } else if let Some(signal) = status.signal() {
                if was_stopped {
                    ProgramState::Exited {
                        code: 128 + signal,
                    }
                } else {
                    ProgramState::Crashed { signal }
                }
            } else {
                ProgramState::Exited { code: -1 }
            }
        }
        Err(err) => ProgramState::Failed {
            reason: format!("wait failed: {err}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, Logger};

    fn shell_spec(name: &str, script: &str) -> ProgramSpec {
        ProgramSpec {
            name: name.to_string(),
            invocation: Invocation::Shell(script.to_string()),
            env: EnvMap::new(),
            directory: None,
            user: None,
            group: None,
            umask: None,
            startup_delay: Duration::ZERO,
            join_time: Duration::from_secs(1),
            restart_delay: None,
            loglevel: Level::Info,
        }
    }

    fn start(spec: ProgramSpec) -> ProgramHandle {
        let logger = Logger::to_writer(LogFormat::default(), Box::new(tokio::io::sink()));
        let tagged = logger.for_program(spec.name.clone(), Level::Debug);
        ProgramActor::start(
            spec,
            tagged,
            Bus::new(64),
            OwnedPids::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn clean_exit_reports_code_zero() {
        let mut handle = start(shell_spec("t", "true"));
        assert_eq!(handle.wait_terminal().await, ProgramState::Exited { code: 0 });
        handle.join().await;
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code() {
        let mut handle = start(shell_spec("t", "exit 3"));
        assert_eq!(handle.wait_terminal().await, ProgramState::Exited { code: 3 });
        handle.join().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_failed_state() {
        let mut spec = shell_spec("t", "");
        spec.invocation = Invocation::Argv(vec!["/nonexistent/binary".to_string()]);
        let mut handle = start(spec);
        assert!(matches!(
            handle.wait_terminal().await,
            ProgramState::Failed { .. }
        ));
        handle.join().await;
    }

    #[tokio::test]
    async fn stop_terminates_a_running_program() {
        let mut handle = start(shell_spec("t", "sleep 30"));
        let state = handle.wait_started().await;
        assert!(state.is_running(), "got {state}");

        handle.request_stop();
        let state = handle.wait_terminal().await;
        assert_eq!(state, ProgramState::Exited { code: 128 + 15 });
        handle.join().await;
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_join_time() {
        // The exec keeps TERM ignored in the long-running process itself;
        // signals go to the whole process group.
        let mut spec = shell_spec("t", "trap '' TERM; exec sleep 30");
        spec.join_time = Duration::from_millis(200);
        let mut handle = start(spec);
        let state = handle.wait_started().await;
        assert!(state.is_running(), "got {state}");
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.request_stop();
        let state = handle.wait_terminal().await;
        assert_eq!(state, ProgramState::Exited { code: 128 + 9 });
        handle.join().await;
    }

    #[tokio::test]
    async fn stop_during_startup_delay_cancels() {
        let mut spec = shell_spec("t", "true");
        spec.startup_delay = Duration::from_secs(30);
        let mut handle = start(spec);

        let state = handle.wait_started().await;
        assert_eq!(state, ProgramState::Waiting);

        handle.request_stop();
        assert_eq!(handle.wait_terminal().await, ProgramState::Canceled);
        handle.join().await;
    }

    #[tokio::test]
    async fn helper_restarts_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!(
            "if [ -e {m} ]; then sleep 30; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let mut spec = shell_spec("helper", &script);
        spec.restart_delay = Some(Duration::from_millis(50));
        let mut handle = start(spec);

        // First run exits 1, then the actor restarts into the long sleep.
        let state = wait_state(
            &mut handle.state,
            |s| matches!(s, ProgramState::Running { .. }) && std::fs::metadata(&marker).is_ok(),
            Some(Duration::from_secs(5)),
        )
        .await;
        assert!(state.is_running(), "expected restarted run, got {state}");

        handle.request_stop();
        handle.wait_terminal().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn main_never_restarts() {
        let mut spec = shell_spec(MAIN_PROGRAM, "exit 1");
        spec.restart_delay = Some(Duration::from_millis(10));
        let mut handle = start(spec);
        assert_eq!(handle.wait_terminal().await, ProgramState::Exited { code: 1 });
        handle.join().await;
    }
}
