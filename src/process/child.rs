//! # Child runner: spawn one configured program.
//!
//! Spawning follows a fixed sequence: resolve user/group to numeric ids, open
//! the stdio pipes, fork, apply gid → uid → umask → working directory between
//! fork and exec, then exec. Any failure along the way surfaces as a
//! [`SpawnError`] without the program ever entering the running state.
//!
//! The child gets its own process group so that termination signals reach the
//! whole tree (`sh -c` children included).

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::{umask as set_umask, Mode};
use nix::unistd::{setgid, setuid, Gid, Pid, Uid};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::pump;
use crate::config::NameOrId;
use crate::environment::EnvMap;
use crate::error::SpawnError;
use crate::logging::{Level, ProgramLogger};

/// How a program is invoked.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Direct exec of argv tokens.
    Argv(Vec<String>),
    /// One shell script, run under `sh -c`.
    Shell(String),
}

impl Invocation {
    /// Human-readable form for log messages.
    pub fn describe(&self) -> String {
        match self {
            Invocation::Argv(argv) => argv.join(" "),
            Invocation::Shell(script) => script.clone(),
        }
    }
}

/// Fully resolved description of one child to spawn.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub name: String,
    pub invocation: Invocation,
    pub env: EnvMap,
    pub directory: Option<PathBuf>,
    pub user: Option<NameOrId>,
    pub group: Option<NameOrId>,
    pub umask: Option<u32>,
    /// Severity assigned to captured stdout lines.
    pub stdout_level: Level,
}

/// A spawned child plus its pid (kept separately: the pid stays addressable
/// for signalling after `wait` consumed the exit status).
#[derive(Debug)]
pub struct RunningChild {
    child: Child,
    pid: i32,
}

impl RunningChild {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Waits for the child to exit and returns its status.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Sends a signal to the child's process group. Races with process exit
    /// are ignored, the exit status tells the real story.
    pub fn signal(&self, signal: Signal) {
        let _ = killpg(Pid::from_raw(self.pid), signal);
    }

    pub fn terminate(&self) {
        self.signal(Signal::SIGTERM);
    }

    pub fn kill(&self) {
        self.signal(Signal::SIGKILL);
    }
}

/// Join handles for the two output pumps of a child.
#[derive(Debug)]
pub struct PumpHandles {
    pub stdout: JoinHandle<()>,
    pub stderr: JoinHandle<()>,
}

impl PumpHandles {
    /// Waits for both pumps to finish draining.
    pub async fn join(self) {
        let _ = self.stdout.await;
        let _ = self.stderr.await;
    }
}

/// Spawns the child described by `spec` and starts its output pumps.
///
/// stdout lines log at `spec.stdout_level`, stderr lines at ERROR.
pub fn spawn(spec: &ChildSpec, logger: &ProgramLogger) -> Result<(RunningChild, PumpHandles), SpawnError> {
    let uid = spec.user.as_ref().map(resolve_user).transpose()?;
    let gid = spec.group.as_ref().map(resolve_group).transpose()?;

    if let Some(uid) = uid {
        if uid != Uid::current() && !Uid::current().is_root() {
            return Err(SpawnError::NotRoot);
        }
    }

    let mut cmd = match &spec.invocation {
        Invocation::Argv(argv) => {
            let (program, args) = argv.split_first().ok_or_else(|| SpawnError::Exec {
                command: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            })?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        Invocation::Shell(script) => {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(script);
            cmd
        }
    };

    cmd.env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if let Some(dir) = &spec.directory {
        cmd.current_dir(dir);
    }

    let umask = spec.umask;
    unsafe {
        cmd.pre_exec(move || {
            if let Some(gid) = gid {
                setgid(gid).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            if let Some(uid) = uid {
                setuid(uid).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            if let Some(mask) = umask {
                set_umask(Mode::from_bits_truncate(mask));
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Exec {
        command: spec.invocation.describe(),
        source,
    })?;

    let pid = child.id().map(|p| p as i32).unwrap_or_default();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pumps = PumpHandles {
        stdout: spawn_pump(stdout, logger, spec.stdout_level),
        stderr: spawn_pump(stderr, logger, Level::Error),
    };

    Ok((RunningChild { child, pid }, pumps))
}

fn spawn_pump<R>(reader: Option<R>, logger: &ProgramLogger, level: Level) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    // stderr records must pass the threshold even for quiet programs.
    let logger = if level > Level::Debug && !logger.enabled(level) {
        logger.with_threshold(level)
    } else {
        logger.clone()
    };
    match reader {
        Some(reader) => tokio::spawn(async move { pump(reader, logger, level).await }),
        None => tokio::spawn(async {}),
    }
}

fn resolve_user(user: &NameOrId) -> Result<Uid, SpawnError> {
    match user {
        NameOrId::Id(id) => Ok(Uid::from_raw(*id)),
        NameOrId::Name(name) => match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid),
            _ => Err(SpawnError::UnknownUser { user: name.clone() }),
        },
    }
}

fn resolve_group(group: &NameOrId) -> Result<Gid, SpawnError> {
    match group {
        NameOrId::Id(id) => Ok(Gid::from_raw(*id)),
        NameOrId::Name(name) => match nix::unistd::Group::from_name(name) {
            Ok(Some(group)) => Ok(group.gid),
            _ => Err(SpawnError::UnknownGroup { group: name.clone() }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, Logger};
    use tokio::io::AsyncReadExt;

    fn shell_spec(script: &str) -> ChildSpec {
        ChildSpec {
            name: "test".to_string(),
            invocation: Invocation::Shell(script.to_string()),
            env: EnvMap::new(),
            directory: None,
            user: None,
            group: None,
            umask: None,
            stdout_level: Level::Info,
        }
    }

    async fn capture() -> (Logger, ProgramLogger, tokio::io::DuplexStream) {
        let (write, read) = tokio::io::duplex(64 * 1024);
        let logger = Logger::to_writer(LogFormat::default(), Box::new(write));
        let tagged = logger.for_program("test", Level::Debug);
        (logger, tagged, read)
    }

    /// Drops every handle so the drain task closes the writer, then reads the
    /// full output.
    async fn output(
        logger: Logger,
        tagged: ProgramLogger,
        mut read: tokio::io::DuplexStream,
    ) -> String {
        logger.flush().await;
        drop(tagged);
        drop(logger);
        let mut out = String::new();
        let _ = read.read_to_string(&mut out).await;
        out
    }

    #[tokio::test]
    async fn captures_stdout_as_records() {
        let (logger, tagged, read) = capture().await;
        let (mut child, pumps) = spawn(&shell_spec("echo hello"), &tagged).unwrap();

        let status = child.wait().await.unwrap();
        assert!(status.success());
        pumps.join().await;

        let out = output(logger, tagged, read).await;
        assert!(out.contains("INFO  test: hello"), "got: {out}");
    }

    #[tokio::test]
    async fn stderr_is_logged_as_error() {
        let (logger, tagged, read) = capture().await;
        let (mut child, pumps) = spawn(&shell_spec("echo oops >&2"), &tagged).unwrap();

        child.wait().await.unwrap();
        pumps.join().await;

        let out = output(logger, tagged, read).await;
        assert!(out.contains("ERROR test: oops"), "got: {out}");
    }

    #[tokio::test]
    async fn child_env_is_fully_replaced() {
        let (logger, tagged, read) = capture().await;
        let mut spec = shell_spec("echo \"mark=$MARK other=$HOME\"");
        spec.env.insert("MARK".to_string(), "42".to_string());
        let (mut child, pumps) = spawn(&spec, &tagged).unwrap();

        child.wait().await.unwrap();
        pumps.join().await;

        let out = output(logger, tagged, read).await;
        assert!(out.contains("mark=42 other="), "got: {out}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_exec_error() {
        let (_logger, tagged, _read) = capture().await;
        let spec = ChildSpec {
            invocation: Invocation::Argv(vec!["/nonexistent/binary".to_string()]),
            ..shell_spec("")
        };
        let err = spawn(&spec, &tagged).unwrap_err();
        assert_eq!(err.as_label(), "spawn_exec");
    }

    #[tokio::test]
    async fn unknown_user_is_reported() {
        let (_logger, tagged, _read) = capture().await;
        let spec = ChildSpec {
            user: Some(NameOrId::Name("no-such-user-xyz".to_string())),
            ..shell_spec("true")
        };
        let err = spawn(&spec, &tagged).unwrap_err();
        assert_eq!(err.as_label(), "spawn_unknown_user");
    }

    #[tokio::test]
    async fn working_directory_applies() {
        let (logger, tagged, read) = capture().await;
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell_spec("pwd");
        spec.directory = Some(dir.path().to_path_buf());
        let (mut child, pumps) = spawn(&spec, &tagged).unwrap();

        child.wait().await.unwrap();
        pumps.join().await;

        let out = output(logger, tagged, read).await;
        let canonical = dir.path().canonicalize().unwrap();
        assert!(
            out.contains(canonical.to_str().unwrap()),
            "got: {out}"
        );
    }

    #[tokio::test]
    async fn terminate_reaches_the_process_group() {
        let (_logger, tagged, _read) = capture().await;
        let (mut child, pumps) = spawn(&shell_spec("sleep 30"), &tagged).unwrap();

        child.terminate();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        pumps.join().await;
    }
}
