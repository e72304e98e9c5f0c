//! # Startup script: prepares the environment before any program runs.
//!
//! Three phases, each optional, each inheriting what the previous one built:
//!
//! 1. `loadenv`: load variables from a dotenv-format file
//! 2. `buildenv`: run shell snippets and parse their stdout as further
//!    dotenv lines
//! 3. `sh`: run shell snippets for their side effects only
//!
//! ```yaml
//! extensions:
//!   startup_script:
//!     settings:
//!       loadenv: .env
//!       buildenv:
//!         - echo "X=1"
//!       sh:
//!         - echo $X
//! ```
//!
//! The whole sequence runs exactly once, during `update_environment`, against
//! the shared base environment.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::Extension;
use crate::config::OneOrMany;
use crate::environment::{EnvMap, Environments};
use crate::error::ExtensionError;
use crate::logging::ProgramLogger;

pub const STARTUP_SCRIPT: &str = "startup_script";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    /// Dotenv-format file to load variables from.
    loadenv: Option<PathBuf>,
    /// Shell snippets whose stdout is parsed as dotenv lines.
    buildenv: Option<OneOrMany>,
    /// Shell snippets run for side effects only.
    sh: Option<OneOrMany>,
}

impl Settings {
    fn parse(settings: Option<&serde_yaml::Value>) -> Result<Self, ExtensionError> {
        match settings {
            None => Ok(Self::default()),
            Some(value) => {
                serde_yaml::from_value(value.clone()).map_err(|err| ExtensionError::Settings {
                    extension: STARTUP_SCRIPT,
                    message: err.to_string(),
                })
            }
        }
    }
}

fn join_snippets(snippets: &OneOrMany) -> String {
    match snippets {
        OneOrMany::One(script) => script.clone(),
        OneOrMany::Many(scripts) => scripts.join("; "),
    }
}

/// Runs configured scripts and environment loading before program start.
pub struct StartupScript {
    settings: Settings,
    logger: Option<ProgramLogger>,
    executed: bool,
}

impl StartupScript {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            logger: None,
            executed: false,
        }
    }

    async fn loadenv(&self, env: &mut EnvMap) -> Result<(), ExtensionError> {
        let Some(path) = &self.settings.loadenv else {
            return Ok(());
        };
        if !path.is_file() {
            return Err(ExtensionError::Hook {
                extension: STARTUP_SCRIPT,
                message: format!("File {} defined by loadenv does not exist", path.display()),
            });
        }
        if let Some(logger) = &self.logger {
            logger
                .info(format!("Loading env file: {}", path.display()))
                .await;
        }
        let text = std::fs::read_to_string(path).map_err(|err| ExtensionError::Hook {
            extension: STARTUP_SCRIPT,
            message: format!("Failed to load environment from {}: {err}", path.display()),
        })?;
        apply_dotenv(&text, env)
    }

    async fn buildenv(&self, env: &mut EnvMap) -> Result<(), ExtensionError> {
        let Some(snippets) = &self.settings.buildenv else {
            return Ok(());
        };
        let script = join_snippets(snippets);
        if let Some(logger) = &self.logger {
            logger.info("Running buildenv script").await;
        }

        let output = run_shell(&script, env).await?;
        self.log_stderr("startup_script/buildenv", &output.stderr).await;
        if !output.status.success() {
            return Err(ExtensionError::Hook {
                extension: STARTUP_SCRIPT,
                message: format!(
                    "Buildenv script failed with exit code: {}",
                    output.status.code().unwrap_or(-1)
                ),
            });
        }
        apply_dotenv(&String::from_utf8_lossy(&output.stdout), env)
    }

    async fn sh(&self, env: &EnvMap) -> Result<(), ExtensionError> {
        let Some(snippets) = &self.settings.sh else {
            return Ok(());
        };
        let script = join_snippets(snippets);

        let output = run_shell(&script, env).await?;
        self.log_stdout("startup_script/sh", &output.stdout).await;
        self.log_stderr("startup_script/sh", &output.stderr).await;
        if !output.status.success() {
            return Err(ExtensionError::Hook {
                extension: STARTUP_SCRIPT,
                message: format!(
                    "Startup script failed with exit code: {}",
                    output.status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(())
    }

    async fn log_stdout(&self, tag: &str, bytes: &[u8]) {
        if let Some(logger) = &self.logger {
            let tagged = logger.with_name(tag);
            for line in String::from_utf8_lossy(bytes).lines() {
                tagged.info(line).await;
            }
        }
    }

    async fn log_stderr(&self, tag: &str, bytes: &[u8]) {
        if let Some(logger) = &self.logger {
            let tagged = logger.with_name(tag);
            for line in String::from_utf8_lossy(bytes).lines() {
                tagged.error(line).await;
            }
        }
    }
}

impl Default for StartupScript {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extension for StartupScript {
    fn name(&self) -> &'static str {
        STARTUP_SCRIPT
    }

    fn validate(&mut self, settings: Option<&serde_yaml::Value>) -> Result<(), ExtensionError> {
        Settings::parse(settings)?;
        Ok(())
    }

    fn configure(
        &mut self,
        settings: Option<&serde_yaml::Value>,
        logger: ProgramLogger,
    ) -> Result<(), ExtensionError> {
        self.settings = Settings::parse(settings)?;
        self.logger = Some(logger);
        Ok(())
    }

    async fn update_environment(&mut self, envs: &mut Environments) -> Result<(), ExtensionError> {
        if self.executed {
            return Ok(());
        }
        self.executed = true;

        self.loadenv(&mut envs.base).await?;
        self.buildenv(&mut envs.base).await?;
        self.sh(&envs.base).await
    }
}

async fn run_shell(script: &str, env: &EnvMap) -> Result<std::process::Output, ExtensionError> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| ExtensionError::Hook {
            extension: STARTUP_SCRIPT,
            message: format!("Failed to execute startup script: {err}"),
        })
}

/// Parses dotenv-format text onto an environment.
///
/// Comments and blank lines are skipped, values lose one layer of matching
/// quotes, and variable names must satisfy POSIX 3.231.
fn apply_dotenv(text: &str, env: &mut EnvMap) -> Result<(), ExtensionError> {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = trimmed.split_once('=') else {
            continue;
        };
        let name = key.trim();
        if !is_posix_name(name) {
            return Err(ExtensionError::Hook {
                extension: STARTUP_SCRIPT,
                message: format!(
                    "Expected valid environment variable name (see POSIX 3.231 Name) \
                     but was '{name}'"
                ),
            });
        }
        let value = unquote(raw.trim());
        env.insert(name.to_string(), value);
    }
    Ok(())
}

fn unquote(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

fn is_posix_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Level, LogFormat, Logger};
    use indexmap::IndexMap;

    fn envs() -> Environments {
        Environments {
            base: EnvMap::new(),
            programs: IndexMap::new(),
        }
    }

    fn configured(yaml: &str) -> StartupScript {
        let logger = Logger::to_writer(LogFormat::default(), Box::new(tokio::io::sink()));
        let mut script = StartupScript::new();
        let settings: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        script
            .configure(
                Some(&settings),
                logger.for_program(STARTUP_SCRIPT, Level::Debug),
            )
            .unwrap();
        script
    }

    #[test]
    fn dotenv_parsing_strips_quotes_and_comments() {
        let mut env = EnvMap::new();
        apply_dotenv(
            "# comment\nFOO=\"first line\"\nBAR=2\nQUOTED='single'\n\nmalformed\n",
            &mut env,
        )
        .unwrap();
        assert_eq!(env.get("FOO").map(String::as_str), Some("first line"));
        assert_eq!(env.get("BAR").map(String::as_str), Some("2"));
        assert_eq!(env.get("QUOTED").map(String::as_str), Some("single"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn dotenv_rejects_bad_names() {
        let mut env = EnvMap::new();
        assert!(apply_dotenv("2BAD=1\n", &mut env).is_err());
    }

    #[tokio::test]
    async fn loadenv_reads_file_into_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "FROM_FILE=hello\n").unwrap();

        let mut script = configured(&format!("loadenv: {}", path.display()));
        let mut envs = envs();
        script.update_environment(&mut envs).await.unwrap();
        assert_eq!(envs.base.get("FROM_FILE").map(String::as_str), Some("hello"));
    }

    #[tokio::test]
    async fn missing_loadenv_file_fails() {
        let mut script = configured("loadenv: /nonexistent/.env");
        let mut envs = envs();
        assert!(script.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn buildenv_captures_stdout_as_variables() {
        let mut script = configured(
            r#"
buildenv:
  - echo "X=1"
  - echo "Y=$X plus"
"#,
        );
        let mut envs = envs();
        script.update_environment(&mut envs).await.unwrap();
        assert_eq!(envs.base.get("X").map(String::as_str), Some("1"));
        // Snippets run in one shell, left to right.
        assert_eq!(envs.base.get("Y").map(String::as_str), Some("plus"));
    }

    #[tokio::test]
    async fn buildenv_failure_aborts() {
        let mut script = configured("buildenv: 'exit 3'");
        let mut envs = envs();
        assert!(script.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn sh_failure_aborts() {
        let mut script = configured("sh: 'exit 1'");
        let mut envs = envs();
        assert!(script.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn sh_sees_accumulated_environment() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let mut script = configured(&format!(
            r#"
buildenv:
  - echo "TARGET={}"
sh:
  - touch "$TARGET"
"#,
            marker.display()
        ));
        let mut envs = envs();
        script.update_environment(&mut envs).await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn runs_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let mut script = configured(&format!("sh: 'echo x >> {}'", counter.display()));
        let mut envs = envs();
        script.update_environment(&mut envs).await.unwrap();
        script.update_environment(&mut envs).await.unwrap();
        let content = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
