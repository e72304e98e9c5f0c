//! # Configuration schema.
//!
//! Serde model for the encab YAML document plus normalization. Program order
//! matters (helpers start in declared order, stop in reverse), so maps are
//! [`IndexMap`]s that preserve the document order.
//!
//! ## Rules
//! - A program is `command`-style or `sh`-style, never both
//! - `main` is the only program that may omit both (its argv then comes from
//!   the command line)
//! - Unset common fields on a program inherit from the `encab` section
//! - [`Config::normalize`] is idempotent

use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use super::argv::split_command;
use crate::error::ConfigError;
use crate::logging::{format, Level};

/// Reserved name of the primary program.
pub const MAIN_PROGRAM: &str = "main";

/// Environment overlay: `None` values remove the variable.
pub type EnvOverlay = IndexMap<String, Option<String>>;

/// A YAML value that is either one string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// A user or group given as numeric id or as a name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NameOrId {
    Id(u32),
    Name(String),
}

impl NameOrId {
    /// Turns numeric strings into ids; leaves real names alone.
    fn normalize(&mut self) {
        if let NameOrId::Name(name) = self {
            if let Ok(id) = name.parse::<u32>() {
                *self = NameOrId::Id(id);
            }
        }
    }
}

/// A umask given as integer or octal string (`"077"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Octal {
    Int(u32),
    Str(String),
}

impl Octal {
    fn normalize(&mut self) -> Result<(), ConfigError> {
        if let Octal::Str(s) = self {
            let parsed =
                u32::from_str_radix(s, 8).map_err(|_| ConfigError::BadUmask { value: s.clone() })?;
            *self = Octal::Int(parsed);
        }
        Ok(())
    }

    /// Numeric value; only valid after normalization.
    pub fn value(&self) -> u32 {
        match self {
            Octal::Int(v) => *v,
            Octal::Str(_) => 0,
        }
    }
}

/// Global encab settings; the common fields double as per-program defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncabConfig {
    /// If true, encab parks instead of shutting helpers down when main exits.
    #[serde(default)]
    pub halt_on_exit: bool,
    /// Output record format; see [`crate::logging::LogFormat`].
    pub logformat: Option<String>,
    /// Validate everything but spawn nothing.
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub environment: EnvOverlay,
    pub debug: Option<bool>,
    pub loglevel: Option<String>,
    pub umask: Option<Octal>,
    pub user: Option<NameOrId>,
    pub group: Option<NameOrId>,
    pub join_time: Option<f64>,
}

impl EncabConfig {
    /// Effective level for the supervisor's own records.
    pub fn effective_loglevel(&self) -> Level {
        effective_level(self.debug, self.loglevel.as_deref())
    }

    /// Effective `logformat`, falling back to the (debug) default.
    pub fn effective_logformat(&self) -> &str {
        match &self.logformat {
            Some(f) => f,
            None if self.debug.unwrap_or(false) => format::DEBUG_FORMAT,
            None => format::DEFAULT_FORMAT,
        }
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        if let Some(umask) = &mut self.umask {
            umask.normalize()?;
        }
        if let Some(user) = &mut self.user {
            user.normalize();
        }
        if let Some(group) = &mut self.group {
            group.normalize();
        }
        if let Some(level) = &self.loglevel {
            level.parse::<Level>()?;
        }
        check_duration("join_time", self.join_time)?;
        Ok(())
    }
}

/// One supervised program.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    /// Argv tokens, or one string split POSIX-style.
    pub command: Option<OneOrMany>,
    /// Shell snippets; a list is joined with `"; "` and run under `sh -c`.
    pub sh: Option<OneOrMany>,
    #[serde(default)]
    pub environment: EnvOverlay,
    pub user: Option<NameOrId>,
    pub group: Option<NameOrId>,
    pub umask: Option<Octal>,
    /// Working directory; unset inherits the supervisor's.
    pub directory: Option<PathBuf>,
    /// Seconds to sleep before the program is spawned.
    #[serde(default)]
    pub startup_delay: f64,
    /// Seconds the supervisor waits for lifecycle transitions.
    pub join_time: Option<f64>,
    /// If set, the program is restarted this many seconds after it exits.
    pub restart_delay: Option<f64>,
    pub loglevel: Option<String>,
    /// Reap orphaned descendants; meaningful for `main` under PID 1.
    #[serde(default)]
    pub reap_zombies: bool,
    pub debug: Option<bool>,
}

impl ProgramConfig {
    /// Builds the config used when `main` exists only as CLI argv.
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            command: Some(OneOrMany::Many(argv)),
            ..Self::default()
        }
    }

    pub fn effective_loglevel(&self) -> Level {
        effective_level(self.debug, self.loglevel.as_deref())
    }

    pub fn join_time(&self) -> Duration {
        Duration::from_secs_f64(self.join_time.unwrap_or(1.0))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay)
    }

    pub fn restart_delay(&self) -> Option<Duration> {
        self.restart_delay.map(Duration::from_secs_f64)
    }

    /// Fills unset common fields from the `encab` section.
    fn inherit(&mut self, defaults: &EncabConfig) {
        if self.debug.is_none() {
            self.debug = defaults.debug;
        }
        if self.loglevel.is_none() {
            self.loglevel = defaults.loglevel.clone();
        }
        if self.umask.is_none() {
            self.umask = defaults.umask.clone();
        }
        if self.user.is_none() {
            self.user = defaults.user.clone();
        }
        if self.group.is_none() {
            self.group = defaults.group.clone();
        }
        if self.join_time.is_none() {
            self.join_time = defaults.join_time;
        }
    }

    fn normalize(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.command.is_some() && self.sh.is_some() {
            return Err(ConfigError::CommandAndSh {
                program: name.to_string(),
            });
        }
        self.command = match self.command.take() {
            Some(OneOrMany::One(cmd)) => {
                let argv = split_command(&cmd).ok_or_else(|| ConfigError::BadCommand {
                    program: name.to_string(),
                    command: cmd.clone(),
                })?;
                Some(OneOrMany::Many(argv))
            }
            other => other,
        };
        self.sh = match self.sh.take() {
            Some(OneOrMany::Many(snippets)) => Some(OneOrMany::One(snippets.join("; "))),
            other => other,
        };
        if let Some(umask) = &mut self.umask {
            umask.normalize()?;
        }
        if let Some(user) = &mut self.user {
            user.normalize();
        }
        if let Some(group) = &mut self.group {
            group.normalize();
        }
        if let Some(level) = &self.loglevel {
            level.parse::<Level>()?;
        }
        check_duration("startup_delay", Some(self.startup_delay))?;
        check_duration("join_time", self.join_time)?;
        check_duration("restart_delay", self.restart_delay)?;
        Ok(())
    }
}

/// Per-extension switch and settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Explicit enable/disable; unset keeps the extension's default.
    pub enabled: Option<bool>,
    /// External module identifier (reserved; built-ins resolve by name).
    pub module: Option<String>,
    /// Opaque settings passed to the extension.
    pub settings: Option<serde_yaml::Value>,
}

/// The complete configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub encab: EncabConfig,
    #[serde(default)]
    pub extensions: IndexMap<String, ExtensionConfig>,
    #[serde(default)]
    pub programs: IndexMap<String, ProgramConfig>,
}

impl Config {
    /// Validates field values, applies defaults inheritance and canonicalizes
    /// string forms. Idempotent.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.encab.normalize()?;
        let defaults = self.encab.clone();
        for (name, program) in &mut self.programs {
            program.inherit(&defaults);
            program.normalize(name)?;
        }
        Ok(())
    }

    /// Applies the CLI argv override and checks that a main program exists.
    ///
    /// Positional CLI arguments replace `main`'s command; if no `main` is
    /// configured at all they define it. Must run after [`Config::normalize`].
    pub fn resolve_main(&mut self, args: &[String]) -> Result<(), ConfigError> {
        if !args.is_empty() {
            match self.programs.get_mut(MAIN_PROGRAM) {
                Some(main) => {
                    main.command = Some(OneOrMany::Many(args.to_vec()));
                    main.sh = None;
                }
                None => {
                    let mut main = ProgramConfig::from_argv(args.to_vec());
                    main.inherit(&self.encab);
                    self.programs.insert(MAIN_PROGRAM.to_string(), main);
                }
            }
        }

        if !self.programs.contains_key(MAIN_PROGRAM) {
            return Err(ConfigError::NoMain);
        }
        for (name, program) in &self.programs {
            if program.command.is_none() && program.sh.is_none() {
                return Err(ConfigError::NoCommand {
                    program: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// True when any program asks for zombie reaping.
    pub fn wants_reaping(&self) -> bool {
        self.programs.values().any(|p| p.reap_zombies)
    }
}

fn effective_level(debug: Option<bool>, loglevel: Option<&str>) -> Level {
    if debug.unwrap_or(false) {
        return Level::Debug;
    }
    loglevel
        .and_then(|l| l.parse().ok())
        .unwrap_or(Level::Info)
}

fn check_duration(field: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(ConfigError::NegativeDuration { field, value: v })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(yaml).expect("yaml");
        config.normalize().expect("normalize");
        config
    }

    #[test]
    fn command_string_is_split() {
        let config = parse(
            r#"
programs:
  main:
    command: echo "Hello Encab!"
"#,
        );
        assert_eq!(
            config.programs["main"].command,
            Some(OneOrMany::Many(vec![
                "echo".to_string(),
                "Hello Encab!".to_string()
            ]))
        );
    }

    #[test]
    fn sh_list_is_joined() {
        let config = parse(
            r#"
programs:
  main:
    sh:
      - echo one
      - echo two
"#,
        );
        assert_eq!(
            config.programs["main"].sh,
            Some(OneOrMany::One("echo one; echo two".to_string()))
        );
    }

    #[test]
    fn command_and_sh_is_rejected() {
        let mut config: Config = serde_yaml::from_str(
            r#"
programs:
  main:
    command: /bin/true
    sh: echo hi
"#,
        )
        .unwrap();
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::CommandAndSh { .. })
        ));
    }

    #[test]
    fn octal_umask_string_is_parsed() {
        let config = parse(
            r#"
programs:
  main:
    command: /bin/true
    umask: "077"
"#,
        );
        assert_eq!(config.programs["main"].umask, Some(Octal::Int(0o077)));
    }

    #[test]
    fn bad_umask_is_rejected() {
        let mut config: Config = serde_yaml::from_str(
            r#"
programs:
  main:
    command: /bin/true
    umask: "woops"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::BadUmask { .. })
        ));
    }

    #[test]
    fn numeric_user_string_becomes_id() {
        let config = parse(
            r#"
programs:
  main:
    command: /bin/true
    user: "1000"
"#,
        );
        assert_eq!(config.programs["main"].user, Some(NameOrId::Id(1000)));
    }

    #[test]
    fn programs_inherit_encab_defaults() {
        let config = parse(
            r#"
encab:
  debug: true
  join_time: 3.0
programs:
  main:
    command: /bin/true
  helper:
    command: sleep 1
    join_time: 0.5
"#,
        );
        assert_eq!(config.programs["main"].effective_loglevel(), Level::Debug);
        assert_eq!(
            config.programs["main"].join_time(),
            Duration::from_secs_f64(3.0)
        );
        assert_eq!(
            config.programs["helper"].join_time(),
            Duration::from_secs_f64(0.5)
        );
    }

    #[test]
    fn debug_beats_loglevel() {
        let config = parse(
            r#"
programs:
  main:
    command: /bin/true
    loglevel: ERROR
    debug: true
"#,
        );
        assert_eq!(config.programs["main"].effective_loglevel(), Level::Debug);
    }

    #[test]
    fn declaration_order_is_preserved() {
        let config = parse(
            r#"
programs:
  zeta:
    command: /bin/true
  alpha:
    command: /bin/true
  main:
    command: /bin/true
"#,
        );
        let names: Vec<&str> = config.programs.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha", "main"]);
    }

    #[test]
    fn normalize_is_idempotent() {
        let yaml = r#"
encab:
  umask: "022"
  loglevel: WARN
programs:
  helper:
    command: sleep "0.2"
    user: "42"
  main:
    sh:
      - echo a
      - echo b
"#;
        let mut once: Config = serde_yaml::from_str(yaml).unwrap();
        once.normalize().unwrap();
        let mut twice = once.clone();
        twice.normalize().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn cli_args_override_main_command() {
        let mut config = parse(
            r#"
programs:
  main:
    command: echo "original"
"#,
        );
        config
            .resolve_main(&["echo".to_string(), "override".to_string()])
            .unwrap();
        assert_eq!(
            config.programs["main"].command,
            Some(OneOrMany::Many(vec![
                "echo".to_string(),
                "override".to_string()
            ]))
        );
    }

    #[test]
    fn cli_args_create_missing_main() {
        let mut config = parse(
            r#"
programs:
  helper:
    command: sleep 1
"#,
        );
        config.resolve_main(&["/bin/true".to_string()]).unwrap();
        assert!(config.programs.contains_key(MAIN_PROGRAM));
    }

    #[test]
    fn missing_main_is_rejected() {
        let mut config = parse(
            r#"
programs:
  helper:
    command: sleep 1
"#,
        );
        assert!(matches!(config.resolve_main(&[]), Err(ConfigError::NoMain)));
    }

    #[test]
    fn program_without_command_is_rejected() {
        let mut config = parse(
            r#"
programs:
  helper: {}
  main:
    command: /bin/true
"#,
        );
        assert!(matches!(
            config.resolve_main(&[]),
            Err(ConfigError::NoCommand { .. })
        ));
    }

    #[test]
    fn negative_startup_delay_is_rejected() {
        let mut config: Config = serde_yaml::from_str(
            r#"
programs:
  main:
    command: /bin/true
    startup_delay: -1
"#,
        )
        .unwrap();
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::NegativeDuration { .. })
        ));
    }

    #[test]
    fn wants_reaping_checks_all_programs() {
        let config = parse(
            r#"
programs:
  main:
    command: /bin/true
    reap_zombies: true
"#,
        );
        assert!(config.wants_reaping());
    }
}
