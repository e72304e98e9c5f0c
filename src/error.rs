//! # Error types used by the encab runtime.
//!
//! This module defines the error enums shared across the crate:
//!
//! - [`ConfigError`] errors raised while loading, parsing, or normalizing the
//!   configuration file.
//! - [`ExtensionError`] errors raised by extension hooks.
//! - [`SpawnError`] errors raised while preparing or executing a child program,
//!   before it ever reaches the running state.
//!
//! All types provide `as_label` helpers for stable log output.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No configuration file was found in any of the default locations.
    #[error("config file not found in {candidates}")]
    NotFound {
        /// Comma separated list of candidate paths that were probed.
        candidates: String,
    },
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The configuration file is not valid YAML or does not match the schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A program declares both `command` and `sh`.
    #[error("program '{program}': specify either sh or command, not both")]
    CommandAndSh { program: String },
    /// A program declares neither `command` nor `sh` and is not the CLI-driven main.
    #[error("program '{program}': neither sh nor command is set")]
    NoCommand { program: String },
    /// The `programs` section is non-empty but contains no `main` entry.
    #[error(
        "no main program to run; \
         define programs.main in the config file or pass a command on startup"
    )]
    NoMain,
    /// An unparseable umask value.
    #[error("expected octal string for umask but got: {value}")]
    BadUmask { value: String },
    /// An unsupported log level name.
    #[error("unsupported log level {value}; supported levels are: {supported}")]
    BadLogLevel { value: String, supported: String },
    /// A malformed command string (unbalanced quotes).
    #[error("program '{program}': unbalanced quote in command: {command}")]
    BadCommand { program: String, command: String },
    /// A negative duration field.
    #[error("expected {field} >= 0 but got {value}")]
    NegativeDuration { field: &'static str, value: f64 },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::NotFound { .. } => "config_not_found",
            ConfigError::Io { .. } => "config_io",
            ConfigError::Parse(_) => "config_parse",
            ConfigError::CommandAndSh { .. } => "config_command_and_sh",
            ConfigError::NoCommand { .. } => "config_no_command",
            ConfigError::NoMain => "config_no_main",
            ConfigError::BadUmask { .. } => "config_bad_umask",
            ConfigError::BadLogLevel { .. } => "config_bad_log_level",
            ConfigError::BadCommand { .. } => "config_bad_command",
            ConfigError::NegativeDuration { .. } => "config_negative_duration",
        }
    }
}

/// Errors raised by extension hooks.
///
/// The supervisor converts these into either startup aborts (extension was
/// enabled explicitly) or warnings (extension was enabled by default).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExtensionError {
    /// The extension settings do not match the extension's schema.
    #[error("{extension}: invalid settings: {message}")]
    Settings {
        extension: &'static str,
        message: String,
    },
    /// A hook failed while doing its work (I/O, child process, ...).
    #[error("{extension}: {message}")]
    Hook {
        extension: &'static str,
        message: String,
    },
    /// A declared environment variable failed validation.
    #[error("validation for variable {variable} failed: {message}")]
    Validation { variable: String, message: String },
}

impl ExtensionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ExtensionError::Settings { .. } => "extension_settings",
            ExtensionError::Hook { .. } => "extension_hook",
            ExtensionError::Validation { .. } => "extension_validation",
        }
    }

    /// Name of the extension the error belongs to, if attributable.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ExtensionError::Settings { extension, .. } | ExtensionError::Hook { extension, .. } => {
                Some(extension)
            }
            ExtensionError::Validation { .. } => None,
        }
    }
}

/// Errors raised while preparing or executing a child program.
///
/// Any of these leave the program in the `Failed` state without it ever
/// having entered `Running`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The configured user is unknown on this system.
    #[error("unknown user {user}")]
    UnknownUser { user: String },
    /// The configured group is unknown on this system.
    #[error("unknown group {group}")]
    UnknownGroup { group: String },
    /// Encab must run as root to switch users.
    #[error("encab has to run as root to run programs as a different user")]
    NotRoot,
    /// The exec itself failed (missing binary, bad directory, permissions).
    #[error("failed to execute {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::UnknownUser { .. } => "spawn_unknown_user",
            SpawnError::UnknownGroup { .. } => "spawn_unknown_group",
            SpawnError::NotRoot => "spawn_not_root",
            SpawnError::Exec { .. } => "spawn_exec",
        }
    }
}
