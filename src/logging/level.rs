//! # Log severities.
//!
//! Five levels, ordered. The config file accepts the aliases `FATAL` (for
//! CRITICAL) and `WARN` (for WARNING) the same way the original tooling did.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Severity of a [`LogRecord`](super::LogRecord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Canonical upper-case name as it appears in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// All names accepted in configuration files.
    pub fn supported() -> &'static str {
        "CRITICAL, FATAL, ERROR, WARN, WARNING, INFO, DEBUG"
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" | "FATAL" => Ok(Level::Critical),
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warning),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            _ => Err(ConfigError::BadLogLevel {
                value: s.to_string(),
                supported: Level::supported().to_string(),
            }),
        }
    }
}
