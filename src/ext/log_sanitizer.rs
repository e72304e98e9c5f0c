//! # Log sanitizer: masks secrets in the output stream.
//!
//! Watches the environment for variables whose names match a pattern set
//! (fnmatch-style, case-insensitive) and installs their values as masks in
//! the logger. Every occurrence of a sensitive value in any record is
//! replaced with `******` before it reaches the output writer.
//!
//! ```yaml
//! extensions:
//!   log_sanitizer:
//!     settings:
//!       override: false
//!       patterns:
//!         - "*MAGIC*"
//! ```

use glob::Pattern;
use serde::Deserialize;

use super::Extension;
use crate::environment::Environments;
use crate::error::ExtensionError;
use crate::logging::ProgramLogger;

pub const LOG_SANITIZER: &str = "log_sanitizer";

/// Variable-name patterns treated as sensitive out of the box.
const BUILTIN_PATTERNS: [&str; 4] = ["*KEY*", "*SECRET*", "*PASSWORD*", "*PWD*"];

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    /// Additional sensitive variable name patterns (fnmatch rules).
    #[serde(default)]
    patterns: Vec<String>,
    /// If true, the built-in patterns are replaced instead of extended.
    #[serde(default, rename = "override")]
    replace_builtins: bool,
}

impl Settings {
    fn parse(settings: Option<&serde_yaml::Value>) -> Result<Self, ExtensionError> {
        match settings {
            None => Ok(Self::default()),
            Some(value) => {
                serde_yaml::from_value(value.clone()).map_err(|err| ExtensionError::Settings {
                    extension: LOG_SANITIZER,
                    message: err.to_string(),
                })
            }
        }
    }

    fn compile(&self) -> Result<Vec<Pattern>, ExtensionError> {
        let mut names: Vec<&str> = self.patterns.iter().map(String::as_str).collect();
        if !self.replace_builtins {
            names.extend(BUILTIN_PATTERNS);
        }
        names
            .into_iter()
            .map(|name| {
                Pattern::new(&name.to_uppercase()).map_err(|err| ExtensionError::Settings {
                    extension: LOG_SANITIZER,
                    message: format!("invalid pattern '{name}': {err}"),
                })
            })
            .collect()
    }
}

/// Masks values of sensitive environment variables in every log record.
pub struct LogSanitizer {
    patterns: Vec<Pattern>,
    logger: Option<ProgramLogger>,
}

impl LogSanitizer {
    pub fn new() -> Self {
        Self {
            patterns: Settings::default().compile().unwrap_or_default(),
            logger: None,
        }
    }

    fn is_sensitive(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.patterns.iter().any(|p| p.matches(&upper))
    }

    fn collect_values(&self, envs: &Environments) -> Vec<String> {
        let mut values = Vec::new();
        for (name, value) in &envs.base {
            if self.is_sensitive(name) {
                values.push(value.clone());
            }
        }
        for overlay in envs.programs.values() {
            for (name, value) in overlay {
                if let Some(value) = value {
                    if self.is_sensitive(name) {
                        values.push(value.clone());
                    }
                }
            }
        }
        values.sort();
        values.dedup();
        values
    }
}

impl Default for LogSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extension for LogSanitizer {
    fn name(&self) -> &'static str {
        LOG_SANITIZER
    }

    fn validate(&mut self, settings: Option<&serde_yaml::Value>) -> Result<(), ExtensionError> {
        Settings::parse(settings)?.compile()?;
        Ok(())
    }

    fn configure(
        &mut self,
        settings: Option<&serde_yaml::Value>,
        logger: ProgramLogger,
    ) -> Result<(), ExtensionError> {
        self.patterns = Settings::parse(settings)?.compile()?;
        self.logger = Some(logger);
        Ok(())
    }

    async fn update_environment(&mut self, envs: &mut Environments) -> Result<(), ExtensionError> {
        let values = self.collect_values(envs);
        if let Some(logger) = &self.logger {
            logger
                .debug(format!(
                    "masking the values of {} sensitive variable(s)",
                    values.len()
                ))
                .await;
            logger.sink().set_masks(values).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn envs(pairs: &[(&str, &str)]) -> Environments {
        Environments {
            base: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            programs: IndexMap::new(),
        }
    }

    #[test]
    fn builtin_patterns_match_case_insensitively() {
        let sanitizer = LogSanitizer::new();
        assert!(sanitizer.is_sensitive("MY_PASSWORD"));
        assert!(sanitizer.is_sensitive("api_key"));
        assert!(sanitizer.is_sensitive("Db_Secret_Value"));
        assert!(sanitizer.is_sensitive("PGPWD"));
        assert!(!sanitizer.is_sensitive("HOME"));
    }

    #[test]
    fn collects_sensitive_values_from_all_layers() {
        let sanitizer = LogSanitizer::new();
        let mut envs = envs(&[("MY_PASSWORD", "s3cR37"), ("PATH", "/bin")]);
        envs.programs.insert(
            "main".to_string(),
            [("API_KEY".to_string(), Some("abc".to_string()))]
                .into_iter()
                .collect(),
        );
        let values = sanitizer.collect_values(&envs);
        assert_eq!(values, vec!["abc".to_string(), "s3cR37".to_string()]);
    }

    #[test]
    fn override_drops_builtins() {
        let settings: serde_yaml::Value = serde_yaml::from_str(
            r#"
override: true
patterns: ["*MAGIC*"]
"#,
        )
        .unwrap();
        let patterns = Settings::parse(Some(&settings)).unwrap().compile().unwrap();
        let sanitizer = LogSanitizer {
            patterns,
            logger: None,
        };
        assert!(sanitizer.is_sensitive("THE_MAGIC_WORD"));
        assert!(!sanitizer.is_sensitive("MY_PASSWORD"));
    }

    #[test]
    fn bad_pattern_is_a_settings_error() {
        let settings: serde_yaml::Value =
            serde_yaml::from_str(r#"patterns: ["[unclosed"]"#).unwrap();
        let mut sanitizer = LogSanitizer::new();
        assert!(sanitizer.validate(Some(&settings)).is_err());
    }
}
