//! # Variable validation: declared constraints on the environment.
//!
//! Validates environment variables before any program spawns, injects
//! defaults for missing ones, and aborts startup when a required variable is
//! absent or a constraint is violated.
//!
//! ```yaml
//! extensions:
//!   validation:
//!     settings:
//!       include: validation.yml
//!       variables:
//!         X:
//!           required: true
//!           default: "1"
//!           min_length: 1
//!           max_length: 5
//!           regex: "0|1"
//!         Y:
//!           min_value: 0
//!           max_value: 10
//!           program: main
//! ```
//!
//! Constraints: `required` (default true), `format` (`string`/`int`/`float`),
//! `default`, `min_length`/`max_length`, `min_value`/`max_value`, `regex`
//! (matched from the start of the value), scoped by `program` or `programs`.

use std::path::PathBuf;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use super::Extension;
use crate::environment::Environments;
use crate::error::ExtensionError;
use crate::logging::ProgramLogger;

pub const VALIDATION: &str = "validation";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct VarSpec {
    required: Option<bool>,
    format: Option<String>,
    default: Option<serde_yaml::Value>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    regex: Option<String>,
    program: Option<String>,
    programs: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    #[serde(default)]
    variables: IndexMap<String, VarSpec>,
    /// Additional variable specs loaded from a YAML file.
    include: Option<PathBuf>,
}

impl Settings {
    fn parse(settings: Option<&serde_yaml::Value>) -> Result<Self, ExtensionError> {
        match settings {
            None => Ok(Self::default()),
            Some(value) => {
                serde_yaml::from_value(value.clone()).map_err(|err| ExtensionError::Settings {
                    extension: VALIDATION,
                    message: err.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    String,
    Int,
    Float,
}

/// Compiled constraint set for one variable.
struct Rule {
    required: bool,
    format: Format,
    default: Option<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    regex: Option<Regex>,
    /// Empty means: applies to every program.
    programs: Vec<String>,
}

impl Rule {
    fn applies_to(&self, program: &str) -> bool {
        self.programs.is_empty() || self.programs.iter().any(|p| p == program)
    }

    fn check(&self, name: &str, value: &str) -> Result<(), ExtensionError> {
        match self.format {
            Format::String => {}
            Format::Int => {
                if value.parse::<i64>().is_err() {
                    return Err(violation(name, format!("Expected integer format but was '{value}'")));
                }
            }
            Format::Float => {
                if value.parse::<f64>().is_err() {
                    return Err(violation(name, format!("Expected float format but was '{value}'")));
                }
            }
        }

        if self.min_value.is_some() || self.max_value.is_some() {
            let number: f64 = value.parse().map_err(|_| {
                violation(
                    name,
                    format!(
                        "Expected to be float (as min_value and/or max_value was given) \
                         but was '{value}'"
                    ),
                )
            })?;
            if let Some(min) = self.min_value {
                if number < min {
                    return Err(violation(name, format!("Expected {name} >= {min} but was {number}")));
                }
            }
            if let Some(max) = self.max_value {
                if number > max {
                    return Err(violation(name, format!("Expected {name} <= {max} but was {number}")));
                }
            }
        }

        if let Some(min) = self.min_length {
            if value.len() < min {
                return Err(violation(
                    name,
                    format!("Expected length >= {min} but was {}", value.len()),
                ));
            }
        }
        if let Some(max) = self.max_length {
            if value.len() > max {
                return Err(violation(
                    name,
                    format!("Expected length <= {max} but was {}", value.len()),
                ));
            }
        }

        if let Some(regex) = &self.regex {
            if !regex.is_match(value) {
                return Err(violation(name, format!("Expected to match '{}'", regex.as_str())));
            }
        }
        Ok(())
    }
}

fn violation(variable: &str, message: String) -> ExtensionError {
    ExtensionError::Validation {
        variable: variable.to_string(),
        message,
    }
}

fn settings_error(message: impl Into<String>) -> ExtensionError {
    ExtensionError::Settings {
        extension: VALIDATION,
        message: message.into(),
    }
}

fn compile(name: &str, spec: &VarSpec) -> Result<Rule, ExtensionError> {
    if !is_posix_name(name) {
        return Err(settings_error(format!(
            "Expected valid environment variable name (see POSIX 3.231 Name) but was '{name}'"
        )));
    }
    if spec.program.is_some() && spec.programs.is_some() {
        return Err(settings_error("Expected either 'program' or 'programs' but got both"));
    }
    let format = match spec.format.as_deref() {
        None | Some("string") => Format::String,
        Some("int") => Format::Int,
        Some("float") => Format::Float,
        Some(other) => {
            return Err(settings_error(format!(
                "Unsupported format '{other}'. Supported formats are: string, float, int"
            )))
        }
    };
    if let (Some(min), Some(max)) = (spec.min_length, spec.max_length) {
        if max < min {
            return Err(settings_error(format!(
                "Expected max_length >= min_length was {max} < {min}"
            )));
        }
    }
    if let (Some(min), Some(max)) = (spec.min_value, spec.max_value) {
        if max < min {
            return Err(settings_error(format!(
                "Expected max_value >= min_value was {max} < {min}"
            )));
        }
    }
    // The regex checks the value from its start, like an anchored prefix match.
    let regex = spec
        .regex
        .as_deref()
        .map(|r| Regex::new(&format!("^(?:{r})")))
        .transpose()
        .map_err(|err| settings_error(format!("Expected 'regex' to be a valid regex: {err}")))?;
    let default = spec.default.as_ref().map(scalar_to_string).transpose()?;
    let programs = match (&spec.program, &spec.programs) {
        (Some(program), None) => vec![program.clone()],
        (None, Some(programs)) => programs.clone(),
        _ => Vec::new(),
    };

    Ok(Rule {
        required: spec.required.unwrap_or(true),
        format,
        default,
        min_length: spec.min_length,
        max_length: spec.max_length,
        min_value: spec.min_value,
        max_value: spec.max_value,
        regex,
        programs,
    })
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String, ExtensionError> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(settings_error("Expected scalar default value")),
    }
}

fn is_posix_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates declared variables and injects defaults.
pub struct Validation {
    rules: IndexMap<String, Rule>,
    logger: Option<ProgramLogger>,
}

impl Validation {
    pub fn new() -> Self {
        Self {
            rules: IndexMap::new(),
            logger: None,
        }
    }

    fn build_rules(settings: &Settings) -> Result<IndexMap<String, Rule>, ExtensionError> {
        let mut rules = IndexMap::new();
        if let Some(path) = &settings.include {
            let text = std::fs::read_to_string(path).map_err(|err| {
                settings_error(format!("Failed to include {}: {err}", path.display()))
            })?;
            let included: IndexMap<String, VarSpec> = serde_yaml::from_str(&text)
                .map_err(|err| {
                    settings_error(format!("Failed to include {}: {err}", path.display()))
                })?;
            for (name, spec) in &included {
                rules.insert(name.clone(), compile(name, spec)?);
            }
        }
        for (name, spec) in &settings.variables {
            rules.insert(name.clone(), compile(name, spec)?);
        }
        Ok(rules)
    }

    async fn validate_program(
        &self,
        program: &str,
        envs: &mut Environments,
    ) -> Result<(), ExtensionError> {
        let effective = envs.effective(program);
        for (name, rule) in &self.rules {
            if !rule.applies_to(program) {
                continue;
            }
            match effective.get(name).filter(|v| !v.is_empty()) {
                Some(value) => {
                    if let Some(logger) = &self.logger {
                        logger
                            .debug(format!("Validating variable {name} for program {program}"))
                            .await;
                    }
                    rule.check(name, value)?;
                }
                None => {
                    if let Some(default) = &rule.default {
                        if let Some(logger) = &self.logger {
                            logger
                                .debug(format!(
                                    "Program {program}: setting default {name} = {default}"
                                ))
                                .await;
                        }
                        envs.set_program_var(program, name, default);
                    } else if rule.required {
                        return Err(violation(name, "Missing required parameter".to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extension for Validation {
    fn name(&self) -> &'static str {
        VALIDATION
    }

    fn validate(&mut self, settings: Option<&serde_yaml::Value>) -> Result<(), ExtensionError> {
        Self::build_rules(&Settings::parse(settings)?)?;
        Ok(())
    }

    fn configure(
        &mut self,
        settings: Option<&serde_yaml::Value>,
        logger: ProgramLogger,
    ) -> Result<(), ExtensionError> {
        self.rules = Self::build_rules(&Settings::parse(settings)?)?;
        self.logger = Some(logger);
        Ok(())
    }

    async fn update_environment(&mut self, envs: &mut Environments) -> Result<(), ExtensionError> {
        let programs: Vec<String> = envs.programs.keys().cloned().collect();
        for program in programs {
            self.validate_program(&program, envs).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Level, LogFormat, Logger};

    fn configured(yaml: &str) -> Validation {
        let logger = Logger::to_writer(LogFormat::default(), Box::new(tokio::io::sink()));
        let mut validation = Validation::new();
        let settings: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        validation
            .configure(Some(&settings), logger.for_program(VALIDATION, Level::Debug))
            .unwrap();
        validation
    }

    fn envs_with(base: &[(&str, &str)], programs: &[&str]) -> Environments {
        Environments {
            base: base
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            programs: programs
                .iter()
                .map(|p| (p.to_string(), IndexMap::new()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn missing_required_variable_fails() {
        let mut validation = configured("variables:\n  X:\n    required: true\n");
        let mut envs = envs_with(&[], &["main"]);
        let err = validation.update_environment(&mut envs).await.unwrap_err();
        assert_eq!(err.as_label(), "extension_validation");
    }

    #[tokio::test]
    async fn default_is_injected_when_missing() {
        let mut validation = configured("variables:\n  PORT:\n    default: 8080\n");
        let mut envs = envs_with(&[], &["main"]);
        validation.update_environment(&mut envs).await.unwrap();
        assert_eq!(
            envs.effective("main").get("PORT").map(String::as_str),
            Some("8080")
        );
    }

    #[tokio::test]
    async fn format_int_rejects_text() {
        let mut validation = configured("variables:\n  N:\n    format: int\n");
        let mut envs = envs_with(&[("N", "abc")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn range_constraints_apply() {
        let mut validation = configured(
            "variables:\n  N:\n    min_value: 0\n    max_value: 10\n",
        );
        let mut envs = envs_with(&[("N", "11")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_err());

        let mut envs = envs_with(&[("N", "5")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_ok());
    }

    #[tokio::test]
    async fn length_constraints_apply() {
        let mut validation = configured(
            "variables:\n  S:\n    min_length: 2\n    max_length: 3\n",
        );
        let mut envs = envs_with(&[("S", "abcd")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn regex_matches_from_start() {
        let mut validation = configured("variables:\n  V:\n    regex: \"0|1\"\n");
        let mut envs = envs_with(&[("V", "1suffix")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_ok());

        let mut envs = envs_with(&[("V", "x1")], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_err());
    }

    #[tokio::test]
    async fn scoped_rule_ignores_other_programs() {
        let mut validation = configured(
            "variables:\n  ONLY_WEB:\n    required: true\n    program: web\n",
        );
        let mut envs = envs_with(&[], &["main"]);
        assert!(validation.update_environment(&mut envs).await.is_ok());

        let mut envs = envs_with(&[], &["web"]);
        assert!(validation.update_environment(&mut envs).await.is_err());
    }

    #[test]
    fn program_and_programs_is_a_settings_error() {
        let settings: serde_yaml::Value = serde_yaml::from_str(
            "variables:\n  X:\n    program: a\n    programs: [b]\n",
        )
        .unwrap();
        let mut validation = Validation::new();
        assert!(validation.validate(Some(&settings)).is_err());
    }

    #[tokio::test]
    async fn include_merges_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation.yml");
        std::fs::write(&path, "FROM_FILE:\n  default: ok\n").unwrap();

        let validation = configured(&format!("include: {}", path.display()));
        assert!(validation.rules.contains_key("FROM_FILE"));
    }

    #[tokio::test]
    async fn empty_value_counts_as_missing() {
        let mut validation = configured("variables:\n  X:\n    default: fallback\n");
        let mut envs = envs_with(&[("X", "")], &["main"]);
        validation.update_environment(&mut envs).await.unwrap();
        assert_eq!(
            envs.effective("main").get("X").map(String::as_str),
            Some("fallback")
        );
    }

    #[test]
    fn bad_regex_is_a_settings_error() {
        let settings: serde_yaml::Value =
            serde_yaml::from_str("variables:\n  X:\n    regex: \"(\"\n").unwrap();
        let mut validation = Validation::new();
        assert!(validation.validate(Some(&settings)).is_err());
    }
}
