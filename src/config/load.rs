//! # Configuration discovery and loading.
//!
//! Resolution order:
//! 1. `ENCAB_CONFIG` environment variable (a path)
//! 2. `./encab.yml`, `./encab.yaml`, `/etc/encab.yml`, `/etc/encab.yaml`,
//!    first existing file wins
//!
//! `ENCAB_DRY_RUN` (`0`/`1`) overrides `encab.dry_run` after parsing.

use std::path::{Path, PathBuf};

use super::model::Config;
use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const ENV_CONFIG: &str = "ENCAB_CONFIG";

/// Environment variable overriding `encab.dry_run`.
pub const ENV_DRY_RUN: &str = "ENCAB_DRY_RUN";

const CANDIDATES: [&str; 4] = [
    "./encab.yml",
    "./encab.yaml",
    "/etc/encab.yml",
    "/etc/encab.yaml",
];

/// Parses and normalizes a configuration from YAML text.
pub fn from_str(yaml: &str) -> Result<Config, ConfigError> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    config.normalize()?;
    apply_dry_run_override(&mut config);
    Ok(config)
}

/// Locates, parses and normalizes the configuration file.
///
/// Returns the config together with a human-readable description of where it
/// came from, logged once at startup.
pub fn load() -> Result<(Config, String), ConfigError> {
    let (path, source) = match std::env::var(ENV_CONFIG) {
        Ok(path) if !path.is_empty() => {
            (PathBuf::from(path), format!("environment {ENV_CONFIG}"))
        }
        _ => {
            let found = CANDIDATES.iter().find(|c| Path::new(c).exists());
            match found {
                Some(c) => (PathBuf::from(c), "default location".to_string()),
                None => {
                    return Err(ConfigError::NotFound {
                        candidates: CANDIDATES.join(", "),
                    })
                }
            }
        }
    };

    let yaml = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config = from_str(&yaml)?;
    Ok((config, format!("file {}, source: {source}", path.display())))
}

fn apply_dry_run_override(config: &mut Config) {
    if let Ok(value) = std::env::var(ENV_DRY_RUN) {
        match value.as_str() {
            "1" => config.encab.dry_run = Some(true),
            "0" => config.encab.dry_run = Some(false),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let config = from_str("programs:\n  main:\n    command: /bin/true\n").unwrap();
        assert_eq!(config.programs.len(), 1);
    }

    #[test]
    fn empty_document_is_valid() {
        let config = from_str("{}").unwrap();
        assert!(config.programs.is_empty());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        assert!(from_str("prorgams:\n  main:\n    command: /bin/true\n").is_err());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = from_str("programs: [unclosed").unwrap_err();
        assert_eq!(err.as_label(), "config_parse");
    }
}
