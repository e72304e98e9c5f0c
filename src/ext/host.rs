//! # Extension host: discovery, hook dispatch, failure policy.
//!
//! The host owns the built-in registry and walks it in declared order for
//! every hook. Hook panics are caught and reported like hook errors, so a
//! broken extension cannot take the supervisor down with it.

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Extension, LogCollector, LogSanitizer, StartupScript, Validation};
use crate::config::Config;
use crate::environment::{EnvMap, Environments};
use crate::error::ExtensionError;
use crate::logging::{Logger, ProgramLogger};

/// Capabilities handed to `extend` hooks for their background tasks.
pub struct ExtensionRuntime {
    /// Shared log sink.
    pub logger: Logger,
    /// Snapshot of the base environment after `update_environment`.
    pub env: EnvMap,
    /// Cancelled when the supervisor enters final teardown.
    pub token: CancellationToken,
}

struct Entry {
    extension: Box<dyn Extension>,
    enabled: bool,
    /// True when the config file says `enabled: true` in so many words.
    explicit: bool,
    settings: Option<serde_yaml::Value>,
}

/// Registry of extensions plus hook dispatch.
pub struct ExtensionHost {
    entries: Vec<Entry>,
}

impl ExtensionHost {
    /// Builds the registry and applies the config's enable switches.
    ///
    /// Returns the host and the names mentioned in the config that match no
    /// built-in (reported, then ignored).
    pub fn discover(config: &Config) -> (Self, Vec<String>) {
        let builtins: Vec<Box<dyn Extension>> = vec![
            Box::new(LogSanitizer::new()),
            Box::new(StartupScript::new()),
            Box::new(Validation::new()),
            Box::new(LogCollector::new()),
        ];

        let entries = builtins
            .into_iter()
            .map(|extension| {
                let section = config.extensions.get(extension.name());
                let explicit = section.and_then(|s| s.enabled) == Some(true);
                let enabled = section
                    .and_then(|s| s.enabled)
                    .unwrap_or_else(|| extension.enabled_by_default());
                let settings = section.and_then(|s| s.settings.clone());
                Entry {
                    extension,
                    enabled,
                    explicit,
                    settings,
                }
            })
            .collect::<Vec<_>>();

        let known: Vec<&str> = entries.iter().map(|e| e.extension.name()).collect();
        let unknown = config
            .extensions
            .keys()
            .filter(|name| !known.contains(&name.as_str()))
            .cloned()
            .collect();

        (Self { entries }, unknown)
    }

    /// Names of the currently enabled extensions, in declared order.
    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.extension.name())
            .collect()
    }

    /// Hook 1 for every enabled extension. With `dry_run` each successful
    /// validation logs a `settings are valid.` record under the extension's
    /// own tag.
    pub async fn validate_all(
        &mut self,
        elog: &ProgramLogger,
        dry_run: bool,
    ) -> Result<(), ExtensionError> {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            match entry.extension.validate(entry.settings.as_ref()) {
                Ok(()) => {
                    if dry_run {
                        elog.with_name(entry.extension.name())
                            .info("settings are valid.")
                            .await;
                    }
                }
                Err(err) => apply_policy(entry, err, elog).await?,
            }
        }
        Ok(())
    }

    /// Hook 2 for every enabled extension. Each one receives a logger tagged
    /// with its own name (extension records carry the extension as program).
    pub async fn configure_all(&mut self, elog: &ProgramLogger) -> Result<(), ExtensionError> {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            let tagged = elog.with_name(entry.extension.name());
            if let Err(err) = entry.extension.configure(entry.settings.as_ref(), tagged) {
                apply_policy(entry, err, elog).await?;
            }
        }
        Ok(())
    }

    /// Hook 3 for every enabled extension, panic-isolated.
    pub async fn update_environment(
        &mut self,
        envs: &mut Environments,
        elog: &ProgramLogger,
    ) -> Result<(), ExtensionError> {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            let name = entry.extension.name();
            let outcome = std::panic::AssertUnwindSafe(entry.extension.update_environment(envs))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => apply_policy(entry, err, elog).await?,
                Err(_) => {
                    let err = ExtensionError::Hook {
                        extension: name,
                        message: "update_environment panicked".to_string(),
                    };
                    apply_policy(entry, err, elog).await?;
                }
            }
        }
        Ok(())
    }

    /// Hook 4 for every enabled extension, panic-isolated.
    pub async fn update_config(
        &mut self,
        config: &mut Config,
        elog: &ProgramLogger,
    ) -> Result<(), ExtensionError> {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            let name = entry.extension.name();
            let outcome = std::panic::AssertUnwindSafe(entry.extension.update_config(config))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => apply_policy(entry, err, elog).await?,
                Err(_) => {
                    let err = ExtensionError::Hook {
                        extension: name,
                        message: "update_config panicked".to_string(),
                    };
                    apply_policy(entry, err, elog).await?;
                }
            }
        }
        Ok(())
    }

    /// Hook 5: collects background tasks from every enabled extension.
    pub fn extend(&mut self, runtime: &ExtensionRuntime) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        for entry in &mut self.entries {
            if entry.enabled {
                tasks.extend(entry.extension.extend(runtime));
            }
        }
        tasks
    }
}

/// Explicitly enabled extensions and validation failures abort startup;
/// default-enabled extensions degrade to disabled with a WARNING.
async fn apply_policy(
    entry: &mut Entry,
    err: ExtensionError,
    elog: &ProgramLogger,
) -> Result<(), ExtensionError> {
    if entry.explicit || matches!(err, ExtensionError::Validation { .. }) {
        return Err(err);
    }
    entry.enabled = false;
    elog.warning(format!(
        "Extension {} disabled: {err}",
        entry.extension.name()
    ))
    .await;
    Ok(())
}
