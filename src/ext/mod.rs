//! Extensions: optional modules hooked into the supervisor lifecycle.
//!
//! An extension implements [`Extension`] and is invoked at five points, each
//! optional:
//!
//! 1. `validate`: during config validation (and dry runs)
//! 2. `configure`: once, between validation and environment building
//! 3. `update_environment`: once before any child spawns; may mutate the
//!    shared base environment and per-program overlays
//! 4. `update_config`: last chance to mutate the effective configuration
//! 5. `extend`: registers long-running tasks started alongside helpers
//!
//! Built-ins are registered at build time in declared order; nothing in the
//! core binds to a dynamic module loader.
//!
//! ## Failure policy
//! A hook failure is reported against the extension. Explicitly enabled
//! extensions abort startup; default-enabled ones are disabled with a
//! WARNING. Variable-validation failures always abort: letting a program
//! start with a rejected environment is what the validation extension exists
//! to prevent.

mod host;
mod log_collector;
mod log_sanitizer;
mod startup_script;
mod validation;

pub use host::{ExtensionHost, ExtensionRuntime};
pub use log_collector::LogCollector;
pub use log_sanitizer::LogSanitizer;
pub use startup_script::StartupScript;
pub use validation::Validation;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::environment::Environments;
use crate::error::ExtensionError;
use crate::logging::ProgramLogger;

/// One pluggable extension. All hooks default to no-ops.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Stable extension name; also its key in the `extensions:` section.
    fn name(&self) -> &'static str;

    /// Whether the extension runs when the config does not mention it.
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// Validates the raw settings without taking effect.
    fn validate(&mut self, _settings: Option<&serde_yaml::Value>) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Applies settings and receives the extension's tagged logger.
    fn configure(
        &mut self,
        _settings: Option<&serde_yaml::Value>,
        _logger: ProgramLogger,
    ) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Mutates the layered environments before any child spawns.
    ///
    /// Must be deterministic given its inputs: re-running it with unchanged
    /// input is a no-op.
    async fn update_environment(&mut self, _envs: &mut Environments) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Mutates the effective configuration after environments are built.
    async fn update_config(&mut self, _config: &mut Config) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Registers background tasks that run alongside the helpers.
    fn extend(&mut self, _runtime: &ExtensionRuntime) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}
