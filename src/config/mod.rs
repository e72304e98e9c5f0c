//! Configuration: schema, loading, normalization.
//!
//! The YAML document has three top-level sections:
//!
//! ```yaml
//! encab:              # global settings and per-program defaults
//!   halt_on_exit: false
//! extensions:         # per-extension enable flags and settings
//!   log_sanitizer:
//!     enabled: true
//! programs:           # the processes to supervise; `main` is special
//!   cron:
//!     command: cron -f
//!   main:
//!     sh:
//!       - echo "Hello Encab!"
//! ```
//!
//! ## Contents
//! - [`Config`], [`EncabConfig`], [`ProgramConfig`], [`ExtensionConfig`] serde model
//! - [`load`]/[`from_str`] file discovery and parsing
//! - [`split_command`] POSIX-style splitting for string `command` values
//!
//! Normalization ([`Config::normalize`]) is idempotent; callers can apply it
//! to an already normalized config and get the identical result.

mod argv;
mod load;
mod model;

pub use argv::split_command;
pub use load::{from_str, load, ENV_CONFIG, ENV_DRY_RUN};
pub use model::{
    Config, EncabConfig, EnvOverlay, ExtensionConfig, NameOrId, Octal, OneOrMany, ProgramConfig,
    MAIN_PROGRAM,
};
