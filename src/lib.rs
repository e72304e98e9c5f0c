//! # encab
//!
//! **Encab** is a container-aware process supervisor. It runs as PID 1 (or an
//! equivalent foreground entrypoint), launches a set of declaratively
//! configured programs in a defined lifecycle, multiplexes their output into
//! one tagged log stream, and terminates cleanly on shutdown signals. It
//! replaces ad-hoc entrypoint shell scripts for containers that host several
//! cooperating processes.
//!
//! ## Features
//!
//! | Area            | Description                                              | Key types                                  |
//! |-----------------|----------------------------------------------------------|--------------------------------------------|
//! | **Supervision** | Ordered helper startup, main-bound lifetime, teardown    | [`Supervisor`]                             |
//! | **Programs**    | Lifecycle state machine, stop protocol, restarts         | [`ProgramState`], [`ProgramActor`]         |
//! | **Logging**     | Serialized tagged records, format control, masking       | [`Logger`], [`LogFormat`], [`Level`]       |
//! | **Config**      | YAML schema, discovery, normalization                    | [`Config`], [`config::load`]               |
//! | **Extensions**  | Hook contract plus four built-ins                        | [`ext::Extension`], [`ext::ExtensionHost`] |
//! | **PID 1**       | Orphan reaping, signal routing                           | [`supervisor::Reaper`]                     |
//!
//! ## Example
//!
//! ```no_run
//! use encab::{config, logging::{Logger, LogFormat}, Supervisor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cfg = config::from_str(
//!         "programs:\n  main:\n    sh: ['echo \"Hello Encab!\"']\n",
//!     )
//!     .expect("config");
//!     let logger = Logger::stdout(LogFormat::parse(cfg.encab.effective_logformat()));
//!     let code = Supervisor::new(cfg, logger).run(Vec::new()).await;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod ext;
pub mod logging;
pub mod process;
pub mod program;
pub mod supervisor;

// ---- Public re-exports ----

pub use config::Config;
pub use error::{ConfigError, ExtensionError, SpawnError};
pub use events::{Bus, Event, EventKind};
pub use logging::{Level, LogFormat, Logger};
pub use program::{ProgramActor, ProgramState};
pub use supervisor::Supervisor;
