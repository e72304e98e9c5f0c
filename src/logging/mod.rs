//! Unified tagged log stream.
//!
//! Everything encab prints goes through one [`Logger`]: the supervisor's own
//! diagnostics, every line captured from a child's stdout/stderr, and the
//! records produced by extensions such as the log collector. The logger owns
//! the output writer through a single drain task, which is what guarantees
//! that records are serialized and never interleave at the byte level.
//!
//! ## Architecture
//! ```text
//!  ProgramLogger("main")  ─┐
//!  ProgramLogger("cron")  ─┼── mpsc ──► drain task ──► stdout
//!  ProgramLogger("encab") ─┘              │
//!                                    masks + format
//! ```
//!
//! ## Contents
//! - [`Level`] five severities with the config-file aliases
//! - [`LogRecord`] one tagged line
//! - [`LogFormat`] printf-style `logformat` rendering
//! - [`Logger`] the shared sink handle
//! - [`ProgramLogger`] per-program tagged handle with a level threshold

pub mod format;
mod level;
mod logger;
mod record;

pub use format::LogFormat;
pub use level::Level;
pub use logger::{Logger, ProgramLogger};
pub use record::LogRecord;

/// Program tag used for the supervisor's own records.
pub const ENCAB: &str = "encab";
