use std::time::{Instant, SystemTime};

use super::Level;

/// One tagged log line.
///
/// Carries both a wall-clock timestamp (for formatting) and a monotonic one
/// (stable for interval measurements even when the wall clock steps).
/// The message holds one logical line without its terminating newline.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub at: SystemTime,
    pub monotonic: Instant,
    pub level: Level,
    pub program: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, program: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: SystemTime::now(),
            monotonic: Instant::now(),
            level,
            program: program.into(),
            message: message.into(),
        }
    }
}
