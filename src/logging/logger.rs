//! # The shared log sink.
//!
//! [`Logger`] is a cheap clonable handle over a bounded channel into the one
//! drain task that owns the output writer. Because a single task performs all
//! writes, records are serialized: a record is never interleaved with another
//! at the byte level.
//!
//! Secret masking lives here as well: the drain task holds the current set of
//! sensitive strings (installed by the log sanitizer extension) and rewrites
//! every message before formatting, so no producer can bypass it.
//!
//! ## Rules
//! - Producers block (async) when the queue is full; records are never dropped
//! - Mask updates go through the same channel, so they apply to exactly the
//!   records sent after the update
//! - [`Logger::flush`] round-trips through the drain task, guaranteeing every
//!   previously sent record has hit the writer

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::{Level, LogFormat, LogRecord};

/// Replacement for masked secrets.
const MASK: &str = "******";

/// Capacity of the record queue.
const QUEUE_CAPACITY: usize = 1024;

enum Msg {
    Record(LogRecord),
    SetMasks(Vec<String>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the shared log sink.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::Sender<Msg>,
}

impl Logger {
    /// Creates a logger draining to stdout.
    pub fn stdout(format: LogFormat) -> Self {
        Self::to_writer(format, Box::new(tokio::io::stdout()))
    }

    /// Creates a logger draining to an arbitrary writer (used by tests).
    pub fn to_writer(format: LogFormat, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(drain(rx, format, writer));
        Self { tx }
    }

    /// Sends one record to the sink.
    pub async fn log(&self, record: LogRecord) {
        let _ = self.tx.send(Msg::Record(record)).await;
    }

    /// Replaces the set of masked strings.
    ///
    /// Empty strings are ignored; masking an empty needle would corrupt every
    /// message.
    pub async fn set_masks(&self, masks: Vec<String>) {
        let masks = masks.into_iter().filter(|m| !m.is_empty()).collect();
        let _ = self.tx.send(Msg::SetMasks(masks)).await;
    }

    /// Waits until every record sent before this call has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Msg::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Creates a tagged per-program handle with a level threshold.
    pub fn for_program(&self, program: impl Into<String>, threshold: Level) -> ProgramLogger {
        ProgramLogger {
            logger: self.clone(),
            program: program.into(),
            threshold,
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<Msg>,
    format: LogFormat,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
) {
    let mut masks: Vec<String> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Record(mut record) => {
                for mask in &masks {
                    if record.message.contains(mask.as_str()) {
                        record.message = record.message.replace(mask.as_str(), MASK);
                    }
                }
                let mut line = format.render(&record);
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    // Output is gone (closed stdout); nothing sensible left to do.
                    return;
                }
                let _ = writer.flush().await;
            }
            Msg::SetMasks(new_masks) => masks = new_masks,
            Msg::Flush(ack) => {
                let _ = writer.flush().await;
                let _ = ack.send(());
            }
        }
    }
    let _ = writer.flush().await;
}

/// Per-program tagged logging handle.
///
/// Carries the program name and the program's effective log level; records
/// below the threshold are discarded before they reach the sink.
#[derive(Clone)]
pub struct ProgramLogger {
    logger: Logger,
    program: String,
    threshold: Level,
}

impl ProgramLogger {
    /// The program tag this handle stamps on records.
    pub fn name(&self) -> &str {
        &self.program
    }

    /// Whether records of `level` pass this handle's threshold.
    pub fn enabled(&self, level: Level) -> bool {
        level >= self.threshold
    }

    /// Returns a handle with the same tag but a different threshold.
    pub fn with_threshold(&self, threshold: Level) -> Self {
        Self {
            logger: self.logger.clone(),
            program: self.program.clone(),
            threshold,
        }
    }

    /// Returns a handle with the same threshold but a different tag.
    pub fn with_name(&self, program: impl Into<String>) -> Self {
        Self {
            logger: self.logger.clone(),
            program: program.into(),
            threshold: self.threshold,
        }
    }

    /// Underlying shared sink.
    pub fn sink(&self) -> &Logger {
        &self.logger
    }

    pub async fn log(&self, level: Level, message: impl Into<String>) {
        if self.enabled(level) {
            self.logger
                .log(LogRecord::new(level, self.program.clone(), message))
                .await;
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.log(Level::Warning, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message).await;
    }

    pub async fn critical(&self, message: impl Into<String>) {
        self.log(Level::Critical, message).await;
    }
}
