//! # Log pump: one child stream → tagged records.
//!
//! Reads a pipe connected to a child's stdout or stderr and emits one log
//! record per line. Non-UTF-8 bytes are decoded with replacement; nothing is
//! dropped.
//!
//! ## Rules
//! - A line longer than [`LINE_CAP`] is split at the cap; the continuation
//!   keeps flowing as records of the same stream
//! - Bytes without a trailing newline stay buffered until more data arrives
//!   or the writer closes; on close they flush as one final record
//! - EOF ends the pump normally; any other read error logs one ERROR record
//!   against the program and ends the pump (log loss, not child failure)

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::logging::{Level, ProgramLogger};

/// Upper bound for a single record's payload.
pub const LINE_CAP: usize = 64 * 1024;

/// Pumps one readable stream into the log at the given severity.
pub async fn pump<R>(mut reader: R, logger: ProgramLogger, level: Level)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = pending.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    emit(&logger, level, &line).await;
                }
                while pending.len() >= LINE_CAP {
                    let chunk: Vec<u8> = pending.drain(..LINE_CAP).collect();
                    emit(&logger, level, &chunk).await;
                }
            }
            Err(err) => {
                logger
                    .error(format!("I/O error while logging: {err}"))
                    .await;
                return;
            }
        }
    }

    if !pending.is_empty() {
        emit(&logger, level, &pending).await;
    }
}

async fn emit(logger: &ProgramLogger, level: Level, bytes: &[u8]) {
    logger.log(level, String::from_utf8_lossy(bytes)).await;
}
