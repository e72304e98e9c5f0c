//! # Log collector: tails files into the unified log stream.
//!
//! Each configured source follows a file (or a rotating family of files
//! described by a pattern) and emits every line through the logger under the
//! source's name.
//!
//! ```yaml
//! extensions:
//!   log_collector:
//!     settings:
//!       sources:
//!         error_log:
//!           path: ./error.log
//!         app_log:
//!           path_pattern: "%(LOG_DIR)e/app-%(%Y%m%d)d.log"
//!           level: WARNING
//!           offset: 0
//!           poll_interval: 0.5
//! ```
//!
//! ## Path patterns
//! - `%(NAME)e` inserts the value of environment variable `NAME`
//! - `%(fmt)d` inserts the current time, strftime-formatted, re-evaluated on
//!   every poll (rotation follows automatically)
//! - `%%` inserts a literal `%`
//!
//! ## Offsets
//! - `-1` (default): read the whole file from the beginning
//! - `0`: start at the end, emit only new data
//! - `n > 0`: start `n` bytes before the end
//!
//! Offsets apply to regular files only; FIFOs are not seekable and are
//! always read from the start.
//!
//! Sources start alongside the helpers via the `extend` hook and stop when
//! the supervisor tears down.

use std::time::Duration;

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Extension, ExtensionRuntime};
use crate::environment::EnvMap;
use crate::error::ExtensionError;
use crate::logging::{Level, ProgramLogger};

pub const LOG_COLLECTOR: &str = "log_collector";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceConfig {
    path: Option<String>,
    path_pattern: Option<String>,
    offset: Option<i64>,
    level: Option<String>,
    poll_interval: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    #[serde(default)]
    sources: IndexMap<String, SourceConfig>,
}

impl Settings {
    fn parse(settings: Option<&serde_yaml::Value>) -> Result<Self, ExtensionError> {
        match settings {
            None => Ok(Self::default()),
            Some(value) => {
                serde_yaml::from_value(value.clone()).map_err(|err| ExtensionError::Settings {
                    extension: LOG_COLLECTOR,
                    message: err.to_string(),
                })
            }
        }
    }
}

fn settings_error(message: impl Into<String>) -> ExtensionError {
    ExtensionError::Settings {
        extension: LOG_COLLECTOR,
        message: message.into(),
    }
}

/// One parsed `path_pattern` token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Env(String),
    Date(String),
}

/// Parsed `%(VAR)e` / `%(fmt)d` path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PathPattern {
    tokens: Vec<Token>,
}

impl PathPattern {
    fn parse(pattern: &str) -> Result<Self, ExtensionError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => literal.push('%'),
                Some('(') => {
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some(')') => break,
                            Some(c) => inner.push(c),
                            None => {
                                return Err(settings_error(format!(
                                    "Malformed path pattern '{pattern}': unterminated %(...)"
                                )))
                            }
                        }
                    }
                    let kind = chars.next();
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    match kind {
                        Some('e') => tokens.push(Token::Env(inner)),
                        Some('d') => tokens.push(Token::Date(inner)),
                        _ => {
                            return Err(settings_error(format!(
                                "Malformed path pattern '{pattern}': expected 'e' or 'd' after %(...)"
                            )))
                        }
                    }
                }
                _ => {
                    return Err(settings_error(format!(
                        "Malformed path pattern '{pattern}': '%' must be masked with '%%'"
                    )))
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(Self { tokens })
    }

    fn format(&self, time: DateTime<Local>, env: &EnvMap) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Env(name) => {
                    if let Some(value) = env.get(name) {
                        out.push_str(value);
                    }
                }
                Token::Date(fmt) => {
                    out.push_str(&strftime(time, fmt));
                }
            }
        }
        out
    }
}

/// Renders `fmt` leniently: invalid specifiers degrade to the raw format
/// text instead of failing the collector at runtime.
fn strftime(time: DateTime<Local>, fmt: &str) -> String {
    use chrono::format::{Item, StrftimeItems};
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return fmt.to_string();
    }
    time.format_with_items(items.into_iter()).to_string()
}

/// Where a source reads from.
#[derive(Debug, Clone)]
enum LogPath {
    Fixed(String),
    Rolling(PathPattern),
}

impl LogPath {
    fn current(&self, env: &EnvMap) -> String {
        match self {
            LogPath::Fixed(path) => path.clone(),
            LogPath::Rolling(pattern) => pattern.format(Local::now(), env),
        }
    }

    fn is_fixed(&self) -> bool {
        matches!(self, LogPath::Fixed(_))
    }
}

/// One resolved source.
#[derive(Debug, Clone)]
struct Source {
    name: String,
    path: LogPath,
    offset: i64,
    level: Level,
    poll_interval: Duration,
}

fn resolve_source(name: &str, config: &SourceConfig) -> Result<Source, ExtensionError> {
    let path = match (&config.path, &config.path_pattern) {
        (Some(path), None) => LogPath::Fixed(path.clone()),
        (None, Some(pattern)) => LogPath::Rolling(PathPattern::parse(pattern)?),
        (Some(_), Some(_)) => {
            return Err(settings_error(format!(
                "Source '{name}': either path or path_pattern must be set, but not both"
            )))
        }
        (None, None) => {
            return Err(settings_error(format!(
                "Source '{name}': either path or path_pattern must be set"
            )))
        }
    };
    let level = match &config.level {
        Some(level) => level
            .parse::<Level>()
            .map_err(|err| settings_error(err.to_string()))?,
        None => Level::Info,
    };
    let poll = config.poll_interval.unwrap_or(1.0);
    if !poll.is_finite() || poll <= 0.0 {
        return Err(settings_error(format!(
            "Source '{name}': poll_interval must be positive"
        )));
    }
    Ok(Source {
        name: name.to_string(),
        path,
        offset: config.offset.unwrap_or(-1),
        level,
        poll_interval: Duration::from_secs_f64(poll),
    })
}

/// Tails configured files and feeds their lines into the log stream.
pub struct LogCollector {
    sources: Vec<Source>,
    logger: Option<ProgramLogger>,
}

impl LogCollector {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            logger: None,
        }
    }
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extension for LogCollector {
    fn name(&self) -> &'static str {
        LOG_COLLECTOR
    }

    fn validate(&mut self, settings: Option<&serde_yaml::Value>) -> Result<(), ExtensionError> {
        for (name, config) in &Settings::parse(settings)?.sources {
            resolve_source(name, config)?;
        }
        Ok(())
    }

    fn configure(
        &mut self,
        settings: Option<&serde_yaml::Value>,
        logger: ProgramLogger,
    ) -> Result<(), ExtensionError> {
        self.sources = Settings::parse(settings)?
            .sources
            .iter()
            .map(|(name, config)| resolve_source(name, config))
            .collect::<Result<_, _>>()?;
        self.logger = Some(logger);
        Ok(())
    }

    fn extend(&mut self, runtime: &ExtensionRuntime) -> Vec<JoinHandle<()>> {
        let Some(logger) = &self.logger else {
            return Vec::new();
        };
        self.sources
            .iter()
            .map(|source| {
                let tagged = logger.with_name(source.name.clone());
                let task = CollectTask {
                    source: source.clone(),
                    logger: tagged,
                    env: runtime.env.clone(),
                    token: runtime.token.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect()
    }
}

struct CollectTask {
    source: Source,
    logger: ProgramLogger,
    env: EnvMap,
    token: CancellationToken,
}

impl CollectTask {
    async fn run(self) {
        let existed_at_start = std::path::Path::new(&self.source.path.current(&self.env)).exists();
        let mut first_open = true;

        'files: loop {
            if self.token.is_cancelled() {
                return;
            }

            // Wait for the (current) file to appear.
            let path = loop {
                let path = self.source.path.current(&self.env);
                if !path.is_empty() && std::path::Path::new(&path).exists() {
                    break path;
                }
                self.logger
                    .debug(format!("Waiting for file {path} ..."))
                    .await;
                if self.sleep().await {
                    return;
                }
            };

            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(_) => {
                    // Vanished between the existence check and the open.
                    if self.sleep().await {
                        return;
                    }
                    continue 'files;
                }
            };

            // Offsets only make sense on regular files; FIFOs are not
            // seekable and are always read from the start.
            let is_regular = match file.metadata().await {
                Ok(meta) => meta.file_type().is_file(),
                Err(_) => false,
            };
            if first_open {
                first_open = false;
                if is_regular {
                    if let Err(err) = self.seek_initial(&mut file, existed_at_start).await {
                        self.logger
                            .error(format!("Reading source failed: {err}"))
                            .await;
                        return;
                    }
                }
            }

            let mut pending: Vec<u8> = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        self.flush_lines(&mut pending).await;
                        // At EOF: follow rotation for patterns, keep polling
                        // fixed paths.
                        if !self.source.path.is_fixed()
                            && self.source.path.current(&self.env) != path
                        {
                            self.logger
                                .debug(format!("Log path changed from {path}"))
                                .await;
                            continue 'files;
                        }
                        if self.sleep().await {
                            return;
                        }
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        self.flush_lines(&mut pending).await;
                    }
                    Err(err) => {
                        self.logger
                            .error(format!("Reading source failed: {err}"))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    /// Applies the configured offset on the very first open.
    async fn seek_initial(
        &self,
        file: &mut tokio::fs::File,
        existed_at_start: bool,
    ) -> std::io::Result<()> {
        if self.source.offset == -1 || !existed_at_start {
            return Ok(());
        }
        let len = file.metadata().await?.len();
        let back = self.source.offset.max(0) as u64;
        let pos = if self.source.offset == 0 {
            len
        } else {
            len.saturating_sub(back)
        };
        file.seek(std::io::SeekFrom::Start(pos)).await?;
        Ok(())
    }

    /// Emits every complete line buffered in `pending`.
    async fn flush_lines(&self, pending: &mut Vec<u8>) {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.logger
                .log(self.source.level, String::from_utf8_lossy(&line))
                .await;
        }
    }

    /// Sleeps one poll interval; returns true when cancelled.
    async fn sleep(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.source.poll_interval) => false,
            _ = self.token.cancelled() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, Logger};
    use tokio::io::AsyncReadExt as _;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn pattern_substitutes_env_and_escapes() {
        let pattern = PathPattern::parse("%(HOME)e/path/a%%b.log").unwrap();
        let rendered = pattern.format(Local::now(), &env(&[("HOME", "/home/user")]));
        assert_eq!(rendered, "/home/user/path/a%b.log");
    }

    #[test]
    fn pattern_substitutes_date() {
        let pattern = PathPattern::parse("error-%(%Y)d.log").unwrap();
        let rendered = pattern.format(Local::now(), &EnvMap::new());
        let year = Local::now().format("%Y").to_string();
        assert_eq!(rendered, format!("error-{year}.log"));
    }

    #[test]
    fn missing_env_variable_renders_empty() {
        let pattern = PathPattern::parse("%(NOPE)e/x").unwrap();
        assert_eq!(pattern.format(Local::now(), &EnvMap::new()), "/x");
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(PathPattern::parse("%(unterminated").is_err());
        assert!(PathPattern::parse("%(X)q").is_err());
        assert!(PathPattern::parse("50% off").is_err());
    }

    #[test]
    fn source_requires_exactly_one_path_form() {
        let both: Settings = serde_yaml::from_str(
            "sources:\n  s:\n    path: a\n    path_pattern: b\n",
        )
        .unwrap();
        assert!(resolve_source("s", &both.sources["s"]).is_err());

        let neither: Settings = serde_yaml::from_str("sources:\n  s: {}\n").unwrap();
        assert!(resolve_source("s", &neither.sources["s"]).is_err());
    }

    #[test]
    fn source_defaults() {
        let settings: Settings =
            serde_yaml::from_str("sources:\n  s:\n    path: /tmp/x.log\n").unwrap();
        let source = resolve_source("s", &settings.sources["s"]).unwrap();
        assert_eq!(source.offset, -1);
        assert_eq!(source.level, Level::Info);
        assert_eq!(source.poll_interval, Duration::from_secs(1));
    }

    async fn collect_for(
        path_yaml: &str,
        prewrite: &str,
        append: &str,
        offset: i64,
    ) -> String {
        let (write, mut read) = tokio::io::duplex(64 * 1024);
        let logger = Logger::to_writer(LogFormat::default(), Box::new(write));
        let settings: Settings = serde_yaml::from_str(path_yaml).unwrap();
        let mut source = resolve_source("src", &settings.sources["src"]).unwrap();
        source.offset = offset;
        source.poll_interval = Duration::from_millis(20);

        let token = CancellationToken::new();
        let task = CollectTask {
            source,
            logger: logger.for_program("src", Level::Debug),
            env: EnvMap::new(),
            token: token.clone(),
        };

        let path = match path_yaml.lines().find_map(|l| l.trim().strip_prefix("path: ")) {
            Some(p) => p.to_string(),
            None => panic!("fixed path expected"),
        };
        std::fs::write(&path, prewrite).unwrap();

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !append.is_empty() {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(append.as_bytes()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        let _ = handle.await;

        logger.flush().await;
        drop(logger);
        let mut out = String::new();
        let _ = read.read_to_string(&mut out).await;
        out
    }

    #[tokio::test]
    async fn tails_existing_content_and_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let yaml = format!("sources:\n  src:\n    path: {}\n", path.display());

        let out = collect_for(&yaml, "old line\n", "new line\n", -1).await;
        assert!(out.contains("INFO  src: old line"), "got: {out}");
        assert!(out.contains("INFO  src: new line"), "got: {out}");
    }

    #[tokio::test]
    async fn offset_zero_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let yaml = format!("sources:\n  src:\n    path: {}\n", path.display());

        let out = collect_for(&yaml, "old line\n", "new line\n", 0).await;
        assert!(!out.contains("old line"), "got: {out}");
        assert!(out.contains("INFO  src: new line"), "got: {out}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tails_a_fifo_without_seeking() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let (write, mut read) = tokio::io::duplex(64 * 1024);
        let logger = Logger::to_writer(LogFormat::default(), Box::new(write));
        let source = Source {
            name: "src".to_string(),
            path: LogPath::Fixed(path.display().to_string()),
            // 0 would seek to the end of a regular file; FIFOs must not be
            // seeked at all.
            offset: 0,
            level: Level::Info,
            poll_interval: Duration::from_millis(20),
        };
        let token = CancellationToken::new();
        let task = CollectTask {
            source,
            logger: logger.for_program("src", Level::Debug),
            env: EnvMap::new(),
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run());

        // The write-end open blocks until the collector opens the read end.
        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut fifo = std::fs::OpenOptions::new()
                .write(true)
                .open(writer_path)
                .unwrap();
            fifo.write_all(b"fifo line\n").unwrap();
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let _ = handle.await;

        logger.flush().await;
        drop(logger);
        let mut out = String::new();
        let _ = read.read_to_string(&mut out).await;
        assert!(out.contains("INFO  src: fifo line"), "got: {out}");
        assert!(!out.contains("Reading source failed"), "got: {out}");
    }
}
