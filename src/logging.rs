//! Logging.
//!
//! Two pieces live here:
//!
//! - [`LoggingBuilder`] installs the global `tracing` subscriber used by the
//!   command line tool and by test harnesses that want console output.
//! - [`MultihostLogger`] is the logger passed down the object graph
//!   (config, domain, host, role, utility). Every record goes to `tracing`
//!   and into a shared in-memory buffer, so the session can split records per
//!   test phase and store them next to the test artifacts.

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, ErrorContext, Result};

// ============================================================================
// Global subscriber
// ============================================================================

/// Console log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty multi-line output
    Pretty,
    /// Compact single-line output
    #[default]
    Compact,
    /// JSON structured output
    Json,
}

/// Builder for the global `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    level: Level,
    format: LogFormat,
    ansi: bool,
    with_target: bool,
    with_spans: bool,
    filter: Option<String>,
}

impl LoggingBuilder {
    /// Create a new logging builder with default configuration.
    pub fn new() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            ansi: true,
            with_target: false,
            with_spans: false,
            filter: None,
        }
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Include target in logs.
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Include span open/close events.
    pub fn with_spans(mut self, enabled: bool) -> Self {
        self.with_spans = enabled;
        self
    }

    /// Set filter directive, used when `RUST_LOG` is not set.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Build and initialize the global subscriber. Output goes to stderr.
    pub fn init(self) -> Result<()> {
        let env_filter = self.build_filter();
        let span_events = if self.with_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match self.format {
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .pretty()
                        .with_ansi(self.ansi)
                        .with_target(self.with_target)
                        .with_span_events(span_events),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .compact()
                        .with_ansi(self.ansi)
                        .with_target(self.with_target)
                        .with_span_events(span_events),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .json()
                        .with_current_span(self.with_spans)
                        .with_span_list(self.with_spans)
                        .with_span_events(span_events),
                )
                .try_init(),
        };

        result.map_err(|e| Error::Config(e.to_string()))
    }

    fn build_filter(&self) -> EnvFilter {
        let default_filter = self.level.as_str().to_ascii_lowercase();

        match self.filter {
            Some(ref filter) => EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(filter))
                .unwrap_or_else(|_| EnvFilter::new(&default_filter)),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&default_filter)),
        }
    }
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `-v` repetitions to a level.
pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Helper function to initialize logging with verbosity level.
pub fn init_from_verbosity(verbosity: u8, format: LogFormat) -> Result<()> {
    LoggingBuilder::new()
        .with_level(level_from_verbosity(verbosity))
        .with_format(format)
        .with_target(verbosity >= 3)
        .with_spans(verbosity >= 3)
        .init()
}

// ============================================================================
// Multihost logger
// ============================================================================

#[derive(Debug, Default)]
struct LogSink {
    records: Mutex<Vec<String>>,
    file: Option<Mutex<File>>,
}

/// Logger handed to every object of a session.
///
/// Cloning is cheap; clones and children share one record buffer.
#[derive(Debug, Clone)]
pub struct MultihostLogger {
    sink: Arc<LogSink>,
    context: Option<Arc<str>>,
}

impl MultihostLogger {
    /// Creates a logger with an in-memory buffer only.
    pub fn new() -> Self {
        Self {
            sink: Arc::new(LogSink::default()),
            context: None,
        }
    }

    /// Creates a logger that also appends every record to `path`.
    pub fn with_log_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Unable to open log file {}", path.display()))?;

        Ok(Self {
            sink: Arc::new(LogSink {
                records: Mutex::new(Vec::new()),
                file: Some(Mutex::new(file)),
            }),
            context: None,
        })
    }

    /// Returns a logger sharing the buffer whose records carry `context`,
    /// for example `host=client.test`.
    pub fn child(&self, context: impl AsRef<str>) -> Self {
        let context = match self.context {
            Some(ref parent) => format!("{parent} {}", context.as_ref()),
            None => context.as_ref().to_string(),
        };

        Self {
            sink: Arc::clone(&self.sink),
            context: Some(context.into()),
        }
    }

    /// Context string of this logger.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Logs a trace record.
    pub fn trace(&self, message: impl AsRef<str>) {
        self.record(Level::TRACE, message.as_ref());
    }

    /// Logs a debug record.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.record(Level::DEBUG, message.as_ref());
    }

    /// Logs an info record.
    pub fn info(&self, message: impl AsRef<str>) {
        self.record(Level::INFO, message.as_ref());
    }

    /// Logs a warning record.
    pub fn warning(&self, message: impl AsRef<str>) {
        self.record(Level::WARN, message.as_ref());
    }

    /// Logs an error record.
    pub fn error(&self, message: impl AsRef<str>) {
        self.record(Level::ERROR, message.as_ref());
    }

    /// Logs a phase separator such as `SETUP HOSTS`.
    pub fn phase(&self, name: impl AsRef<str>) {
        self.record(Level::INFO, &format!("PHASE: {}", name.as_ref()));
    }

    /// Takes every buffered record, leaving the buffer empty.
    pub fn split(&self) -> Vec<String> {
        std::mem::take(&mut *self.sink.records.lock())
    }

    /// Drops buffered records.
    pub fn clear(&self) {
        self.sink.records.lock().clear();
    }

    /// Writes records to `path`, creating parent directories.
    pub fn write_records(path: &Path, records: &[String]) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        for record in records {
            writeln!(file, "{record}")?;
        }
        Ok(path.to_path_buf())
    }

    fn record(&self, level: Level, message: &str) {
        let context = self.context.as_deref().unwrap_or("");
        match level {
            Level::TRACE => tracing::trace!(target: "multihost", context, "{message}"),
            Level::DEBUG => tracing::debug!(target: "multihost", context, "{message}"),
            Level::INFO => tracing::info!(target: "multihost", context, "{message}"),
            Level::WARN => tracing::warn!(target: "multihost", context, "{message}"),
            _ => tracing::error!(target: "multihost", context, "{message}"),
        }

        if level == Level::TRACE {
            return;
        }

        let line = if context.is_empty() {
            format!(
                "{} {:<5} {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level.as_str(),
                message
            )
        } else {
            format!(
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level.as_str(),
                context,
                message
            )
        };

        if let Some(ref file) = self.sink.file {
            // A failing log file must not break the test run.
            let _ = writeln!(file.lock(), "{line}");
        }
        self.sink.records.lock().push(line);
    }
}

impl Default for MultihostLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_builder() {
        let builder = LoggingBuilder::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_ansi(false)
            .with_target(true);

        assert_eq!(builder.level, Level::DEBUG);
        assert_eq!(builder.format, LogFormat::Json);
        assert!(!builder.ansi);
        assert!(builder.with_target);
    }

    #[test]
    fn test_level_from_verbosity() {
        assert_eq!(level_from_verbosity(0), Level::WARN);
        assert_eq!(level_from_verbosity(1), Level::INFO);
        assert_eq!(level_from_verbosity(2), Level::DEBUG);
        assert_eq!(level_from_verbosity(9), Level::TRACE);
    }

    #[test]
    fn test_child_shares_buffer() {
        let logger = MultihostLogger::new();
        let host = logger.child("host=client.test");
        let util = host.child("util=fs");
        assert_eq!(util.context(), Some("host=client.test util=fs"));

        logger.info("session");
        util.error("failed");
        logger.trace("not buffered");

        let records = logger.split();
        assert_eq!(records.len(), 2);
        assert!(records[1].contains("[host=client.test util=fs] failed"));
        assert!(logger.split().is_empty());
    }

    #[test]
    fn test_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/mh.log");
        let logger = MultihostLogger::with_log_file(&path).unwrap();
        logger.phase("SETUP HOSTS");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("PHASE: SETUP HOSTS"));
    }
}
