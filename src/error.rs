//! Error types for multihost.
//!
//! This module defines the error type shared by every part of the library.
//! Errors raised while tearing things down are never dropped: they are
//! collected into an [`AggregateError`] that keeps every cause.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::connection::{ConnectionError, ProcessError, ProcessTimeout};

/// Result type alias for multihost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for multihost.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// A required configuration key is missing or empty.
    #[error("\"{key}\" property is missing in {scope} configuration")]
    MissingKey {
        /// Dotted path of the missing key
        key: String,
        /// Which configuration object was validated (host, domain, multihost)
        scope: String,
    },

    /// A configuration value is present but not acceptable.
    #[error("{0}")]
    InvalidValue(String),

    /// Generic configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read a configuration file.
    #[error("Unable to read configuration file '{path}': {message}")]
    ConfigFile {
        /// Path to the file
        path: PathBuf,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Topology Errors
    // ========================================================================
    /// Named entity (path, domain, role, fixture, parameter) does not exist.
    #[error("{0}")]
    Lookup(String),

    /// A topology could not be constructed.
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// A topology mark is malformed.
    #[error("Invalid topology mark '{name}': {message}")]
    InvalidMark {
        /// Mark name
        name: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// A remote command finished with a non-zero return code.
    #[error(transparent)]
    Process(Box<ProcessError>),

    /// A remote command did not finish in time.
    #[error(transparent)]
    Timeout(Box<ProcessTimeout>),

    /// Transport level failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Several errors collected while running a group of operations.
    #[error(transparent)]
    Aggregate(AggregateError),

    /// Utility lifecycle violation (dependency cycle, unbalanced enter/exit).
    #[error("Utility error: {0}")]
    Utility(String),

    /// A user supplied hook or test body failed.
    #[error("{0}")]
    Hook(String),

    /// The test asked to be skipped.
    #[error("Skipped: {0}")]
    Skipped(String),

    /// Operation is not available for this host or transport.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // ========================================================================
    // Foreign Errors
    // ========================================================================
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a missing key error for a host configuration.
    pub fn missing_key(key: impl Into<String>, scope: impl Into<String>) -> Self {
        Error::MissingKey {
            key: key.into(),
            scope: scope.into(),
        }
    }

    /// Creates a lookup error for a name that is not registered.
    pub fn name_not_found(name: impl AsRef<str>) -> Self {
        Error::Lookup(format!("Name \"{}\" does not exist", name.as_ref()))
    }

    /// Creates an invalid mark error.
    pub fn invalid_mark(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidMark {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an error from a hook or callback failure.
    pub fn hook(message: impl Into<String>) -> Self {
        Error::Hook(message.into())
    }

    /// Creates the error a test body returns to skip itself.
    pub fn skip(reason: impl Into<String>) -> Self {
        Error::Skipped(reason.into())
    }

    /// Wraps a list of errors; a single error is returned unchanged.
    pub fn aggregate(kind: AggregateKind, mut errors: Vec<Error>) -> Self {
        if errors.len() == 1 && kind == AggregateKind::Flatten {
            return errors.remove(0);
        }
        Error::Aggregate(AggregateError::new(kind, errors))
    }

    /// Returns the inner process error when this is a failed command.
    pub fn as_process_error(&self) -> Option<&ProcessError> {
        match self {
            Error::Process(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if the error is transient and the operation may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Connection(ConnectionError::ConnectionFailed(_))
        )
    }

    /// Returns the exit code used by the command line tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MissingKey { .. }
            | Error::InvalidValue(_)
            | Error::Config(_)
            | Error::ConfigFile { .. }
            | Error::Yaml(_)
            | Error::Json(_) => 2,
            Error::Connection(_) => 3,
            Error::Process(e) => e.rc.clamp(1, 255),
            Error::Timeout(_) => 124,
            _ => 1,
        }
    }
}

impl From<ProcessError> for Error {
    fn from(e: ProcessError) -> Self {
        Error::Process(Box::new(e))
    }
}

impl From<ProcessTimeout> for Error {
    fn from(e: ProcessTimeout) -> Self {
        Error::Timeout(Box::new(e))
    }
}

impl From<AggregateError> for Error {
    fn from(e: AggregateError) -> Self {
        Error::Aggregate(e)
    }
}

// ============================================================================
// Aggregate Errors
// ============================================================================

/// What kind of operation produced an [`AggregateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Session, topology or test teardown.
    Teardown,
    /// Gathering artifact lists from collectables.
    Artifacts,
    /// A skip callback or requirement predicate raised.
    SkipCallback,
    /// Restoring hosts from a backup.
    Restore,
    /// Plain list; a single error is returned unwrapped.
    Flatten,
}

/// A group of errors reported under one message.
///
/// Every inner error is kept and rendered by [`fmt::Display`].
#[derive(Debug)]
pub struct AggregateError {
    /// Operation kind
    pub kind: AggregateKind,
    /// Summary message
    pub message: String,
    /// Collected causes, in the order they happened
    pub errors: Vec<Error>,
}

impl AggregateError {
    /// Creates an aggregate with the default message for `kind`.
    pub fn new(kind: AggregateKind, errors: Vec<Error>) -> Self {
        let message = match kind {
            AggregateKind::Teardown => "One or more error occurred during teardown",
            AggregateKind::Artifacts => "Unable to gather list of artifacts",
            AggregateKind::SkipCallback => "An exception occurred inside a skip callback",
            AggregateKind::Restore => "Some hosts failed to restore to original state",
            AggregateKind::Flatten => "Multiple errors occurred",
        };
        Self::with_message(kind, message, errors)
    }

    /// Creates an aggregate with a custom message.
    pub fn with_message(kind: AggregateKind, message: impl Into<String>, errors: Vec<Error>) -> Self {
        Self {
            kind,
            message: message.into(),
            errors,
        }
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for (i, e) in self.errors.iter().enumerate() {
            let text = e.to_string();
            let mut lines = text.lines();
            if let Some(first) = lines.next() {
                write!(f, "\n  [{}] {}", i + 1, first)?;
            }
            for line in lines {
                write!(f, "\n      {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Collects errors from a sequence of fallible steps that must all run.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<Error>,
}

impl ErrorCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the error of `result`, if any, and returns the success value.
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    /// Records an error.
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// True when no error was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Finishes collection: `Ok` if nothing failed, otherwise an aggregate
    /// error carrying `message`.
    pub fn finish(self, kind: AggregateKind, message: impl Into<String>) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(AggregateError::with_message(
                kind,
                message,
                self.errors,
            )))
        }
    }

    /// Like [`ErrorCollector::finish`], but a single error is returned as is.
    pub fn finish_flat(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(AggregateKind::Flatten, self.errors))
        }
    }

    /// Consumes the collector and returns the recorded errors.
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_message() {
        let err = Error::missing_key("role", "host");
        assert_eq!(
            err.to_string(),
            "\"role\" property is missing in host configuration"
        );
    }

    #[test]
    fn test_aggregate_lists_every_cause() {
        let err = Error::aggregate(
            AggregateKind::Teardown,
            vec![Error::hook("first failed"), Error::hook("second failed")],
        );
        let text = err.to_string();
        assert!(text.starts_with("One or more error occurred during teardown"));
        assert!(text.contains("[1] first failed"));
        assert!(text.contains("[2] second failed"));
    }

    #[test]
    fn test_flatten_single_error() {
        let err = Error::aggregate(AggregateKind::Flatten, vec![Error::hook("only")]);
        assert!(matches!(err, Error::Hook(_)));
    }

    #[test]
    fn test_collector_finish() {
        let mut collector = ErrorCollector::new();
        assert_eq!(collector.record(Ok::<_, Error>(5)), Some(5));
        assert!(collector.is_empty());
        collector.record::<()>(Err(Error::hook("boom")));
        let err = collector
            .finish(AggregateKind::Teardown, "Unable to teardown")
            .unwrap_err();
        match err {
            Error::Aggregate(agg) => {
                assert_eq!(agg.message, "Unable to teardown");
                assert_eq!(agg.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_context() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = io.context("reading inventory").unwrap_err();
        assert_eq!(err.to_string(), "reading inventory");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("x".into()).exit_code(), 2);
        assert_eq!(Error::hook("x").exit_code(), 1);
    }
}
