//! Error types for the dynamic sleep subsystem.
//!
//! The tuning algorithm itself never fails. Errors only arise at the edges:
//! the persisted statistics file, the configuration file, logging setup and
//! the reference retry loop.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single rejected line of the statistics file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line_no}: {reason}: {line}")]
pub struct LineError {
    /// 1-based line number within the file.
    pub line_no: usize,
    /// The offending line, verbatim.
    pub line: String,
    /// What was wrong with it.
    pub reason: String,
}

impl LineError {
    pub fn new(line_no: usize, line: &str, reason: impl Into<String>) -> Self {
        Self {
            line_no,
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// Every line error found while parsing a statistics file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineErrors(pub Vec<LineError>);

impl fmt::Display for LineErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ndx, err) in self.0.iter().enumerate() {
            if ndx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Errors related to the persisted statistics file.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Unable to determine dynamic sleep statistics file name")]
    PathUnavailable,

    #[error("I/O error on statistics file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error(s) reading cached statistics file '{path}': {errors}")]
    BadData { path: PathBuf, errors: LineErrors },
}

impl StatsError {
    /// Negative OS-style status code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            StatsError::PathUnavailable => -libc::ENOENT,
            StatsError::Io { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            StatsError::BadData { .. } => -libc::EINVAL,
        }
    }

    /// Line errors carried by a [`StatsError::BadData`], empty otherwise.
    pub fn line_errors(&self) -> &[LineError] {
        match self {
            StatsError::BadData { errors, .. } => &errors.0,
            _ => &[],
        }
    }
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration directory could not be determined")]
    PathUnavailable,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine the local data directory")]
    DataDirectoryNotFound,

    #[error("Failed to create log directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    AppenderCreationFailed(String),

    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Outcome of a retry loop that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("operation failed after {tries} tries: {source}")]
    Exhausted {
        tries: u32,
        #[source]
        source: E,
    },

    #[error("operation failed with a non-retryable error on try {tries}: {source}")]
    Fatal {
        tries: u32,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of tries consumed before giving up.
    pub fn tries(&self) -> u32 {
        match self {
            RetryError::Exhausted { tries, .. } | RetryError::Fatal { tries, .. } => *tries,
        }
    }

    /// The error returned by the last attempt.
    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source, .. } => source,
        }
    }
}

/// Top-level errors for the command line tool.
#[derive(Error, Debug)]
pub enum DsaError {
    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_error_errno() {
        assert_eq!(StatsError::PathUnavailable.errno(), -libc::ENOENT);

        let io = StatsError::Io {
            path: PathBuf::from("/nonexistent/stats"),
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(io.errno(), -libc::EACCES);

        let synthetic = StatsError::Io {
            path: PathBuf::from("stats"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        };
        assert_eq!(synthetic.errno(), -libc::EIO);

        let bad = StatsError::BadData {
            path: PathBuf::from("stats"),
            errors: LineErrors(vec![LineError::new(3, "i2c-4 x", "too few fields")]),
        };
        assert_eq!(bad.errno(), -libc::EINVAL);
        assert_eq!(bad.line_errors().len(), 1);
    }

    #[test]
    fn test_line_errors_display() {
        let errors = LineErrors(vec![
            LineError::new(2, "i2c-1 00", "too few fields"),
            LineError::new(4, "FORMAT 9", "unsupported format"),
        ]);
        let text = errors.to_string();
        assert!(text.contains("line 2: too few fields: i2c-1 00"));
        assert!(text.contains("; line 4"));
    }

    #[test]
    fn test_retry_error_accessors() {
        let err: RetryError<std::io::Error> = RetryError::Exhausted {
            tries: 5,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "nak"),
        };
        assert_eq!(err.tries(), 5);
        assert!(err.to_string().contains("after 5 tries"));
        assert_eq!(err.into_source().kind(), std::io::ErrorKind::TimedOut);
    }
}
