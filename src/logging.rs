//! Logging setup for the `ddc-dsa` tool.
//!
//! Events go to stderr as text or JSON. Optionally a JSON copy is written to
//! a daily rotated file under `$XDG_DATA_HOME/ddc-dsa/`, keeping the last
//! three files.

use crate::config::APP_DIR;
use crate::error::LoggingError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self as tfmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log file name prefix
const LOG_FILE_PREFIX: &str = "ddc-dsa";
/// Maximum number of log files to retain
const MAX_LOG_FILES: usize = 3;
/// Filter used when neither `--log-level` nor `RUST_LOG` is given
const DEFAULT_FILTER: &str = "info";

/// Output format for stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}' (expected text or json)", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Settings for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Filter directives; `RUST_LOG` or `info` when absent.
    pub level: Option<String>,
    pub format: LogFormat,
    /// Also write JSON logs to the rotating file.
    pub file: bool,
}

/// Keeps the non-blocking writers alive. Hold it for the life of the process.
pub struct LogGuard {
    _stderr_guard: WorkerGuard,
    _file_guard: Option<WorkerGuard>,
}

/// Build the event filter from an explicit directive string or the environment.
pub fn build_filter(level: Option<&str>) -> Result<EnvFilter, LoggingError> {
    match level {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|_| LoggingError::InvalidFilter(directives.to_string())),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Directory holding the rotating log files.
pub fn log_directory() -> Result<PathBuf, LoggingError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(LoggingError::DataDirectoryNotFound)
}

/// Install the global subscriber.
pub fn init_logging(options: &LogOptions) -> Result<LogGuard, LoggingError> {
    let env_filter = build_filter(options.level.as_deref())?;

    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        LogFormat::Text => tfmt::layer()
            .with_target(false)
            .with_writer(non_blocking_stderr)
            .boxed(),
        LogFormat::Json => tfmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_current_span(true)
            .with_writer(non_blocking_stderr)
            .boxed(),
    };

    let (file_layer, file_guard) = if options.file {
        let log_dir = log_directory()?;
        std::fs::create_dir_all(&log_dir).map_err(|e| LoggingError::DirectoryCreationFailed {
            path: log_dir.display().to_string(),
            source: e,
        })?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(MAX_LOG_FILES)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(&log_dir)
            .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))?;
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

        let layer = tfmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(non_blocking_file);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LogGuard {
        _stderr_guard: stderr_guard,
        _file_guard: file_guard,
    })
}
