//! Logging setup shared by the binary and anything embedding the library.
//! Level comes from a CLI flag or `HUDDLE_LOG`; an optional file target uses
//! a non-blocking appender whose guard the caller must keep alive.

use std::path::PathBuf;

use clap::ValueEnum;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("cannot open log file: {0}")]
    LogFile(#[from] std::io::Error),
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber. `HUDDLE_LOG` overrides the configured
/// level with a full EnvFilter directive when set.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, TelemetryError> {
    let filter = EnvFilter::try_from_env("HUDDLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|_| TelemetryError::AlreadyInitialized)?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|_| TelemetryError::AlreadyInitialized)?;
            Ok(None)
        }
    }
}
