///
/// Engine error types.
///
/// `EngineError` is what the typed `Engine` API returns. `DriverError` is the
/// backend's own error value; it is recorded on statements rather than
/// propagated, because a failed query is a normal outcome the host observes
/// through `error()` or the error callback.
///

use std::path::PathBuf;
use thiserror::Error;

use crate::driver::BackendKind;
use crate::ids::{HandlerId, StatementId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown handler {0}")]
    UnknownHandler(HandlerId),

    #[error("Unknown statement {0}")]
    UnknownStatement(StatementId),

    #[error("No driver registered for backend kind {0}")]
    UnknownBackend(BackendKind),

    #[error("Connection failed ({code}): {message}")]
    ConnectFailed { code: i32, message: String },

    #[error("Statement {0} has not been executed yet")]
    NotExecuted(StatementId),

    #[error("Index {index} is out of range")]
    OutOfRange { index: i64 },

    #[error("Pending queue of handler {0} is full")]
    QueueFull(HandlerId),

    #[error("Charset '{0}' was rejected by the backend")]
    CharsetRejected(String),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("{0}")]
    Format(#[from] FormatError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Unknown format specifier '{spec}' at position {position}")]
    UnknownSpecifier { spec: char, position: usize },

    #[error("Missing parameter for specifier '{spec}' at position {position}")]
    MissingParameter { spec: char, position: usize },

    #[error("Specifier '{spec}' at position {position} expects {expected}, got {found}")]
    TypeMismatch {
        spec: char,
        position: usize,
        expected: &'static str,
        found: &'static str,
    },
}

/// Error reported by a backend. `code` is never 0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: if code == 0 { -1 } else { code },
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(-1, "not connected")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}
