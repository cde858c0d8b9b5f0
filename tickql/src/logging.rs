///
/// Log sinks for the engine.
///
/// Two `tracing_subscriber::fmt` layers share one registry: the console
/// (stderr) and an append-only log file. Each layer is gated by its own
/// `LogLevel`, stored in an atomic so `sql_debug` can retune either sink
/// while the engine runs.
///

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use crate::config::LoggingConfig;
use crate::errors::LoggingError;

/// Host-visible log levels, numbered 0-5 as `sql_debug` takes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    All = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    None = 5,
}

impl LogLevel {
    pub fn from_code(code: i32) -> Option<LogLevel> {
        match code {
            0 => Some(LogLevel::All),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warning),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::None),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether an event at `level` passes this threshold.
    pub fn enables(self, level: &Level) -> bool {
        let rank = if *level == Level::ERROR {
            LogLevel::Error
        } else if *level == Level::WARN {
            LogLevel::Warning
        } else if *level == Level::INFO {
            LogLevel::Info
        } else if *level == Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::All
        };
        self != LogLevel::None && rank >= self
    }
}

/// Shared, runtime-adjustable thresholds for both sinks.
#[derive(Debug, Clone)]
pub struct LogLevels {
    file: Arc<AtomicU8>,
    console: Arc<AtomicU8>,
}

impl LogLevels {
    pub fn new(file: LogLevel, console: LogLevel) -> Self {
        Self {
            file: Arc::new(AtomicU8::new(file as u8)),
            console: Arc::new(AtomicU8::new(console as u8)),
        }
    }

    fn load(cell: &AtomicU8) -> LogLevel {
        LogLevel::from_code(cell.load(Ordering::Relaxed) as i32).unwrap_or(LogLevel::None)
    }

    pub fn file(&self) -> LogLevel {
        Self::load(&self.file)
    }

    pub fn console(&self) -> LogLevel {
        Self::load(&self.console)
    }

    pub fn set(&self, file: LogLevel, console: LogLevel) {
        self.file.store(file as u8, Ordering::Relaxed);
        self.console.store(console as u8, Ordering::Relaxed);
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LogLevels, LoggingError> {
    let levels = LogLevels::new(config.file_level, config.console_level);

    let console_levels = levels.clone();
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(filter_fn(move |meta| {
            console_levels.console().enables(meta.level())
        }));

    let file = if config.file.is_empty() {
        None
    } else {
        let path = PathBuf::from(&config.file);
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LoggingError::OpenFile { path, source: e })?;
        let file_levels = levels.clone();
        Some(
            fmt::layer()
                .with_writer(Mutex::new(handle))
                .with_ansi(false)
                .with_filter(filter_fn(move |meta| file_levels.file().enables(meta.level()))),
        )
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;
    Ok(levels)
}
