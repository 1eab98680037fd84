//! Structured records captured from the native runtime.

use std::fmt;
use std::time::SystemTime;

/// ggml log levels as passed to the native log callback.
pub const GGML_LOG_LEVEL_NONE: u32 = 0;
pub const GGML_LOG_LEVEL_DEBUG: u32 = 1;
pub const GGML_LOG_LEVEL_INFO: u32 = 2;
pub const GGML_LOG_LEVEL_WARN: u32 = 3;
pub const GGML_LOG_LEVEL_ERROR: u32 = 4;
pub const GGML_LOG_LEVEL_CONT: u32 = 5;

/// Severity of a captured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a raw native level onto a structured severity.
    ///
    /// Returns `None` for levels that are not kept (none, debug, continuation
    /// and anything unknown).
    pub fn from_native(raw: u32) -> Option<Self> {
        match raw {
            GGML_LOG_LEVEL_INFO => Some(Self::Info),
            GGML_LOG_LEVEL_WARN => Some(Self::Warning),
            GGML_LOG_LEVEL_ERROR => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// A single native log record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the record was captured.
    pub timestamp: SystemTime,

    /// Severity after mapping from the native level.
    pub level: LogLevel,

    /// Trimmed, non-empty message text.
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            message: message.into(),
        }
    }
}
