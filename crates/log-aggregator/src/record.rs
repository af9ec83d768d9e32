// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The log event value carried from workers to the listener.
//!
//! A [`LogRecord`] is built once, at the moment of a log call in a worker, and
//! is never mutated afterwards. It crosses process boundaries as a single JSON
//! document, so every field is owned and serializable.
//!
//! # Severity
//!
//! [`Level`] is totally ordered, least to most severe:
//!
//! ```text
//! DEBUG < INFO < WARNING < ERROR < CRITICAL
//! ```
//!
//! Routing thresholds compare against this order: a record passes a threshold
//! when `record.level >= threshold`.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Severity of a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    /// Diagnostic detail, only interesting while debugging.
    #[default]
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected that the application recovered from.
    Warning,
    /// An operation failed.
    Error,
    /// The application may not be able to continue.
    Critical,
}

impl Level {
    /// All levels, least severe first.
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Maps a `tracing` level onto the record severity scale.
    ///
    /// `tracing` has no level above `ERROR` and one below `DEBUG`, so `TRACE`
    /// folds into [`Level::Debug`] and [`Level::Critical`] is only reachable
    /// through an explicit `severity` field on the event.
    #[must_use]
    pub fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::ERROR => Level::Error,
        }
    }

    /// The most verbose `tracing` filter that still lets this level through.
    #[must_use]
    pub fn as_level_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            Level::Debug => LevelFilter::TRACE,
            Level::Info => LevelFilter::INFO,
            Level::Warning => LevelFilter::WARN,
            Level::Error | Level::Critical => LevelFilter::ERROR,
        }
    }
}

impl AsRef<str> for Level {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Parses level names case-insensitively.
///
/// `WARN` is accepted for [`Level::Warning`] and `FATAL` for
/// [`Level::Critical`]. Anything else is an error; configuration that names an
/// unknown level is rejected rather than silently defaulted.
impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" | "trace" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" | "fatal" => Ok(Level::Critical),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: debug, info, warning, error, critical",
            )),
        }
    }
}

impl Serialize for Level {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Level::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Structured description of an error attached to a log call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Type or category of the error, when known.
    pub kind: Option<String>,
    /// Rendered error message (may span several lines).
    pub message: String,
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// One log event, as produced by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    /// Dotted hierarchical logger name, e.g. `app.db.pool`.
    pub logger: String,
    pub process_id: u32,
    pub process_name: String,
    pub thread_id: String,
    pub thread_name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

impl LogRecord {
    /// Creates a record stamped with the current time and the calling
    /// process and thread.
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        let thread = std::thread::current();
        Self {
            timestamp: SystemTime::now(),
            level,
            logger: logger.into(),
            process_id: std::process::id(),
            process_name: current_process_name(),
            thread_id: format!("{:?}", thread.id()),
            thread_name: thread.name().map(str::to_owned),
            message: message.into(),
            exception: None,
        }
    }

    #[must_use]
    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    #[must_use]
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }
}

/// Name of the running executable, falling back to the pid.
pub(crate) fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}
