// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed configuration for the listener and for workers.
//!
//! The listener configuration is a JSON document:
//!
//! ```json
//! {
//!   "formatters": { "plain": "{level} {logger}: {message}" },
//!   "sinks": {
//!     "console": { "kind": "console", "stream": "stderr", "formatter": "plain" },
//!     "app": { "kind": "rotating_file", "path": "/var/log/app.log",
//!              "max_bytes": 1048576, "backup_count": 3, "level": "INFO" }
//!   },
//!   "routes": {
//!     "root": { "level": "DEBUG", "sinks": ["console"] },
//!     "app.db": { "level": "WARNING", "sinks": ["app"], "propagate": true }
//!   },
//!   "idle_timeout_ms": 36000000
//! }
//! ```
//!
//! Unknown keys are rejected and [`AggregatorConfig::validate`] checks every
//! cross-reference, so a listener never starts with a configuration it would
//! have to partially ignore.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::format::Template;
use crate::record::Level;

/// Name of the catch-all route.
pub const ROOT_ROUTE: &str = "root";

/// Ten hours without a record before the listener stops itself.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 36_000_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 60_000;

/// File holding the listener configuration.
pub const CONFIG_PATH_ENV: &str = "LOG_AGGREGATOR_CONFIG";
/// Inline listener configuration, used when no file is named.
pub const CONFIG_JSON_ENV: &str = "LOG_AGGREGATOR_CONFIG_JSON";

const fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

const fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}

const fn default_diagnostics_level() -> Level {
    Level::Warning
}

/// Listener configuration: formatters, sinks, routing and timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Formatter name to template.
    #[serde(default)]
    pub formatters: BTreeMap<String, String>,
    pub sinks: BTreeMap<String, SinkConfig>,
    /// Logger-name prefix (or `root`) to route.
    pub routes: BTreeMap<String, RouteConfig>,
    /// Stop after this long without a consumed record.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Longest time the consumer waits on the channel before re-checking state.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the idle watchdog wakes up.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Where the cross-process socket is bound. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Threshold for the listener's own diagnostics on stderr.
    #[serde(default = "default_diagnostics_level")]
    pub diagnostics_level: Level,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Console,
    File,
    RotatingFile,
    Memory,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Stdout,
    #[default]
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Formatter name; the default template is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<String>,
    /// Records below this level are not written to this sink.
    #[serde(default)]
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<ConsoleStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_count: Option<u32>,
}

/// Where a validated sink writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkTarget {
    Console(ConsoleStream),
    File(PathBuf),
    RotatingFile {
        path: PathBuf,
        max_bytes: u64,
        backup_count: u32,
    },
    Memory,
}

impl SinkConfig {
    #[must_use]
    pub fn new(kind: SinkKind) -> Self {
        Self {
            kind,
            formatter: None,
            level: Level::Debug,
            stream: None,
            path: None,
            max_bytes: None,
            backup_count: None,
        }
    }

    /// Resolves the kind-specific fields, rejecting missing or stray ones.
    pub fn target(&self, name: &str) -> Result<SinkTarget, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: format!("sinks.{name}"),
            reason: reason.to_string(),
        };
        let require_path = || {
            self.path
                .clone()
                .ok_or_else(|| invalid("'path' is required for file sinks"))
        };

        match self.kind {
            SinkKind::Console => {
                if self.path.is_some() || self.max_bytes.is_some() || self.backup_count.is_some() {
                    return Err(invalid("console sinks only accept 'stream'"));
                }
                Ok(SinkTarget::Console(self.stream.unwrap_or_default()))
            }
            SinkKind::File => {
                if self.stream.is_some() || self.max_bytes.is_some() || self.backup_count.is_some()
                {
                    return Err(invalid("file sinks only accept 'path'"));
                }
                Ok(SinkTarget::File(require_path()?))
            }
            SinkKind::RotatingFile => {
                if self.stream.is_some() {
                    return Err(invalid("rotating_file sinks do not accept 'stream'"));
                }
                let max_bytes = self
                    .max_bytes
                    .ok_or_else(|| invalid("'max_bytes' is required for rotating_file sinks"))?;
                if max_bytes == 0 {
                    return Err(invalid("'max_bytes' must be greater than 0"));
                }
                Ok(SinkTarget::RotatingFile {
                    path: require_path()?,
                    max_bytes,
                    backup_count: self.backup_count.unwrap_or(0),
                })
            }
            SinkKind::Memory => {
                if self.stream.is_some()
                    || self.path.is_some()
                    || self.max_bytes.is_some()
                    || self.backup_count.is_some()
                {
                    return Err(invalid("memory sinks take no target fields"));
                }
                Ok(SinkTarget::Memory)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Records below this level are dropped for this route.
    #[serde(default)]
    pub level: Level,
    pub sinks: Vec<String>,
    /// Also deliver to the sinks of less specific matching routes.
    #[serde(default)]
    pub propagate: bool,
}

impl RouteConfig {
    #[must_use]
    pub fn new(level: Level, sinks: &[&str]) -> Self {
        Self {
            level,
            sinks: sinks.iter().map(|s| (*s).to_string()).collect(),
            propagate: false,
        }
    }
}

impl AggregatorConfig {
    /// A configuration with no formatters, sinks or routes and default timing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            formatters: BTreeMap::new(),
            sinks: BTreeMap::new(),
            routes: BTreeMap::new(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            socket_path: None,
            diagnostics_level: default_diagnostics_level(),
        }
    }

    /// Everything to stderr with the default template.
    #[must_use]
    pub fn console() -> Self {
        let mut config = Self::empty();
        config
            .sinks
            .insert("console".to_string(), SinkConfig::new(SinkKind::Console));
        config.routes.insert(
            ROOT_ROUTE.to_string(),
            RouteConfig::new(Level::Debug, &["console"]),
        );
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Loads from the file named by `LOG_AGGREGATOR_CONFIG`, or else from the
    /// inline JSON in `LOG_AGGREGATOR_CONFIG_JSON`.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match env::var(CONFIG_JSON_ENV) {
            Ok(json) => Self::from_json_str(&json),
            Err(_) => Err(ConfigError::Missing),
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks every cross-reference and value range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        for (name, template) in &self.formatters {
            Template::compile(template).map_err(|reason| ConfigError::InvalidTemplate {
                name: name.clone(),
                reason,
            })?;
        }

        for (name, sink) in &self.sinks {
            sink.target(name)?;
            if let Some(formatter) = &sink.formatter {
                if !self.formatters.contains_key(formatter) {
                    return Err(ConfigError::UnknownFormatter {
                        sink: name.clone(),
                        formatter: formatter.clone(),
                    });
                }
            }
        }

        if !self.routes.contains_key(ROOT_ROUTE) {
            return Err(ConfigError::MissingRoot);
        }
        for (prefix, route) in &self.routes {
            if prefix.is_empty() || prefix.starts_with('.') || prefix.ends_with('.') {
                return Err(ConfigError::InvalidValue {
                    field: format!("routes.{prefix}"),
                    reason: "logger prefixes are non-empty dotted names".to_string(),
                });
            }
            for sink in &route.sinks {
                if !self.sinks.contains_key(sink) {
                    return Err(ConfigError::UnknownSink {
                        route: prefix.clone(),
                        sink: sink.clone(),
                    });
                }
            }
        }

        if let Some(path) = &self.socket_path {
            #[cfg(unix)]
            crate::transport::validate_socket_path(path).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "socket_path".to_string(),
                    reason: e.to_string(),
                }
            })?;
            #[cfg(not(unix))]
            let _ = path;
        }

        Ok(())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Worker-side logging configuration, handed to every spawned worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Events below this level are not forwarded.
    #[serde(default)]
    pub level: Level,
    /// Also print events locally on stderr.
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_echo_level")]
    pub echo_level: Level,
}

const fn default_echo_level() -> Level {
    Level::Warning
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            level: Level::Debug,
            echo: false,
            echo_level: default_echo_level(),
        }
    }
}
