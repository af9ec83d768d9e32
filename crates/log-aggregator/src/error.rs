// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors returned when putting a message on the log channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Log channel is closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors found while loading or validating the aggregator configuration.
///
/// All of these are fatal at listener start: the service never reaches
/// `Running` without a valid sink configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No configuration provided: set LOG_AGGREGATOR_CONFIG or LOG_AGGREGATOR_CONFIG_JSON")]
    Missing,

    #[error("Routing has no 'root' entry")]
    MissingRoot,

    #[error("Sink '{sink}' references unknown formatter '{formatter}'")]
    UnknownFormatter { sink: String, formatter: String },

    #[error("Route '{route}' references unknown sink '{sink}'")]
    UnknownSink { route: String, sink: String },

    #[error("Invalid template for '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to open sink '{sink}': {source}")]
    SinkOpen {
        sink: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the worker-side logging front.
#[derive(Debug, thiserror::Error)]
pub enum FrontError {
    #[error("No log channel provided: the aggregation lifecycle was not initialized for this worker")]
    MissingChannel,

    #[error("Worker logging is already forwarding to channel '{installed}', refusing to attach '{requested}'")]
    NestedAggregation { installed: String, requested: String },

    #[error("A global tracing subscriber is already installed by another component")]
    SubscriberAlreadySet,

    #[error("Failed to connect to log channel at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

/// Errors raised by the process-wide aggregation lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Log aggregation is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Front(#[from] FrontError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn listener process {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener exited before it became ready")]
    ListenerExited,
}
