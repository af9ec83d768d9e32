// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Same-host log aggregation.
//!
//! Many worker processes, each possibly multi-threaded, log through a
//! [`front::WorkerLogFront`] that puts every event on a shared
//! [`channel`]. A single [`listener::ListenerService`] owns the output
//! [`sink`]s and routes each record through the [`router::SinkRouter`].
//! The [`lifecycle::AggregationLifecycle`] ties the pieces together for a
//! process tree.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod channel;
pub mod config;
pub mod error;
pub mod format;
pub mod front;
#[cfg(unix)]
pub mod lifecycle;
pub mod listener;
pub mod logger;
pub mod record;
pub mod router;
pub mod sink;
#[cfg(unix)]
pub mod transport;

pub use channel::{log_channel, ChannelEndpoint, ChannelReceiver, ChannelSender, Message, Received};
pub use config::{AggregatorConfig, WorkerConfig};
pub use error::{ChannelError, ConfigError, FrontError, LifecycleError};
pub use front::WorkerLogFront;
#[cfg(unix)]
pub use lifecycle::{AggregationLifecycle, ListenerPlacement, WorkerBootstrap};
pub use listener::{ListenerHandle, ListenerService, ListenerState, StopReason};
pub use record::{ExceptionInfo, Level, LogRecord};
