// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker-side logging front.
//!
//! A worker installs [`ForwardingLayer`] once, through
//! [`WorkerLogFront::configure`]. From then on every `tracing` event in the
//! process becomes a [`LogRecord`] put on the shared channel instead of being
//! written locally.
//!
//! Event fields with a special meaning:
//!
//! | field            | effect                                               |
//! |------------------|------------------------------------------------------|
//! | `message`        | the record message                                   |
//! | `severity`       | overrides the level (`"CRITICAL"`, `"WARNING"`, ...) |
//! | `logger`         | overrides the logger name derived from the target    |
//! | `exception`      | fills [`ExceptionInfo::message`] (`error` also works) |
//! | `exception_kind` | fills [`ExceptionInfo::kind`]                        |
//!
//! Any other field is appended to the message as `name=value`.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::channel::{ChannelId, ChannelSender};
use crate::config::WorkerConfig;
use crate::error::FrontError;
use crate::record::{ExceptionInfo, Level, LogRecord};

/// Events from this crate are never forwarded, so the aggregator cannot feed
/// its own diagnostics back into the channel.
const OWN_TARGET: &str = "log_aggregator";

#[derive(Debug)]
struct Target {
    sender: ChannelSender,
    level: Level,
}

type Slot = Arc<RwLock<Option<Target>>>;

/// `tracing` layer that turns events into [`LogRecord`]s on a log channel.
#[derive(Debug)]
pub struct ForwardingLayer {
    slot: Slot,
    dropped: Arc<AtomicU64>,
}

impl ForwardingLayer {
    /// Forwards events at `level` and above to `sender`.
    #[must_use]
    pub fn new(sender: ChannelSender, level: Level) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(Target { sender, level }))),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of events that could not be put on the channel.
    #[must_use]
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn slot(&self) -> Slot {
        Arc::clone(&self.slot)
    }
}

impl<S> Layer<S> for ForwardingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_own_target(metadata.target()) {
            return;
        }

        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let Some(target) = slot.as_ref() else {
            return;
        };

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = visitor
            .severity
            .unwrap_or_else(|| Level::from_tracing(metadata.level()));
        if level < target.level {
            return;
        }

        let logger = visitor
            .logger
            .take()
            .unwrap_or_else(|| logger_name(metadata.target()));
        let mut record = LogRecord::new(level, logger, visitor.message());
        if let Some(exception) = visitor.exception() {
            record = record.with_exception(exception);
        }

        // Logging is best-effort for the application.
        if target.sender.put_record(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// This crate or one of its modules, not a crate whose name merely starts
/// the same way.
fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// `my_app::db::pool` becomes `my_app.db.pool`.
fn logger_name(target: &str) -> String {
    target.replace("::", ".")
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    severity: Option<Level>,
    logger: Option<String>,
    exception: Option<String>,
    exception_kind: Option<String>,
    extra: String,
}

impl RecordVisitor {
    fn message(&mut self) -> String {
        let mut message = self.message.take().unwrap_or_default();
        if !self.extra.is_empty() {
            if message.is_empty() {
                message = self.extra.trim_start().to_string();
            } else {
                message.push_str(&self.extra);
            }
        }
        message
    }

    fn exception(&mut self) -> Option<ExceptionInfo> {
        let message = self.exception.take()?;
        Some(ExceptionInfo {
            kind: self.exception_kind.take(),
            message,
        })
    }

    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "severity" => match Level::from_str(&value) {
                Ok(level) => self.severity = Some(level),
                Err(_) => self.push_extra(field, &value),
            },
            "logger" => self.logger = Some(value),
            "exception" | "error" => self.exception = Some(value),
            "exception_kind" => self.exception_kind = Some(value),
            _ => self.push_extra(field, &value),
        }
    }

    fn push_extra(&mut self, field: &Field, value: &str) {
        let _ = write!(self.extra, " {}={value}", field.name());
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.set(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field, format!("{value:?}"));
    }
}

#[derive(Debug)]
struct Installed {
    slot: Slot,
    dropped: Arc<AtomicU64>,
}

/// At most one forwarding layer per process.
static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

/// Handle on the forwarding layer installed in this process.
#[derive(Clone, Debug)]
pub struct WorkerLogFront {
    channel: ChannelId,
    dropped: Arc<AtomicU64>,
}

impl WorkerLogFront {
    /// Redirects this process' `tracing` events into `channel`.
    ///
    /// Idempotent: configuring again with the same channel returns the
    /// existing front and attaches nothing new. A front whose channel has
    /// been closed (its listener stopped) is retargeted to the new channel.
    ///
    /// # Errors
    ///
    /// - [`FrontError::MissingChannel`] if `channel` is `None` or already
    ///   closed.
    /// - [`FrontError::NestedAggregation`] if the process already forwards to
    ///   a different, still open, channel.
    /// - [`FrontError::SubscriberAlreadySet`] if some other component owns
    ///   the global subscriber.
    pub fn configure(
        channel: Option<ChannelSender>,
        config: &WorkerConfig,
    ) -> Result<Self, FrontError> {
        let channel = channel
            .filter(|sender| !sender.is_closed())
            .ok_or(FrontError::MissingChannel)?;

        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(installed) = installed.as_ref() {
            let mut slot = installed.slot.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = slot.as_ref() {
                if current.sender.id() == channel.id() {
                    return Ok(Self {
                        channel: channel.id().clone(),
                        dropped: Arc::clone(&installed.dropped),
                    });
                }
                if !current.sender.is_closed() {
                    return Err(FrontError::NestedAggregation {
                        installed: current.sender.id().to_string(),
                        requested: channel.id().to_string(),
                    });
                }
            }
            let id = channel.id().clone();
            *slot = Some(Target {
                sender: channel,
                level: config.level,
            });
            return Ok(Self {
                channel: id,
                dropped: Arc::clone(&installed.dropped),
            });
        }

        let id = channel.id().clone();
        let layer = ForwardingLayer::new(channel, config.level);
        let slot = layer.slot();
        let dropped = layer.dropped_counter();

        let echo = config.echo.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(config.echo_level.as_level_filter())
        });

        tracing_subscriber::registry()
            .with(layer)
            .with(echo)
            .try_init()
            .map_err(|_| FrontError::SubscriberAlreadySet)?;

        *installed = Some(Installed {
            slot,
            dropped: Arc::clone(&dropped),
        });
        Ok(Self {
            channel: id,
            dropped,
        })
    }

    /// Configures the front from the bootstrap a parent process placed in
    /// the environment. This is the one call a spawned worker makes.
    #[cfg(unix)]
    pub fn configure_from_env() -> Result<Self, FrontError> {
        let bootstrap = crate::lifecycle::WorkerBootstrap::from_env()?;
        let sender = ChannelSender::connect(&bootstrap.endpoint).map_err(|source| {
            FrontError::Connect {
                path: bootstrap.endpoint.socket_path.clone(),
                source,
            }
        })?;
        Self::configure(Some(sender), &bootstrap.worker_config)
    }

    /// Stops forwarding. The layer stays installed but drops every event
    /// until the next [`WorkerLogFront::configure`].
    pub fn detach() -> bool {
        let installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        match installed.as_ref() {
            Some(installed) => installed
                .slot
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some(),
            None => false,
        }
    }

    /// Identity of the channel events are forwarded to.
    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel
    }

    /// Events that could not be put on the channel since the layer was
    /// installed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
