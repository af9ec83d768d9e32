// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-producer, single-consumer transport of log records.
//!
//! ```text
//!    ┌──────────────┐   ┌──────────────┐
//!    │ ChannelSender│   │ ChannelSender│  (any thread, any worker process)
//!    │   (Local)    │   │   (Socket)   │
//!    └──────┬───────┘   └──────┬───────┘
//!           │                  │ JSON frame per message
//!           │           ┌──────v───────┐
//!           │           │ SocketBridge │  (runs beside the listener)
//!           │           └──────┬───────┘
//!           v                  v
//!    ┌─────────────────────────────────┐
//!    │         ChannelReceiver         │  (the listener, exactly one)
//!    └─────────────────────────────────┘
//! ```
//!
//! Every message is fully built before it is enqueued, and enqueueing is a
//! single operation on the underlying transport, so concurrent producers can
//! never interleave partial records. There is no global order across
//! producers; messages from one sender are received in the order they were
//! put.
//!
//! The channel is unbounded: `put` never blocks on a slow consumer. Once the
//! receiver is closed, `put` fails with [`ChannelError::Closed`].

use std::path::PathBuf;
#[cfg(unix)]
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::record::LogRecord;

/// What travels on the channel: a record, or the shutdown sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum Message {
    Record(Box<LogRecord>),
    /// No more records will be processed once this is consumed.
    Sentinel,
}

/// Result of one [`ChannelReceiver::get`] call.
#[derive(Debug, PartialEq)]
pub enum Received {
    Record(Box<LogRecord>),
    Sentinel,
    /// The timeout expired with nothing to read. Not an error.
    Empty,
}

/// Identity of a channel, used to tell two channels apart across processes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    fn local() -> Self {
        Self(format!(
            "local-{}-{:06x}",
            std::process::id(),
            fastrand::u32(..0x0100_0000)
        ))
    }

    pub(crate) fn socket(path: &std::path::Path) -> Self {
        Self(format!("unix:{}", path.display()))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a process outside the listener reaches the channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    pub socket_path: PathBuf,
}

impl ChannelEndpoint {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        ChannelId::socket(&self.socket_path)
    }
}

#[derive(Clone, Debug)]
enum SenderKind {
    Local(mpsc::UnboundedSender<Message>),
    #[cfg(unix)]
    Socket(Arc<crate::transport::SocketProducer>),
}

/// Producer end of the log channel. Cheap to clone and share across threads.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    kind: SenderKind,
    id: ChannelId,
}

impl ChannelSender {
    /// Connects to a channel owned by another process.
    #[cfg(unix)]
    pub fn connect(endpoint: &ChannelEndpoint) -> std::io::Result<Self> {
        let producer = crate::transport::SocketProducer::connect(&endpoint.socket_path)?;
        Ok(Self {
            kind: SenderKind::Socket(Arc::new(producer)),
            id: endpoint.id(),
        })
    }

    /// Enqueues a message without blocking on the consumer.
    pub fn put(&self, message: Message) -> Result<(), ChannelError> {
        match &self.kind {
            SenderKind::Local(tx) => tx.send(message).map_err(|_| ChannelError::Closed),
            #[cfg(unix)]
            SenderKind::Socket(producer) => producer.send(&message),
        }
    }

    pub fn put_record(&self, record: LogRecord) -> Result<(), ChannelError> {
        self.put(Message::Record(Box::new(record)))
    }

    /// Asks the listener to stop by enqueueing the sentinel.
    ///
    /// Usable from any process holding a sender. Records put before this call
    /// are still routed.
    pub fn request_shutdown(&self) -> Result<(), ChannelError> {
        self.put(Message::Sentinel)
    }

    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.kind {
            SenderKind::Local(tx) => tx.is_closed(),
            #[cfg(unix)]
            SenderKind::Socket(producer) => producer.is_closed(),
        }
    }
}

/// Consumer end of the log channel. There is exactly one per channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    id: ChannelId,
}

/// Creates a new in-process log channel.
#[must_use]
pub fn log_channel() -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = ChannelId::local();
    (
        ChannelSender {
            kind: SenderKind::Local(tx),
            id: id.clone(),
        },
        ChannelReceiver { rx, id },
    )
}

impl ChannelReceiver {
    /// Waits up to `timeout` for the next message.
    ///
    /// Returns [`Received::Empty`] when the timeout expires so the caller can
    /// re-check its own state and poll again.
    pub async fn get(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(Message::Record(record))) => Received::Record(record),
            Ok(Some(Message::Sentinel)) => Received::Sentinel,
            // Every producer is gone, nothing more can arrive.
            Ok(None) => Received::Sentinel,
            Err(_) => Received::Empty,
        }
    }

    /// Waits for the next message with no timeout. `None` once every
    /// producer is gone and the queue is empty.
    pub(crate) async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Closes the channel to new messages and discards whatever is still
    /// queued, returning how many records were discarded.
    pub fn close(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while let Ok(message) = self.rx.try_recv() {
            if matches!(message, Message::Record(_)) {
                discarded += 1;
            }
        }
        discarded
    }

    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.id
    }
}
