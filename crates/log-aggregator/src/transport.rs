// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix Domain Socket transport carrying channel messages between processes.
//!
//! Each message is one line of JSON. A worker holds a [`SocketProducer`] and
//! writes whole frames under a lock, so frames from its threads never
//! interleave. The listener side runs a [`SocketBridge`] that accepts any
//! number of producer connections and forwards every decoded frame into the
//! in-process channel the listener consumes. On stop the bridge drains: frames
//! a producer wrote before the stop are still forwarded.

use std::io::{self, Write};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelEndpoint, ChannelSender, Message};
use crate::error::ChannelError;

/// Largest accepted frame. Longer lines are discarded with a warning.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Unix socket paths are limited to 108 bytes on Linux; keep a margin.
const MAX_SOCKET_PATH_BYTES: usize = 100;

/// Checks that `path` is usable as a Unix socket path.
pub fn validate_socket_path(path: &Path) -> io::Result<()> {
    let raw = path.as_os_str().as_encoded_bytes();
    if raw.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot be empty",
        ));
    }
    if raw.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot contain null bytes",
        ));
    }
    if raw.len() > MAX_SOCKET_PATH_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Unix socket path too long: {} bytes (maximum {MAX_SOCKET_PATH_BYTES} bytes). Path: {}",
                raw.len(),
                path.display()
            ),
        ));
    }
    Ok(())
}

/// Generates a socket path unique to this process.
///
/// `<tmp>/log-aggregator-{PID}-{RANDOM}.sock`, where the random suffix guards
/// against collisions when pids are reused.
pub fn generate_socket_path() -> io::Result<PathBuf> {
    let random_suffix = fastrand::u32(..0x0100_0000);
    let path = std::env::temp_dir().join(format!(
        "log-aggregator-{}-{random_suffix:06x}.sock",
        std::process::id()
    ));
    validate_socket_path(&path)?;
    Ok(path)
}

/// Worker end of a socket channel.
#[derive(Debug)]
pub struct SocketProducer {
    path: PathBuf,
    stream: Mutex<Option<StdUnixStream>>,
}

impl SocketProducer {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = StdUnixStream::connect(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            stream: Mutex::new(Some(stream)),
        })
    }

    /// Writes one frame. A failed write closes the producer for good.
    pub fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');

        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = guard.as_mut() else {
            return Err(ChannelError::Closed);
        };
        if stream.write_all(&frame).is_err() {
            // The listener is gone; half-written frames are dropped by the
            // bridge when the connection resets.
            *guard = None;
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Listener end of a socket channel.
///
/// The socket is bound synchronously in [`SocketBridge::bind`] so that a bad
/// path is reported to whoever starts the listener; accepting connections
/// happens later inside the listener's runtime.
#[derive(Debug)]
pub struct SocketBridge {
    listener: StdUnixListener,
    path: PathBuf,
}

impl SocketBridge {
    pub fn bind(path: &Path) -> io::Result<Self> {
        validate_socket_path(path)?;
        let listener = StdUnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        debug!("Log channel socket bound at {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> ChannelEndpoint {
        ChannelEndpoint::new(self.path.clone())
    }

    /// Accepts producer connections and forwards every frame into `sink`
    /// until `stopping` fires, then drains.
    ///
    /// Draining stops accepting once the backlog stays empty for
    /// [`DRAIN_QUIET`] and lets every connection deliver what it already
    /// wrote: a connection is done at EOF, after [`DRAIN_QUIET`] without a
    /// frame, or at [`DRAIN_DEADLINE`]. Returns once every connection is done
    /// and the socket file is removed, which drops the last clone of `sink`.
    pub async fn serve(self, sink: ChannelSender, stopping: CancellationToken) {
        let guard = SocketFileGuard(self.path.clone());
        let listener = match UnixListener::from_std(self.listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to register log channel socket: {e}");
                return;
            }
        };
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = stopping.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        trace!("Producer connected to log channel");
                        connections.spawn(forward_frames(stream, sink.clone(), stopping.clone()));
                    }
                    Err(e) => {
                        warn!("Failed to accept producer connection: {e}");
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Producers that connected before the stop may still sit in the backlog.
        let accept_deadline = Instant::now() + DRAIN_DEADLINE;
        loop {
            let quiet_until = (Instant::now() + DRAIN_QUIET).min(accept_deadline);
            let Ok(accepted) = tokio::time::timeout_at(quiet_until, listener.accept()).await else {
                break;
            };
            match accepted {
                Ok((stream, _)) => {
                    connections.spawn(forward_frames(stream, sink.clone(), stopping.clone()));
                }
                Err(e) => {
                    warn!("Failed to accept producer connection while draining: {e}");
                    break;
                }
            }
        }
        drop(listener);
        drop(guard);

        let pending = connections.len();
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("Log channel connection task failed: {e}");
            }
        }
        debug!("Log channel socket closed after draining {pending} connections");
    }
}

/// Quiet period after which a draining connection or backlog counts as empty.
pub const DRAIN_QUIET: Duration = Duration::from_millis(100);

/// Upper bound on draining a single producer connection.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

struct SocketFileGuard(PathBuf);

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

type Frame = Option<Result<String, LinesCodecError>>;

async fn forward_frames(stream: UnixStream, sink: ChannelSender, stopping: CancellationToken) {
    let mut frames = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    loop {
        // Dropping an unfinished `next()` keeps partial lines in the codec buffer.
        let next = tokio::select! {
            () = stopping.cancelled() => break,
            next = frames.next() => next,
        };
        if !forward(next, &sink) {
            return;
        }
    }

    let deadline = Instant::now() + DRAIN_DEADLINE;
    loop {
        let quiet_until = (Instant::now() + DRAIN_QUIET).min(deadline);
        let Ok(next) = tokio::time::timeout_at(quiet_until, frames.next()).await else {
            if Instant::now() >= deadline {
                warn!(
                    "Producer still writing after {:.1}s of draining, closing its connection",
                    DRAIN_DEADLINE.as_secs_f64()
                );
            }
            return;
        };
        if !forward(next, &sink) {
            return;
        }
    }
}

/// Forwards one decoded frame. Returns `false` once the connection is done.
fn forward(next: Frame, sink: &ChannelSender) -> bool {
    match next {
        None => false,
        Some(Ok(line)) => {
            if line.trim().is_empty() {
                return true;
            }
            match serde_json::from_str::<Message>(&line) {
                // Nothing a producer writes after its sentinel is forwarded.
                Ok(Message::Sentinel) => {
                    let _ = sink.put(Message::Sentinel);
                    false
                }
                // A closed sink means the listener is gone.
                Ok(message) => sink.put(message).is_ok(),
                Err(e) => {
                    warn!("Dropping malformed log frame: {e}");
                    true
                }
            }
        }
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            warn!("Dropping log frame larger than {MAX_FRAME_BYTES} bytes");
            true
        }
        Some(Err(LinesCodecError::Io(e))) => {
            debug!("Producer connection closed: {e}");
            false
        }
    }
}
