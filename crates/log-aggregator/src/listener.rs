// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The aggregation service: drains the log channel into the sink router.
//!
//! # States
//!
//! ```text
//!  Starting ──> Running ──> Draining ──> Stopped
//! ```
//!
//! - **Starting**: the router is built from the configuration. Any error is
//!   returned from [`ListenerService::new`] and the service never runs.
//! - **Running**: the consumer loop polls the channel, routes each record
//!   and records the time of the last consumed record.
//! - **Draining**: the sentinel was consumed. The channel is closed and
//!   anything still queued behind the sentinel is discarded. When a socket is
//!   served, frames producers already wrote are still read and routed. Sinks
//!   are flushed last.
//! - **Stopped**: terminal.
//!
//! # Stopping
//!
//! An explicit [`ListenerHandle::stop`], the idle watchdog, and a sentinel
//! put by another process all go through one transition: the first one to
//! flip `shutdown_requested` enqueues the sentinel, later ones are no-ops.
//! Records put before that sentinel are still routed.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let (service, handle) = ListenerService::new(&config)?;
//! let handle = service.spawn_dedicated()?;
//!
//! handle.sender().put_record(LogRecord::new(Level::Info, "app", "hello"))?;
//! handle.stop();
//! ```

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    log_channel, ChannelEndpoint, ChannelReceiver, ChannelSender, Message, Received,
};
use crate::config::AggregatorConfig;
use crate::error::ConfigError;
use crate::record::Level;
use crate::router::{RouteOutcome, SinkRouter};
use crate::sink::{MemoryBuffer, Sink};

/// Name of the OS thread created by [`ListenerService::spawn_dedicated`].
pub const LISTENER_THREAD_NAME: &str = "log-aggregator-listener";

/// Upper bound on reading socket producers after the sentinel.
const SOCKET_DRAIN_LIMIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Why the listener stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// [`ListenerHandle::stop`] or [`ListenerHandle::request_stop`].
    Requested,
    /// The idle watchdog saw no records for longer than the idle timeout.
    IdleTimeout,
    /// A sentinel arrived on the channel from a producer.
    Sentinel,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StopReason::Requested => "stop requested",
            StopReason::IdleTimeout => "idle timeout",
            StopReason::Sentinel => "sentinel received",
        })
    }
}

/// Counters describing what the listener did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Records that passed routing (whether or not every sink accepted them).
    pub routed: u64,
    /// Records dropped by a route threshold.
    pub filtered: u64,
    /// Failed sink writes.
    pub sink_failures: u64,
    /// Records still queued behind the sentinel (or left on a socket that
    /// did not drain in time), never routed.
    pub dropped_after_stop: u64,
}

#[derive(Debug, Default)]
struct Counters {
    routed: AtomicU64,
    filtered: AtomicU64,
    sink_failures: AtomicU64,
    dropped_after_stop: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: RouteOutcome) {
        if outcome.filtered {
            self.filtered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routed.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.failed > 0 {
            self.sink_failures
                .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            routed: self.routed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            dropped_after_stop: self.dropped_after_stop.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct StateCell {
    state: Mutex<ListenerState>,
    changed: Condvar,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(ListenerState::Starting),
            changed: Condvar::new(),
        }
    }

    fn get(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves forward to `next`. Transitions never go backwards.
    fn advance(&self, next: ListenerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next > *state {
            *state = next;
            self.changed.notify_all();
        }
    }

    fn wait_for(&self, target: ListenerState, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state < target {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

/// State shared by the service, its watchdog and every handle.
#[derive(Debug)]
struct Control {
    shutdown_requested: AtomicBool,
    /// Set once the service has been handed to a runtime.
    launched: AtomicBool,
    stop_reason: OnceLock<StopReason>,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    sender: ChannelSender,
    state: StateCell,
    counters: Counters,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Control {
    /// The single stop transition. Returns `true` for the call that won.
    fn request_stop(&self, reason: StopReason) -> bool {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.stop_reason.set(reason);
        if self.sender.request_shutdown().is_err() {
            debug!("Log listener channel already closed, sentinel not needed");
        }
        true
    }

    /// Records a sentinel that arrived without a local stop request.
    fn observe_sentinel(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        let _ = self.stop_reason.set(StopReason::Sentinel);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(elapsed, Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Marks the listener stopped however its run ends, including when the
/// service is dropped without ever running.
#[derive(Debug)]
struct Lifeline(Arc<Control>);

impl Drop for Lifeline {
    fn drop(&mut self) {
        self.0.state.advance(ListenerState::Stopped);
    }
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    poll_interval: Duration,
    idle_timeout: Duration,
    watchdog_interval: Duration,
}

/// Handle for observing and stopping a listener. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    control: Arc<Control>,
    endpoint: Option<ChannelEndpoint>,
}

impl ListenerHandle {
    /// A producer for this listener's channel.
    #[must_use]
    pub fn sender(&self) -> ChannelSender {
        self.control.sender.clone()
    }

    /// Socket endpoint for other processes, when the listener serves one.
    #[must_use]
    pub fn endpoint(&self) -> Option<&ChannelEndpoint> {
        self.endpoint.as_ref()
    }

    /// Asks the listener to stop without waiting. Returns `true` if this call
    /// performed the stop transition.
    pub fn request_stop(&self) -> bool {
        self.control.request_stop(StopReason::Requested)
    }

    /// Stops the listener and blocks until it has fully exited.
    ///
    /// Safe to call any number of times from any thread. Must not be called
    /// from inside the listener's own runtime. A service that was never run
    /// has nothing to wait for: the sentinel stays queued and the service
    /// stops right after routing what came before it, if it ever runs.
    pub fn stop(&self) {
        self.request_stop();
        if !self.control.launched.load(Ordering::Acquire) {
            return;
        }
        self.wait_stopped(None);
        let thread = self
            .control
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Log listener thread panicked");
            }
        }
    }

    /// Blocks until the listener is stopped or `timeout` expires.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        self.control.state.wait_for(ListenerState::Stopped, timeout)
    }

    /// Blocks until the listener is running (or already past it).
    pub fn wait_running(&self, timeout: Option<Duration>) -> bool {
        self.control.state.wait_for(ListenerState::Running, timeout)
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.control.state.get()
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.control.is_shutdown_requested()
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.control.stop_reason.get().copied()
    }

    /// Time since the last consumed record (or since start).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.control.idle_for()
    }

    #[must_use]
    pub fn stats(&self) -> ListenerStats {
        self.control.counters.snapshot()
    }
}

/// The consumer side of log aggregation. Owns the router and its sinks.
pub struct ListenerService {
    router: SinkRouter,
    receiver: ChannelReceiver,
    timing: Timing,
    diagnostics_level: Level,
    lifeline: Lifeline,
    #[cfg(unix)]
    bridge: Option<crate::transport::SocketBridge>,
}

impl std::fmt::Debug for ListenerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerService")
            .field("router", &self.router)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl ListenerService {
    /// Applies `config` and creates the channel. Fails fast if any sink
    /// cannot be configured.
    ///
    /// Returns the service (to be run) and a handle (to feed and stop it).
    pub fn new(config: &AggregatorConfig) -> Result<(Self, ListenerHandle), ConfigError> {
        let router = SinkRouter::from_config(config)?;
        let (sender, receiver) = log_channel();

        let control = Arc::new(Control {
            shutdown_requested: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            stop_reason: OnceLock::new(),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            sender,
            state: StateCell::new(),
            counters: Counters::default(),
            thread: Mutex::new(None),
        });

        let service = Self {
            router,
            receiver,
            timing: Timing {
                poll_interval: config.poll_interval(),
                idle_timeout: config.idle_timeout(),
                watchdog_interval: config.watchdog_interval(),
            },
            diagnostics_level: config.diagnostics_level,
            lifeline: Lifeline(Arc::clone(&control)),
            #[cfg(unix)]
            bridge: None,
        };
        let handle = ListenerHandle {
            control,
            endpoint: None,
        };

        Ok((service, handle))
    }

    /// Also accepts producers from other processes on a Unix socket at
    /// `path`. The socket is bound before this returns.
    #[cfg(unix)]
    pub fn bind_socket(
        &mut self,
        path: &std::path::Path,
    ) -> io::Result<ChannelEndpoint> {
        let bridge = crate::transport::SocketBridge::bind(path)?;
        let endpoint = bridge.endpoint();
        self.bridge = Some(bridge);
        Ok(endpoint)
    }

    #[must_use]
    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            control: Arc::clone(&self.lifeline.0),
            #[cfg(unix)]
            endpoint: self.bridge.as_ref().map(crate::transport::SocketBridge::endpoint),
            #[cfg(not(unix))]
            endpoint: None,
        }
    }

    /// Buffer of the memory sink called `name`, if configured.
    #[must_use]
    pub fn memory_buffer(&self, name: &str) -> Option<MemoryBuffer> {
        self.router.memory_buffer(name)
    }

    /// Plugs a custom implementation in place of the configured sink `name`.
    pub fn replace_sink(&mut self, name: &str, sink: Box<dyn Sink>) -> bool {
        self.router.replace_sink(name, sink)
    }

    /// Runs the consumer loop and the idle watchdog until stopped.
    ///
    /// The service counts as running for [`ListenerHandle::stop`] from the
    /// moment this is called, before the returned future is first polled.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        self.lifeline.0.launched.store(true, Ordering::Release);
        self.consume()
    }

    async fn consume(self) {
        let Self {
            mut router,
            mut receiver,
            timing,
            lifeline,
            #[cfg(unix)]
            bridge,
            ..
        } = self;
        let control = Arc::clone(&lifeline.0);
        let stopping = CancellationToken::new();

        // Socket frames get their own queue so they can still be drained
        // after the local channel is closed.
        let mut bridged: Option<ChannelReceiver> = None;
        #[cfg(unix)]
        if let Some(bridge) = bridge {
            let (sink, socket) = log_channel();
            tokio::spawn(bridge.serve(sink, stopping.clone()));
            bridged = Some(socket);
        }

        control.touch();
        control.state.advance(ListenerState::Running);
        debug!("Log listener running");

        let watchdog = tokio::spawn(watchdog(Arc::clone(&control), timing, stopping.clone()));

        loop {
            match next_message(&mut receiver, &mut bridged, timing.poll_interval).await {
                Received::Record(record) => {
                    let outcome = router.route(&record);
                    control.counters.record(outcome);
                    control.touch();
                }
                Received::Empty => {
                    // The sentinel of a stop request is queued behind the
                    // records put before it; a full empty poll after the
                    // request means nothing is left to drain.
                    if control.is_shutdown_requested() {
                        break;
                    }
                }
                Received::Sentinel => {
                    control.observe_sentinel();
                    break;
                }
            }
        }

        control.state.advance(ListenerState::Draining);
        stopping.cancel();

        let mut discarded = receiver.close();
        if let Some(mut socket) = bridged {
            let drained = tokio::time::timeout(
                SOCKET_DRAIN_LIMIT,
                drain_socket(&mut socket, &mut router, &control),
            )
            .await;
            match drained {
                Ok(0) => {}
                Ok(routed) => debug!("Routed {routed} socket records while draining"),
                Err(_) => warn!(
                    "Log channel socket did not drain within {:.1}s",
                    SOCKET_DRAIN_LIMIT.as_secs_f64()
                ),
            }
            discarded += socket.close();
        }
        if discarded > 0 {
            debug!("Discarded {discarded} log records queued after shutdown");
            control
                .counters
                .dropped_after_stop
                .fetch_add(discarded as u64, Ordering::Relaxed);
        }
        router.flush();
        let _ = watchdog.await;

        let reason = control
            .stop_reason
            .get()
            .copied()
            .unwrap_or(StopReason::Requested);
        let stats = control.counters.snapshot();
        info!(
            "Log listener stopped ({reason}): {} routed, {} filtered, {} sink failures",
            stats.routed, stats.filtered, stats.sink_failures
        );
        drop(lifeline);
    }

    /// Runs the service on its own OS thread with a dedicated runtime.
    ///
    /// The thread's diagnostics go to stderr through
    /// [`crate::logger::Formatter`], never to a forwarding layer.
    pub fn spawn_dedicated(self) -> io::Result<ListenerHandle> {
        let handle = self.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let diagnostics_level = self.diagnostics_level;
        // Stop must wait for the thread even before it reaches `run`.
        handle.control.launched.store(true, Ordering::Release);

        let thread = std::thread::Builder::new()
            .name(LISTENER_THREAD_NAME.to_string())
            .spawn(move || {
                let _diagnostics = tracing::subscriber::set_default(
                    crate::logger::diagnostic_subscriber(diagnostics_level),
                );
                runtime.block_on(self.run());
            })?;

        *handle
            .control
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Ok(handle)
    }
}

/// Next message from the local channel or, while a socket is served, from
/// the socket's queue. A socket queue whose bridge ended is dropped.
async fn next_message(
    receiver: &mut ChannelReceiver,
    bridged: &mut Option<ChannelReceiver>,
    poll_interval: Duration,
) -> Received {
    let Some(socket) = bridged.as_mut() else {
        return receiver.get(poll_interval).await;
    };
    let mut bridge_ended = false;
    let received = tokio::select! {
        received = receiver.get(poll_interval) => received,
        message = socket.recv() => match message {
            Some(Message::Record(record)) => Received::Record(record),
            Some(Message::Sentinel) => Received::Sentinel,
            None => {
                bridge_ended = true;
                Received::Empty
            }
        },
    };
    if bridge_ended {
        warn!("Log channel socket stopped accepting producers");
        *bridged = None;
    }
    received
}

/// Routes whatever the bridge still forwards until it is done.
async fn drain_socket(
    socket: &mut ChannelReceiver,
    router: &mut SinkRouter,
    control: &Control,
) -> u64 {
    let mut routed = 0;
    while let Some(message) = socket.recv().await {
        if let Message::Record(record) = message {
            control.counters.record(router.route(&record));
            routed += 1;
        }
    }
    routed
}

async fn watchdog(control: Arc<Control>, timing: Timing, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(timing.watchdog_interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if control.is_shutdown_requested() {
            break;
        }
        let idle = control.idle_for();
        if idle > timing.idle_timeout {
            warn!(
                "No log records received for {:.1}s (idle timeout {:.1}s), stopping listener",
                idle.as_secs_f64(),
                timing.idle_timeout.as_secs_f64()
            );
            control.request_stop(StopReason::IdleTimeout);
            break;
        }
    }
}
