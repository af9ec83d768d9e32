// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-tree wide coordination of log aggregation.
//!
//! The root process owns one [`AggregationLifecycle`]. It starts the listener
//! once, in its own process by default, forwards the root's own logging into
//! the channel, and hands every worker it spawns a [`WorkerBootstrap`]:
//!
//! ```rust,ignore
//! let lifecycle = AggregationLifecycle::default();
//! lifecycle.initialize_once(&listener_config, &WorkerConfig::default())?;
//!
//! let mut command = Command::new("worker");
//! lifecycle.propagate_to_new_worker()?.apply_to_command(&mut command)?;
//! command.spawn()?;
//!
//! // In the worker, before anything else:
//! WorkerLogFront::configure_from_env()?;
//! ```
//!
//! Dropping the lifecycle (or calling [`AggregationLifecycle::shutdown`])
//! stops the listener and waits for it to exit.

use std::env;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{ChannelEndpoint, ChannelSender};
use crate::config::{AggregatorConfig, WorkerConfig, CONFIG_JSON_ENV, CONFIG_PATH_ENV};
use crate::error::{FrontError, LifecycleError};
use crate::front::WorkerLogFront;
use crate::listener::{ListenerHandle, ListenerService};
use crate::transport::generate_socket_path;

/// Socket path of the channel, read by spawned workers.
pub const ENDPOINT_ENV: &str = "LOG_AGGREGATOR_ENDPOINT";
/// JSON [`WorkerConfig`], read by spawned workers.
pub const WORKER_CONFIG_ENV: &str = "LOG_AGGREGATOR_WORKER_CONFIG";
/// Socket path the listener process binds.
pub const SOCKET_ENV: &str = "LOG_AGGREGATOR_SOCKET";

/// Name of the standalone listener binary.
pub const LISTENER_PROGRAM: &str = "log-aggregator-listener";
/// Overrides where the default placement finds the listener binary.
pub const LISTENER_PROGRAM_ENV: &str = "LOG_AGGREGATOR_LISTENER_BIN";

const LISTENER_READY_TIMEOUT: Duration = Duration::from_secs(5);
const LISTENER_READY_POLL: Duration = Duration::from_millis(20);

/// Where the listener runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerPlacement {
    /// A named OS thread of the root process with its own runtime.
    DedicatedThread,
    /// A separate process running the listener binary at `program`.
    ChildProcess { program: PathBuf },
}

/// A child process running the binary found by [`locate_listener_program`].
impl Default for ListenerPlacement {
    fn default() -> Self {
        ListenerPlacement::ChildProcess {
            program: locate_listener_program(),
        }
    }
}

/// Finds the listener binary.
///
/// In order: the path in [`LISTENER_PROGRAM_ENV`], a [`LISTENER_PROGRAM`]
/// next to the current executable or one directory up (where cargo puts
/// binaries relative to test executables), then the bare name for a `PATH`
/// lookup.
#[must_use]
pub fn locate_listener_program() -> PathBuf {
    if let Some(program) = env::var_os(LISTENER_PROGRAM_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(program);
    }
    if let Ok(exe) = env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(LISTENER_PROGRAM);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(LISTENER_PROGRAM)
}

/// Everything a new worker needs to configure its [`WorkerLogFront`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerBootstrap {
    pub endpoint: ChannelEndpoint,
    pub worker_config: WorkerConfig,
}

impl WorkerBootstrap {
    /// Passes the bootstrap to a worker about to be spawned.
    pub fn apply_to_command<'a>(
        &self,
        command: &'a mut Command,
    ) -> Result<&'a mut Command, FrontError> {
        let worker_config = serde_json::to_string(&self.worker_config)?;
        Ok(command
            .env(ENDPOINT_ENV, &self.endpoint.socket_path)
            .env(WORKER_CONFIG_ENV, worker_config))
    }

    /// Reads the bootstrap a parent process placed in the environment.
    ///
    /// A missing endpoint means the worker was spawned without aggregation
    /// and is reported as [`FrontError::MissingChannel`]. A missing worker
    /// configuration falls back to the defaults.
    pub fn from_env() -> Result<Self, FrontError> {
        let socket_path = env::var_os(ENDPOINT_ENV)
            .filter(|path| !path.is_empty())
            .ok_or(FrontError::MissingChannel)?;

        let worker_config = match env::var(WORKER_CONFIG_ENV) {
            Ok(json) if !json.trim().is_empty() => serde_json::from_str(&json)?,
            _ => WorkerConfig::default(),
        };

        Ok(Self {
            endpoint: ChannelEndpoint::new(socket_path),
            worker_config,
        })
    }
}

#[derive(Debug)]
enum Listener {
    Thread(ListenerHandle),
    Process { child: Child, sender: ChannelSender },
}

#[derive(Debug)]
struct Active {
    bootstrap: WorkerBootstrap,
    listener: Listener,
}

#[derive(Debug)]
enum Phase {
    Uninitialized,
    Active(Active),
    TornDown,
}

/// Owner of the listener and of the shared channel for one process tree.
///
/// Methods take `&self` so the lifecycle can live in an `Arc` or a static
/// and be touched from several threads.
#[derive(Debug)]
pub struct AggregationLifecycle {
    placement: ListenerPlacement,
    phase: Mutex<Phase>,
}

impl Default for AggregationLifecycle {
    fn default() -> Self {
        Self::new(ListenerPlacement::default())
    }
}

impl AggregationLifecycle {
    #[must_use]
    pub fn new(placement: ListenerPlacement) -> Self {
        Self {
            placement,
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    /// Starts the listener and forwards this process' logging to it.
    ///
    /// Returns `Ok(true)` for the call that initialized, `Ok(false)` for
    /// every other call, including calls after [`Self::shutdown`]. Concurrent
    /// first calls are serialized; exactly one of them initializes.
    pub fn initialize_once(
        &self,
        listener_config: &AggregatorConfig,
        worker_config: &WorkerConfig,
    ) -> Result<bool, LifecycleError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*phase, Phase::Uninitialized) {
            return Ok(false);
        }

        listener_config.validate()?;
        let socket_path = match &listener_config.socket_path {
            Some(path) => path.clone(),
            None => generate_socket_path()?,
        };

        let (listener, root_sender, endpoint) = match &self.placement {
            ListenerPlacement::DedicatedThread => {
                let (mut service, _) = ListenerService::new(listener_config)?;
                let endpoint = service.bind_socket(&socket_path)?;
                let handle = service.spawn_dedicated()?;
                let sender = handle.sender();
                (Listener::Thread(handle), sender, endpoint)
            }
            ListenerPlacement::ChildProcess { program } => {
                let (child, sender) = spawn_listener_process(program, listener_config, &socket_path)?;
                let endpoint = ChannelEndpoint::new(socket_path.clone());
                (Listener::Process { child, sender: sender.clone() }, sender, endpoint)
            }
        };

        let bootstrap = WorkerBootstrap {
            endpoint,
            worker_config: worker_config.clone(),
        };

        if let Err(e) = WorkerLogFront::configure(Some(root_sender), worker_config) {
            stop_listener(listener);
            return Err(e.into());
        }

        info!(
            "Log aggregation initialized, channel at {}",
            bootstrap.endpoint.socket_path.display()
        );
        *phase = Phase::Active(Active {
            bootstrap,
            listener,
        });
        Ok(true)
    }

    /// The values a process-spawning collaborator passes to a new worker
    /// before it runs any user code.
    pub fn propagate_to_new_worker(&self) -> Result<WorkerBootstrap, LifecycleError> {
        match &*self.phase.lock().unwrap_or_else(PoisonError::into_inner) {
            Phase::Active(active) => Ok(active.bootstrap.clone()),
            Phase::Uninitialized | Phase::TornDown => Err(LifecycleError::NotInitialized),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        matches!(
            *self.phase.lock().unwrap_or_else(PoisonError::into_inner),
            Phase::Active(_)
        )
    }

    #[must_use]
    pub fn placement(&self) -> &ListenerPlacement {
        &self.placement
    }

    /// Handle of an in-process listener, for inspecting its state and
    /// statistics.
    #[must_use]
    pub fn listener_handle(&self) -> Option<ListenerHandle> {
        match &*self.phase.lock().unwrap_or_else(PoisonError::into_inner) {
            Phase::Active(Active {
                listener: Listener::Thread(handle),
                ..
            }) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Stops forwarding, sends the sentinel and waits for the listener to
    /// exit. Runs at most once; later calls do nothing.
    pub fn shutdown(&self) {
        let active = {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *phase, Phase::TornDown) {
                Phase::Active(active) => active,
                Phase::Uninitialized | Phase::TornDown => return,
            }
        };

        WorkerLogFront::detach();
        stop_listener(active.listener);
        info!("Log aggregation shut down");
    }
}

impl Drop for AggregationLifecycle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_listener(listener: Listener) {
    match listener {
        Listener::Thread(handle) => handle.stop(),
        Listener::Process { mut child, sender } => {
            if sender.request_shutdown().is_err() {
                debug!("Listener process already closed its channel");
            }
            drop(sender);
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("Listener process exited with {status}"),
                Err(e) => warn!("Failed to wait for listener process: {e}"),
            }
        }
    }
}

/// Spawns the listener binary and waits until its socket accepts producers.
fn spawn_listener_process(
    program: &std::path::Path,
    config: &AggregatorConfig,
    socket_path: &std::path::Path,
) -> Result<(Child, ChannelSender), LifecycleError> {
    let mut child = Command::new(program)
        .env(CONFIG_JSON_ENV, config.to_json()?)
        .env_remove(CONFIG_PATH_ENV)
        .env(SOCKET_ENV, socket_path)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| LifecycleError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
    debug!("Spawned listener process {}", child.id());

    let endpoint = ChannelEndpoint::new(socket_path);
    let deadline = Instant::now() + LISTENER_READY_TIMEOUT;
    loop {
        if let Ok(sender) = ChannelSender::connect(&endpoint) {
            return Ok((child, sender));
        }
        if child.try_wait()?.is_some() || Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(LifecycleError::ListenerExited);
        }
        std::thread::sleep(LISTENER_READY_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::record::Level;

    fn clear_env() {
        env::remove_var(ENDPOINT_ENV);
        env::remove_var(WORKER_CONFIG_ENV);
    }

    #[test]
    #[serial]
    fn test_default_placement_is_listener_process() {
        env::set_var(LISTENER_PROGRAM_ENV, "/opt/agg/bin/listener");
        assert_eq!(
            ListenerPlacement::default(),
            ListenerPlacement::ChildProcess {
                program: PathBuf::from("/opt/agg/bin/listener")
            }
        );
        assert_eq!(
            AggregationLifecycle::default().placement(),
            &ListenerPlacement::default()
        );

        env::remove_var(LISTENER_PROGRAM_ENV);
        let ListenerPlacement::ChildProcess { program } = ListenerPlacement::default() else {
            panic!("default placement runs the listener in a separate process");
        };
        assert_eq!(program.file_name().unwrap(), LISTENER_PROGRAM);
    }

    #[test]
    fn test_propagate_before_initialize_fails() {
        let lifecycle = AggregationLifecycle::default();
        assert!(!lifecycle.is_initialized());
        assert!(matches!(
            lifecycle.propagate_to_new_worker(),
            Err(LifecycleError::NotInitialized)
        ));
        assert!(lifecycle.listener_handle().is_none());
        // Tearing down something never started is a no-op.
        lifecycle.shutdown();
        lifecycle.shutdown();
    }

    #[test]
    fn test_invalid_config_fails_before_starting() {
        let lifecycle = AggregationLifecycle::default();
        let result = lifecycle.initialize_once(&AggregatorConfig::empty(), &WorkerConfig::default());
        assert!(matches!(
            result,
            Err(LifecycleError::Config(crate::error::ConfigError::MissingRoot))
        ));
        assert!(!lifecycle.is_initialized());
    }

    #[test]
    fn test_missing_listener_program() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = AggregationLifecycle::new(ListenerPlacement::ChildProcess {
            program: dir.path().join("no-such-listener"),
        });
        let mut config = AggregatorConfig::console();
        config.socket_path = Some(dir.path().join("c.sock"));

        let result = lifecycle.initialize_once(&config, &WorkerConfig::default());
        assert!(matches!(result, Err(LifecycleError::Spawn { .. })));
        assert!(!lifecycle.is_initialized());
    }

    #[test]
    fn test_apply_to_command_sets_environment() {
        let bootstrap = WorkerBootstrap {
            endpoint: ChannelEndpoint::new("/tmp/agg.sock"),
            worker_config: WorkerConfig {
                level: Level::Info,
                echo: true,
                echo_level: Level::Error,
            },
        };
        let mut command = Command::new("true");
        bootstrap.apply_to_command(&mut command).unwrap();

        let envs: Vec<(String, String)> = command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(envs.contains(&(ENDPOINT_ENV.to_string(), "/tmp/agg.sock".to_string())));
        let (_, json) = envs.iter().find(|(k, _)| k == WORKER_CONFIG_ENV).unwrap();
        let parsed: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, bootstrap.worker_config);
    }

    #[test]
    #[serial]
    fn test_bootstrap_from_env() {
        clear_env();
        assert!(matches!(
            WorkerBootstrap::from_env(),
            Err(FrontError::MissingChannel)
        ));

        env::set_var(ENDPOINT_ENV, "/tmp/agg.sock");
        let bootstrap = WorkerBootstrap::from_env().unwrap();
        assert_eq!(bootstrap.endpoint, ChannelEndpoint::new("/tmp/agg.sock"));
        assert_eq!(bootstrap.worker_config, WorkerConfig::default());

        env::set_var(WORKER_CONFIG_ENV, r#"{"level":"WARN"}"#);
        let bootstrap = WorkerBootstrap::from_env().unwrap();
        assert_eq!(bootstrap.worker_config.level, Level::Warning);

        env::set_var(WORKER_CONFIG_ENV, r#"{"level":"loud"}"#);
        assert!(matches!(
            WorkerBootstrap::from_env(),
            Err(FrontError::InvalidConfig(_))
        ));
        clear_env();
    }
}
