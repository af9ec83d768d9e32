// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_aggregator::config::AggregatorConfig;
use log_aggregator::lifecycle::SOCKET_ENV;
use log_aggregator::logger::Formatter;
use log_aggregator::transport::generate_socket_path;
use log_aggregator::ListenerService;

const LOG_LEVEL_ENV: &str = "LOG_AGGREGATOR_LOG_LEVEL";

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "LOG_AGGREGATOR[{}] ERROR log_aggregator_listener: Failed to install diagnostics subscriber: {e}",
            std::process::id()
        );
    }
    debug!("Logging subsystem enabled");

    let mut config = match AggregatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid listener configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = env::var_os(SOCKET_ENV).filter(|path| !path.is_empty()) {
        config.socket_path = Some(PathBuf::from(path));
    }
    let socket_path = match config.socket_path.clone() {
        Some(path) => path,
        None => match generate_socket_path() {
            Ok(path) => path,
            Err(e) => {
                error!("Unable to pick a socket path: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let (mut service, handle) = match ListenerService::new(&config) {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start log listener: {e}");
            return ExitCode::FAILURE;
        }
    };
    let endpoint = match service.bind_socket(&socket_path) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Failed to bind {}: {e}", socket_path.display());
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Log listener accepting producers at {}",
        endpoint.socket_path.display()
    );

    let running = tokio::spawn(service.run());
    match supervise(running, shutdown_signal(), || {
        handle.request_stop();
    })
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Log listener task failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Waits for the listener task. If `shutdown` completes first, asks the
/// listener to stop and waits for it to drain.
async fn supervise(
    mut running: JoinHandle<()>,
    shutdown: impl Future<Output = ()>,
    request_stop: impl FnOnce(),
) -> Result<(), JoinError> {
    tokio::select! {
        result = &mut running => return result,
        () = shutdown => {}
    }
    info!("Shutdown signal received, draining log channel");
    request_stop();
    running.await
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
