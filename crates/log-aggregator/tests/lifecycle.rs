// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log_aggregator::config::{RouteConfig, SinkConfig, SinkKind, ROOT_ROUTE};
use log_aggregator::lifecycle::ENDPOINT_ENV;
use log_aggregator::{
    AggregationLifecycle, AggregatorConfig, Level, LifecycleError, ListenerPlacement,
    ListenerState, WorkerConfig, WorkerLogFront,
};
use serial_test::serial;

fn file_config(dir: &Path) -> (AggregatorConfig, PathBuf) {
    let log_path = dir.join("aggregated.log");
    let mut config = AggregatorConfig::empty();
    config
        .formatters
        .insert("pid".to_string(), "{pid} {logger} {message}".to_string());
    let mut file = SinkConfig::new(SinkKind::File);
    file.path = Some(log_path.clone());
    file.formatter = Some("pid".to_string());
    config.sinks.insert("file".to_string(), file);
    config.routes.insert(
        ROOT_ROUTE.to_string(),
        RouteConfig::new(Level::Debug, &["file"]),
    );
    config.socket_path = Some(dir.join("agg.sock"));
    config.poll_interval_ms = 20;
    (config, log_path)
}

fn wait_for_line(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if content.contains(needle) || Instant::now() >= deadline {
            return content;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Runs only when re-executed as a worker by the lifecycle test below.
#[test]
fn worker_process_entry() {
    if std::env::var_os(ENDPOINT_ENV).is_none() {
        return;
    }
    WorkerLogFront::configure_from_env().expect("worker front configured");
    tracing::info!(target: "worker::child", "hello from the worker");
}

#[test]
#[serial]
fn root_and_spawned_worker_share_one_listener() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, log_path) = file_config(dir.path());

    let lifecycle = AggregationLifecycle::new(ListenerPlacement::DedicatedThread);
    assert!(lifecycle
        .initialize_once(&config, &WorkerConfig::default())
        .expect("initialized"));
    assert!(!lifecycle
        .initialize_once(&config, &WorkerConfig::default())
        .expect("second call is a no-op"));
    assert!(lifecycle.is_initialized());

    tracing::info!(target: "root", "hello from the root");

    let bootstrap = lifecycle.propagate_to_new_worker().expect("bootstrap");
    assert_eq!(bootstrap.endpoint.socket_path, dir.path().join("agg.sock"));

    let mut command = Command::new(std::env::current_exe().expect("test binary"));
    command.args(["worker_process_entry", "--exact", "--nocapture", "--test-threads=1"]);
    bootstrap
        .apply_to_command(&mut command)
        .expect("bootstrap applied");
    let status = command.status().expect("worker ran");
    assert!(status.success());

    // No waiting for delivery: shutdown drains what the worker wrote.
    let handle = lifecycle.listener_handle().expect("in-process listener");
    lifecycle.shutdown();
    assert_eq!(handle.state(), ListenerState::Stopped);
    let content = std::fs::read_to_string(&log_path).expect("log file written");

    let root_line = format!("{} root hello from the root", std::process::id());
    assert!(content.contains(&root_line), "missing root line in {content}");
    let worker_line = content
        .lines()
        .find(|line| line.ends_with("worker.child hello from the worker"))
        .expect("worker line");
    assert!(!worker_line.starts_with(&std::process::id().to_string()));

    assert!(matches!(
        lifecycle.propagate_to_new_worker(),
        Err(LifecycleError::NotInitialized)
    ));
    assert!(!lifecycle
        .initialize_once(&config, &WorkerConfig::default())
        .expect("torn down lifecycle stays torn down"));
    assert!(!dir.path().join("agg.sock").exists());
}

#[test]
#[serial]
fn concurrent_first_touch_initializes_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, log_path) = file_config(dir.path());
    let lifecycle = Arc::new(AggregationLifecycle::new(ListenerPlacement::DedicatedThread));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let lifecycle = Arc::clone(&lifecycle);
            let config = config.clone();
            std::thread::spawn(move || {
                lifecycle
                    .initialize_once(&config, &WorkerConfig::default())
                    .expect("initialize")
            })
        })
        .collect();
    let initialized = threads
        .into_iter()
        .map(|t| t.join().expect("thread"))
        .filter(|first| *first)
        .count();
    assert_eq!(initialized, 1);

    tracing::warn!(target: "root::race", "after the race");
    let content = wait_for_line(&log_path, "after the race");
    assert_eq!(content.matches("after the race").count(), 1);

    drop(lifecycle);
    assert!(!dir.path().join("agg.sock").exists());
}
