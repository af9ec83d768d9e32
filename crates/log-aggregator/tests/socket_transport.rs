// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::time::{Duration, Instant};

use log_aggregator::config::{RouteConfig, SinkConfig, SinkKind, ROOT_ROUTE};
use log_aggregator::sink::MemoryBuffer;
use log_aggregator::{
    AggregatorConfig, ChannelSender, ExceptionInfo, Level, ListenerService, LogRecord, StopReason,
};

const THREADS: usize = 4;
const PER_THREAD: usize = 50;
const BURST: usize = 500;

fn config() -> AggregatorConfig {
    let mut config = AggregatorConfig::empty();
    config
        .formatters
        .insert("msg".to_string(), "{message}".to_string());
    let mut mem = SinkConfig::new(SinkKind::Memory);
    mem.formatter = Some("msg".to_string());
    config.sinks.insert("mem".to_string(), mem);
    config.routes.insert(
        ROOT_ROUTE.to_string(),
        RouteConfig::new(Level::Debug, &["mem"]),
    );
    config.poll_interval_ms = 20;
    config
}

fn wait_for(buffer: &MemoryBuffer, len: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while buffer.len() < len && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn threads_share_one_socket_producer_without_interleaving() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut service, _) = ListenerService::new(&config()).expect("valid config");
    let buffer = service.memory_buffer("mem").expect("memory sink");
    let endpoint = service
        .bind_socket(&dir.path().join("agg.sock"))
        .expect("socket bound");
    let handle = service.spawn_dedicated().expect("listener thread");

    let producer = ChannelSender::connect(&endpoint).expect("connected");
    let payload = "x".repeat(4096);
    let threads: Vec<_> = (0..THREADS)
        .map(|t| {
            let producer = producer.clone();
            let payload = payload.clone();
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    producer
                        .put_record(LogRecord::new(
                            Level::Info,
                            "worker",
                            format!("t{t}-{i}-{payload}"),
                        ))
                        .expect("socket open");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("producer thread");
    }

    wait_for(&buffer, THREADS * PER_THREAD);
    let entries = buffer.entries();
    assert_eq!(entries.len(), THREADS * PER_THREAD);
    for entry in &entries {
        assert!(entry.ends_with(&payload), "corrupted entry: {entry:.40}");
    }
    for t in 0..THREADS {
        let ours: Vec<_> = entries
            .iter()
            .filter(|e| e.starts_with(&format!("t{t}-")))
            .collect();
        assert_eq!(ours.len(), PER_THREAD);
        // One producer thread's records keep their order.
        for (i, entry) in ours.iter().enumerate() {
            assert!(entry.starts_with(&format!("t{t}-{i}-")));
        }
    }

    handle.stop();
    assert!(!endpoint.socket_path.exists());
}

#[test]
fn remote_sentinel_stops_listener_and_later_puts_fail() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut service, _) = ListenerService::new(&config()).expect("valid config");
    let buffer = service.memory_buffer("mem").expect("memory sink");
    let endpoint = service
        .bind_socket(&dir.path().join("agg.sock"))
        .expect("socket bound");
    let handle = service.spawn_dedicated().expect("listener thread");

    let remote = ChannelSender::connect(&endpoint).expect("connected");
    remote
        .put_record(
            LogRecord::new(Level::Error, "worker", "failed").with_exception(ExceptionInfo {
                kind: Some("Timeout".to_string()),
                message: "gave up after 3 tries".to_string(),
            }),
        )
        .expect("socket open");
    remote.request_shutdown().expect("socket open");

    assert!(handle.wait_stopped(Some(Duration::from_secs(5))));
    assert_eq!(handle.stop_reason(), Some(StopReason::Sentinel));
    handle.stop();

    assert_eq!(
        buffer.entries(),
        vec!["failed\nTimeout: gave up after 3 tries".to_string()]
    );

    // The listener's end is gone; the producer eventually sees it closed.
    let late = LogRecord::new(Level::Info, "worker", "late");
    let mut rejected = false;
    for _ in 0..50 {
        if remote.put_record(late.clone()).is_err() {
            rejected = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(rejected);
    assert!(ChannelSender::connect(&endpoint).is_err());
}

#[test]
fn socket_records_put_before_stop_are_routed() {
    for run in 0..5 {
        let dir = tempfile::tempdir().expect("temp dir");
        let (mut service, _) = ListenerService::new(&config()).expect("valid config");
        let buffer = service.memory_buffer("mem").expect("memory sink");
        let endpoint = service
            .bind_socket(&dir.path().join("agg.sock"))
            .expect("socket bound");
        let handle = service.spawn_dedicated().expect("listener thread");

        let worker = ChannelSender::connect(&endpoint).expect("connected");
        for i in 0..BURST {
            worker
                .put_record(LogRecord::new(Level::Info, "worker", format!("r{i}")))
                .expect("socket open");
        }
        drop(worker);
        handle.stop();

        let expected: Vec<String> = (0..BURST).map(|i| format!("r{i}")).collect();
        assert_eq!(buffer.entries(), expected, "run {run}");
        assert_eq!(handle.stats().routed, BURST as u64);
        assert_eq!(handle.stop_reason(), Some(StopReason::Requested));
        assert!(!endpoint.socket_path.exists());
    }
}

#[test]
fn connected_producer_records_survive_immediate_stop() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut service, _) = ListenerService::new(&config()).expect("valid config");
    let buffer = service.memory_buffer("mem").expect("memory sink");
    let endpoint = service
        .bind_socket(&dir.path().join("agg.sock"))
        .expect("socket bound");
    let handle = service.spawn_dedicated().expect("listener thread");

    let workers: Vec<_> = (0..THREADS)
        .map(|_| ChannelSender::connect(&endpoint).expect("connected"))
        .collect();
    for i in 0..PER_THREAD {
        for (w, worker) in workers.iter().enumerate() {
            worker
                .put_record(LogRecord::new(Level::Info, "worker", format!("w{w}-{i}")))
                .expect("socket open");
        }
    }
    // The workers stay connected while the listener stops.
    handle.stop();

    let entries = buffer.entries();
    assert_eq!(entries.len(), THREADS * PER_THREAD);
    for w in 0..THREADS {
        let ours: Vec<_> = entries
            .iter()
            .filter(|e| e.starts_with(&format!("w{w}-")))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..PER_THREAD).map(|i| format!("w{w}-{i}")).collect();
        assert_eq!(ours, expected);
    }
    assert_eq!(handle.stats().dropped_after_stop, 0);

    let late = LogRecord::new(Level::Info, "worker", "late");
    assert!(workers
        .iter()
        .all(|worker| (0..50).any(|_| {
            let rejected = worker.put_record(late.clone()).is_err();
            if !rejected {
                std::thread::sleep(Duration::from_millis(10));
            }
            rejected
        })));
    assert_eq!(buffer.len(), THREADS * PER_THREAD);
}
