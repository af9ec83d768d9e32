// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Applies records to the configured sinks.
//!
//! # Resolution
//!
//! A record's logger name is matched against the configured route prefixes
//! on dotted boundaries, most specific first:
//!
//! ```text
//! logger "a.b.c"  →  try "a.b.c", then "a.b", then "a", then "root"
//! ```
//!
//! `"a.bc"` does not match prefix `"a.b"`. A logger that matches nothing,
//! including an empty or malformed name, falls back to `root`.
//!
//! # Filtering
//!
//! The resolved route's level gates the record. Each sink then applies its
//! own level. When the resolved route has `propagate` set, the sinks of the
//! next less specific matching routes receive the record too (their route
//! levels are not re-checked); a sink bound to several of them is written at
//! most once per record.
//!
//! # Failure isolation
//!
//! A failing sink write is reported on the listener's diagnostic stream and
//! counted. It never reaches the consumer loop and never prevents delivery
//! to the other sinks.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::config::{AggregatorConfig, ROOT_ROUTE};
use crate::error::ConfigError;
use crate::format::Template;
use crate::record::{Level, LogRecord};
use crate::sink::{self, MemoryBuffer, Sink};

struct SinkEntry {
    name: String,
    sink: Box<dyn Sink>,
    template: Template,
    level: Level,
}

#[derive(Debug)]
struct Route {
    prefix: String,
    level: Level,
    sinks: Vec<usize>,
    propagate: bool,
}

/// What happened to one record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Sinks that accepted the record.
    pub delivered: usize,
    /// Sinks whose write failed.
    pub failed: usize,
    /// The record was below the resolved route's threshold.
    pub filtered: bool,
}

pub struct SinkRouter {
    sinks: Vec<SinkEntry>,
    routes: Vec<Route>,
    by_prefix: HashMap<String, usize>,
    root: usize,
    memory: HashMap<String, MemoryBuffer>,
}

impl std::fmt::Debug for SinkRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRouter")
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl SinkRouter {
    /// Validates `config` and opens every sink it declares.
    pub fn from_config(config: &AggregatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut sinks = Vec::with_capacity(config.sinks.len());
        let mut sink_index = HashMap::new();
        let mut memory = HashMap::new();

        for (name, sink_config) in &config.sinks {
            let target = sink_config.target(name)?;
            let template = match &sink_config.formatter {
                Some(formatter) => {
                    let source = config.formatters.get(formatter).ok_or_else(|| {
                        ConfigError::UnknownFormatter {
                            sink: name.clone(),
                            formatter: formatter.clone(),
                        }
                    })?;
                    Template::compile(source).map_err(|reason| ConfigError::InvalidTemplate {
                        name: formatter.clone(),
                        reason,
                    })?
                }
                None => Template::default(),
            };
            let (opened, buffer) = sink::open(&target).map_err(|source| ConfigError::SinkOpen {
                sink: name.clone(),
                source,
            })?;
            if let Some(buffer) = buffer {
                memory.insert(name.clone(), buffer);
            }

            sink_index.insert(name.clone(), sinks.len());
            sinks.push(SinkEntry {
                name: name.clone(),
                sink: opened,
                template,
                level: sink_config.level,
            });
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        let mut by_prefix = HashMap::new();
        for (prefix, route_config) in &config.routes {
            let mut bound = Vec::with_capacity(route_config.sinks.len());
            for sink_name in &route_config.sinks {
                let index = sink_index
                    .get(sink_name)
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownSink {
                        route: prefix.clone(),
                        sink: sink_name.clone(),
                    })?;
                if !bound.contains(&index) {
                    bound.push(index);
                }
            }
            by_prefix.insert(prefix.clone(), routes.len());
            routes.push(Route {
                prefix: prefix.clone(),
                level: route_config.level,
                sinks: bound,
                propagate: route_config.propagate,
            });
        }

        let root = by_prefix
            .get(ROOT_ROUTE)
            .copied()
            .ok_or(ConfigError::MissingRoot)?;

        debug!(
            "Sink router ready with {} sinks and {} routes",
            sinks.len(),
            routes.len()
        );

        Ok(Self {
            sinks,
            routes,
            by_prefix,
            root,
            memory,
        })
    }

    /// Buffer of the memory sink called `name`, if there is one.
    #[must_use]
    pub fn memory_buffer(&self, name: &str) -> Option<MemoryBuffer> {
        self.memory.get(name).cloned()
    }

    /// Swaps the sink called `name` for a custom implementation, keeping its
    /// template, level and bindings. Returns `false` if no such sink exists.
    pub fn replace_sink(&mut self, name: &str, sink: Box<dyn Sink>) -> bool {
        match self.sinks.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.sink = sink;
                self.memory.remove(name);
                true
            }
            None => false,
        }
    }

    /// Prefix of the route that `logger` resolves to.
    #[must_use]
    pub fn resolve(&self, logger: &str) -> &str {
        &self.routes[self.resolve_index(logger)].prefix
    }

    /// Names of the sinks a record with this logger and level is written to.
    #[must_use]
    pub fn destinations(&self, logger: &str, level: Level) -> Vec<&str> {
        if level < self.routes[self.resolve_index(logger)].level {
            return Vec::new();
        }
        self.selected_sinks(logger, level)
            .into_iter()
            .map(|index| self.sinks[index].name.as_str())
            .collect()
    }

    /// Writes `record` to every sink it is routed to.
    pub fn route(&mut self, record: &LogRecord) -> RouteOutcome {
        let resolved = self.resolve_index(&record.logger);
        if record.level < self.routes[resolved].level {
            return RouteOutcome {
                filtered: true,
                ..RouteOutcome::default()
            };
        }

        let mut outcome = RouteOutcome::default();
        for index in self.selected_sinks(&record.logger, record.level) {
            let entry = &mut self.sinks[index];
            let rendered = entry.template.render(record);
            match entry.sink.write_entry(&rendered) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    error!(
                        "Failed to write log record from '{}' to sink '{}': {e}",
                        record.logger, entry.name
                    );
                }
            }
        }
        outcome
    }

    /// Flushes every sink, reporting failures without stopping.
    pub fn flush(&mut self) {
        for entry in &mut self.sinks {
            if let Err(e) = entry.sink.flush() {
                error!("Failed to flush sink '{}': {e}", entry.name);
            }
        }
    }

    fn resolve_index(&self, logger: &str) -> usize {
        let mut candidate = logger;
        while !candidate.is_empty() {
            if let Some(index) = self.by_prefix.get(candidate) {
                return *index;
            }
            match candidate.rfind('.') {
                Some(dot) => candidate = &candidate[..dot],
                None => break,
            }
        }
        self.root
    }

    /// Routes a record passes through: the resolved one, then its
    /// ancestors while `propagate` allows.
    fn route_chain(&self, logger: &str) -> Vec<usize> {
        let mut chain = vec![self.resolve_index(logger)];
        loop {
            let current = &self.routes[chain[chain.len() - 1]];
            if !current.propagate || current.prefix == ROOT_ROUTE {
                break;
            }
            let parent = match current.prefix.rfind('.') {
                Some(dot) => self.resolve_index(&current.prefix[..dot]),
                None => self.root,
            };
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
        }
        chain
    }

    fn selected_sinks(&self, logger: &str, level: Level) -> Vec<usize> {
        let mut selected = Vec::new();
        for route in self.route_chain(logger) {
            for &index in &self.routes[route].sinks {
                if level >= self.sinks[index].level && !selected.contains(&index) {
                    selected.push(index);
                }
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, SinkConfig, SinkKind};
    use std::io;
    use tracing_test::traced_test;

    struct FailingSink;

    impl Sink for FailingSink {
        fn write_entry(&mut self, _entry: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn memory_config(sinks: &[&str]) -> AggregatorConfig {
        let mut config = AggregatorConfig::empty();
        config
            .formatters
            .insert("bare".to_string(), "{level}:{message}".to_string());
        for name in sinks {
            let mut sink = SinkConfig::new(SinkKind::Memory);
            sink.formatter = Some("bare".to_string());
            config.sinks.insert((*name).to_string(), sink);
        }
        config
    }

    fn prefix_config() -> AggregatorConfig {
        let mut config = memory_config(&["root_sink", "x", "y"]);
        config.routes.insert(
            ROOT_ROUTE.to_string(),
            RouteConfig::new(Level::Debug, &["root_sink"]),
        );
        config
            .routes
            .insert("a".to_string(), RouteConfig::new(Level::Debug, &["x"]));
        config
            .routes
            .insert("a.b".to_string(), RouteConfig::new(Level::Debug, &["y"]));
        config
    }

    fn record(logger: &str, level: Level, message: &str) -> LogRecord {
        LogRecord::new(level, logger, message)
    }

    #[test]
    fn test_longest_prefix_match() {
        let router = SinkRouter::from_config(&prefix_config()).unwrap();
        assert_eq!(router.resolve("a.b.c"), "a.b");
        assert_eq!(router.resolve("a.b"), "a.b");
        assert_eq!(router.resolve("a.bc"), "a");
        assert_eq!(router.resolve("a"), "a");
        assert_eq!(router.resolve("ab"), ROOT_ROUTE);
        assert_eq!(router.resolve("other.a.b"), ROOT_ROUTE);
        assert_eq!(router.resolve(""), ROOT_ROUTE);
        assert_eq!(router.resolve(".."), ROOT_ROUTE);
    }

    #[test]
    fn test_route_writes_only_most_specific() {
        let mut router = SinkRouter::from_config(&prefix_config()).unwrap();
        let outcome = router.route(&record("a.b.c", Level::Info, "hello"));
        assert_eq!(outcome.delivered, 1);

        assert_eq!(router.memory_buffer("y").unwrap().entries(), vec!["INFO:hello"]);
        assert!(router.memory_buffer("x").unwrap().is_empty());
        assert!(router.memory_buffer("root_sink").unwrap().is_empty());
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = SinkRouter::from_config(&prefix_config()).unwrap();
        let first = router.destinations("a.b.z", Level::Warning);
        for _ in 0..10 {
            assert_eq!(router.destinations("a.b.z", Level::Warning), first);
        }
        assert_eq!(first, vec!["y"]);
    }

    #[test]
    fn test_route_threshold_drops_silently() {
        let mut config = prefix_config();
        config.routes.get_mut("a.b").unwrap().level = Level::Error;
        let mut router = SinkRouter::from_config(&config).unwrap();

        let outcome = router.route(&record("a.b.c", Level::Warning, "quiet"));
        assert!(outcome.filtered);
        assert_eq!(outcome.delivered, 0);
        assert!(router.memory_buffer("y").unwrap().is_empty());
        // Filtering does not fall through to a less specific route.
        assert!(router.memory_buffer("x").unwrap().is_empty());
    }

    #[test]
    fn test_sink_threshold() {
        let mut config = memory_config(&["all", "errors"]);
        config.sinks.get_mut("errors").unwrap().level = Level::Error;
        config.routes.insert(
            ROOT_ROUTE.to_string(),
            RouteConfig::new(Level::Debug, &["all", "errors"]),
        );
        let mut router = SinkRouter::from_config(&config).unwrap();

        router.route(&record("svc", Level::Info, "fine"));
        router.route(&record("svc", Level::Critical, "boom"));

        assert_eq!(
            router.memory_buffer("all").unwrap().entries(),
            vec!["INFO:fine", "CRITICAL:boom"]
        );
        assert_eq!(
            router.memory_buffer("errors").unwrap().entries(),
            vec!["CRITICAL:boom"]
        );
    }

    #[test]
    fn test_propagation_delivers_once_per_sink() {
        let mut config = prefix_config();
        config.routes.get_mut("a.b").unwrap().propagate = true;
        config.routes.get_mut("a.b").unwrap().sinks.push("x".to_string());
        config.routes.get_mut("a").unwrap().propagate = true;
        let mut router = SinkRouter::from_config(&config).unwrap();

        assert_eq!(
            router.destinations("a.b.c", Level::Info),
            vec!["y", "x", "root_sink"]
        );
        router.route(&record("a.b.c", Level::Info, "up"));
        assert_eq!(router.memory_buffer("x").unwrap().len(), 1);
        assert_eq!(router.memory_buffer("y").unwrap().len(), 1);
        assert_eq!(router.memory_buffer("root_sink").unwrap().len(), 1);
    }

    #[test]
    fn test_propagation_stops_at_non_propagating_parent() {
        let mut config = prefix_config();
        config.routes.get_mut("a.b").unwrap().propagate = true;
        let router = SinkRouter::from_config(&config).unwrap();
        assert_eq!(router.destinations("a.b", Level::Debug), vec!["y", "x"]);
    }

    #[test]
    #[traced_test]
    fn test_failing_sink_is_isolated() {
        let mut config = memory_config(&["broken", "healthy"]);
        config.routes.insert(
            ROOT_ROUTE.to_string(),
            RouteConfig::new(Level::Debug, &["broken", "healthy"]),
        );
        let mut router = SinkRouter::from_config(&config).unwrap();
        assert!(router.replace_sink("broken", Box::new(FailingSink)));
        assert!(router.memory_buffer("broken").is_none());

        let outcome = router.route(&record("svc", Level::Error, "still here"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(
            router.memory_buffer("healthy").unwrap().entries(),
            vec!["ERROR:still here"]
        );
        assert!(logs_contain("to sink 'broken': disk full"));
    }

    #[test]
    fn test_replace_unknown_sink() {
        let mut router = SinkRouter::from_config(&prefix_config()).unwrap();
        assert!(!router.replace_sink("nope", Box::new(FailingSink)));
    }

    #[test]
    fn test_from_config_reports_unopenable_sink() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let mut config = AggregatorConfig::empty();
        let mut file = SinkConfig::new(SinkKind::File);
        file.path = Some(blocker.join("app.log"));
        config.sinks.insert("file".to_string(), file);
        config
            .routes
            .insert(ROOT_ROUTE.to_string(), RouteConfig::new(Level::Debug, &["file"]));

        let err = SinkRouter::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::SinkOpen { ref sink, .. } if sink == "file"));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = memory_config(&["m"]);
        assert!(matches!(
            SinkRouter::from_config(&config),
            Err(ConfigError::MissingRoot)
        ));
    }
}
