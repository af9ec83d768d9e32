// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Formatting of the aggregator's own diagnostics.
//!
//! The listener reports sink failures, idle shutdowns and transport problems
//! through `tracing`. Each line names the reporting process and component so
//! it stands out from the application output the listener is writing, and so
//! a listener running as a child process can be told apart from its root:
//!
//! ```text
//! LOG_AGGREGATOR[4242] WARN  listener: No log records received for 36000.2s (idle timeout 36000.0s), stopping listener
//! LOG_AGGREGATOR[4242] ERROR router [drain records=12]: Failed to write log record from 'app' to sink 'file': No space left on device
//! ```

use std::fmt::{self, Write as _};

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

use crate::record::Level;

const CRATE_TARGET: &str = "log_aggregator::";

/// Event formatter:
/// `LOG_AGGREGATOR[pid] LEVEL component [span fields > span]: message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

/// `log_aggregator::router::tests` is reported as `router`; targets outside
/// this crate keep their full dotted path.
fn component(target: &str) -> String {
    match target.strip_prefix(CRATE_TARGET) {
        Some(module) => module.split("::").next().unwrap_or(module).to_string(),
        None => target.replace("::", "."),
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "LOG_AGGREGATOR[{}] {:<5} {}",
            std::process::id(),
            metadata.level().as_str(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut separator = " [";
            for span in scope.from_root() {
                write!(writer, "{separator}{}", span.name())?;
                separator = " > ";
                if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, " {fields}")?;
                    }
                }
            }
            if separator != " [" {
                writer.write_char(']')?;
            }
        }

        writer.write_str(": ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Subscriber for the listener's diagnostic stream: stderr, [`Formatter`],
/// events at `level` and above.
#[must_use]
pub fn diagnostic_subscriber(level: Level) -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(level.as_level_filter())
        .event_format(Formatter)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn captured_subscriber(captured: &Captured) -> impl Subscriber + Send + Sync {
        tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(captured.clone())
            .event_format(Formatter)
            .finish()
    }

    #[test]
    fn test_formatter_names_process_component_and_spans() {
        let captured = Captured::default();
        tracing::subscriber::with_default(captured_subscriber(&captured), || {
            let outer = tracing::info_span!("listener", pid = 7);
            let _outer = outer.enter();
            let inner = tracing::info_span!("drain");
            let _inner = inner.enter();
            tracing::warn!(target: "log_aggregator::router", sink = "file", "write failed");
        });

        assert_eq!(
            captured.text(),
            format!(
                "LOG_AGGREGATOR[{}] WARN  router [listener pid=7 > drain]: write failed sink=\"file\"\n",
                std::process::id()
            )
        );
    }

    #[test]
    fn test_formatter_without_span() {
        let captured = Captured::default();
        tracing::subscriber::with_default(captured_subscriber(&captured), || {
            tracing::error!(target: "log_aggregator_listener", "plain");
        });

        assert_eq!(
            captured.text(),
            format!(
                "LOG_AGGREGATOR[{}] ERROR log_aggregator_listener: plain\n",
                std::process::id()
            )
        );
    }

    #[test]
    fn test_component_names() {
        assert_eq!(component("log_aggregator::listener"), "listener");
        assert_eq!(component("log_aggregator::transport::tests"), "transport");
        assert_eq!(component("my_app::db"), "my_app.db");
        assert_eq!(component("log_aggregator"), "log_aggregator");
    }
}
