// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-sink formatting templates.
//!
//! A template is plain text with `{placeholder}` fields:
//!
//! | Placeholder   | Value                                         |
//! |---------------|-----------------------------------------------|
//! | `{timestamp}` | RFC 3339 UTC with milliseconds                |
//! | `{level}`     | `DEBUG`, `INFO`, `WARNING`, `ERROR`, `CRITICAL` |
//! | `{logger}`    | dotted logger name                            |
//! | `{process}`   | process name                                  |
//! | `{pid}`       | process id                                    |
//! | `{thread}`    | thread name, or thread id when unnamed        |
//! | `{message}`   | the message                                   |
//! | `{exception}` | exception info, empty when absent             |
//!
//! `{{` and `}}` produce literal braces. Templates are compiled once when the
//! listener starts; an unknown placeholder is a configuration error.
//!
//! When a record carries exception info and the template has no
//! `{exception}` field, the exception is appended on its own line.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::record::LogRecord;

pub const DEFAULT_TEMPLATE: &str =
    "{timestamp} | {level} | {logger} | {process}:{thread} | {message}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Timestamp,
    Level,
    Logger,
    Process,
    Pid,
    Thread,
    Message,
    Exception,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "timestamp" => Field::Timestamp,
            "level" => Field::Level,
            "logger" => Field::Logger,
            "process" => Field::Process,
            "pid" => Field::Pid,
            "thread" => Field::Thread,
            "message" => Field::Message,
            "exception" => Field::Exception,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A compiled formatting template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
    places_exception: bool,
}

impl Template {
    /// Compiles `source`, rejecting unknown placeholders and unbalanced braces.
    pub fn compile(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(format!("unclosed placeholder '{{{name}'"));
                    }
                    let field = Field::parse(name.trim())
                        .ok_or_else(|| format!("unknown placeholder '{{{name}}}'"))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => return Err("unmatched '}'".to_string()),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let places_exception = segments
            .iter()
            .any(|s| *s == Segment::Field(Field::Exception));
        Ok(Self {
            segments,
            places_exception,
        })
    }

    /// Renders one record as a single output entry (without trailing newline).
    #[must_use]
    pub fn render(&self, record: &LogRecord) -> String {
        let mut out = String::with_capacity(64 + record.message.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => write_field(&mut out, *field, record),
            }
        }
        if !self.places_exception {
            if let Some(exception) = &record.exception {
                let _ = write!(out, "\n{exception}");
            }
        }
        out
    }
}

impl Default for Template {
    fn default() -> Self {
        // The default template is a constant known to compile.
        #[allow(clippy::expect_used)]
        Template::compile(DEFAULT_TEMPLATE).expect("default template compiles")
    }
}

fn write_field(out: &mut String, field: Field, record: &LogRecord) {
    match field {
        Field::Timestamp => {
            let ts: DateTime<Utc> = record.timestamp.into();
            out.push_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        Field::Level => out.push_str(record.level.as_str()),
        Field::Logger => out.push_str(&record.logger),
        Field::Process => out.push_str(&record.process_name),
        Field::Pid => {
            let _ = write!(out, "{}", record.process_id);
        }
        Field::Thread => out.push_str(record.thread_name.as_deref().unwrap_or(&record.thread_id)),
        Field::Message => out.push_str(&record.message),
        Field::Exception => {
            if let Some(exception) = &record.exception {
                let _ = write!(out, "{exception}");
            }
        }
    }
}
