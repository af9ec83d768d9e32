// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output destinations owned by the listener.
//!
//! Sinks are only ever touched by the listener's consumer loop, one record at
//! a time, so implementations need no internal locking.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ConsoleStream, SinkTarget};

/// A destination for formatted log entries.
pub trait Sink: Send {
    /// Writes one formatted entry. The sink adds its own line terminator.
    fn write_entry(&mut self, entry: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens the sink described by `target`.
///
/// For [`SinkTarget::Memory`] the returned buffer handle is the only way to
/// read what the sink received.
pub fn open(target: &SinkTarget) -> io::Result<(Box<dyn Sink>, Option<MemoryBuffer>)> {
    Ok(match target {
        SinkTarget::Console(stream) => (Box::new(ConsoleSink::new(*stream)), None),
        SinkTarget::File(path) => (Box::new(FileSink::open(path)?), None),
        SinkTarget::RotatingFile {
            path,
            max_bytes,
            backup_count,
        } => (
            Box::new(RotatingFileSink::open(path, *max_bytes, *backup_count)?),
            None,
        ),
        SinkTarget::Memory => {
            let sink = MemorySink::new();
            let buffer = sink.buffer();
            (Box::new(sink), Some(buffer))
        }
    })
}

#[derive(Debug)]
pub struct ConsoleSink {
    stream: ConsoleStream,
}

impl ConsoleSink {
    #[must_use]
    pub fn new(stream: ConsoleStream) -> Self {
        Self { stream }
    }
}

impl Sink for ConsoleSink {
    fn write_entry(&mut self, entry: &str) -> io::Result<()> {
        match self.stream {
            ConsoleStream::Stdout => {
                let mut out = io::stdout().lock();
                writeln!(out, "{entry}")?;
                out.flush()
            }
            ConsoleStream::Stderr => {
                let mut out = io::stderr().lock();
                writeln!(out, "{entry}")
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Appends entries to a single file.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_append(path)?,
        })
    }
}

impl Sink for FileSink {
    fn write_entry(&mut self, entry: &str) -> io::Result<()> {
        let mut line = String::with_capacity(entry.len() + 1);
        line.push_str(entry);
        line.push('\n');
        self.file.write_all(line.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Appends entries to a file, rolling it over when it would exceed a size.
///
/// On rollover `path.{n-1}` becomes `path.{n}`, ..., `path` becomes
/// `path.1`, and the oldest backup beyond `backup_count` is removed. With
/// `backup_count == 0` the file is truncated in place.
#[derive(Debug)]
pub struct RotatingFileSink {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: Option<File>,
    size: u64,
}

impl RotatingFileSink {
    pub fn open(path: &Path, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        let file = open_append(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backup_count,
            file: Some(file),
            size,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        // Close before renaming.
        self.file = None;

        if self.backup_count == 0 {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            drop(file);
        } else {
            for index in (1..self.backup_count).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            if self.path.exists() {
                fs::rename(&self.path, self.backup_path(1))?;
            }
        }

        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }
}

impl Sink for RotatingFileSink {
    fn write_entry(&mut self, entry: &str) -> io::Result<()> {
        let len = entry.len() as u64 + 1;
        if self.size > 0 && self.size + len > self.max_bytes {
            self.rotate()?;
        }
        if self.file.is_none() {
            // A previous rotation failed half-way; try to reopen.
            self.file = Some(open_append(&self.path)?);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("rotating file is not open"));
        };

        let mut line = String::with_capacity(entry.len() + 1);
        line.push_str(entry);
        line.push('\n');
        file.write_all(line.as_bytes())?;
        self.size += len;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Shared view of the entries a [`MemorySink`] received.
#[derive(Clone, Debug, Default)]
pub struct MemoryBuffer(Arc<Mutex<Vec<String>>>);

impl MemoryBuffer {
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: MemoryBuffer,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn buffer(&self) -> MemoryBuffer {
        self.buffer.clone()
    }
}

impl Sink for MemorySink {
    fn write_entry(&mut self, entry: &str) -> io::Result<()> {
        self.buffer
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.to_string());
        Ok(())
    }
}
