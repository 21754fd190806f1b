use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOG_FILE_NAME: &str = "compressor.log";

/// Entries kept in memory for `entries()`.
const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// `2024-05-01 10:00:00,123 - INFO - message`
    pub fn to_line(&self) -> String {
        format!("{} - {} - {}", self.timestamp, self.level.as_str(), self.message)
    }
}

struct Inner {
    file: Option<BufWriter<File>>,
    buffer: VecDeque<LogEntry>,
    max_entries: usize,
}

/// Log for a single run, written to `compressor.log` in the output directory.
///
/// Cheap to clone; all clones append to the same file. Every entry is also
/// forwarded to `tracing`.
#[derive(Clone)]
pub struct RunLog {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl RunLog {
    /// Open (appending) `compressor.log` inside `dir`.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file: Some(BufWriter::new(file)),
                buffer: VecDeque::with_capacity(DEFAULT_MAX_ENTRIES),
                max_entries: DEFAULT_MAX_ENTRIES,
            })),
            path: Some(path),
        })
    }

    /// A log that only keeps the in-memory tail.
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                file: None,
                buffer: VecDeque::with_capacity(max_entries),
                max_entries,
            })),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.add(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.add(LogLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.add(LogLevel::Error, message.into());
    }

    pub fn add(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }

        let entry = LogEntry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S,%3f").to_string(),
            level,
            message,
        };

        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", entry.to_line()) {
                tracing::warn!("Failed to write run log: {}", e);
            }
        }
        if inner.buffer.len() >= inner.max_entries {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(entry);
    }

    /// Most recent entries, oldest first.
    pub fn entries(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        let skip = limit.map_or(0, |n| inner.buffer.len().saturating_sub(n));
        inner.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Flush and release the file. Later entries only reach memory and
    /// `tracing`.
    pub fn close(&self) -> io::Result<()> {
        let file = self.inner.lock().file.take();
        match file {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Contents of `compressor.log` in `dir`, or `None` if no run has
    /// written one yet.
    pub fn read_log(dir: &Path) -> io::Result<Option<String>> {
        match std::fs::read_to_string(dir.join(LOG_FILE_NAME)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}
