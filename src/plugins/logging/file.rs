//! `file` logging plugin.
//!
//! Entries are handed to a bounded channel with `try_send()` so a session
//! never waits on disk I/O; a background thread drains the channel and
//! writes each entry as a JSON line or a text line. When the queue is full
//! the entry is dropped.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::str::FromStr;
use std::thread::JoinHandle;

use serde::Deserialize;
use tokio::sync::mpsc;

use super::{LogRecord, QUEUE_CAPACITY};
use crate::error::{GatewayError, Result};
use crate::plugins::{LogLevel, LoggingContext, LoggingPlugin};

/// Flush the writer every this many entries.
const FLUSH_INTERVAL: u64 = 100;

/// Config for the `file` plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLoggingConfig {
    /// `-` for stdout, otherwise a file opened in append mode
    #[serde(default = "default_out")]
    pub out: String,

    /// `json` (default) or `text`
    #[serde(default)]
    pub format: Option<String>,

    /// Minimum level written (default `warn`)
    #[serde(default)]
    pub level: Option<String>,
}

fn default_out() -> String {
    "-".to_string()
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            out: default_out(),
            format: None,
            level: None,
        }
    }
}

/// Output format of the `file` plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(GatewayError::Config(format!(
                "unknown log format \"{}\", expected 'text' or 'json'",
                other
            ))),
        }
    }
}

/// Writes structured log entries to stdout or a file.
pub struct FileLogging {
    level: LogLevel,
    tx: Option<mpsc::Sender<Box<LogRecord>>>,
    writer: Option<JoinHandle<()>>,
}

impl FileLogging {
    /// Open the output and start the writer thread.
    pub fn new(config: FileLoggingConfig) -> Result<Self> {
        let format = match config.format.as_deref() {
            Some(format) => format.parse()?,
            None => LogFormat::Json,
        };
        let level = match config.level.as_deref() {
            Some(level) => level.parse()?,
            None => LogLevel::Warn,
        };

        let out: Box<dyn Write + Send> = match config.out.as_str() {
            "-" => Box::new(io::stdout()),
            path => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        GatewayError::Config(format!("failed to open log file {}: {}", path, e))
                    })?,
            ),
        };

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = std::thread::Builder::new()
            .name("pggateway-file-log".into())
            .spawn(move || run_logging_task(rx, out, format))?;

        Ok(Self {
            level,
            tx: Some(tx),
            writer: Some(writer),
        })
    }
}

impl LoggingPlugin for FileLogging {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn log(&self, level: LogLevel, context: Option<&LoggingContext>, message: &str) {
        let Some(tx) = &self.tx else {
            return;
        };
        let record = LogRecord::new(level, context, message);
        if tx.try_send(Box::new(record)).is_err() {
            trace!("log queue full, dropping entry");
        }
    }
}

impl Drop for FileLogging {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop after it drains
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Drains the channel until every sender is gone.
fn run_logging_task(
    mut rx: mpsc::Receiver<Box<LogRecord>>,
    mut out: Box<dyn Write + Send>,
    format: LogFormat,
) {
    let mut entry_count: u64 = 0;

    while let Some(record) = rx.blocking_recv() {
        let written = match format {
            LogFormat::Json => serde_json::to_string(&record)
                .map_err(io::Error::other)
                .and_then(|json| writeln!(out, "{}", json)),
            LogFormat::Text => writeln!(out, "{}", record),
        };
        if let Err(e) = written {
            debug!("Failed to write log entry: {}", e);
        }
        entry_count += 1;

        if entry_count % FLUSH_INTERVAL == 0 {
            let _ = out.flush();
        }
    }

    let _ = out.flush();
}
