//! Logging plugins
//!
//! - `file`: JSON Lines or text, to stdout or an append-mode file, written
//!   by a background thread fed through a bounded queue
//! - `cloudwatch` (alias `cloudwatchlogs`): JSON events uploaded to a
//!   CloudWatch Logs stream, fed through the same kind of queue
//! - `tracing`: hands entries to the process `tracing` subscriber

mod cloudwatch;
mod file;
mod subscriber;

pub use self::cloudwatch::{CloudWatchLogging, CloudWatchLoggingConfig};
pub use self::file::{FileLogging, FileLoggingConfig, LogFormat};
pub use self::subscriber::{TracingLogging, TracingLoggingConfig};

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::{parse_plugin_config, LogLevel, LoggingContext, LoggingPlugin};
use crate::error::Result;

/// Entries queued per plugin before new ones are dropped
pub(crate) const QUEUE_CAPACITY: usize = 1024;

/// One queued log entry; serializes as a JSON line.
#[derive(Debug, Serialize)]
pub(crate) struct LogRecord {
    #[serde(serialize_with = "serialize_time")]
    time: DateTime<Utc>,
    level: LogLevel,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<LoggingContext>,
}

fn serialize_time<S: serde::Serializer>(
    time: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl LogRecord {
    pub(crate) fn new(level: LogLevel, context: Option<&LoggingContext>, message: &str) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.to_string(),
            context: context.cloned(),
        }
    }
}

impl fmt::Display for LogRecord {
    /// Text format: `<time> <LEVEL> <message> key=value ...`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level.as_str().to_ascii_uppercase(),
            self.message
        )?;
        if let Some(context) = &self.context {
            for (key, value) in context {
                match value {
                    serde_json::Value::String(s) => write!(f, " {}={}", key, s)?,
                    other => write!(f, " {}={}", key, other)?,
                }
            }
        }
        Ok(())
    }
}

/// Logging plugins known to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingPluginKind {
    File,
    CloudWatch,
    Tracing,
}

impl LoggingPluginKind {
    const NAMES: &'static [(&'static str, LoggingPluginKind)] = &[
        ("file", LoggingPluginKind::File),
        ("cloudwatch", LoggingPluginKind::CloudWatch),
        ("cloudwatchlogs", LoggingPluginKind::CloudWatch),
        ("tracing", LoggingPluginKind::Tracing),
    ];

    /// Look a plugin up by its config name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| *kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoggingPluginKind::File => "file",
            LoggingPluginKind::CloudWatch => "cloudwatch",
            LoggingPluginKind::Tracing => "tracing",
        }
    }

    /// Build the plugin from its config blob.
    pub fn build(&self, config: &serde_yaml::Value) -> Result<Box<dyn LoggingPlugin>> {
        Ok(match self {
            LoggingPluginKind::File => Box::new(FileLogging::new(parse_plugin_config(config)?)?),
            LoggingPluginKind::CloudWatch => {
                Box::new(CloudWatchLogging::new(parse_plugin_config(config)?)?)
            }
            LoggingPluginKind::Tracing => {
                Box::new(TracingLogging::new(parse_plugin_config(config)?)?)
            }
        })
    }
}
