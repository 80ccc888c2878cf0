//! `tracing` logging plugin

use serde::Deserialize;

use crate::error::Result;
use crate::plugins::{LogLevel, LoggingContext, LoggingPlugin};

/// Config for the `tracing` plugin
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingLoggingConfig {
    /// Minimum level forwarded (default `info`)
    #[serde(default)]
    pub level: Option<String>,
}

/// Forwards session log entries to the process-wide `tracing` subscriber.
#[derive(Debug)]
pub struct TracingLogging {
    level: LogLevel,
}

impl TracingLogging {
    pub fn new(config: TracingLoggingConfig) -> Result<Self> {
        let level = match config.level.as_deref() {
            Some(level) => level.parse()?,
            None => LogLevel::Info,
        };
        Ok(Self { level })
    }
}

impl LoggingPlugin for TracingLogging {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn log(&self, level: LogLevel, context: Option<&LoggingContext>, message: &str) {
        let context = context
            .and_then(|c| serde_json::to_string(c).ok())
            .unwrap_or_default();

        match level {
            LogLevel::Trace => trace!(context = %context, "{}", message),
            LogLevel::Debug => debug!(context = %context, "{}", message),
            LogLevel::Info => info!(context = %context, "{}", message),
            LogLevel::Warn => warn!(context = %context, "{}", message),
            LogLevel::Error | LogLevel::Fatal => error!(context = %context, "{}", message),
        }
    }
}
