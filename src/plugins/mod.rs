//! Authentication and logging plugins
//!
//! Every listener owns one [`PluginRegistry`]: exactly one authentication
//! plugin and any number of logging plugins, all built from the listener's
//! config before its socket is bound. Plugins are picked from fixed tables
//! ([`AuthPluginKind`], [`LoggingPluginKind`]), so an unknown name is a
//! startup error rather than a silent no-op.
//!
//! The registry is read-only after construction and shared between all
//! sessions of the listener through an `Arc`.

pub mod auth;
pub mod logging;

#[cfg(test)]
pub(crate) mod fake_aws;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{ListenerConfig, PluginConfigs};
use crate::error::{GatewayError, Result};
use crate::protocol::SQLSTATE_INVALID_CATALOG_NAME;
use crate::server::Session;

pub use auth::AuthPluginKind;
pub use logging::LoggingPluginKind;

/// Structured context attached to a log entry.
///
/// Ordered, so the same session state always serializes the same way.
pub type LoggingContext = BTreeMap<String, serde_json::Value>;

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(GatewayError::Config(format!(
                "unknown log level {:?}, expected one of trace, debug, info, warn, error, fatal",
                other
            ))),
        }
    }
}

/// Authenticates a session and leaves it with a live upstream connection.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// `Ok(true)`: authenticated, upstream connected and ready to proxy.
    /// `Ok(false)`: credentials rejected; the session tells the client.
    /// `Err`: the session is aborted.
    async fn authenticate(&self, session: &mut Session) -> Result<bool>;

    /// Databases `user` may connect to. Empty means unrestricted.
    fn allowed_databases(&self, _user: &str) -> &[String] {
        &[]
    }
}

/// Receives structured log entries.
///
/// Called concurrently from every session; implementations must not block
/// for long and must swallow their own failures.
pub trait LoggingPlugin: Send + Sync {
    /// Whether entries at `level` would be written at all.
    fn enabled(&self, level: LogLevel) -> bool;

    fn log(&self, level: LogLevel, context: Option<&LoggingContext>, message: &str);
}

/// Deserialize a plugin's config blob into its typed config.
///
/// An empty entry (`file:` with no value) is read as an empty mapping, so
/// defaults apply and missing required keys are reported by name.
pub(crate) fn parse_plugin_config<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T> {
    let value = if value.is_null() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        value.clone()
    };
    serde_yaml::from_value(value).map_err(|e| GatewayError::Config(e.to_string()))
}

/// Check a database against an allow-list.
///
/// An empty list allows everything; `*` matches any database.
pub fn database_allowed(databases: &[String], database: &str) -> bool {
    databases.is_empty()
        || databases
            .iter()
            .any(|allowed| allowed == "*" || allowed == database)
}

/// One authentication plugin plus the logging fan-out of a listener.
pub struct PluginRegistry {
    auth: Option<Box<dyn AuthPlugin>>,
    logging: Vec<(String, Box<dyn LoggingPlugin>)>,
}

impl PluginRegistry {
    /// Build every configured plugin, failing on the first unknown name or
    /// bad config.
    pub fn new(authentication: &PluginConfigs, logging: &PluginConfigs) -> Result<Self> {
        if authentication.len() > 1 {
            return Err(GatewayError::Config(format!(
                "exactly one authentication plugin is allowed, found {}",
                authentication.len()
            )));
        }

        let auth = match authentication.iter().next() {
            Some((name, config)) => {
                let kind = AuthPluginKind::from_name(name).ok_or_else(|| {
                    GatewayError::Config(format!(
                        "could not find authentication plugin: {}",
                        name
                    ))
                })?;
                Some(kind.build(config).map_err(|e| {
                    GatewayError::Config(format!("authentication plugin {}: {}", name, e))
                })?)
            }
            None => None,
        };

        let mut loggers = Vec::with_capacity(logging.len());
        for (name, config) in logging {
            let kind = LoggingPluginKind::from_name(name).ok_or_else(|| {
                GatewayError::Config(format!("could not find logging plugin: {}", name))
            })?;
            let plugin = kind
                .build(config)
                .map_err(|e| GatewayError::Config(format!("logging plugin {}: {}", name, e)))?;
            loggers.push((name.clone(), plugin));
        }

        Ok(Self {
            auth,
            logging: loggers,
        })
    }

    /// Build the registry for one listener.
    pub fn for_listener(config: &ListenerConfig) -> Result<Self> {
        if config.authentication.is_empty() {
            return Err(GatewayError::Config(format!(
                "listener {}: an authentication plugin is required",
                config.bind
            )));
        }
        Self::new(&config.authentication, &config.logging)
    }

    /// Build a registry with logging plugins only (server-level messages).
    pub fn logging_only(logging: &PluginConfigs) -> Result<Self> {
        Self::new(&PluginConfigs::new(), logging)
    }

    /// Assemble a registry from already built plugins.
    pub fn with_plugins(
        auth: Option<Box<dyn AuthPlugin>>,
        logging: Vec<(String, Box<dyn LoggingPlugin>)>,
    ) -> Self {
        Self { auth, logging }
    }

    /// Names of the configured logging plugins
    pub fn logging_plugins(&self) -> impl Iterator<Item = &str> {
        self.logging.iter().map(|(name, _)| name.as_str())
    }

    /// Authenticate a session with the configured plugin.
    ///
    /// This is the only place the database allow-list is checked; a
    /// rejected database never reaches the plugin, so nothing is dialed.
    pub async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            GatewayError::Plugin("no authentication plugin configured".into())
        })?;

        if !database_allowed(auth.allowed_databases(session.user()), session.database()) {
            let message = format!("database \"{}\" is not allowed", session.database());
            return Err(session
                .write_fatal_and_return_error(SQLSTATE_INVALID_CATALOG_NAME, message)
                .await);
        }

        auth.authenticate(session).await
    }

    /// Whether any logging plugin wants entries at `level`.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.logging.iter().any(|(_, plugin)| plugin.enabled(level))
    }

    /// Fan one entry out to every logging plugin.
    pub fn log(&self, level: LogLevel, context: Option<&LoggingContext>, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        let message = message.to_string();
        for (_, plugin) in &self.logging {
            if plugin.enabled(level) {
                plugin.log(level, context, &message);
            }
        }
    }

    pub fn log_debug(&self, context: Option<&LoggingContext>, message: impl fmt::Display) {
        self.log(LogLevel::Debug, context, message)
    }

    pub fn log_info(&self, context: Option<&LoggingContext>, message: impl fmt::Display) {
        self.log(LogLevel::Info, context, message)
    }

    pub fn log_warn(&self, context: Option<&LoggingContext>, message: impl fmt::Display) {
        self.log(LogLevel::Warn, context, message)
    }

    pub fn log_error(&self, context: Option<&LoggingContext>, message: impl fmt::Display) {
        self.log(LogLevel::Error, context, message)
    }

    pub fn log_fatal(&self, context: Option<&LoggingContext>, message: impl fmt::Display) {
        self.log(LogLevel::Fatal, context, message)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("auth", &self.auth.is_some())
            .field("logging", &self.logging_plugins().collect::<Vec<_>>())
            .finish()
    }
}
