//! Configuration types

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::tls::SslConfig;

/// Named plugin configuration blobs.
///
/// Each value stays untyped until the plugin registry hands it to the
/// plugin, which deserializes it into its own config struct.
pub type PluginConfigs = BTreeMap<String, serde_yaml::Value>;

/// Root configuration structure
///
/// ```yaml
/// procs: 4
/// logging:
///   file: { out: "-", format: text, level: info }
/// listeners:
///   "127.0.0.1:5433":
///     ssl:
///       enabled: true
///       certificate: cert.pem
///       key: key.pem
///     authentication:
///       passthrough:
///         host: db.internal
///         port: 5432
///     logging:
///       file: { out: /var/log/pggateway.log }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker threads for the runtime (0 = one per core)
    #[serde(default)]
    pub procs: usize,

    /// Process-wide logging plugins (server-level messages)
    #[serde(default)]
    pub logging: PluginConfigs,

    /// Listeners keyed by bind address
    #[serde(default)]
    pub listeners: BTreeMap<String, ListenerConfig>,
}

impl Config {
    /// Fill in each listener's `bind` from its map key.
    pub(crate) fn resolve_listeners(&mut self) {
        for (bind, listener) in self.listeners.iter_mut() {
            listener.bind = bind.clone();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.listeners.is_empty() {
            return Err("at least one listener must be configured".into());
        }

        for (bind, listener) in &self.listeners {
            listener
                .validate()
                .map_err(|e| format!("listener {}: {}", bind, e))?;
        }

        Ok(())
    }
}

/// Per-listener configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Bind address, taken from the `listeners` map key
    #[serde(skip)]
    pub bind: String,

    /// SSL negotiation toward clients
    #[serde(default)]
    pub ssl: SslConfig,

    /// Exactly one authentication plugin
    #[serde(default)]
    pub authentication: PluginConfigs,

    /// Logging plugins for sessions of this listener
    #[serde(default)]
    pub logging: PluginConfigs,

    /// Optional timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl ListenerConfig {
    /// Create a listener config for `bind` with a single auth plugin.
    pub fn new(bind: impl Into<String>, auth_plugin: &str, auth_config: serde_yaml::Value) -> Self {
        let mut authentication = PluginConfigs::new();
        authentication.insert(auth_plugin.to_string(), auth_config);
        Self {
            bind: bind.into(),
            authentication,
            ..Default::default()
        }
    }

    /// The single authentication plugin entry.
    pub fn auth_plugin(&self) -> Option<(&str, &serde_yaml::Value)> {
        self.authentication
            .iter()
            .next()
            .map(|(name, config)| (name.as_str(), config))
    }

    /// Validate this listener's settings
    pub fn validate(&self) -> Result<(), String> {
        self.bind
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid bind address {:?}: {}", self.bind, e))?;

        match self.authentication.len() {
            1 => {}
            0 => return Err("an authentication plugin is required".into()),
            n => {
                return Err(format!(
                    "exactly one authentication plugin is allowed, found {}",
                    n
                ))
            }
        }

        self.ssl.validate()?;
        self.timeouts.validate()
    }
}

/// Optional timeouts; unset means wait indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Upstream dial timeout
    #[serde(default)]
    pub connect_secs: Option<u64>,

    /// Limit on everything before the proxy loop (SSL, startup, both auths)
    #[serde(default)]
    pub handshake_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.connect_secs == Some(0) {
            return Err("timeouts.connect_secs must be greater than 0".into());
        }
        if self.handshake_secs == Some(0) {
            return Err("timeouts.handshake_secs must be greater than 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(bind: &str) -> ListenerConfig {
        ListenerConfig::new(bind, "passthrough", serde_yaml::Value::Null)
    }

    #[test]
    fn test_listener_validate_ok() {
        assert!(listener("127.0.0.1:5433").validate().is_ok());
        assert!(listener("[::1]:5433").validate().is_ok());
    }

    #[test]
    fn test_listener_validate_bad_bind() {
        let err = listener("localhost").validate().unwrap_err();
        assert!(err.contains("invalid bind address"));
    }

    #[test]
    fn test_listener_validate_auth_count() {
        let mut config = listener("127.0.0.1:5433");
        config.authentication.clear();
        assert!(config.validate().unwrap_err().contains("required"));

        let mut config = listener("127.0.0.1:5433");
        config
            .authentication
            .insert("iam".into(), serde_yaml::Value::Null);
        assert!(config.validate().unwrap_err().contains("exactly one"));
    }

    #[test]
    fn test_listener_validate_ssl() {
        let mut config = listener("127.0.0.1:5433");
        config.ssl.required = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.connect_timeout(), None);
        assert_eq!(timeouts.handshake_timeout(), None);

        let timeouts = TimeoutConfig {
            connect_secs: Some(5),
            handshake_secs: Some(30),
        };
        assert_eq!(timeouts.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(timeouts.handshake_timeout(), Some(Duration::from_secs(30)));

        let timeouts = TimeoutConfig {
            connect_secs: Some(0),
            handshake_secs: None,
        };
        assert!(timeouts.validate().is_err());
    }

    #[test]
    fn test_auth_plugin_accessor() {
        let config = listener("127.0.0.1:5433");
        let (name, _) = config.auth_plugin().unwrap();
        assert_eq!(name, "passthrough");
    }

    #[test]
    fn test_config_requires_listener() {
        assert!(Config::default().validate().is_err());
    }
}
