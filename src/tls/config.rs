//! Listener SSL configuration

use serde::Deserialize;
use std::path::PathBuf;

/// SSL settings of one listener
///
/// # Example YAML
/// ```yaml
/// ssl:
///   enabled: true
///   required: false
///   certificate: "/path/to/server.crt"
///   key: "/path/to/server.key"
/// ```
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// Answer `SSLRequest` with `'S'` and upgrade the connection.
    ///
    /// When `false` (default) every `SSLRequest` is declined with `'N'`.
    #[serde(default)]
    pub enabled: bool,

    /// Reject clients that start without an `SSLRequest`.
    #[serde(default)]
    pub required: bool,

    /// Server certificate chain in PEM format
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    /// Server private key in PEM format
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl SslConfig {
    /// Validate the SSL configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.required && !self.enabled {
            return Err("ssl.required is set but ssl.enabled is false".into());
        }
        if self.enabled {
            if self.certificate.is_none() {
                return Err("ssl.enabled requires ssl.certificate".into());
            }
            if self.key.is_none() {
                return Err("ssl.enabled requires ssl.key".into());
            }
        }
        Ok(())
    }
}
