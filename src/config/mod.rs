//! Configuration module for pggateway
//!
//! One YAML document, loaded once at startup. Listeners are keyed by their
//! bind address; plugin sections stay untyped until the plugin registry
//! builds the plugin:
//!
//! ```yaml
//! logging:
//!   file: { out: "-", format: text }
//! listeners:
//!   "127.0.0.1:5433":
//!     ssl: { enabled: true, certificate: cert.pem, key: key.pem }
//!     authentication:
//!       passthrough: { host: db.internal, port: 5432 }
//! ```
//!
//! `${VAR}` and `$VAR` references in string values are expanded from the
//! environment.

mod loader;
mod types;

pub use loader::{load_config, load_config_from_str};
pub use types::*;
