//! pggateway - PostgreSQL wire-protocol gateway
//!
//! This library provides the pieces of a gateway that sits between
//! PostgreSQL clients and real servers:
//! - Negotiates SSL with clients and, for encrypted sessions, with the upstream
//! - Authenticates clients through a pluggable [`plugins::AuthPlugin`]
//!   (passthrough, AWS IAM, or gateway-held virtual users)
//! - Logs in to the upstream on the client's behalf (cleartext, MD5 or
//!   SCRAM-SHA-256)
//! - Relays the session afterwards, batching server output
//! - Fans structured session logs out to [`plugins::LoggingPlugin`]s

#[macro_use]
mod logging;

pub mod config;
pub mod crypto;
pub mod error;
pub mod plugins;
pub mod protocol;
pub mod server;
pub mod tls;

pub use config::{Config, ListenerConfig};
pub use error::{GatewayError, Result};
pub use plugins::{AuthPlugin, LogLevel, LoggingContext, LoggingPlugin, PluginRegistry};
pub use server::{Listener, NetworkStream, PasswordMethod, Server, Session};
pub use tls::{SslConfig, TlsAcceptor, TlsConnector, TlsError};
