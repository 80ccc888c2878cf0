//! Error types for pggateway

use std::io;

use thiserror::Error;

use crate::tls::TlsError;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol violation (unexpected message, missing startup option, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Upstream connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Plugin construction or lookup error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer closed the connection between messages
    #[error("connection closed by peer")]
    UnexpectedEof,
}

impl GatewayError {
    /// Whether this error is a clean close of one side of the session.
    ///
    /// Clean closes end a session normally and are never logged as errors.
    pub fn is_clean_close(&self) -> bool {
        match self {
            GatewayError::UnexpectedEof => true,
            GatewayError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type alias for GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}
