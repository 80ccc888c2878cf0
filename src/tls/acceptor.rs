//! TLS Acceptor for the listener's SSL upgrade
//!
//! After the listener answers an `SSLRequest` with `'S'`, the raw TCP stream
//! is handed to [`TlsAcceptor::accept`] which performs the server-role
//! handshake using the listener's certificate/key pair.

use std::sync::Arc;

use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::tls::{load_certificates, load_private_key, Leg, SslConfig, TlsError};

/// TLS Acceptor for upgrading client connections to TLS
///
/// Cheap to clone; every accepted connection shares the same rustls config.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Create a new TLS acceptor from a listener's SSL configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `certificate` or `key` is not specified
    /// - Certificate file cannot be read or contains no certificates
    /// - Private key file cannot be read or parsed
    /// - The certificate and key do not form a valid pair
    pub fn new(config: &SslConfig) -> Result<Self, TlsError> {
        config.validate().map_err(TlsError::config)?;

        let cert_path = config
            .certificate
            .as_ref()
            .ok_or_else(|| TlsError::config("certificate is required"))?;

        let key_path = config
            .key
            .as_ref()
            .ok_or_else(|| TlsError::config("key is required"))?;

        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(
                cert_path,
                "no certificates found in file",
            ));
        }

        let key = load_private_key(key_path)?;

        let provider = rustls::crypto::ring::default_provider();

        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        Ok(Self { inner: acceptor })
    }

    /// Upgrade a TCP stream to TLS
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or the client disconnects
    /// during the handshake.
    pub async fn accept(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>, TlsError> {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(Leg::Client, e))
    }
}
