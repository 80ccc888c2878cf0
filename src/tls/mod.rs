//! TLS/SSL support for pggateway
//!
//! Both legs of a gateway session may be encrypted:
//! - **Server-side TLS**: upgrading an incoming client after it sends an
//!   `SSLRequest` and the listener answers `'S'`
//! - **Client-side TLS**: wrapping the upstream connection when the client
//!   session itself is encrypted
//!
//! ```text
//! ┌──────────┐        TLS        ┌───────────┐        TLS        ┌──────────┐
//! │  Client  │ ───────────────── │  Gateway  │ ───────────────── │ Postgres │
//! │  (psql)  │   (server-side)   │           │   (skip-verify)   │  Server  │
//! └──────────┘                   └───────────┘                   └──────────┘
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listeners:
//!   "0.0.0.0:5433":
//!     ssl:
//!       enabled: true
//!       required: true
//!       certificate: "/path/to/server.crt"
//!       key: "/path/to/server.key"
//! ```
//!
//! # Security
//!
//! The upstream leg does not verify the database certificate. The gateway
//! is expected to run next to the database it fronts; operators who need
//! verified upstream TLS must terminate it elsewhere.

mod acceptor;
mod config;
mod connector;
mod error;

pub use acceptor::TlsAcceptor;
pub use config::SslConfig;
pub use connector::TlsConnector;
pub use error::{Leg, TlsError};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Load certificates from a PEM file
///
/// Reads all certificates from a PEM-encoded file, so chains are supported.
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;

    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;

    Ok(certs)
}

/// Load a private key (RSA, PKCS8 or EC) from a PEM file
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;

    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}
