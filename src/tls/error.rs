//! TLS errors for both gateway legs

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which side of the gateway a TLS session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Incoming client, gateway in the server role
    Client,
    /// Database connection, gateway in the client role
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Leg::Client => "client",
            Leg::Upstream => "upstream",
        })
    }
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("cannot load certificate {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("cannot load private key {path}: {reason}")]
    PrivateKeyLoad { path: PathBuf, reason: String },

    #[error("{leg} TLS handshake failed: {reason}")]
    Handshake { leg: Leg, reason: String },

    /// The upstream answered an `SSLRequest` with something other than `'S'`
    #[error("SSL negotiation refused: {0}")]
    Refused(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(leg: Leg, reason: impl fmt::Display) -> Self {
        TlsError::Handshake {
            leg,
            reason: reason.to_string(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }

    /// The leg a handshake failure happened on, if this is one.
    pub fn leg(&self) -> Option<Leg> {
        match self {
            TlsError::Handshake { leg, .. } => Some(*leg),
            TlsError::Refused(_) => Some(Leg::Upstream),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_load_error_display() {
        let err = TlsError::cert_load("/etc/pggateway/cert.pem", "file not found");
        assert_eq!(
            err.to_string(),
            "cannot load certificate /etc/pggateway/cert.pem: file not found"
        );
        assert_eq!(err.leg(), None);
    }

    #[test]
    fn test_handshake_names_leg() {
        let err = TlsError::handshake(Leg::Client, "client disconnected");
        assert_eq!(err.to_string(), "client TLS handshake failed: client disconnected");
        assert_eq!(err.leg(), Some(Leg::Client));

        let err = TlsError::handshake(Leg::Upstream, "bad record mac");
        assert!(err.to_string().starts_with("upstream TLS"));
    }

    #[test]
    fn test_refused_is_upstream() {
        let err = TlsError::Refused("upstream answered 'N'".into());
        assert_eq!(err.to_string(), "SSL negotiation refused: upstream answered 'N'");
        assert_eq!(err.leg(), Some(Leg::Upstream));
    }
}
