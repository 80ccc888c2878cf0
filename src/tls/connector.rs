//! Client-role TLS for the upstream leg
//!
//! An encrypted client session is carried to the database encrypted as
//! well: the connector sends an `SSLRequest`, expects `'S'` and runs the
//! handshake without verifying the database's certificate.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::protocol::{SSL_ACCEPTED, SSL_REQUEST_CODE};
use crate::tls::{Leg, TlsError};

/// Skip-verify connector for upstream databases
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Connector that accepts any certificate the upstream presents.
    pub fn new_insecure() -> Result<Self, TlsError> {
        let provider = rustls::crypto::ring::default_provider();

        let client_config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("unsupported protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Run the handshake on a stream where SSL was already agreed.
    ///
    /// `server_name` is only used for SNI; IP literals are accepted.
    pub async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("invalid server name {:?}", server_name)))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::handshake(Leg::Upstream, e))
    }

    /// Ask the Postgres server at `addr` (`host:port`) for SSL and upgrade.
    pub async fn upgrade(
        &self,
        mut stream: TcpStream,
        addr: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let mut request = [0u8; 8];
        request[..4].copy_from_slice(&8u32.to_be_bytes());
        request[4..].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(|e| TlsError::handshake(Leg::Upstream, e))?;

        let answer = stream
            .read_u8()
            .await
            .map_err(|e| TlsError::handshake(Leg::Upstream, e))?;
        if answer != SSL_ACCEPTED {
            return Err(TlsError::Refused(format!("upstream {} does not accept SSL", addr)));
        }

        self.connect(stream, sni_host(addr)).await
    }
}

/// Host part of `host:port` or `[v6]:port`.
fn sni_host(addr: &str) -> &str {
    addr.rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']')
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_host() {
        assert_eq!(sni_host("db.internal:5432"), "db.internal");
        assert_eq!(sni_host("[::1]:5432"), "::1");
        assert_eq!(sni_host("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_upgrade_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[4..], &SSL_REQUEST_CODE.to_be_bytes());
            stream.write_all(b"N").await.unwrap();
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let err = TlsConnector::new_insecure()
            .unwrap()
            .upgrade(tcp, &addr.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::Refused(_)));
    }

    #[test]
    fn test_verifier_advertises_schemes() {
        use rustls::client::danger::ServerCertVerifier;
        let schemes = NoCertificateVerification.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
    }
}
