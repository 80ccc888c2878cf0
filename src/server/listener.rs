//! TCP listener for incoming client connections
//!
//! Each accepted connection gets its own task, which negotiates SSL, reads
//! the startup message, checks the required startup options and then hands
//! a [`Session`] the rest of the connection's life.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;

use super::session::{write_fatal, Session};
use super::stream::NetworkStream;
use crate::config::ListenerConfig;
use crate::error::{GatewayError, Result};
use crate::plugins::{LoggingContext, PluginRegistry};
use crate::protocol::{
    read_startup_message, StartupMessage, StartupMessageType, SQLSTATE_INVALID_AUTHORIZATION,
    SQLSTATE_PROTOCOL_VIOLATION, SSL_ACCEPTED, SSL_DECLINED,
};
use crate::tls::{Leg, TlsAcceptor};

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
}

/// State shared by every connection task of one listener.
struct Shared {
    config: ListenerConfig,
    registry: Arc<PluginRegistry>,
    tls: Option<TlsAcceptor>,
}

/// A client connection after SSL negotiation and startup.
struct Negotiated {
    stream: NetworkStream,
    startup: StartupMessage,
    is_ssl: bool,
}

/// Accepts client connections for one listener config.
pub struct Listener {
    listener: TcpListener,
    shared: Arc<Shared>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Load the TLS material (when SSL is enabled) and bind the socket.
    pub async fn bind(config: ListenerConfig, registry: Arc<PluginRegistry>) -> Result<Self> {
        let tls = if config.ssl.enabled {
            Some(TlsAcceptor::new(&config.ssl)?)
        } else {
            None
        };

        let listener = TcpListener::bind(&config.bind).await.map_err(|e| {
            GatewayError::Connection(format!("failed to bind {}: {}", config.bind, e))
        })?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                registry,
                tls,
            }),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address the listener is bound to.
    ///
    /// Useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.shared.registry
    }

    /// Run the accept loop until `shutdown` fires.
    ///
    /// An accept error ends the loop and is returned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.shared.registry.log_error(None, format_args!("error accepting client: {}", e));
                            break Err(e.into());
                        }
                    };

                    debug!("Accepted connection from {}", addr);
                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let shared = Arc::clone(&self.shared);
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, shared).await;
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        debug!("Connection from {} closed", addr);
                    });
                }

                _ = stopped(&mut shutdown) => {
                    break Ok(());
                }
            }
        };

        info!(
            "Listener {} stopped. Total: {}, Active: {}",
            self.shared.config.bind,
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.connections_active.load(Ordering::Relaxed)
        );
        result
    }
}

/// Serve one client connection from accept to close.
///
/// Errors are logged here; only the spawned task sees the outcome.
async fn handle_connection(tcp: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let registry = Arc::clone(&shared.registry);
    let deadline = shared
        .config
        .timeouts
        .handshake_timeout()
        .map(|limit| Instant::now() + limit);

    let negotiated = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, negotiate(tcp, &shared))
            .await
            .unwrap_or_else(|_| Err(GatewayError::Timeout("startup did not finish in time".into()))),
        None => negotiate(tcp, &shared).await,
    };

    let Negotiated {
        stream,
        startup,
        is_ssl,
    } = match negotiated {
        Ok(Some(negotiated)) => negotiated,
        Ok(None) => return,
        // Scanners and clients that give up mid-handshake are routine
        Err(GatewayError::Tls(e)) if e.leg() == Some(Leg::Client) => {
            registry.log_warn(Some(&client_context(addr)), e);
            return;
        }
        Err(e) => {
            if !e.is_clean_close() {
                registry.log_error(
                    Some(&client_context(addr)),
                    format_args!("error handling client session: {}", e),
                );
            }
            return;
        }
    };

    let session = match Session::new(startup, stream, is_ssl, Arc::clone(&registry)) {
        Ok(session) => session
            .with_connect_timeout(shared.config.timeouts.connect_timeout())
            .with_handshake_deadline(deadline),
        Err(e) => {
            registry.log_error(
                Some(&client_context(addr)),
                format_args!("error creating new client session: {}", e),
            );
            return;
        }
    };

    let context = session.logging_context();
    registry.log_info(Some(&context), "new client session");

    match session.handle().await {
        Ok(()) => registry.log_info(Some(&context), "client session closed"),
        Err(e) if e.is_clean_close() => registry.log_info(Some(&context), "client session closed"),
        Err(e) => registry.log_error(
            Some(&context),
            format_args!("error handling client session: {}", e),
        ),
    }
}

/// Resolves once the shutdown flag is set, including before the first
/// poll, or when the server is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// SSL negotiation and startup checks.
///
/// `Ok(None)` means the connection was answered and should be closed:
/// declined SSL, a cancel request, or a fatal error already sent.
async fn negotiate(tcp: TcpStream, shared: &Shared) -> Result<Option<Negotiated>> {
    tcp.set_nodelay(true)?;
    let mut stream = NetworkStream::from(tcp);

    let startup = loop {
        match read_startup_message(&mut stream).await? {
            StartupMessageType::SSLRequest => {
                if stream.is_encrypted() {
                    return Err(GatewayError::Protocol(
                        "SSLRequest received on an encrypted connection".into(),
                    ));
                }
                let Some(acceptor) = &shared.tls else {
                    stream.write_all(&[SSL_DECLINED]).await?;
                    stream.flush().await?;
                    return Ok(None);
                };
                stream.write_all(&[SSL_ACCEPTED]).await?;
                stream.flush().await?;

                let tcp = stream.into_tcp().map_err(|_| {
                    GatewayError::Protocol("connection is already encrypted".into())
                })?;
                stream = NetworkStream::ServerTls(Box::new(acceptor.accept(tcp).await?));
            }
            StartupMessageType::GssEncRequest => {
                // Clients fall back to SSL or plaintext on the same connection
                stream.write_all(&[SSL_DECLINED]).await?;
                stream.flush().await?;
            }
            StartupMessageType::CancelRequest(request) => {
                debug!(
                    "dropping cancel request for backend pid {}",
                    request.process_id
                );
                return Ok(None);
            }
            StartupMessageType::Startup(startup) => break startup,
        }
    };

    if shared.config.ssl.required && !stream.is_encrypted() {
        reject(
            &mut stream,
            SQLSTATE_INVALID_AUTHORIZATION,
            "server does not support SSL, but SSL was required",
        )
        .await;
        return Ok(None);
    }
    if startup.user().is_none() {
        reject(
            &mut stream,
            SQLSTATE_PROTOCOL_VIOLATION,
            "user startup option is required",
        )
        .await;
        return Ok(None);
    }
    if startup.database().is_none() {
        reject(
            &mut stream,
            SQLSTATE_PROTOCOL_VIOLATION,
            "database startup option is required",
        )
        .await;
        return Ok(None);
    }

    Ok(Some(Negotiated {
        is_ssl: stream.is_encrypted(),
        stream,
        startup,
    }))
}

async fn reject(stream: &mut NetworkStream, code: &str, message: &str) {
    debug!("rejecting client: {}", message);
    if let Err(e) = write_fatal(stream, code, message).await {
        debug!("failed to send error to client: {}", e);
    }
}

fn client_context(addr: SocketAddr) -> LoggingContext {
    let mut context = LoggingContext::new();
    context.insert("client".into(), Value::String(addr.to_string()));
    context
}
