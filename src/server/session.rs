//! Gateway session: one client connection and, once an auth plugin dials
//! it, one upstream connection.
//!
//! The listener builds a [`Session`] after the SSL negotiation and startup
//! checks. [`Session::handle`] then runs authentication through the
//! listener's [`PluginRegistry`] and, on success, relays messages in both
//! directions until either side goes away.
//!
//! The `pub` helpers below are the surface auth plugins drive: challenging
//! the client for a password, dialing the upstream, authenticating to it,
//! and the two SCRAM-SHA-256 exchanges.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use super::stream::NetworkStream;
use crate::crypto::{
    compute_md5_password, generate_salt, ScramClient, ScramConversation, ScramServer, ScramStep,
    StoredCredentials,
};
use crate::error::{GatewayError, Result};
use crate::plugins::{LogLevel, LoggingContext, PluginRegistry};
use crate::protocol::{
    parse_authentication, parse_error_response, parse_sasl_initial_response, read_message,
    write_message, write_startup_message, AuthenticationRequest, Direction,
    ErrorResponse, Message, PasswordMessage, SaslInitialResponse, StartupMessage,
    MSG_AUTH_REQUEST, MSG_ERROR_RESPONSE, MSG_PASSWORD, SASL_MECHANISM_SCRAM_SHA_256,
    SASL_MECHANISM_SCRAM_SHA_256_PLUS, SQLSTATE_INVALID_PASSWORD, SQLSTATE_PROTOCOL_VIOLATION,
};
use crate::tls::TlsConnector;

/// Server messages held back before writing to the client.
pub const MAX_BATCHED_MESSAGES: usize = 15;

/// Password challenge sent to the client by [`Session::get_user_password`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordMethod {
    Cleartext,
    Md5,
}

/// One proxied client connection.
pub struct Session {
    id: Uuid,
    user: String,
    database: String,
    is_ssl: bool,
    tls_version: Option<&'static str>,
    salt: [u8; 4],
    startup: StartupMessage,

    client: NetworkStream,
    client_addr: Option<SocketAddr>,
    target: Option<NetworkStream>,
    target_addr: Option<SocketAddr>,

    /// Raw credential from the client's last password message
    password: Option<Vec<u8>>,
    stopped: Arc<AtomicBool>,
    registry: Arc<PluginRegistry>,

    connect_timeout: Option<Duration>,
    handshake_deadline: Option<Instant>,
}

impl Session {
    /// Create a session for a client whose startup message has been read.
    ///
    /// Fails if the startup message lacks `user` or `database`; the
    /// listener checks both (and tells the client) before getting here.
    pub fn new(
        startup: StartupMessage,
        client: NetworkStream,
        is_ssl: bool,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self> {
        let user = startup
            .user()
            .ok_or_else(|| GatewayError::Protocol("user startup option is required".into()))?
            .to_string();
        let database = startup
            .database()
            .ok_or_else(|| GatewayError::Protocol("database startup option is required".into()))?
            .to_string();
        let client_addr = client.peer_addr().ok();
        let tls_version = client.tls_version();

        Ok(Self {
            id: Uuid::new_v4(),
            user,
            database,
            is_ssl,
            tls_version,
            salt: generate_salt(),
            startup,
            client,
            client_addr,
            target: None,
            target_addr: None,
            password: None,
            stopped: Arc::new(AtomicBool::new(false)),
            registry,
            connect_timeout: None,
            handshake_deadline: None,
        })
    }

    /// Limit upstream dials to `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Abort authentication if it is still running at `deadline`.
    pub fn with_handshake_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.handshake_deadline = deadline;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_ssl(&self) -> bool {
        self.is_ssl
    }

    /// Salt used for MD5 challenges to the client
    pub fn salt(&self) -> [u8; 4] {
        self.salt
    }

    /// The client's startup message
    pub fn startup(&self) -> &StartupMessage {
        &self.startup
    }

    /// Credential from the client's last password message, if any
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Whether an upstream connection has been opened
    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    /// Structured context attached to every log entry of this session.
    pub fn logging_context(&self) -> LoggingContext {
        let mut context = LoggingContext::new();
        context.insert("session_id".into(), Value::String(self.id.to_string()));
        context.insert("user".into(), Value::String(self.user.clone()));
        context.insert("database".into(), Value::String(self.database.clone()));
        context.insert("ssl".into(), Value::Bool(self.is_ssl));
        context.insert(
            "tls_version".into(),
            self.tls_version.map_or(Value::Null, |v| Value::String(v.into())),
        );
        context.insert("client".into(), addr_value(self.client_addr));
        context.insert("target".into(), addr_value(self.target_addr));
        context
    }

    /// [`logging_context`](Self::logging_context) plus a description of `msg`.
    pub fn logging_context_with_message(&self, msg: &Message, direction: Direction) -> LoggingContext {
        with_message(self.logging_context(), msg, direction)
    }

    fn logger(&self) -> SessionLogger {
        SessionLogger {
            registry: Arc::clone(&self.registry),
            stopped: Arc::clone(&self.stopped),
            context: self.logging_context(),
        }
    }

    // ------------------------------------------------------------------
    // Message I/O
    // ------------------------------------------------------------------

    /// Read one message from the client.
    pub async fn parse_client_request(&mut self) -> Result<Message> {
        let result = read_message(&mut self.client).await;
        self.logger().observe(Direction::Frontend, result)
    }

    /// Read one message from the upstream server.
    pub async fn parse_server_response(&mut self) -> Result<Message> {
        let result = read_message(self.target_mut()?).await;
        self.logger().observe(Direction::Backend, result)
    }

    pub async fn write_to_client(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.client, msg).await
    }

    pub async fn write_to_server(&mut self, msg: &Message) -> Result<()> {
        write_message(self.target_mut()?, msg).await
    }

    /// Send a startup message to the upstream.
    pub async fn write_startup_to_server(&mut self, startup: &StartupMessage) -> Result<()> {
        write_startup_message(self.target_mut()?, startup).await
    }

    /// Send the client one fatal ErrorResponse and return the matching error.
    ///
    /// A failure to write is ignored; the returned error is what matters.
    pub async fn write_fatal_and_return_error(
        &mut self,
        code: &str,
        message: impl Into<String>,
    ) -> GatewayError {
        let message = message.into();
        if let Err(e) = write_fatal(&mut self.client, code, &message).await {
            debug!("failed to send error to client: {}", e);
        }
        GatewayError::Protocol(message)
    }

    fn target_mut(&mut self) -> Result<&mut NetworkStream> {
        self.target
            .as_mut()
            .ok_or_else(|| GatewayError::Connection("not connected to the upstream server".into()))
    }

    // ------------------------------------------------------------------
    // Client-side authentication
    // ------------------------------------------------------------------

    /// Challenge the client for a password and read its answer.
    ///
    /// MD5 challenges carry the session salt. The credential is cached on
    /// the session.
    pub async fn get_user_password(
        &mut self,
        method: PasswordMethod,
    ) -> Result<(AuthenticationRequest, PasswordMessage)> {
        let request = match method {
            PasswordMethod::Cleartext => AuthenticationRequest::CleartextPassword,
            PasswordMethod::Md5 => AuthenticationRequest::Md5Password { salt: self.salt },
        };
        self.write_to_client(&request.to_message()).await?;

        let msg = self.read_password_message().await?;
        let password = PasswordMessage::from_bytes(msg.payload);
        self.password = Some(password.password().to_vec());

        Ok((request, password))
    }

    async fn read_password_message(&mut self) -> Result<Message> {
        let msg = self.parse_client_request().await?;
        if msg.tag != MSG_PASSWORD {
            let message = format!(
                "expected password response, got {}",
                msg.name(Direction::Frontend)
            );
            return Err(self
                .write_fatal_and_return_error(SQLSTATE_PROTOCOL_VIOLATION, message)
                .await);
        }
        Ok(msg)
    }

    /// Authenticate the client with SCRAM-SHA-256, the gateway acting as
    /// the SCRAM server.
    ///
    /// `lookup` maps the SCRAM username to the stored verifier. On a bad
    /// proof the client is told "failed to authenticate" before the error
    /// is returned.
    pub async fn scram_sha256_client_auth<F>(&mut self, lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<StoredCredentials> + Send,
    {
        let advertise = AuthenticationRequest::Sasl {
            mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()],
        };
        self.write_to_client(&advertise.to_message()).await?;

        let msg = self.read_password_message().await?;
        let initial = parse_sasl_initial_response(&msg.payload)?;
        if initial.mechanism != SASL_MECHANISM_SCRAM_SHA_256 {
            let message = format!("unsupported SASL mechanism {:?}", initial.mechanism);
            return Err(self
                .write_fatal_and_return_error(SQLSTATE_PROTOCOL_VIOLATION, message)
                .await);
        }

        let mut server = ScramServer::new(lookup);
        let mut input = initial.data;
        loop {
            match server.step(&input) {
                Ok(ScramStep::Continue(challenge)) => {
                    let reply = AuthenticationRequest::SaslContinue { data: challenge };
                    self.write_to_client(&reply.to_message()).await?;
                    input = self.read_password_message().await?.payload;
                }
                Ok(ScramStep::Done(outcome)) => {
                    let reply = AuthenticationRequest::SaslFinal { data: outcome };
                    self.write_to_client(&reply.to_message()).await?;
                    break;
                }
                Err(e) => {
                    if let Err(write_err) =
                        write_fatal(&mut self.client, SQLSTATE_INVALID_PASSWORD, "failed to authenticate").await
                    {
                        debug!("failed to send error to client: {}", write_err);
                    }
                    return Err(e);
                }
            }
        }

        server.verify()
    }

    // ------------------------------------------------------------------
    // Upstream connection
    // ------------------------------------------------------------------

    /// Open the upstream connection to `host:port`.
    pub async fn dial_to_s(&mut self, host: &str, port: u16) -> Result<()> {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        self.connect_to_target(&addr).await
    }

    /// Open the upstream connection to `addr` (`host:port`).
    ///
    /// SSL sessions negotiate SSL with the upstream too, without verifying
    /// its certificate.
    pub async fn connect_to_target(&mut self, addr: &str) -> Result<()> {
        let connect = TcpStream::connect(addr);
        let tcp = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                GatewayError::Timeout(format!("connecting to {} took longer than {:?}", addr, limit))
            })?,
            None => connect.await,
        }
        .map_err(|e| GatewayError::Connection(format!("error connecting to server {}: {}", addr, e)))?;

        tcp.set_nodelay(true)?;
        self.target_addr = tcp.peer_addr().ok();

        let stream = if self.is_ssl {
            NetworkStream::ClientTls(Box::new(TlsConnector::new_insecure()?.upgrade(tcp, addr).await?))
        } else {
            NetworkStream::Tcp(tcp)
        };
        self.target = Some(stream);

        debug!("session {} connected to upstream {}", self.id, addr);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upstream authentication
    // ------------------------------------------------------------------

    /// Authenticate to the upstream server as `user`.
    ///
    /// The startup message is the client's with `user` replaced. The
    /// upstream's AuthenticationOk is forwarded to the client; an upstream
    /// ErrorResponse is forwarded as well and ends the session.
    pub async fn auth_on_server(&mut self, user: &str, password: &str) -> Result<()> {
        let startup = self.startup.for_user(user);
        self.write_startup_to_server(&startup).await?;

        let request = self.read_server_auth_request().await?;
        match request {
            AuthenticationRequest::Ok => {
                return self.write_to_client(&request.to_message()).await;
            }
            AuthenticationRequest::CleartextPassword => {
                let reply = PasswordMessage::from_password(password);
                self.write_to_server(&reply.to_message()).await?;
            }
            AuthenticationRequest::Md5Password { salt } => {
                let hashed = compute_md5_password(user, password, &salt);
                let reply = PasswordMessage::from_password(&hashed);
                self.write_to_server(&reply.to_message()).await?;
            }
            AuthenticationRequest::Sasl { ref mechanisms } => {
                self.scram_sha256_server_auth(mechanisms, password).await?;
            }
            other => {
                return Err(GatewayError::Auth(format!(
                    "upstream requested unsupported authentication method {}",
                    other.method_name()
                )));
            }
        }

        match self.read_server_auth_request().await? {
            ok @ AuthenticationRequest::Ok => self.write_to_client(&ok.to_message()).await,
            other => Err(GatewayError::Auth(format!(
                "expected AuthenticationOk from upstream, got {}",
                other.method_name()
            ))),
        }
    }

    /// Authenticate to the upstream with SCRAM-SHA-256, the gateway acting
    /// as the SCRAM client.
    pub async fn scram_sha256_server_auth(&mut self, mechanisms: &[String], password: &str) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SASL_MECHANISM_SCRAM_SHA_256) {
            if mechanisms.iter().any(|m| m == SASL_MECHANISM_SCRAM_SHA_256_PLUS) {
                return Err(GatewayError::Auth(
                    "upstream requires SCRAM-SHA-256-PLUS; channel binding is not supported".into(),
                ));
            }
            return Err(GatewayError::Auth(format!(
                "upstream offered no supported SASL mechanism: {}",
                mechanisms.join(", ")
            )));
        }

        // Postgres takes the user from the startup message, not from SCRAM
        let mut client = ScramClient::new("", password);
        let ScramStep::Continue(client_first) = client.step(&[])? else {
            return Err(GatewayError::Auth("SCRAM: client produced no first message".into()));
        };
        let initial = SaslInitialResponse {
            mechanism: SASL_MECHANISM_SCRAM_SHA_256.to_string(),
            data: client_first,
        };
        self.write_to_server(&initial.to_message()).await?;

        loop {
            let data = match self.read_server_auth_request().await? {
                AuthenticationRequest::SaslContinue { data } | AuthenticationRequest::SaslFinal { data } => data,
                other => {
                    return Err(GatewayError::Auth(format!(
                        "unexpected {} during SCRAM exchange",
                        other.method_name()
                    )))
                }
            };
            match client.step(&data)? {
                ScramStep::Continue(reply) => {
                    self.write_to_server(&PasswordMessage::from_bytes(reply).to_message())
                        .await?;
                }
                ScramStep::Done(_) => break,
            }
        }

        client.verify()
    }

    /// Read the upstream's next authentication request.
    ///
    /// An upstream ErrorResponse is relayed to the client and becomes an
    /// authentication error.
    async fn read_server_auth_request(&mut self) -> Result<AuthenticationRequest> {
        let msg = self.parse_server_response().await?;
        match msg.tag {
            MSG_AUTH_REQUEST => parse_authentication(&msg.payload),
            MSG_ERROR_RESPONSE => {
                self.write_to_client(&msg).await?;
                let reason = parse_error_response(&msg.payload)
                    .ok()
                    .and_then(|e| e.message().map(str::to_string))
                    .unwrap_or_default();
                Err(GatewayError::Auth(format!(
                    "upstream rejected authentication: {}",
                    reason
                )))
            }
            _ => Err(GatewayError::Protocol(format!(
                "unexpected {} from upstream during authentication",
                msg.name(Direction::Backend)
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Authenticate through the registry, then proxy until either side
    /// closes.
    ///
    /// A rejected login sends the client "failed to authenticate" and
    /// returns `Ok`.
    pub async fn handle(mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let authenticated = match self.handshake_deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, registry.authenticate(&mut self))
                .await
                .map_err(|_| GatewayError::Timeout("authentication did not finish in time".into()))?,
            None => registry.authenticate(&mut self).await,
        }?;

        if !authenticated {
            let _ = self
                .write_fatal_and_return_error(SQLSTATE_INVALID_PASSWORD, "failed to authenticate")
                .await;
            return Ok(());
        }

        if self.target.is_none() {
            return Err(GatewayError::Plugin(
                "authentication plugin did not connect to the upstream server".into(),
            ));
        }

        self.proxy().await
    }

    /// Relay messages in both directions until either side closes.
    ///
    /// The first pump to finish ends the session; the other one is
    /// stopped and its errors are no longer logged.
    pub async fn proxy(mut self) -> Result<()> {
        let target = self
            .target
            .take()
            .ok_or_else(|| GatewayError::Connection("not connected to the upstream server".into()))?;
        let logger = Arc::new(self.logger());
        let stopped = Arc::clone(&self.stopped);

        let (client_read, client_write) = tokio::io::split(self.client);
        let (target_read, target_write) = tokio::io::split(target);

        let mut client_to_server = tokio::spawn(pump_client_to_server(
            client_read,
            target_write,
            Arc::clone(&logger),
        ));
        let mut server_to_client = tokio::spawn(pump_server_to_client(
            target_read,
            client_write,
            Arc::clone(&logger),
        ));

        let finished = tokio::select! {
            result = &mut client_to_server => result,
            result = &mut server_to_client => result,
        };

        stopped.store(true, Ordering::SeqCst);
        client_to_server.abort();
        server_to_client.abort();

        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_clean_close() => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(GatewayError::Connection(format!("proxy task failed: {}", e))),
        }
    }
}

/// Write one fatal ErrorResponse.
pub(crate) async fn write_fatal<W>(writer: &mut W, code: &str, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, &ErrorResponse::fatal(code, message).to_message()).await
}

fn addr_value(addr: Option<SocketAddr>) -> Value {
    addr.map(|a| Value::String(a.to_string()))
        .unwrap_or(Value::Null)
}

fn with_message(mut context: LoggingContext, msg: &Message, direction: Direction) -> LoggingContext {
    context.insert("message".into(), msg.describe(direction));
    context
}

// ============================================================================
// Proxy pumps
// ============================================================================

/// Logging state the proxy pumps share once the session is split.
struct SessionLogger {
    registry: Arc<PluginRegistry>,
    stopped: Arc<AtomicBool>,
    context: LoggingContext,
}

impl SessionLogger {
    /// Log a read: debug-level trace of the message, or the error unless it
    /// is a clean close or the session has already stopped.
    fn observe(&self, direction: Direction, result: Result<Message>) -> Result<Message> {
        let side = match direction {
            Direction::Frontend => "client request",
            Direction::Backend => "server response",
        };
        match &result {
            Ok(msg) => {
                if self.registry.enabled(LogLevel::Debug) {
                    let context = with_message(self.context.clone(), msg, direction);
                    self.registry.log_debug(Some(&context), side);
                }
            }
            Err(e) if !e.is_clean_close() && !self.stopped.load(Ordering::SeqCst) => {
                self.registry
                    .log_error(Some(&self.context), format_args!("error parsing {}: {}", side, e));
            }
            Err(_) => {}
        }
        result
    }
}

/// Forward client messages verbatim, stopping after Terminate.
async fn pump_client_to_server<R, W>(mut client: R, mut server: W, logger: Arc<SessionLogger>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match logger.observe(Direction::Frontend, read_message(&mut client).await) {
            Ok(msg) => msg,
            Err(e) if e.is_clean_close() => return Ok(()),
            Err(e) => return Err(e),
        };
        write_message(&mut server, &msg).await?;
        if msg.is_terminate() {
            let _ = server.shutdown().await;
            return Ok(());
        }
    }
}

/// Forward server messages in batches.
///
/// The batch is written after ReadyForQuery, after any authentication
/// request other than OK, once it holds [`MAX_BATCHED_MESSAGES`] messages,
/// and when the pump stops.
async fn pump_server_to_client<R, W>(mut server: R, mut client: W, logger: Arc<SessionLogger>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(8192);
    let mut batched = 0usize;

    let result = loop {
        let msg = match logger.observe(Direction::Backend, read_message(&mut server).await) {
            Ok(msg) => msg,
            Err(e) if e.is_clean_close() => break Ok(()),
            Err(e) => break Err(e),
        };

        msg.encode_into(&mut batch);
        batched += 1;

        if gates_client(&msg) || batched >= MAX_BATCHED_MESSAGES {
            if let Err(e) = flush_batch(&mut client, &mut batch).await {
                break Err(e);
            }
            batched = 0;
        }
    };

    let flushed = if batch.is_empty() {
        Ok(())
    } else {
        flush_batch(&mut client, &mut batch).await
    };
    result.and(flushed)
}

/// Messages the client waits on before it can act.
fn gates_client(msg: &Message) -> bool {
    if msg.is_ready_for_query() {
        return true;
    }
    msg.tag == MSG_AUTH_REQUEST
        && parse_authentication(&msg.payload)
            .map(|request| !request.is_ok())
            .unwrap_or(true)
}

async fn flush_batch<W: AsyncWrite + Unpin>(writer: &mut W, batch: &mut Vec<u8>) -> Result<()> {
    writer.write_all(batch).await?;
    writer.flush().await?;
    batch.clear();
    Ok(())
}
