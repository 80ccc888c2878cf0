//! SCRAM-SHA-256 (RFC 5802 / RFC 7677)
//!
//! The gateway plays both roles of the exchange:
//! - [`ScramClient`] authenticates the gateway to the upstream server with a
//!   plaintext password
//! - [`ScramServer`] authenticates an incoming client against
//!   [`StoredCredentials`] (the `pg_authid` secret format), never seeing the
//!   client's password
//!
//! Both are conversation state machines behind [`ScramConversation`]: feed
//! the peer's message to `step`, send whatever comes back, and call
//! `verify` once the exchange is over. Channel binding (`-PLUS`) is not
//! supported in either role.
//!
//! Reference: <https://www.postgresql.org/docs/current/sasl-authentication.html>

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{hmac_sha256, sha256, xor_bytes};
use crate::error::{GatewayError, Result};
use crate::protocol::SASL_MECHANISM_SCRAM_SHA_256;

/// base64("n,,"): no channel binding, no authzid
const CHANNEL_BINDING_NONE: &str = "biws";

// ============================================================================
// Conversation interface
// ============================================================================

/// Output of one conversation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramStep {
    /// Send this message to the peer and wait for its answer.
    Continue(Vec<u8>),
    /// Conversation finished; send this message (possibly empty) and stop.
    Done(Vec<u8>),
}

/// Shared step/verify interface of both SCRAM roles.
pub trait ScramConversation {
    /// Consume the peer's latest message and produce ours.
    ///
    /// The client ignores `input` on its first step.
    fn step(&mut self, input: &[u8]) -> Result<ScramStep>;

    /// Succeeds only once the exchange completed and the peer was verified.
    fn verify(&self) -> Result<()>;
}

// ============================================================================
// Stored credentials
// ============================================================================

/// SCRAM verifier as stored in `pg_authid.rolpassword`:
/// `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>`
#[derive(Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// Salt (decoded)
    pub salt: Vec<u8>,
    /// H(ClientKey)
    pub stored_key: [u8; 32],
    /// HMAC(SaltedPassword, "Server Key")
    pub server_key: [u8; 32],
}

impl StoredCredentials {
    /// Derive the verifier for a plaintext password.
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted_password = salted_password(password, salt, iterations);
        let client_key = hmac_sha256(&*salted_password, b"Client Key");
        Self {
            iterations,
            salt: salt.to_vec(),
            stored_key: sha256(&client_key),
            server_key: hmac_sha256(&*salted_password, b"Server Key"),
        }
    }
}

impl fmt::Display for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}${}:{}${}:{}",
            SASL_MECHANISM_SCRAM_SHA_256,
            self.iterations,
            BASE64.encode(&self.salt),
            BASE64.encode(self.stored_key),
            BASE64.encode(self.server_key)
        )
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("iterations", &self.iterations)
            .field("salt", &BASE64.encode(&self.salt))
            .finish_non_exhaustive()
    }
}

/// Parse a stored SCRAM verifier.
///
/// # Errors
///
/// Returns a descriptive [`GatewayError::Config`] for a wrong mechanism,
/// wrong segment count, non-numeric iteration count, bad base64, or keys
/// that are not 32 bytes long.
pub fn parse_scram_stored_credentials(secret: &str) -> Result<StoredCredentials> {
    let bad = |what: &str| GatewayError::Config(format!("invalid SCRAM secret: {}", what));

    let mut segments = secret.split('$');
    let (Some(mechanism), Some(params), Some(keys), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(bad(
            "expected SCRAM-SHA-256$<iterations>:<salt>$<storedKey>:<serverKey>",
        ));
    };

    if mechanism != SASL_MECHANISM_SCRAM_SHA_256 {
        return Err(bad(&format!("unsupported mechanism {:?}", mechanism)));
    }

    let (Some((iterations, salt)), Some((stored_key, server_key))) =
        (params.split_once(':'), keys.split_once(':'))
    else {
        return Err(bad(
            "expected SCRAM-SHA-256$<iterations>:<salt>$<storedKey>:<serverKey>",
        ));
    };

    let iterations: u32 = iterations
        .parse()
        .map_err(|_| bad(&format!("iteration count {:?} is not a number", iterations)))?;
    if iterations == 0 {
        return Err(bad("iteration count must be positive"));
    }

    let salt = BASE64
        .decode(salt)
        .map_err(|e| bad(&format!("salt is not valid base64: {}", e)))?;

    let decode_key = |name: &str, value: &str| -> Result<[u8; 32]> {
        let bytes = BASE64
            .decode(value)
            .map_err(|e| bad(&format!("{} is not valid base64: {}", name, e)))?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| bad(&format!("{} must be 32 bytes, got {}", name, bytes.len())))
    };

    Ok(StoredCredentials {
        iterations,
        salt,
        stored_key: decode_key("StoredKey", stored_key)?,
        server_key: decode_key("ServerKey", server_key)?,
    })
}

// ============================================================================
// Client role (gateway -> upstream)
// ============================================================================

/// SCRAM-SHA-256 client state machine.
///
/// ```ignore
/// let mut client = ScramClient::new("user", "password");
/// let ScramStep::Continue(first) = client.step(&[])? else { unreachable!() };
/// // send first in SASLInitialResponse, receive server-first
/// let ScramStep::Continue(last) = client.step(&server_first)? else { unreachable!() };
/// // send last in SASLResponse, receive server-final
/// client.step(&server_final)?;
/// client.verify()?;
/// ```
pub struct ScramClient {
    username: String,
    password: Zeroizing<String>,
    client_nonce: Zeroizing<String>,
    state: ClientState,
}

enum ClientState {
    Initial,
    WaitingForServerFirst {
        /// Client-first-message-bare (without "n,,")
        client_first_bare: String,
    },
    WaitingForServerFinal {
        auth_message: String,
        salted_password: Zeroizing<[u8; 32]>,
    },
    Complete,
    Failed,
}

impl ScramClient {
    /// Create a new SCRAM client.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            client_nonce: Zeroizing::new(generate_nonce()),
            state: ClientState::Initial,
        }
    }

    fn client_first(&mut self) -> Vec<u8> {
        let client_first_bare = format!("n={},r={}", self.username, &*self.client_nonce);
        let client_first = format!("n,,{}", client_first_bare);
        self.state = ClientState::WaitingForServerFirst { client_first_bare };
        client_first.into_bytes()
    }

    fn process_server_first(&mut self, client_first_bare: &str, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in server-first".into()))?;

        let (server_nonce, salt, iterations) = parse_server_first(server_first)?;

        if !server_nonce.starts_with(&*self.client_nonce) {
            return Err(GatewayError::Auth("SCRAM: server nonce mismatch".into()));
        }

        let salted_password = salted_password(&self.password, &salt, iterations);

        let client_final_without_proof =
            format!("c={},r={}", CHANNEL_BINDING_NONE, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first, client_final_without_proof
        );

        let client_key = hmac_sha256(&*salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor_bytes(&client_key, &client_signature);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );

        self.state = ClientState::WaitingForServerFinal {
            auth_message,
            salted_password,
        };

        Ok(client_final.into_bytes())
    }

    fn verify_server_final(
        auth_message: &str,
        salted_password: &[u8; 32],
        server_final: &[u8],
    ) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in server-final".into()))?;

        if let Some(error_msg) = server_final.strip_prefix("e=") {
            return Err(GatewayError::Auth(format!(
                "SCRAM: server error: {}",
                error_msg
            )));
        }

        let signature = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| GatewayError::Auth("SCRAM: invalid server-final format".into()))?;

        let received = BASE64
            .decode(signature)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid base64 in server signature".into()))?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if received.ct_eq(&expected).into() {
            Ok(())
        } else {
            Err(GatewayError::Auth(
                "SCRAM: server signature verification failed".into(),
            ))
        }
    }
}

impl ScramConversation for ScramClient {
    fn step(&mut self, input: &[u8]) -> Result<ScramStep> {
        let state = std::mem::replace(&mut self.state, ClientState::Failed);
        match state {
            ClientState::Initial => Ok(ScramStep::Continue(self.client_first())),
            ClientState::WaitingForServerFirst { client_first_bare } => self
                .process_server_first(&client_first_bare, input)
                .map(ScramStep::Continue),
            ClientState::WaitingForServerFinal {
                auth_message,
                salted_password,
            } => {
                Self::verify_server_final(&auth_message, &salted_password, input)?;
                self.state = ClientState::Complete;
                Ok(ScramStep::Done(Vec::new()))
            }
            ClientState::Complete | ClientState::Failed => Err(GatewayError::Auth(
                "SCRAM: conversation already finished".into(),
            )),
        }
    }

    fn verify(&self) -> Result<()> {
        match self.state {
            ClientState::Complete => Ok(()),
            _ => Err(GatewayError::Auth(
                "SCRAM: server was not verified".into(),
            )),
        }
    }
}

// ============================================================================
// Server role (client -> gateway)
// ============================================================================

/// SCRAM-SHA-256 server state machine.
///
/// `lookup` receives the username from the client-first-message (libpq sends
/// an empty one and relies on the startup `user`) and returns the verifier
/// to check the client against.
pub struct ScramServer<F> {
    lookup: F,
    server_nonce: Zeroizing<String>,
    state: ServerState,
}

enum ServerState {
    Initial,
    WaitingForClientFinal {
        gs2_header: String,
        client_first_bare: String,
        server_first: String,
        nonce: String,
        credentials: Box<StoredCredentials>,
    },
    Complete,
    Failed,
}

impl<F> ScramServer<F>
where
    F: FnMut(&str) -> Result<StoredCredentials>,
{
    /// Create a new SCRAM server conversation.
    pub fn new(lookup: F) -> Self {
        Self {
            lookup,
            server_nonce: Zeroizing::new(generate_nonce()),
            state: ServerState::Initial,
        }
    }

    fn process_client_first(&mut self, client_first: &[u8]) -> Result<Vec<u8>> {
        let client_first = std::str::from_utf8(client_first)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in client-first".into()))?;

        // gs2-header: cbind-flag "," [authzid] ","
        let mut parts = client_first.splitn(3, ',');
        let (Some(cbind_flag), Some(authzid), Some(client_first_bare)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(GatewayError::Auth(
                "SCRAM: malformed client-first-message".into(),
            ));
        };

        match cbind_flag {
            "n" | "y" => {}
            flag if flag.starts_with("p=") => {
                return Err(GatewayError::Auth(
                    "SCRAM: channel binding is not supported".into(),
                ))
            }
            _ => {
                return Err(GatewayError::Auth(
                    "SCRAM: malformed gs2 header in client-first".into(),
                ))
            }
        }
        if !authzid.is_empty() && !authzid.starts_with("a=") {
            return Err(GatewayError::Auth(
                "SCRAM: malformed authzid in client-first".into(),
            ));
        }

        let mut username = None;
        let mut client_nonce = None;
        for attr in client_first_bare.split(',') {
            if let Some(value) = attr.strip_prefix("n=") {
                username = Some(value);
            } else if let Some(value) = attr.strip_prefix("r=") {
                client_nonce = Some(value);
            } else if attr.starts_with("m=") {
                return Err(GatewayError::Auth(
                    "SCRAM: mandatory extensions are not supported".into(),
                ));
            }
        }

        let (Some(username), Some(client_nonce)) = (username, client_nonce) else {
            return Err(GatewayError::Auth(
                "SCRAM: client-first missing username or nonce".into(),
            ));
        };
        if client_nonce.is_empty() {
            return Err(GatewayError::Auth("SCRAM: empty client nonce".into()));
        }

        let credentials = (self.lookup)(username)?;

        let nonce = format!("{}{}", client_nonce, &*self.server_nonce);
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            BASE64.encode(&credentials.salt),
            credentials.iterations
        );

        self.state = ServerState::WaitingForClientFinal {
            gs2_header: format!("{},{},", cbind_flag, authzid),
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            nonce,
            credentials: Box::new(credentials),
        };

        Ok(server_first.into_bytes())
    }
}

/// Check a client-final-message and build the server-final-message.
fn process_client_final(
    gs2_header: &str,
    client_first_bare: &str,
    server_first: &str,
    nonce: &str,
    credentials: &StoredCredentials,
    client_final: &[u8],
) -> Result<Vec<u8>> {
    let client_final = std::str::from_utf8(client_final)
        .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in client-final".into()))?;

    let (without_proof, proof) = client_final
        .rsplit_once(",p=")
        .ok_or_else(|| GatewayError::Auth("SCRAM: client-final missing proof".into()))?;

    let mut channel_binding = None;
    let mut final_nonce = None;
    for attr in without_proof.split(',') {
        if let Some(value) = attr.strip_prefix("c=") {
            channel_binding = Some(value);
        } else if let Some(value) = attr.strip_prefix("r=") {
            final_nonce = Some(value);
        }
    }

    if channel_binding != Some(BASE64.encode(gs2_header.as_bytes()).as_str()) {
        return Err(GatewayError::Auth(
            "SCRAM: channel binding mismatch".into(),
        ));
    }
    if final_nonce != Some(nonce) {
        return Err(GatewayError::Auth("SCRAM: nonce mismatch".into()));
    }

    let proof = BASE64
        .decode(proof)
        .map_err(|_| GatewayError::Auth("SCRAM: invalid base64 in client proof".into()))?;
    if proof.len() != 32 {
        return Err(GatewayError::Auth("SCRAM: invalid client proof length".into()));
    }

    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

    // ClientKey = ClientProof XOR HMAC(StoredKey, AuthMessage); H(ClientKey) must be StoredKey
    let client_signature = hmac_sha256(&credentials.stored_key, auth_message.as_bytes());
    let client_key = xor_bytes(&proof, &client_signature);
    if !bool::from(sha256(&client_key).ct_eq(&credentials.stored_key)) {
        return Err(GatewayError::Auth("SCRAM: invalid client proof".into()));
    }

    let server_signature = hmac_sha256(&credentials.server_key, auth_message.as_bytes());
    Ok(format!("v={}", BASE64.encode(server_signature)).into_bytes())
}

impl<F> ScramConversation for ScramServer<F>
where
    F: FnMut(&str) -> Result<StoredCredentials>,
{
    fn step(&mut self, input: &[u8]) -> Result<ScramStep> {
        let state = std::mem::replace(&mut self.state, ServerState::Failed);
        match state {
            ServerState::Initial => self.process_client_first(input).map(ScramStep::Continue),
            ServerState::WaitingForClientFinal {
                gs2_header,
                client_first_bare,
                server_first,
                nonce,
                credentials,
            } => {
                let server_final = process_client_final(
                    &gs2_header,
                    &client_first_bare,
                    &server_first,
                    &nonce,
                    &credentials,
                    input,
                )?;
                self.state = ServerState::Complete;
                Ok(ScramStep::Done(server_final))
            }
            ServerState::Complete | ServerState::Failed => Err(GatewayError::Auth(
                "SCRAM: conversation already finished".into(),
            )),
        }
    }

    fn verify(&self) -> Result<()> {
        match self.state {
            ServerState::Complete => Ok(()),
            _ => Err(GatewayError::Auth(
                "SCRAM: client proof was not verified".into(),
            )),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Generate a random nonce string.
fn generate_nonce() -> String {
    let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
    BASE64.encode(nonce_bytes)
}

/// SaltedPassword = PBKDF2-HMAC-SHA256(password, salt, iterations)
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut salted = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut *salted);
    salted
}

/// Parse server-first-message.
///
/// Format: r=<nonce>,s=<salt>,i=<iterations>[,...]
fn parse_server_first(msg: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| GatewayError::Auth("SCRAM: invalid base64 in salt".into()))?,
            );
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .ok()
                    .filter(|&i| i > 0)
                    .ok_or_else(|| GatewayError::Auth("SCRAM: invalid iteration count".into()))?,
            );
        }
    }

    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(GatewayError::Auth(
            "SCRAM: missing required field in server-first".into(),
        )),
    }
}
