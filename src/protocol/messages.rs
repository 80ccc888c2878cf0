//! PostgreSQL protocol message structures
//!
//! The gateway relays almost everything verbatim, so the central type is the
//! raw framed [`Message`]. Typed views exist only for the messages the
//! session state machine has to understand: startup, authentication requests,
//! password/SASL responses and error responses.
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use serde_json::{json, Value};

use super::constants::*;

// ============================================================================
// Raw framed messages
// ============================================================================

/// Which side of the connection produced a message.
///
/// Several type bytes are shared between frontend and backend messages
/// (`'D'`, `'C'`, `'S'`, ...), so naming a message needs the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    Frontend,
    /// Server to client
    Backend,
}

/// A typed protocol message as it appeared on the wire.
///
/// Format: Type (1) + Length (4, includes itself) + Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type byte
    pub tag: u8,
    /// Payload without the length field
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message from a type byte and payload.
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Size of the framed message in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.payload.len()
    }

    /// Append the framed message to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.push(self.tag);
        buf.extend_from_slice(&((self.payload.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Frame the message into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// `ReadyForQuery` ('Z') from the server.
    pub fn is_ready_for_query(&self) -> bool {
        self.tag == MSG_READY_FOR_QUERY
    }

    /// `Terminate` ('X') from the client.
    pub fn is_terminate(&self) -> bool {
        self.tag == MSG_TERMINATE
    }

    /// Human-readable message name.
    pub fn name(&self, direction: Direction) -> &'static str {
        match direction {
            Direction::Frontend => frontend_message_name(self.tag),
            Direction::Backend => backend_message_name(self.tag),
        }
    }

    /// Structured representation for debug-level session logging.
    ///
    /// Credentials (password and SASL payloads) are never included.
    pub fn describe(&self, direction: Direction) -> Value {
        let mut desc = json!({
            "type": self.name(direction),
            "tag": (self.tag as char).to_string(),
            "length": self.payload.len() + 4,
        });

        let details = match (direction, self.tag) {
            (Direction::Backend, MSG_AUTH_REQUEST) => super::codec::parse_authentication(&self.payload)
                .ok()
                .map(|auth| json!({ "method": auth.method_name() })),
            (Direction::Backend, MSG_READY_FOR_QUERY) => self
                .payload
                .first()
                .map(|status| json!({ "status": (*status as char).to_string() })),
            (Direction::Backend, MSG_ERROR_RESPONSE | MSG_NOTICE_RESPONSE) => {
                super::codec::parse_error_response(&self.payload)
                    .ok()
                    .map(|err| {
                        json!({
                            "severity": err.severity(),
                            "code": err.code(),
                            "message": err.message(),
                        })
                    })
            }
            (Direction::Frontend, MSG_QUERY) => {
                let end = self
                    .payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(self.payload.len());
                Some(json!({ "query": String::from_utf8_lossy(&self.payload[..end]) }))
            }
            (Direction::Frontend, MSG_PASSWORD) => Some(json!({ "data": "<redacted>" })),
            _ => None,
        };

        if let (Some(Value::Object(details)), Some(obj)) = (details, desc.as_object_mut()) {
            obj.extend(details);
        }
        desc
    }
}

// ============================================================================
// Startup Messages (no type byte)
// ============================================================================

/// PostgreSQL startup message sent by client to initiate connection.
///
/// Format: Length (4) + Protocol Version (4) + Parameters (null-terminated pairs) + \0
///
/// Parameters keep the order the client sent them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Protocol version (196608 for v3.0)
    pub protocol_version: u32,
    parameters: Vec<(String, String)>,
}

impl StartupMessage {
    /// Create a new startup message with the given user.
    pub fn new(user: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters: vec![("user".to_string(), user.to_string())],
        }
    }

    /// Create a startup message with user and database.
    pub fn with_database(user: &str, database: &str) -> Self {
        let mut msg = Self::new(user);
        msg.set("database", database);
        msg
    }

    /// Build a startup message from already ordered parameters.
    pub fn from_parameters(protocol_version: u32, parameters: Vec<(String, String)>) -> Self {
        Self {
            protocol_version,
            parameters,
        }
    }

    /// Get a parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the username from parameters.
    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// Get the database name from parameters.
    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }

    /// Set a parameter, replacing it in place or appending it.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.parameters.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.parameters.push((key.to_string(), value.to_string())),
        }
    }

    /// All parameters in wire order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this message that authenticates as `user` instead.
    ///
    /// Every other option keeps its value and position.
    pub fn for_user(&self, user: &str) -> Self {
        let mut msg = self.clone();
        msg.set("user", user);
        msg
    }

    /// Encode the startup message including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&self.protocol_version.to_be_bytes());
        for (key, value) in &self.parameters {
            content.extend_from_slice(key.as_bytes());
            content.push(0);
            content.extend_from_slice(value.as_bytes());
            content.push(0);
        }
        content.push(0);

        let mut buf = Vec::with_capacity(content.len() + 4);
        buf.extend_from_slice(&((content.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&content);
        buf
    }
}

/// Cancel request message - requests cancellation of a running query.
///
/// Format: Length (4, always 16) + Cancel Code (4) + Process ID (4) + Secret Key (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// Backend process ID
    pub process_id: u32,
    /// Secret key for this connection
    pub secret_key: u32,
}

/// Type of startup-phase packet received.
#[derive(Debug)]
pub enum StartupMessageType {
    /// Regular startup message with connection parameters
    Startup(StartupMessage),
    /// SSL upgrade request
    SSLRequest,
    /// GSSAPI encryption request
    GssEncRequest,
    /// Query cancellation request
    CancelRequest(CancelRequest),
}

// ============================================================================
// Authentication Messages
// ============================================================================

/// Authentication request from server (type 'R').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    /// Authentication successful (type 0)
    Ok,

    /// Cleartext password required (type 3)
    CleartextPassword,

    /// MD5 password required (type 5)
    Md5Password {
        /// 4-byte salt for MD5 hash
        salt: [u8; 4],
    },

    /// SASL authentication required (type 10)
    Sasl {
        /// Available SASL mechanism names
        mechanisms: Vec<String>,
    },

    /// SASL continuation (type 11)
    SaslContinue {
        /// Server challenge data
        data: Vec<u8>,
    },

    /// SASL final (type 12)
    SaslFinal {
        /// Server signature data
        data: Vec<u8>,
    },

    /// Any method the gateway does not speak (Kerberos, GSS, SSPI, ...)
    Other(u32),
}

impl AuthenticationRequest {
    /// Check if this is a successful authentication.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Numeric method code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Ok => AUTH_OK,
            Self::CleartextPassword => AUTH_CLEARTEXT_PASSWORD,
            Self::Md5Password { .. } => AUTH_MD5_PASSWORD,
            Self::Sasl { .. } => AUTH_SASL,
            Self::SaslContinue { .. } => AUTH_SASL_CONTINUE,
            Self::SaslFinal { .. } => AUTH_SASL_FINAL,
            Self::Other(code) => *code,
        }
    }

    /// Short method name for logs.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::CleartextPassword => "cleartext",
            Self::Md5Password { .. } => "md5",
            Self::Sasl { .. } => "sasl",
            Self::SaslContinue { .. } => "sasl-continue",
            Self::SaslFinal { .. } => "sasl-final",
            Self::Other(_) => "unsupported",
        }
    }

    /// Build the framed 'R' message.
    pub fn to_message(&self) -> Message {
        let mut payload = self.code().to_be_bytes().to_vec();
        match self {
            Self::Md5Password { salt } => payload.extend_from_slice(salt),
            Self::Sasl { mechanisms } => {
                for mechanism in mechanisms {
                    payload.extend_from_slice(mechanism.as_bytes());
                    payload.push(0);
                }
                payload.push(0);
            }
            Self::SaslContinue { data } | Self::SaslFinal { data } => {
                payload.extend_from_slice(data)
            }
            _ => {}
        }
        Message::new(MSG_AUTH_REQUEST, payload)
    }
}

// ============================================================================
// Password/SASL Response Messages
// ============================================================================

/// Password message sent by client (type 'p').
///
/// Used for cleartext password, MD5 password, and SASL responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    /// Raw payload (null-terminated for passwords)
    pub data: Vec<u8>,
}

impl PasswordMessage {
    /// Create a password message from a string (adds null terminator).
    pub fn from_password(password: &str) -> Self {
        let mut data = password.as_bytes().to_vec();
        data.push(0);
        Self { data }
    }

    /// Create a password message from raw bytes (for SASL).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The credential without its null terminator.
    pub fn password(&self) -> &[u8] {
        match self.data.split_last() {
            Some((0, rest)) => rest,
            _ => &self.data,
        }
    }

    /// Build the framed 'p' message.
    pub fn to_message(&self) -> Message {
        Message::new(MSG_PASSWORD, self.data.clone())
    }
}

/// SASL initial response message (sent via 'p' message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslInitialResponse {
    /// Selected SASL mechanism name
    pub mechanism: String,
    /// Client-first-message data
    pub data: Vec<u8>,
}

impl SaslInitialResponse {
    /// Build the framed 'p' message.
    pub fn to_message(&self) -> Message {
        Message::new(
            MSG_PASSWORD,
            super::codec::build_sasl_initial_response(&self.mechanism, &self.data),
        )
    }
}

// ============================================================================
// Error Messages
// ============================================================================

/// Error or notice response message (types 'E' and 'N').
///
/// Fields keep their wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error/notice fields keyed by field type byte
    pub fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    /// Create an error response with the basic fields.
    pub fn error(severity: &str, code: &str, message: &str) -> Self {
        let mut resp = Self::default();
        resp.set_field(ERROR_FIELD_SEVERITY, severity);
        resp.set_field(ERROR_FIELD_SEVERITY_V, severity);
        resp.set_field(ERROR_FIELD_CODE, code);
        resp.set_field(ERROR_FIELD_MESSAGE, message);
        resp
    }

    /// Create a FATAL error response.
    pub fn fatal(code: &str, message: &str) -> Self {
        Self::error("FATAL", code, message)
    }

    /// Get a field value.
    pub fn field(&self, field_type: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type)
            .map(|(_, v)| v.as_str())
    }

    /// Set a field, replacing an existing value.
    pub fn set_field(&mut self, field_type: u8, value: &str) {
        match self.fields.iter_mut().find(|(t, _)| *t == field_type) {
            Some((_, v)) => *v = value.to_string(),
            None => self.fields.push((field_type, value.to_string())),
        }
    }

    /// Get the severity (S field).
    pub fn severity(&self) -> Option<&str> {
        self.field(ERROR_FIELD_SEVERITY)
    }

    /// Get the SQLSTATE code (C field).
    pub fn code(&self) -> Option<&str> {
        self.field(ERROR_FIELD_CODE)
    }

    /// Get the message (M field).
    pub fn message(&self) -> Option<&str> {
        self.field(ERROR_FIELD_MESSAGE)
    }

    /// Build the framed 'E' message.
    pub fn to_message(&self) -> Message {
        Message::new(MSG_ERROR_RESPONSE, super::codec::build_error_response(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode() {
        let msg = Message::new(MSG_QUERY, b"SELECT 1\0".to_vec());
        let encoded = msg.encode();
        assert_eq!(encoded[0], b'Q');
        assert_eq!(&encoded[1..5], &13u32.to_be_bytes());
        assert_eq!(&encoded[5..], b"SELECT 1\0");
        assert_eq!(encoded.len(), msg.encoded_len());
    }

    #[test]
    fn test_startup_keeps_order() {
        let mut msg = StartupMessage::with_database("alice", "app");
        msg.set("application_name", "psql");
        msg.set("user", "bob");

        let keys: Vec<&str> = msg.parameters().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["user", "database", "application_name"]);
        assert_eq!(msg.user(), Some("bob"));
    }

    #[test]
    fn test_for_user_copies_other_options() {
        let mut msg = StartupMessage::with_database("alice", "app");
        msg.set("client_encoding", "UTF8");

        let upstream = msg.for_user("svc");
        assert_eq!(upstream.user(), Some("svc"));
        assert_eq!(upstream.database(), Some("app"));
        assert_eq!(upstream.get("client_encoding"), Some("UTF8"));
        assert_eq!(msg.user(), Some("alice"));
    }

    #[test]
    fn test_password_strips_terminator() {
        let msg = PasswordMessage::from_password("secret");
        assert_eq!(msg.password(), b"secret");
        assert_eq!(PasswordMessage::from_bytes(b"raw".to_vec()).password(), b"raw");
    }

    #[test]
    fn test_auth_request_md5_message() {
        let msg = AuthenticationRequest::Md5Password { salt: [1, 2, 3, 4] }.to_message();
        assert_eq!(msg.tag, MSG_AUTH_REQUEST);
        assert_eq!(msg.payload, vec![0, 0, 0, 5, 1, 2, 3, 4]);
    }

    #[test]
    fn test_auth_request_sasl_message() {
        let msg = AuthenticationRequest::Sasl {
            mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()],
        }
        .to_message();
        assert_eq!(&msg.payload[..4], &AUTH_SASL.to_be_bytes());
        assert_eq!(&msg.payload[4..], b"SCRAM-SHA-256\0\0");
    }

    #[test]
    fn test_fatal_error_fields() {
        let err = ErrorResponse::fatal(SQLSTATE_PROTOCOL_VIOLATION, "boom");
        assert_eq!(err.severity(), Some("FATAL"));
        assert_eq!(err.code(), Some("08P01"));
        assert_eq!(err.message(), Some("boom"));
    }

    #[test]
    fn test_describe_redacts_password() {
        let msg = PasswordMessage::from_password("hunter2").to_message();
        let desc = msg.describe(Direction::Frontend);
        assert_eq!(desc["type"], "Password");
        assert!(!desc.to_string().contains("hunter2"));
    }

    #[test]
    fn test_describe_query_and_ready() {
        let query = Message::new(MSG_QUERY, b"SELECT 1\0".to_vec());
        assert_eq!(query.describe(Direction::Frontend)["query"], "SELECT 1");

        let ready = Message::new(MSG_READY_FOR_QUERY, vec![b'I']);
        let desc = ready.describe(Direction::Backend);
        assert_eq!(desc["type"], "ReadyForQuery");
        assert_eq!(desc["status"], "I");
    }

    #[test]
    fn test_describe_auth_method() {
        let msg = AuthenticationRequest::Ok.to_message();
        assert_eq!(msg.describe(Direction::Backend)["method"], "ok");
    }
}
