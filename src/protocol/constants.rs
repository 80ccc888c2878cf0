//! PostgreSQL protocol constants
//!
//! Wire protocol version 3.0 values used by the gateway.
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

// ============================================================================
// Protocol Version
// ============================================================================

/// PostgreSQL protocol version 3.0 (major=3, minor=0)
/// Encoded as (major << 16) | minor = 196608
pub const PROTOCOL_VERSION_3_0: u32 = 196608;

/// Major protocol version accepted from clients
pub const PROTOCOL_MAJOR_VERSION: u32 = 3;

// ============================================================================
// Special Request Codes (used in startup-like messages)
// ============================================================================

/// SSL request code - sent instead of StartupMessage to request SSL
/// Value: 80877103 (0x04D2162F)
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Cancel request code - sent to cancel a running query
/// Value: 80877102 (0x04D2162E)
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// GSSAPI encryption request code
/// Value: 80877104 (0x04D21630)
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Byte sent in answer to an accepted SSLRequest
pub const SSL_ACCEPTED: u8 = b'S';

/// Byte sent in answer to a declined SSLRequest / GSSENCRequest
pub const SSL_DECLINED: u8 = b'N';

// ============================================================================
// Frontend Message Types (client -> server)
// ============================================================================

/// Password message ('p') - sends password or SASL response
pub const MSG_PASSWORD: u8 = b'p';

/// Simple query ('Q') - executes a SQL query string
pub const MSG_QUERY: u8 = b'Q';

/// Terminate ('X') - client requests connection close
pub const MSG_TERMINATE: u8 = b'X';

/// Parse ('P') - prepare a statement (extended query protocol)
pub const MSG_PARSE: u8 = b'P';

/// Bind ('B') - bind parameters to prepared statement
pub const MSG_BIND: u8 = b'B';

/// Execute ('E') - execute a prepared statement
pub const MSG_EXECUTE: u8 = b'E';

/// Sync ('S') - sync point in extended query protocol
pub const MSG_SYNC: u8 = b'S';

// ============================================================================
// Backend Message Types (server -> client)
// ============================================================================

/// Authentication request ('R') - various auth-related messages
pub const MSG_AUTH_REQUEST: u8 = b'R';

/// Backend key data ('K') - process ID and secret key for cancellation
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';

/// Parameter status ('S') - server configuration parameter
pub const MSG_PARAMETER_STATUS: u8 = b'S';

/// Ready for query ('Z') - server is ready for a new query
pub const MSG_READY_FOR_QUERY: u8 = b'Z';

/// Row description ('T') - describes columns in query result
pub const MSG_ROW_DESCRIPTION: u8 = b'T';

/// Data row ('D') - a row of query result data
pub const MSG_DATA_ROW: u8 = b'D';

/// Command complete ('C') - query execution complete
pub const MSG_COMMAND_COMPLETE: u8 = b'C';

/// Error response ('E') - error occurred
pub const MSG_ERROR_RESPONSE: u8 = b'E';

/// Notice response ('N') - warning or informational message
pub const MSG_NOTICE_RESPONSE: u8 = b'N';

// ============================================================================
// Authentication Types (subtypes of 'R' message)
// ============================================================================

/// Authentication OK - authentication successful
pub const AUTH_OK: u32 = 0;

/// Cleartext password required
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;

/// MD5 password required (includes 4-byte salt)
pub const AUTH_MD5_PASSWORD: u32 = 5;

/// SASL authentication required (lists mechanisms)
pub const AUTH_SASL: u32 = 10;

/// SASL continuation (server challenge/response)
pub const AUTH_SASL_CONTINUE: u32 = 11;

/// SASL final (server signature)
pub const AUTH_SASL_FINAL: u32 = 12;

// ============================================================================
// Error/Notice Field Types
// ============================================================================

/// Severity (localized) - ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
pub const ERROR_FIELD_SEVERITY: u8 = b'S';

/// Severity (non-localized) - same values, but always in English
pub const ERROR_FIELD_SEVERITY_V: u8 = b'V';

/// SQLSTATE code - 5-character error code
pub const ERROR_FIELD_CODE: u8 = b'C';

/// Message - primary human-readable error message
pub const ERROR_FIELD_MESSAGE: u8 = b'M';

// ============================================================================
// SASL Mechanism Names
// ============================================================================

/// SCRAM-SHA-256 mechanism name
pub const SASL_MECHANISM_SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// SCRAM-SHA-256-PLUS mechanism name (with channel binding)
pub const SASL_MECHANISM_SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

// ============================================================================
// SQLSTATE Codes (for gateway-generated errors)
// ============================================================================

/// Invalid password
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";

/// Invalid authorization specification
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";

/// Invalid catalog name (unknown / disallowed database)
pub const SQLSTATE_INVALID_CATALOG_NAME: &str = "3D000";

/// Protocol violation
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";

// ============================================================================
// Helper Functions
// ============================================================================

/// Get a human-readable name for a backend (server->client) message type.
pub fn backend_message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_AUTH_REQUEST => "Authentication",
        MSG_BACKEND_KEY_DATA => "BackendKeyData",
        MSG_PARAMETER_STATUS => "ParameterStatus",
        MSG_READY_FOR_QUERY => "ReadyForQuery",
        MSG_ROW_DESCRIPTION => "RowDescription",
        MSG_DATA_ROW => "DataRow",
        MSG_COMMAND_COMPLETE => "CommandComplete",
        b'I' => "EmptyQueryResponse",
        MSG_ERROR_RESPONSE => "ErrorResponse",
        MSG_NOTICE_RESPONSE => "NoticeResponse",
        b'1' => "ParseComplete",
        b'2' => "BindComplete",
        b'3' => "CloseComplete",
        b'n' => "NoData",
        b's' => "PortalSuspended",
        b't' => "ParameterDescription",
        b'A' => "NotificationResponse",
        b'G' => "CopyInResponse",
        b'H' => "CopyOutResponse",
        b'W' => "CopyBothResponse",
        b'd' => "CopyData",
        b'c' => "CopyDone",
        _ => "Unknown",
    }
}

/// Get a human-readable name for a frontend (client->server) message type.
pub fn frontend_message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_PASSWORD => "Password",
        MSG_QUERY => "Query",
        MSG_TERMINATE => "Terminate",
        MSG_PARSE => "Parse",
        MSG_BIND => "Bind",
        MSG_EXECUTE => "Execute",
        b'D' => "Describe",
        MSG_SYNC => "Sync",
        b'H' => "Flush",
        b'C' => "Close",
        b'F' => "FunctionCall",
        b'd' => "CopyData",
        b'c' => "CopyDone",
        b'f' => "CopyFail",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION_3_0, 196608);
        assert_eq!(PROTOCOL_VERSION_3_0 >> 16, PROTOCOL_MAJOR_VERSION);
    }

    #[test]
    fn test_request_codes() {
        assert_eq!(SSL_REQUEST_CODE, 0x04D2162F);
        assert_eq!(CANCEL_REQUEST_CODE, 0x04D2162E);
        assert_eq!(GSSENC_REQUEST_CODE, 0x04D21630);
    }

    #[test]
    fn test_backend_message_names() {
        assert_eq!(backend_message_name(MSG_AUTH_REQUEST), "Authentication");
        assert_eq!(backend_message_name(MSG_READY_FOR_QUERY), "ReadyForQuery");
        assert_eq!(backend_message_name(0xFF), "Unknown");
    }

    #[test]
    fn test_frontend_message_names() {
        assert_eq!(frontend_message_name(MSG_QUERY), "Query");
        assert_eq!(frontend_message_name(MSG_TERMINATE), "Terminate");
        assert_eq!(frontend_message_name(0xFF), "Unknown");
    }
}
