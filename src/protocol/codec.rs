//! PostgreSQL message codec (read/write)
//!
//! Async framing over any `AsyncRead`/`AsyncWrite`, plus payload parsers
//! and builders for the handful of messages the gateway interprets.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, Result};

use super::constants::*;
use super::messages::*;

// ============================================================================
// Constants
// ============================================================================

/// Maximum message size (100MB, protocol allows up to 1GB)
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Maximum startup packet size, as enforced by the PostgreSQL server
pub const MAX_STARTUP_PACKET_LENGTH: u32 = 10_000;

/// Minimum message length (just the 4-byte length field)
pub const MIN_MESSAGE_LENGTH: u32 = 4;

// ============================================================================
// Low-Level Helpers
// ============================================================================

/// Read a u32 in big-endian format.
async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Bytes of a null-terminated string at the given offset, and the number
/// of bytes consumed (including null).
fn cstring_bytes_from_buf(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let rest = buf
        .get(offset..)
        .ok_or_else(|| GatewayError::Protocol("String offset out of bounds".into()))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| GatewayError::Protocol("Missing null terminator in string".into()))?;

    Ok((&rest[..end], end + 1))
}

/// Read a null-terminated UTF-8 string from a buffer at the given offset.
fn read_cstring_from_buf(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let (bytes, consumed) = cstring_bytes_from_buf(buf, offset)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| GatewayError::Protocol("Invalid UTF-8 in string".into()))?;

    Ok((s.to_string(), consumed))
}

/// Like [`read_cstring_from_buf`], but invalid UTF-8 becomes U+FFFD.
fn read_cstring_lossy_from_buf(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let (bytes, consumed) = cstring_bytes_from_buf(buf, offset)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), consumed))
}

// ============================================================================
// Message Reading
// ============================================================================

/// Read a startup-phase packet from a new connection.
///
/// Startup packets have no type byte: Length (4) + Version/Code (4) + Data.
/// The result can be an SSLRequest, GSSENCRequest, CancelRequest, or a
/// StartupMessage with its parameters in wire order.
pub async fn read_startup_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StartupMessageType> {
    let length = match read_u32_be(reader).await {
        Ok(length) => length,
        Err(GatewayError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(GatewayError::UnexpectedEof)
        }
        Err(e) => return Err(e),
    };

    if length < 8 {
        return Err(GatewayError::Protocol(format!(
            "Startup message too short: {} bytes",
            length
        )));
    }
    if length > MAX_STARTUP_PACKET_LENGTH {
        return Err(GatewayError::Protocol(format!(
            "Startup message too large: {} bytes (max {})",
            length, MAX_STARTUP_PACKET_LENGTH
        )));
    }

    let code = read_u32_be(reader).await?;

    match code {
        SSL_REQUEST_CODE => return Ok(StartupMessageType::SSLRequest),
        GSSENC_REQUEST_CODE => return Ok(StartupMessageType::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            let process_id = read_u32_be(reader).await?;
            let secret_key = read_u32_be(reader).await?;
            return Ok(StartupMessageType::CancelRequest(CancelRequest {
                process_id,
                secret_key,
            }));
        }
        _ => {}
    }

    if code >> 16 != PROTOCOL_MAJOR_VERSION {
        return Err(GatewayError::Protocol(format!(
            "Unsupported protocol version: {}.{} (expected {}.x)",
            code >> 16,
            code & 0xFFFF,
            PROTOCOL_MAJOR_VERSION
        )));
    }

    let mut buf = vec![0u8; (length - 8) as usize];
    reader.read_exact(&mut buf).await?;

    // key\0value\0 pairs terminated by an empty key; clients may send
    // options in a non-UTF-8 client encoding
    let mut parameters = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let (key, key_len) = read_cstring_lossy_from_buf(&buf, offset)?;
        offset += key_len;

        if key.is_empty() {
            break;
        }

        if offset >= buf.len() {
            return Err(GatewayError::Protocol(format!(
                "Missing value for startup parameter {}",
                key
            )));
        }
        let (value, value_len) = read_cstring_lossy_from_buf(&buf, offset)?;
        offset += value_len;

        parameters.push((key, value));
    }

    Ok(StartupMessageType::Startup(StartupMessage::from_parameters(
        code, parameters,
    )))
}

/// Read a typed message (type byte + length + payload).
///
/// EOF before the type byte is reported as [`GatewayError::UnexpectedEof`],
/// the clean-close condition.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut tag = [0u8; 1];
    if let Err(e) = reader.read_exact(&mut tag).await {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
            GatewayError::UnexpectedEof
        } else {
            e.into()
        });
    }

    let length = read_u32_be(reader).await?;

    if length < MIN_MESSAGE_LENGTH {
        return Err(GatewayError::Protocol(format!(
            "Invalid message length: {}",
            length
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(GatewayError::Protocol(format!(
            "Message too large: {} bytes (max: {})",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; (length - 4) as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Message::new(tag[0], payload))
}

// ============================================================================
// Message Writing
// ============================================================================

/// Write one typed message and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a startup message to the server.
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &StartupMessage,
) -> Result<()> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an SSL request.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&8u32.to_be_bytes());
    buf[4..].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Message Parsing (from payload)
// ============================================================================

/// Parse an authentication request from an 'R' payload.
pub fn parse_authentication(payload: &[u8]) -> Result<AuthenticationRequest> {
    if payload.len() < 4 {
        return Err(GatewayError::Protocol(
            "Authentication message too short".into(),
        ));
    }

    let auth_type = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    match auth_type {
        AUTH_OK => Ok(AuthenticationRequest::Ok),

        AUTH_CLEARTEXT_PASSWORD => Ok(AuthenticationRequest::CleartextPassword),

        AUTH_MD5_PASSWORD => {
            if payload.len() < 8 {
                return Err(GatewayError::Protocol(
                    "MD5 auth message missing salt".into(),
                ));
            }
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&payload[4..8]);
            Ok(AuthenticationRequest::Md5Password { salt })
        }

        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            let mut offset = 4;

            while offset < payload.len() {
                let (mechanism, len) = read_cstring_from_buf(payload, offset)?;
                offset += len;

                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }

            Ok(AuthenticationRequest::Sasl { mechanisms })
        }

        AUTH_SASL_CONTINUE => Ok(AuthenticationRequest::SaslContinue {
            data: payload[4..].to_vec(),
        }),

        AUTH_SASL_FINAL => Ok(AuthenticationRequest::SaslFinal {
            data: payload[4..].to_vec(),
        }),

        other => Ok(AuthenticationRequest::Other(other)),
    }
}

/// Parse a SASLInitialResponse from a 'p' payload.
///
/// Format: mechanism\0 + Int32 length (-1 for none) + data
pub fn parse_sasl_initial_response(payload: &[u8]) -> Result<SaslInitialResponse> {
    let (mechanism, offset) = read_cstring_from_buf(payload, 0)?;

    let len_bytes = payload
        .get(offset..offset + 4)
        .ok_or_else(|| GatewayError::Protocol("SASLInitialResponse missing length".into()))?;
    let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);

    let data = if len < 0 {
        Vec::new()
    } else {
        payload
            .get(offset + 4..offset + 4 + len as usize)
            .ok_or_else(|| GatewayError::Protocol("SASLInitialResponse data truncated".into()))?
            .to_vec()
    };

    Ok(SaslInitialResponse { mechanism, data })
}

/// Parse an error/notice response from payload.
pub fn parse_error_response(payload: &[u8]) -> Result<ErrorResponse> {
    let mut response = ErrorResponse::default();
    let mut offset = 0;

    while offset < payload.len() {
        let field_type = payload[offset];
        offset += 1;

        if field_type == 0 {
            break;
        }

        let (value, len) = read_cstring_from_buf(payload, offset)?;
        offset += len;

        response.set_field(field_type, &value);
    }

    Ok(response)
}

// ============================================================================
// Message Building (to payload)
// ============================================================================

/// Build a SASL initial response payload.
pub fn build_sasl_initial_response(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(mechanism.len() + 5 + data.len());

    payload.extend_from_slice(mechanism.as_bytes());
    payload.push(0);

    if data.is_empty() {
        payload.extend_from_slice(&(-1i32).to_be_bytes());
    } else {
        payload.extend_from_slice(&(data.len() as i32).to_be_bytes());
        payload.extend_from_slice(data);
    }

    payload
}

/// Build an error response payload.
pub fn build_error_response(response: &ErrorResponse) -> Vec<u8> {
    let mut payload = Vec::new();

    for (field_type, value) in &response.fields {
        payload.push(*field_type);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }

    payload.push(0);
    payload
}
