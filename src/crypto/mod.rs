//! Credential hashing and SCRAM conversations
//!
//! - [`md5`]: the salted MD5 challenge-response (`md5` + hex digest)
//! - [`scram`]: SCRAM-SHA-256 stored credentials and the two conversation
//!   roles the gateway plays (client toward the upstream, server toward the
//!   incoming client), both behind [`ScramConversation`]
//!
//! # Known Limitations
//!
//! SASLprep (RFC 4013) normalization is not applied. ASCII credentials
//! behave exactly like PostgreSQL; non-ASCII passwords may not.

pub mod md5;
pub mod scram;

pub use self::md5::{
    check_md5_user_password, compute_md5_password, generate_salt, md5_user_password,
    validate_md5_password,
};
pub use scram::{
    parse_scram_stored_credentials, ScramClient, ScramConversation, ScramServer, ScramStep,
    StoredCredentials,
};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute SHA256.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR two byte slices.
pub(crate) fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Encode bytes as lowercase hex string.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[]), "");
        assert_eq!(hex_encode(&[0x12, 0x34, 0xab, 0xcd]), "1234abcd");
    }

    #[test]
    fn test_hmac_sha256() {
        // HMAC-SHA256("key", "message") verified against openssl
        let result = hmac_sha256(b"key", b"message");
        let expected = [
            0x6e, 0x9e, 0xf2, 0x9b, 0x75, 0xff, 0xfc, 0x5b, 0x7a, 0xba, 0xe5, 0x27, 0xd5, 0x8f,
            0xda, 0xdb, 0x2f, 0xe4, 0x2e, 0x72, 0x19, 0x01, 0x19, 0x76, 0x91, 0x73, 0x43, 0x06,
            0x5f, 0x58, 0xed, 0x4a,
        ];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_sha256() {
        let result = sha256(b"hello");
        let expected = [
            0x2c, 0xf2, 0x4d, 0xba, 0x5f, 0xb0, 0xa3, 0x0e, 0x26, 0xe8, 0x3b, 0x2a, 0xc5, 0xb9,
            0xe2, 0x9e, 0x1b, 0x16, 0x1e, 0x5c, 0x1f, 0xa7, 0x42, 0x5e, 0x73, 0x04, 0x33, 0x62,
            0x93, 0x8b, 0x98, 0x24,
        ];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_xor_bytes() {
        assert_eq!(xor_bytes(&[0xff], &[0xff]), vec![0x00]);
        assert_eq!(xor_bytes(&[0x12, 0x34], &[0x56, 0x78]), vec![0x44, 0x4c]);
    }
}
