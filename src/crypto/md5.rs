//! PostgreSQL MD5 password authentication
//!
//! The wire format is `"md5" + md5(md5(password + user) + salt)`, both
//! digests rendered as lowercase hex. `pg_authid.rolpassword` stores the
//! inner half as `"md5" + md5(password + user)`, which is enough to check a
//! client response without knowing the password.
//!
//! Reference: <https://www.postgresql.org/docs/current/auth-password.html>

use ::md5::{Digest, Md5};
use rand::Rng;
use subtle::ConstantTimeEq;

use super::hex_encode;

/// Generate a random 4-byte salt for an MD5 challenge.
pub fn generate_salt() -> [u8; 4] {
    rand::thread_rng().gen()
}

/// Stored form of an MD5 credential: `"md5" + md5(password + user)`.
pub fn md5_user_password(user: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    format!("md5{}", hex_encode(&hasher.finalize()))
}

/// Compute the MD5 password response for PostgreSQL authentication.
///
/// Returns a string in the format "md5XXXXXXXX..." (35 characters total).
///
/// # Example
///
/// ```
/// use pggateway::crypto::compute_md5_password;
///
/// let hash = compute_md5_password("user", "password", &[0x01, 0x02, 0x03, 0x04]);
/// assert!(hash.starts_with("md5"));
/// assert_eq!(hash.len(), 35);
/// ```
pub fn compute_md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let stored = md5_user_password(user, password);
    format!("md5{}", salted_digest(stored[3..].as_bytes(), salt))
}

/// Check a client response against a stored MD5 credential.
///
/// `stored_hex` is the stored credential without its `md5` prefix and
/// `response_hex` is the client's response without its `md5` prefix.
pub fn check_md5_user_password(stored_hex: &[u8], salt: &[u8; 4], response_hex: &[u8]) -> bool {
    let expected = salted_digest(stored_hex, salt);
    expected.as_bytes().ct_eq(response_hex).into()
}

/// Validate a full `md5...` response for a known user and password.
pub fn validate_md5_password(response: &str, user: &str, password: &str, salt: &[u8; 4]) -> bool {
    let Some(response_hex) = response.strip_prefix("md5") else {
        return false;
    };
    let stored = md5_user_password(user, password);
    check_md5_user_password(stored[3..].as_bytes(), salt, response_hex.as_bytes())
}

/// hex(md5(inner_hex + salt))
fn salted_digest(inner_hex: &[u8], salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(inner_hex);
    hasher.update(salt);
    hex_encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_format() {
        let hash = compute_md5_password("user", "password", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);

        let hex_part = &hash[3..];
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex_part, hex_part.to_lowercase());
    }

    #[test]
    fn test_md5_user_password_format() {
        let stored = md5_user_password("user", "password");
        assert!(stored.starts_with("md5"));
        assert_eq!(stored.len(), 35);
        assert_ne!(stored, md5_user_password("resu", "password"));
    }

    #[test]
    fn test_md5_matches_manual_computation() {
        let salt = [0x01, 0x02, 0x03, 0x04];

        let mut hasher = Md5::new();
        hasher.update(b"passworduser");
        let stage1_hex = hex_encode(&hasher.finalize());

        let mut hasher = Md5::new();
        hasher.update(stage1_hex.as_bytes());
        hasher.update(salt);
        let expected = format!("md5{}", hex_encode(&hasher.finalize()));

        assert_eq!(compute_md5_password("user", "password", &salt), expected);
    }

    #[test]
    fn test_md5_different_salt_different_hash() {
        let hash1 = compute_md5_password("user", "pass", &[0, 0, 0, 0]);
        let hash2 = compute_md5_password("user", "pass", &[0, 0, 0, 1]);
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_validate_roundtrip() {
        let cases = [
            ("bob", "secret", [0xde, 0xad, 0xbe, 0xef]),
            ("alice", "", [0, 0, 0, 0]),
            ("用户", "密码", [1, 2, 3, 4]),
        ];
        for (user, password, salt) in cases {
            let response = compute_md5_password(user, password, &salt);
            assert!(validate_md5_password(&response, user, password, &salt));
        }
    }

    #[test]
    fn test_validate_rejects_bit_flips() {
        let salt = [0x10, 0x20, 0x30, 0x40];
        let response = compute_md5_password("bob", "secret", &salt);
        assert!(validate_md5_password(&response, "bob", "secret", &salt));

        // Flip every bit of every response byte in turn
        for i in 0..response.len() {
            for bit in 0..8 {
                let mut bytes = response.clone().into_bytes();
                bytes[i] ^= 1 << bit;
                let flipped = String::from_utf8_lossy(&bytes).into_owned();
                assert!(!validate_md5_password(&flipped, "bob", "secret", &salt));
            }
        }

        // And every bit of the salt
        for i in 0..4 {
            for bit in 0..8 {
                let mut flipped_salt = salt;
                flipped_salt[i] ^= 1 << bit;
                assert!(!validate_md5_password(&response, "bob", "secret", &flipped_salt));
            }
        }

        assert!(!validate_md5_password(&response, "bob", "secreT", &salt));
        assert!(!validate_md5_password(&response, "bOb", "secret", &salt));
    }

    #[test]
    fn test_check_against_stored_credential() {
        let salt = generate_salt();
        let stored = md5_user_password("bob", "secret");
        let response = compute_md5_password("bob", "secret", &salt);
        assert!(check_md5_user_password(
            stored[3..].as_bytes(),
            &salt,
            response[3..].as_bytes()
        ));
        assert!(!check_md5_user_password(
            stored[3..].as_bytes(),
            &salt,
            b"00000000000000000000000000000000"
        ));
    }

    #[test]
    fn test_generate_salt_varies() {
        let salts: Vec<[u8; 4]> = (0..8).map(|_| generate_salt()).collect();
        assert!(salts.iter().any(|s| s != &salts[0]));
    }
}
