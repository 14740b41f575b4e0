/// Salted password digests
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crypto_core::hash::sha256_concat;

use crate::config::SALT_SIZE;
use crate::error::{IdentityError, Result};

/// Hash a password with its salt
///
/// ## Security
///
/// - Digest: SHA-256 over the password bytes followed by the raw salt bytes
/// - Output: standard base64, stored as-is
///
/// Deterministic: the same password and salt always give the same digest,
/// which is what login comparison relies on.
pub fn hash_password(password: &str, salt: &[u8]) -> String {
    STANDARD.encode(sha256_concat(&[password.as_bytes(), salt]))
}

/// Fresh random salt of `SALT_SIZE` bytes
pub fn new_salt() -> Vec<u8> {
    crypto_core::random_bytes(SALT_SIZE)
}

pub fn encode_salt(salt: &[u8]) -> String {
    STANDARD.encode(salt)
}

/// Decode a stored salt
///
/// ## Errors
///
/// Returns `Internal` if the stored value is not valid base64
pub fn decode_salt(encoded: &str) -> Result<Vec<u8>> {
    STANDARD.decode(encoded).map_err(|e| {
        tracing::error!(error = %e, "Stored salt is not valid base64");
        IdentityError::internal(crate::error::DEFAULT_INTERNAL)
    })
}

/// Compare a candidate password against a stored hash and base64 salt
pub fn verify_password(password: &str, encoded_salt: &str, password_hash: &str) -> Result<bool> {
    let salt = decode_salt(encoded_salt)?;
    Ok(hash_password(password, &salt) == password_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let salt = new_salt();
        assert_eq!(hash_password("Passw0rd!", &salt), hash_password("Passw0rd!", &salt));
    }

    #[test]
    fn test_salt_changes_hash() {
        assert_ne!(
            hash_password("Passw0rd!", &[1u8; 32]),
            hash_password("Passw0rd!", &[2u8; 32])
        );
    }

    #[test]
    fn test_hash_matches_known_digest() {
        // sha256("abc") with an empty salt
        assert_eq!(
            hash_password("abc", &[]),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn test_new_salt_size() {
        assert_eq!(new_salt().len(), SALT_SIZE);
    }

    #[test]
    fn test_verify_password_round_trip() {
        let salt = new_salt();
        let stored = hash_password("Passw0rd!", &salt);
        let encoded = encode_salt(&salt);

        assert!(verify_password("Passw0rd!", &encoded, &stored).unwrap());
        assert!(!verify_password("passw0rd!", &encoded, &stored).unwrap());
    }

    #[test]
    fn test_corrupt_salt_is_internal_error() {
        let err = verify_password("x", "not base64!!", "hash").unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
