//! Shared cryptographic primitives for the storefront backend
//!
//! - `jwt`: HS256 signing and validation with per-kind key material
//! - `hash`: SHA-256 helpers
//! - random byte and numeric one-time code generation backed by the OS RNG
pub mod hash;
pub mod jwt;

use rand::{rngs::OsRng, Rng, RngCore};

/// Fill a buffer of `len` bytes from the operating system RNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a decimal code with exactly `digits` digits (no leading zero)
///
/// `digits` is clamped to `1..=9` so the range always fits in a `u32`.
pub fn numeric_code(digits: u32) -> String {
    let digits = digits.clamp(1, 9);
    let low = if digits == 1 { 0 } else { 10u32.pow(digits - 1) };
    let high = 10u32.pow(digits) - 1;
    OsRng.gen_range(low..=high).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(32).len(), 32);
        assert!(random_bytes(0).is_empty());
    }

    #[test]
    fn test_random_bytes_differ() {
        assert_ne!(random_bytes(32), random_bytes(32));
    }

    #[test]
    fn test_numeric_code_six_digits() {
        for _ in 0..200 {
            let code = numeric_code(6);
            assert_eq!(code.len(), 6);
            let value: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&value));
        }
    }
}
