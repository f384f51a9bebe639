//! Random values, hashing and encoding helpers shared by all components.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Number of random bytes behind state, nonce and code verifier values.
pub const RANDOM_VALUE_BYTES: usize = 32;

/// Fills a fixed-size array from the operating system RNG.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generates an unguessable base64url value (state, nonce, verifier).
#[must_use]
pub fn random_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<RANDOM_VALUE_BYTES>())
}

/// SHA-256 digest.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Base64url without padding.
#[must_use]
pub fn b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decodes base64url without padding.
///
/// # Errors
/// Returns the base64 decoder error message.
pub fn b64url_decode(data: &str) -> Result<Vec<u8>, String> {
    URL_SAFE_NO_PAD.decode(data).map_err(|e| e.to_string())
}

/// Short, non-reversible identifier of a secret value for log output.
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    hex::encode(&sha256(secret.as_bytes())[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_unique() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        assert_eq!(b64url_decode(&a).unwrap().len(), RANDOM_VALUE_BYTES);
    }

    #[test]
    fn test_fingerprint_hides_value() {
        let fp = fingerprint("eyJhbGciOiJFUzI1NiJ9.secret");
        assert_eq!(fp.len(), 12);
        assert!(!fp.contains("secret"));
        assert_eq!(fp, fingerprint("eyJhbGciOiJFUzI1NiJ9.secret"));
    }
}
