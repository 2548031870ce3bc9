//! API key generation and validation.
//!
//! Keys are handed out once in plaintext. Only their SHA-256 hash is stored,
//! and incoming keys are hashed before lookup.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix marking MediaRun API keys.
pub const KEY_PREFIX: &str = "mr_";

/// Generate a new API key.
///
/// Returns `(plaintext_key, key_hash)`. Only the hash should be persisted.
pub fn generate_api_key() -> (String, String) {
    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);

    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(key_bytes));
    let key_hash = hash_key(&plaintext);
    (plaintext, key_hash)
}

/// Hash a key using SHA-256.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Compare a presented secret with the expected one.
///
/// Both sides are hashed first so the comparison time does not depend on
/// where the inputs differ.
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_hashes_to_returned_hash() {
        let (key, hash) = generate_api_key();
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(key.len(), KEY_PREFIX.len() + 64);
        assert_eq!(hash_key(&key), hash);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_keys_are_unique() {
        let (a, _) = generate_api_key();
        let (b, _) = generate_api_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer mr_abc"), Some("mr_abc"));
        assert_eq!(bearer_token("bearer  mr_abc "), Some("mr_abc"));
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("mr_abc"), None);
    }

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cre"));
    }
}
