//! Credential hashing, generation and comparison.
//!
//! Raw credentials are never persisted. Everything that outlives a request
//! is keyed by the SHA-256 hex digest produced by [`hash_token`].

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hashes a credential with SHA-256 for storage and lookup.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a cryptographically secure random credential.
///
/// 32 random bytes, base64url-encoded without padding (43 characters).
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compares two credentials in constant time.
#[must_use]
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Short, non-reversible label for logs and rate-limit keys.
#[must_use]
pub fn token_fingerprint(token: &str) -> String {
    hash_token(token)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
        assert_eq!(hash_token("abc").len(), 64);
    }

    #[test]
    fn test_generate_token_length_and_uniqueness() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
        assert!(!a.contains('='));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("same", "same"));
        assert!(!tokens_match("same", "diff"));
        assert!(!tokens_match("short", "longer-value"));
    }

    #[test]
    fn test_token_fingerprint_is_prefix_of_hash() {
        let token = "refresh-xyz";
        assert!(hash_token(token).starts_with(&token_fingerprint(token)));
        assert_eq!(token_fingerprint(token).len(), 16);
    }
}
