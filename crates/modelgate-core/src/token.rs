//! Opaque tokens for admin sessions and CSRF.
//!
//! Session tokens are 256 bits of OS CSPRNG randomness, hex-encoded. The
//! cookie carries the plaintext token; the database stores only its
//! SHA-256 hash, so a leaked database never yields a usable session.
//! CSRF tokens use the same generator but are stored as-is — the
//! double-submit check only needs unpredictability.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh opaque token (64 hex chars, 256 bits of randomness).
#[must_use]
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a plaintext token with SHA-256, returning the hex-encoded digest.
///
/// One-way: the plaintext token cannot be recovered.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_64_hex_chars() {
        let token = new_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(new_token(), new_token());
    }

    #[test]
    fn hash_is_deterministic_and_distinct_from_input() {
        let token = new_token();
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }
}
