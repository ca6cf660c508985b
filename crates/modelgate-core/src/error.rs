//! Error types for `modelgate-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material — only operation
//! descriptions.

/// Errors from cryptographic operations on credential blobs.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The configured encryption key is not 64 hex characters.
    #[error("invalid encryption key: {reason}")]
    InvalidKey { reason: String },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The decrypted blob is not the expected JSON shape.
    #[error("credential blob deserialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from API-key hashing and verification.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Argon2 digest computation failed.
    #[error("key hashing failed: {reason}")]
    Hash { reason: String },

    /// The stored digest could not be parsed as a PHC string.
    #[error("stored key digest is malformed: {reason}")]
    MalformedDigest { reason: String },

    /// The presented key does not have the `sk-<name>-<secret>` shape.
    #[error("malformed API key")]
    MalformedKey,
}
