//! Credential encryption for modelgate.
//!
//! Provider OAuth tokens and raw API keys are stored in the database as
//! opaque ciphertext produced here. Only this module ever sees the
//! plaintext.
//!
//! # Security model
//!
//! - AES-256-GCM with a single process-lifetime key supplied as 64 hex
//!   characters at startup. The key is never persisted.
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Wrong key or tampering fails decryption; the row is surfaced as a
//!   provider error upstream, never silently re-keyed.
//! - In-place key rotation is not supported: changing the key invalidates
//!   every stored credential.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = 12 + 16;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// A 256-bit encryption key that is zeroized on drop.
///
/// The inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from its 64-hex-character configuration form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the string is not exactly
    /// 64 hex characters.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey {
            reason: format!("not valid hex: {e}"),
        })?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", v.len()),
        })?;
        Ok(Self(bytes))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The plaintext credential pair stored (encrypted) per provider account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCredentials {
    /// Access token used by the sidecar against the upstream provider.
    pub access_token: String,
    /// Refresh token, when the provider issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access-token expiry reported by the provider, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Encrypts and decrypts credential blobs with the process key.
#[derive(Clone)]
pub struct TokenCipher {
    key: EncryptionKey,
}

impl TokenCipher {
    /// Wrap the process-lifetime key.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Encrypt a credential pair into an opaque blob for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn encrypt(&self, creds: &ProviderCredentials) -> Result<Vec<u8>, CryptoError> {
        let plaintext = serde_json::to_vec(creds).map_err(|e| CryptoError::Serialization {
            reason: e.to_string(),
        })?;
        encrypt(&self.key, &plaintext)
    }

    /// Decrypt a stored blob back into the credential pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if authentication fails (wrong
    /// key, corrupted data, or tampered tag) and
    /// [`CryptoError::Serialization`] if the plaintext is not the expected
    /// JSON shape.
    pub fn decrypt(&self, blob: &[u8]) -> Result<ProviderCredentials, CryptoError> {
        let plaintext = decrypt(&self.key, blob)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Serialization {
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    // nonce || ciphertext (includes tag appended by aes-gcm)
    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes (nonce + tag minimum), and [`CryptoError::Decryption`] if
/// authentication fails.
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn creds() -> ProviderCredentials {
        ProviderCredentials {
            access_token: "at-12345".to_owned(),
            refresh_token: Some("rt-67890".to_owned()),
            expires_at: None,
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = TokenCipher::new(EncryptionKey::generate());
        let blob = cipher.encrypt(&creds()).unwrap();
        let decrypted = cipher.decrypt(&blob).unwrap();
        assert_eq!(decrypted, creds());
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let cipher1 = TokenCipher::new(EncryptionKey::generate());
        let cipher2 = TokenCipher::new(EncryptionKey::generate());
        let blob = cipher1.encrypt(&creds()).unwrap();
        assert!(matches!(
            cipher2.decrypt(&blob),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, &[0u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut blob = encrypt(&key, b"secret").unwrap();
        // Flip a byte in the ciphertext portion (after the nonce).
        if let Some(byte) = blob.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        assert!(matches!(
            decrypt(&key, &blob),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn two_encryptions_produce_different_ciphertext() {
        let cipher = TokenCipher::new(EncryptionKey::generate());
        let ct1 = cipher.encrypt(&creds()).unwrap();
        let ct2 = cipher.encrypt(&creds()).unwrap();
        // Different nonces → different ciphertext.
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn from_hex_accepts_64_hex_chars() {
        let hex_key = "ab".repeat(32);
        let key = EncryptionKey::from_hex(&hex_key).unwrap();
        let blob = encrypt(&key, b"data").unwrap();
        assert_eq!(decrypt(&key, &blob).unwrap(), b"data");
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(matches!(
            EncryptionKey::from_hex("abcd"),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "zz".repeat(32);
        assert!(matches!(
            EncryptionKey::from_hex(&bad),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }
}
