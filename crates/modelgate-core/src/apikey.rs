//! API-key material for end users.
//!
//! Keys have the shape `sk-<name>-<32 random chars>`. The server stores
//! only an Argon2id digest of the full key plus the displayable prefix
//! `sk-<name>`; the plaintext is returned exactly once at creation.
//!
//! # Security model
//!
//! - The 32-character secret comes from the OS CSPRNG.
//! - Digests use Argon2id in PHC string format — memory-hard, salted,
//!   verified in constant time by the `argon2` crate.
//! - Lookup is by prefix, so verification cost is one digest check per
//!   request, not a table scan.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString};
use argon2::Argon2;
use rand::Rng;

use crate::error::KeyError;

/// Length of the random secret portion of a key.
const SECRET_LEN: usize = 32;

/// Alphabet for the secret portion. Alphanumeric only, so the key stays
/// shell- and header-safe.
const SECRET_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A freshly generated key: the plaintext (shown once) and its prefix.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Full plaintext key, `sk-<name>-<secret>`. Never stored.
    pub plaintext: String,
    /// Displayable prefix, `sk-<name>`. Stored and unique per user.
    pub prefix: String,
}

/// Generate a new API key for the given user name.
///
/// The name is folded into the prefix after stripping everything but
/// lowercase alphanumerics, so the prefix parses unambiguously (the secret
/// begins after the second hyphen).
#[must_use]
pub fn generate(name: &str) -> GeneratedKey {
    let slug: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let slug = if slug.is_empty() { "user".to_owned() } else { slug };

    let mut rng = rand::thread_rng();
    let secret: String = (0..SECRET_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SECRET_ALPHABET.len());
            char::from(SECRET_ALPHABET[idx])
        })
        .collect();

    let prefix = format!("sk-{slug}");
    GeneratedKey {
        plaintext: format!("{prefix}-{secret}"),
        prefix,
    }
}

/// Compute the Argon2id digest of a full key for storage.
///
/// # Errors
///
/// Returns [`KeyError::Hash`] if digest computation fails.
pub fn hash(plaintext_key: &str) -> Result<String, KeyError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext_key.as_bytes(), &salt)
        .map(|digest| digest.to_string())
        .map_err(|e| KeyError::Hash {
            reason: e.to_string(),
        })
}

/// Verify a presented key against a stored digest.
///
/// Returns `Ok(false)` on mismatch; errors are reserved for malformed
/// stored digests.
///
/// # Errors
///
/// Returns [`KeyError::MalformedDigest`] if the stored digest is not a
/// valid PHC string.
pub fn verify(plaintext_key: &str, stored_digest: &str) -> Result<bool, KeyError> {
    let parsed = PasswordHash::new(stored_digest).map_err(|e| KeyError::MalformedDigest {
        reason: e.to_string(),
    })?;
    match Argon2::default().verify_password(plaintext_key.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(KeyError::MalformedDigest {
            reason: e.to_string(),
        }),
    }
}

/// Extract the `sk-<name>` prefix from a presented bearer key.
///
/// # Errors
///
/// Returns [`KeyError::MalformedKey`] unless the key has the shape
/// `sk-<name>-<secret>` with a non-empty name and secret.
pub fn parse_prefix(bearer: &str) -> Result<&str, KeyError> {
    let rest = bearer.strip_prefix("sk-").ok_or(KeyError::MalformedKey)?;
    let (name, secret) = rest.split_once('-').ok_or(KeyError::MalformedKey)?;
    if name.is_empty() || secret.is_empty() {
        return Err(KeyError::MalformedKey);
    }
    // Prefix is everything up to the second hyphen.
    let prefix_len = "sk-".len() + name.len();
    Ok(&bearer[..prefix_len])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_expected_shape() {
        let key = generate("alice");
        assert_eq!(key.prefix, "sk-alice");
        assert!(key.plaintext.starts_with("sk-alice-"));
        let secret = key.plaintext.strip_prefix("sk-alice-").unwrap();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn name_is_slugged_for_prefix() {
        let key = generate("Alice Smith-2");
        assert_eq!(key.prefix, "sk-alicesmith2");
    }

    #[test]
    fn empty_name_falls_back() {
        let key = generate("---");
        assert_eq!(key.prefix, "sk-user");
    }

    #[test]
    fn hash_then_verify_roundtrip() {
        let key = generate("bob");
        let digest = hash(&key.plaintext).unwrap();
        assert!(digest.starts_with("$argon2id$"));
        assert!(verify(&key.plaintext, &digest).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = generate("bob");
        let digest = hash(&key.plaintext).unwrap();
        let other = generate("bob");
        assert!(!verify(&other.plaintext, &digest).unwrap());
    }

    #[test]
    fn same_key_hashes_differently() {
        let key = generate("carol");
        let d1 = hash(&key.plaintext).unwrap();
        let d2 = hash(&key.plaintext).unwrap();
        // Random salt per digest.
        assert_ne!(d1, d2);
    }

    #[test]
    fn parse_prefix_extracts_up_to_second_hyphen() {
        assert_eq!(parse_prefix("sk-alice-abcd1234").unwrap(), "sk-alice");
    }

    #[test]
    fn parse_prefix_rejects_malformed_keys() {
        assert!(parse_prefix("alice-abcd").is_err());
        assert!(parse_prefix("sk-alice").is_err());
        assert!(parse_prefix("sk--abcd").is_err());
        assert!(parse_prefix("sk-alice-").is_err());
        assert!(parse_prefix("").is_err());
    }

    #[test]
    fn malformed_digest_is_an_error_not_a_mismatch() {
        assert!(matches!(
            verify("sk-a-b", "not-a-phc-string"),
            Err(KeyError::MalformedDigest { .. })
        ));
    }
}
