//! Core library for modelgate.
//!
//! Holds the pieces every other crate depends on: authenticated encryption
//! for provider credentials at rest, API-key generation and verification,
//! opaque session tokens, and the typed settings blobs stored in the
//! database.

pub mod apikey;
pub mod crypto;
pub mod error;
pub mod settings;
pub mod token;

pub use error::{CryptoError, KeyError};
