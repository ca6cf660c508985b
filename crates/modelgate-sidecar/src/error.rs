//! Error types for `modelgate-sidecar`.

use modelgate_core::CryptoError;

/// Errors from config projection and child lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    /// A stored credential blob failed to decrypt. The row must be
    /// deleted or re-authorized by an admin; it is never re-keyed here.
    #[error("credentials for account {account_id} are unreadable: {source}")]
    Credential {
        account_id: i64,
        #[source]
        source: CryptoError,
    },

    /// YAML serialization of the projected config failed.
    #[error("config serialization failed: {reason}")]
    Yaml { reason: String },

    /// The config file could not be written or renamed into place.
    #[error("config write failed at {path}: {source}")]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The child process could not be spawned (missing binary, bad path).
    #[error("failed to spawn sidecar: {reason}")]
    Spawn { reason: String },

    /// The child never answered its health endpoint within the budget.
    #[error("sidecar did not become healthy within {budget_secs}s")]
    Unhealthy { budget_secs: u64 },

    /// Reading provider state from the store failed.
    #[error("store error: {0}")]
    Store(#[from] modelgate_store::StoreError),
}
