//! Vault error types.
//!
//! All key-hierarchy, envelope and generation failures surface through
//! [`VaultError`], which is the single error type returned by every public API
//! in this crate.  Each variant carries enough context for callers to decide
//! how to handle the failure without inspecting opaque strings.

/// Unified error type for the Indigo vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Authentication tag mismatch or malformed envelope.  Treated as tamper
    /// or corruption; never retried blindly.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// A freshly drawn nonce collided with one already issued under the same
    /// data key.  Sealing fails closed.
    #[error("nonce reuse detected under data key {key_id}")]
    NonceReuse { key_id: String },

    /// Key derivation failed (e.g. invalid parameters for PBKDF2).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Key hierarchy errors -------------------------------------------------
    /// The key-management oracle is unreachable or refused a wrap/unwrap.
    #[error("key unavailable: {reason}")]
    KeyUnavailable { reason: String },

    /// The local key-encryption key could not be found in the keychain.
    #[error("key-encryption key not found in keychain")]
    MasterKeyNotFound,

    /// Writing the local key-encryption key to the keychain failed.
    #[error("failed to store key-encryption key: {reason}")]
    MasterKeyStoreFailed { reason: String },

    // -- Generation errors ----------------------------------------------------
    /// The identity provider failed to issue material for a delegated kind.
    #[error("upstream generation failed for {kind}: {reason}")]
    UpstreamGeneration { kind: String, reason: String },

    /// The scope carried a value the generator cannot honour.
    #[error("invalid scope: {reason}")]
    InvalidScope { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (keychain file operations, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Shorthand for a [`VaultError::KeyUnavailable`].
    pub fn key_unavailable(reason: impl Into<String>) -> Self {
        Self::KeyUnavailable {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
