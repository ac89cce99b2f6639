//! Lifecycle error types.
//!
//! Every engine operation surfaces failures through [`LifecycleError`].  The
//! vault, store and sandbox errors that carry lifecycle meaning (an oracle
//! outage, a lost compare-and-swap, a hook timeout) are lifted into their own
//! variants so callers can match on them without digging through sources.

use indigo_sandbox::SandboxError;
use indigo_store::{CredentialState, StoreError};
use indigo_vault::VaultError;

/// Unified error type for the lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    // -- Key hierarchy and generation -----------------------------------------
    /// The key-management oracle could not wrap or unwrap a data key.
    /// Crypto-dependent work is deferred, never abandoned.
    #[error("key unavailable: {reason}")]
    KeyUnavailable { reason: String },

    /// The identity provider refused or failed to issue delegated material.
    #[error("upstream generation failed for {kind}: {reason}")]
    UpstreamGeneration { kind: String, reason: String },

    /// A stored envelope failed authentication.  Treated as tamper.
    #[error("decryption failed for credential {id}: {reason}")]
    DecryptionFailed { id: String, reason: String },

    // -- Concurrency ------------------------------------------------------------
    /// A compare-and-swap was submitted against a stale version.
    #[error("version conflict on {id}: expected v{expected}, found v{actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// A transition kept losing compare-and-swap races.
    #[error("transition on {id} abandoned after {attempts} conflicting writes")]
    TransitionConflict { id: String, attempts: u32 },

    // -- Hooks --------------------------------------------------------------------
    #[error("sandbox timeout: hook exceeded {limit_ms}ms")]
    SandboxTimeout { limit_ms: u64 },

    #[error("sandbox launch failed: {reason}")]
    SandboxLaunch { reason: String },

    /// The hook ran to completion and rejected the material.
    #[error("hook {hook} exited with code {exit_code}: {stderr}")]
    HookFailed {
        hook: String,
        exit_code: i32,
        stderr: String,
    },

    // -- Records ------------------------------------------------------------------
    #[error("credential not found: {id}")]
    NotFound { id: String },

    /// The state machine does not allow `transition` from `from`.
    #[error("invalid transition {transition} for credential {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: CredentialState,
        transition: &'static str,
    },

    /// The credential exists but holds no material a reader may receive.
    #[error("credential {id} is {state} and cannot be read")]
    NotReadable { id: String, state: CredentialState },

    /// A kind policy produced an impossible schedule.
    #[error("invalid lifecycle policy: {reason}")]
    InvalidPolicy { reason: String },

    /// The scanner has been shut down and will not start another pass.
    #[error("scanner is shut down")]
    ScannerShutdown,

    // -- Underlying errors ----------------------------------------------------
    #[error(transparent)]
    Vault(VaultError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Sandbox(SandboxError),
}

impl LifecycleError {
    /// Whether the same operation may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyUnavailable { .. }
                | Self::UpstreamGeneration { .. }
                | Self::VersionConflict { .. }
                | Self::TransitionConflict { .. }
                | Self::SandboxTimeout { .. }
                | Self::SandboxLaunch { .. }
                | Self::HookFailed { .. }
                | Self::Sandbox(_)
        )
    }

    /// Whether a rotation that failed with this error spends one attempt of
    /// the credential's retry budget.
    ///
    /// Key outages and write races do not: they say nothing about the new
    /// material and are retried without penalty.
    pub fn counts_against_budget(&self) -> bool {
        matches!(
            self,
            Self::UpstreamGeneration { .. }
                | Self::SandboxTimeout { .. }
                | Self::SandboxLaunch { .. }
                | Self::HookFailed { .. }
                | Self::Sandbox(_)
                | Self::Vault(_)
        )
    }

    /// Whether the scanner should put the job back on its queue this pass.
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            Self::KeyUnavailable { .. } | Self::TransitionConflict { .. }
        )
    }
}

impl From<VaultError> for LifecycleError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::KeyUnavailable { reason } => Self::KeyUnavailable { reason },
            VaultError::UpstreamGeneration { kind, reason } => {
                Self::UpstreamGeneration { kind, reason }
            }
            other => Self::Vault(other),
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => Self::VersionConflict {
                id,
                expected,
                actual,
            },
            StoreError::NotFound { id, .. } => Self::NotFound { id },
            other => Self::Store(other),
        }
    }
}

impl From<SandboxError> for LifecycleError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout { limit_ms } => Self::SandboxTimeout { limit_ms },
            SandboxError::Launch { reason } => Self::SandboxLaunch { reason },
            other => Self::Sandbox(other),
        }
    }
}

/// Convenience alias used throughout the lifecycle crate.
pub type Result<T> = std::result::Result<T, LifecycleError>;
