//! Sandbox error types.

/// Unified error type for the hook sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The container could not be started.
    #[error("sandbox launch failed: {reason}")]
    Launch { reason: String },

    /// The hook exceeded its wall-clock limit and was torn down.
    #[error("timeout: hook exceeded {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// Talking to a running environment failed (stdin closed early, the
    /// runtime client died, ...).
    #[error("sandbox environment error: {reason}")]
    Environment { reason: String },

    /// The executor's worker pool was shut down.
    #[error("sandbox executor is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
