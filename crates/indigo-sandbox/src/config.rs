//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the limits applied to every hook container.
//! Defaults come from the [`Default`] implementation; the builder-style
//! `with_*` methods customise individual fields.

use serde::Deserialize;

/// Resource limits and permissions for hook containers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime CLI to invoke.
    ///
    /// Default: **`docker`**.
    pub runtime_binary: String,

    /// Memory limit per container, in bytes.
    ///
    /// Default: **256 MiB**.
    pub max_memory: usize,

    /// Wall-clock limit for one hook run, in milliseconds, unless the hook
    /// sets its own.
    ///
    /// Default: **30 000 ms**.
    pub max_execution_ms: u64,

    /// Whether hook containers get a network.
    ///
    /// Default: **false** (`--network none`).
    pub allow_network: bool,

    /// Maximum number of hooks running at once.
    ///
    /// Default: **4**.
    pub max_concurrent: usize,

    /// Captured stdout/stderr beyond this many bytes is truncated.
    ///
    /// Default: **64 KiB**.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".into(),
            max_memory: 256 * 1024 * 1024,
            max_execution_ms: 30_000,
            allow_network: false,
            max_concurrent: 4,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime_binary(mut self, binary: impl Into<String>) -> Self {
        self.runtime_binary = binary.into();
        self
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_max_execution_ms(mut self, ms: u64) -> Self {
        self.max_execution_ms = ms;
        self
    }

    pub fn with_allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Set the pool size.  Zero is raised to one.
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}
