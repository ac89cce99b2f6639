//! Indigo hook sandbox.
//!
//! Provisioning and validation hooks run inside ephemeral, locked-down
//! containers.  The decrypted credential is delivered over the container's
//! standard input and exists inside the sandbox only for the hook's lifetime.
//!
//! - **[`config`]**: [`SandboxConfig`] holds memory, time, network and pool
//!   limits.
//! - **[`error`]**: [`SandboxError`] enumerates every failure mode.
//! - **[`hook`]**: [`HookSpec`] describes a hook, [`HookOutcome`] its result.
//! - **[`runtime`]**: the [`ContainerRuntime`] / [`Environment`] seam and the
//!   Docker CLI implementation.
//! - **[`executor`]**: [`SandboxExecutor`] enforces the timeout, bounds
//!   concurrency and guarantees teardown.

pub mod config;
pub mod error;
pub mod executor;
pub mod hook;
pub mod runtime;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use executor::SandboxExecutor;
pub use hook::{HookOutcome, HookSpec};
pub use runtime::{ContainerRuntime, DockerRuntime, Environment};
