//! Bounded, time-limited hook execution.
//!
//! [`SandboxExecutor::run_hook`] takes ownership of the decrypted material,
//! launches an environment, hands the material over, and enforces the
//! wall-clock limit.  Whatever happens, the environment is torn down before
//! the call returns and the material is dropped (and zeroized) with it.
//!
//! At most [`SandboxConfig::max_concurrent`] hooks run at once, so a hung
//! hook cannot starve unrelated rotations of sandbox capacity beyond its own
//! slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use indigo_vault::RawMaterial;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::hook::{HookOutcome, HookSpec};
use crate::runtime::ContainerRuntime;

/// Runs hooks on a bounded pool of ephemeral environments.
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    permits: Arc<Semaphore>,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            runtime,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of hooks that could start right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse new hook runs.  Hooks already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `spec` with `material` on its standard input.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::Launch`] if the environment could not be started.
    /// - [`SandboxError::Timeout`] if the hook outlived its limit.
    /// - [`SandboxError::Closed`] after [`close`](Self::close).
    ///
    /// A hook that runs to completion returns `Ok` whatever its exit code;
    /// judging the outcome is the caller's business.
    #[instrument(skip(self, spec, material), fields(hook = %spec.name))]
    pub async fn run_hook(&self, spec: &HookSpec, material: RawMaterial) -> Result<HookOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Closed)?;

        let limit_ms = spec.timeout_ms.unwrap_or(self.config.max_execution_ms);
        let mut env = self.runtime.launch(spec, &self.config).await?;
        let env_id = env.id().to_string();

        let result = tokio::time::timeout(
            Duration::from_millis(limit_ms),
            env.inject_and_wait(&material),
        )
        .await;

        // The hook is done with the secret on every path from here on.
        drop(material);

        if let Err(e) = env.teardown().await {
            warn!(environment = %env_id, error = %e, "hook teardown failed");
        }

        match result {
            Ok(Ok(outcome)) => {
                info!(environment = %env_id, exit_code = outcome.exit_code, "hook finished");
                Ok(outcome)
            }
            Ok(Err(e)) => {
                warn!(environment = %env_id, error = %e, "hook environment failed");
                Err(e)
            }
            Err(_) => {
                warn!(environment = %env_id, limit_ms, "hook timed out, environment torn down");
                Err(SandboxError::Timeout { limit_ms })
            }
        }
    }
}
