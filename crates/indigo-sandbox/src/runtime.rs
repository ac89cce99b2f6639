//! Container runtime abstraction.
//!
//! A [`ContainerRuntime`] launches one ephemeral [`Environment`] per hook run.
//! The environment receives the secret through an in-memory channel (the
//! container's standard input for [`DockerRuntime`]) and is torn down by the
//! executor on every exit path.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use indigo_vault::RawMaterial;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::hook::{HookOutcome, HookSpec};

/// Prefix of every container name created by Indigo.
pub const CONTAINER_PREFIX: &str = "indigo-hook-";

/// Starts isolated environments for hooks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: &HookSpec, config: &SandboxConfig)
    -> Result<Box<dyn Environment>>;
}

/// One running hook environment.
#[async_trait]
pub trait Environment: Send {
    /// Identifier for logs (container name).
    fn id(&self) -> &str;

    /// Hand `secret` to the hook and wait for it to finish.
    async fn inject_and_wait(&mut self, secret: &RawMaterial) -> Result<HookOutcome>;

    /// Destroy the environment.  Must be safe to call after a completed,
    /// failed or abandoned [`inject_and_wait`](Self::inject_and_wait).
    async fn teardown(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

/// Runs hooks with the Docker CLI (or any CLI-compatible runtime such as
/// podman, via [`SandboxConfig::runtime_binary`]).
#[derive(Debug, Default, Clone)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }
}

/// Arguments for `docker run` that start `spec` as container `name`.
pub fn run_args(spec: &HookSpec, config: &SandboxConfig, name: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--name".into(),
        name.into(),
        "--read-only".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--memory".into(),
        format!("{}b", config.max_memory),
        "--pids-limit".into(),
        "64".into(),
    ];
    if !config.allow_network {
        args.push("--network".into());
        args.push("none".into());
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(
        &self,
        spec: &HookSpec,
        config: &SandboxConfig,
    ) -> Result<Box<dyn Environment>> {
        let name = format!("{CONTAINER_PREFIX}{}", Uuid::now_v7().simple());
        let args = run_args(spec, config, &name);

        debug!(container = %name, image = %spec.image, hook = %spec.name, "launching hook container");

        let child = Command::new(&config.runtime_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Launch {
                reason: format!("failed to spawn {}: {e}", config.runtime_binary),
            })?;

        Ok(Box::new(DockerEnvironment {
            name,
            runtime_binary: config.runtime_binary.clone(),
            max_output_bytes: config.max_output_bytes,
            child: Some(child),
        }))
    }
}

struct DockerEnvironment {
    name: String,
    runtime_binary: String,
    max_output_bytes: usize,
    child: Option<Child>,
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn id(&self) -> &str {
        &self.name
    }

    async fn inject_and_wait(&mut self, secret: &RawMaterial) -> Result<HookOutcome> {
        let child = self.child.as_mut().ok_or_else(|| SandboxError::Environment {
            reason: "environment already finished".into(),
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| SandboxError::Environment {
            reason: "container stdin unavailable".into(),
        })?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // Close stdin as soon as the secret is written so the hook sees EOF.
        let write = async move {
            stdin.write_all(secret.as_bytes()).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<_, std::io::Error>(())
        };
        let limit = self.max_output_bytes;
        let read_out = async {
            match stdout.as_mut() {
                Some(out) => read_capped(out, limit).await,
                None => Ok(Zeroizing::new(Vec::new())),
            }
        };
        let read_err = async {
            match stderr.as_mut() {
                Some(err) => read_capped(err, limit).await,
                None => Ok(Zeroizing::new(Vec::new())),
            }
        };

        let (written, out, err) = tokio::join!(write, read_out, read_err);
        match written {
            // A hook that exits without reading stdin is judged by its
            // exit code, not by the broken pipe.
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(SandboxError::Environment {
                    reason: format!("failed to inject material: {e}"),
                });
            }
            _ => {}
        }
        let status = child.wait().await?;

        let exit_code = status.code().unwrap_or(-1);
        debug!(container = %self.name, exit_code, "hook container exited");
        Ok(HookOutcome::from_raw(
            exit_code,
            &out?,
            &err?,
            self.max_output_bytes,
        ))
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                // Killing the client does not necessarily stop the container;
                // the `rm -f` below does.
                let _ = child.start_kill();
            }
        }

        let removal = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.runtime_binary)
                .args(["rm", "-f", self.name.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        match removal {
            // `--rm` usually removed it already; a non-zero status just
            // means there was nothing left.
            Ok(Ok(status)) => {
                debug!(container = %self.name, removed = status.success(), "hook container torn down");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(container = %self.name, error = %e, "failed to remove hook container");
                Err(e.into())
            }
            Err(_) => {
                warn!(container = %self.name, "timed out removing hook container");
                Err(SandboxError::Environment {
                    reason: format!("timed out removing {}", self.name),
                })
            }
        }
    }
}

/// Keep at most `limit + 1` bytes of `reader` (one extra so truncation is
/// visible) and discard the rest.  The buffer never reallocates, so no
/// unzeroed copy of hook output is left behind.
async fn read_capped<R>(reader: &mut R, limit: usize) -> std::io::Result<Zeroizing<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let cap = limit.saturating_add(1);
    let mut buf = Zeroizing::new(Vec::with_capacity(cap));
    (&mut *reader).take(cap as u64).read_to_end(&mut buf).await?;
    // Keep draining so a chatty hook never blocks on a full pipe.
    tokio::io::copy(reader, &mut tokio::io::sink()).await?;
    Ok(buf)
}
