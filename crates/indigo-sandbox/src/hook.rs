//! Hook definitions and results.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A provisioning or validation step run against a credential's material.
///
/// The material arrives on the container's standard input; the hook signals
/// success with exit code 0.
#[derive(Debug, Clone, Deserialize)]
pub struct HookSpec {
    /// Name used in logs and container names.
    pub name: String,
    /// Container image to run.
    pub image: String,
    /// Command and arguments; empty means the image's entrypoint.
    #[serde(default)]
    pub command: Vec<String>,
    /// Non-secret environment for the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-hook override of the executor's wall-clock limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HookSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// What a finished hook reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl HookOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Build an outcome from raw process output, truncating each stream to
    /// `max_bytes`.
    pub fn from_raw(exit_code: i32, stdout: &[u8], stderr: &[u8], max_bytes: usize) -> Self {
        Self {
            exit_code,
            stdout: truncate_output(stdout, max_bytes),
            stderr: truncate_output(stderr, max_bytes),
        }
    }
}

fn truncate_output(raw: &[u8], max_bytes: usize) -> String {
    if raw.len() <= max_bytes {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut s = String::from_utf8_lossy(&raw[..max_bytes]).into_owned();
    s.push_str(&format!("\n... [output truncated at {max_bytes} bytes]"));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_truncates_long_output() {
        let outcome = HookOutcome::from_raw(0, &[b'a'; 100], b"err", 10);
        assert!(outcome.success());
        assert!(outcome.stdout.starts_with("aaaaaaaaaa\n..."));
        assert_eq!(outcome.stderr, "err");
    }

    #[test]
    fn spec_builder_and_deserialize() {
        let spec = HookSpec::new("pg-check", "postgres:16")
            .with_command(["psql", "-c", "select 1"])
            .with_env("PGHOST", "db")
            .with_timeout_ms(2000);
        assert_eq!(spec.command.len(), 3);
        assert_eq!(spec.timeout_ms, Some(2000));

        let parsed: HookSpec =
            serde_json::from_str(r#"{"name":"n","image":"alpine"}"#).unwrap();
        assert!(parsed.command.is_empty());
        assert!(parsed.timeout_ms.is_none());
    }
}
