//! CLI argument definitions for Indigo.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indigo_vault::CredentialKind;

/// Indigo -- credential lifecycle engine.
#[derive(Parser)]
#[command(
    name = "indigo",
    version,
    about = "Indigo -- credential lifecycle engine",
    long_about = "Issues, encrypts, rotates, expires and revokes credentials on behalf of \
                  workloads. `indigo run` starts the rotation scanner; the other commands \
                  operate on single credentials."
)]
pub struct Cli {
    /// Configuration file.  Defaults to `config/default.toml` when present.
    #[arg(long, global = true, env = "INDIGO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use the debug data directory instead of the production one.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the rotation scanner until interrupted.
    Run {
        /// Seconds between scan passes (overrides the config file).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Run a single scan pass and print its report.
    Scan,

    /// Issue a new credential.
    Issue {
        /// database_password, api_token, tls_keypair or cloud_access_key.
        kind: CredentialKind,

        /// Scope entry as `key=value`; repeatable.  Values that parse as JSON
        /// are stored as JSON, anything else as a string.
        #[arg(long = "scope", short, value_parser = parse_scope_entry)]
        scope: Vec<(String, serde_json::Value)>,
    },

    /// Show a credential's metadata (never its material).
    Show {
        /// Credential id.
        id: String,
    },

    /// Decrypt and print a credential's current material.
    Reveal {
        /// Credential id.
        id: String,
    },

    /// Rotate a credential now, ignoring its schedule.
    Rotate {
        /// Credential id.
        id: String,
    },

    /// Revoke a credential.
    Revoke {
        /// Credential id.
        id: String,

        /// Free-text note stored with the revocation.
        #[arg(long, short)]
        reason: Option<String>,
    },

    /// Show configuration and credential counts per state.
    Status,
}

/// Parse `key=value` into a scope entry.
fn parse_scope_entry(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty scope key in `{raw}`"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_entries_keep_json_types() {
        assert_eq!(
            parse_scope_entry("length=48").unwrap(),
            ("length".into(), serde_json::json!(48))
        );
        assert_eq!(
            parse_scope_entry("database=orders").unwrap(),
            ("database".into(), serde_json::json!("orders"))
        );
        assert!(parse_scope_entry("no-separator").is_err());
        assert!(parse_scope_entry("=value").is_err());
    }

    #[test]
    fn issue_parses_kind_and_scope() {
        let cli = Cli::try_parse_from([
            "indigo",
            "--debug",
            "issue",
            "database-password",
            "--scope",
            "database=orders",
            "-s",
            "role=app",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Commands::Issue { kind, scope } => {
                assert_eq!(kind, CredentialKind::DatabasePassword);
                assert_eq!(scope.len(), 2);
            }
            _ => panic!("expected issue"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Cli::try_parse_from(["indigo", "issue", "ssh_key"]).is_err());
    }
}
