//! CLI entry point for Indigo.
//!
//! This binary provides the `indigo` command: `run` drives the rotation
//! scanner until interrupted, the remaining subcommands act on single
//! credentials or report status.

mod cli;
mod config;
mod services;

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use indigo_lifecycle::{LifecycleEvent, Outcome, Scanner};
use indigo_vault::Scope;

use crate::cli::{Cli, Commands};
use crate::config::IndigoConfig;
use crate::services::Services;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Run { .. } | Commands::Scan => "info",
        _ => "warn",
    };
    init_tracing(default_level, cli.json);

    let mut config = IndigoConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { interval_secs } => {
            if let Some(secs) = interval_secs {
                config.scanner.interval_secs = secs;
            }
            cmd_run(&config, cli.debug).await
        }
        Commands::Scan => cmd_scan(&config, cli.debug).await,
        Commands::Issue { kind, scope } => {
            let scope = scope
                .into_iter()
                .fold(Scope::new(), |scope, (key, value)| scope.with(key, value));
            cmd_issue(&config, cli.debug, kind, scope).await
        }
        Commands::Show { id } => cmd_show(&config, cli.debug, &id).await,
        Commands::Reveal { id } => cmd_reveal(&config, cli.debug, &id).await,
        Commands::Rotate { id } => cmd_rotate(&config, cli.debug, &id).await,
        Commands::Revoke { id, reason } => cmd_revoke(&config, cli.debug, &id, reason).await,
        Commands::Status => cmd_status(&config, cli.debug).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &IndigoConfig, debug: bool) -> Result<()> {
    let debug_enabled = debug;
    info!(version = env!("CARGO_PKG_VERSION"), debug = debug_enabled, "starting indigo");
    let services = Services::build(config, debug).await?;

    let mut events = services.engine.events().subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let scanner = Scanner::new(Arc::clone(&services.engine), config.scanner.clone());
    let handle = scanner.start();

    wait_for_shutdown(&services).await?;
    info!("interrupt received, finishing current pass");

    scanner.shutdown();
    handle.await.context("scanner task failed")?;
    event_log.abort();
    info!("indigo stopped");
    Ok(())
}

/// Wait for ctrl-c.  On Unix, SIGHUP meanwhile flushes the data key cache so
/// keys are fetched from the oracle again.
#[cfg(unix)]
async fn wait_for_shutdown(services: &Services) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("failed to listen for shutdown signal");
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, flushing data key cache");
                if services.key_events.send(indigo_vault::KeyEvent::Flush).is_err() {
                    warn!("key cache listener is not running");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_services: &Services) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::RotationFailed {
            credential_id,
            attempt,
            error,
        } => warn!(%credential_id, attempt, %error, "event: rotation failed"),
        LifecycleEvent::Revoked {
            credential_id,
            reason,
        } => warn!(%credential_id, ?reason, "event: revoked"),
        other => match serde_json::to_string(other) {
            Ok(json) => info!(credential_id = %other.credential_id(), event = %json, "event"),
            Err(_) => info!(credential_id = %other.credential_id(), "event"),
        },
    }
}

// ---------------------------------------------------------------------------
// Subcommand: scan
// ---------------------------------------------------------------------------

async fn cmd_scan(config: &IndigoConfig, debug: bool) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let scanner = Scanner::new(Arc::clone(&services.engine), config.scanner.clone());
    let report = scanner.scan_once().await.context("scan pass failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: issue / show / reveal / rotate / revoke
// ---------------------------------------------------------------------------

async fn cmd_issue(
    config: &IndigoConfig,
    debug: bool,
    kind: indigo_vault::CredentialKind,
    scope: Scope,
) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let record = services
        .engine
        .issue(kind, scope)
        .await
        .with_context(|| format!("failed to issue {kind}"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_show(config: &IndigoConfig, debug: bool, id: &str) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let record = services.engine.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_reveal(config: &IndigoConfig, debug: bool, id: &str) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let material = services
        .engine
        .read(id)
        .await
        .with_context(|| format!("failed to read credential {id}"))?;
    match material.as_str() {
        Some(text) => println!("{text}"),
        None => println!(
            "{}",
            base64::engine::general_purpose::STANDARD.encode(material.as_bytes())
        ),
    }
    Ok(())
}

async fn cmd_rotate(config: &IndigoConfig, debug: bool, id: &str) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let outcome = services
        .engine
        .rotate_now(id)
        .await
        .with_context(|| format!("failed to rotate credential {id}"))?;
    if matches!(outcome, Outcome::Superseded(_)) {
        println!("  Another writer rotated this credential first.");
    }
    println!("{}", serde_json::to_string_pretty(outcome.record())?);
    Ok(())
}

async fn cmd_revoke(
    config: &IndigoConfig,
    debug: bool,
    id: &str,
    reason: Option<String>,
) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let record = services.engine.revoke(id, reason).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: &IndigoConfig, debug: bool) -> Result<()> {
    let services = Services::build(config, debug).await?;
    let counts = services.engine.counts().await?;

    println!();
    println!("  Indigo Status");
    println!("  =============");
    println!();
    println!(
        "  Mode:             {}",
        if debug { "debug" } else { "production" }
    );
    println!("  Data directory:   {}", services.data_dir.display());
    println!("  Database:         {}", services.database_path.display());
    match &config.kms {
        Some(kms) => println!("  Key oracle:       remote ({})", kms.endpoint),
        None => println!("  Key oracle:       local key file ({})", config.kek_id),
    }
    match &config.identity_provider {
        Some(idp) => println!("  Identity provider: {}", idp.endpoint),
        None => println!("  Identity provider: NOT CONFIGURED"),
    }
    println!();
    println!("  Credentials:");
    if counts.is_empty() {
        println!("    (none)");
    }
    for (state, count) in &counts {
        println!("    {:<10} {count}", state.to_string());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
