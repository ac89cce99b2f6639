//! Assembles the engine and its collaborators from an [`IndigoConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use indigo_lifecycle::LifecycleEngine;
use indigo_sandbox::{DockerRuntime, SandboxExecutor};
use indigo_store::{CredentialStore, Database, SqliteCredentialStore};
use indigo_vault::{
    CredentialGenerator, FileKeychain, HttpIdentityProvider, HttpKeyOracle, KeyEvent,
    KeyHierarchy, KeyHierarchyConfig, KeyOracle, LocalKeyOracle,
};

use crate::config::IndigoConfig;

/// Database file inside the data directory.
const DATABASE_FILE: &str = "indigo.db";

/// Capacity of the key event channel.
const KEY_EVENT_CAPACITY: usize = 16;

/// Everything a subcommand may need.
pub struct Services {
    pub engine: Arc<LifecycleEngine>,
    pub keys: Arc<KeyHierarchy>,
    /// Key events sent here reach the key hierarchy's cache.
    pub key_events: broadcast::Sender<KeyEvent>,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
}

impl Services {
    /// Open the store, set up the key hierarchy and build the engine.
    pub async fn build(config: &IndigoConfig, debug: bool) -> Result<Self> {
        let data_dir = config.data_dir(debug).to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let database_path = data_dir.join(DATABASE_FILE);
        let db = Database::open_and_migrate(database_path.clone())
            .await
            .context("failed to open database")?;
        let debug_enabled = debug;
        info!(path = %database_path.display(), debug = debug_enabled, "store initialized");
        let store: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::new(db));

        let oracle = key_oracle(config, &data_dir)?;
        let keys = Arc::new(KeyHierarchy::new(oracle, KeyHierarchyConfig::default()));
        let (key_events, key_rx) = broadcast::channel(KEY_EVENT_CAPACITY);
        // Ends when the last sender, held by `Services`, is dropped.
        let _ = Arc::clone(&keys).listen(key_rx);

        let mut generator = CredentialGenerator::new();
        if let Some(idp) = &config.identity_provider {
            let mut provider = HttpIdentityProvider::new(idp.endpoint.clone())
                .context("failed to build identity provider client")?;
            if let Some(token) = &idp.token {
                provider = provider.with_token(token.clone());
            }
            info!(endpoint = %idp.endpoint, "identity provider configured");
            generator = generator.with_identity_provider(Arc::new(provider));
        }

        let sandbox = SandboxExecutor::new(Arc::new(DockerRuntime::new()), config.sandbox.clone());

        let engine = LifecycleEngine::new(store, Arc::clone(&keys), Arc::new(generator))
            .with_sandbox(Arc::new(sandbox))
            .with_policy(config.lifecycle.clone());

        Ok(Self {
            engine: Arc::new(engine),
            keys,
            key_events,
            data_dir,
            database_path,
        })
    }
}

/// Remote KMS when configured, otherwise a key-encryption key kept in a
/// keychain file in the data directory.
fn key_oracle(config: &IndigoConfig, data_dir: &Path) -> Result<Arc<dyn KeyOracle>> {
    if let Some(kms) = &config.kms {
        let mut oracle = HttpKeyOracle::new(kms.endpoint.clone(), config.kek_id.clone())
            .context("failed to build KMS client")?;
        if let Some(token) = &kms.token {
            oracle = oracle.with_token(token.clone());
        }
        info!(endpoint = %kms.endpoint, kek_id = %config.kek_id, "using remote key oracle");
        return Ok(Arc::new(oracle));
    }

    let key_file = FileKeychain::default_path(data_dir);
    let keychain = match &config.encryption_key {
        Some(passphrase) => FileKeychain::with_passphrase(&key_file, passphrase.clone()),
        None => FileKeychain::new(&key_file),
    };
    let oracle = LocalKeyOracle::from_keychain(config.kek_id.clone(), &keychain)
        .with_context(|| format!("failed to load key file {}", key_file.display()))?;
    info!(key_file = %key_file.display(), kek_id = %config.kek_id, "using local key oracle");
    Ok(Arc::new(oracle))
}

#[cfg(test)]
mod tests {
    use indigo_store::CredentialState;
    use indigo_vault::{CredentialKind, Scope};

    use super::*;

    fn config_in(dir: &Path) -> IndigoConfig {
        let mut config = IndigoConfig::default();
        config.data_directory = dir.join("prod");
        config.debug_directory = dir.join("debug");
        config.encryption_key = Some("test passphrase".into());
        config
    }

    #[tokio::test]
    async fn debug_and_production_data_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let debug = Services::build(&config, true).await.unwrap();
        let issued = debug
            .engine
            .issue(CredentialKind::ApiToken, Scope::new())
            .await
            .unwrap();
        assert!(debug.database_path.starts_with(dir.path().join("debug")));

        let prod = Services::build(&config, false).await.unwrap();
        assert!(prod.engine.get(&issued.id).await.is_err());
        assert!(prod.data_dir.join("kek.key").exists());
    }

    #[tokio::test]
    async fn flush_event_clears_key_cache() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::build(&config_in(dir.path()), false).await.unwrap();

        let issued = services
            .engine
            .issue(CredentialKind::ApiToken, Scope::new())
            .await
            .unwrap();
        assert!(services.keys.cached_keys() > 0);

        services.key_events.send(KeyEvent::Flush).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while services.keys.cached_keys() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Keys are fetched again on demand.
        services.engine.read(&issued.id).await.unwrap();
        assert_eq!(services.keys.cached_keys(), 1);
    }

    #[tokio::test]
    async fn local_key_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let first = Services::build(&config, false).await.unwrap();
        let issued = first
            .engine
            .issue(CredentialKind::ApiToken, Scope::new())
            .await
            .unwrap();
        let material = first.engine.read(&issued.id).await.unwrap();
        drop(first);

        let second = Services::build(&config, false).await.unwrap();
        assert_eq!(second.engine.read(&issued.id).await.unwrap(), material);
        let counts = second.engine.counts().await.unwrap();
        assert_eq!(counts.get(&CredentialState::Active), Some(&1));
    }
}
