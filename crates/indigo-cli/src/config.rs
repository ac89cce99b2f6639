//! Runtime configuration.
//!
//! Settings come from `config/default.toml` (or the file given with
//! `--config`), then `INDIGO_*` environment variables override them.  A
//! `.env` file in the working directory is loaded into the environment first.
//!
//! | Variable | Overrides |
//! |---|---|
//! | `INDIGO_DATA_DIRECTORY` | `data_directory` |
//! | `INDIGO_DEBUG_DIRECTORY` | `debug_directory` |
//! | `INDIGO_ENCRYPTION_KEY` | passphrase protecting the local key file |
//! | `INDIGO_KMS_ENDPOINT` / `INDIGO_KMS_TOKEN` | `[kms]` |
//! | `INDIGO_IDP_ENDPOINT` / `INDIGO_IDP_TOKEN` | `[identity_provider]` |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use indigo_lifecycle::{LifecyclePolicy, ScannerConfig};
use indigo_sandbox::SandboxConfig;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Remote key-management service.
#[derive(Debug, Clone, Deserialize)]
pub struct KmsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Remote identity provider for delegated kinds.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Everything the `indigo` binary reads at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndigoConfig {
    /// Production data directory (database, local key file).
    pub data_directory: PathBuf,
    /// Data directory used with `--debug`.
    pub debug_directory: PathBuf,
    /// Id of the key-encryption key data keys are wrapped under.
    pub kek_id: String,
    /// Passphrase for the local key file.  Only read from the environment.
    #[serde(skip)]
    pub encryption_key: Option<String>,
    /// Use a remote KMS instead of the local key file.
    pub kms: Option<KmsConfig>,
    pub identity_provider: Option<IdentityProviderConfig>,
    pub scanner: ScannerConfig,
    pub sandbox: SandboxConfig,
    pub lifecycle: LifecyclePolicy,
}

impl Default for IndigoConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from(".indigo"),
            debug_directory: PathBuf::from(".indigo.debug"),
            kek_id: "indigo-local-kek".into(),
            encryption_key: None,
            kms: None,
            identity_provider: None,
            scanner: ScannerConfig::default(),
            sandbox: SandboxConfig::default(),
            lifecycle: LifecyclePolicy::default(),
        }
    }
}

impl IndigoConfig {
    /// Load the configuration.
    ///
    /// An explicit `path` must exist.  Without one, [`DEFAULT_CONFIG_PATH`]
    /// is used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config
            .lifecycle
            .validate()
            .context("invalid [lifecycle] configuration")?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `INDIGO_*` overrides, looking each variable up with `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("INDIGO_DATA_DIRECTORY") {
            self.data_directory = PathBuf::from(dir);
        }
        if let Some(dir) = var("INDIGO_DEBUG_DIRECTORY") {
            self.debug_directory = PathBuf::from(dir);
        }
        if let Some(key) = var("INDIGO_ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }

        if let Some(endpoint) = var("INDIGO_KMS_ENDPOINT") {
            let token = self.kms.take().and_then(|k| k.token);
            self.kms = Some(KmsConfig { endpoint, token });
        }
        if let (Some(kms), Some(token)) = (self.kms.as_mut(), var("INDIGO_KMS_TOKEN")) {
            kms.token = Some(token);
        }

        if let Some(endpoint) = var("INDIGO_IDP_ENDPOINT") {
            let token = self.identity_provider.take().and_then(|p| p.token);
            self.identity_provider = Some(IdentityProviderConfig { endpoint, token });
        }
        if let (Some(idp), Some(token)) =
            (self.identity_provider.as_mut(), var("INDIGO_IDP_TOKEN"))
        {
            idp.token = Some(token);
        }
    }

    /// The data directory for this run.
    pub fn data_dir(&self, debug: bool) -> &Path {
        if debug {
            &self.debug_directory
        } else {
            &self.data_directory
        }
    }
}
