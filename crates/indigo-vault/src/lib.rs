//! Key hierarchy, envelope encryption and credential generation for Indigo.
//!
//! Every credential payload Indigo persists is sealed with AES-256-GCM under a
//! data-encryption key, and that data key is in turn wrapped by a
//! key-encryption key held by an external oracle.  Only wrapped keys ever
//! leave process memory.
//!
//! # Modules
//!
//! - [`crypto`]: envelope engine, AES-256-GCM helpers, PBKDF2 derivation.
//! - [`keys`]: key hierarchy manager with its bounded data-key cache.
//! - [`oracle`]: key-encryption oracles (local and HTTP).
//! - [`keychain`]: file storage for the local key-encryption key.
//! - [`generator`]: credential material for every supported kind.
//! - [`error`]: unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use indigo_vault::{
//!     CredentialGenerator, CredentialKind, EnvelopeEngine, KeyHierarchy, KeyHierarchyConfig,
//!     LocalKeyOracle, Scope,
//! };
//!
//! # async fn example() -> indigo_vault::Result<()> {
//! let oracle = Arc::new(LocalKeyOracle::new("local", [0u8; 32]));
//! let keys = KeyHierarchy::new(oracle, KeyHierarchyConfig::default());
//! let engine = EnvelopeEngine::new();
//!
//! let generated = CredentialGenerator::new()
//!     .generate(CredentialKind::ApiToken, &Scope::new())
//!     .await?;
//!
//! let (wrapped, key) = keys.sealing_key().await?;
//! let envelope = engine.seal(&generated.material, &wrapped, &key, b"cred-1:api_token")?;
//!
//! let key = keys.unwrap(&envelope.data_key).await?;
//! let opened = engine.open(&envelope, &key, b"cred-1:api_token")?;
//! assert_eq!(opened, generated.material);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod generator;
pub mod keychain;
pub mod keys;
pub mod oracle;

pub use crypto::{DataKey, Envelope, EnvelopeAlgorithm, EnvelopeEngine, RawMaterial};
pub use error::{Result, VaultError};
pub use generator::{
    CredentialGenerator, CredentialKind, Generated, HttpIdentityProvider, IdentityProvider, Scope,
};
pub use keychain::{FileKeychain, KeychainProvider};
pub use keys::{KeyEvent, KeyHierarchy, KeyHierarchyConfig, WrappedDataKey};
pub use oracle::{HttpKeyOracle, KeyOracle, LocalKeyOracle};
