//! On-disk storage for the local key-encryption key.
//!
//! When no external key-management service is configured, Indigo wraps data
//! keys with a locally held key-encryption key (KEK).  That KEK must never be
//! stored as plaintext on disk.  [`KeychainProvider`] abstracts the backend;
//! [`FileKeychain`] is the file-based implementation.
//!
//! The key file is protected either by a passphrase (`INDIGO_ENCRYPTION_KEY`)
//! stretched with PBKDF2, or, when no passphrase is configured, by a
//! device-derived key (hostname + user + application salt).  The device mode
//! is a convenience for development: anyone with access to the same account
//! can reconstruct it.
//!
//! The file is written with mode 0600 on Unix.

use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over secure storage for the local key-encryption key.
pub trait KeychainProvider: Send + Sync {
    /// Retrieve the key-encryption key.
    ///
    /// Returns [`VaultError::MasterKeyNotFound`] if no key has been stored yet.
    fn load_kek(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Store (or overwrite) the key-encryption key.
    fn store_kek(&self, key: &[u8]) -> Result<()>;

    /// Check whether a key-encryption key has been stored.
    fn has_kek(&self) -> Result<bool>;

    /// Delete the stored key (e.g. when the operator resets the vault).
    fn delete_kek(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-based keychain
// ---------------------------------------------------------------------------

/// Application salt mixed into the device-derived key. Changing this
/// invalidates all previously stored keys. Must be exactly
/// [`crypto::SALT_LEN`] (32) bytes.
const APP_SALT: &[u8; crypto::SALT_LEN] = b"indigo-vault-keychain-v1\x00\x00\x00\x00\x00\x00\x00\x00";

/// How the key file itself is protected.
#[derive(Clone)]
pub enum Unlock {
    /// Key derived from machine identifiers.
    Device,
    /// Key derived from an operator-supplied passphrase.
    Passphrase(Zeroizing<String>),
}

impl std::fmt::Debug for Unlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => f.write_str("Device"),
            Self::Passphrase(_) => f.write_str("Passphrase([REDACTED])"),
        }
    }
}

/// File-based keychain.
///
/// The key file layout (binary):
/// ```text
/// [32 bytes: PBKDF2 salt]
/// [12 bytes: AES-256-GCM nonce]
/// [remaining: AES-256-GCM ciphertext + 16-byte tag]
/// ```
pub struct FileKeychain {
    key_file: PathBuf,
    unlock: Unlock,
}

impl FileKeychain {
    /// Keychain at `key_file` protected by the device-derived key.
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            unlock: Unlock::Device,
        }
    }

    /// Keychain at `key_file` protected by `passphrase`.
    pub fn with_passphrase(key_file: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            key_file: key_file.into(),
            unlock: Unlock::Passphrase(Zeroizing::new(passphrase.into())),
        }
    }

    /// Default key file location: `<data_dir>/kek.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("kek.key")
    }

    /// Derive the file-protection key for the given salt.
    fn protection_key(&self, salt: &[u8]) -> Zeroizing<[u8; crypto::KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; crypto::KEY_LEN]);
        match &self.unlock {
            Unlock::Passphrase(passphrase) => {
                crypto::derive_key_with_salt(passphrase.as_bytes(), salt, &mut key);
            }
            Unlock::Device => {
                let hostname = Self::get_hostname();
                let username = std::env::var("USER")
                    .or_else(|_| std::env::var("USERNAME"))
                    .unwrap_or_else(|_| "unknown-user".into());

                let mut material = Zeroizing::new(Vec::with_capacity(
                    hostname.len() + username.len() + APP_SALT.len(),
                ));
                material.extend_from_slice(hostname.as_bytes());
                material.extend_from_slice(username.as_bytes());
                material.extend_from_slice(APP_SALT);
                crypto::derive_key_with_salt(&material, salt, &mut key);
            }
        }
        key
    }

    fn fresh_salt(&self) -> Result<Vec<u8>> {
        match self.unlock {
            Unlock::Device => Ok(APP_SALT.to_vec()),
            Unlock::Passphrase(_) => crypto::random_bytes(crypto::SALT_LEN),
        }
    }

    fn get_hostname() -> String {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .or_else(|_| std::env::var("HOSTNAME"))
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown-host".into())
        }

        #[cfg(not(unix))]
        {
            std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into())
        }
    }
}

impl KeychainProvider for FileKeychain {
    fn load_kek(&self) -> Result<Zeroizing<Vec<u8>>> {
        if !self.key_file.exists() {
            return Err(VaultError::MasterKeyNotFound);
        }

        let data = std::fs::read(&self.key_file)?;

        if data.len() < crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + crypto::TAG_LEN {
            return Err(VaultError::DecryptionFailed {
                reason: "key file is too small / corrupted".into(),
            });
        }

        let (salt, rest) = data.split_at(crypto::SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(crypto::NONCE_LEN_BYTES);

        let mut nonce = [0u8; crypto::NONCE_LEN_BYTES];
        nonce.copy_from_slice(nonce_bytes);

        let protection = self.protection_key(salt);
        let kek = crypto::decrypt(&nonce, ciphertext, protection.as_slice())?;

        tracing::debug!(path = %self.key_file.display(), "loaded key-encryption key from file keychain");
        Ok(Zeroizing::new(kek))
    }

    fn store_kek(&self, key: &[u8]) -> Result<()> {
        let salt = self.fresh_salt()?;
        let protection = self.protection_key(&salt);

        let (nonce, ciphertext) = crypto::encrypt(key, protection.as_slice())
            .map_err(|e| VaultError::MasterKeyStoreFailed {
                reason: e.to_string(),
            })?;

        let mut data =
            Vec::with_capacity(crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + ciphertext.len());
        data.extend_from_slice(&salt);
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&ciphertext);

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.key_file, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.key_file, perms)?;
        }

        tracing::info!(path = %self.key_file.display(), "stored key-encryption key in file keychain");
        Ok(())
    }

    fn has_kek(&self) -> Result<bool> {
        Ok(self.key_file.exists())
    }

    fn delete_kek(&self) -> Result<()> {
        if self.key_file.exists() {
            std::fs::remove_file(&self.key_file)?;
            tracing::info!(path = %self.key_file.display(), "deleted key-encryption key from file keychain");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
