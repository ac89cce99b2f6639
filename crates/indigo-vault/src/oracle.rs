//! Key-management oracles.
//!
//! A [`KeyOracle`] owns a key-encryption key and exposes exactly two
//! operations: wrap a plaintext data key, and unwrap a previously wrapped
//! blob.  Two implementations ship with the vault:
//!
//! - [`LocalKeyOracle`]: KEK held in process memory, loaded from a
//!   [`KeychainProvider`] or derived from a passphrase.
//! - [`HttpKeyOracle`]: a KMS-equivalent reached over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, DataKey};
use crate::error::{Result, VaultError};
use crate::keychain::KeychainProvider;

/// External key-encryption oracle.
#[async_trait]
pub trait KeyOracle: Send + Sync {
    /// Identifier of the key-encryption key used by [`wrap`](Self::wrap).
    fn kek_id(&self) -> &str;

    /// Wrap a plaintext data key, returning an opaque blob.
    async fn wrap(&self, key: &DataKey) -> Result<Vec<u8>>;

    /// Unwrap `blob`, which was wrapped under `kek_id`.
    async fn unwrap(&self, kek_id: &str, blob: &[u8]) -> Result<DataKey>;
}

// ---------------------------------------------------------------------------
// Local oracle
// ---------------------------------------------------------------------------

/// Oracle backed by a key-encryption key held in memory.
///
/// Wrapped blobs are `nonce || AES-256-GCM(kek, data key)`.
pub struct LocalKeyOracle {
    kek_id: String,
    kek: Zeroizing<[u8; crypto::KEY_LEN]>,
}

impl LocalKeyOracle {
    pub fn new(kek_id: impl Into<String>, kek: [u8; crypto::KEY_LEN]) -> Self {
        Self {
            kek_id: kek_id.into(),
            kek: Zeroizing::new(kek),
        }
    }

    /// Load the KEK from `keychain`, creating and storing a random one on
    /// first use.
    pub fn from_keychain(kek_id: impl Into<String>, keychain: &dyn KeychainProvider) -> Result<Self> {
        let bytes = match keychain.load_kek() {
            Ok(bytes) => bytes,
            Err(VaultError::MasterKeyNotFound) => {
                let fresh = Zeroizing::new(crypto::random_bytes(crypto::KEY_LEN)?);
                keychain.store_kek(&fresh)?;
                tracing::info!("generated new local key-encryption key");
                fresh
            }
            Err(e) => return Err(e),
        };

        let kek: [u8; crypto::KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::KeyDerivationFailed {
                    reason: format!("stored KEK must be {} bytes", crypto::KEY_LEN),
                })?;
        Ok(Self::new(kek_id, kek))
    }
}

#[async_trait]
impl KeyOracle for LocalKeyOracle {
    fn kek_id(&self) -> &str {
        &self.kek_id
    }

    async fn wrap(&self, key: &DataKey) -> Result<Vec<u8>> {
        let (nonce, sealed) = crypto::encrypt(key.expose_secret(), self.kek.as_slice())?;
        let mut blob = Vec::with_capacity(nonce.len() + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    async fn unwrap(&self, kek_id: &str, blob: &[u8]) -> Result<DataKey> {
        if kek_id != self.kek_id {
            return Err(VaultError::key_unavailable(format!(
                "unknown key-encryption key {kek_id}"
            )));
        }
        if blob.len() < crypto::NONCE_LEN_BYTES + crypto::TAG_LEN {
            return Err(VaultError::key_unavailable("wrapped key blob too short"));
        }
        let (nonce_bytes, sealed) = blob.split_at(crypto::NONCE_LEN_BYTES);
        let mut nonce = [0u8; crypto::NONCE_LEN_BYTES];
        nonce.copy_from_slice(nonce_bytes);

        let plain = Zeroizing::new(
            crypto::decrypt(&nonce, sealed, self.kek.as_slice())
                .map_err(|_| VaultError::key_unavailable("unwrap denied"))?,
        );
        DataKey::from_slice(&plain)
    }
}

// ---------------------------------------------------------------------------
// HTTP oracle
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WrapRequest<'a> {
    key_id: &'a str,
    plaintext: &'a str,
}

#[derive(Deserialize)]
struct WrapResponse {
    ciphertext_blob: String,
}

#[derive(Serialize)]
struct UnwrapRequest<'a> {
    key_id: &'a str,
    ciphertext_blob: &'a str,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    plaintext: String,
}

/// Oracle that delegates wrap/unwrap to a KMS-compatible HTTP service.
///
/// Endpoints: `POST {endpoint}/wrap` and `POST {endpoint}/unwrap`, JSON
/// bodies with base64-encoded key material.
pub struct HttpKeyOracle {
    client: reqwest::Client,
    endpoint: String,
    kek_id: String,
    token: Option<Zeroizing<String>>,
}

impl HttpKeyOracle {
    pub fn new(endpoint: impl Into<String>, kek_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VaultError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            kek_id: kek_id.into(),
            token: None,
        })
    }

    /// Authenticate requests with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Zeroizing::new(token.into()));
        self
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{path}", self.endpoint);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| VaultError::key_unavailable(format!("{path} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, path, "key oracle refused request");
            return Err(VaultError::key_unavailable(format!(
                "{path} returned {status}: {text}"
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| VaultError::key_unavailable(format!("malformed {path} response: {e}")))
    }
}

#[async_trait]
impl KeyOracle for HttpKeyOracle {
    fn kek_id(&self) -> &str {
        &self.kek_id
    }

    async fn wrap(&self, key: &DataKey) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(STANDARD.encode(key.expose_secret()));
        let response: WrapResponse = self
            .post(
                "wrap",
                &WrapRequest {
                    key_id: &self.kek_id,
                    plaintext: &plaintext,
                },
            )
            .await?;
        STANDARD
            .decode(response.ciphertext_blob)
            .map_err(|e| VaultError::key_unavailable(format!("wrap blob is not base64: {e}")))
    }

    async fn unwrap(&self, kek_id: &str, blob: &[u8]) -> Result<DataKey> {
        let encoded = STANDARD.encode(blob);
        let response: UnwrapResponse = self
            .post(
                "unwrap",
                &UnwrapRequest {
                    key_id: kek_id,
                    ciphertext_blob: &encoded,
                },
            )
            .await?;
        let encoded_plain = Zeroizing::new(response.plaintext);
        let plain = Zeroizing::new(STANDARD.decode(encoded_plain.as_bytes()).map_err(|e| {
            VaultError::key_unavailable(format!("unwrapped key is not base64: {e}"))
        })?);
        DataKey::from_slice(&plain)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
