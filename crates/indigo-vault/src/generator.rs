//! Credential generation.
//!
//! [`CredentialGenerator`] turns a `(kind, scope)` request into raw
//! credential material.  Local kinds are drawn from the system CSPRNG;
//! delegated kinds are requested from an [`IdentityProvider`].  Generation
//! never retries: a provider failure surfaces as
//! [`VaultError::UpstreamGeneration`] and the lifecycle engine decides what
//! to do with it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::RawMaterial;
use crate::error::{Result, VaultError};

/// Default length of generated database passwords.
pub const DEFAULT_PASSWORD_LEN: usize = 32;

/// Accepted range for a `length` scope override.
pub const PASSWORD_LEN_RANGE: std::ops::RangeInclusive<usize> = 16..=128;

/// Prefix carried by every API token.
pub const API_TOKEN_PREFIX: &str = "idg_";

const API_TOKEN_BYTES: usize = 32;

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#%+-.:=@^_~";

// ---------------------------------------------------------------------------
// Kind and scope
// ---------------------------------------------------------------------------

/// Supported credential categories.  The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    DatabasePassword,
    ApiToken,
    TlsKeypair,
    /// Issued by the identity provider rather than generated locally.
    CloudAccessKey,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 4] = [
        Self::DatabasePassword,
        Self::ApiToken,
        Self::TlsKeypair,
        Self::CloudAccessKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabasePassword => "database_password",
            Self::ApiToken => "api_token",
            Self::TlsKeypair => "tls_keypair",
            Self::CloudAccessKey => "cloud_access_key",
        }
    }

    /// Whether material for this kind comes from the identity provider.
    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::CloudAccessKey)
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.as_str().replace('_', "-") == s)
            .ok_or_else(|| VaultError::InvalidScope {
                reason: format!("unknown credential kind: {s}"),
            })
    }
}

/// What a credential grants access to: an ordered mapping of string keys to
/// JSON values, e.g. `{"database": "orders", "role": "readonly"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(BTreeMap<String, serde_json::Value>);

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Scope {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// Freshly generated material plus, for delegated kinds, the provider's own
/// expiry.
#[derive(Debug)]
pub struct Generated {
    pub material: RawMaterial,
    pub upstream_expires_at: Option<DateTime<Utc>>,
}

impl Generated {
    fn local(material: RawMaterial) -> Self {
        Self {
            material,
            upstream_expires_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

/// External issuer for delegated credential kinds.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn issue(&self, kind: CredentialKind, scope: &Scope) -> Result<Generated>;
}

#[derive(Serialize)]
struct IssueRequest<'a> {
    kind: CredentialKind,
    scope: &'a Scope,
}

#[derive(Deserialize)]
struct IssueResponse {
    material: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Identity provider reached over HTTP: `POST {endpoint}/credentials`.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    endpoint: String,
    token: Option<Zeroizing<String>>,
}

impl HttpIdentityProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VaultError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Zeroizing::new(token.into()));
        self
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn issue(&self, kind: CredentialKind, scope: &Scope) -> Result<Generated> {
        let upstream = |reason: String| VaultError::UpstreamGeneration {
            kind: kind.to_string(),
            reason,
        };

        let url = format!("{}/credentials", self.endpoint);
        let mut request = self.client.post(&url).json(&IssueRequest { kind, scope });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| upstream(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream(format!("provider returned {status}: {body}")));
        }

        let issued: IssueResponse = response
            .json()
            .await
            .map_err(|e| upstream(format!("malformed provider response: {e}")))?;

        tracing::debug!(kind = %kind, upstream_expires_at = ?issued.expires_at, "identity provider issued material");
        Ok(Generated {
            material: RawMaterial::from(issued.material),
            upstream_expires_at: issued.expires_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Produces credential material for every [`CredentialKind`].
pub struct CredentialGenerator {
    rng: SystemRandom,
    provider: Option<Arc<dyn IdentityProvider>>,
}

impl CredentialGenerator {
    /// Generator for local kinds only.  Delegated kinds fail until a provider
    /// is attached.
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            provider: None,
        }
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Generate material for `kind` under `scope`.
    pub async fn generate(&self, kind: CredentialKind, scope: &Scope) -> Result<Generated> {
        match kind {
            CredentialKind::DatabasePassword => {
                let len = password_length(scope)?;
                self.password(len).map(Generated::local)
            }
            CredentialKind::ApiToken => self.api_token().map(Generated::local),
            CredentialKind::TlsKeypair => self.ed25519_keypair().map(Generated::local),
            CredentialKind::CloudAccessKey => {
                let provider =
                    self.provider
                        .as_ref()
                        .ok_or_else(|| VaultError::UpstreamGeneration {
                            kind: kind.to_string(),
                            reason: "no identity provider configured".into(),
                        })?;
                provider.issue(kind, scope).await
            }
        }
    }

    /// Uniformly distributed password over [`PASSWORD_CHARSET`].
    fn password(&self, len: usize) -> Result<RawMaterial> {
        // Largest multiple of the charset size that fits in a byte; anything
        // above it is rejected so every character is equally likely.
        let limit = 256 - (256 % PASSWORD_CHARSET.len());
        let mut out = Vec::with_capacity(len);
        let mut buf = Zeroizing::new([0u8; 64]);

        while out.len() < len {
            self.fill(buf.as_mut())?;
            for &b in buf.iter() {
                if (b as usize) < limit {
                    out.push(PASSWORD_CHARSET[b as usize % PASSWORD_CHARSET.len()]);
                    if out.len() == len {
                        break;
                    }
                }
            }
        }
        Ok(RawMaterial::new(out))
    }

    fn api_token(&self) -> Result<RawMaterial> {
        let mut bytes = Zeroizing::new([0u8; API_TOKEN_BYTES]);
        self.fill(bytes.as_mut())?;
        Ok(RawMaterial::from(format!(
            "{API_TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(bytes.as_ref())
        )))
    }

    /// Ed25519 key pair as a PEM bundle: PKCS#8 private key followed by the
    /// SubjectPublicKeyInfo public key.
    fn ed25519_keypair(&self) -> Result<RawMaterial> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&self.rng)
            .map_err(|_| VaultError::Internal("failed to generate ed25519 key pair".into()))?;
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| VaultError::Internal("generated pkcs8 document rejected".into()))?;

        // id-Ed25519 SubjectPublicKeyInfo header (RFC 8410).
        const SPKI_PREFIX: [u8; 12] = [
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        let mut spki = SPKI_PREFIX.to_vec();
        spki.extend_from_slice(pair.public_key().as_ref());

        let mut pem = pem_block("PRIVATE KEY", pkcs8.as_ref());
        pem.push_str(&pem_block("PUBLIC KEY", &spki));
        Ok(RawMaterial::from(pem))
    }

    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))
    }
}

impl Default for CredentialGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn password_length(scope: &Scope) -> Result<usize> {
    let Some(value) = scope.get("length") else {
        return Ok(DEFAULT_PASSWORD_LEN);
    };
    let len = value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| PASSWORD_LEN_RANGE.contains(n))
        .ok_or_else(|| VaultError::InvalidScope {
            reason: format!(
                "length must be an integer in {}..={}, got {value}",
                PASSWORD_LEN_RANGE.start(),
                PASSWORD_LEN_RANGE.end()
            ),
        })?;
    Ok(len)
}

fn pem_block(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
