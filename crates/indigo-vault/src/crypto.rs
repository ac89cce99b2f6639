//! Envelope encryption using AES-256-GCM from the `ring` crate.
//!
//! This module provides the cryptographic primitives for the vault:
//!
//! - **Envelope engine**: [`EnvelopeEngine::seal`] / [`EnvelopeEngine::open`]
//!   encrypt credential material under an unwrapped [`DataKey`] and produce a
//!   self-describing [`Envelope`] that carries the wrapped key reference, the
//!   nonce, the tag and the ciphertext.
//! - **Raw AEAD helpers**: [`encrypt`] / [`decrypt`] for callers that manage
//!   their own framing (key wrapping by the local oracle).
//! - **Key derivation**: PBKDF2-HMAC-SHA256 to derive a 256-bit key from a
//!   passphrase and a random salt.
//! - **Random generation**: cryptographically secure random bytes via `ring`.
//!
//! # Nonce discipline
//!
//! Every seal draws a fresh random 96-bit nonce.  The engine remembers every
//! nonce it has issued under each data key and refuses to seal when a draw
//! collides ([`VaultError::NonceReuse`]).  The key hierarchy retires a data
//! key long before the ~2^32 seal birthday bound is approached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Mutex;

use ring::aead::{
    self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey,
};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};
use crate::keys::WrappedDataKey;

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count (OWASP 2023 guidance).
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

/// Number of data keys whose issued nonces are remembered.  Only the newest
/// data key is ever used for sealing.
const MAX_TRACKED_KEYS: usize = 16;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Key and material types
// ---------------------------------------------------------------------------

/// A 256-bit data-encryption key.
///
/// Lives in memory only and is zeroized when dropped.  `Debug` never prints
/// the key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    /// Draw a fresh random data key from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| VaultError::Internal("failed to generate data key".into()))?;
        Ok(Self(bytes))
    }

    /// Build a data key from raw bytes (e.g. the plaintext returned by an
    /// unwrap call).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::key_unavailable(format!(
                "unwrapped key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Borrow the raw key bytes.  Only key oracles and the envelope engine
    /// should ever need this.
    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

/// Plaintext credential material.
///
/// Zeroized on drop; `Debug` prints only the length.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RawMaterial(Vec<u8>);

impl RawMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View the material as UTF-8 text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for RawMaterial {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl std::fmt::Debug for RawMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawMaterial([REDACTED; {} bytes])", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// AEAD construction used for an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum EnvelopeAlgorithm {
    Aes256Gcm,
}

/// Envelope-encrypted credential payload as persisted on a credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub alg: EnvelopeAlgorithm,
    /// The wrapped data key this payload was sealed under.
    pub data_key: WrappedDataKey,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Serde adapter storing binary fields as standard base64 strings.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Since we
/// generate a fresh random nonce per encryption call, this wrapper ensures
/// each sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

/// Remembers the nonces issued under each recently used data key.
#[derive(Default)]
struct NonceRegistry {
    issued: HashMap<String, HashSet<[u8; NONCE_LEN_BYTES]>>,
    order: VecDeque<String>,
}

impl NonceRegistry {
    /// Record `nonce` for `key_id`.  Returns `false` if it was already issued.
    fn claim(&mut self, key_id: &str, nonce: [u8; NONCE_LEN_BYTES]) -> bool {
        if !self.issued.contains_key(key_id) {
            if self.order.len() == MAX_TRACKED_KEYS {
                if let Some(oldest) = self.order.pop_front() {
                    self.issued.remove(&oldest);
                }
            }
            self.order.push_back(key_id.to_string());
        }
        self.issued
            .entry(key_id.to_string())
            .or_default()
            .insert(nonce)
    }

    fn count(&self, key_id: &str) -> usize {
        self.issued.get(key_id).map_or(0, HashSet::len)
    }
}

// ---------------------------------------------------------------------------
// Envelope engine
// ---------------------------------------------------------------------------

/// Seals and opens credential material.
///
/// The engine is the only component that touches credential ciphertext.  It
/// is `Send + Sync`; share it behind an `Arc`.
pub struct EnvelopeEngine {
    rng: SystemRandom,
    nonces: Mutex<NonceRegistry>,
}

impl EnvelopeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            nonces: Mutex::new(NonceRegistry::default()),
        }
    }

    /// Encrypt `material` under `key`, binding the result to `aad`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NonceReuse`] if the drawn nonce was already issued under
    /// this data key, [`VaultError::EncryptionFailed`] on any `ring` failure.
    pub fn seal(
        &self,
        material: &RawMaterial,
        wrapped: &WrappedDataKey,
        key: &DataKey,
        aad: &[u8],
    ) -> Result<Envelope> {
        let nonce = self.draw_nonce(&wrapped.key_id)?;

        let unbound_key = UnboundKey::new(AEAD_ALG, key.expose_secret()).map_err(|_| {
            VaultError::EncryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce));

        let mut in_out = material.as_bytes().to_vec();
        let tag = sealing_key
            .seal_in_place_separate_tag(Aad::from(aad), &mut in_out)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "seal_in_place failed".into(),
            })?;

        tracing::trace!(
            key_id = %wrapped.key_id,
            plaintext_len = material.len(),
            "sealed envelope"
        );

        Ok(Envelope {
            alg: EnvelopeAlgorithm::Aes256Gcm,
            data_key: wrapped.clone(),
            nonce: nonce.to_vec(),
            tag: tag.as_ref().to_vec(),
            ciphertext: in_out,
        })
    }

    /// Decrypt `envelope` with the unwrapped `key`, checking `aad`.
    ///
    /// # Errors
    ///
    /// [`VaultError::DecryptionFailed`] if the envelope is malformed, the key
    /// is wrong, the AAD differs, or the ciphertext/tag was tampered with.
    pub fn open(&self, envelope: &Envelope, key: &DataKey, aad: &[u8]) -> Result<RawMaterial> {
        let nonce: [u8; NONCE_LEN_BYTES] =
            envelope
                .nonce
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::DecryptionFailed {
                    reason: format!("nonce must be {NONCE_LEN_BYTES} bytes"),
                })?;
        if envelope.tag.len() != TAG_LEN {
            return Err(VaultError::DecryptionFailed {
                reason: format!("tag must be {TAG_LEN} bytes"),
            });
        }

        let unbound_key = UnboundKey::new(AEAD_ALG, key.expose_secret()).map_err(|_| {
            VaultError::DecryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut opening_key = OpeningKey::new(unbound_key, SingleNonce::new(nonce));

        let mut in_out = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(&envelope.ciphertext);
        in_out.extend_from_slice(&envelope.tag);

        let opened = opening_key.open_in_place(Aad::from(aad), &mut in_out);
        let result = match opened {
            Ok(plaintext) => Ok(RawMaterial::new(plaintext.to_vec())),
            Err(_) => Err(VaultError::DecryptionFailed {
                reason: "authentication failed: wrong key or corrupted data".into(),
            }),
        };
        in_out.zeroize();
        result
    }

    /// Number of nonces issued under `key_id` that are still remembered.
    pub fn issued_nonces(&self, key_id: &str) -> usize {
        self.nonces.lock().map(|n| n.count(key_id)).unwrap_or(0)
    }

    fn draw_nonce(&self, key_id: &str) -> Result<[u8; NONCE_LEN_BYTES]> {
        let mut nonce = [0u8; NONCE_LEN_BYTES];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "failed to generate random nonce".into(),
            })?;
        self.claim_nonce(key_id, nonce)?;
        Ok(nonce)
    }

    fn claim_nonce(&self, key_id: &str, nonce: [u8; NONCE_LEN_BYTES]) -> Result<()> {
        let mut registry = self
            .nonces
            .lock()
            .map_err(|_| VaultError::Internal("nonce registry poisoned".into()))?;
        if !registry.claim(key_id, nonce) {
            tracing::error!(key_id = %key_id, "nonce collision, refusing to seal");
            return Err(VaultError::NonceReuse {
                key_id: key_id.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for EnvelopeEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Raw AEAD helpers
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM using the given 256-bit `key`.
///
/// Returns `(nonce, ciphertext)` where `nonce` is a randomly generated 96-bit
/// value and `ciphertext` includes the 128-bit authentication tag appended by
/// `ring`.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    if key.len() != KEY_LEN {
        return Err(VaultError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;

    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    Ok((nonce_bytes, in_out))
}

/// Decrypt `ciphertext` (which includes the GCM tag) using the given `nonce`
/// and 256-bit `key`.
pub fn decrypt(nonce: &[u8; NONCE_LEN_BYTES], ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::DecryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;

    let mut opening_key = OpeningKey::new(unbound_key, SingleNonce::new(*nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from a `password` and a known `salt`.
pub fn derive_key_with_salt(password: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    pbkdf2::derive(PBKDF2_ALG, PBKDF2_ITERATIONS, salt, password, out);
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
