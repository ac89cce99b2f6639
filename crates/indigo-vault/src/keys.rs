//! Key hierarchy manager.
//!
//! Credential payloads are sealed under a local data-encryption key (DEK).
//! The DEK itself is only ever persisted in wrapped form, wrapped by a
//! key-encryption key held by a [`KeyOracle`].  [`KeyHierarchy`] hands out
//! the current sealing key and unwraps stored keys on demand, keeping the
//! most recently used plaintext keys in a small in-memory cache with a
//! bounded lifetime.
//!
//! The cache is guarded by a plain mutex that is never held across an
//! `.await`; oracle calls happen outside the lock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crypto::DataKey;
use crate::error::{Result, VaultError};
use crate::oracle::KeyOracle;

/// A data key wrapped by a key-encryption key, as stored next to every
/// envelope that was sealed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDataKey {
    /// Identifier of the data key (UUID v7).
    pub key_id: String,
    /// Identifier of the key-encryption key that wrapped it.
    pub kek_id: String,
    /// Oracle-specific wrapped key blob.
    #[serde(with = "crate::crypto::b64")]
    pub blob: Vec<u8>,
}

/// Process-wide key events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    /// The key-encryption key was rotated; cached plaintext keys must go.
    KekRotated { kek_id: String },
    /// Drop cached keys without a rotation (e.g. operator request).
    Flush,
}

/// Tunables for [`KeyHierarchy`].
#[derive(Debug, Clone)]
pub struct KeyHierarchyConfig {
    /// How long an unwrapped key may stay cached.
    ///
    /// Default: **15 minutes**.
    pub cache_ttl: Duration,

    /// Number of seals after which a fresh sealing key is drawn.
    ///
    /// Default: **100 000**.
    pub max_seals_per_key: u64,
}

impl Default for KeyHierarchyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15 * 60),
            max_seals_per_key: 100_000,
        }
    }
}

struct CachedKey {
    wrapped: WrappedDataKey,
    key: DataKey,
    loaded_at: Instant,
    seals: u64,
}

impl CachedKey {
    fn new(wrapped: WrappedDataKey, key: DataKey) -> Self {
        Self {
            wrapped,
            key,
            loaded_at: Instant::now(),
            seals: 0,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }
}

#[derive(Default)]
struct Slots {
    /// Key new envelopes are sealed under.
    sealing: Option<CachedKey>,
    /// Last key obtained through an unwrap call.
    last_unwrapped: Option<CachedKey>,
}

/// Holds the key hierarchy for one process.
pub struct KeyHierarchy {
    oracle: Arc<dyn KeyOracle>,
    config: KeyHierarchyConfig,
    slots: Mutex<Slots>,
}

impl KeyHierarchy {
    pub fn new(oracle: Arc<dyn KeyOracle>, config: KeyHierarchyConfig) -> Self {
        Self {
            oracle,
            config,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Identifier of the key-encryption key new data keys are wrapped under.
    pub fn kek_id(&self) -> &str {
        self.oracle.kek_id()
    }

    /// Wrap `key` through the oracle.
    ///
    /// # Errors
    ///
    /// [`VaultError::KeyUnavailable`] if the oracle cannot be reached or
    /// refuses the call.
    pub async fn wrap(&self, key: &DataKey) -> Result<WrappedDataKey> {
        let blob = self.oracle.wrap(key).await.map_err(into_unavailable)?;
        Ok(WrappedDataKey {
            key_id: Uuid::now_v7().to_string(),
            kek_id: self.oracle.kek_id().to_string(),
            blob,
        })
    }

    /// Resolve a wrapped key to its plaintext, using the cache when possible.
    ///
    /// # Errors
    ///
    /// [`VaultError::KeyUnavailable`] on a cache miss when the oracle cannot
    /// unwrap.
    pub async fn unwrap(&self, wrapped: &WrappedDataKey) -> Result<DataKey> {
        {
            let slots = self.lock()?;
            let ttl = self.config.cache_ttl;
            let hit = [slots.sealing.as_ref(), slots.last_unwrapped.as_ref()]
                .into_iter()
                .flatten()
                .find(|c| c.wrapped.key_id == wrapped.key_id && c.is_fresh(ttl));
            if let Some(cached) = hit {
                tracing::trace!(key_id = %wrapped.key_id, "data key cache hit");
                return Ok(cached.key.clone());
            }
        }

        tracing::debug!(
            key_id = %wrapped.key_id,
            kek_id = %wrapped.kek_id,
            "data key cache miss, calling key oracle"
        );
        let key = self
            .oracle
            .unwrap(&wrapped.kek_id, &wrapped.blob)
            .await
            .map_err(into_unavailable)?;

        self.lock()?.last_unwrapped = Some(CachedKey::new(wrapped.clone(), key.clone()));
        Ok(key)
    }

    /// Return the key to seal one new envelope with.
    ///
    /// Each call reserves one seal against the key's budget.  A new data key
    /// is drawn and wrapped when none is cached, the cached one is stale, or
    /// its budget is spent.
    pub async fn sealing_key(&self) -> Result<(WrappedDataKey, DataKey)> {
        {
            let mut slots = self.lock()?;
            let ttl = self.config.cache_ttl;
            let max = self.config.max_seals_per_key;
            if let Some(current) = slots.sealing.as_mut() {
                if current.is_fresh(ttl) && current.seals < max {
                    current.seals += 1;
                    return Ok((current.wrapped.clone(), current.key.clone()));
                }
            }
        }

        let key = DataKey::generate()?;
        let wrapped = self.wrap(&key).await?;
        tracing::info!(
            key_id = %wrapped.key_id,
            kek_id = %wrapped.kek_id,
            "issued new data key"
        );

        let mut cached = CachedKey::new(wrapped.clone(), key.clone());
        cached.seals = 1;
        self.lock()?.sealing = Some(cached);
        Ok((wrapped, key))
    }

    /// Drop every cached plaintext key.
    pub fn invalidate(&self) {
        match self.slots.lock() {
            Ok(mut slots) => *slots = Slots::default(),
            Err(poisoned) => *poisoned.into_inner() = Slots::default(),
        }
        tracing::info!("data key cache cleared");
    }

    /// Number of plaintext keys currently cached.
    pub fn cached_keys(&self) -> usize {
        let count = |slots: &Slots| {
            usize::from(slots.sealing.is_some()) + usize::from(slots.last_unwrapped.is_some())
        };
        match self.slots.lock() {
            Ok(slots) => count(&slots),
            Err(poisoned) => count(&poisoned.into_inner()),
        }
    }

    /// Spawn a task that clears the cache whenever a [`KeyEvent`] arrives.
    pub fn listen(self: Arc<Self>, mut rx: broadcast::Receiver<KeyEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(KeyEvent::KekRotated { kek_id }) => {
                        tracing::info!(kek_id = %kek_id, "key-encryption key rotated");
                        self.invalidate();
                    }
                    Ok(KeyEvent::Flush) => self.invalidate(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "key event listener lagged, clearing cache");
                        self.invalidate();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| VaultError::Internal("key cache mutex poisoned".into()))
    }
}

fn into_unavailable(err: VaultError) -> VaultError {
    match err {
        VaultError::KeyUnavailable { .. } => err,
        other => VaultError::key_unavailable(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::oracle::LocalKeyOracle;

    /// Local oracle wrapper that counts calls and can be switched off.
    struct CountingOracle {
        inner: LocalKeyOracle,
        wraps: AtomicUsize,
        unwraps: AtomicUsize,
        down: AtomicBool,
    }

    impl CountingOracle {
        fn new() -> Self {
            Self {
                inner: LocalKeyOracle::new("test-kek", [3u8; 32]),
                wraps: AtomicUsize::new(0),
                unwraps: AtomicUsize::new(0),
                down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KeyOracle for CountingOracle {
        fn kek_id(&self) -> &str {
            self.inner.kek_id()
        }

        async fn wrap(&self, key: &DataKey) -> Result<Vec<u8>> {
            self.wraps.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(VaultError::key_unavailable("oracle offline"));
            }
            self.inner.wrap(key).await
        }

        async fn unwrap(&self, kek_id: &str, blob: &[u8]) -> Result<DataKey> {
            self.unwraps.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(VaultError::key_unavailable("oracle offline"));
            }
            self.inner.unwrap(kek_id, blob).await
        }
    }

    #[tokio::test]
    async fn sealing_key_is_reused_within_budget() {
        let oracle = Arc::new(CountingOracle::new());
        let keys = KeyHierarchy::new(oracle.clone(), KeyHierarchyConfig::default());

        let (w1, _) = keys.sealing_key().await.unwrap();
        let (w2, _) = keys.sealing_key().await.unwrap();
        assert_eq!(w1.key_id, w2.key_id);
        assert_eq!(oracle.wraps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sealing_key_rotates_after_budget() {
        let oracle = Arc::new(CountingOracle::new());
        let config = KeyHierarchyConfig {
            max_seals_per_key: 2,
            ..Default::default()
        };
        let keys = KeyHierarchy::new(oracle.clone(), config);

        let (w1, _) = keys.sealing_key().await.unwrap();
        let (w2, _) = keys.sealing_key().await.unwrap();
        let (w3, _) = keys.sealing_key().await.unwrap();
        assert_eq!(w1.key_id, w2.key_id);
        assert_ne!(w2.key_id, w3.key_id);
        assert_eq!(oracle.wraps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unwrap_hits_cache_until_invalidated() {
        let oracle = Arc::new(CountingOracle::new());
        let keys = KeyHierarchy::new(oracle.clone(), KeyHierarchyConfig::default());

        let key = DataKey::generate().unwrap();
        let wrapped = keys.wrap(&key).await.unwrap();

        let a = keys.unwrap(&wrapped).await.unwrap();
        let b = keys.unwrap(&wrapped).await.unwrap();
        assert_eq!(a.expose_secret(), key.expose_secret());
        assert_eq!(b.expose_secret(), key.expose_secret());
        assert_eq!(oracle.unwraps.load(Ordering::SeqCst), 1);

        keys.invalidate();
        keys.unwrap(&wrapped).await.unwrap();
        assert_eq!(oracle.unwraps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oracle_outage_surfaces_key_unavailable() {
        let oracle = Arc::new(CountingOracle::new());
        let keys = KeyHierarchy::new(oracle.clone(), KeyHierarchyConfig::default());
        let key = DataKey::generate().unwrap();
        let wrapped = keys.wrap(&key).await.unwrap();

        oracle.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            keys.unwrap(&wrapped).await,
            Err(VaultError::KeyUnavailable { .. })
        ));
        assert!(matches!(
            keys.sealing_key().await,
            Err(VaultError::KeyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn expired_cache_entries_are_refetched() {
        let oracle = Arc::new(CountingOracle::new());
        let config = KeyHierarchyConfig {
            cache_ttl: Duration::ZERO,
            ..Default::default()
        };
        let keys = KeyHierarchy::new(oracle.clone(), config);
        let wrapped = keys.wrap(&DataKey::generate().unwrap()).await.unwrap();

        keys.unwrap(&wrapped).await.unwrap();
        keys.unwrap(&wrapped).await.unwrap();
        assert_eq!(oracle.unwraps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rotation_event_clears_cache() {
        let oracle = Arc::new(CountingOracle::new());
        let keys = Arc::new(KeyHierarchy::new(
            oracle.clone(),
            KeyHierarchyConfig::default(),
        ));
        let (tx, rx) = broadcast::channel(4);
        let handle = Arc::clone(&keys).listen(rx);

        let wrapped = keys.wrap(&DataKey::generate().unwrap()).await.unwrap();
        keys.unwrap(&wrapped).await.unwrap();
        assert_eq!(keys.cached_keys(), 1);

        tx.send(KeyEvent::KekRotated {
            kek_id: "test-kek".into(),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(keys.cached_keys(), 0);

        keys.unwrap(&wrapped).await.unwrap();
        assert_eq!(oracle.unwraps.load(Ordering::SeqCst), 2);
    }
}
