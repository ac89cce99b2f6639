//! Per-kind schedules and the rotation retry budget.
//!
//! A [`KindPolicy`] turns an issue time into the `(issued_at, rotate_at,
//! expires_at)` triple stored on the record; [`RetryPolicy`] decides how long a
//! failed rotation waits before the next attempt and when to give up.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use indigo_sandbox::HookSpec;
use indigo_store::to_store_precision;
use indigo_vault::CredentialKind;

use crate::error::{LifecycleError, Result};

/// The timestamps a credential lives by.  Always `issued_at < rotate_at <=
/// expires_at`, whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub issued_at: DateTime<Utc>,
    pub rotate_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Kind policy
// ---------------------------------------------------------------------------

/// Longest lifetime a policy may configure: ten years.
pub const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

/// Lifetime and validation hook for one credential kind.
#[derive(Debug, Clone, Deserialize)]
pub struct KindPolicy {
    /// Seconds from issue to expiry.
    pub ttl_secs: u64,

    /// Seconds from issue to the start of rotation.  Defaults to three
    /// quarters of the TTL.
    #[serde(default)]
    pub rotate_after_secs: Option<u64>,

    /// Run against every newly generated secret before it is committed.  A
    /// non-zero exit rejects the material.
    #[serde(default)]
    pub hook: Option<HookSpec>,
}

impl KindPolicy {
    pub fn new(ttl: Duration, rotate_after: Duration) -> Self {
        Self {
            ttl_secs: ttl.num_seconds().max(0) as u64,
            rotate_after_secs: Some(rotate_after.num_seconds().max(0) as u64),
            hook: None,
        }
    }

    fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            rotate_after_secs: None,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: HookSpec) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.min(MAX_LIFETIME_SECS) as i64)
    }

    pub fn rotate_after(&self) -> Duration {
        let secs = self
            .rotate_after_secs
            .unwrap_or(self.ttl_secs.saturating_mul(3) / 4)
            .clamp(1, MAX_LIFETIME_SECS);
        Duration::seconds(secs as i64)
    }

    /// Reject lifetimes that cannot satisfy `issued < rotate <= expires` or
    /// exceed [`MAX_LIFETIME_SECS`].
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(LifecycleError::InvalidPolicy {
                reason: "ttl_secs must be positive".into(),
            });
        }
        let longest = self.ttl_secs.max(self.rotate_after_secs.unwrap_or(0));
        if longest > MAX_LIFETIME_SECS {
            return Err(LifecycleError::InvalidPolicy {
                reason: format!("lifetime of {longest}s exceeds the {MAX_LIFETIME_SECS}s maximum"),
            });
        }
        if self.rotate_after() > self.ttl() {
            return Err(LifecycleError::InvalidPolicy {
                reason: format!(
                    "rotate_after_secs ({}) exceeds ttl_secs ({})",
                    self.rotate_after().num_seconds(),
                    self.ttl_secs
                ),
            });
        }
        Ok(())
    }

    /// Schedule for material issued at `issued_at`.
    ///
    /// When the provider reports its own expiry and it falls before the
    /// local one, the credential expires with the provider and its rotation
    /// point moves forward in proportion.
    pub fn schedule(
        &self,
        kind: CredentialKind,
        issued_at: DateTime<Utc>,
        upstream_expires_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        self.validate()?;
        let issued_at = to_store_precision(issued_at);
        let mut rotate_at = issued_at + self.rotate_after();
        let mut expires_at = issued_at + self.ttl();

        if let Some(upstream) = upstream_expires_at.map(to_store_precision) {
            if upstream <= issued_at + Duration::seconds(1) {
                return Err(LifecycleError::UpstreamGeneration {
                    kind: kind.to_string(),
                    reason: format!("provider material expires at {upstream}, already past"),
                });
            }
            if upstream < expires_at {
                let window = (upstream - issued_at).num_seconds();
                let lead = window * self.rotate_after().num_seconds() / self.ttl().num_seconds();
                expires_at = upstream;
                rotate_at = issued_at + Duration::seconds(lead.clamp(1, window));
            }
        }

        Ok(Schedule {
            issued_at,
            rotate_at,
            expires_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for failed rotations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the credential is revoked.
    ///
    /// Default: **5**.
    pub max_attempts: u32,

    /// Delay after the first failure, doubled for each one after.
    ///
    /// Default: **30 s**.
    pub base_delay_secs: u64,

    /// Ceiling on the un-jittered delay.
    ///
    /// Default: **1 h**.
    pub max_delay_secs: u64,

    /// Up to this fraction of the delay is added at random.
    ///
    /// Default: **0.2**.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 3600,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let base_ms = self.base_delay_secs.saturating_mul(1000);
        let delay_ms = base_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_secs.saturating_mul(1000));
        let jitter_ms = (delay_ms as f64 * self.jitter.clamp(0.0, 1.0) * fastrand::f64()) as u64;
        Duration::milliseconds(delay_ms.saturating_add(jitter_ms).min(i64::MAX as u64) as i64)
    }

    /// Whether `attempts` failures use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle policy
// ---------------------------------------------------------------------------

/// Kind policies, one per member of the closed [`CredentialKind`] set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KindPolicies {
    pub database_password: KindPolicy,
    pub api_token: KindPolicy,
    pub tls_keypair: KindPolicy,
    pub cloud_access_key: KindPolicy,
}

impl Default for KindPolicies {
    fn default() -> Self {
        const HOUR: u64 = 3600;
        const DAY: u64 = 24 * HOUR;
        Self {
            database_password: KindPolicy::with_ttl_secs(DAY),
            api_token: KindPolicy::with_ttl_secs(30 * DAY),
            tls_keypair: KindPolicy::with_ttl_secs(90 * DAY),
            cloud_access_key: KindPolicy::with_ttl_secs(HOUR),
        }
    }
}

/// Everything the engine needs to decide when and how often to act.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecyclePolicy {
    pub kinds: KindPolicies,
    pub retry: RetryPolicy,

    /// Compare-and-swap attempts per transition before giving up with
    /// [`LifecycleError::TransitionConflict`].
    ///
    /// Default: **5**.
    pub transition_retries: u32,

    /// A rotation that has not failed yet and began less than this many
    /// seconds ago belongs to the worker that began it; other workers leave
    /// it alone.  After that it is considered abandoned and taken over.
    ///
    /// Default: **300**.
    pub rotation_lease_secs: u64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            kinds: KindPolicies::default(),
            retry: RetryPolicy::default(),
            transition_retries: 5,
            rotation_lease_secs: 300,
        }
    }
}

impl LifecyclePolicy {
    pub fn for_kind(&self, kind: CredentialKind) -> &KindPolicy {
        match kind {
            CredentialKind::DatabasePassword => &self.kinds.database_password,
            CredentialKind::ApiToken => &self.kinds.api_token,
            CredentialKind::TlsKeypair => &self.kinds.tls_keypair,
            CredentialKind::CloudAccessKey => &self.kinds.cloud_access_key,
        }
    }

    pub fn with_kind(mut self, kind: CredentialKind, policy: KindPolicy) -> Self {
        let slot = match kind {
            CredentialKind::DatabasePassword => &mut self.kinds.database_password,
            CredentialKind::ApiToken => &mut self.kinds.api_token,
            CredentialKind::TlsKeypair => &mut self.kinds.tls_keypair,
            CredentialKind::CloudAccessKey => &mut self.kinds.cloud_access_key,
        };
        *slot = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transition_retries(mut self, retries: u32) -> Self {
        self.transition_retries = retries;
        self
    }

    pub fn with_rotation_lease_secs(mut self, secs: u64) -> Self {
        self.rotation_lease_secs = secs;
        self
    }

    pub fn rotation_lease(&self) -> Duration {
        Duration::seconds(self.rotation_lease_secs.min(MAX_LIFETIME_SECS) as i64)
    }

    /// Check every kind policy.
    pub fn validate(&self) -> Result<()> {
        for kind in CredentialKind::ALL {
            self.for_kind(kind).validate().map_err(|e| match e {
                LifecycleError::InvalidPolicy { reason } => LifecycleError::InvalidPolicy {
                    reason: format!("{kind}: {reason}"),
                },
                other => other,
            })?;
        }
        Ok(())
    }
}
