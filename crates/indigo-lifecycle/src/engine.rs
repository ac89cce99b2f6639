//! The credential lifecycle engine.
//!
//! [`LifecycleEngine`] ties the vault, the store and the sandbox together and
//! exposes the operations callers use: [`issue`](LifecycleEngine::issue),
//! [`read`](LifecycleEngine::read), [`revoke`](LifecycleEngine::revoke),
//! [`rotate_now`](LifecycleEngine::rotate_now) and the scanner's
//! [`process`](LifecycleEngine::process).
//!
//! # Writes
//!
//! Every state change is read → [`machine::apply`] → `compare_and_swap`.  A
//! lost swap re-reads the record and decides again, up to
//! [`LifecyclePolicy::transition_retries`] times, after which the caller gets
//! [`LifecycleError::TransitionConflict`].  No lock is held across any of it.
//!
//! # Rotation
//!
//! Rotation is additive-then-swap.  The record is first marked Rotating
//! (still holding, and serving, the old ciphertext).  New material is then
//! generated, validated by the kind's hook and sealed entirely in memory, and
//! only the final swap replaces the old ciphertext.  A failure at any point
//! before that swap leaves the old material in place.
//!
//! The sealing key is obtained before the record is touched, so a
//! key-management outage defers the rotation with the record exactly as it
//! was.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use indigo_sandbox::{HookSpec, SandboxExecutor};
use indigo_store::{CredentialRecord, CredentialState, CredentialStore, ReasonCode, StoreError};
use indigo_vault::{
    CredentialGenerator, CredentialKind, DataKey, Envelope, EnvelopeEngine, KeyHierarchy,
    RawMaterial, Scope, VaultError, WrappedDataKey,
};

use crate::clock::{Clock, SystemClock};
use crate::error::{LifecycleError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::machine::{self, Transition};
use crate::policy::{KindPolicy, LifecyclePolicy};

/// What one evaluation of a credential did.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing was due, or the record is terminal.
    Unchanged(CredentialRecord),
    /// A failed rotation is waiting out its backoff.
    BackingOff {
        record: CredentialRecord,
        until: DateTime<Utc>,
    },
    /// New material was committed.
    Rotated(CredentialRecord),
    /// Another writer finished the rotation first; the record is theirs.
    Superseded(CredentialRecord),
    Expired(CredentialRecord),
    /// A Pending placeholder whose issuance never finished was revoked.
    Abandoned(CredentialRecord),
}

impl Outcome {
    pub fn record(&self) -> &CredentialRecord {
        match self {
            Self::Unchanged(record)
            | Self::BackingOff { record, .. }
            | Self::Rotated(record)
            | Self::Superseded(record)
            | Self::Expired(record)
            | Self::Abandoned(record) => record,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged(_) => "unchanged",
            Self::BackingOff { .. } => "backing_off",
            Self::Rotated(_) => "rotated",
            Self::Superseded(_) => "superseded",
            Self::Expired(_) => "expired",
            Self::Abandoned(_) => "abandoned",
        }
    }
}

/// Result of one read-decide-swap loop.
enum Step {
    Committed(CredentialRecord),
    /// The decision on the latest record was to leave it alone.
    Skipped(CredentialRecord),
}

/// Freshly generated material, validated and sealed.
struct Sealed {
    envelope: Envelope,
    upstream_expires_at: Option<DateTime<Utc>>,
}

pub struct LifecycleEngine {
    store: Arc<dyn CredentialStore>,
    keys: Arc<KeyHierarchy>,
    envelopes: EnvelopeEngine,
    generator: Arc<CredentialGenerator>,
    sandbox: Option<Arc<SandboxExecutor>>,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
    events: EventBus,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<KeyHierarchy>,
        generator: Arc<CredentialGenerator>,
    ) -> Self {
        Self {
            store,
            keys,
            envelopes: EnvelopeEngine::new(),
            generator,
            sandbox: None,
            clock: Arc::new(SystemClock),
            policy: LifecyclePolicy::default(),
            events: EventBus::default(),
        }
    }

    /// Executor for the kind policies' validation hooks.
    pub fn with_sandbox(mut self, sandbox: Arc<SandboxExecutor>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> Arc<dyn CredentialStore> {
        Arc::clone(&self.store)
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -- Operations -----------------------------------------------------------

    /// Create a credential of `kind` for `scope` and return it Active.
    ///
    /// A Pending placeholder is written first so the id exists before any
    /// material does.  If generation, validation or sealing fails the
    /// placeholder is removed and the error returned.
    #[instrument(skip(self, scope))]
    pub async fn issue(&self, kind: CredentialKind, scope: Scope) -> Result<CredentialRecord> {
        let kind_policy = self.policy.for_kind(kind);
        let schedule = kind_policy.schedule(kind, self.clock.now(), None)?;

        let placeholder = CredentialRecord::pending(
            kind,
            scope,
            schedule.issued_at,
            schedule.rotate_at,
            schedule.expires_at,
        );
        let placeholder = self.store.insert(&placeholder).await?;
        debug!(credential_id = %placeholder.id, "pending placeholder written");

        match self.activate(&placeholder, kind_policy).await {
            Ok(record) => {
                info!(
                    credential_id = %record.id,
                    %kind,
                    version = record.version,
                    expires_at = %record.expires_at,
                    "credential issued"
                );
                self.events.publish(LifecycleEvent::Issued {
                    credential_id: record.id.clone(),
                    kind,
                });
                Ok(record)
            }
            Err(e) => {
                warn!(credential_id = %placeholder.id, error = %e, "issuance failed, removing placeholder");
                if let Err(cleanup) = self.store.delete(&placeholder.id).await {
                    warn!(
                        credential_id = %placeholder.id,
                        error = %cleanup,
                        "placeholder left behind; the scanner will reclaim it"
                    );
                }
                Err(e)
            }
        }
    }

    /// Decrypt the current material of credential `id`.
    ///
    /// Rotating credentials serve the material they held before rotation
    /// began.  An envelope that fails authentication revokes the credential
    /// with [`ReasonCode::TamperDetected`] and returns
    /// [`LifecycleError::DecryptionFailed`].
    #[instrument(skip(self))]
    pub async fn read(&self, id: &str) -> Result<RawMaterial> {
        let record = self.store.get(id).await?;
        let envelope = match (&record.ciphertext, record.state.is_readable()) {
            (Some(envelope), true) => envelope,
            _ => {
                return Err(LifecycleError::NotReadable {
                    id: record.id.clone(),
                    state: record.state,
                });
            }
        };

        let key = self.keys.unwrap(&envelope.data_key).await?;
        match self.envelopes.open(envelope, &key, &record.aad()) {
            Ok(material) => Ok(material),
            Err(VaultError::DecryptionFailed { reason }) => {
                warn!(
                    credential_id = %record.id,
                    version = record.version,
                    key_id = %envelope.data_key.key_id,
                    "envelope failed authentication, revoking credential"
                );
                self.quarantine(&record, &reason).await;
                Err(LifecycleError::DecryptionFailed {
                    id: record.id.clone(),
                    reason,
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Revoke credential `id` at an operator's request.  Revoking an already
    /// revoked credential returns it unchanged.
    #[instrument(skip(self, detail))]
    pub async fn revoke(&self, id: &str, detail: Option<String>) -> Result<CredentialRecord> {
        let record = self.store.get(id).await?;
        let step = self
            .transition(record, |current, _| match current.state {
                CredentialState::Revoked => Ok(None),
                state if state.is_terminal() => Err(LifecycleError::InvalidTransition {
                    id: current.id.clone(),
                    from: state,
                    transition: "revoke",
                }),
                _ => Ok(Some(Transition::Revoke {
                    reason: ReasonCode::RevokedByOperator,
                    detail: detail.clone(),
                })),
            })
            .await?;

        match step {
            Step::Committed(record) => {
                info!(credential_id = %record.id, version = record.version, "credential revoked");
                self.events.publish(LifecycleEvent::Revoked {
                    credential_id: record.id.clone(),
                    reason: ReasonCode::RevokedByOperator,
                });
                Ok(record)
            }
            Step::Skipped(record) => Ok(record),
        }
    }

    /// Rotate credential `id` now, ignoring `rotate_at` and any pending
    /// backoff.  A credential already past `expires_at` is expired instead.
    #[instrument(skip(self))]
    pub async fn rotate_now(&self, id: &str) -> Result<Outcome> {
        let record = self.store.get(id).await?;
        let now = self.clock.now();
        match record.state {
            CredentialState::Active | CredentialState::Rotating if now >= record.expires_at => {
                self.expire(record).await
            }
            CredentialState::Active | CredentialState::Rotating => self.rotate(record, true).await,
            state => Err(LifecycleError::InvalidTransition {
                id: record.id,
                from: state,
                transition: "begin_rotation",
            }),
        }
    }

    /// One scheduled evaluation of credential `id`: expire, rotate, retry a
    /// failed rotation or reclaim an abandoned placeholder, whichever is due.
    ///
    /// Expiry wins over rotation when both are due.
    #[instrument(skip(self))]
    pub async fn process(&self, id: &str) -> Result<Outcome> {
        let record = self.store.get(id).await?;
        let now = self.clock.now();

        match record.state {
            state if state.is_terminal() => Ok(Outcome::Unchanged(record)),
            CredentialState::Pending if now >= record.rotate_at => self.abandon(record).await,
            CredentialState::Active | CredentialState::Rotating if now >= record.expires_at => {
                self.expire(record).await
            }
            CredentialState::Active if now >= record.rotate_at => self.rotate(record, false).await,
            CredentialState::Rotating => match record.next_attempt_at {
                Some(until) if until > now => Ok(Outcome::BackingOff { record, until }),
                _ => self.rotate(record, false).await,
            },
            _ => Ok(Outcome::Unchanged(record)),
        }
    }

    pub async fn get(&self, id: &str) -> Result<CredentialRecord> {
        Ok(self.store.get(id).await?)
    }

    /// Number of credentials in each state.
    pub async fn counts(&self) -> Result<BTreeMap<CredentialState, u64>> {
        Ok(self.store.count_by_state().await?)
    }

    // -- Issuance ---------------------------------------------------------------

    async fn activate(
        &self,
        placeholder: &CredentialRecord,
        kind_policy: &KindPolicy,
    ) -> Result<CredentialRecord> {
        let (wrapped, key) = self.keys.sealing_key().await?;
        let sealed = self.produce(placeholder, kind_policy, &wrapped, &key).await?;
        let schedule = kind_policy.schedule(
            placeholder.kind,
            placeholder.issued_at,
            sealed.upstream_expires_at,
        )?;

        let active = machine::apply(
            placeholder,
            Transition::Activate {
                envelope: sealed.envelope,
                schedule,
                upstream_expires_at: sealed.upstream_expires_at,
            },
            self.clock.now(),
        )?;
        Ok(self
            .store
            .compare_and_swap(&placeholder.id, placeholder.version, &active)
            .await?)
    }

    async fn abandon(&self, record: CredentialRecord) -> Result<Outcome> {
        let step = self
            .transition(record, |current, now| {
                Ok((current.state == CredentialState::Pending && now >= current.rotate_at)
                    .then_some(Transition::AbandonIssuance))
            })
            .await?;

        match step {
            Step::Committed(record) => {
                warn!(credential_id = %record.id, "reclaimed abandoned placeholder");
                self.events.publish(LifecycleEvent::Revoked {
                    credential_id: record.id.clone(),
                    reason: ReasonCode::IssuanceAbandoned,
                });
                Ok(Outcome::Abandoned(record))
            }
            Step::Skipped(record) => Ok(Outcome::Unchanged(record)),
        }
    }

    // -- Expiry -----------------------------------------------------------------

    async fn expire(&self, record: CredentialRecord) -> Result<Outcome> {
        let step = self
            .transition(record, |current, now| {
                Ok((current.state.is_readable() && now >= current.expires_at)
                    .then_some(Transition::Expire))
            })
            .await?;

        match step {
            Step::Committed(record) => {
                info!(credential_id = %record.id, version = record.version, "credential expired, ciphertext wiped");
                self.events.publish(LifecycleEvent::Expired {
                    credential_id: record.id.clone(),
                });
                Ok(Outcome::Expired(record))
            }
            Step::Skipped(record) => Ok(Outcome::Unchanged(record)),
        }
    }

    // -- Rotation ---------------------------------------------------------------

    async fn rotate(&self, record: CredentialRecord, forced: bool) -> Result<Outcome> {
        let id = record.id.clone();

        let (wrapped, key) = match self.keys.sealing_key().await {
            Ok(pair) => pair,
            Err(e) => return Err(self.defer(&id, e.into())),
        };

        let begun = self
            .transition(record, |current, now| match current.state {
                CredentialState::Active if forced || now >= current.rotate_at => {
                    Ok(Some(Transition::BeginRotation { forced }))
                }
                CredentialState::Active | CredentialState::Rotating => Ok(None),
                state => Err(LifecycleError::InvalidTransition {
                    id: current.id.clone(),
                    from: state,
                    transition: "begin_rotation",
                }),
            })
            .await?;

        let rotating = match begun {
            Step::Committed(record) => {
                info!(credential_id = %id, version = record.version, "rotation started");
                self.events.publish(LifecycleEvent::RotationStarted {
                    credential_id: id.clone(),
                    version: record.version,
                });
                record
            }
            Step::Skipped(record) if record.state == CredentialState::Rotating => {
                if !self.may_take_over(&record) {
                    debug!(
                        credential_id = %id,
                        version = record.version,
                        "rotation already in progress elsewhere"
                    );
                    return Ok(Outcome::Superseded(record));
                }
                record
            }
            // Active again with a schedule that is not due: someone else
            // already rotated it.
            Step::Skipped(record) => return Ok(Outcome::Superseded(record)),
        };

        let kind_policy = self.policy.for_kind(rotating.kind);
        match self.produce(&rotating, kind_policy, &wrapped, &key).await {
            Ok(sealed) => self.complete(rotating, kind_policy, sealed).await,
            Err(e) if e.counts_against_budget() => Err(self.record_failure(rotating, e).await),
            Err(e @ LifecycleError::KeyUnavailable { .. }) => Err(self.defer(&id, e)),
            Err(e) => Err(e),
        }
    }

    /// Whether this worker may carry on a rotation it did not begin: either
    /// an earlier attempt failed (retries are due to whoever picks them up)
    /// or the worker that began it has not been heard from within the lease.
    fn may_take_over(&self, rotating: &CredentialRecord) -> bool {
        rotating.attempt > 0
            || self.clock.now() >= rotating.updated_at + self.policy.rotation_lease()
    }

    async fn complete(
        &self,
        rotating: CredentialRecord,
        kind_policy: &KindPolicy,
        sealed: Sealed,
    ) -> Result<Outcome> {
        let kind = rotating.kind;
        let step = self
            .transition(rotating, |current, now| match current.state {
                CredentialState::Rotating => Ok(Some(Transition::CompleteRotation {
                    envelope: sealed.envelope.clone(),
                    schedule: kind_policy.schedule(kind, now, sealed.upstream_expires_at)?,
                    upstream_expires_at: sealed.upstream_expires_at,
                })),
                _ => Ok(None),
            })
            .await?;

        match step {
            Step::Committed(record) => {
                info!(
                    credential_id = %record.id,
                    version = record.version,
                    key_id = %sealed.envelope.data_key.key_id,
                    rotate_at = %record.rotate_at,
                    "rotation committed"
                );
                self.events.publish(LifecycleEvent::Rotated {
                    credential_id: record.id.clone(),
                    version: record.version,
                });
                Ok(Outcome::Rotated(record))
            }
            Step::Skipped(record) => {
                info!(
                    credential_id = %record.id,
                    version = record.version,
                    state = %record.state,
                    "rotation superseded by a concurrent writer"
                );
                Ok(Outcome::Superseded(record))
            }
        }
    }

    /// Charge `error` to the rotation's retry budget, revoking the credential
    /// when the budget is spent.  Returns `error` for the caller to surface.
    async fn record_failure(
        &self,
        rotating: CredentialRecord,
        error: LifecycleError,
    ) -> LifecycleError {
        let detail = error.to_string();
        let retry = &self.policy.retry;
        let result = self
            .transition(rotating, |current, now| {
                if current.state != CredentialState::Rotating {
                    return Ok(None);
                }
                let attempt = current.attempt.saturating_add(1);
                Ok(Some(if retry.is_exhausted(attempt) {
                    Transition::RetriesExhausted {
                        detail: detail.clone(),
                    }
                } else {
                    Transition::RecordFailure {
                        next_attempt_at: now + retry.backoff(attempt),
                        detail: detail.clone(),
                    }
                }))
            })
            .await;

        match result {
            Ok(Step::Committed(record)) if record.state == CredentialState::Revoked => {
                warn!(
                    credential_id = %record.id,
                    attempts = record.attempt,
                    error = %error,
                    "rotation retry budget exhausted, credential revoked"
                );
                self.events.publish(LifecycleEvent::Revoked {
                    credential_id: record.id.clone(),
                    reason: ReasonCode::RetriesExhausted,
                });
            }
            Ok(Step::Committed(record)) => {
                warn!(
                    credential_id = %record.id,
                    attempt = record.attempt,
                    next_attempt_at = ?record.next_attempt_at,
                    error = %error,
                    "rotation attempt failed"
                );
                self.events.publish(LifecycleEvent::RotationFailed {
                    credential_id: record.id.clone(),
                    attempt: record.attempt,
                    error: detail,
                });
            }
            Ok(Step::Skipped(record)) => {
                debug!(credential_id = %record.id, state = %record.state, "rotation failure not recorded, record moved on");
            }
            Err(e) => {
                warn!(error = %e, "could not record rotation failure");
            }
        }
        error
    }

    fn defer(&self, id: &str, error: LifecycleError) -> LifecycleError {
        warn!(credential_id = %id, error = %error, "rotation deferred");
        self.events.publish(LifecycleEvent::RotationDeferred {
            credential_id: id.to_string(),
            reason: error.to_string(),
        });
        error
    }

    // -- Helpers ----------------------------------------------------------------

    /// Generate material for `record`, run the kind's hook against it and seal
    /// it under `key`.  The plaintext never leaves this function.
    async fn produce(
        &self,
        record: &CredentialRecord,
        kind_policy: &KindPolicy,
        wrapped: &WrappedDataKey,
        key: &DataKey,
    ) -> Result<Sealed> {
        let generated = self.generator.generate(record.kind, &record.scope).await?;
        if let Some(hook) = &kind_policy.hook {
            self.validate(hook, &record.id, generated.material.clone())
                .await?;
        }
        let envelope = self
            .envelopes
            .seal(&generated.material, wrapped, key, &record.aad())?;
        Ok(Sealed {
            envelope,
            upstream_expires_at: generated.upstream_expires_at,
        })
    }

    async fn validate(
        &self,
        hook: &HookSpec,
        credential_id: &str,
        material: RawMaterial,
    ) -> Result<()> {
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or_else(|| LifecycleError::SandboxLaunch {
                reason: format!("hook {} configured but no sandbox executor", hook.name),
            })?;

        let outcome = sandbox.run_hook(hook, material).await?;
        if outcome.success() {
            debug!(%credential_id, hook = %hook.name, "hook accepted material");
            Ok(())
        } else {
            Err(LifecycleError::HookFailed {
                hook: hook.name.clone(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr.trim().to_string(),
            })
        }
    }

    /// Revoke `record` for tamper, unless its ciphertext has already been
    /// replaced by a later write.
    async fn quarantine(&self, record: &CredentialRecord, reason: &str) {
        let suspect = record.ciphertext.clone();
        let result = self
            .transition(record.clone(), |current, _| {
                Ok((current.state.is_readable() && current.ciphertext == suspect).then(|| {
                    Transition::Revoke {
                        reason: ReasonCode::TamperDetected,
                        detail: Some(reason.to_string()),
                    }
                }))
            })
            .await;

        match result {
            Ok(Step::Committed(revoked)) => {
                self.events.publish(LifecycleEvent::Revoked {
                    credential_id: revoked.id.clone(),
                    reason: ReasonCode::TamperDetected,
                });
            }
            Ok(Step::Skipped(_)) => {}
            Err(e) => warn!(credential_id = %record.id, error = %e, "could not revoke tampered credential"),
        }
    }

    /// Read-decide-swap loop around [`machine::apply`].
    ///
    /// `decide` sees the latest record and the current time and returns the
    /// transition to apply, or `None` to leave the record alone.  It runs
    /// again on every lost compare-and-swap.
    async fn transition<F>(&self, mut current: CredentialRecord, mut decide: F) -> Result<Step>
    where
        F: FnMut(&CredentialRecord, DateTime<Utc>) -> Result<Option<Transition>> + Send,
    {
        let attempts = self.policy.transition_retries.max(1);
        for attempt in 1..=attempts {
            let now = self.clock.now();
            let Some(transition) = decide(&current, now)? else {
                return Ok(Step::Skipped(current));
            };
            let name = transition.name();
            let next = machine::apply(&current, transition, now)?;

            match self
                .store
                .compare_and_swap(&current.id, current.version, &next)
                .await
            {
                Ok(committed) => {
                    debug!(
                        credential_id = %committed.id,
                        transition = name,
                        version = committed.version,
                        state = %committed.state,
                        "transition committed"
                    );
                    return Ok(Step::Committed(committed));
                }
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) => {
                    debug!(
                        credential_id = %current.id,
                        transition = name,
                        attempt,
                        expected,
                        actual,
                        "lost compare-and-swap, re-reading"
                    );
                    current = self.store.get(&current.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LifecycleError::TransitionConflict {
            id: current.id,
            attempts,
        })
    }
}
