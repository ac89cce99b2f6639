//! Integration tests for the indigo-lifecycle crate.
//!
//! The engine runs against a real SQLite store, the local key oracle (behind
//! a switch that can take it offline) and a fake container runtime whose
//! hooks can accept, reject, hang or rendezvous.  Time is a `ManualClock`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Notify;

use indigo_lifecycle::{
    Clock, KindPolicy, LifecycleEngine, LifecycleError, LifecycleEvent, LifecyclePolicy,
    ManualClock, Outcome, RetryPolicy, Scanner, ScannerConfig,
};
use indigo_sandbox::{
    ContainerRuntime, Environment, HookOutcome, HookSpec, SandboxConfig, SandboxExecutor,
};
use indigo_store::{
    CredentialRecord, CredentialState, CredentialStore, Database, ReasonCode,
    SqliteCredentialStore, StoreError,
};
use indigo_vault::{
    CredentialGenerator, CredentialKind, DataKey, Generated, IdentityProvider, KeyHierarchy,
    KeyHierarchyConfig, KeyOracle, LocalKeyOracle, RawMaterial, Scope, VaultError,
};

// ═══════════════════════════════════════════════════════════════════════
//  Fakes
// ═══════════════════════════════════════════════════════════════════════

/// Local oracle with an off switch.
struct SwitchableOracle {
    inner: LocalKeyOracle,
    down: AtomicBool,
}

#[async_trait]
impl KeyOracle for SwitchableOracle {
    fn kek_id(&self) -> &str {
        self.inner.kek_id()
    }

    async fn wrap(&self, key: &DataKey) -> indigo_vault::Result<Vec<u8>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(VaultError::key_unavailable("kms unreachable"));
        }
        self.inner.wrap(key).await
    }

    async fn unwrap(&self, kek_id: &str, blob: &[u8]) -> indigo_vault::Result<DataKey> {
        if self.down.load(Ordering::SeqCst) {
            return Err(VaultError::key_unavailable("kms unreachable"));
        }
        self.inner.unwrap(kek_id, blob).await
    }
}

/// Shared state of every fake hook environment.
#[derive(Default)]
struct HookRecorder {
    exit_code: AtomicI32,
    hang: AtomicBool,
    launched: AtomicUsize,
    torn_down: AtomicUsize,
    /// The running environment's copy of the secret; wiped on teardown.
    held: Mutex<Option<Vec<u8>>>,
    /// When set, every hook waits for a notification before finishing.
    gate: Mutex<Option<Arc<Notify>>>,
}

impl HookRecorder {
    fn reject(&self) {
        self.exit_code.store(1, Ordering::SeqCst);
    }

    fn accept(&self) {
        self.exit_code.store(0, Ordering::SeqCst);
    }
}

struct FakeRuntime(Arc<HookRecorder>);

struct FakeEnv(Arc<HookRecorder>);

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(
        &self,
        _spec: &HookSpec,
        _config: &SandboxConfig,
    ) -> indigo_sandbox::Result<Box<dyn Environment>> {
        self.0.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEnv(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl Environment for FakeEnv {
    fn id(&self) -> &str {
        "fake-hook"
    }

    async fn inject_and_wait(&mut self, secret: &RawMaterial) -> indigo_sandbox::Result<HookOutcome> {
        *self.0.held.lock().unwrap() = Some(secret.as_bytes().to_vec());

        let gate = self.0.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.0.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let code = self.0.exit_code.load(Ordering::SeqCst);
        let stderr: &[u8] = if code == 0 { b"" } else { b"login rejected" };
        Ok(HookOutcome::from_raw(code, b"", stderr, 1024))
    }

    async fn teardown(&mut self) -> indigo_sandbox::Result<()> {
        if let Some(mut held) = self.0.held.lock().unwrap().take() {
            held.fill(0);
        }
        self.0.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Identity provider whose material expires at a fixed time.
struct StaticProvider {
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    async fn issue(&self, _kind: CredentialKind, _scope: &Scope) -> indigo_vault::Result<Generated> {
        Ok(Generated {
            material: RawMaterial::from("AKIAEXAMPLE:wJalrXUtnFEMI".to_string()),
            upstream_expires_at: Some(self.expires_at),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Database passwords live an hour and rotate at 45 minutes behind a
/// validation hook; three failed attempts revoke.
fn policy() -> LifecyclePolicy {
    LifecyclePolicy::default()
        .with_kind(
            CredentialKind::DatabasePassword,
            KindPolicy::new(Duration::hours(1), Duration::minutes(45))
                .with_hook(HookSpec::new("validate-login", "indigo/pg-check")),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 60,
            max_delay_secs: 600,
            jitter: 0.0,
        })
}

struct Harness {
    engine: Arc<LifecycleEngine>,
    store: Arc<SqliteCredentialStore>,
    keys: Arc<KeyHierarchy>,
    oracle: Arc<SwitchableOracle>,
    clock: Arc<ManualClock>,
    hooks: Arc<HookRecorder>,
}

impl Harness {
    async fn new() -> Self {
        Self::build(Database::in_memory_migrated().await.unwrap(), 2_000, None).await
    }

    async fn build(
        db: Database,
        hook_limit_ms: u64,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        let store = Arc::new(SqliteCredentialStore::new(db));
        let oracle = Arc::new(SwitchableOracle {
            inner: LocalKeyOracle::new("test-kek", [9u8; 32]),
            down: AtomicBool::new(false),
        });
        let keys = Arc::new(KeyHierarchy::new(
            Arc::clone(&oracle) as Arc<dyn KeyOracle>,
            KeyHierarchyConfig::default(),
        ));
        let clock = Arc::new(ManualClock::new(t0()));
        let hooks = Arc::new(HookRecorder::default());
        let sandbox = Arc::new(SandboxExecutor::new(
            Arc::new(FakeRuntime(Arc::clone(&hooks))),
            SandboxConfig::default().with_max_execution_ms(hook_limit_ms),
        ));

        let mut generator = CredentialGenerator::new();
        if let Some(provider) = provider {
            generator = generator.with_identity_provider(provider);
        }

        let engine = LifecycleEngine::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&keys),
            Arc::new(generator),
        )
        .with_sandbox(sandbox)
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .with_policy(policy());

        Self {
            engine: Arc::new(engine),
            store,
            keys,
            oracle,
            clock,
            hooks,
        }
    }

    async fn issue_password(&self) -> CredentialRecord {
        self.engine
            .issue(
                CredentialKind::DatabasePassword,
                Scope::new().with("database", "orders").with("role", "app"),
            )
            .await
            .unwrap()
    }

    /// Wait until `count` hooks have been launched in total.
    async fn wait_for_launches(&self, count: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.hooks.launched.load(Ordering::SeqCst) < count {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn record(&self, id: &str) -> CredentialRecord {
        self.store.get(id).await.unwrap()
    }

    fn kms_down(&self) {
        self.oracle.down.store(true, Ordering::SeqCst);
        self.keys.invalidate();
    }

    fn kms_up(&self) {
        self.oracle.down.store(false, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Issue / read
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn issue_returns_active_readable_credential() {
    let h = Harness::new().await;
    let mut events = h.engine.events().subscribe();

    let record = h.issue_password().await;
    assert_eq!(record.state, CredentialState::Active);
    assert_eq!(record.version, 2);
    assert_eq!(record.rotate_at, t0() + Duration::minutes(45));
    assert_eq!(record.expires_at, t0() + Duration::hours(1));
    assert!(record.ciphertext.is_some());

    let material = h.engine.read(&record.id).await.unwrap();
    assert_eq!(material.len(), 32);

    // The hook saw the material and its environment is gone.
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 1);
    assert_eq!(h.hooks.torn_down.load(Ordering::SeqCst), 1);
    assert!(h.hooks.held.lock().unwrap().is_none());

    let event = events.recv().await.unwrap();
    assert_eq!(
        *event,
        LifecycleEvent::Issued {
            credential_id: record.id.clone(),
            kind: CredentialKind::DatabasePassword,
        }
    );
}

#[tokio::test]
async fn rejected_issuance_leaves_no_record() {
    let h = Harness::new().await;
    h.hooks.reject();

    let err = h
        .engine
        .issue(CredentialKind::DatabasePassword, Scope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::HookFailed { exit_code: 1, .. }));

    let counts = h.engine.counts().await.unwrap();
    assert_eq!(counts.values().sum::<u64>(), 0);
}

#[tokio::test]
async fn kinds_without_hooks_skip_the_sandbox() {
    let h = Harness::new().await;
    let record = h
        .engine
        .issue(CredentialKind::TlsKeypair, Scope::new().with("cn", "api.internal"))
        .await
        .unwrap();

    let pem = h.engine.read(&record.id).await.unwrap();
    assert!(pem.as_str().unwrap().contains("BEGIN PRIVATE KEY"));
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delegated_expiry_clamps_schedule() {
    let upstream = t0() + Duration::minutes(30);
    let provider = Arc::new(StaticProvider {
        expires_at: upstream,
    });
    let h = Harness::build(
        Database::in_memory_migrated().await.unwrap(),
        2_000,
        Some(provider),
    )
    .await;

    let record = h
        .engine
        .issue(
            CredentialKind::CloudAccessKey,
            Scope::new().with("role", "arn:aws:iam::1:role/app"),
        )
        .await
        .unwrap();

    // Default cloud policy: 1 h, rotating at 45 min.  The provider's
    // 30-minute expiry wins and rotation moves to 22.5 minutes.
    assert_eq!(record.expires_at, upstream);
    assert_eq!(record.upstream_expires_at, Some(upstream));
    assert_eq!(record.rotate_at, t0() + Duration::seconds(1350));
    assert_eq!(
        h.engine.read(&record.id).await.unwrap().as_str(),
        Some("AKIAEXAMPLE:wJalrXUtnFEMI")
    );
}

#[tokio::test]
async fn delegated_kind_without_provider_fails_upstream() {
    let h = Harness::new().await;
    let err = h
        .engine
        .issue(CredentialKind::CloudAccessKey, Scope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::UpstreamGeneration { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenarios
// ═══════════════════════════════════════════════════════════════════════

/// Scenario A: rotation starts at 45 minutes; until regeneration succeeds
/// the credential stays Rotating and keeps serving the old material.
#[tokio::test]
async fn rotating_credential_serves_old_material_until_swap() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    let old = h.engine.read(&issued.id).await.unwrap();

    h.hooks.reject();
    h.clock.advance(Duration::minutes(46));
    let err = h.engine.process(&issued.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::HookFailed { .. }));

    let rotating = h.record(&issued.id).await;
    assert_eq!(rotating.state, CredentialState::Rotating);
    assert_eq!(rotating.ciphertext, issued.ciphertext);
    assert_eq!(rotating.attempt, 1);
    assert_eq!(
        rotating.next_attempt_at,
        Some(t0() + Duration::minutes(46) + Duration::seconds(60))
    );
    assert_eq!(h.engine.read(&issued.id).await.unwrap(), old);

    // Still inside the backoff window.
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::BackingOff { .. }));

    h.hooks.accept();
    h.clock.advance(Duration::minutes(2));
    let outcome = h.engine.process(&issued.id).await.unwrap();
    let Outcome::Rotated(rotated) = outcome else {
        panic!("expected rotation, got {outcome:?}");
    };

    assert_eq!(rotated.state, CredentialState::Active);
    assert_eq!(rotated.attempt, 0);
    assert_eq!(rotated.version, rotating.version + 1);
    assert_ne!(rotated.ciphertext, issued.ciphertext);
    assert_eq!(rotated.issued_at, t0() + Duration::minutes(48));
    assert_ne!(h.engine.read(&issued.id).await.unwrap(), old);
}

/// Scenario B: with the key oracle down, reads and rotations fail with
/// `KeyUnavailable` and the record is left exactly as it was.
#[tokio::test]
async fn key_outage_defers_without_touching_the_record() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    h.kms_down();

    let err = h.engine.read(&issued.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::KeyUnavailable { .. }));

    h.clock.advance(Duration::minutes(46));
    let err = h.engine.process(&issued.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::KeyUnavailable { .. }));
    assert_eq!(h.record(&issued.id).await, issued);

    let scanner = Scanner::new(Arc::clone(&h.engine), ScannerConfig::default());
    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.record(&issued.id).await, issued);

    h.kms_up();
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::Rotated(_)));
}

/// Scenario C: two workers rotate the same credential at once.  The one that
/// begins the rotation generates and commits; the other finds it in flight
/// and backs off without launching a hook of its own.
#[tokio::test]
async fn concurrent_rotations_commit_exactly_once() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 1);

    let gate = Arc::new(Notify::new());
    *h.hooks.gate.lock().unwrap() = Some(Arc::clone(&gate));
    h.clock.advance(Duration::minutes(46));

    let first = tokio::spawn({
        let engine = Arc::clone(&h.engine);
        let id = issued.id.clone();
        async move { engine.process(&id).await }
    });
    h.wait_for_launches(2).await;

    let second = h.engine.process(&issued.id).await.unwrap();
    let Outcome::Superseded(in_flight) = second else {
        panic!("expected the second worker to back off, got {second:?}");
    };
    assert_eq!(in_flight.state, CredentialState::Rotating);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    let Outcome::Rotated(rotated) = first else {
        panic!("expected rotation, got {first:?}");
    };

    assert_eq!(h.record(&issued.id).await, rotated);
    assert_eq!(rotated.state, CredentialState::Active);
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 2);
}

/// A rotation whose worker vanished is taken over once its lease runs out.
#[tokio::test]
async fn abandoned_rotation_is_taken_over_after_lease() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;

    let gate = Arc::new(Notify::new());
    *h.hooks.gate.lock().unwrap() = Some(gate);
    h.clock.advance(Duration::minutes(46));

    let stuck = tokio::spawn({
        let engine = Arc::clone(&h.engine);
        let id = issued.id.clone();
        async move { engine.process(&id).await }
    });
    h.wait_for_launches(2).await;
    stuck.abort();
    let _ = stuck.await;
    h.hooks.gate.lock().unwrap().take();

    let stranded = h.record(&issued.id).await;
    assert_eq!(stranded.state, CredentialState::Rotating);
    assert_eq!(stranded.attempt, 0);

    h.clock.advance(Duration::seconds(60));
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::Superseded(_)));
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 2);

    h.clock.advance(Duration::minutes(5));
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::Rotated(_)), "got {outcome:?}");
    assert_eq!(h.hooks.launched.load(Ordering::SeqCst), 3);
}

/// Scenario D: a hook that outlives its limit is torn down, its copy of the
/// secret erased, and the attempt charged to the retry budget.
#[tokio::test]
async fn hung_hook_times_out_and_counts_an_attempt() {
    let h = Harness::build(Database::in_memory_migrated().await.unwrap(), 50, None).await;
    let issued = h.issue_password().await;

    h.hooks.hang.store(true, Ordering::SeqCst);
    h.clock.advance(Duration::minutes(46));
    let err = h.engine.process(&issued.id).await.unwrap_err();

    assert!(matches!(err, LifecycleError::SandboxTimeout { limit_ms: 50 }));
    assert_eq!(h.hooks.torn_down.load(Ordering::SeqCst), 2);
    assert!(h.hooks.held.lock().unwrap().is_none());

    let record = h.record(&issued.id).await;
    assert_eq!(record.state, CredentialState::Rotating);
    assert_eq!(record.attempt, 1);
    assert!(record.next_attempt_at.is_some());
    assert!(record.reason_detail.unwrap().contains("timeout"));
    assert_eq!(record.ciphertext, issued.ciphertext);
}

// ═══════════════════════════════════════════════════════════════════════
//  Boundaries and terminal states
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rotation_boundary_is_inclusive() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    h.hooks.reject();

    h.clock.set(issued.rotate_at - Duration::seconds(1));
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::Unchanged(_)));

    h.clock.set(issued.rotate_at);
    h.engine.process(&issued.id).await.unwrap_err();
    assert_eq!(h.record(&issued.id).await.state, CredentialState::Rotating);
}

#[tokio::test]
async fn expiry_boundary_tombstones_the_record() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;

    h.clock.set(issued.expires_at);
    let outcome = h.engine.process(&issued.id).await.unwrap();
    let Outcome::Expired(expired) = outcome else {
        panic!("expected expiry, got {outcome:?}");
    };
    assert_eq!(expired.state, CredentialState::Expired);
    assert!(expired.ciphertext.is_none());
    assert_eq!(expired.reason, Some(ReasonCode::Expired));

    assert!(matches!(
        h.engine.read(&issued.id).await,
        Err(LifecycleError::NotReadable {
            state: CredentialState::Expired,
            ..
        })
    ));
    assert!(matches!(
        h.engine.rotate_now(&issued.id).await,
        Err(LifecycleError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn exhausted_retries_revoke_with_distinct_reason() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    h.hooks.reject();
    h.clock.advance(Duration::minutes(46));

    for _ in 0..3 {
        let err = h.engine.rotate_now(&issued.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::HookFailed { .. }));
    }

    let record = h.record(&issued.id).await;
    assert_eq!(record.state, CredentialState::Revoked);
    assert_eq!(record.reason, Some(ReasonCode::RetriesExhausted));
    assert_ne!(record.reason, Some(ReasonCode::Expired));
    assert!(record.ciphertext.is_none());
    assert_eq!(record.attempt, 3);
}

#[tokio::test]
async fn tampered_envelope_revokes_and_surfaces() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;

    let mut tampered = h.record(&issued.id).await;
    if let Some(envelope) = tampered.ciphertext.as_mut() {
        envelope.ciphertext[0] ^= 0xff;
    }
    h.store
        .compare_and_swap(&issued.id, tampered.version, &tampered)
        .await
        .unwrap();

    let err = h.engine.read(&issued.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::DecryptionFailed { .. }));

    let record = h.record(&issued.id).await;
    assert_eq!(record.state, CredentialState::Revoked);
    assert_eq!(record.reason, Some(ReasonCode::TamperDetected));
    assert!(record.ciphertext.is_none());
}

#[tokio::test]
async fn operator_revoke_is_terminal_and_idempotent() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;

    let revoked = h
        .engine
        .revoke(&issued.id, Some("leaked in CI logs".into()))
        .await
        .unwrap();
    assert_eq!(revoked.state, CredentialState::Revoked);
    assert_eq!(revoked.reason, Some(ReasonCode::RevokedByOperator));
    assert_eq!(revoked.reason_detail.as_deref(), Some("leaked in CI logs"));
    assert!(revoked.ciphertext.is_none());

    let again = h.engine.revoke(&issued.id, None).await.unwrap();
    assert_eq!(again.version, revoked.version);

    h.clock.advance(Duration::hours(2));
    let outcome = h.engine.process(&issued.id).await.unwrap();
    assert!(matches!(outcome, Outcome::Unchanged(_)));
}

#[tokio::test]
async fn stale_writer_gets_version_conflict() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;

    h.engine.rotate_now(&issued.id).await.unwrap();

    let err = h
        .store
        .compare_and_swap(&issued.id, issued.version, &issued)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { .. }));
    assert_ne!(h.record(&issued.id).await.ciphertext, issued.ciphertext);
}

#[tokio::test]
async fn abandoned_placeholder_is_reclaimed() {
    let h = Harness::new().await;
    let placeholder = CredentialRecord::pending(
        CredentialKind::ApiToken,
        Scope::new(),
        t0() - Duration::hours(2),
        t0() - Duration::hours(1),
        t0() + Duration::hours(1),
    );
    h.store.insert(&placeholder).await.unwrap();

    let outcome = h.engine.process(&placeholder.id).await.unwrap();
    let Outcome::Abandoned(record) = outcome else {
        panic!("expected abandonment, got {outcome:?}");
    };
    assert_eq!(record.state, CredentialState::Revoked);
    assert_eq!(record.reason, Some(ReasonCode::IssuanceAbandoned));
}

#[tokio::test]
async fn missing_credential_is_not_found() {
    let h = Harness::new().await;
    assert!(matches!(
        h.engine.process("no-such-id").await,
        Err(LifecycleError::NotFound { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════
//  Scanner
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scanner_rotates_then_expires_due_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("indigo.db"))
        .await
        .unwrap();
    let h = Harness::build(db, 2_000, None).await;

    for _ in 0..3 {
        h.issue_password().await;
    }
    let scanner = Scanner::new(
        Arc::clone(&h.engine),
        ScannerConfig::default().with_max_workers(2),
    );

    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.due, 0);

    h.clock.advance(Duration::minutes(46));
    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.due, 3);
    assert_eq!(report.rotated, 3);
    assert_eq!(scanner.in_flight(), 0);

    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.due, 0);

    h.clock.advance(Duration::hours(2));
    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.expired, 3);

    let counts = h.engine.counts().await.unwrap();
    assert_eq!(counts.get(&CredentialState::Expired), Some(&3));
}

#[tokio::test]
async fn scanner_counts_failures_recorded_by_the_engine() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    h.hooks.reject();
    h.clock.advance(Duration::minutes(46));

    let scanner = Scanner::new(Arc::clone(&h.engine), ScannerConfig::default());
    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 0);

    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.backing_off, 1);
    assert_eq!(h.record(&issued.id).await.attempt, 1);
}

#[tokio::test]
async fn background_loop_stops_on_shutdown() {
    let h = Harness::new().await;
    let issued = h.issue_password().await;
    h.clock.advance(Duration::minutes(46));

    let scanner = Scanner::new(Arc::clone(&h.engine), ScannerConfig::default());
    let mut events = h.engine.events().subscribe();
    let handle = scanner.start();

    // The first pass runs immediately.
    loop {
        let event = events.recv().await.unwrap();
        if matches!(*event, LifecycleEvent::Rotated { .. }) {
            assert_eq!(event.credential_id(), issued.id);
            break;
        }
    }

    scanner.shutdown();
    handle.await.unwrap();
    assert!(matches!(
        scanner.scan_once().await,
        Err(LifecycleError::ScannerShutdown)
    ));
}
