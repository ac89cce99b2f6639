//! Integration tests for the indigo-store crate.
//!
//! These run against a real SQLite file on disk (via tempfile) and exercise
//! persistence across reopen, concurrent compare-and-swap, and due scans.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::TryStreamExt;

use indigo_store::{
    CredentialKind, CredentialRecord, CredentialState, CredentialStore, Database, ReasonCode,
    Scope, SqliteCredentialStore, StoreError, list_due,
};
use indigo_vault::{EnvelopeEngine, KeyHierarchy, KeyHierarchyConfig, LocalKeyOracle, RawMaterial};

fn fresh_record(rotate_in: Duration) -> CredentialRecord {
    let now = Utc::now();
    CredentialRecord::pending(
        CredentialKind::DatabasePassword,
        Scope::new().with("database", "orders"),
        now - Duration::hours(1),
        now + rotate_in,
        now + rotate_in + Duration::hours(1),
    )
}

async fn store_at(path: std::path::PathBuf) -> Arc<SqliteCredentialStore> {
    let db = Database::open_and_migrate(path).await.unwrap();
    Arc::new(SqliteCredentialStore::new(db))
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sealed_record_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("indigo.db");

    let keys = KeyHierarchy::new(
        Arc::new(LocalKeyOracle::new("local", [1u8; 32])),
        KeyHierarchyConfig::default(),
    );
    let engine = EnvelopeEngine::new();

    let id = {
        let store = store_at(path.clone()).await;
        let mut record = store.insert(&fresh_record(Duration::minutes(45))).await.unwrap();

        let (wrapped, key) = keys.sealing_key().await.unwrap();
        let material = RawMaterial::from("pa55word".to_string());
        record.ciphertext = Some(engine.seal(&material, &wrapped, &key, &record.aad()).unwrap());
        record.state = CredentialState::Active;
        store.compare_and_swap(&record.id, 1, &record).await.unwrap();
        record.id
    };

    let store = store_at(path).await;
    let record = store.get(&id).await.unwrap();
    assert_eq!(record.state, CredentialState::Active);
    assert_eq!(record.version, 2);

    let envelope = record.ciphertext.as_ref().unwrap();
    let key = keys.unwrap(&envelope.data_key).await.unwrap();
    let opened = engine.open(envelope, &key, &record.aad()).unwrap();
    assert_eq!(opened.as_str(), Some("pa55word"));
}

#[tokio::test]
async fn tombstone_leaves_no_ciphertext_in_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path().join("indigo.db")).await;

    let mut record = store.insert(&fresh_record(Duration::minutes(45))).await.unwrap();
    record.state = CredentialState::Expired;
    record.reason = Some(ReasonCode::Expired);
    record.ciphertext = None;
    store.compare_and_swap(&record.id, 1, &record).await.unwrap();

    let raw = store.get(&record.id).await.unwrap();
    assert!(raw.ciphertext.is_none());
    assert_eq!(raw.reason, Some(ReasonCode::Expired));
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn exactly_one_concurrent_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path().join("indigo.db")).await;
    let record = store.insert(&fresh_record(Duration::zero())).await.unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let store = Arc::clone(&store);
        let mut next = record.clone();
        next.reason_detail = Some(format!("worker-{worker}"));
        tasks.push(tokio::spawn(async move {
            store.compare_and_swap(&next.id, 1, &next).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(committed) => {
                assert_eq!(committed.version, 2);
                wins += 1;
            }
            Err(StoreError::VersionConflict { actual, .. }) => {
                assert_eq!(actual, 2);
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.get(&record.id).await.unwrap().version, 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Due scans
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn due_stream_yields_backlog_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path().join("indigo.db")).await;

    let mut inserted = Vec::new();
    for minutes_overdue in [3, 40, 12, 25, 1] {
        let record = store
            .insert(&fresh_record(Duration::minutes(-minutes_overdue)))
            .await
            .unwrap();
        inserted.push((minutes_overdue, record.id));
    }
    store
        .insert(&fresh_record(Duration::minutes(30)))
        .await
        .unwrap();

    inserted.sort_by_key(|(overdue, _)| -overdue);
    let expected: Vec<String> = inserted.into_iter().map(|(_, id)| id).collect();

    let due: Vec<String> = list_due(store.clone(), Utc::now(), 2)
        .into_stream()
        .map_ok(|r| r.id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(due, expected);
}
