//! Credential persistence with optimistic concurrency.
//!
//! Every write after the initial insert goes through
//! [`CredentialStore::compare_and_swap`]: the caller names the version it
//! read, and the update only lands if that is still the stored version.  The
//! store never merges; on [`StoreError::VersionConflict`] the caller re-reads
//! and recomputes.
//!
//! [`DueCursor`] pages through credentials whose `rotate_at` or `expires_at`
//! has passed, ordered by `(rotate_at, id)`.  It is lazy (one page per
//! query) and restartable from its [`DuePosition`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tracing::{debug, instrument, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::record::{CredentialRecord, CredentialState};

/// Default number of records fetched per due-scan page.
pub const DEFAULT_DUE_PAGE_SIZE: usize = 128;

/// Persistence contract for credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a new record.  The stored copy always starts at version 1.
    async fn insert(&self, record: &CredentialRecord) -> StoreResult<CredentialRecord>;

    /// Fetch a record by id.
    async fn get(&self, id: &str) -> StoreResult<CredentialRecord>;

    /// Replace the record `id` with `new` if its stored version is still
    /// `expected_version`.  Returns the committed record, whose version is
    /// `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &CredentialRecord,
    ) -> StoreResult<CredentialRecord>;

    /// One page of due rows strictly after `after`, in `(rotate_at, id)`
    /// order.  At most `limit` rows are scanned.
    async fn due_page(
        &self,
        before: DateTime<Utc>,
        after: Option<&DuePosition>,
        limit: usize,
    ) -> StoreResult<DuePage>;

    /// Remove the record `id`.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Number of records in each state.
    async fn count_by_state(&self) -> StoreResult<BTreeMap<CredentialState, u64>>;
}

/// Start a due scan over `store` for records due at or before `before`.
pub fn list_due(
    store: Arc<dyn CredentialStore>,
    before: DateTime<Utc>,
    page_size: usize,
) -> DueCursor {
    DueCursor::new(store, before, page_size)
}

// ═══════════════════════════════════════════════════════════════════════
//  Due cursor
// ═══════════════════════════════════════════════════════════════════════

/// Resume point of a [`DueCursor`]: the last record handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuePosition {
    pub rotate_at: DateTime<Utc>,
    pub id: String,
}

/// One page of a due scan.
///
/// `scanned` and `last` describe the rows the query matched, including any
/// whose document could not be parsed and so is missing from `records`.
#[derive(Debug, Clone, Default)]
pub struct DuePage {
    pub records: Vec<CredentialRecord>,
    /// Rows matched by the query.
    pub scanned: usize,
    /// Position of the last matched row; the next page starts after it.
    pub last: Option<DuePosition>,
}

/// Lazy, restartable sequence of due credentials.
pub struct DueCursor {
    store: Arc<dyn CredentialStore>,
    before: DateTime<Utc>,
    page_size: usize,
    position: Option<DuePosition>,
    /// Where the next page query starts.  Runs ahead of `position` past
    /// rows that were matched but not returned.
    page_end: Option<DuePosition>,
    buffer: VecDeque<CredentialRecord>,
    exhausted: bool,
}

impl DueCursor {
    pub fn new(store: Arc<dyn CredentialStore>, before: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            store,
            before,
            page_size: page_size.max(1),
            position: None,
            page_end: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Continue a previous scan after `position`.
    pub fn resume_from(mut self, position: DuePosition) -> Self {
        self.page_end = Some(position.clone());
        self.position = Some(position);
        self.buffer.clear();
        self.exhausted = false;
        self
    }

    /// Position of the last record returned by [`next`](Self::next).
    pub fn position(&self) -> Option<&DuePosition> {
        self.position.as_ref()
    }

    /// Next due record, fetching another page when the buffer runs dry.
    pub async fn next(&mut self) -> StoreResult<Option<CredentialRecord>> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .due_page(self.before, self.page_end.as_ref(), self.page_size)
                .await?;
            self.exhausted = page.scanned < self.page_size;
            if let Some(last) = page.last {
                self.page_end = Some(last);
            } else {
                self.exhausted = true;
            }
            self.buffer.extend(page.records);
        }

        let Some(record) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.position = Some(DuePosition {
            rotate_at: record.rotate_at,
            id: record.id.clone(),
        });
        Ok(Some(record))
    }

    /// Drain the cursor as a stream.
    pub fn into_stream(self) -> impl Stream<Item = StoreResult<CredentialRecord>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            let next = cursor.next().await?;
            Ok::<_, StoreError>(next.map(|record| (record, cursor)))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SQLite implementation
// ═══════════════════════════════════════════════════════════════════════

/// [`CredentialStore`] over the SQLite `credentials` table.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    db: Database,
}

impl SqliteCredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Columns mirrored next to the JSON document.
struct Row {
    id: String,
    kind: &'static str,
    state: &'static str,
    rotate_at: i64,
    expires_at: i64,
    version: i64,
    document: String,
    updated_at: i64,
}

impl Row {
    fn from_record(record: &CredentialRecord) -> StoreResult<Self> {
        Ok(Self {
            id: record.id.clone(),
            kind: record.kind.as_str(),
            state: record.state.as_str(),
            rotate_at: record.rotate_at.timestamp(),
            expires_at: record.expires_at.timestamp(),
            version: to_sql_version(record.version)?,
            document: serde_json::to_string(record)?,
            updated_at: record.updated_at.timestamp(),
        })
    }
}

fn to_sql_version(version: u64) -> StoreResult<i64> {
    i64::try_from(version)
        .map_err(|_| StoreError::InvalidArgument(format!("version {version} out of range")))
}

fn parse_document(document: &str) -> StoreResult<CredentialRecord> {
    Ok(serde_json::from_str(document)?)
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    #[instrument(skip(self, record), fields(credential_id = %record.id, kind = %record.kind))]
    async fn insert(&self, record: &CredentialRecord) -> StoreResult<CredentialRecord> {
        let mut stored = record.clone();
        stored.version = 1;
        let row = Row::from_record(&stored)?;

        self.db
            .execute(move |conn| {
                let result = conn.execute(
                    "INSERT INTO credentials (id, kind, state, rotate_at, expires_at, version, document, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        row.id,
                        row.kind,
                        row.state,
                        row.rotate_at,
                        row.expires_at,
                        row.version,
                        row.document,
                        row.updated_at
                    ],
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation
                            && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                    {
                        Err(StoreError::AlreadyExists {
                            entity: "credential",
                            id: row.id,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        debug!(state = %stored.state, "credential inserted");
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<CredentialRecord> {
        let id = id.to_string();
        let document = self
            .db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT document FROM credentials WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get::<_, String>(0),
                );
                match result {
                    Ok(document) => Ok(document),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        Err(StoreError::credential_not_found(id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        parse_document(&document)
    }

    #[instrument(skip(self, new), fields(credential_id = %id, state = %new.state))]
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &CredentialRecord,
    ) -> StoreResult<CredentialRecord> {
        if new.id != id {
            return Err(StoreError::InvalidArgument(format!(
                "record id {} does not match {id}",
                new.id
            )));
        }

        let mut committed = new.clone();
        committed.version = expected_version + 1;
        let row = Row::from_record(&committed)?;
        let expected = to_sql_version(expected_version)?;

        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE credentials \
                     SET kind = ?1, state = ?2, rotate_at = ?3, expires_at = ?4, version = ?5, \
                         document = ?6, updated_at = ?7 \
                     WHERE id = ?8 AND version = ?9",
                    rusqlite::params![
                        row.kind,
                        row.state,
                        row.rotate_at,
                        row.expires_at,
                        row.version,
                        row.document,
                        row.updated_at,
                        row.id,
                        expected
                    ],
                )?;
                if changed == 1 {
                    return Ok(());
                }

                let actual = conn.query_row(
                    "SELECT version FROM credentials WHERE id = ?1",
                    rusqlite::params![row.id],
                    |r| r.get::<_, i64>(0),
                );
                match actual {
                    Ok(actual) => Err(StoreError::VersionConflict {
                        id: row.id,
                        expected: expected as u64,
                        actual: actual as u64,
                    }),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        Err(StoreError::credential_not_found(row.id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .inspect_err(|e| {
                if matches!(e, StoreError::VersionConflict { .. }) {
                    debug!(%e, "compare-and-swap lost");
                }
            })?;

        debug!(version = committed.version, "credential updated");
        Ok(committed)
    }

    #[instrument(skip(self, after))]
    async fn due_page(
        &self,
        before: DateTime<Utc>,
        after: Option<&DuePosition>,
        limit: usize,
    ) -> StoreResult<DuePage> {
        let before = before.timestamp();
        let (after_ts, after_id) = after
            .map(|p| (p.rotate_at.timestamp(), p.id.clone()))
            .unwrap_or((i64::MIN, String::new()));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<(String, i64, String)> = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, rotate_at, document FROM credentials \
                     WHERE state IN ('pending', 'active', 'rotating') \
                       AND (rotate_at <= ?1 OR expires_at <= ?1) \
                       AND (rotate_at > ?2 OR (rotate_at = ?2 AND id > ?3)) \
                     ORDER BY rotate_at ASC, id ASC \
                     LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![before, after_ts, after_id, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut page = DuePage {
            records: Vec::with_capacity(rows.len()),
            scanned: rows.len(),
            last: None,
        };
        for (id, rotate_at, document) in rows {
            match parse_document(&document) {
                Ok(record) => page.records.push(record),
                Err(e) => warn!(
                    credential_id = %id,
                    error = %e,
                    "skipping unreadable credential document"
                ),
            }
            let rotate_at =
                DateTime::from_timestamp(rotate_at, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
            page.last = Some(DuePosition { rotate_at, id });
        }
        Ok(page)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let changed =
                    conn.execute("DELETE FROM credentials WHERE id = ?1", rusqlite::params![id])?;
                if changed == 0 {
                    return Err(StoreError::credential_not_found(id));
                }
                Ok(())
            })
            .await?;
        debug!("credential deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_by_state(&self) -> StoreResult<BTreeMap<CredentialState, u64>> {
        let rows: Vec<(String, i64)> = self
            .db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT state, COUNT(*) FROM credentials GROUP BY state")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts: BTreeMap<CredentialState, u64> =
            CredentialState::ALL.into_iter().map(|s| (s, 0)).collect();
        for (state, count) in rows {
            counts.insert(state.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
