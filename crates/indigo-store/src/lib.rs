//! # indigo-store
//!
//! Credential persistence for Indigo.
//!
//! Records live as JSON documents in a SQLite table, with the fields used for
//! scheduling and concurrency control mirrored into indexed columns.  Writes
//! after the first insert are version-conditioned (`UPDATE ... WHERE id = ?
//! AND version = ?`), so concurrent workers can share the table without
//! in-process locks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  CredentialStore trait (insert/get/CAS/...) │
//! │  DueCursor (paged, restartable due scan)    │
//! ├─────────────────────────────────────────────┤
//! │  SqliteCredentialStore                      │
//! ├─────────────────────────────────────────────┤
//! │  Database (rusqlite, WAL, secure_delete)    │
//! │  Migrations (versioned, transactional)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use indigo_store::{Database, SqliteCredentialStore, list_due};
//!
//! let db = Database::open_and_migrate("data/indigo.db").await?;
//! let store = Arc::new(SqliteCredentialStore::new(db));
//! let mut due = list_due(store, chrono::Utc::now(), 128);
//! while let Some(record) = due.next().await? {
//!     println!("{} is due", record.id);
//! }
//! ```

pub mod credential_store;
pub mod db;
pub mod error;
pub mod migration;
pub mod record;

// ── re-exports ───────────────────────────────────────────────────────

pub use credential_store::{
    CredentialStore, DEFAULT_DUE_PAGE_SIZE, DueCursor, DuePage, DuePosition, SqliteCredentialStore,
    list_due,
};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use record::{
    CredentialRecord, CredentialState, ReasonCode, credential_aad, to_store_precision,
};

pub use indigo_vault::{CredentialKind, Envelope, Scope};
