//! # esox_sqlpool
//!
//! Thread-safe SQLite connection pooling: one writer, many write-ahead-log
//! readers, prepared-statement caching, batching and transactions.
//!
//! ## Features
//!
//! - Keyed object pools with a dedicated primary (writer) slot
//! - Blocking and bounded borrows, with fair hand-off to waiting borrowers
//! - Idle eviction on a shared background scheduler
//! - Automatic return of connections via RAII (Drop trait)
//! - Per-connection LRU cache of prepared statements
//! - Multi-row insert flattening for large batches
//! - Nested transactions with commit on success and rollback on failure
//! - Insert, update, delete and upsert helpers with conflict algorithms
//! - Metrics with Prometheus text export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_sqlpool::{JournalMode, SqlDatabase, TransactionMode, Value};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("quick.db");
//! let db = SqlDatabase::open_with_journal_mode(path.to_str().unwrap(), JournalMode::Wal).unwrap();
//!
//! db.exec("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", &[]).unwrap();
//! db.transact(TransactionMode::Immediate, |tx| {
//!     tx.exec("INSERT INTO kv VALUES (?, ?)", &["a".into(), 1.into()])?;
//!     tx.exec("INSERT INTO kv VALUES (?, ?)", &["b".into(), 2.into()])
//! })
//! .unwrap();
//!
//! let total = db.query_for_long("SELECT sum(v) FROM kv", &[]).unwrap();
//! assert_eq!(total, Some(3));
//! ```

mod config;
mod connection;
mod cursor;
mod database;
mod errors;
mod eviction;
mod metrics;
mod pool;
mod random;
pub mod sqlite;
mod statement;

pub use config::{
    COMMON_BUSY_TIMEOUT, DEFAULT_MAX_BOUND_PARAMETERS, DatabaseConfiguration, JournalMode,
    PoolConfiguration, SecureDelete,
};
pub use connection::{ConnectionKey, Key, SqlConnection, SqlConnectionFactory};
pub use cursor::Cursor;
pub use database::{SqlDatabase, Transaction, TransactionMode};
pub use errors::{PoolError, PoolResult};
pub use eviction::{EvictionHandle, EvictionScheduler};
pub use metrics::PoolMetrics;
pub use pool::{
    BORROW_WAIT_SLICE, CommonObjectPool, Lease, ObjectPool, PooledResource, Priority,
    ResourceFactory, SingleObjectPool, create_object_pool,
};
pub use random::{Random, ThreadRandom};
pub use sqlite::{Row, Value};
pub use statement::{ConflictAlgorithm, SqlStatement, StatementType};
