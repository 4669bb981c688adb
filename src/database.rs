//! The database facade: statement routing, batches and transactions

use crate::config::{DatabaseConfiguration, JournalMode};
use crate::connection::{ConnectionKey, SqlConnection, SqlConnectionFactory};
use crate::cursor::{Cursor, CursorSource};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::pool::{Lease, ObjectPool, PooledResource, Priority, create_object_pool};
use crate::random::{Random, ThreadRandom};
use crate::sqlite::Value;
use crate::statement::{
    ConflictAlgorithm, InsertTemplate, SqlStatement, StatementType, delete_sql, insert_sql,
    update_sql, upsert_sql,
};

use dashmap::DashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How a transaction takes its locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionMode {
    /// Lock lazily on first read or write
    Deferred,
    /// Take the write lock up front
    Immediate,
    #[default]
    Exclusive,
}

impl TransactionMode {
    fn begin_sql(&self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN DEFERRED TRANSACTION",
            TransactionMode::Immediate => "BEGIN IMMEDIATE TRANSACTION",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
        }
    }
}

const COMMIT: &str = "END";
const ROLLBACK: &str = "ROLLBACK";

/// A pooled connection held for one unit of work
///
/// A connection handed back while a transaction is still open is rolled back
/// first, so a panicking transaction body never leaks its writes.
pub(crate) struct ConnectionLease<'a> {
    lease: Lease<'a, ConnectionKey, SqlConnection>,
    writer: Option<(&'a DashSet<ThreadId>, ThreadId)>,
}

impl Deref for ConnectionLease<'_> {
    type Target = SqlConnection;

    fn deref(&self) -> &Self::Target {
        &self.lease
    }
}

impl DerefMut for ConnectionLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.lease
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if self.lease.in_transaction() {
            warn!("connection returned inside a transaction, rolling back");
            rollback_quietly(&mut self.lease);
        }
        if let Some((writers, thread)) = self.writer {
            writers.remove(&thread);
        }
    }
}

/// A pooled SQLite database
///
/// One connection is the writer; under write-ahead logging the others are
/// read-only and serve queries concurrently with it.
///
/// # Examples
///
/// ```
/// use esox_sqlpool::{JournalMode, SqlDatabase, Value};
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("example.db");
/// let db = SqlDatabase::open_with_journal_mode(path.to_str().unwrap(), JournalMode::Wal).unwrap();
///
/// db.exec("CREATE TABLE fruit (name TEXT)", &[]).unwrap();
/// db.batch(
///     "INSERT INTO fruit VALUES (?)",
///     ["apple", "pear"].into_iter().map(|name| vec![Value::from(name)]),
/// )
/// .unwrap();
///
/// let names: Vec<String> = db
///     .query("SELECT name FROM fruit ORDER BY name", &[])
///     .unwrap()
///     .map(|row| row.unwrap().get(0).and_then(Value::as_str).unwrap().to_string())
///     .collect();
/// assert_eq!(names, ["apple", "pear"]);
/// db.close();
/// ```
pub struct SqlDatabase {
    path: String,
    journal_mode: JournalMode,
    config: DatabaseConfiguration,
    pool: Box<dyn ObjectPool<ConnectionKey, SqlConnection>>,
    writers: DashSet<ThreadId>,
    max_bound_parameters: usize,
}

impl SqlDatabase {
    /// Open the database at `path`, creating it if needed
    ///
    /// The writer connection is opened straight away and switches the file
    /// to `journal_mode`. Readers are opened on demand.
    pub fn open(
        path: impl Into<String>,
        journal_mode: JournalMode,
        config: DatabaseConfiguration,
        key: Option<&[u8]>,
        random: Arc<dyn Random>,
    ) -> PoolResult<Self> {
        let path = path.into();
        let factory = SqlConnectionFactory::new(path.clone(), config.clone(), key, random);
        let pool = create_object_pool::<ConnectionKey, SqlConnection>(
            Arc::new(factory),
            config.to_pool_configuration(),
        )?;

        let mut database = Self {
            path,
            journal_mode,
            max_bound_parameters: config.max_bound_parameters,
            config,
            pool,
            writers: DashSet::new(),
        };
        let (mode, native_limit) = database.with_writer(|connection| {
            let pragma = format!("PRAGMA journal_mode={}", journal_mode.as_str());
            let mode = connection.execute_for_string(&pragma, &[])?;
            Ok((mode, connection.max_bound_parameters()))
        })?;
        database.max_bound_parameters = database.max_bound_parameters.min(native_limit);

        debug!(
            path = %database.path,
            journal_mode = mode.as_deref().unwrap_or("unknown"),
            pool_size = database.config.max_connection_pool_size,
            "opened database"
        );
        Ok(database)
    }

    /// Open with the default configuration of `journal_mode`, no key, and
    /// thread-local randomness
    pub fn open_with_journal_mode(path: impl Into<String>, journal_mode: JournalMode) -> PoolResult<Self> {
        Self::open(
            path,
            journal_mode,
            journal_mode.database_configuration(),
            None,
            Arc::new(ThreadRandom),
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    pub fn configuration(&self) -> &DatabaseConfiguration {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Run one statement, returning the number of rows it changed
    ///
    /// Transaction control statements are rejected; use
    /// [`transact`](Self::transact) instead.
    pub fn exec(&self, sql: &str, args: &[Value]) -> PoolResult<usize> {
        let kind = checked_type(sql)?;
        self.with_connection(sql, kind.is_predicted_write(), |connection| {
            connection.execute_for_changed_rows(sql, args)
        })
    }

    /// Run an insert, returning the new row id or -1 if no row was inserted
    pub fn execute_insert(&self, sql: &str, args: &[Value]) -> PoolResult<i64> {
        let kind = checked_type(sql)?;
        self.with_connection(sql, kind.is_predicted_write(), |connection| {
            connection.execute_for_last_insert_rowid(sql, args)
        })
    }

    /// Start a query; its rows are stepped as the cursor is iterated
    pub fn query(&self, sql: &str, args: &[Value]) -> PoolResult<Cursor<'_>> {
        let kind = checked_type(sql)?;
        let connection = self.route(sql, kind.is_predicted_write())?;
        Cursor::open(CursorSource::Pooled(connection), sql, args)
    }

    /// First column of the first row as an integer
    pub fn query_for_long(&self, sql: &str, args: &[Value]) -> PoolResult<Option<i64>> {
        let kind = checked_type(sql)?;
        self.with_connection(sql, kind.is_predicted_write(), |connection| {
            connection.execute_for_long(sql, args)
        })
    }

    /// First column of the first row as text
    pub fn query_for_string(&self, sql: &str, args: &[Value]) -> PoolResult<Option<String>> {
        let kind = checked_type(sql)?;
        self.with_connection(sql, kind.is_predicted_write(), |connection| {
            connection.execute_for_string(sql, args)
        })
    }

    /// Run an update once per row of `rows` inside one transaction
    ///
    /// The whole batch holds the writer once. A single-row
    /// `INSERT ... VALUES (?, ...)` is widened to insert as many rows per
    /// statement as the bound-parameter limit allows. Returns the total number
    /// of rows changed; on failure nothing is applied.
    pub fn batch<I>(&self, sql: &str, rows: I) -> PoolResult<usize>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        checked_update(sql)?;
        let mut writer = self.writer()?;
        writer.execute_with_retry(TransactionMode::Immediate.begin_sql())?;
        let result = apply_batch(&mut writer, sql, rows, self.max_bound_parameters);
        match result {
            Ok(changed) => {
                commit(&mut writer)?;
                Ok(changed)
            }
            Err(e) => {
                debug!(error = %e, sql, "rolling back failed batch");
                rollback_quietly(&mut writer);
                Err(e)
            }
        }
    }

    /// Compile `sql` for repeated execution, binding `args` to its first
    /// parameters
    pub fn compile_statement(&self, sql: &str, args: &[Value]) -> PoolResult<SqlStatement<'_>> {
        let kind = checked_type(sql)?;
        let (read_only, (parameters, columns)) =
            self.with_connection(sql, kind.is_predicted_write(), |connection| {
                Ok((
                    connection.is_read_only_statement(sql)?,
                    connection.describe(sql)?,
                ))
            })?;
        SqlStatement::new(self, sql, read_only, parameters, columns, args)
    }

    /// Run `body` inside a transaction on the writer
    ///
    /// The transaction commits when `body` returns `Ok` and rolls back when it
    /// returns `Err` or panics. It also rolls back, with
    /// [`PoolError::TransactionRolledBack`], when a nested
    /// [`Transaction::transact`] failed. The writer is held for the whole call.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sqlpool::{PoolError, JournalMode, SqlDatabase, TransactionMode};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let path = dir.path().join("transact.db");
    /// let db = SqlDatabase::open_with_journal_mode(path.to_str().unwrap(), JournalMode::Wal).unwrap();
    /// db.exec("CREATE TABLE t (a INTEGER)", &[]).unwrap();
    ///
    /// let result: std::result::Result<(), PoolError> = db.transact(TransactionMode::Immediate, |tx| {
    ///     tx.exec("INSERT INTO t VALUES (1)", &[])?;
    ///     Err(PoolError::Misuse("changed my mind".into()))
    /// });
    /// assert!(result.is_err());
    /// assert_eq!(db.query_for_long("SELECT count(*) FROM t", &[]).unwrap(), Some(0));
    /// ```
    pub fn transact<R, E, F>(&self, mode: TransactionMode, body: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<R, E>,
        E: From<PoolError>,
    {
        let mut writer = self.writer()?;
        writer.execute_with_retry(mode.begin_sql())?;

        let mut transaction = Transaction {
            connection: &mut *writer,
            max_bound_parameters: self.max_bound_parameters,
            mode,
            depth: 1,
            rollback_only: false,
        };
        let outcome = body(&mut transaction);
        let rollback_only = transaction.rollback_only;
        match outcome {
            Ok(_) if rollback_only => {
                debug!("rolling back transaction after a nested failure");
                rollback_quietly(&mut writer);
                Err(PoolError::TransactionRolledBack.into())
            }
            Ok(value) => {
                commit(&mut writer)?;
                Ok(value)
            }
            Err(e) => {
                debug!("rolling back transaction");
                rollback_quietly(&mut writer);
                Err(e)
            }
        }
    }

    /// Insert one row built from `values`, returning its row id or -1 if the
    /// conflict algorithm skipped it
    pub fn insert(
        &self,
        table: &str,
        values: &[(&str, Value)],
        conflict: ConflictAlgorithm,
    ) -> PoolResult<i64> {
        let (sql, args) = insert_sql(table, values, conflict)?;
        self.with_writer(|connection| connection.execute_for_last_insert_rowid(&sql, &args))
    }

    /// Set `values` on the rows matching `where_clause`, returning how many
    /// changed
    pub fn update(
        &self,
        table: &str,
        values: &[(&str, Value)],
        where_clause: &str,
        where_args: &[Value],
        conflict: ConflictAlgorithm,
    ) -> PoolResult<usize> {
        let (sql, args) = update_sql(table, values, where_clause, where_args, conflict)?;
        self.with_writer(|connection| connection.execute_for_changed_rows(&sql, &args))
    }

    /// Delete the rows matching `where_clause`, or every row if it is empty
    pub fn delete(&self, table: &str, where_clause: &str, where_args: &[Value]) -> PoolResult<usize> {
        let sql = delete_sql(table, where_clause);
        self.with_writer(|connection| connection.execute_for_changed_rows(&sql, where_args))
    }

    /// Insert `values`, or run `update` against the existing row when it
    /// collides on `conflict_columns`
    pub fn upsert(
        &self,
        table: &str,
        values: &[(&str, Value)],
        conflict_columns: &[&str],
        update: &str,
    ) -> PoolResult<i64> {
        let (sql, args) = upsert_sql(table, values, conflict_columns, update)?;
        self.with_writer(|connection| connection.execute_for_last_insert_rowid(&sql, &args))
    }

    /// Whether the calling thread holds the writer, as it does inside
    /// [`transact`](Self::transact)
    pub fn in_transaction(&self) -> bool {
        self.writers.contains(&thread::current().id())
    }

    /// The schema version kept in `PRAGMA user_version`
    pub fn version(&self) -> PoolResult<i32> {
        let version = self.query_for_long("PRAGMA user_version", &[])?;
        Ok(version.unwrap_or(0) as i32)
    }

    pub fn set_version(&self, version: i32) -> PoolResult<()> {
        self.exec(&format!("PRAGMA user_version={version}"), &[])
            .map(|_| ())
    }

    /// Read `PRAGMA key`
    pub fn pragma(&self, key: &str) -> PoolResult<Option<String>> {
        self.query_for_string(&format!("PRAGMA {key}"), &[])
    }

    /// Run `PRAGMA key=value`, returning whatever the pragma reports
    pub fn set_pragma(&self, key: &str, value: impl fmt::Display) -> PoolResult<Option<String>> {
        self.query_for_string(&format!("PRAGMA {key}={value}"), &[])
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Give memory back: shrink idle connections, or with
    /// [`Priority::High`] close them
    pub fn clear(&self, priority: Priority) {
        self.pool.clear(priority);
    }

    /// Close every connection; idempotent
    pub fn close(&self) {
        self.pool.close();
        debug!(path = %self.path, "closed database");
    }

    /// Run `f` on a connection fit for `sql`
    pub(crate) fn with_connection<R>(
        &self,
        sql: &str,
        write: bool,
        f: impl FnOnce(&mut SqlConnection) -> PoolResult<R>,
    ) -> PoolResult<R> {
        let mut connection = self.route(sql, write)?;
        f(&mut *connection)
    }

    fn with_writer<R>(&self, f: impl FnOnce(&mut SqlConnection) -> PoolResult<R>) -> PoolResult<R> {
        let mut writer = self.writer()?;
        f(&mut *writer)
    }

    /// Pick the connection for `sql`
    ///
    /// Predicted writes go to the writer. Anything else goes to a reader,
    /// unless the engine reports the compiled statement would write.
    fn route(&self, sql: &str, write: bool) -> PoolResult<ConnectionLease<'_>> {
        if write {
            return self.writer();
        }
        let mut reader = self.reader(sql)?;
        if reader.is_primary() || reader.is_read_only_statement(sql)? {
            return Ok(reader);
        }
        drop(reader);
        trace!(sql, "rerouting statement to the writer");
        self.writer()
    }

    fn reader(&self, sql: &str) -> PoolResult<ConnectionLease<'_>> {
        if self.config.max_connection_pool_size == 1 {
            return self.writer();
        }
        let key = ConnectionKey::new(sql);
        let connection = match self.config.borrow_wait_timeout {
            Some(timeout) => self.pool.borrow_object_timeout(&key, timeout),
            None => self.pool.borrow_object(&key),
        }?;
        Ok(ConnectionLease {
            lease: Lease::new(&*self.pool, connection),
            writer: None,
        })
    }

    fn writer(&self) -> PoolResult<ConnectionLease<'_>> {
        let thread = thread::current().id();
        if !self.writers.insert(thread) {
            return Err(PoolError::misuse(
                "the calling thread already holds the writer connection",
            ));
        }
        let borrowed = match self.config.borrow_wait_timeout {
            Some(timeout) => self.pool.borrow_primary_object_timeout(timeout),
            None => self.pool.borrow_primary_object(),
        };
        match borrowed {
            Ok(connection) => Ok(ConnectionLease {
                lease: Lease::new(&*self.pool, connection),
                writer: Some((&self.writers, thread)),
            }),
            Err(e) => {
                self.writers.remove(&thread);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for SqlDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlDatabase")
            .field("path", &self.path)
            .field("journal_mode", &self.journal_mode)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Statements run inside [`SqlDatabase::transact`], all on the writer
///
/// Nested [`transact`](Self::transact) calls join this transaction. A failed
/// nested body marks the whole transaction for rollback.
pub struct Transaction<'t> {
    connection: &'t mut SqlConnection,
    max_bound_parameters: usize,
    mode: TransactionMode,
    depth: usize,
    rollback_only: bool,
}

impl Transaction<'_> {
    /// Run `body` as a nested transaction
    ///
    /// Nothing commits until the outermost body returns. If `body` returns
    /// `Err` the error is passed back and the outermost transaction rolls
    /// back even if its own body then succeeds.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sqlpool::{JournalMode, PoolError, SqlDatabase, TransactionMode};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let path = dir.path().join("nested.db");
    /// let db = SqlDatabase::open_with_journal_mode(path.to_str().unwrap(), JournalMode::Wal).unwrap();
    /// db.exec("CREATE TABLE t (a INTEGER)", &[]).unwrap();
    ///
    /// let result: std::result::Result<(), PoolError> = db.transact(TransactionMode::Exclusive, |tx| {
    ///     tx.exec("INSERT INTO t VALUES (1)", &[])?;
    ///     let inner: std::result::Result<(), PoolError> = tx.transact(|tx| {
    ///         tx.exec("INSERT INTO t VALUES (2)", &[])?;
    ///         Err(PoolError::Misuse("abandon".into()))
    ///     });
    ///     assert!(inner.is_err());
    ///     Ok(())
    /// });
    /// assert_eq!(result, Err(PoolError::TransactionRolledBack));
    /// assert_eq!(db.query_for_long("SELECT count(*) FROM t", &[]).unwrap(), Some(0));
    /// ```
    pub fn transact<R, E, F>(&mut self, body: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<R, E>,
    {
        self.depth += 1;
        let outcome = body(self);
        self.depth -= 1;
        if outcome.is_err() {
            debug!(depth = self.depth + 1, "nested transaction failed");
            self.rollback_only = true;
        }
        outcome
    }

    /// Nesting level, 1 for the outermost body
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether a nested failure has doomed this transaction
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Commit the work so far and begin again in the same mode, sleeping for
    /// `pause` in between
    ///
    /// Readers and other processes see the committed work at once. The writer
    /// stays with the caller throughout. A transaction already marked for
    /// rollback cannot yield.
    pub fn yield_transaction(&mut self, pause: Duration) -> PoolResult<()> {
        if self.rollback_only {
            return Err(PoolError::misuse(
                "a transaction marked for rollback cannot yield",
            ));
        }
        if let Err(e) = commit(self.connection) {
            self.rollback_only = true;
            return Err(e);
        }
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        if let Err(e) = self.connection.execute_with_retry(self.mode.begin_sql()) {
            self.rollback_only = true;
            return Err(e);
        }
        trace!(depth = self.depth, "yielded transaction");
        Ok(())
    }

    pub fn insert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        conflict: ConflictAlgorithm,
    ) -> PoolResult<i64> {
        let (sql, args) = insert_sql(table, values, conflict)?;
        self.connection.execute_for_last_insert_rowid(&sql, &args)
    }

    pub fn update(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        where_clause: &str,
        where_args: &[Value],
        conflict: ConflictAlgorithm,
    ) -> PoolResult<usize> {
        let (sql, args) = update_sql(table, values, where_clause, where_args, conflict)?;
        self.connection.execute_for_changed_rows(&sql, &args)
    }

    pub fn delete(&mut self, table: &str, where_clause: &str, where_args: &[Value]) -> PoolResult<usize> {
        let sql = delete_sql(table, where_clause);
        self.connection.execute_for_changed_rows(&sql, where_args)
    }

    pub fn upsert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        conflict_columns: &[&str],
        update: &str,
    ) -> PoolResult<i64> {
        let (sql, args) = upsert_sql(table, values, conflict_columns, update)?;
        self.connection.execute_for_last_insert_rowid(&sql, &args)
    }

    /// Run one statement, returning the number of rows it changed
    pub fn exec(&mut self, sql: &str, args: &[Value]) -> PoolResult<usize> {
        checked_type(sql)?;
        self.connection.execute_for_changed_rows(sql, args)
    }

    pub fn execute_insert(&mut self, sql: &str, args: &[Value]) -> PoolResult<i64> {
        checked_type(sql)?;
        self.connection.execute_for_last_insert_rowid(sql, args)
    }

    /// Start a query on the transaction's connection
    ///
    /// Reads see the transaction's own uncommitted writes.
    pub fn query(&mut self, sql: &str, args: &[Value]) -> PoolResult<Cursor<'_>> {
        checked_type(sql)?;
        Cursor::open(CursorSource::Scoped(&mut *self.connection), sql, args)
    }

    pub fn query_for_long(&mut self, sql: &str, args: &[Value]) -> PoolResult<Option<i64>> {
        checked_type(sql)?;
        self.connection.execute_for_long(sql, args)
    }

    pub fn query_for_string(&mut self, sql: &str, args: &[Value]) -> PoolResult<Option<String>> {
        checked_type(sql)?;
        self.connection.execute_for_string(sql, args)
    }

    /// Run an update once per row of `rows`, as [`SqlDatabase::batch`] does
    pub fn batch<I>(&mut self, sql: &str, rows: I) -> PoolResult<usize>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        checked_update(sql)?;
        apply_batch(self.connection, sql, rows, self.max_bound_parameters)
    }

    pub fn in_transaction(&self) -> bool {
        self.connection.in_transaction()
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection", &self.connection)
            .field("mode", &self.mode)
            .field("depth", &self.depth)
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}

fn checked_type(sql: &str) -> PoolResult<StatementType> {
    let kind = StatementType::of(sql);
    if kind.is_transaction_control() {
        return Err(PoolError::misuse(format!(
            "transaction control is only available through transact: {sql}"
        )));
    }
    Ok(kind)
}

fn checked_update(sql: &str) -> PoolResult<()> {
    if StatementType::of(sql) != StatementType::Update {
        return Err(PoolError::misuse(format!(
            "only batched updates are permitted: {sql}"
        )));
    }
    Ok(())
}

/// Run `sql` over `rows`, widening single-row inserts into multi-row ones
///
/// Rows are buffered one chunk at a time. Full chunks run as one statement of
/// `chunk` value groups, and the remainder as one statement of its own size.
fn apply_batch<I>(
    connection: &mut SqlConnection,
    sql: &str,
    rows: I,
    max_bound_parameters: usize,
) -> PoolResult<usize>
where
    I: IntoIterator<Item = Vec<Value>>,
{
    let Some(template) = InsertTemplate::parse(sql) else {
        return connection.execute_batch(sql, rows);
    };
    let chunk = max_bound_parameters / template.parameters();
    if chunk < 2 {
        return connection.execute_batch(sql, rows);
    }

    let mut rows = rows.into_iter();
    let mut buffer: Vec<Vec<Value>> = rows.by_ref().take(chunk).collect();
    if buffer.len() < chunk {
        return connection.execute_batch(sql, buffer);
    }

    let chunk_sql = template.with_rows(chunk);
    let mut changed = 0;
    while buffer.len() == chunk {
        let args = template.flatten(buffer.drain(..))?;
        changed += connection.execute_batch(&chunk_sql, [args])?;
        buffer.extend(rows.by_ref().take(chunk));
    }
    if !buffer.is_empty() {
        let remainder_sql = template.with_rows(buffer.len());
        let args = template.flatten(buffer)?;
        changed += connection.execute_batch(&remainder_sql, [args])?;
    }
    trace!(sql, changed, chunk, "applied widened batch");
    Ok(changed)
}

fn commit(connection: &mut SqlConnection) -> PoolResult<()> {
    if let Err(e) = connection.execute_with_retry(COMMIT) {
        debug!(error = %e, "commit failed, rolling back");
        rollback_quietly(connection);
        return Err(e);
    }
    Ok(())
}

fn rollback_quietly(connection: &mut SqlConnection) {
    if !connection.in_transaction() {
        return;
    }
    if let Err(e) = connection.execute(ROLLBACK, &[]) {
        warn!(error = %e, "rollback failed");
    }
}
