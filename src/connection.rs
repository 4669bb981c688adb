//! Pooled database connections and the factory that opens them

use crate::config::DatabaseConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::pool::{PooledResource, ResourceFactory};
use crate::random::Random;
use crate::sqlite::{self, ConnectionHandle, StatementHandle, Step, Value};

use hashlink::LinkedHashMap;
use libsqlite3_sys::{
    SQLITE_OPEN_CREATE, SQLITE_OPEN_NOMUTEX, SQLITE_OPEN_READONLY, SQLITE_OPEN_READWRITE,
    SQLITE_OPEN_URI,
};
use parking_lot::Mutex;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest pause between two busy retries
const MAX_BUSY_PAUSE_MILLIS: u64 = 100;

/// What a borrower is about to run, and from where
///
/// Connections that already hold the statement compiled, or that last served
/// the same thread, are preferred over any other idle connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    sql: String,
    thread: ThreadId,
}

impl ConnectionKey {
    /// A key for `sql` run from the calling thread
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            thread: thread::current().id(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// Encryption key material, wiped by [`zero`](Key::zero) or on drop
pub struct Key {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl Key {
    /// Copy `bytes`; the caller keeps ownership of its own buffer
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes.to_vec())),
        }
    }

    /// Run `f` over the key material
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> PoolResult<R> {
        let bytes = self.bytes.lock();
        match bytes.as_deref() {
            Some(bytes) => Ok(f(bytes)),
            None => Err(PoolError::misuse("key has been destroyed")),
        }
    }

    /// Overwrite and forget the key material
    pub fn zero(&self) {
        if let Some(mut bytes) = self.bytes.lock().take() {
            bytes.fill(0);
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.bytes.lock().is_none()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.zero();
    }
}

/// Compiled statements of one connection, least recently used first out
struct StatementCache {
    // Front is least recently used.
    entries: LinkedHashMap<String, StatementHandle>,
    capacity: usize,
}

impl StatementCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            capacity,
        }
    }

    fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    /// Take a statement out; it is unavailable to anyone else until put back
    fn take(&mut self, sql: &str) -> Option<StatementHandle> {
        self.entries.remove(sql)
    }

    /// Cache a statement, finalizing the least recently used ones when full
    fn put(&mut self, sql: String, statement: StatementHandle) {
        self.entries.insert(sql, statement);
        while self.entries.len() > self.capacity {
            if let Some((sql, _)) = self.entries.pop_front() {
                trace!(sql = sql.as_str(), "evicted cached statement");
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One native connection, either the single writer or a read-only reader
pub struct SqlConnection {
    // Declared before the handle so statements are finalized before it closes.
    statements: StatementCache,
    handle: ConnectionHandle,
    primary: bool,
    tag: bool,
    loan: u64,
    last_thread: Option<ThreadId>,
    persistent_statements: bool,
    busy_timeout: Duration,
    random: Arc<dyn Random>,
}

impl SqlConnection {
    /// Open and configure a connection to `path`
    ///
    /// The primary is opened read-write and creates the file if needed; any
    /// other connection is opened read-only.
    pub fn open(
        path: &str,
        primary: bool,
        config: &DatabaseConfiguration,
        key: Option<&Key>,
        random: Arc<dyn Random>,
    ) -> PoolResult<Self> {
        let role = if primary {
            SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE
        } else {
            SQLITE_OPEN_READONLY
        };
        let mut handle = ConnectionHandle::open(path, role | SQLITE_OPEN_NOMUTEX | SQLITE_OPEN_URI)?;

        // The key must be the first statement the connection sees.
        if let Some(key) = key {
            key.with(|bytes| apply_key(&mut handle, bytes))??;
        }
        handle.set_busy_timeout(config.busy_timeout)?;
        handle.exec(&format!(
            "PRAGMA secure_delete={}",
            config.secure_delete.as_str()
        ))?;

        debug!(path, primary, "opened connection");
        Ok(Self {
            statements: StatementCache::new(config.max_sql_cache_size),
            handle,
            primary,
            tag: false,
            loan: 0,
            last_thread: None,
            persistent_statements: config.max_sql_cache_size > 0,
            busy_timeout: config.busy_timeout,
            random,
        })
    }

    /// Optimize and close the connection, ignoring errors from the optimizer
    pub fn close(mut self) {
        self.statements.clear();
        for pragma in ["PRAGMA analysis_limit=100", "PRAGMA optimize"] {
            if let Err(e) = self.handle.exec(pragma) {
                trace!(error = %e, pragma, "ignoring failure before close");
            }
        }
        debug!(primary = self.primary, "closing connection");
    }

    /// Whether the connection is inside an explicit transaction
    pub fn in_transaction(&self) -> bool {
        self.handle.in_transaction()
    }

    /// Statements currently compiled and cached
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    /// The engine's bound on host parameters per statement
    pub fn max_bound_parameters(&self) -> usize {
        self.handle.max_variable_number()
    }

    /// Take the compiled form of `sql` out of the cache, compiling it if absent
    ///
    /// Give it back with [`restore_statement`](Self::restore_statement).
    pub(crate) fn take_statement(&mut self, sql: &str) -> PoolResult<StatementHandle> {
        self.last_thread = Some(thread::current().id());
        match self.statements.take(sql) {
            Some(statement) => Ok(statement),
            None => self.handle.prepare(sql, self.persistent_statements),
        }
    }

    /// Reset a statement and cache it again, or drop it if it will not reset
    pub(crate) fn restore_statement(&mut self, sql: &str, mut statement: StatementHandle) {
        match statement.reset() {
            Ok(()) => {
                statement.clear_bindings();
                self.statements.put(sql.to_string(), statement);
            }
            Err(e) => trace!(error = %e, sql, "evicting statement that failed to reset"),
        }
    }

    fn with_statement<R>(
        &mut self,
        sql: &str,
        f: impl FnOnce(&mut StatementHandle, &Self) -> PoolResult<R>,
    ) -> PoolResult<R> {
        let mut statement = self.take_statement(sql)?;
        let result = f(&mut statement, self).map_err(|e| e.with_sql(sql));
        self.restore_statement(sql, statement);
        result
    }

    /// Whether the engine judges `sql` free of writes
    pub fn is_read_only_statement(&mut self, sql: &str) -> PoolResult<bool> {
        self.with_statement(sql, |statement, _| Ok(statement.is_read_only()))
    }

    /// Parameter count and column names of `sql`
    pub fn describe(&mut self, sql: &str) -> PoolResult<(usize, Vec<String>)> {
        self.with_statement(sql, |statement, _| {
            let columns = (0..statement.column_count())
                .map(|index| statement.column_name(index))
                .collect();
            Ok((statement.parameter_count(), columns))
        })
    }

    /// Run `sql` to completion, discarding any rows
    pub fn execute(&mut self, sql: &str, args: &[Value]) -> PoolResult<()> {
        self.with_statement(sql, |statement, _| {
            statement.bind_all(args)?;
            drain(statement)
        })
    }

    /// Run `sql` to completion and report the rows it changed
    pub fn execute_for_changed_rows(&mut self, sql: &str, args: &[Value]) -> PoolResult<usize> {
        self.with_statement(sql, |statement, connection| {
            statement.bind_all(args)?;
            drain(statement)?;
            Ok(connection.changes_of(statement))
        })
    }

    /// Run an insert and report its row id, or -1 if nothing was inserted
    pub fn execute_for_last_insert_rowid(&mut self, sql: &str, args: &[Value]) -> PoolResult<i64> {
        self.with_statement(sql, |statement, connection| {
            statement.bind_all(args)?;
            drain(statement)?;
            if connection.changes_of(statement) > 0 {
                Ok(connection.handle.last_insert_rowid())
            } else {
                Ok(-1)
            }
        })
    }

    /// First column of the first row as an integer
    pub fn execute_for_long(&mut self, sql: &str, args: &[Value]) -> PoolResult<Option<i64>> {
        self.execute_for_first_value(sql, args)
            .map(|value| value.and_then(|value| long_of(&value)))
    }

    /// First column of the first row as text
    pub fn execute_for_string(&mut self, sql: &str, args: &[Value]) -> PoolResult<Option<String>> {
        self.execute_for_first_value(sql, args)
            .map(|value| value.and_then(|value| value.to_text()))
    }

    fn execute_for_first_value(&mut self, sql: &str, args: &[Value]) -> PoolResult<Option<Value>> {
        self.with_statement(sql, |statement, _| {
            statement.bind_all(args)?;
            match statement.step()? {
                Step::Row if statement.column_count() > 0 => Ok(Some(statement.column(0))),
                _ => Ok(None),
            }
        })
    }

    /// Run `sql` once per row of `rows` and sum the rows changed
    pub fn execute_batch<I>(&mut self, sql: &str, rows: I) -> PoolResult<usize>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        self.with_statement(sql, |statement, connection| {
            let mut changed = 0;
            for row in rows {
                statement.reset()?;
                statement.bind_all(&row)?;
                drain(statement)?;
                changed += connection.changes_of(statement);
            }
            Ok(changed)
        })
    }

    /// Run an argument-free statement, retrying while the database is busy
    ///
    /// Between attempts the thread sleeps `1 + random(min(100, remaining))`
    /// milliseconds, until the busy timeout is spent.
    pub fn execute_with_retry(&mut self, sql: &str) -> PoolResult<()> {
        let deadline = Instant::now() + self.busy_timeout;
        self.with_statement(sql, |statement, connection| {
            loop {
                let error = match drain(statement) {
                    Ok(()) => return Ok(()),
                    Err(e) if is_busy(&e) => e,
                    Err(e) => return Err(e),
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < Duration::from_millis(1) {
                    return Err(error);
                }
                let bound = (remaining.as_millis() as u64).min(MAX_BUSY_PAUSE_MILLIS);
                let pause = Duration::from_millis(1 + connection.random.next_below(bound));
                trace!(sql, ?pause, "database busy, retrying");
                thread::sleep(pause);
                // Reset reports the busy error of the failed step again.
                let _ = statement.reset();
            }
        })
    }

    fn changes_of(&self, statement: &StatementHandle) -> usize {
        if statement.is_read_only() {
            0
        } else {
            self.handle.changes()
        }
    }
}

impl fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConnection")
            .field("primary", &self.primary)
            .field("tag", &self.tag)
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}

impl PooledResource<ConnectionKey> for SqlConnection {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn matches(&self, key: &ConnectionKey) -> bool {
        self.statements.contains(&key.sql) || self.last_thread == Some(key.thread)
    }

    fn tag(&self) -> bool {
        self.tag
    }

    fn set_tag(&mut self, tag: bool) {
        self.tag = tag;
    }

    fn loan(&self) -> u64 {
        self.loan
    }

    fn set_loan(&mut self, loan: u64) {
        self.loan = loan;
    }

    fn release_memory(&mut self) {
        self.statements.clear();
        self.handle.release_memory();
    }
}

/// Step until the statement is done, ignoring any rows
fn drain(statement: &mut StatementHandle) -> PoolResult<()> {
    while statement.step()? == Step::Row {}
    Ok(())
}

fn is_busy(error: &PoolError) -> bool {
    error
        .native_code()
        .is_some_and(|code| sqlite::primary_code(code) == sqlite::SQLITE_BUSY)
}

fn long_of(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(*v),
        Value::Real(v) => Some(*v as i64),
        Value::Text(v) => v.trim().parse().ok(),
        _ => None,
    }
}

fn apply_key(handle: &mut ConnectionHandle, key: &[u8]) -> PoolResult<()> {
    let mut pragma = String::with_capacity(20 + key.len() * 2);
    pragma.push_str("PRAGMA key=\"x'");
    for byte in key {
        let _ = write!(pragma, "{byte:02X}");
    }
    pragma.push_str("'\"");

    let result = handle.exec(&pragma).map_err(|e| match e {
        // Never let the key travel inside an error.
        PoolError::NativeCallFailed { code, message, .. } => PoolError::NativeCallFailed {
            code,
            message,
            sql: None,
        },
        other => other,
    });
    pragma.into_bytes().fill(0);
    result
}

/// Opens the connections of one database file
pub struct SqlConnectionFactory {
    path: String,
    config: DatabaseConfiguration,
    key: Option<Key>,
    random: Arc<dyn Random>,
}

impl SqlConnectionFactory {
    pub fn new(
        path: impl Into<String>,
        config: DatabaseConfiguration,
        key: Option<&[u8]>,
        random: Arc<dyn Random>,
    ) -> Self {
        Self {
            path: path.into(),
            config,
            key: key.map(Key::new),
            random,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open(&self, primary: bool) -> PoolResult<SqlConnection> {
        SqlConnection::open(
            &self.path,
            primary,
            &self.config,
            self.key.as_ref(),
            Arc::clone(&self.random),
        )
    }
}

impl ResourceFactory<SqlConnection> for SqlConnectionFactory {
    fn make_object(&self) -> PoolResult<SqlConnection> {
        self.open(false)
    }

    fn make_primary_object(&self) -> PoolResult<SqlConnection> {
        self.open(true)
    }

    fn destroy_object(&self, connection: SqlConnection) -> PoolResult<()> {
        connection.close();
        Ok(())
    }

    fn close(&self) {
        if let Some(key) = &self.key {
            key.zero();
        }
    }
}
