use super::statement::StatementHandle;
use super::{error_from_code, last_error};
use crate::errors::{PoolError, PoolResult};

use libsqlite3_sys::{
    SQLITE_LIMIT_VARIABLE_NUMBER, SQLITE_OK, SQLITE_PREPARE_PERSISTENT, sqlite3, sqlite3_busy_timeout,
    sqlite3_changes, sqlite3_close, sqlite3_db_release_memory, sqlite3_exec,
    sqlite3_extended_result_codes, sqlite3_get_autocommit, sqlite3_last_insert_rowid, sqlite3_limit,
    sqlite3_open_v2, sqlite3_prepare_v3,
};
use std::ffi::{CString, c_char, c_int};
use std::ptr::{self, NonNull};
use std::time::Duration;

/// An open native database connection, closed on drop
#[derive(Debug)]
pub(crate) struct ConnectionHandle(NonNull<sqlite3>);

// A connection may move between threads as long as one thread uses it at a
// time, which the pool guarantees by lending it to one borrower at a time.
unsafe impl Send for ConnectionHandle {}

impl ConnectionHandle {
    pub(crate) fn open(path: &str, flags: c_int) -> PoolResult<Self> {
        let path = CString::new(path).map_err(|_| PoolError::misuse("database path contains a nul byte"))?;
        let mut db = ptr::null_mut();

        // SAFETY: `path` outlives the call and `db` is a valid out-pointer
        let status = unsafe { sqlite3_open_v2(path.as_ptr(), &mut db, flags, ptr::null()) };

        // The handle must be closed even when opening failed.
        let handle = Self(NonNull::new(db).ok_or_else(|| error_from_code(status))?);
        if status != SQLITE_OK {
            return Err(handle.last_error());
        }

        // SAFETY: the handle is open
        unsafe {
            sqlite3_extended_result_codes(handle.as_ptr(), 1);
        }
        Ok(handle)
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut sqlite3 {
        self.0.as_ptr()
    }

    pub(crate) fn last_error(&self) -> PoolError {
        // SAFETY: the handle is open and exclusively ours
        unsafe { last_error(self.as_ptr()) }
    }

    /// Run one or more statements that produce no rows
    pub(crate) fn exec(&mut self, sql: &str) -> PoolResult<()> {
        let query = CString::new(sql).map_err(|_| PoolError::misuse("statement contains a nul byte"))?;

        // SAFETY: exclusive access to the handle
        let status = unsafe {
            sqlite3_exec(
                self.as_ptr(),
                query.as_ptr(),
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if status == SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error().with_sql(sql))
        }
    }

    /// Compile the first statement of `sql`
    pub(crate) fn prepare(&mut self, sql: &str, persistent: bool) -> PoolResult<StatementHandle> {
        let length = c_int::try_from(sql.len()).map_err(|_| PoolError::misuse("statement is too long"))?;
        let flags = if persistent { SQLITE_PREPARE_PERSISTENT } else { 0 };
        let mut statement = ptr::null_mut();

        // SAFETY: `sql` outlives the call, its length is passed explicitly
        let status = unsafe {
            sqlite3_prepare_v3(
                self.as_ptr(),
                sql.as_ptr() as *const c_char,
                length,
                flags as _,
                &mut statement,
                ptr::null_mut(),
            )
        };
        if status != SQLITE_OK {
            return Err(self.last_error().with_sql(sql));
        }
        NonNull::new(statement)
            .map(StatementHandle::new)
            .ok_or_else(|| PoolError::misuse(format!("no statement to compile in {sql:?}")))
    }

    /// Rows changed by the most recently completed statement
    pub(crate) fn changes(&self) -> usize {
        // SAFETY: exclusive access to the handle
        let changes = unsafe { sqlite3_changes(self.as_ptr()) };
        usize::try_from(changes).unwrap_or(0)
    }

    pub(crate) fn last_insert_rowid(&self) -> i64 {
        // SAFETY: exclusive access to the handle
        unsafe { sqlite3_last_insert_rowid(self.as_ptr()) }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        // SAFETY: exclusive access to the handle
        unsafe { sqlite3_get_autocommit(self.as_ptr()) == 0 }
    }

    pub(crate) fn set_busy_timeout(&mut self, timeout: Duration) -> PoolResult<()> {
        let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        // SAFETY: exclusive access to the handle
        let status = unsafe { sqlite3_busy_timeout(self.as_ptr(), millis) };
        if status == SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error())
        }
    }

    /// The engine's bound on host parameters per statement
    pub(crate) fn max_variable_number(&self) -> usize {
        // SAFETY: a negative new value only queries the limit
        let limit = unsafe { sqlite3_limit(self.as_ptr(), SQLITE_LIMIT_VARIABLE_NUMBER, -1) };
        usize::try_from(limit).unwrap_or(0)
    }

    /// Free as much heap as the connection can spare
    pub(crate) fn release_memory(&mut self) {
        // SAFETY: exclusive access to the handle
        unsafe {
            sqlite3_db_release_memory(self.as_ptr());
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // SAFETY: every statement of this connection has been finalized by now
        let status = unsafe { sqlite3_close(self.as_ptr()) };
        if status != SQLITE_OK {
            tracing::warn!(error = %self.last_error(), "failed to close connection");
        }
    }
}
