use super::last_error;
use super::value::Value;
use crate::errors::{PoolError, PoolResult};

use libsqlite3_sys::{
    SQLITE_BLOB, SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_OK, SQLITE_ROW, SQLITE_TEXT,
    SQLITE_TRANSIENT, SQLITE_UTF8, sqlite3, sqlite3_bind_blob64, sqlite3_bind_double,
    sqlite3_bind_int64, sqlite3_bind_null, sqlite3_bind_parameter_count, sqlite3_bind_text64,
    sqlite3_clear_bindings, sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count,
    sqlite3_column_double, sqlite3_column_int64, sqlite3_column_name, sqlite3_column_type,
    sqlite3_db_handle, sqlite3_finalize, sqlite3_reset, sqlite3_step, sqlite3_stmt,
    sqlite3_stmt_readonly,
};
use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::NonNull;
use std::slice;

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Row,
    Done,
}

/// A compiled statement, finalized on drop
#[derive(Debug)]
pub(crate) struct StatementHandle(NonNull<sqlite3_stmt>);

// Statements travel with the connection that compiled them.
unsafe impl Send for StatementHandle {}

impl StatementHandle {
    pub(super) fn new(statement: NonNull<sqlite3_stmt>) -> Self {
        Self(statement)
    }

    #[inline]
    fn as_ptr(&self) -> *mut sqlite3_stmt {
        self.0.as_ptr()
    }

    fn db(&self) -> *mut sqlite3 {
        // SAFETY: the statement is live
        unsafe { sqlite3_db_handle(self.as_ptr()) }
    }

    fn last_error(&self) -> PoolError {
        // SAFETY: the owning connection outlives its statements
        unsafe { last_error(self.db()) }
    }

    fn check(&self, status: c_int) -> PoolResult<()> {
        if status == SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error())
        }
    }

    /// Whether the statement leaves the database unchanged
    pub(crate) fn is_read_only(&self) -> bool {
        // SAFETY: the statement is live
        unsafe { sqlite3_stmt_readonly(self.as_ptr()) != 0 }
    }

    pub(crate) fn parameter_count(&self) -> usize {
        // SAFETY: the statement is live
        let count = unsafe { sqlite3_bind_parameter_count(self.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    pub(crate) fn column_count(&self) -> usize {
        // SAFETY: the statement is live
        let count = unsafe { sqlite3_column_count(self.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    pub(crate) fn column_name(&self, index: usize) -> String {
        // SAFETY: the statement is live and the index is checked by the engine
        unsafe {
            let name = sqlite3_column_name(self.as_ptr(), index as c_int);
            if name.is_null() {
                return String::new();
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    /// Bind `args` to parameters `1..=args.len()`
    pub(crate) fn bind_all(&mut self, args: &[Value]) -> PoolResult<()> {
        let expected = self.parameter_count();
        if args.len() != expected {
            return Err(PoolError::misuse(format!(
                "statement takes {expected} arguments but {} were given",
                args.len()
            )));
        }
        for (offset, value) in args.iter().enumerate() {
            self.bind(offset + 1, value)?;
        }
        Ok(())
    }

    // Binding values to prepared statements
    // https://www.sqlite.org/c3ref/bind_blob.html
    pub(crate) fn bind(&mut self, index: usize, value: &Value) -> PoolResult<()> {
        let index = index as c_int;
        // SAFETY: the statement is live and transient values are copied by the engine
        let status = unsafe {
            match value {
                Value::Null => sqlite3_bind_null(self.as_ptr(), index),
                Value::Integer(v) => sqlite3_bind_int64(self.as_ptr(), index, *v),
                Value::Real(v) => sqlite3_bind_double(self.as_ptr(), index, *v),
                Value::Text(v) => sqlite3_bind_text64(
                    self.as_ptr(),
                    index,
                    v.as_ptr() as *const c_char,
                    v.len() as u64,
                    SQLITE_TRANSIENT(),
                    SQLITE_UTF8 as u8,
                ),
                Value::Blob(v) => sqlite3_bind_blob64(
                    self.as_ptr(),
                    index,
                    v.as_ptr() as *const c_void,
                    v.len() as u64,
                    SQLITE_TRANSIENT(),
                ),
            }
        };
        self.check(status)
    }

    pub(crate) fn step(&mut self) -> PoolResult<Step> {
        // SAFETY: exclusive access to the statement
        match unsafe { sqlite3_step(self.as_ptr()) } {
            SQLITE_ROW => Ok(Step::Row),
            SQLITE_DONE => Ok(Step::Done),
            _ => Err(self.last_error()),
        }
    }

    /// Read column `index` of the current row
    pub(crate) fn column(&self, index: usize) -> Value {
        let index = index as c_int;
        // SAFETY: the statement is positioned on a row; pointers are read
        // before the next call that could invalidate them
        unsafe {
            match sqlite3_column_type(self.as_ptr(), index) {
                SQLITE_INTEGER => Value::Integer(sqlite3_column_int64(self.as_ptr(), index)),
                SQLITE_FLOAT => Value::Real(sqlite3_column_double(self.as_ptr(), index)),
                SQLITE_TEXT => {
                    Value::Text(String::from_utf8_lossy(self.column_bytes(index)).into_owned())
                }
                SQLITE_BLOB => Value::Blob(self.column_bytes(index).to_vec()),
                _ => Value::Null,
            }
        }
    }

    unsafe fn column_bytes(&self, index: c_int) -> &[u8] {
        // SAFETY: guaranteed by the caller
        unsafe {
            let data = sqlite3_column_blob(self.as_ptr(), index) as *const u8;
            let length = usize::try_from(sqlite3_column_bytes(self.as_ptr(), index)).unwrap_or(0);
            if data.is_null() || length == 0 {
                return &[];
            }
            slice::from_raw_parts(data, length)
        }
    }

    pub(crate) fn reset(&mut self) -> PoolResult<()> {
        // SAFETY: exclusive access to the statement
        let status = unsafe { sqlite3_reset(self.as_ptr()) };
        self.check(status)
    }

    pub(crate) fn clear_bindings(&mut self) {
        // SAFETY: exclusive access to the statement
        unsafe {
            sqlite3_clear_bindings(self.as_ptr());
        }
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        // SAFETY: exclusive access, and the statement is never used again
        unsafe {
            sqlite3_finalize(self.as_ptr());
        }
    }
}
