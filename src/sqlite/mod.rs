//! Safe wrappers over the native SQLite engine

mod handle;
mod statement;
mod value;

pub(crate) use handle::ConnectionHandle;
pub(crate) use statement::{StatementHandle, Step};
pub use value::{Row, Value};

use crate::errors::PoolError;

use libsqlite3_sys::{sqlite3, sqlite3_errmsg, sqlite3_errstr, sqlite3_extended_errcode};
use std::ffi::{CStr, c_int};

/// Result code of a busy database
pub const SQLITE_BUSY: i32 = libsqlite3_sys::SQLITE_BUSY;

/// The SQLite library version, e.g. `3.46.0`
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static string
    unsafe {
        CStr::from_ptr(libsqlite3_sys::sqlite3_libversion())
            .to_str()
            .unwrap_or("unknown")
    }
}

/// The SQLite library version as a number, e.g. `3046000`
pub fn version_number() -> i32 {
    // SAFETY: always safe to call
    unsafe { libsqlite3_sys::sqlite3_libversion_number() }
}

/// The primary result code of an extended one
pub fn primary_code(code: i32) -> i32 {
    code & 0xff
}

/// Read the most recent error of a connection
///
/// # Safety
///
/// `db` must be a live connection handle not used concurrently.
pub(crate) unsafe fn last_error(db: *mut sqlite3) -> PoolError {
    // SAFETY: guaranteed by the caller
    unsafe {
        let code = sqlite3_extended_errcode(db);
        let message = CStr::from_ptr(sqlite3_errmsg(db))
            .to_string_lossy()
            .into_owned();
        PoolError::NativeCallFailed {
            code,
            message,
            sql: None,
        }
    }
}

/// An error for a result code without a connection to ask about it
pub(crate) fn error_from_code(code: c_int) -> PoolError {
    // SAFETY: sqlite3_errstr returns a static string
    let message = unsafe { CStr::from_ptr(sqlite3_errstr(code)) }
        .to_string_lossy()
        .into_owned();
    PoolError::NativeCallFailed {
        code,
        message,
        sql: None,
    }
}
