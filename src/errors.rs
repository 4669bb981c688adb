//! Error types for pools and the statement-execution layer

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("No pooled object became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Failed to create a pooled object: {0}")]
    ResourceCreationFailed(String),

    #[error("Native call failed with code {code}: {message}{}", sql_suffix(.sql))]
    NativeCallFailed {
        code: i32,
        message: String,
        sql: Option<String>,
    },

    #[error("Misuse: {0}")]
    Misuse(String),

    #[error("Transaction rolled back because a nested transaction failed")]
    TransactionRolledBack,

    #[error("Eviction scheduler is unavailable: {0}")]
    SchedulerUnavailable(String),
}

impl PoolError {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "misuse detected");
        PoolError::Misuse(message)
    }

    /// The native result code, if this error came from the engine.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            PoolError::NativeCallFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn with_sql(self, statement: &str) -> Self {
        match self {
            PoolError::NativeCallFailed { code, message, sql: None } => PoolError::NativeCallFailed {
                code,
                message,
                sql: Some(statement.to_string()),
            },
            other => other,
        }
    }
}

fn sql_suffix(sql: &Option<String>) -> String {
    sql.as_ref()
        .map(|s| format!(" (sql: {s})"))
        .unwrap_or_default()
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;
