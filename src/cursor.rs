//! Lazily stepped query results

use crate::connection::SqlConnection;
use crate::database::ConnectionLease;
use crate::errors::PoolResult;
use crate::sqlite::{Row, StatementHandle, Step, Value};

use std::fmt;
use std::sync::Arc;

/// Where a cursor's connection comes from
pub(crate) enum CursorSource<'a> {
    /// Borrowed from the pool for the cursor alone
    Pooled(ConnectionLease<'a>),
    /// Borrowed by an enclosing transaction
    Scoped(&'a mut SqlConnection),
}

impl CursorSource<'_> {
    fn connection(&mut self) -> &mut SqlConnection {
        match self {
            CursorSource::Pooled(lease) => &mut **lease,
            CursorSource::Scoped(connection) => &mut **connection,
        }
    }
}

/// Rows of one query, stepped on demand
///
/// The cursor holds its connection until the last row has been read, a step
/// fails, or the cursor is closed or dropped. A pooled connection then goes
/// back to the pool.
pub struct Cursor<'a> {
    statement: Option<StatementHandle>,
    source: Option<CursorSource<'a>>,
    sql: String,
    columns: Arc<[String]>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn open(mut source: CursorSource<'a>, sql: &str, args: &[Value]) -> PoolResult<Self> {
        let connection = source.connection();
        let mut statement = connection.take_statement(sql)?;
        if let Err(e) = statement.bind_all(args) {
            connection.restore_statement(sql, statement);
            return Err(e.with_sql(sql));
        }

        let columns: Vec<String> = (0..statement.column_count())
            .map(|index| statement.column_name(index))
            .collect();
        Ok(Self {
            statement: Some(statement),
            source: Some(source),
            sql: sql.to_string(),
            columns: columns.into(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether the cursor has let go of its connection
    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Stop reading and give the connection back
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let (Some(statement), Some(source)) = (self.statement.take(), self.source.as_mut()) {
            source.connection().restore_statement(&self.sql, statement);
        }
        self.source = None;
    }
}

impl Iterator for Cursor<'_> {
    type Item = PoolResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let statement = self.statement.as_mut()?;
        match statement.step() {
            Ok(Step::Row) => {
                let values = (0..self.columns.len())
                    .map(|index| statement.column(index))
                    .collect();
                Some(Ok(Row::new(Arc::clone(&self.columns), values)))
            }
            Ok(Step::Done) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e.with_sql(&self.sql)))
            }
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("sql", &self.sql)
            .field("columns", &self.columns)
            .field("closed", &self.is_closed())
            .finish()
    }
}
