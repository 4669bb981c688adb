//! Statement classification, multi-row insert rewriting and compiled statements

use crate::connection::SqlConnection;
use crate::database::SqlDatabase;
use crate::errors::{PoolError, PoolResult};
use crate::sqlite::Value;

use std::iter;

/// The broad kind of a SQL statement, judged from its leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementType {
    Select,
    /// `INSERT`, `UPDATE`, `DELETE` and `REPLACE`
    Update,
    Attach,
    Begin,
    /// `COMMIT` and `END`
    Commit,
    /// `ROLLBACK`
    Abort,
    Pragma,
    /// `ALTER`, `CREATE` and `DROP`
    Ddl,
    /// `ANALYZE` and `DETACH`
    Unprepared,
    Other,
}

impl StatementType {
    /// Classify `sql` by the first three letters of its first keyword
    ///
    /// Leading whitespace, punctuation and comments are skipped.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sqlpool::StatementType;
    ///
    /// assert_eq!(StatementType::of("  select 1"), StatementType::Select);
    /// assert_eq!(StatementType::of("-- note\nDELETE FROM t"), StatementType::Update);
    /// assert_eq!(StatementType::of("END"), StatementType::Commit);
    /// assert_eq!(StatementType::of("WITH x AS (SELECT 1) SELECT * FROM x"), StatementType::Other);
    /// ```
    pub fn of(sql: &str) -> Self {
        let Some(prefix) = keyword_prefix(sql) else {
            return StatementType::Other;
        };
        match prefix {
            [b'S', b'E', _] => StatementType::Select,
            [b'I' | b'U', _, _] => StatementType::Update,
            [b'D', _, b'L'] => StatementType::Update,
            [b'D', _, b'O'] => StatementType::Ddl,
            [b'D', _, b'T'] => StatementType::Unprepared,
            [b'R', b'O', b'L'] => StatementType::Abort,
            [b'R', _, b'P'] => StatementType::Update,
            [b'B', _, _] => StatementType::Begin,
            [b'C', b'O', _] => StatementType::Commit,
            [b'C', b'R', _] => StatementType::Ddl,
            [b'E', b'N', _] => StatementType::Commit,
            [b'P', _, _] => StatementType::Pragma,
            [b'A', b'L', _] => StatementType::Ddl,
            [b'A', b'T', _] => StatementType::Attach,
            [b'A', b'N', _] => StatementType::Unprepared,
            _ => StatementType::Other,
        }
    }

    /// Whether statements of this kind should be sent straight to the writer
    ///
    /// Only selects are predicted to read. The engine still has the final say
    /// for those: a select it reports as writing is rerouted to the writer.
    pub fn is_predicted_write(&self) -> bool {
        *self != StatementType::Select
    }

    /// Whether this kind opens or closes a transaction
    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementType::Begin | StatementType::Commit | StatementType::Abort
        )
    }
}

/// The first three letters of the first keyword, upper-cased
fn keyword_prefix(sql: &str) -> Option<[u8; 3]> {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |end| i + end + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = bytes[i + 2..]
                    .windows(2)
                    .position(|w| w == b"*/")
                    .map_or(bytes.len(), |end| i + 2 + end + 2);
            }
            b if b.is_ascii_alphabetic() => break,
            _ => i += 1,
        }
    }
    let word = bytes.get(i..i + 3)?;
    Some([
        word[0].to_ascii_uppercase(),
        word[1].to_ascii_uppercase(),
        word[2].to_ascii_uppercase(),
    ])
}

/// A single-row `INSERT ... VALUES (?, ...)` that can be widened to many rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InsertTemplate {
    head: String,
    group: String,
    parameters: usize,
}

impl InsertTemplate {
    /// Recognize `INSERT [OR x] INTO t [(cols)] VALUES (?, ...)` with nothing
    /// after the value group
    pub(crate) fn parse(sql: &str) -> Option<Self> {
        let sql = sql.trim().trim_end_matches(';').trim_end();
        let upper = sql.to_ascii_uppercase();
        if !upper.starts_with("INSERT") {
            return None;
        }
        let values = upper.rfind("VALUES")?;
        if !upper[..values].ends_with(|c: char| c.is_ascii_whitespace() || c == ')') {
            return None;
        }

        let group = sql[values + "VALUES".len()..].trim();
        let inner = group.strip_prefix('(')?.strip_suffix(')')?;
        let parameters = inner.split(',').count();
        if !inner.split(',').all(|p| p.trim() == "?") {
            return None;
        }

        let placeholders = vec!["?"; parameters].join(", ");
        Some(Self {
            head: sql[..values + "VALUES".len()].to_string(),
            group: format!("({placeholders})"),
            parameters,
        })
    }

    /// Host parameters per row
    pub(crate) fn parameters(&self) -> usize {
        self.parameters
    }

    /// The statement inserting `rows` rows at once
    pub(crate) fn with_rows(&self, rows: usize) -> String {
        let groups = iter::repeat(self.group.as_str())
            .take(rows)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {groups}", self.head)
    }

    /// Concatenate the arguments of `rows`, checking each row's width
    pub(crate) fn flatten(&self, rows: impl IntoIterator<Item = Vec<Value>>) -> PoolResult<Vec<Value>> {
        let mut flat = Vec::new();
        for row in rows {
            if row.len() != self.parameters {
                return Err(PoolError::misuse(format!(
                    "insert takes {} arguments per row but a row has {}",
                    self.parameters,
                    row.len()
                )));
            }
            flat.extend(row);
        }
        Ok(flat)
    }
}

/// What an insert or update does when it hits a constraint violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConflictAlgorithm {
    /// Back out the statement and keep the transaction
    #[default]
    Abort,
    /// Stop at the failing row, keeping the rows changed before it
    Fail,
    /// Skip the failing row
    Ignore,
    /// Delete the conflicting rows, then proceed
    Replace,
    /// Roll back the whole transaction
    Rollback,
}

impl ConflictAlgorithm {
    fn clause(&self) -> &'static str {
        match self {
            ConflictAlgorithm::Abort => " OR ABORT ",
            ConflictAlgorithm::Fail => " OR FAIL ",
            ConflictAlgorithm::Ignore => " OR IGNORE ",
            ConflictAlgorithm::Replace => " OR REPLACE ",
            ConflictAlgorithm::Rollback => " OR ROLLBACK ",
        }
    }
}

fn columns_of<'v>(values: &'v [(&str, Value)], what: &str) -> PoolResult<(Vec<&'v str>, Vec<Value>)> {
    if values.is_empty() {
        return Err(PoolError::misuse(format!("{what} needs at least one column value")));
    }
    Ok(values.iter().map(|(column, value)| (*column, value.clone())).unzip())
}

/// `INSERT OR x INTO table (cols) VALUES (?, ...)` and its arguments
pub(crate) fn insert_sql(
    table: &str,
    values: &[(&str, Value)],
    conflict: ConflictAlgorithm,
) -> PoolResult<(String, Vec<Value>)> {
    let (columns, args) = columns_of(values, "insert")?;
    let sql = format!(
        "INSERT{}INTO {table} ({}) VALUES ({})",
        conflict.clause(),
        columns.join(","),
        vec!["?"; args.len()].join(","),
    );
    Ok((sql, args))
}

/// `UPDATE OR x table SET col=?, ... [WHERE ...]`; the values bind ahead of
/// `where_args`
pub(crate) fn update_sql(
    table: &str,
    values: &[(&str, Value)],
    where_clause: &str,
    where_args: &[Value],
    conflict: ConflictAlgorithm,
) -> PoolResult<(String, Vec<Value>)> {
    let (columns, mut args) = columns_of(values, "update")?;
    let assignments = columns
        .iter()
        .map(|column| format!("{column}=?"))
        .collect::<Vec<_>>()
        .join(",");
    let mut sql = format!("UPDATE{}{table} SET {assignments}", conflict.clause());
    if !where_clause.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(where_clause);
    }
    args.extend_from_slice(where_args);
    Ok((sql, args))
}

/// `DELETE FROM table [WHERE ...]`; an empty clause deletes every row
pub(crate) fn delete_sql(table: &str, where_clause: &str) -> String {
    if where_clause.is_empty() {
        format!("DELETE FROM {table}")
    } else {
        format!("DELETE FROM {table} WHERE {where_clause}")
    }
}

/// `INSERT ... ON CONFLICT (cols) DO UPDATE SET ...` and its arguments
pub(crate) fn upsert_sql(
    table: &str,
    values: &[(&str, Value)],
    conflict_columns: &[&str],
    update: &str,
) -> PoolResult<(String, Vec<Value>)> {
    let (columns, args) = columns_of(values, "upsert")?;
    if conflict_columns.is_empty() {
        return Err(PoolError::misuse("upsert needs at least one conflicting column"));
    }
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {update}",
        columns.join(","),
        vec!["?"; args.len()].join(","),
        conflict_columns.join(","),
    );
    Ok((sql, args))
}

/// A statement compiled ahead of execution
///
/// The statement is compiled once to learn its shape. Each execution borrows a
/// connection keyed by the statement text, so connections that already cached
/// the compiled form are preferred.
pub struct SqlStatement<'db> {
    database: &'db SqlDatabase,
    sql: String,
    kind: StatementType,
    read_only: bool,
    columns: Vec<String>,
    args: Vec<Value>,
}

impl<'db> SqlStatement<'db> {
    pub(crate) fn new(
        database: &'db SqlDatabase,
        sql: &str,
        read_only: bool,
        parameter_count: usize,
        columns: Vec<String>,
        args: &[Value],
    ) -> PoolResult<Self> {
        if args.len() > parameter_count {
            return Err(PoolError::misuse(format!(
                "statement takes {parameter_count} arguments but {} were given",
                args.len()
            )));
        }
        let mut bound = vec![Value::Null; parameter_count];
        bound[..args.len()].clone_from_slice(args);
        Ok(Self {
            database,
            sql: sql.to_string(),
            kind: StatementType::of(sql),
            read_only,
            columns,
            args: bound,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn statement_type(&self) -> StatementType {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn parameter_count(&self) -> usize {
        self.args.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Bind `value` to the 1-based parameter `index`
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> PoolResult<()> {
        let count = self.args.len();
        match index.checked_sub(1).and_then(|i| self.args.get_mut(i)) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(PoolError::misuse(format!(
                "parameter index {index} is out of range 1..={count}"
            ))),
        }
    }

    pub fn bind_null(&mut self, index: usize) -> PoolResult<()> {
        self.bind(index, Value::Null)
    }

    /// Reset every parameter to null
    pub fn clear_bindings(&mut self) {
        self.args.fill(Value::Null);
    }

    pub fn execute(&self) -> PoolResult<()> {
        self.run(|connection, sql, args| connection.execute(sql, args))
    }

    /// Run an insert, returning the new row id or -1 if no row was inserted
    pub fn execute_insert(&self) -> PoolResult<i64> {
        self.run(|connection, sql, args| connection.execute_for_last_insert_rowid(sql, args))
    }

    /// Run an update or delete, returning the number of rows changed
    pub fn execute_update_delete(&self) -> PoolResult<usize> {
        self.run(|connection, sql, args| connection.execute_for_changed_rows(sql, args))
    }

    pub fn simple_query_for_long(&self) -> PoolResult<Option<i64>> {
        self.run(|connection, sql, args| connection.execute_for_long(sql, args))
    }

    pub fn simple_query_for_string(&self) -> PoolResult<Option<String>> {
        self.run(|connection, sql, args| connection.execute_for_string(sql, args))
    }

    fn run<R>(
        &self,
        f: impl FnOnce(&mut SqlConnection, &str, &[Value]) -> PoolResult<R>,
    ) -> PoolResult<R> {
        self.database
            .with_connection(&self.sql, !self.read_only, |connection| {
                f(connection, &self.sql, &self.args)
            })
    }
}

impl std::fmt::Debug for SqlStatement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStatement")
            .field("sql", &self.sql)
            .field("kind", &self.kind)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_leading_keyword() {
        let cases = [
            ("SELECT * FROM t", StatementType::Select),
            ("insert into t values (1)", StatementType::Update),
            ("UPDATE t SET a = 1", StatementType::Update),
            ("DELETE FROM t", StatementType::Update),
            ("REPLACE INTO t VALUES (1)", StatementType::Update),
            ("DROP TABLE t", StatementType::Ddl),
            ("DETACH DATABASE other", StatementType::Unprepared),
            ("ROLLBACK", StatementType::Abort),
            ("BEGIN IMMEDIATE", StatementType::Begin),
            ("COMMIT", StatementType::Commit),
            ("END TRANSACTION", StatementType::Commit),
            ("CREATE TABLE t (a)", StatementType::Ddl),
            ("ALTER TABLE t ADD b", StatementType::Ddl),
            ("ATTACH 'x.db' AS x", StatementType::Attach),
            ("ANALYZE", StatementType::Unprepared),
            ("PRAGMA user_version", StatementType::Pragma),
            ("RELEASE sp", StatementType::Other),
            ("VACUUM", StatementType::Other),
        ];
        for (sql, expected) in cases {
            assert_eq!(StatementType::of(sql), expected, "{sql}");
        }
    }

    #[test]
    fn skips_comments_and_punctuation() {
        assert_eq!(StatementType::of("/* a */ -- b\n (SELECT 1)"), StatementType::Select);
        assert_eq!(StatementType::of("/* unterminated"), StatementType::Other);
        assert_eq!(StatementType::of("  ;"), StatementType::Other);
        assert_eq!(StatementType::of("BE"), StatementType::Other);
    }

    #[test]
    fn only_selects_are_predicted_reads() {
        assert!(!StatementType::Select.is_predicted_write());
        assert!(StatementType::Pragma.is_predicted_write());
        assert!(StatementType::Commit.is_transaction_control());
        assert!(!StatementType::Update.is_transaction_control());
    }

    #[test]
    fn widens_single_row_inserts() {
        let template =
            InsertTemplate::parse("insert or replace into t (a, b) values (?,  ?);").unwrap();
        assert_eq!(template.parameters(), 2);
        assert_eq!(
            template.with_rows(3),
            "insert or replace into t (a, b) values (?, ?), (?, ?), (?, ?)"
        );
        assert_eq!(InsertTemplate::parse("INSERT INTO t VALUES(?)").unwrap().with_rows(1), "INSERT INTO t VALUES (?)");
    }

    #[test]
    fn leaves_other_statements_alone() {
        for sql in [
            "UPDATE t SET a = ?",
            "INSERT INTO t SELECT * FROM u",
            "INSERT INTO t VALUES (?, 1)",
            "INSERT INTO t VALUES (?1, ?2)",
            "INSERT INTO t VALUES (?) RETURNING id",
            "INSERT INTO t VALUES (?) ON CONFLICT DO NOTHING",
            "INSERT INTO t DEFAULT VALUES",
        ] {
            assert!(InsertTemplate::parse(sql).is_none(), "{sql}");
        }
    }

    #[test]
    fn flatten_checks_row_width() {
        let template = InsertTemplate::parse("INSERT INTO t VALUES (?, ?)").unwrap();
        let flat = template
            .flatten(vec![vec![1.into(), 2.into()], vec![3.into(), 4.into()]])
            .unwrap();
        assert_eq!(flat.len(), 4);
        assert!(matches!(
            template.flatten(vec![vec![Value::Null]]),
            Err(PoolError::Misuse(_))
        ));
    }

    #[test]
    fn builds_insert_and_update_with_conflict_clause() {
        let values = [("a", Value::from(1)), ("b", Value::from("x"))];
        let (sql, args) = insert_sql("t", &values, ConflictAlgorithm::Replace).unwrap();
        assert_eq!(sql, "INSERT OR REPLACE INTO t (a,b) VALUES (?,?)");
        assert_eq!(args, [Value::from(1), Value::from("x")]);

        let (sql, args) =
            update_sql("t", &values, "id = ?", &[Value::from(7)], ConflictAlgorithm::Ignore).unwrap();
        assert_eq!(sql, "UPDATE OR IGNORE t SET a=?,b=? WHERE id = ?");
        assert_eq!(args.last(), Some(&Value::from(7)));

        let (sql, _) = update_sql("t", &values, "", &[], ConflictAlgorithm::Abort).unwrap();
        assert_eq!(sql, "UPDATE OR ABORT t SET a=?,b=?");
    }

    #[test]
    fn builds_delete_and_upsert() {
        assert_eq!(delete_sql("t", ""), "DELETE FROM t");
        assert_eq!(delete_sql("t", "a > ?"), "DELETE FROM t WHERE a > ?");

        let (sql, args) = upsert_sql(
            "t",
            &[("k", Value::from(1)), ("n", Value::from(2))],
            &["k"],
            "n = n + excluded.n",
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO t (k,n) VALUES (?,?) ON CONFLICT (k) DO UPDATE SET n = n + excluded.n"
        );
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn write_helpers_need_values() {
        assert!(matches!(
            insert_sql("t", &[], ConflictAlgorithm::Abort),
            Err(PoolError::Misuse(_))
        ));
        assert!(matches!(
            upsert_sql("t", &[("k", Value::Null)], &[], "k = 1"),
            Err(PoolError::Misuse(_))
        ));
    }
}
