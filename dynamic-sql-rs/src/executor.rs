//! Read-only statement execution
//!
//! [`SqliteExecutor`] opens the database read-only with `query_only` set,
//! runs each statement on the blocking pool and interrupts it when the
//! deadline passes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::planner::CandidateStatement;

/// Rows produced by one statement
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryRows {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Query exceeded {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Query worker failed: {0}")]
    Worker(String),
}

/// Executes validated statements
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        statement: &CandidateStatement,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryRows, ExecutionError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// SQLite executor over a read-only database file
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    db_path: PathBuf,
}

impl SqliteExecutor {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Open `path` read-only with writes disabled at the connection level
pub fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    if let Err(e) = conn.execute_batch("PRAGMA query_only = ON") {
        debug!(error = %e, "Could not enable query_only");
    }
    Ok(conn)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Run `sql` on `conn` and collect up to `max_rows` rows as JSON objects
pub fn query_rows(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    max_rows: usize,
) -> rusqlite::Result<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let bound: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

    let mut rows = stmt.query(params_from_iter(bound.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= max_rows {
            break;
        }
        let mut record = Map::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute(
        &self,
        statement: &CandidateStatement,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryRows, ExecutionError> {
        let path = self.db_path.clone();
        let sql = statement.sql.clone();
        let params = statement.params.clone();
        let interrupt: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));
        let interrupt_slot = Arc::clone(&interrupt);
        let started = Instant::now();

        let worker = tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            *interrupt_slot.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(conn.get_interrupt_handle());
            query_rows(&conn, &sql, &params, max_rows)
        });

        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(Ok(rows))) => {
                let row_count = rows.len();
                Ok(QueryRows {
                    rows,
                    row_count,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Ok(Ok(Err(e))) => Err(ExecutionError::Sqlite(e)),
            Ok(Err(join_err)) => Err(ExecutionError::Worker(join_err.to_string())),
            Err(_) => {
                if let Some(handle) = interrupt.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    handle.interrupt();
                }
                warn!(timeout_ms = timeout.as_millis() as u64, "Query interrupted after deadline");
                Err(ExecutionError::Timeout(timeout))
            }
        }
    }

    async fn ping(&self) -> Result<(), ExecutionError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok::<(), ExecutionError>(())
        })
        .await
        .map_err(|e| ExecutionError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded_db() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price_cents INTEGER, weight REAL);
             INSERT INTO products VALUES (1, 'Lamp', 2500, 1.5), (2, 'Desk', 12000, NULL), (3, 'Chair', 4000, 7.25);",
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_rows_are_json_objects() {
        let db = seeded_db();
        let executor = SqliteExecutor::new(db.path());
        let statement = CandidateStatement::new(
            "SELECT id, name, weight FROM products WHERE price_cents > ? ORDER BY id",
            vec![json!(3000)],
        );

        let rows = executor
            .execute(&statement, 10, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(rows.row_count, 2);
        assert_eq!(rows.rows[0]["name"], "Desk");
        assert_eq!(rows.rows[0]["weight"], Value::Null);
        assert_eq!(rows.rows[1]["weight"], json!(7.25));
    }

    #[tokio::test]
    async fn test_row_cap_applies() {
        let db = seeded_db();
        let executor = SqliteExecutor::new(db.path());
        let statement = CandidateStatement::new("SELECT * FROM products", Vec::new());
        let rows = executor.execute(&statement, 2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(rows.row_count, 2);
    }

    #[tokio::test]
    async fn test_writes_are_refused_by_the_connection() {
        let db = seeded_db();
        let executor = SqliteExecutor::new(db.path());
        let statement = CandidateStatement::new("DELETE FROM products", Vec::new());
        let err = executor
            .execute(&statement, 10, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_ping_reports_a_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SqliteExecutor::new(dir.path().join("missing.db"));
        assert!(executor.ping().await.is_err());

        let db = seeded_db();
        assert!(SqliteExecutor::new(db.path()).ping().await.is_ok());
    }
}
