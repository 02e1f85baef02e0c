//! Read-only query execution against the records database
//!
//! Connections are opened read-only with `query_only` set, so a write that
//! somehow slipped past the guard still fails at the store. Every query runs
//! under a row cap and a wall-clock deadline.
use crate::error::{ExecutionError, ExecutorError, ResourceLimitError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Blob contents are never surfaced, only their size
    Blob(usize),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(r) => Some(*r),
            CellValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    fn from_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(r) => CellValue::Real(r),
            ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => CellValue::Blob(bytes.len()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "NULL"),
            CellValue::Integer(i) => write!(f, "{}", i),
            CellValue::Real(r) => write!(f, "{}", r),
            CellValue::Text(t) => write!(f, "{}", t),
            CellValue::Blob(n) => write!(f, "<{} bytes>", n),
        }
    }
}

/// Ordered column names plus rows of typed cells
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The only cell of a 1x1 result.
    pub fn single_value(&self) -> Option<&CellValue> {
        match (self.columns.len(), self.rows.as_slice()) {
            (1, [row]) => row.first(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: 200,
            timeout: Duration::from_millis(2000),
        }
    }
}

pub struct QueryExecutor {
    pool: Arc<Pool<SqliteConnectionManager>>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    /// Open a read-only pool over an existing database file.
    pub fn open(db_path: &Path, limits: ExecutionLimits) -> Result<Self, ExecutionError> {
        info!("Opening records database (read-only) at: {}", db_path.display());
        if !db_path.exists() {
            return Err(ExecutionError::Connection(format!(
                "database file not found: {}",
                db_path.display()
            )));
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|conn: &mut Connection| {
                conn.execute_batch(
                    "PRAGMA query_only = ON;
                     PRAGMA busy_timeout = 1000;",
                )
            });
        let pool = Pool::builder()
            .max_size(num_cpus::get().clamp(2, 8) as u32)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| ExecutionError::Connection(format!("failed to create connection pool: {}", e)))?;

        Ok(Self::from_pool(Arc::new(pool), limits))
    }

    pub fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>, limits: ExecutionLimits) -> Self {
        Self { pool, limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Run one validated statement. Exceeding `max_rows` or the deadline fails
    /// the whole query; partial results are never returned.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let ExecutionLimits { max_rows, timeout } = self.limits;
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let statement = sql.to_string();
        let started = Instant::now();

        // The connection is checked out on the blocking thread, inside the
        // deadline; its interrupt handle comes back once it is held.
        let pool = Arc::clone(&self.pool);
        let (handle_tx, mut handle_rx) = oneshot::channel::<InterruptHandle>();
        let task = tokio::task::spawn_blocking(move || -> Result<QueryResult, ExecutorError> {
            let conn = pool
                .get_timeout(deadline.saturating_duration_since(Instant::now()))
                .map_err(|e| ExecutionError::Connection(format!("failed to get connection from pool: {}", e)))?;
            if Instant::now() >= deadline {
                return Err(ResourceLimitError::Timeout(timeout_ms).into());
            }
            let _ = handle_tx.send(conn.get_interrupt_handle());
            run_query(&conn, &statement, max_rows, deadline, timeout_ms)
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined
                .map_err(|e| ExecutionError::Query(format!("query task failed: {}", e)))?,
            Err(_) => {
                warn!("Query exceeded {} ms, interrupting", timeout_ms);
                if let Ok(interrupt) = handle_rx.try_recv() {
                    interrupt.interrupt();
                }
                Err(ResourceLimitError::Timeout(timeout_ms).into())
            }
        };

        match &result {
            Ok(r) => debug!("Query returned {} rows in {:?}", r.row_count(), started.elapsed()),
            Err(e) => debug!("Query failed after {:?}: {}", started.elapsed(), e),
        }
        result
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
    deadline: Instant,
    timeout_ms: u64,
) -> Result<QueryResult, ExecutorError> {
    let map_err = |e: rusqlite::Error| -> ExecutorError {
        match e.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => ResourceLimitError::Timeout(timeout_ms).into(),
            _ => ExecutionError::Query(e.to_string()).into(),
        }
    };

    let mut stmt = conn.prepare(sql).map_err(map_err)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(map_err)?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next().map_err(map_err)? {
        if Instant::now() > deadline {
            return Err(ResourceLimitError::Timeout(timeout_ms).into());
        }
        if collected.len() == max_rows {
            return Err(ResourceLimitError::TooManyRows { limit: max_rows }.into());
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(CellValue::from_ref(row.get_ref(i).map_err(map_err)?));
        }
        collected.push(cells);
    }

    Ok(QueryResult {
        columns,
        rows: collected,
    })
}
