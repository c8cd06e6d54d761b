pub mod manager;
pub mod retry;
pub mod schema;

pub use manager::{StorageManager, StorageOptions};
pub use retry::BackoffPolicy;
pub use schema::{initialize_schema, reset_schema, SCHEMA_VERSION};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MARKET_DATA_DB: &str = "market_data";
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_CACHE_SIZE: &str = "10000";

pub fn database_file(data_dir: &Path, database_name: &str) -> PathBuf {
    data_dir.join(format!("{database_name}.db"))
}

/// Options applied to every physical connection: WAL journaling so readers
/// never block the single writer, enforced foreign keys and a bounded busy
/// timeout before SQLite reports the database as locked.
pub fn connect_options(path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .pragma("cache_size", PAGE_CACHE_SIZE)
}

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Shape of the result a caller wants back from a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    None,
    One,
    All,
    LastInsertId,
}

pub enum QueryOutput {
    Done { rows_affected: u64 },
    Row(Option<SqliteRow>),
    Rows(Vec<SqliteRow>),
    LastInsertId(i64),
}

// Rows are summarised by count; `SqliteRow` has no `Debug`.
impl fmt::Debug for QueryOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done { rows_affected } => f
                .debug_struct("Done")
                .field("rows_affected", rows_affected)
                .finish(),
            Self::Row(row) => f.debug_struct("Row").field("present", &row.is_some()).finish(),
            Self::Rows(rows) => f.debug_struct("Rows").field("count", &rows.len()).finish(),
            Self::LastInsertId(id) => f.debug_tuple("LastInsertId").field(id).finish(),
        }
    }
}

impl QueryOutput {
    pub fn rows_affected(&self) -> u64 {
        match self {
            Self::Done { rows_affected } => *rows_affected,
            _ => 0,
        }
    }

    pub fn into_row(self) -> Option<SqliteRow> {
        match self {
            Self::Row(row) => row,
            Self::Rows(rows) => rows.into_iter().next(),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Vec<SqliteRow> {
        match self {
            Self::Rows(rows) => rows,
            Self::Row(row) => row.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        match self {
            Self::LastInsertId(id) => Some(*id),
            _ => None,
        }
    }
}
