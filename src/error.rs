use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("database '{database}' still locked after {attempts} attempts: {source}")]
    StorageContention {
        database: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("data gap: {0}")]
    DataGap(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

/// Coarse failure classes used to decide between retrying, reconnecting,
/// skipping and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientContention,
    NetworkFailure,
    DataGap,
    Configuration,
    Other,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StorageContention { .. } => ErrorClass::TransientContention,
            Self::Sqlx(error) if is_lock_contention(error) => ErrorClass::TransientContention,
            Self::Reqwest(_) | Self::WebSocket(_) | Self::Timeout(_) => ErrorClass::NetworkFailure,
            Self::DataGap(_) | Self::SimdJson(_) | Self::ParseFloat(_) => ErrorClass::DataGap,
            Self::Configuration(_) | Self::Io(_) => ErrorClass::Configuration,
            Self::InvalidArgument(_) | Self::Sqlx(_) => ErrorClass::Other,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::TransientContention
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// True when SQLite refused the statement because another connection holds
/// the write lock. Extended result codes (e.g. BUSY_SNAPSHOT) share the low
/// byte with their primary code.
pub fn is_lock_contention(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(database_error) = error else {
        return false;
    };

    let primary_code = database_error
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    if matches!(primary_code, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
        return true;
    }

    let message = database_error.message();
    message.contains("database is locked") || message.contains("database table is locked")
}
