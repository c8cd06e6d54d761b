use crate::db::{FetchMode, StorageManager};
use crate::error::AppError;
use sqlx::Row;

/// Bumped whenever a column of a versioned table changes shape. A database
/// stamped with another version is rebuilt from scratch.
pub const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS klines (
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    close_time INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, interval, open_time)
);

CREATE INDEX IF NOT EXISTS idx_klines_symbol_time
    ON klines (symbol, open_time);

CREATE INDEX IF NOT EXISTS idx_klines_series_recent
    ON klines (symbol, interval, open_time DESC);

CREATE TABLE IF NOT EXISTS current_prices (
    symbol TEXT PRIMARY KEY,
    price REAL NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const KLINE_COLUMNS: &[&str] = &[
    "symbol",
    "interval",
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "close_time",
    "updated_at",
];
const PRICE_COLUMNS: &[&str] = &["symbol", "price", "updated_at"];

const DROP_TABLES: &str = "
DROP INDEX IF EXISTS idx_klines_series_recent;
DROP INDEX IF EXISTS idx_klines_symbol_time;
DROP TABLE IF EXISTS klines;
DROP TABLE IF EXISTS current_prices;
";

async fn stored_version(manager: &StorageManager, database_name: &str) -> Result<i64, AppError> {
    let row = manager
        .execute(database_name, "PRAGMA user_version", &[], FetchMode::One)
        .await?
        .into_row();
    match row {
        Some(row) => Ok(row.try_get::<i64, _>(0)?),
        None => Ok(0),
    }
}

async fn stamp_version(manager: &StorageManager, database_name: &str) -> Result<(), AppError> {
    // PRAGMA arguments cannot be bound.
    let statement = format!("PRAGMA user_version = {SCHEMA_VERSION}");
    manager
        .execute(database_name, &statement, &[], FetchMode::None)
        .await?;
    Ok(())
}

/// Whether every table that already exists carries the columns written by
/// this version. Missing tables count as matching.
async fn existing_tables_match(manager: &StorageManager, database_name: &str) -> Result<bool, AppError> {
    for (table, expected) in [("klines", KLINE_COLUMNS), ("current_prices", PRICE_COLUMNS)] {
        let statement = format!("PRAGMA table_info({table})");
        let columns = manager
            .execute(database_name, &statement, &[], FetchMode::All)
            .await?
            .into_rows()
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            continue;
        }
        if let Some(missing) = expected
            .iter()
            .find(|column| !columns.iter().any(|existing| existing.as_str() == **column))
        {
            tracing::warn!(
                database = database_name,
                table,
                column = *missing,
                "unversioned table has an older shape"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Creates the candle and price tables and their indexes. Safe to call on
/// every start. A version mismatch, or an unversioned database whose tables
/// lack current columns, triggers a destructive rebuild.
pub async fn initialize_schema(manager: &StorageManager, database_name: &str) -> Result<(), AppError> {
    let max_retries = manager.retry_policy().max_attempts;
    let version = stored_version(manager, database_name)
        .await
        .map_err(|error| schema_failure(database_name, error))?;

    if version != 0 && version != SCHEMA_VERSION {
        tracing::warn!(
            database = database_name,
            found = version,
            expected = SCHEMA_VERSION,
            "schema version changed, existing market data will be discarded"
        );
        return reset_schema(manager, database_name).await;
    }
    if version == 0 {
        let current_shape = existing_tables_match(manager, database_name)
            .await
            .map_err(|error| schema_failure(database_name, error))?;
        if !current_shape {
            return reset_schema(manager, database_name).await;
        }
    }

    manager
        .execute_script(database_name, CREATE_TABLES, max_retries)
        .await
        .map_err(|error| schema_failure(database_name, error))?;
    stamp_version(manager, database_name)
        .await
        .map_err(|error| schema_failure(database_name, error))?;

    tracing::info!(database = database_name, version = SCHEMA_VERSION, "schema ready");
    Ok(())
}

/// Drops and recreates every table. All stored candles and prices are lost.
pub async fn reset_schema(manager: &StorageManager, database_name: &str) -> Result<(), AppError> {
    let max_retries = manager.retry_policy().max_attempts;
    tracing::warn!(database = database_name, "dropping market data tables");

    manager
        .execute_script(database_name, DROP_TABLES, max_retries)
        .await
        .map_err(|error| schema_failure(database_name, error))?;
    manager
        .execute_script(database_name, CREATE_TABLES, max_retries)
        .await
        .map_err(|error| schema_failure(database_name, error))?;
    stamp_version(manager, database_name)
        .await
        .map_err(|error| schema_failure(database_name, error))?;

    tracing::info!(database = database_name, version = SCHEMA_VERSION, "schema recreated");
    Ok(())
}

fn schema_failure(database_name: &str, error: AppError) -> AppError {
    match error {
        AppError::Configuration(_) => error,
        other => AppError::Configuration(format!(
            "schema initialization failed for '{database_name}': {other}"
        )),
    }
}
