use crate::db::{FetchMode, SqlValue, StorageManager};
use crate::error::AppError;
use crate::market::types::{now_unix_ms, Candle, CurrentPrice, Interval};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

const UPSERT_KLINE: &str = "INSERT INTO klines (symbol, interval, open_time, open, high, low, close, volume, close_time, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT(symbol, interval, open_time) DO UPDATE SET \
       open=excluded.open, \
       high=excluded.high, \
       low=excluded.low, \
       close=excluded.close, \
       volume=excluded.volume, \
       close_time=excluded.close_time, \
       updated_at=excluded.updated_at";

const UPSERT_PRICE: &str = "INSERT INTO current_prices (symbol, price, updated_at) VALUES (?, ?, ?) \
     ON CONFLICT(symbol) DO UPDATE SET price=excluded.price, updated_at=excluded.updated_at";

fn map_candle_row(row: &SqliteRow) -> Result<Candle, AppError> {
    let interval_raw: String = row.try_get("interval")?;

    Ok(Candle {
        symbol: row.try_get("symbol")?,
        interval: Interval::parse_str(&interval_raw)?,
        open_time: row.try_get("open_time")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        close_time: row.try_get("close_time")?,
    })
}

/// Typed candle and price access over one logical database.
#[derive(Debug, Clone)]
pub struct CandleStore {
    manager: Arc<StorageManager>,
    database: String,
}

impl CandleStore {
    pub fn new(manager: Arc<StorageManager>, database: impl Into<String>) -> Self {
        Self {
            manager,
            database: database.into(),
        }
    }

    pub fn manager(&self) -> &Arc<StorageManager> {
        &self.manager
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Insert-or-overwrite keyed by (symbol, interval, open_time).
    pub async fn upsert_candle(&self, candle: &Candle) -> Result<(), AppError> {
        let params = [
            SqlValue::from(candle.symbol.as_str()),
            SqlValue::from(candle.interval.as_str()),
            SqlValue::from(candle.open_time),
            SqlValue::from(candle.open),
            SqlValue::from(candle.high),
            SqlValue::from(candle.low),
            SqlValue::from(candle.close),
            SqlValue::from(candle.volume),
            SqlValue::from(candle.close_time),
            SqlValue::from(now_unix_ms()),
        ];
        self.manager
            .execute(&self.database, UPSERT_KLINE, &params, FetchMode::None)
            .await?;
        Ok(())
    }

    /// One autocommitted upsert per candle. Stops at the first candle that
    /// still fails after the retry budget.
    pub async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize, AppError> {
        for candle in candles {
            self.upsert_candle(candle).await?;
        }
        Ok(candles.len())
    }

    /// Up to `limit` most recent candles, returned oldest first.
    pub async fn recent_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, AppError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .manager
            .execute(
                &self.database,
                "SELECT symbol, interval, open_time, open, high, low, close, volume, close_time \
                 FROM klines \
                 WHERE symbol = ? AND interval = ? \
                 ORDER BY open_time DESC \
                 LIMIT ?",
                &[
                    SqlValue::from(symbol),
                    SqlValue::from(interval.as_str()),
                    SqlValue::from(limit),
                ],
                FetchMode::All,
            )
            .await?
            .into_rows();

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            candles.push(map_candle_row(row)?);
        }
        Ok(candles)
    }

    pub async fn candle_count(
        &self,
        symbol: Option<&str>,
        interval: Option<Interval>,
    ) -> Result<i64, AppError> {
        let row = self
            .manager
            .execute(
                &self.database,
                "SELECT COUNT(*) FROM klines \
                 WHERE (?1 IS NULL OR symbol = ?1) AND (?2 IS NULL OR interval = ?2)",
                &[
                    SqlValue::from(symbol),
                    SqlValue::from(interval.map(Interval::as_str)),
                ],
                FetchMode::One,
            )
            .await?
            .into_row();

        match row {
            Some(row) => Ok(row.try_get::<i64, _>(0)?),
            None => Ok(0),
        }
    }

    pub async fn latest_open_time(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<i64>, AppError> {
        let row = self
            .manager
            .execute(
                &self.database,
                "SELECT MAX(open_time) FROM klines WHERE symbol = ? AND interval = ?",
                &[SqlValue::from(symbol), SqlValue::from(interval.as_str())],
                FetchMode::One,
            )
            .await?
            .into_row();

        match row {
            Some(row) => Ok(row.try_get::<Option<i64>, _>(0)?),
            None => Ok(None),
        }
    }

    pub async fn upsert_current_price(&self, symbol: &str, price: f64) -> Result<(), AppError> {
        self.manager
            .execute(
                &self.database,
                UPSERT_PRICE,
                &[
                    SqlValue::from(symbol),
                    SqlValue::from(price),
                    SqlValue::from(now_unix_ms()),
                ],
                FetchMode::None,
            )
            .await?;
        Ok(())
    }

    pub async fn stored_price(&self, symbol: &str) -> Result<Option<CurrentPrice>, AppError> {
        let row = self
            .manager
            .execute(
                &self.database,
                "SELECT price, updated_at FROM current_prices WHERE symbol = ?",
                &[SqlValue::from(symbol)],
                FetchMode::One,
            )
            .await?
            .into_row();

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CurrentPrice {
            price: row.try_get("price")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}
