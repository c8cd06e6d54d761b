use crate::db::{BackoffPolicy, StorageOptions, MARKET_DATA_DB};
use crate::error::AppError;
use crate::market::backfill::{BackfillOptions, DEFAULT_BACKFILL_LIMIT, DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
use crate::market::binance::{BINANCE_MAX_KLINES_PER_REQUEST, BINANCE_REST_BASE_URL, BINANCE_STREAM_BASE_URL};
use crate::market::cache::DEFAULT_CACHE_CAPACITY;
use crate::market::stream::{StreamOptions, DEFAULT_MAX_STREAM_SYMBOLS};
use crate::market::types::{Interval, DEFAULT_INTERVAL, DEFAULT_MIN_PRICE, DEFAULT_QUOTE_ASSET};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "MARKET_INGEST_";
const DEFAULT_DATA_DIR: &str = "data";

const MAX_BATCH_SIZE: usize = 500;
const MAX_WORKERS: usize = 64;
const MAX_STREAM_SYMBOLS: usize = 200;
const MAX_CACHE_CAPACITY: usize = 10_000;
const MAX_RETRIES: u32 = 20;

/// Runtime settings, read from `MARKET_INGEST_*` variables.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub database: String,
    pub rest_base_url: String,
    pub stream_base_url: String,

    // discovery
    pub quote_asset: String,
    pub min_price: f64,

    // backfill
    pub backfill_interval: Interval,
    pub backfill_limit: u16,
    pub batch_size: usize,
    pub workers: usize,
    pub batch_pause_ms: u64,
    pub request_timeout_ms: u64,
    pub price_timeout_ms: u64,

    // streaming
    pub stream_intervals: Vec<Interval>,
    pub max_stream_symbols: usize,
    pub stagger_ms: u64,
    pub cooldown_ms: u64,
    pub join_timeout_ms: u64,
    pub cache_capacity: usize,

    // storage
    pub busy_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub max_retries: u32,

    pub status_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database: MARKET_DATA_DB.to_string(),
            rest_base_url: BINANCE_REST_BASE_URL.to_string(),
            stream_base_url: BINANCE_STREAM_BASE_URL.to_string(),
            quote_asset: DEFAULT_QUOTE_ASSET.to_string(),
            min_price: DEFAULT_MIN_PRICE,
            backfill_interval: DEFAULT_INTERVAL,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            batch_pause_ms: 200,
            request_timeout_ms: 10_000,
            price_timeout_ms: 5_000,
            stream_intervals: vec![Interval::M1],
            max_stream_symbols: DEFAULT_MAX_STREAM_SYMBOLS,
            stagger_ms: 500,
            cooldown_ms: 5_000,
            join_timeout_ms: 2_000,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            busy_timeout_ms: 30_000,
            retry_base_ms: 100,
            max_retries: 5,
            status_interval_secs: 30,
        }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match self.raw(key) {
            Some(value) => value.parse::<T>().map_err(|_| {
                AppError::InvalidArgument(format!("{ENV_PREFIX}{key} has an invalid value '{value}'"))
            }),
            None => Ok(default),
        }
    }

    fn interval(&self, key: &str, default: Interval) -> Result<Interval, AppError> {
        match self.raw(key) {
            Some(value) => Interval::parse_str(&value),
            None => Ok(default),
        }
    }

    fn intervals(&self, key: &str, default: Vec<Interval>) -> Result<Vec<Interval>, AppError> {
        let Some(value) = self.raw(key) else {
            return Ok(default);
        };
        let mut intervals = Vec::new();
        for part in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let interval = Interval::parse_str(part)?;
            if !intervals.contains(&interval) {
                intervals.push(interval);
            }
        }
        Ok(intervals)
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<(), AppError> {
    if value < min || value > max {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<(), AppError> {
    if value == 0 {
        return Err(AppError::InvalidArgument(format!("{name} must be greater than zero")));
    }
    Ok(())
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source, then
    /// validates it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let config = Self {
            data_dir: PathBuf::from(env.string("DATA_DIR", defaults.data_dir.display().to_string())),
            database: env.string("DATABASE", defaults.database),
            rest_base_url: env.string("REST_BASE_URL", defaults.rest_base_url),
            stream_base_url: env.string("STREAM_BASE_URL", defaults.stream_base_url),
            quote_asset: env
                .string("QUOTE_ASSET", defaults.quote_asset)
                .to_ascii_uppercase(),
            min_price: env.parse("MIN_PRICE", defaults.min_price)?,
            backfill_interval: env.interval("BACKFILL_INTERVAL", defaults.backfill_interval)?,
            backfill_limit: env.parse("BACKFILL_LIMIT", defaults.backfill_limit)?,
            batch_size: env.parse("BATCH_SIZE", defaults.batch_size)?,
            workers: env.parse("WORKERS", defaults.workers)?,
            batch_pause_ms: env.parse("BATCH_PAUSE_MS", defaults.batch_pause_ms)?,
            request_timeout_ms: env.parse("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            price_timeout_ms: env.parse("PRICE_TIMEOUT_MS", defaults.price_timeout_ms)?,
            stream_intervals: env.intervals("STREAM_INTERVALS", defaults.stream_intervals)?,
            max_stream_symbols: env.parse("MAX_STREAM_SYMBOLS", defaults.max_stream_symbols)?,
            stagger_ms: env.parse("STAGGER_MS", defaults.stagger_ms)?,
            cooldown_ms: env.parse("COOLDOWN_MS", defaults.cooldown_ms)?,
            join_timeout_ms: env.parse("JOIN_TIMEOUT_MS", defaults.join_timeout_ms)?,
            cache_capacity: env.parse("CACHE_CAPACITY", defaults.cache_capacity)?,
            busy_timeout_ms: env.parse("BUSY_TIMEOUT_MS", defaults.busy_timeout_ms)?,
            retry_base_ms: env.parse("RETRY_BASE_MS", defaults.retry_base_ms)?,
            max_retries: env.parse("MAX_RETRIES", defaults.max_retries)?,
            status_interval_secs: env.parse("STATUS_INTERVAL_SECS", defaults.status_interval_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.is_empty()
            || !self
                .database
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(AppError::InvalidArgument(
                "database must be non-empty [A-Za-z0-9_-]".to_string(),
            ));
        }
        if self.quote_asset.is_empty() || !self.quote_asset.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "quote asset must be non-empty alphanumeric ASCII".to_string(),
            ));
        }
        if !self.min_price.is_finite() || self.min_price < 0.0 {
            return Err(AppError::InvalidArgument(
                "min price must be a finite non-negative number".to_string(),
            ));
        }
        if self.stream_intervals.is_empty() {
            return Err(AppError::InvalidArgument(
                "at least one stream interval is required".to_string(),
            ));
        }

        check_range("backfill limit", self.backfill_limit, 1, BINANCE_MAX_KLINES_PER_REQUEST)?;
        check_range("batch size", self.batch_size, 1, MAX_BATCH_SIZE)?;
        check_range("workers", self.workers, 1, MAX_WORKERS)?;
        check_range("max stream symbols", self.max_stream_symbols, 1, MAX_STREAM_SYMBOLS)?;
        check_range("cache capacity", self.cache_capacity, 1, MAX_CACHE_CAPACITY)?;
        check_range("max retries", self.max_retries, 1, MAX_RETRIES)?;
        check_positive("request timeout", self.request_timeout_ms)?;
        check_positive("price timeout", self.price_timeout_ms)?;
        check_positive("cooldown", self.cooldown_ms)?;
        check_positive("join timeout", self.join_timeout_ms)?;
        check_positive("busy timeout", self.busy_timeout_ms)?;
        check_positive("retry base delay", self.retry_base_ms)?;
        check_positive("status interval", self.status_interval_secs)?;
        Ok(())
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions::new(&self.data_dir)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .with_retry(
                BackoffPolicy::default()
                    .with_base_delay(Duration::from_millis(self.retry_base_ms))
                    .with_max_attempts(self.max_retries),
            )
    }

    pub fn backfill_options(&self) -> BackfillOptions {
        BackfillOptions {
            batch_size: self.batch_size,
            workers: self.workers,
            batch_pause: Duration::from_millis(self.batch_pause_ms),
            request_timeout: self.request_timeout(),
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            intervals: self.stream_intervals.clone(),
            max_symbols: self.max_stream_symbols,
            connect_stagger: Duration::from_millis(self.stagger_ms),
            connect_timeout: self.request_timeout(),
            reconnect_cooldown: Duration::from_millis(self.cooldown_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            cache_capacity: self.cache_capacity,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.price_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}
