use crate::error::AppError;
use crate::market::binance::{ExchangeApi, DEFAULT_REQUEST_TIMEOUT};
use crate::market::persistence::CandleStore;
use crate::market::types::Interval;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_WORKERS: usize = 12;
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKFILL_LIMIT: u16 = 100;

#[derive(Debug, Clone, Copy)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub batch_pause: Duration,
    pub request_timeout: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            batch_pause: DEFAULT_BATCH_PAUSE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_symbols: Vec<String>,
    pub candles_written: usize,
    pub elapsed: Duration,
}

impl BackfillReport {
    /// A run counts as successful when at least one symbol loaded.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0
    }
}

/// Running totals used for the per-completion progress line.
#[derive(Debug, Clone, Copy)]
pub struct BackfillProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    started_at: Instant,
}

impl BackfillProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }

    /// Symbols processed per minute so far.
    pub fn rate_per_minute(&self) -> f64 {
        let minutes = self.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.processed as f64 / minutes
    }

    /// Remaining time projected from the average time per processed symbol.
    pub fn eta(&self) -> Option<Duration> {
        if self.processed == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.processed) as f64;
        let per_symbol = self.elapsed().as_secs_f64() / self.processed as f64;
        Some(Duration::from_secs_f64(remaining * per_symbol))
    }
}

pub struct HistoricalBackfillLoader {
    api: Arc<dyn ExchangeApi>,
    store: CandleStore,
    options: BackfillOptions,
}

impl HistoricalBackfillLoader {
    pub fn new(api: Arc<dyn ExchangeApi>, store: CandleStore, options: BackfillOptions) -> Self {
        Self {
            api,
            store,
            options: BackfillOptions {
                batch_size: options.batch_size.max(1),
                workers: options.workers.max(1),
                ..options
            },
        }
    }

    /// Fetches the latest `limit` candles for every symbol and upserts them.
    /// `report.succeeded` is the number of symbols loaded; per-symbol
    /// failures are recorded in the report, never returned as an error.
    pub async fn backfill(&self, symbols: &[String], interval: Interval, limit: u16) -> BackfillReport {
        let mut report = BackfillReport {
            requested: symbols.len(),
            ..BackfillReport::default()
        };
        if symbols.is_empty() {
            tracing::warn!("backfill requested with no symbols");
            return report;
        }

        let total_batches = symbols.len().div_ceil(self.options.batch_size);
        let workers = Arc::new(Semaphore::new(self.options.workers));
        let mut progress = BackfillProgress::new(symbols.len());
        tracing::info!(
            symbols = symbols.len(),
            %interval,
            limit,
            workers = self.options.workers,
            batch_size = self.options.batch_size,
            "starting historical backfill"
        );

        for (batch_index, batch) in symbols.chunks(self.options.batch_size).enumerate() {
            tracing::info!(
                batch = batch_index + 1,
                total_batches,
                first = %batch[0],
                size = batch.len(),
                "processing backfill batch"
            );

            let mut tasks = JoinSet::new();
            for symbol in batch {
                let symbol = symbol.clone();
                let api = Arc::clone(&self.api);
                let store = self.store.clone();
                let workers = Arc::clone(&workers);
                let request_timeout = self.options.request_timeout;

                tasks.spawn(async move {
                    let outcome = match workers.acquire_owned().await {
                        Ok(_permit) => {
                            load_symbol(api.as_ref(), &store, &symbol, interval, limit, request_timeout).await
                        }
                        Err(_) => Err(AppError::Configuration("backfill worker pool closed".to_string())),
                    };
                    (symbol, outcome)
                });
            }

            let mut settled = HashSet::new();
            while let Some(joined) = tasks.join_next().await {
                let (symbol, outcome) = match joined {
                    Ok(result) => result,
                    Err(error) => {
                        tracing::error!(%error, "backfill task aborted");
                        continue;
                    }
                };
                settled.insert(symbol.clone());
                self.settle(&mut report, &mut progress, symbol, outcome);
            }

            // A panicked task never reports its symbol back.
            for symbol in batch.iter().filter(|symbol| !settled.contains(*symbol)) {
                let outcome = Err(AppError::DataGap("backfill task panicked".to_string()));
                self.settle(&mut report, &mut progress, symbol.clone(), outcome);
            }

            if batch_index + 1 < total_batches {
                tokio::time::sleep(self.options.batch_pause).await;
            }
        }

        report.elapsed = progress.elapsed();
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            requested = report.requested,
            candles = report.candles_written,
            elapsed_s = report.elapsed.as_secs_f64(),
            "historical backfill finished"
        );
        if !report.is_success() {
            tracing::error!(requested = report.requested, "historical backfill loaded no symbol");
        }
        report
    }

    fn settle(
        &self,
        report: &mut BackfillReport,
        progress: &mut BackfillProgress,
        symbol: String,
        outcome: Result<usize, AppError>,
    ) {
        match outcome {
            Ok(written) => {
                tracing::debug!(%symbol, candles = written, "symbol backfilled");
                report.succeeded += 1;
                report.candles_written += written;
                progress.record(true);
            }
            Err(error) => {
                tracing::warn!(%symbol, %error, class = ?error.class(), "symbol backfill failed");
                report.failed += 1;
                report.failed_symbols.push(symbol);
                progress.record(false);
            }
        }

        tracing::info!(
            processed = progress.processed,
            total = progress.total,
            percent = progress.percent(),
            succeeded = progress.succeeded,
            failed = progress.failed,
            rate_per_min = progress.rate_per_minute(),
            eta_s = progress.eta().map(|eta| eta.as_secs()),
            "backfill progress"
        );
    }
}

async fn load_symbol(
    api: &dyn ExchangeApi,
    store: &CandleStore,
    symbol: &str,
    interval: Interval,
    limit: u16,
    request_timeout: Duration,
) -> Result<usize, AppError> {
    let candles = tokio::time::timeout(request_timeout, api.fetch_klines(symbol, interval, limit))
        .await
        .map_err(|_| AppError::Timeout(format!("klines request for {symbol}")))??;

    if candles.is_empty() {
        return Err(AppError::DataGap(format!("no {interval} history for {symbol}")));
    }
    store.upsert_candles(&candles).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{cleanup, initialized_manager};
    use crate::db::MARKET_DATA_DB;
    use crate::market::testing::FakeExchange;
    use crate::market::types::{Candle, Ticker24hrWire};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    fn fast_options() -> BackfillOptions {
        BackfillOptions {
            batch_pause: Duration::from_millis(5),
            ..BackfillOptions::default()
        }
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_failing_symbol_does_not_abort_the_run() {
        let manager = initialized_manager("backfill-partial").await;
        let store = CandleStore::new(Arc::clone(&manager), MARKET_DATA_DB);
        let exchange = Arc::new(FakeExchange::default());
        exchange.fail_klines_for("BUSDT");
        let loader = HistoricalBackfillLoader::new(exchange.clone(), store.clone(), fast_options());

        let report = loader
            .backfill(&symbols(&["AUSDT", "BUSDT", "CUSDT"]), Interval::H1, 100)
            .await;

        assert!(report.is_success());
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_symbols, vec!["BUSDT".to_string()]);
        assert_eq!(report.candles_written, 200);
        for (symbol, expected) in [("AUSDT", 100), ("BUSDT", 0), ("CUSDT", 100)] {
            assert_eq!(
                store
                    .candle_count(Some(symbol), Some(Interval::H1))
                    .await
                    .expect("count"),
                expected,
                "{symbol}"
            );
        }
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn splits_symbols_into_batches() {
        let manager = initialized_manager("backfill-batches").await;
        let store = CandleStore::new(Arc::clone(&manager), MARKET_DATA_DB);
        let exchange = Arc::new(FakeExchange::default());
        let loader = HistoricalBackfillLoader::new(
            exchange.clone(),
            store.clone(),
            BackfillOptions {
                batch_size: 2,
                workers: 1,
                ..fast_options()
            },
        );

        let report = loader
            .backfill(&symbols(&["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"]), Interval::M15, 3)
            .await;

        assert_eq!(report.requested, 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(exchange.kline_calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.candle_count(None, None).await.expect("count"), 15);
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn total_failure_is_reported_not_raised() {
        let manager = initialized_manager("backfill-none").await;
        let store = CandleStore::new(Arc::clone(&manager), MARKET_DATA_DB);
        let exchange = Arc::new(FakeExchange::default());
        exchange.fail_klines_for("AUSDT");
        let loader = HistoricalBackfillLoader::new(exchange, store, fast_options());

        let report = loader.backfill(&symbols(&["AUSDT"]), Interval::H1, 10).await;
        assert!(!report.is_success());
        assert_eq!(report.failed, 1);

        let empty = loader.backfill(&[], Interval::H1, 10).await;
        assert_eq!(empty.requested, 0);
        assert!(!empty.is_success());
        cleanup(&manager).await;
    }

    struct SlowExchange;

    #[async_trait]
    impl ExchangeApi for SlowExchange {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _limit: u16,
        ) -> Result<Vec<Candle>, AppError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }

        async fn fetch_24hr_tickers(&self) -> Result<Vec<Ticker24hrWire>, AppError> {
            Ok(Vec::new())
        }

        async fn fetch_ticker_price(&self, _symbol: &str) -> Result<f64, AppError> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn slow_requests_time_out_as_failures() {
        let manager = initialized_manager("backfill-timeout").await;
        let store = CandleStore::new(Arc::clone(&manager), MARKET_DATA_DB);
        let loader = HistoricalBackfillLoader::new(
            Arc::new(SlowExchange),
            store,
            BackfillOptions {
                request_timeout: Duration::from_millis(50),
                ..fast_options()
            },
        );

        let report = loader.backfill(&symbols(&["AUSDT", "BUSDT"]), Interval::H1, 10).await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.succeeded, 0);
        cleanup(&manager).await;
    }

    #[test]
    fn progress_projects_remaining_time() {
        let mut progress = BackfillProgress::new(4);
        assert!(progress.eta().is_none());
        progress.record(true);
        progress.record(false);

        assert_eq!(progress.processed, 2);
        assert_eq!(progress.percent(), 50.0);
        assert!(progress.eta().is_some());
    }
}
