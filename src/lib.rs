pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

pub use config::IngestConfig;
pub use error::{AppError, ErrorClass};

use db::{initialize_schema, StorageManager};
use market::backfill::HistoricalBackfillLoader;
use market::binance::{BinanceRestClient, BinanceStreamConnector, ExchangeApi};
use market::discovery::SymbolDiscovery;
use market::persistence::CandleStore;
use market::stream::StreamingIngestionClient;
use state::IngestRuntime;
use std::sync::Arc;

/// Runs discovery, backfill and live streaming until Ctrl-C. Only startup
/// failures (storage, schema, HTTP client) are returned as errors.
pub async fn run(config: IngestConfig) -> Result<(), AppError> {
    let storage = Arc::new(StorageManager::open(config.storage_options())?);
    initialize_schema(&storage, &config.database).await?;
    tracing::info!(
        data_dir = %storage.data_dir().display(),
        database = %config.database,
        "storage ready"
    );

    let api: Arc<dyn ExchangeApi> = Arc::new(BinanceRestClient::new(
        config.rest_base_url.clone(),
        config.request_timeout(),
        config.price_timeout(),
    )?);
    let store = CandleStore::new(Arc::clone(&storage), config.database.clone());

    // Created once so a Ctrl-C arriving between polls is still observed.
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let discovery = SymbolDiscovery::new(Arc::clone(&api), config.quote_asset.clone(), config.min_price);
    let symbols = discovery.discover_symbols().await;

    let loader = HistoricalBackfillLoader::new(Arc::clone(&api), store.clone(), config.backfill_options());
    tokio::select! {
        report = loader.backfill(&symbols, config.backfill_interval, config.backfill_limit) => {
            if !report.is_success() {
                tracing::warn!(requested = report.requested, "continuing without historical data");
            }
        }
        _ = &mut shutdown_signal => {
            tracing::info!("interrupted during backfill");
            storage.close_all().await;
            return Ok(());
        }
    }

    let streaming = StreamingIngestionClient::new(
        Arc::new(BinanceStreamConnector::new(config.stream_base_url.clone())),
        Arc::clone(&api),
        store.clone(),
        config.stream_options(),
    );
    let runtime = IngestRuntime::new(Arc::clone(&storage), store, streaming);

    let started = tokio::select! {
        started = runtime.streaming.start(&symbols) => started,
        _ = &mut shutdown_signal => {
            tracing::info!("interrupted while opening streams");
            runtime.shutdown().await;
            return Ok(());
        }
    };
    match started {
        Ok(opened) => tracing::info!(subscriptions = opened, "streaming started"),
        Err(error) => {
            runtime.shutdown().await;
            return Err(error);
        }
    }

    runtime
        .report_until(config.status_interval(), shutdown_signal.as_mut())
        .await;
    runtime.shutdown().await;
    Ok(())
}
