use crate::db::{FetchMode, StorageManager};
use crate::market::persistence::CandleStore;
use crate::market::stream::StreamingIngestionClient;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Everything the process keeps alive between startup and shutdown.
pub struct IngestRuntime {
    pub started_at: Instant,
    pub storage: Arc<StorageManager>,
    pub store: CandleStore,
    pub streaming: StreamingIngestionClient,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub active_connections: usize,
    pub active_symbols: usize,
    pub cached_series: usize,
    pub reconnects: u64,
    pub storage_connections: usize,
}

impl IngestRuntime {
    pub fn new(storage: Arc<StorageManager>, store: CandleStore, streaming: StreamingIngestionClient) -> Self {
        Self {
            started_at: Instant::now(),
            storage,
            store,
            streaming,
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        let db = match self
            .storage
            .execute(self.store.database(), "SELECT 1", &[], FetchMode::One)
            .await
        {
            Ok(_) => "ok",
            Err(_) => "error",
        };

        StatusSnapshot {
            running: self.streaming.is_running(),
            uptime_ms: self.started_at.elapsed().as_millis(),
            db,
            active_connections: self.streaming.active_connections(),
            active_symbols: self.streaming.active_symbols().len(),
            cached_series: self.streaming.cached_series(),
            reconnects: self.streaming.reconnect_count(),
            storage_connections: self.storage.connection_count().await,
        }
    }

    /// Logs a status line every `every` until `shutdown` resolves. Returns
    /// the number of status lines written.
    pub async fn report_until<F: Future>(&self, every: Duration, shutdown: F) -> u64 {
        tokio::pin!(shutdown);
        let mut status_ticker = tokio::time::interval(every);
        status_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reports = 0_u64;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return reports;
                }
                _ = status_ticker.tick() => {
                    let status = self.status().await;
                    reports += 1;
                    tracing::info!(
                        running = status.running,
                        db = status.db,
                        active_connections = status.active_connections,
                        active_symbols = status.active_symbols,
                        cached_series = status.cached_series,
                        reconnects = status.reconnects,
                        storage_connections = status.storage_connections,
                        uptime_s = (status.uptime_ms / 1_000) as u64,
                        "ingestion status"
                    );
                }
            }
        }
    }

    /// Stops streaming, then releases every storage connection.
    pub async fn shutdown(&self) {
        self.streaming.stop().await;
        self.storage.close_all().await;
    }
}
