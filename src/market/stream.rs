use crate::error::AppError;
use crate::market::binance::{ExchangeApi, FrameStream, StreamConnector, DEFAULT_REQUEST_TIMEOUT};
use crate::market::cache::{PriceCache, RollingCandleCache, DEFAULT_CACHE_CAPACITY};
use crate::market::persistence::CandleStore;
use crate::market::types::{
    normalize_symbol, parse_kline_payload, Candle, Interval, KlineUpdate, StreamKey, SubscriptionState,
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_STREAM_SYMBOLS: usize = 10;
pub const DEFAULT_CONNECT_STAGGER: Duration = Duration::from_millis(500);
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub intervals: Vec<Interval>,
    pub max_symbols: usize,
    pub connect_stagger: Duration,
    pub connect_timeout: Duration,
    pub reconnect_cooldown: Duration,
    pub join_timeout: Duration,
    pub cache_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            intervals: vec![Interval::M1],
            max_symbols: DEFAULT_MAX_STREAM_SYMBOLS,
            connect_stagger: DEFAULT_CONNECT_STAGGER,
            connect_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamDirective {
    Continue,
    Reconnect,
}

struct ClientShared {
    connector: Arc<dyn StreamConnector>,
    api: Arc<dyn ExchangeApi>,
    store: CandleStore,
    options: StreamOptions,
    running: AtomicBool,
    candles: RollingCandleCache,
    prices: PriceCache,
    states: RwLock<HashMap<StreamKey, SubscriptionState>>,
    reconnects: AtomicU64,
}

impl ClientShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, key: &StreamKey, state: SubscriptionState) {
        self.states.write().insert(key.clone(), state);
    }

    async fn connect(&self, key: &StreamKey) -> Result<FrameStream, AppError> {
        tokio::time::timeout(
            self.options.connect_timeout,
            self.connector.connect(&key.symbol, key.interval),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("connecting {key}")))?
    }

    async fn handle_message(&self, key: &StreamKey, message: Message) -> StreamDirective {
        let decoded = match message {
            Message::Text(text_payload) => {
                let mut owned_payload = text_payload.into_bytes();
                parse_kline_payload(owned_payload.as_mut_slice())
            }
            Message::Binary(mut binary_payload) => parse_kline_payload(binary_payload.as_mut_slice()),
            Message::Close(frame) => {
                tracing::info!(stream = %key, ?frame, "remote closed stream");
                return StreamDirective::Reconnect;
            }
            _ => return StreamDirective::Continue,
        };

        let update = match decoded {
            Ok(update) => update,
            Err(error) => {
                tracing::warn!(stream = %key, %error, "skipping undecodable frame");
                return StreamDirective::Continue;
            }
        };
        if update.candle.symbol != key.symbol || update.candle.interval != key.interval {
            tracing::warn!(
                stream = %key,
                got = %update.candle.key(),
                "skipping frame for another series"
            );
            return StreamDirective::Continue;
        }

        self.apply_update(update).await;
        StreamDirective::Continue
    }

    /// Forming bars only refresh the latest price. Closed bars are also
    /// persisted and appended to the rolling cache, in arrival order.
    async fn apply_update(&self, update: KlineUpdate) {
        let KlineUpdate { candle, is_closed } = update;
        self.prices.set(&candle.symbol, candle.close);
        if !is_closed {
            return;
        }

        if let Err(error) = self.store.upsert_candle(&candle).await {
            tracing::error!(symbol = %candle.symbol, interval = %candle.interval, %error, "failed to persist closed candle");
        }
        if let Err(error) = self.store.upsert_current_price(&candle.symbol, candle.close).await {
            tracing::warn!(symbol = %candle.symbol, %error, "failed to persist current price");
        }
        tracing::debug!(symbol = %candle.symbol, interval = %candle.interval, open_time = candle.open_time, "closed candle ingested");
        self.candles.append(candle);
    }
}

/// One subscription's lifecycle:
/// `Disconnected -> Connecting -> Connected -> Disconnected -> (cooldown) -> Connecting`
/// until the client stops, then `Stopped`.
async fn run_subscription(shared: Arc<ClientShared>, key: StreamKey, cancel_token: CancellationToken) {
    let mut attempt = 0_u64;

    while shared.is_running() && !cancel_token.is_cancelled() {
        if attempt > 0 {
            shared.reconnects.fetch_add(1, Ordering::SeqCst);
            tracing::info!(stream = %key, attempt, "reconnecting");
        }
        shared.set_state(&key, SubscriptionState::Connecting);

        match shared.connect(&key).await {
            Ok(mut frames) => {
                shared.set_state(&key, SubscriptionState::Connected);
                tracing::info!(stream = %key, "stream connected");

                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next_frame = frames.next() => next_frame,
                    };

                    match frame {
                        Some(Ok(message)) => {
                            if shared.handle_message(&key, message).await == StreamDirective::Reconnect {
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            tracing::warn!(stream = %key, %error, "stream read failed");
                            break;
                        }
                        None => {
                            tracing::warn!(stream = %key, "stream ended");
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!(stream = %key, %error, "stream connect failed");
            }
        }

        shared.set_state(&key, SubscriptionState::Disconnected);
        if !shared.is_running() || cancel_token.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(shared.options.reconnect_cooldown) => {}
        }
        attempt += 1;
    }

    shared.set_state(&key, SubscriptionState::Stopped);
    tracing::debug!(stream = %key, "subscription stopped");
}

/// Keeps one live kline subscription per (symbol, interval), feeding the
/// candle store and the in-memory caches.
pub struct StreamingIngestionClient {
    shared: Arc<ClientShared>,
    cancel_token: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<(StreamKey, JoinHandle<()>)>>,
}

impl StreamingIngestionClient {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        api: Arc<dyn ExchangeApi>,
        store: CandleStore,
        options: StreamOptions,
    ) -> Self {
        let candles = RollingCandleCache::new(options.cache_capacity);
        Self {
            shared: Arc::new(ClientShared {
                connector,
                api,
                store,
                options,
                running: AtomicBool::new(false),
                candles,
                prices: PriceCache::default(),
                states: RwLock::new(HashMap::new()),
                reconnects: AtomicU64::new(0),
            }),
            cancel_token: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Opens subscriptions for up to `max_symbols` symbols, one per
    /// configured interval, pausing `connect_stagger` between them.
    /// Returns the number of subscriptions opened.
    pub async fn start(&self, symbols: &[String]) -> Result<usize, AppError> {
        if self.shared.options.intervals.is_empty() {
            return Err(AppError::InvalidArgument("no stream interval configured".to_string()));
        }
        let mut selected = Vec::new();
        for symbol in symbols {
            let symbol = normalize_symbol(symbol)?;
            if !selected.contains(&symbol) {
                selected.push(symbol);
            }
        }
        selected.truncate(self.shared.options.max_symbols);

        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::InvalidArgument("streaming client already running".to_string()));
        }
        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock() = Some(cancel_token.clone());

        tracing::info!(
            symbols = selected.len(),
            intervals = self.shared.options.intervals.len(),
            "starting streaming ingestion"
        );

        let mut opened = 0_usize;
        for symbol in &selected {
            for interval in &self.shared.options.intervals {
                if !self.shared.is_running() || cancel_token.is_cancelled() {
                    return Ok(opened);
                }
                if opened > 0 {
                    tokio::select! {
                        _ = cancel_token.cancelled() => return Ok(opened),
                        _ = tokio::time::sleep(self.shared.options.connect_stagger) => {}
                    }
                }

                let key = StreamKey::new(symbol, *interval);
                self.shared.set_state(&key, SubscriptionState::Disconnected);
                let handle = tokio::spawn(run_subscription(
                    Arc::clone(&self.shared),
                    key.clone(),
                    cancel_token.child_token(),
                ));
                self.tasks.lock().push((key, handle));
                opened += 1;
            }
        }

        Ok(opened)
    }

    /// Cancels every subscription and waits up to `join_timeout` for their
    /// tasks; stragglers are aborted.
    pub async fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if let Some(cancel_token) = self.cancel_token.lock().take() {
            cancel_token.cancel();
        }

        let handles = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + self.shared.options.join_timeout;
        for (key, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(stream = %key, %error, "subscription task failed");
                }
                Err(_) => {
                    tracing::warn!(stream = %key, "subscription did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        for state in self.shared.states.write().values_mut() {
            *state = SubscriptionState::Stopped;
        }
        if was_running {
            tracing::info!("streaming ingestion stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn subscription_state(&self, symbol: &str, interval: Interval) -> Option<SubscriptionState> {
        self.shared
            .states
            .read()
            .get(&StreamKey::new(symbol, interval))
            .copied()
    }

    /// Symbols with at least one connected subscription, sorted.
    pub fn active_symbols(&self) -> Vec<String> {
        let states = self.shared.states.read();
        states
            .iter()
            .filter(|(_, state)| **state == SubscriptionState::Connected)
            .map(|(key, _)| key.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn active_connections(&self) -> usize {
        self.shared
            .states
            .read()
            .values()
            .filter(|state| **state == SubscriptionState::Connected)
            .count()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    pub fn cached_series(&self) -> usize {
        self.shared.candles.series_count()
    }

    pub fn candle_cache(&self) -> &RollingCandleCache {
        &self.shared.candles
    }

    /// Recent closed candles, oldest first. Served from the rolling cache
    /// when the series is cached, otherwise read from storage, which also
    /// repopulates the cache.
    pub async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, AppError> {
        let symbol = normalize_symbol(symbol)?;
        if let Some(cached) = self.shared.candles.snapshot(&symbol, interval) {
            return Ok(tail(cached, limit));
        }

        let depth = limit.max(self.shared.candles.capacity());
        let stored = self.shared.store.recent_candles(&symbol, interval, depth).await?;
        if !stored.is_empty() {
            tracing::debug!(%symbol, %interval, candles = stored.len(), "rebuilt candle cache from storage");
            self.shared
                .candles
                .merge_stored(StreamKey::new(&symbol, interval), stored.clone());
        }
        Ok(tail(stored, limit))
    }

    /// Latest known price: memory, then the stored price row, then the
    /// exchange. Lookups that miss memory write the result back.
    pub async fn get_current_price(&self, symbol: &str) -> Option<f64> {
        let symbol = match normalize_symbol(symbol) {
            Ok(symbol) => symbol,
            Err(error) => {
                tracing::warn!(%error, "invalid price lookup");
                return None;
            }
        };
        if let Some(cached) = self.shared.prices.get(&symbol) {
            return Some(cached.price);
        }

        match self.shared.store.stored_price(&symbol).await {
            Ok(Some(stored)) => {
                self.shared.prices.set(&symbol, stored.price);
                return Some(stored.price);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%symbol, %error, "stored price lookup failed");
            }
        }

        match self.shared.api.fetch_ticker_price(&symbol).await {
            Ok(price) => {
                self.shared.prices.set(&symbol, price);
                if let Err(error) = self.shared.store.upsert_current_price(&symbol, price).await {
                    tracing::warn!(%symbol, %error, "failed to persist fetched price");
                }
                Some(price)
            }
            Err(error) => {
                tracing::warn!(%symbol, %error, "price request failed");
                None
            }
        }
    }
}

fn tail(mut candles: Vec<Candle>, limit: usize) -> Vec<Candle> {
    let overflow = candles.len().saturating_sub(limit);
    candles.drain(0..overflow);
    candles
}
