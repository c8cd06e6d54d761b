use crate::error::AppError;
use crate::market::binance::{ExchangeApi, FrameStream, StreamConnector};
use crate::market::types::{sample_candle, Candle, Interval, Ticker24hrWire};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// In-process exchange with canned responses.
#[derive(Debug, Default)]
pub struct FakeExchange {
    pub tickers: Mutex<Option<Vec<(String, String)>>>,
    pub failing_symbols: Mutex<HashSet<String>>,
    pub prices: Mutex<HashMap<String, f64>>,
    pub kline_calls: AtomicUsize,
    pub price_calls: AtomicUsize,
}

impl FakeExchange {
    pub fn with_tickers(tickers: &[(&str, &str)]) -> Self {
        let exchange = Self::default();
        *exchange.tickers.lock() = Some(
            tickers
                .iter()
                .map(|(symbol, price)| (symbol.to_string(), price.to_string()))
                .collect(),
        );
        exchange
    }

    pub fn fail_klines_for(&self, symbol: &str) {
        self.failing_symbols.lock().insert(symbol.to_string());
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u16,
    ) -> Result<Vec<Candle>, AppError> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_symbols.lock().contains(symbol) {
            return Err(AppError::Timeout(format!("klines for {symbol}")));
        }
        Ok((0..i64::from(limit))
            .map(|index| sample_candle(symbol, interval, index))
            .collect())
    }

    async fn fetch_24hr_tickers(&self) -> Result<Vec<Ticker24hrWire>, AppError> {
        match self.tickers.lock().clone() {
            Some(tickers) => Ok(tickers
                .into_iter()
                .map(|(symbol, last_price)| Ticker24hrWire { symbol, last_price })
                .collect()),
            None => Err(AppError::Timeout("ticker listing".to_string())),
        }
    }

    async fn fetch_ticker_price(&self, symbol: &str) -> Result<f64, AppError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| AppError::Timeout(format!("price for {symbol}")))
    }
}

/// Hands out streams whose frames are pushed by the test through the
/// matching sender. Every `connect` call is counted and timestamped.
#[derive(Debug, Default)]
pub struct FakeConnector {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Message, AppError>>>>,
    connect_times: Mutex<Vec<Instant>>,
    stalled: AtomicBool,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    /// Queues one future connection and returns its frame sender. A
    /// connection with nothing queued stays open without frames.
    pub fn queue_connection(&self) -> mpsc::UnboundedSender<Result<Message, AppError>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.pending.lock().push_back(receiver);
        sender
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    /// Makes every later `connect` hang without resolving.
    pub fn stall_connects(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self, _symbol: &str, _interval: Interval) -> Result<FrameStream, AppError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times.lock().push(Instant::now());
        if self.stalled.load(Ordering::SeqCst) {
            return futures_util::future::pending().await;
        }
        let receiver = self.pending.lock().pop_front();
        match receiver {
            Some(receiver) => Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|frame| (frame, receiver))
            })
            .boxed()),
            None => Ok(futures_util::stream::pending().boxed()),
        }
    }
}

pub fn kline_frame(symbol: &str, interval: Interval, index: i64, close: f64, closed: bool) -> Message {
    let open_time = index * interval.duration_ms();
    let close_time = open_time + interval.duration_ms() - 1;
    Message::Text(format!(
        r#"{{"e":"kline","E":{close_time},"s":"{symbol}","k":{{"t":{open_time},"T":{close_time},"s":"{symbol}","i":"{interval}","o":"100.0","c":"{close}","h":"110.0","l":"90.0","v":"5.0","x":{closed}}}}}"#
    ))
}
