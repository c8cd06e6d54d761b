use crate::error::AppError;
use crate::market::types::{parse_price, Candle, Interval, KlineWire, Ticker24hrWire, TickerPriceWire};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

pub const BINANCE_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
pub const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
pub const BINANCE_MAX_KLINES_PER_REQUEST: u16 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PRICE_TIMEOUT: Duration = Duration::from_secs(5);

pub type FrameStream = BoxStream<'static, Result<Message, AppError>>;

fn kline_stream_endpoint(base_url: &str, symbol: &str, interval: Interval) -> String {
    format!(
        "{}/{}@kline_{}",
        base_url.trim_end_matches('/'),
        symbol.to_ascii_lowercase(),
        interval.as_str()
    )
}

fn klines_endpoint(base_url: &str, symbol: &str, interval: Interval, limit: u16) -> String {
    let limit = limit.clamp(1, BINANCE_MAX_KLINES_PER_REQUEST);
    format!("{}/api/v3/klines", base_url.trim_end_matches('/'))
        + &format!(
            "?symbol={}&interval={}&limit={limit}",
            symbol.to_ascii_uppercase(),
            interval.as_str()
        )
}

fn ticker_24hr_endpoint(base_url: &str) -> String {
    format!("{}/api/v3/ticker/24hr", base_url.trim_end_matches('/'))
}

fn ticker_price_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{}/api/v3/ticker/price", base_url.trim_end_matches('/'))
        + &format!("?symbol={}", symbol.to_ascii_uppercase())
}

/// Request/response side of the exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Most recent `limit` candles, oldest first.
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u16,
    ) -> Result<Vec<Candle>, AppError>;

    async fn fetch_24hr_tickers(&self) -> Result<Vec<Ticker24hrWire>, AppError>;

    async fn fetch_ticker_price(&self, symbol: &str) -> Result<f64, AppError>;
}

/// Streaming side of the exchange: one connection per (symbol, interval).
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, symbol: &str, interval: Interval) -> Result<FrameStream, AppError>;
}

#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    price_timeout: Duration,
}

impl BinanceRestClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        price_timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            price_timeout,
        })
    }

    pub fn with_defaults() -> Result<Self, AppError> {
        Self::new(BINANCE_REST_BASE_URL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_PRICE_TIMEOUT)
    }
}

#[async_trait]
impl ExchangeApi for BinanceRestClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u16,
    ) -> Result<Vec<Candle>, AppError> {
        let endpoint = klines_endpoint(&self.base_url, symbol, interval, limit);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<Vec<KlineWire>>().await?;

        let mut candles = Vec::with_capacity(payload.len());
        for kline in payload {
            candles.push(kline.into_candle(symbol, interval)?);
        }
        candles.sort_unstable_by_key(|candle| candle.open_time);
        candles.dedup_by_key(|candle| candle.open_time);
        Ok(candles)
    }

    async fn fetch_24hr_tickers(&self) -> Result<Vec<Ticker24hrWire>, AppError> {
        let endpoint = ticker_24hr_endpoint(&self.base_url);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        Ok(response.json::<Vec<Ticker24hrWire>>().await?)
    }

    async fn fetch_ticker_price(&self, symbol: &str) -> Result<f64, AppError> {
        let endpoint = ticker_price_endpoint(&self.base_url, symbol);
        let response = self
            .client
            .get(endpoint)
            .timeout(self.price_timeout)
            .send()
            .await?
            .error_for_status()?;
        let payload = response.json::<TickerPriceWire>().await?;
        if !payload.symbol.eq_ignore_ascii_case(symbol) {
            return Err(AppError::DataGap(format!(
                "price response for '{}' while asking for '{symbol}'",
                payload.symbol
            )));
        }
        parse_price(&payload.price)
    }
}

#[derive(Debug, Clone)]
pub struct BinanceStreamConnector {
    base_url: String,
}

impl BinanceStreamConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for BinanceStreamConnector {
    fn default() -> Self {
        Self::new(BINANCE_STREAM_BASE_URL)
    }
}

#[async_trait]
impl StreamConnector for BinanceStreamConnector {
    async fn connect(&self, symbol: &str, interval: Interval) -> Result<FrameStream, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let request = kline_stream_endpoint(&self.base_url, symbol, interval);
        let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
        Ok(stream.map(|frame| frame.map_err(AppError::from)).boxed())
    }
}
