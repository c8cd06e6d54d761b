use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_QUOTE_ASSET: &str = "USDT";
pub const DEFAULT_MIN_PRICE: f64 = 0.5;
pub const DEFAULT_INTERVAL: Interval = Interval::H1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 13] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H12,
        Self::D1,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| AppError::InvalidArgument(format!("unsupported interval '{trimmed}'")))
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M3 => 180_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H2 => 7_200_000,
            Self::H4 => 14_400_000,
            Self::H6 => 21_600_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uppercases and validates an exchange symbol such as `btcusdt`.
pub fn normalize_symbol(symbol: &str) -> Result<String, AppError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub symbol: String,
    pub interval: Interval,
}

impl StreamKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentPrice {
    pub price: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

fn parse_finite(raw: &str, field: &str) -> Result<f64, AppError> {
    let value = raw.parse::<f64>()?;
    if !value.is_finite() {
        return Err(AppError::DataGap(format!("{field} must be finite, got '{raw}'")));
    }
    Ok(value)
}

pub fn parse_price(raw: &str) -> Result<f64, AppError> {
    let price = parse_finite(raw, "price")?;
    if price < 0.0 {
        return Err(AppError::DataGap(format!("price must be non-negative, got '{raw}'")));
    }
    Ok(price)
}

/// One row of `GET /api/v3/klines`.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl KlineWire {
    pub fn into_candle(self, symbol: &str, interval: Interval) -> Result<Candle, AppError> {
        Ok(Candle {
            symbol: symbol.to_string(),
            interval,
            open_time: self.0,
            open: parse_finite(&self.1, "open")?,
            high: parse_finite(&self.2, "high")?,
            low: parse_finite(&self.3, "low")?,
            close: parse_finite(&self.4, "close")?,
            volume: parse_finite(&self.5, "volume")?.max(0.0),
            close_time: self.6,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct KlineEventWire {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineBodyWire,
}

#[derive(Debug, Deserialize)]
pub struct KlineBodyWire {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: Interval,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// A decoded kline stream event. `is_closed` is false while the bar is
/// still forming.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub candle: Candle,
    pub is_closed: bool,
}

impl TryFrom<KlineEventWire> for KlineUpdate {
    type Error = AppError;

    fn try_from(value: KlineEventWire) -> Result<Self, Self::Error> {
        if value.event_type != "kline" {
            return Err(AppError::DataGap(format!(
                "unexpected event type '{}' for kline stream",
                value.event_type
            )));
        }

        let body = value.kline;
        let candle = Candle {
            symbol: normalize_symbol(&value.symbol)?,
            interval: body.interval,
            open_time: body.open_time,
            open: parse_finite(&body.open, "open")?,
            high: parse_finite(&body.high, "high")?,
            low: parse_finite(&body.low, "low")?,
            close: parse_finite(&body.close, "close")?,
            volume: parse_finite(&body.volume, "volume")?.max(0.0),
            close_time: body.close_time,
        };

        Ok(Self {
            candle,
            is_closed: body.is_closed,
        })
    }
}

pub fn parse_kline_payload(payload: &mut [u8]) -> Result<KlineUpdate, AppError> {
    let wire: KlineEventWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Deserialize)]
pub struct Ticker24hrWire {
    pub symbol: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
}

#[derive(Debug, Deserialize)]
pub struct TickerPriceWire {
    pub symbol: String,
    pub price: String,
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
pub(crate) fn sample_candle(symbol: &str, interval: Interval, index: i64) -> Candle {
    let open_time = index * interval.duration_ms();
    let base = 100.0 + index as f64;
    Candle {
        symbol: symbol.to_string(),
        interval,
        open_time,
        open: base,
        high: base + 2.0,
        low: base - 1.0,
        close: base + 1.0,
        volume: 10.0,
        close_time: open_time + interval.duration_ms() - 1,
    }
}
