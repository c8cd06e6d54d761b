use crate::market::binance::ExchangeApi;
use crate::market::types::{parse_price, Ticker24hrWire, DEFAULT_MIN_PRICE, DEFAULT_QUOTE_ASSET};
use std::collections::HashSet;
use std::sync::Arc;

/// Served when the ticker listing cannot be fetched or yields nothing.
pub const FALLBACK_SYMBOLS: [&str; 35] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "XRPUSDT", "SOLUSDT", "DOTUSDT", "DOGEUSDT",
    "AVAXUSDT", "MATICUSDT", "LTCUSDT", "LINKUSDT", "UNIUSDT", "ATOMUSDT", "ETCUSDT", "XLMUSDT",
    "VETUSDT", "FILUSDT", "TRXUSDT", "EOSUSDT", "AAVEUSDT", "MKRUSDT", "COMPUSDT", "YFIUSDT",
    "SUSHIUSDT", "SNXUSDT", "CRVUSDT", "BALUSDT", "1INCHUSDT", "ENJUSDT", "MANAUSDT", "SANDUSDT",
    "CHZUSDT", "GALAUSDT", "AXSUSDT",
];

pub fn fallback_symbols() -> Vec<String> {
    FALLBACK_SYMBOLS.iter().map(|symbol| symbol.to_string()).collect()
}

/// Keeps symbols quoted in `quote_asset` whose last price is at least
/// `min_price`, in listing order. Unparseable prices are skipped.
pub fn filter_tickers(tickers: Vec<Ticker24hrWire>, quote_asset: &str, min_price: f64) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut symbols = Vec::new();

    for ticker in tickers {
        if !ticker.symbol.ends_with(quote_asset) || ticker.symbol.len() == quote_asset.len() {
            continue;
        }
        let Ok(price) = parse_price(&ticker.last_price) else {
            continue;
        };
        if price < min_price {
            tracing::debug!(symbol = %ticker.symbol, price, min_price, "excluded below price floor");
            continue;
        }
        if seen.insert(ticker.symbol.clone()) {
            symbols.push(ticker.symbol);
        }
    }

    symbols
}

pub struct SymbolDiscovery {
    api: Arc<dyn ExchangeApi>,
    quote_asset: String,
    min_price: f64,
}

impl SymbolDiscovery {
    pub fn new(api: Arc<dyn ExchangeApi>, quote_asset: impl Into<String>, min_price: f64) -> Self {
        Self {
            api,
            quote_asset: quote_asset.into().to_ascii_uppercase(),
            min_price,
        }
    }

    pub fn with_defaults(api: Arc<dyn ExchangeApi>) -> Self {
        Self::new(api, DEFAULT_QUOTE_ASSET, DEFAULT_MIN_PRICE)
    }

    /// Never fails: any listing error degrades to [`FALLBACK_SYMBOLS`].
    pub async fn discover_symbols(&self) -> Vec<String> {
        match self.api.fetch_24hr_tickers().await {
            Ok(tickers) => {
                let listed = tickers.len();
                let symbols = filter_tickers(tickers, &self.quote_asset, self.min_price);
                if symbols.is_empty() {
                    tracing::warn!(listed, quote = %self.quote_asset, "no symbol passed the filters, using fallback list");
                    return fallback_symbols();
                }
                tracing::info!(listed, selected = symbols.len(), quote = %self.quote_asset, "discovered tradable symbols");
                symbols
            }
            Err(error) => {
                tracing::warn!(%error, fallback = FALLBACK_SYMBOLS.len(), "symbol listing failed, using fallback list");
                fallback_symbols()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::binance::BinanceRestClient;
    use crate::market::testing::FakeExchange;
    use std::time::Duration;

    #[tokio::test]
    async fn filters_by_quote_asset_and_price_floor() {
        let exchange = FakeExchange::with_tickers(&[
            ("BTCUSDT", "65000.10"),
            ("SHIBUSDT", "0.00002"),
            ("ETHBTC", "0.05"),
            ("ADAUSDT", "0.50"),
            ("BADUSDT", "not-a-number"),
            ("BTCUSDT", "65000.10"),
        ]);
        let discovery = SymbolDiscovery::with_defaults(Arc::new(exchange));

        let symbols = discovery.discover_symbols().await;

        assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ADAUSDT".to_string()]);
    }

    #[tokio::test]
    async fn listing_failure_returns_fallback_list() {
        let discovery = SymbolDiscovery::with_defaults(Arc::new(FakeExchange::default()));

        let symbols = discovery.discover_symbols().await;

        assert_eq!(symbols.len(), FALLBACK_SYMBOLS.len());
        assert_eq!(symbols[0], "BTCUSDT");
    }

    #[tokio::test]
    async fn unreachable_endpoint_returns_fallback_list() {
        let client = BinanceRestClient::new(
            "http://127.0.0.1:9",
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .expect("client should build");
        let discovery = SymbolDiscovery::with_defaults(Arc::new(client));

        let symbols = discovery.discover_symbols().await;

        assert!(!symbols.is_empty());
        assert_eq!(symbols, fallback_symbols());
    }

    #[test]
    fn bare_quote_asset_is_not_a_symbol() {
        let tickers = vec![Ticker24hrWire {
            symbol: "USDT".to_string(),
            last_price: "1.0".to_string(),
        }];
        assert!(filter_tickers(tickers, "USDT", 0.5).is_empty());
    }
}
