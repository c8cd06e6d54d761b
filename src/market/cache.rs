use crate::market::types::{now_unix_ms, Candle, CurrentPrice, Interval, StreamKey};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Most recent completed candles per (symbol, interval), oldest evicted
/// first once a series holds `capacity` entries.
#[derive(Debug)]
pub struct RollingCandleCache {
    capacity: usize,
    series: RwLock<HashMap<StreamKey, VecDeque<Candle>>>,
}

impl Default for RollingCandleCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl RollingCandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, candle: Candle) {
        let key = candle.key();
        let mut series = self.series.write();
        let window = series
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        // A bar re-sent after a reconnect replaces its earlier copy.
        if let Some(last) = window.back_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return;
            }
        }

        window.push_back(candle);
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    /// Seeds a series from storage. Candles a live stream appended while
    /// storage was being read stay after the stored tail; the merged window
    /// is deduplicated by open time and trimmed to `capacity`.
    pub fn merge_stored(&self, key: StreamKey, stored: Vec<Candle>) {
        let mut series = self.series.write();
        let window = series.entry(key).or_default();
        let stored_tail = stored.last().map(|candle| candle.open_time);

        let mut merged = stored;
        merged.extend(
            window
                .drain(..)
                .filter(|candle| stored_tail.map_or(true, |tail| candle.open_time > tail)),
        );
        merged.dedup_by_key(|candle| candle.open_time);

        let skip = merged.len().saturating_sub(self.capacity);
        window.extend(merged.into_iter().skip(skip));
    }

    pub fn snapshot(&self, symbol: &str, interval: Interval) -> Option<Vec<Candle>> {
        let key = StreamKey::new(symbol, interval);
        self.series
            .read()
            .get(&key)
            .filter(|window| !window.is_empty())
            .map(|window| window.iter().cloned().collect())
    }

    pub fn len(&self, symbol: &str, interval: Interval) -> usize {
        let key = StreamKey::new(symbol, interval);
        self.series.read().get(&key).map_or(0, VecDeque::len)
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }
}

#[derive(Debug, Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<String, CurrentPrice>>,
}

impl PriceCache {
    pub fn set(&self, symbol: &str, price: f64) {
        let entry = CurrentPrice {
            price,
            updated_at: now_unix_ms(),
        };
        self.prices.write().insert(symbol.to_string(), entry);
    }

    pub fn get(&self, symbol: &str) -> Option<CurrentPrice> {
        self.prices.read().get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::sample_candle;

    #[test]
    fn evicts_oldest_candle_past_capacity() {
        let cache = RollingCandleCache::new(DEFAULT_CACHE_CAPACITY);
        for index in 0..=DEFAULT_CACHE_CAPACITY as i64 {
            cache.append(sample_candle("BTCUSDT", Interval::M1, index));
        }

        let candles = cache
            .snapshot("BTCUSDT", Interval::M1)
            .expect("series should be cached");
        assert_eq!(candles.len(), DEFAULT_CACHE_CAPACITY);
        assert_eq!(candles[0].open_time, Interval::M1.duration_ms());
        assert_eq!(
            candles[DEFAULT_CACHE_CAPACITY - 1].open_time,
            DEFAULT_CACHE_CAPACITY as i64 * Interval::M1.duration_ms()
        );
    }

    #[test]
    fn repeated_bar_replaces_latest_entry() {
        let cache = RollingCandleCache::new(5);
        let mut candle = sample_candle("ETHUSDT", Interval::M5, 3);
        cache.append(candle.clone());
        candle.close = 1.0;
        cache.append(candle.clone());

        assert_eq!(cache.len("ETHUSDT", Interval::M5), 1);
        assert_eq!(
            cache.snapshot("ETHUSDT", Interval::M5).expect("cached")[0].close,
            1.0
        );
    }

    #[test]
    fn series_are_independent_per_interval() {
        let cache = RollingCandleCache::new(3);
        cache.append(sample_candle("SOLUSDT", Interval::M1, 0));
        cache.append(sample_candle("SOLUSDT", Interval::H1, 0));

        assert_eq!(cache.series_count(), 2);
        assert!(cache.snapshot("SOLUSDT", Interval::M5).is_none());
    }

    fn cached_indexes(cache: &RollingCandleCache, symbol: &str, interval: Interval) -> Vec<i64> {
        cache
            .snapshot(symbol, interval)
            .expect("series should be cached")
            .iter()
            .map(|candle| candle.open_time / interval.duration_ms())
            .collect()
    }

    #[test]
    fn merge_stored_keeps_newest_candles() {
        let cache = RollingCandleCache::new(2);
        let candles: Vec<Candle> = (0..5)
            .map(|index| sample_candle("XRPUSDT", Interval::H1, index))
            .collect();
        cache.merge_stored(StreamKey::new("XRPUSDT", Interval::H1), candles);

        assert_eq!(cached_indexes(&cache, "XRPUSDT", Interval::H1), vec![3, 4]);
    }

    #[test]
    fn merge_stored_keeps_bars_appended_during_the_storage_read() {
        let cache = RollingCandleCache::new(10);
        let stored: Vec<Candle> = (0..=4)
            .map(|index| sample_candle("BTCUSDT", Interval::M1, index))
            .collect();

        cache.append(sample_candle("BTCUSDT", Interval::M1, 5));
        cache.merge_stored(StreamKey::new("BTCUSDT", Interval::M1), stored);
        cache.append(sample_candle("BTCUSDT", Interval::M1, 6));

        assert_eq!(
            cached_indexes(&cache, "BTCUSDT", Interval::M1),
            vec![0, 1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn merge_stored_prefers_storage_for_bars_it_already_holds() {
        let cache = RollingCandleCache::new(4);
        cache.append(sample_candle("ETHUSDT", Interval::M1, 2));
        cache.append(sample_candle("ETHUSDT", Interval::M1, 3));
        let stored: Vec<Candle> = (0..=3)
            .map(|index| sample_candle("ETHUSDT", Interval::M1, index))
            .collect();

        cache.merge_stored(StreamKey::new("ETHUSDT", Interval::M1), stored);

        assert_eq!(cached_indexes(&cache, "ETHUSDT", Interval::M1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn price_cache_overwrites() {
        let prices = PriceCache::default();
        assert!(prices.is_empty());
        prices.set("BTCUSDT", 1.0);
        prices.set("BTCUSDT", 2.0);
        assert_eq!(prices.get("BTCUSDT").map(|entry| entry.price), Some(2.0));
        assert_eq!(prices.len(), 1);
    }
}
