pub mod backfill;
pub mod binance;
pub mod cache;
pub mod discovery;
pub mod persistence;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
