// Technical indicators: RSI math plus the tiered multi-timeframe cache
pub mod cache;
pub mod rsi;

pub use cache::IndicatorCache;
pub use rsi::calculate_rsi;
