use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Candle interval driving signal evaluation cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Cron period: signal evaluation and range checks fire once per duration
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M15 => Duration::from_secs(15 * 60),
            Timeframe::H1 => Duration::from_secs(60 * 60),
            Timeframe::H4 => Duration::from_secs(4 * 60 * 60),
            Timeframe::D1 => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// RSI cache TTL, calibrated below the cron period so a forced tick
    /// always lands on a fresh candle
    pub fn rsi_cache_ttl(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(45),
            Timeframe::M15 => Duration::from_secs(10 * 60),
            Timeframe::H1 => Duration::from_secs(50 * 60),
            Timeframe::H4 => Duration::from_secs(3 * 60 * 60 + 20 * 60),
            Timeframe::D1 => Duration::from_secs(23 * 60 * 60),
        }
    }

    /// Buffer applied around a position's price range before declaring it out of range
    pub fn range_buffer_pct(&self) -> f64 {
        match self {
            Timeframe::M1 => 0.02,
            Timeframe::M15 => 0.05,
            Timeframe::H1 => 0.08,
            Timeframe::H4 => 0.12,
            Timeframe::D1 => 0.20,
        }
    }

    /// Width of a freshly created one-sided position, in bins
    pub fn initial_bin_count(&self) -> i32 {
        match self {
            Timeframe::M1 => 45,
            Timeframe::M15 => 55,
            _ => 60,
        }
    }

    /// Minimum in-range price movement before a harvest is worth the fees
    pub fn harvest_threshold_pct(&self) -> f64 {
        match self {
            Timeframe::M1 => 0.05,
            Timeframe::M15 => 0.08,
            Timeframe::H1 => 0.10,
            Timeframe::H4 => 0.12,
            Timeframe::D1 => 0.15,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {}", other)),
        }
    }
}

/// Position side. BUY provides base-token liquidity above the entry price,
/// SELL provides quote-token liquidity below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("BUY"),
            Side::Sell => f.write_str("SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Liquidity distribution shape, passed through to the pool SDK untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    BidAsk,
    Curve,
    Spot,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BidAsk" => Ok(StrategyKind::BidAsk),
            "Curve" => Ok(StrategyKind::Curve),
            "Spot" => Ok(StrategyKind::Spot),
            other => Err(format!("unknown strategy type: {}", other)),
        }
    }
}

/// Immutable per-timeframe pool parameters, loaded from config at startup
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    pub pool_id: Pubkey,
    pub bin_step_bps: u16,
    pub base_fee_pct: f64,
    pub max_fee_pct: f64,
    pub strategy: StrategyKind,
}

/// One OHLC candle from the market data vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
}

/// Signal classification of an RSI value against the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RsiSignal {
    Oversold,
    Overbought,
    Neutral,
}

/// RSI computed for one timeframe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiValue {
    pub timeframe: Timeframe,
    pub value: f64,
    pub signal: RsiSignal,
    /// Close time of the candle that produced this value
    pub close_timestamp: DateTime<Utc>,
}

impl RsiValue {
    pub fn classify(value: f64, oversold: f64, overbought: f64) -> RsiSignal {
        if value < oversold {
            RsiSignal::Oversold
        } else if value > overbought {
            RsiSignal::Overbought
        } else {
            RsiSignal::Neutral
        }
    }

    /// Fallback used when a timeframe's computation fails: dead center, no signal
    pub fn neutral(timeframe: Timeframe, close_timestamp: DateTime<Utc>) -> Self {
        Self {
            timeframe,
            value: 50.0,
            signal: RsiSignal::Neutral,
            close_timestamp,
        }
    }
}

/// Contiguous bin interval a position's liquidity is spread over
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BinRange {
    pub min_bin: i32,
    pub max_bin: i32,
}

// Prices outside these bounds mean the range computation went wrong, not
// that the market moved. Such positions are invalid: never harvested,
// eligible for immediate close.
pub const PRICE_SANITY_MIN: f64 = 1.0;
pub const PRICE_SANITY_MAX: f64 = 10_000.0;

/// Price window a position was opened against, with its bin projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub bin_range: BinRange,
}

impl PriceRange {
    pub fn is_sane(&self) -> bool {
        self.min > PRICE_SANITY_MIN
            && self.max < PRICE_SANITY_MAX
            && self.min <= self.max
            && self.bin_range.min_bin < self.bin_range.max_bin
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Closed,
}

/// One on-chain one-sided liquidity position. The id is the position
/// account pubkey in base58 form and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pool_id: String,
    pub timeframe: Timeframe,
    pub side: Side,
    /// Base-token units for BUY, quote-token units for SELL
    pub amount: f64,
    pub entry_price: f64,
    pub created_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub price_range: PriceRange,
    pub last_range_check: DateTime<Utc>,
    #[serde(default)]
    pub has_been_harvested: bool,
    #[serde(default)]
    pub last_harvest_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }
}

/// Wallet balance at a point in time, human units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub base: f64,
    pub quote: f64,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the balance history. Entries older than 24 h are compressed
/// to one per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub base_qty: f64,
    pub quote_qty: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_daily_average: bool,
    #[serde(default)]
    pub original_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("3m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_ttl_below_cron_period() {
        for tf in Timeframe::ALL {
            assert!(
                tf.rsi_cache_ttl() < tf.duration(),
                "{} TTL must be below its period",
                tf
            );
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(RsiValue::classify(25.0, 30.0, 70.0), RsiSignal::Oversold);
        assert_eq!(RsiValue::classify(72.0, 30.0, 70.0), RsiSignal::Overbought);
        assert_eq!(RsiValue::classify(50.0, 30.0, 70.0), RsiSignal::Neutral);
        // The thresholds themselves are neutral
        assert_eq!(RsiValue::classify(30.0, 30.0, 70.0), RsiSignal::Neutral);
        assert_eq!(RsiValue::classify(70.0, 30.0, 70.0), RsiSignal::Neutral);
    }

    #[test]
    fn test_price_range_sanity() {
        let sane = PriceRange {
            min: 100.0,
            max: 110.0,
            bin_range: BinRange {
                min_bin: 100,
                max_bin: 160,
            },
        };
        assert!(sane.is_sane());

        let inverted = PriceRange {
            min: 110.0,
            max: 100.0,
            ..sane.clone()
        };
        assert!(!inverted.is_sane());

        let absurd = PriceRange {
            min: 0.0001,
            max: 110.0,
            ..sane.clone()
        };
        assert!(!absurd.is_sane());

        let flat_bins = PriceRange {
            bin_range: BinRange {
                min_bin: 5,
                max_bin: 5,
            },
            ..sane
        };
        assert!(!flat_bins.is_sane());
    }

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }
}
