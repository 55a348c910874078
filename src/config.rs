use crate::models::{PoolDescriptor, StrategyKind, Timeframe};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Harvest behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub enabled: bool,
    /// Bins the active bin must have traded through before a harvest fires
    pub min_bins: i32,
    /// Price-move fraction backing the fallback test when the SDK read fails
    pub min_price_move: f64,
    /// Share of liquidity removed from crossed bins, in bps
    pub bps_threshold: u16,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bins: 5,
            min_price_move: 0.01,
            bps_threshold: 10_000,
        }
    }
}

/// Trading parameters that may change at runtime through the command surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    pub rsi_period: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub check_interval_secs: u64,
    pub position_factors: HashMap<Timeframe, f64>,
    pub harvest: HarvestConfig,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            oversold: 30.0,
            overbought: 70.0,
            check_interval_secs: 60,
            position_factors: Timeframe::ALL.iter().map(|tf| (*tf, 0.1)).collect(),
            harvest: HarvestConfig::default(),
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if !(2..=100).contains(&self.rsi_period) {
            bail!("rsi_period must be in [2, 100], got {}", self.rsi_period);
        }
        if !(1.0..=50.0).contains(&self.oversold) {
            bail!("oversold threshold must be in [1, 50], got {}", self.oversold);
        }
        if !(50.0..=99.0).contains(&self.overbought) {
            bail!(
                "overbought threshold must be in [50, 99], got {}",
                self.overbought
            );
        }
        if self.check_interval_secs < 1 {
            bail!("check_interval must be at least 1s");
        }
        for (tf, factor) in &self.position_factors {
            if !(0.0..=1.0).contains(factor) {
                bail!("position factor for {} must be in [0, 1], got {}", tf, factor);
            }
        }
        if self.harvest.min_bins < 1 {
            bail!("harvest min_bins must be positive");
        }
        if self.harvest.bps_threshold == 0 || self.harvest.bps_threshold > 10_000 {
            bail!("harvest bps_threshold must be in (0, 10000]");
        }
        Ok(())
    }

    pub fn position_factor(&self, tf: Timeframe) -> f64 {
        self.position_factors.get(&tf).copied().unwrap_or(0.0)
    }

    /// Apply a partial update, rejecting it atomically if the result is invalid
    pub fn apply_patch(&mut self, patch: &TunablesPatch) -> Result<()> {
        let mut next = self.clone();
        if let Some(v) = patch.rsi_period {
            next.rsi_period = v;
        }
        if let Some(v) = patch.oversold {
            next.oversold = v;
        }
        if let Some(v) = patch.overbought {
            next.overbought = v;
        }
        if let Some(v) = patch.check_interval_secs {
            next.check_interval_secs = v;
        }
        if let Some(factors) = &patch.position_factors {
            for (tf, f) in factors {
                next.position_factors.insert(*tf, *f);
            }
        }
        if let Some(v) = patch.harvest_enabled {
            next.harvest.enabled = v;
        }
        if let Some(v) = patch.harvest_min_bins {
            next.harvest.min_bins = v;
        }
        if let Some(v) = patch.harvest_min_price_move {
            next.harvest.min_price_move = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Tunables shared between the scheduler, caches and the command surface
pub type SharedTunables = std::sync::Arc<std::sync::RwLock<Tunables>>;

/// Partial tunables update accepted by the command surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunablesPatch {
    pub rsi_period: Option<usize>,
    pub oversold: Option<f64>,
    pub overbought: Option<f64>,
    pub check_interval_secs: Option<u64>,
    pub position_factors: Option<HashMap<Timeframe, f64>>,
    pub harvest_enabled: Option<bool>,
    pub harvest_min_bins: Option<i32>,
    pub harvest_min_price_move: Option<f64>,
}

/// Token identity and normalization info
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub mint: Pubkey,
    pub symbol: String,
    pub decimals: u8,
}

/// Transaction submission settings
#[derive(Debug, Clone)]
pub struct TxConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub skip_preflight: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            max_retries: 5,
            skip_preflight: false,
        }
    }
}

/// Settle pauses between position-close phases. Zeroed in tests.
#[derive(Debug, Clone)]
pub struct CloseTuning {
    /// Wait after liquidity removal before claiming
    pub remove_settle: Duration,
    /// Wait after claiming before closing the account
    pub claim_settle: Duration,
    /// Wait between closing an old position and creating its replacement
    pub replace_wait: Duration,
    /// Pause between chain-sync batches
    pub sync_pause: Duration,
    /// Base pause of the create-retry ladder after a slippage rejection
    pub slippage_backoff_base: Duration,
}

impl Default for CloseTuning {
    fn default() -> Self {
        Self {
            remove_settle: Duration::from_secs(2),
            claim_settle: Duration::from_millis(1500),
            replace_wait: Duration::from_secs(1),
            sync_pause: Duration::from_secs(1),
            slippage_backoff_base: Duration::from_secs(2),
        }
    }
}

impl CloseTuning {
    /// No pauses at all, for tests
    pub fn immediate() -> Self {
        Self {
            remove_settle: Duration::ZERO,
            claim_settle: Duration::ZERO,
            replace_wait: Duration::ZERO,
            sync_pause: Duration::ZERO,
            slippage_backoff_base: Duration::ZERO,
        }
    }
}

/// Full bot configuration, loaded from the environment at startup
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub symbol: String,
    pub base_token: TokenInfo,
    pub quote_token: TokenInfo,
    pub rpc_url: String,
    pub market_data_url: String,
    pub dlmm_adapter_url: String,
    pub wallet_seed_phrase: String,
    pub data_dir: PathBuf,
    pub enabled_timeframes: Vec<Timeframe>,
    pub pools: HashMap<Timeframe, PoolDescriptor>,
    pub tx: TxConfig,
    pub close: CloseTuning,
    pub tunables: Tunables,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Env var suffix for a timeframe (POOL_ID_1M, POSITION_FACTOR_4H, ...)
fn tf_suffix(tf: Timeframe) -> String {
    tf.as_str().to_uppercase()
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        let mut position_factors = HashMap::new();
        for tf in Timeframe::ALL {
            let key = format!("POSITION_FACTOR_{}", tf_suffix(tf));
            position_factors.insert(tf, env_parse(&key, 0.1)?);
        }

        let default_strategy: StrategyKind = env_or("TRADING_STRATEGY", "Spot")
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let mut pools = HashMap::new();
        let mut enabled = Vec::new();
        let requested: Vec<Timeframe> = env_or("ENABLED_TIMEFRAMES", "1m,15m,1h,4h,1d")
            .split(',')
            .map(|s| s.trim().parse::<Timeframe>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!(e))?;

        for tf in requested {
            let suffix = tf_suffix(tf);
            let pool_key = format!("POOL_ID_{}", suffix);
            let Ok(pool_raw) = std::env::var(&pool_key) else {
                // A timeframe without a pool is disabled, the rest keep running
                tracing::warn!("{} not set, timeframe {} disabled", pool_key, tf);
                continue;
            };
            let pool_id = Pubkey::from_str(&pool_raw)
                .with_context(|| format!("invalid pubkey in {}", pool_key))?;
            let bin_step_bps: u16 = env_parse(&format!("BIN_STEP_{}", suffix), 20)?;
            let base_fee_pct: f64 = env_parse(&format!("BASE_FEE_{}", suffix), 0.2)?;
            let max_fee_pct: f64 =
                env_parse(&format!("MAX_FEE_{}", suffix), base_fee_pct * 10.0)?;
            let strategy = match std::env::var(format!("STRATEGY_TYPE_{}", suffix)) {
                Ok(raw) => raw.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                Err(_) => default_strategy,
            };
            pools.insert(
                tf,
                PoolDescriptor {
                    pool_id,
                    bin_step_bps,
                    base_fee_pct,
                    max_fee_pct,
                    strategy,
                },
            );
            enabled.push(tf);
        }

        let tunables = Tunables {
            rsi_period: env_parse("RSI_PERIOD", 14)?,
            oversold: env_parse("RSI_OVERSOLD_THRESHOLD", 30.0)?,
            overbought: env_parse("RSI_OVERBOUGHT_THRESHOLD", 70.0)?,
            check_interval_secs: env_parse("DEFAULT_CHECK_INTERVAL", 60)?,
            position_factors,
            harvest: HarvestConfig {
                enabled: env_bool("HARVEST_ENABLED", true),
                min_bins: env_parse("HARVEST_MIN_BINS", 5)?,
                min_price_move: env_parse("HARVEST_MIN_PRICE_MOVE", 0.01)?,
                bps_threshold: env_parse("HARVEST_BPS_THRESHOLD", 10_000)?,
            },
        };

        let config = Self {
            symbol: env_or("TRADING_SYMBOL", "SOLUSDT"),
            base_token: TokenInfo {
                mint: Pubkey::from_str(&env_or(
                    "BASE_TOKEN_MINT",
                    "So11111111111111111111111111111111111111112",
                ))
                .context("invalid BASE_TOKEN_MINT")?,
                symbol: env_or("BASE_TOKEN_SYMBOL", "SOL"),
                decimals: env_parse("BASE_TOKEN_DECIMALS", 9)?,
            },
            quote_token: TokenInfo {
                mint: Pubkey::from_str(&env_or(
                    "QUOTE_TOKEN_MINT",
                    "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                ))
                .context("invalid QUOTE_TOKEN_MINT")?,
                symbol: env_or("QUOTE_TOKEN_SYMBOL", "USDC"),
                decimals: env_parse("QUOTE_TOKEN_DECIMALS", 6)?,
            },
            rpc_url: env_or("RPC_URL", "https://api.mainnet-beta.solana.com"),
            market_data_url: env_or("MARKET_DATA_URL", "https://api.binance.com"),
            dlmm_adapter_url: env_or("DLMM_ADAPTER_URL", "http://127.0.0.1:8191"),
            wallet_seed_phrase: std::env::var("WALLET_SEED_PHRASE")
                .context("WALLET_SEED_PHRASE not set")?,
            data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
            enabled_timeframes: enabled,
            pools,
            tx: TxConfig {
                timeout: Duration::from_millis(env_parse("TRANSACTION_TIMEOUT", 180_000u64)?),
                max_retries: env_parse("TRANSACTION_MAX_RETRIES", 5)?,
                skip_preflight: env_bool("TRANSACTION_SKIP_PREFLIGHT", false),
            },
            close: CloseTuning::default(),
            tunables,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tunables.validate()?;
        if self.enabled_timeframes.is_empty() {
            bail!("no timeframe has a configured pool");
        }
        for tf in &self.enabled_timeframes {
            let pool = self
                .pools
                .get(tf)
                .with_context(|| format!("enabled timeframe {} has no pool descriptor", tf))?;
            if pool.bin_step_bps == 0 {
                bail!("bin step for {} must be positive", tf);
            }
        }
        if self.tx.max_retries == 0 {
            bail!("TRANSACTION_MAX_RETRIES must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables_valid() {
        Tunables::default().validate().unwrap();
    }

    #[test]
    fn test_rsi_period_bounds() {
        let mut t = Tunables::default();
        t.rsi_period = 1;
        assert!(t.validate().is_err());
        t.rsi_period = 101;
        assert!(t.validate().is_err());
        t.rsi_period = 2;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds() {
        let mut t = Tunables::default();
        t.oversold = 0.5;
        assert!(t.validate().is_err());
        t.oversold = 30.0;
        t.overbought = 49.0;
        assert!(t.validate().is_err());
        t.overbought = 99.0;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_factor_bounds() {
        let mut t = Tunables::default();
        t.position_factors.insert(Timeframe::H1, 1.5);
        assert!(t.validate().is_err());
        t.position_factors.insert(Timeframe::H1, 1.0);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_patch_applies_atomically() {
        let mut t = Tunables::default();

        // Invalid patch leaves everything untouched
        let bad = TunablesPatch {
            oversold: Some(25.0),
            overbought: Some(20.0),
            ..Default::default()
        };
        assert!(t.apply_patch(&bad).is_err());
        assert_eq!(t.oversold, 30.0);
        assert_eq!(t.overbought, 70.0);

        let good = TunablesPatch {
            oversold: Some(25.0),
            ..Default::default()
        };
        t.apply_patch(&good).unwrap();
        assert_eq!(t.oversold, 25.0);
    }

    #[test]
    fn test_patch_partial_factors() {
        let mut t = Tunables::default();
        let patch = TunablesPatch {
            position_factors: Some([(Timeframe::H4, 0.5)].into_iter().collect()),
            ..Default::default()
        };
        t.apply_patch(&patch).unwrap();
        assert_eq!(t.position_factor(Timeframe::H4), 0.5);
        // Untouched timeframes keep their factor
        assert_eq!(t.position_factor(Timeframe::H1), 0.1);
    }
}
