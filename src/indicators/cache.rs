use crate::api::KlineSource;
use crate::config::SharedTunables;
use crate::indicators::rsi::calculate_rsi;
use crate::models::{RsiValue, Timeframe};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

/// Extra candles fetched beyond the RSI period so Wilder's smoothing settles
const HISTORY_PADDING: usize = 50;
const SPOT_PRICE_TTL: Duration = Duration::from_secs(30);

type RsiKey = (String, Timeframe, usize);
type Shared<T> = std::result::Result<T, String>;

struct CachedRsi {
    value: RsiValue,
    cached_at: Instant,
}

#[derive(Default)]
struct RsiState {
    entries: HashMap<RsiKey, CachedRsi>,
    /// Single-flight registry: one in-flight computation per key, everyone
    /// else subscribes to the leader's result
    pending: HashMap<RsiKey, broadcast::Sender<Shared<RsiValue>>>,
}

#[derive(Default)]
struct SpotState {
    entry: Option<(f64, Instant)>,
    pending: Option<broadcast::Sender<Shared<f64>>>,
}

enum Role<T> {
    Wait(broadcast::Receiver<Shared<T>>),
    Lead(broadcast::Sender<Shared<T>>),
}

/// RSI cache with timeframe-aware TTLs and single-flight deduplication.
///
/// The spot price has its own independently locked cache so a slow candle
/// fetch never blocks a price read.
pub struct IndicatorCache {
    source: Arc<dyn KlineSource>,
    tunables: SharedTunables,
    rsi_state: Mutex<RsiState>,
    spot_state: Mutex<SpotState>,
}

impl IndicatorCache {
    pub fn new(source: Arc<dyn KlineSource>, tunables: SharedTunables) -> Self {
        Self {
            source,
            tunables,
            rsi_state: Mutex::new(RsiState::default()),
            spot_state: Mutex::new(SpotState::default()),
        }
    }

    /// RSI for one timeframe. Serves the cached value while it is fresher
    /// than the timeframe's TTL unless `force_refresh` is set.
    pub async fn rsi(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: usize,
        force_refresh: bool,
    ) -> Result<RsiValue> {
        let key: RsiKey = (symbol.to_string(), timeframe, period);

        let role = {
            let mut state = self.rsi_state.lock().await;
            if !force_refresh {
                if let Some(cached) = state.entries.get(&key) {
                    if cached.cached_at.elapsed() < timeframe.rsi_cache_ttl() {
                        return Ok(cached.value.clone());
                    }
                }
            }
            if let Some(tx) = state.pending.get(&key) {
                Role::Wait(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                state.pending.insert(key.clone(), tx.clone());
                Role::Lead(tx)
            }
        };

        match role {
            Role::Wait(mut rx) => match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("in-flight RSI computation was dropped")),
            },
            Role::Lead(tx) => {
                let computed = self.compute_rsi(symbol, timeframe, period).await;
                let shared: Shared<RsiValue> = match &computed {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(format!("{:#}", e)),
                };
                {
                    let mut state = self.rsi_state.lock().await;
                    state.pending.remove(&key);
                    if let Ok(value) = &shared {
                        state.entries.insert(
                            key,
                            CachedRsi {
                                value: value.clone(),
                                cached_at: Instant::now(),
                            },
                        );
                    }
                }
                let _ = tx.send(shared);
                computed
            }
        }
    }

    /// RSI across several timeframes, sequential on purpose: each fetch can
    /// populate the cache before the next timeframe asks. A failing
    /// timeframe degrades to the neutral fallback and the rest continue.
    pub async fn rsi_all(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
        period: usize,
        force_refresh: bool,
    ) -> Vec<RsiValue> {
        let mut values = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            match self.rsi(symbol, *tf, period, force_refresh).await {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(
                        timeframe = %tf,
                        "RSI unavailable ({}), using neutral fallback",
                        e
                    );
                    values.push(RsiValue::neutral(*tf, Utc::now()));
                }
            }
        }
        values
    }

    /// Spot price with a 30 s TTL and the same single-flight discipline
    pub async fn spot_price(&self, symbol: &str) -> Result<f64> {
        let role = {
            let mut state = self.spot_state.lock().await;
            if let Some((price, at)) = state.entry {
                if at.elapsed() < SPOT_PRICE_TTL {
                    return Ok(price);
                }
            }
            if let Some(tx) = &state.pending {
                Role::Wait(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                state.pending = Some(tx.clone());
                Role::Lead(tx)
            }
        };

        match role {
            Role::Wait(mut rx) => match rx.recv().await {
                Ok(Ok(price)) => Ok(price),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("in-flight price fetch was dropped")),
            },
            Role::Lead(tx) => {
                let fetched = self
                    .source
                    .fetch_spot_price(symbol)
                    .await
                    .map_err(anyhow::Error::from);
                let shared: Shared<f64> = match &fetched {
                    Ok(p) => Ok(*p),
                    Err(e) => Err(format!("{:#}", e)),
                };
                {
                    let mut state = self.spot_state.lock().await;
                    state.pending = None;
                    if let Ok(price) = &shared {
                        state.entry = Some((*price, Instant::now()));
                    }
                }
                let _ = tx.send(shared);
                fetched
            }
        }
    }

    async fn compute_rsi(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: usize,
    ) -> Result<RsiValue> {
        let limit = period + HISTORY_PADDING;
        let candles = self.source.fetch_klines(symbol, timeframe, limit).await?;
        if candles.len() < period + 1 {
            anyhow::bail!(
                "only {} candles for {} {}, need {}",
                candles.len(),
                symbol,
                timeframe,
                period + 1
            );
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let value = calculate_rsi(&closes, period).context("RSI computation failed")?;

        let (oversold, overbought) = {
            let tunables = self.tunables.read().unwrap();
            (tunables.oversold, tunables.overbought)
        };
        let close_timestamp = candles.last().expect("non-empty").close_time;

        tracing::debug!(
            symbol,
            timeframe = %timeframe,
            value = format!("{:.2}", value),
            "Computed RSI"
        );

        Ok(RsiValue {
            timeframe,
            value,
            signal: RsiValue::classify(value, oversold, overbought),
            close_timestamp,
        })
    }
}
