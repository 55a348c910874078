use crate::chain::pool::PoolClient;
use crate::chain::rpc::ChainExecutor;
use crate::chain::sdk::{ActiveBin, CreatePositionRequest};
use crate::chain::wallet::BalanceProvider;
use crate::config::CloseTuning;
use crate::error::ChainError;
use crate::execution::store::PositionStore;
use crate::models::{
    BinRange, Position, PositionStatus, PriceRange, Side, Timeframe,
};
use anyhow::Result;
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Position minimums; smaller deposits are rejected at the boundary
pub const MIN_BASE_AMOUNT: f64 = 0.01;
pub const MIN_QUOTE_AMOUNT: f64 = 10.0;

const MAX_CREATE_ATTEMPTS: u32 = 5;
/// Bins shaved off the range on each slippage retry
const BIN_NARROW_STEP: i32 = 7;
const MIN_BIN_COUNT: i32 = 25;
const BASE_SLIPPAGE_PCT: f64 = 3.0;
const SLIPPAGE_STEP_PCT: f64 = 2.0;

/// Bin padding around the on-chain range when removing all liquidity, so
/// harvested remainders outside the reported bounds are swept too
const CLOSE_WIDEN_BINS: i32 = 200;
const CLOSE_REWIDEN_BINS: i32 = 500;

const SYNC_BATCH_SIZE: usize = 3;
/// A harvest below this many bins is not worth the transaction
const MIN_HARVEST_SPAN: i32 = 3;

/// Extreme out-of-range extends the normal buffer by another 50%
const EXTREME_BUFFER_FACTOR: f64 = 1.5;

/// Tokens received back by a close, signed wallet deltas
#[derive(Debug, Clone, Default)]
pub struct CloseOutcome {
    pub received_base: f64,
    pub received_quote: f64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SyncReport {
    pub updated: usize,
    pub total: usize,
}

/// True when a price sits beyond the buffered range by an additional half
/// buffer, i.e. far enough out that even a neutral signal closes
pub fn is_extremely_out_of_range(position: &Position, current_price: f64) -> bool {
    if !position.price_range.is_sane() {
        return true;
    }
    let buffer = position.price_range.width()
        * position.timeframe.range_buffer_pct()
        * EXTREME_BUFFER_FACTOR;
    current_price < position.price_range.min - buffer
        || current_price > position.price_range.max + buffer
}

/// "Already empty / already gone" outcomes the close protocol tolerates
fn tolerates_empty(error: &ChainError) -> bool {
    match error {
        ChainError::AccountNotFound(_) => true,
        ChainError::Fatal(message) => {
            let lower = message.to_lowercase();
            lower.contains("no liquidity") || lower.contains("already closed") || lower.contains("position is empty")
        }
        _ => false,
    }
}

fn slippage_retry_pause(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(1.5f64.powi(attempt as i32 - 1))
}

/// Orchestrates position lifecycle: creation with the narrowing retry
/// ladder, the three-phase close protocol, range validation, harvesting
/// and chain reconciliation. The only writer of position state.
pub struct PositionManager {
    pools: HashMap<Timeframe, Arc<PoolClient>>,
    chain: Arc<dyn ChainExecutor>,
    wallet: Arc<dyn BalanceProvider>,
    store: Arc<PositionStore>,
    /// In-flight close guard: one close (or harvest) per position at a time
    closing: Mutex<HashSet<String>>,
    tuning: CloseTuning,
}

impl PositionManager {
    pub fn new(
        pools: HashMap<Timeframe, Arc<PoolClient>>,
        chain: Arc<dyn ChainExecutor>,
        wallet: Arc<dyn BalanceProvider>,
        store: Arc<PositionStore>,
        tuning: CloseTuning,
    ) -> Self {
        Self {
            pools,
            chain,
            wallet,
            store,
            closing: Mutex::new(HashSet::new()),
            tuning,
        }
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    fn pool(&self, timeframe: Timeframe) -> Result<&Arc<PoolClient>, ChainError> {
        self.pools
            .get(&timeframe)
            .ok_or_else(|| ChainError::Validation(format!("no pool configured for {}", timeframe)))
    }

    /// Open a one-sided position. Retries slippage rejections up to five
    /// times, narrowing the bin range and widening the tolerance each time.
    pub async fn create(
        &self,
        timeframe: Timeframe,
        side: Side,
        amount: f64,
    ) -> Result<Position> {
        match side {
            Side::Buy if amount < MIN_BASE_AMOUNT => {
                return Err(ChainError::Validation(format!(
                    "BUY amount {} below minimum {}",
                    amount, MIN_BASE_AMOUNT
                ))
                .into());
            }
            Side::Sell if amount < MIN_QUOTE_AMOUNT => {
                return Err(ChainError::Validation(format!(
                    "SELL amount {} below minimum {}",
                    amount, MIN_QUOTE_AMOUNT
                ))
                .into());
            }
            _ => {}
        }

        let pool = self.pool(timeframe)?;
        let active = pool.active_bin().await?;
        let initial_bins = timeframe.initial_bin_count();

        let mut attempt = 1u32;
        loop {
            let bin_count = (initial_bins - BIN_NARROW_STEP * (attempt as i32 - 1)).max(MIN_BIN_COUNT);
            let slippage_pct = BASE_SLIPPAGE_PCT + SLIPPAGE_STEP_PCT * (attempt as f64 - 1.0);

            let (min_bin, max_bin, amount_base, amount_quote) = match side {
                Side::Buy => (active.bin_id, active.bin_id + bin_count, amount, 0.0),
                Side::Sell => (active.bin_id - bin_count, active.bin_id, 0.0, amount),
            };

            // Bin array init is idempotent; "already initialized" just means
            // someone else paid the rent
            match pool.ensure_bin_arrays(min_bin, max_bin).await {
                Ok(txs) => {
                    for tx in txs {
                        self.chain.submit(tx, vec![], "init-bin-arrays").await?;
                    }
                }
                Err(e) => {
                    tracing::debug!("Bin array init skipped: {}", e);
                }
            }

            let request = CreatePositionRequest {
                side,
                amount_base,
                amount_quote,
                min_bin,
                max_bin,
                strategy: pool.descriptor().strategy,
                slippage_pct,
            };

            let submitted: Result<Pubkey, ChainError> = async {
                let created = pool.create_one_sided_position(&request).await?;
                let position_key = created.position.pubkey();
                self.chain
                    .submit(created.tx, vec![created.position.clone()], "create-position")
                    .await?;
                Ok(position_key)
            }
            .await;

            match submitted {
                Ok(position_key) => {
                    let price_range =
                        price_range_for_bins(pool, &active, side, min_bin, max_bin, bin_count);
                    let position = Position {
                        id: position_key.to_string(),
                        pool_id: pool.pool_id().to_string(),
                        timeframe,
                        side,
                        amount,
                        entry_price: active.price,
                        created_at: Utc::now(),
                        status: PositionStatus::Active,
                        price_range,
                        last_range_check: Utc::now(),
                        has_been_harvested: false,
                        last_harvest_at: None,
                    };
                    self.store.insert(position.clone())?;
                    tracing::info!(
                        id = %position.id,
                        timeframe = %timeframe,
                        side = %side,
                        amount,
                        bins = bin_count,
                        "Position opened [{:.4}, {:.4}] @ {:.4}",
                        position.price_range.min,
                        position.price_range.max,
                        position.entry_price
                    );
                    return Ok(position);
                }
                Err(ChainError::SlippageExceeded) if attempt < MAX_CREATE_ATTEMPTS => {
                    let pause = slippage_retry_pause(self.tuning.slippage_backoff_base, attempt);
                    tracing::warn!(
                        timeframe = %timeframe,
                        attempt,
                        "Slippage tolerance exceeded, retrying with {} bins in {:?}",
                        (bin_count - BIN_NARROW_STEP).max(MIN_BIN_COUNT),
                        pause
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close a position through the three-phase protocol. A second close
    /// for the same id while one is in flight returns immediately; closing
    /// an already CLOSED position is a no-op.
    pub async fn close(&self, id: &str, force: bool) -> Result<CloseOutcome> {
        {
            let mut closing = self.closing.lock().await;
            if !closing.insert(id.to_string()) {
                tracing::debug!(id, "Close already in flight");
                return Ok(CloseOutcome::default());
            }
        }
        let result = self.close_inner(id, force).await;
        self.closing.lock().await.remove(id);
        result
    }

    async fn close_inner(&self, id: &str, force: bool) -> Result<CloseOutcome> {
        let Some(position) = self.store.get(id) else {
            return Err(ChainError::Validation(format!("unknown position {}", id)).into());
        };
        if position.status == PositionStatus::Closed {
            return Ok(CloseOutcome::default());
        }

        let pool = self.pool(position.timeframe)?;
        let position_key = Pubkey::from_str(id)
            .map_err(|e| ChainError::Validation(format!("position id {}: {}", id, e)))?;

        let before = match self.wallet.balance(true).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::warn!("Balance snapshot before close failed: {}", e);
                None
            }
        };

        if let Err(e) = self.close_onchain(pool, &position_key).await {
            if force {
                tracing::warn!(
                    id,
                    "Unrecoverable on-chain error, force-closing in memory: {}",
                    e
                );
            } else {
                return Err(e.into());
            }
        }

        let after = if before.is_some() {
            self.wallet.balance(true).await.ok()
        } else {
            None
        };

        self.store
            .update(id, |p| p.status = PositionStatus::Closed)?;

        let outcome = match (before, after) {
            (Some(b), Some(a)) => CloseOutcome {
                received_base: a.base - b.base,
                received_quote: a.quote - b.quote,
            },
            _ => CloseOutcome::default(),
        };

        tracing::info!(
            id,
            timeframe = %position.timeframe,
            "Position closed, received {:+.6} base / {:+.4} quote",
            outcome.received_base,
            outcome.received_quote
        );
        Ok(outcome)
    }

    /// Phases 1-3. Every step tolerates "already empty / already closed".
    async fn close_onchain(
        &self,
        pool: &Arc<PoolClient>,
        position_key: &Pubkey,
    ) -> Result<(), ChainError> {
        // Phase 1: drain all liquidity, with padding for harvested remainders
        self.remove_all_liquidity(pool, position_key, CLOSE_WIDEN_BINS, false)
            .await?;
        tokio::time::sleep(self.tuning.remove_settle).await;

        // Phase 2: claim fees and rewards; nothing to claim is fine
        match pool.claim_all_rewards(position_key).await {
            Ok(txs) => {
                for tx in txs {
                    self.chain.submit(tx, vec![], "claim-rewards").await?;
                }
            }
            Err(e) if tolerates_empty(&e) => {
                tracing::debug!("Nothing to claim: {}", e);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.tuning.claim_settle).await;

        // Phase 3: close the account and recover rent
        match self.try_close_account(pool, position_key).await {
            Ok(()) => Ok(()),
            Err(ChainError::NonEmptyPosition) => {
                tracing::warn!(
                    position = %position_key,
                    "Close rejected with residual liquidity, re-draining with wider bounds"
                );
                self.remove_all_liquidity(pool, position_key, CLOSE_REWIDEN_BINS, true)
                    .await?;
                // One retry; if the account still cannot close, the rent is
                // lost but the position is done
                if let Err(e) = self.try_close_account(pool, position_key).await {
                    if !tolerates_empty(&e) {
                        tracing::warn!(
                            position = %position_key,
                            "Position account could not be closed, abandoning rent: {}",
                            e
                        );
                    }
                }
                Ok(())
            }
            Err(e) if tolerates_empty(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn try_close_account(
        &self,
        pool: &Arc<PoolClient>,
        position_key: &Pubkey,
    ) -> Result<(), ChainError> {
        let tx = pool.close_position_account(position_key).await?;
        self.chain.submit(tx, vec![], "close-position").await?;
        Ok(())
    }

    async fn remove_all_liquidity(
        &self,
        pool: &Arc<PoolClient>,
        position_key: &Pubkey,
        widen_bins: i32,
        claim_and_close: bool,
    ) -> Result<(), ChainError> {
        let bounds = match pool.get_position(position_key).await {
            Ok(onchain) => Some((onchain.lower_bin - widen_bins, onchain.upper_bin + widen_bins)),
            Err(ChainError::AccountNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let Some((from_bin, to_bin)) = bounds else {
            tracing::debug!(position = %position_key, "Position account already gone");
            return Ok(());
        };

        match pool
            .remove_liquidity(position_key, from_bin, to_bin, 10_000, claim_and_close)
            .await
        {
            Ok(txs) => {
                if txs.is_empty() {
                    tracing::debug!(position = %position_key, "No liquidity to remove");
                }
                for tx in txs {
                    self.chain.submit(tx, vec![], "remove-liquidity").await?;
                }
                Ok(())
            }
            Err(e) if tolerates_empty(&e) => {
                tracing::debug!(position = %position_key, "No liquidity to remove: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Buffered range check. Within the timeframe's check interval the
    /// previous verdict stands and the position counts as valid.
    pub fn is_in_valid_range(&self, position: &Position, current_price: f64) -> Result<bool> {
        let interval = chrono::Duration::from_std(position.timeframe.duration())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if Utc::now() - position.last_range_check < interval {
            return Ok(true);
        }

        self.store
            .update(&position.id, |p| p.last_range_check = Utc::now())?;

        if !position.price_range.is_sane() {
            tracing::warn!(
                id = %position.id,
                "Price range is corrupted [{}, {}], treating as out of range",
                position.price_range.min,
                position.price_range.max
            );
            return Ok(false);
        }

        let buffer = position.price_range.width() * position.timeframe.range_buffer_pct();
        let valid = current_price >= position.price_range.min - buffer
            && current_price <= position.price_range.max + buffer;
        Ok(valid)
    }

    /// Remove liquidity from bins the price has already traded through,
    /// keeping the position (and its decision window) open
    pub async fn harvest(
        &self,
        position: &Position,
        current_price: f64,
        bps: u16,
    ) -> Result<bool> {
        if !position.is_active() {
            return Ok(false);
        }
        if !position.price_range.is_sane() {
            tracing::warn!(id = %position.id, "Refusing to harvest a corrupted range");
            return Ok(false);
        }

        // Shares the close guard so a harvest never races a close
        {
            let mut closing = self.closing.lock().await;
            if !closing.insert(position.id.clone()) {
                return Ok(false);
            }
        }
        let result = self.harvest_inner(position, current_price, bps).await;
        self.closing.lock().await.remove(&position.id);
        result
    }

    async fn harvest_inner(
        &self,
        position: &Position,
        current_price: f64,
        bps: u16,
    ) -> Result<bool> {
        let range = &position.price_range;
        let movement = match position.side {
            Side::Buy => (current_price - range.min) / range.width(),
            Side::Sell => (range.max - current_price) / range.width(),
        };
        let threshold = position.timeframe.harvest_threshold_pct();
        if movement < threshold {
            tracing::debug!(
                id = %position.id,
                "Movement {:.1}% below harvest threshold {:.1}%",
                movement * 100.0,
                threshold * 100.0
            );
            return Ok(false);
        }

        let pool = self.pool(position.timeframe)?;
        let position_key = Pubkey::from_str(&position.id)
            .map_err(|e| ChainError::Validation(format!("position id: {}", e)))?;
        let onchain = pool.get_position(&position_key).await?;
        let active = pool.active_bin().await?;

        let (from_bin, to_bin) = match position.side {
            Side::Buy => (onchain.lower_bin, (active.bin_id - 1).min(onchain.upper_bin)),
            Side::Sell => ((active.bin_id + 1).max(onchain.lower_bin), onchain.upper_bin),
        };
        if to_bin - from_bin + 1 < MIN_HARVEST_SPAN {
            tracing::debug!(
                id = %position.id,
                "Only {} crossed bins, not worth harvesting",
                to_bin - from_bin + 1
            );
            return Ok(false);
        }

        let txs = pool
            .remove_liquidity(&position_key, from_bin, to_bin, bps, false)
            .await?;
        for tx in txs {
            self.chain.submit(tx, vec![], "harvest").await?;
        }

        // The price range is left as created: the decision window for
        // close/breakthrough logic must survive the narrowed liquidity
        self.store.update(&position.id, |p| {
            p.has_been_harvested = true;
            p.last_harvest_at = Some(Utc::now());
        })?;

        tracing::info!(
            id = %position.id,
            side = %position.side,
            "Harvested bins {}..={}",
            from_bin,
            to_bin
        );
        Ok(true)
    }

    /// Reconcile ACTIVE positions against the chain in small batches.
    /// Accounts that are gone become CLOSED.
    pub async fn sync_with_chain(&self) -> Result<SyncReport> {
        let active = self.store.active_positions();
        let total = active.len();
        let mut updated = 0usize;

        for (batch_index, batch) in active.chunks(SYNC_BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.tuning.sync_pause).await;
            }
            for position in batch {
                let Ok(key) = Pubkey::from_str(&position.id) else {
                    tracing::warn!(id = %position.id, "Unparseable position id, skipping sync");
                    continue;
                };
                match self.chain.account_exists(&key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!(
                            id = %position.id,
                            "Position account gone on chain, marking CLOSED"
                        );
                        self.store
                            .update(&position.id, |p| p.status = PositionStatus::Closed)?;
                        updated += 1;
                    }
                    Err(e) => {
                        tracing::warn!(id = %position.id, "Sync read failed: {}", e);
                    }
                }
            }
        }

        Ok(SyncReport { updated, total })
    }

    /// Whether a close is currently in flight for this id
    pub async fn is_closing(&self, id: &str) -> bool {
        self.closing.lock().await.contains(id)
    }

    pub async fn drain_closes(&self, timeout: Duration) {
        let started = std::time::Instant::now();
        loop {
            if self.closing.lock().await.is_empty() {
                return;
            }
            if started.elapsed() > timeout {
                tracing::warn!("Shutdown with closes still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn replace_wait(&self) -> Duration {
        self.tuning.replace_wait
    }
}

/// Price window for a fresh position. The log formula is authoritative;
/// if it lands outside the sanity bounds a linear approximation around the
/// entry price is used instead.
fn price_range_for_bins(
    pool: &PoolClient,
    active: &ActiveBin,
    side: Side,
    min_bin: i32,
    max_bin: i32,
    bin_count: i32,
) -> PriceRange {
    let bin_range = BinRange { min_bin, max_bin };
    let range = PriceRange {
        min: pool.price_for_bin(active, min_bin),
        max: pool.price_for_bin(active, max_bin),
        bin_range,
    };
    if range.is_sane() {
        return range;
    }

    tracing::warn!(
        "Computed price range [{}, {}] fails sanity bounds, using linear approximation",
        range.min,
        range.max
    );
    let delta =
        pool.descriptor().bin_step_bps as f64 / 10_000.0 * active.price * bin_count as f64;
    let (min, max) = match side {
        Side::Buy => (active.price, active.price + delta),
        Side::Sell => (active.price - delta, active.price),
    };
    PriceRange {
        min,
        max,
        bin_range,
    }
}
