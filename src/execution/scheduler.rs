use crate::chain::pool::PoolClient;
use crate::chain::wallet::{BalanceProvider, WalletService};
use crate::config::{HarvestConfig, SharedTunables};
use crate::execution::manager::{
    is_extremely_out_of_range, PositionManager, MIN_BASE_AMOUNT, MIN_QUOTE_AMOUNT,
};
use crate::execution::store::PositionStore;
use crate::indicators::IndicatorCache;
use crate::models::{Position, Side, Timeframe};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const HARVEST_TICK_PERIOD: Duration = Duration::from_secs(60);
const WALLET_TICK_PERIOD: Duration = Duration::from_secs(3600);

/// Per-timeframe signal evaluation, range monitoring, the global harvest
/// tick and the hourly wallet snapshot, all driven by interval loops.
///
/// Every handler holds a logical lease while it runs: a tick that fires
/// while the previous one is still busy is skipped, never queued. A tick
/// never takes the scheduler down; failures are logged and the next cron
/// fire retries.
pub struct Scheduler {
    symbol: String,
    enabled: Vec<Timeframe>,
    indicators: Arc<IndicatorCache>,
    manager: Arc<PositionManager>,
    store: Arc<PositionStore>,
    wallet: Arc<WalletService>,
    pools: HashMap<Timeframe, Arc<PoolClient>>,
    tunables: SharedTunables,
    leases: StdMutex<HashSet<String>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        enabled: Vec<Timeframe>,
        indicators: Arc<IndicatorCache>,
        manager: Arc<PositionManager>,
        store: Arc<PositionStore>,
        wallet: Arc<WalletService>,
        pools: HashMap<Timeframe, Arc<PoolClient>>,
        tunables: SharedTunables,
    ) -> Arc<Self> {
        Arc::new(Self {
            symbol,
            enabled,
            indicators,
            manager,
            store,
            wallet,
            pools,
            tunables,
            leases: StdMutex::new(HashSet::new()),
        })
    }

    /// Spawn every cron loop. Loops stop when `shutdown` flips to true.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for tf in self.enabled.clone() {
            handles.push(self.spawn_loop(
                format!("signal:{}", tf),
                tf.duration(),
                shutdown.clone(),
                move |s| async move { s.evaluate_signal(tf).await },
            ));
            handles.push(self.spawn_loop(
                format!("range:{}", tf),
                tf.duration(),
                shutdown.clone(),
                move |s| async move { s.monitor_ranges(tf).await },
            ));
        }

        handles.push(self.spawn_loop(
            "harvest".to_string(),
            HARVEST_TICK_PERIOD,
            shutdown.clone(),
            |s| async move { s.harvest_tick().await },
        ));
        handles.push(self.spawn_loop(
            "wallet".to_string(),
            WALLET_TICK_PERIOD,
            shutdown,
            |s| async move { s.wallet_tick().await },
        ));

        handles
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: String,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Scheduler>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_guarded(&name, task(scheduler.clone())).await;
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("{} loop stopped", name);
                        return;
                    }
                }
            }
        })
    }

    /// Run a handler under its reentrancy lease. A handler that is still
    /// running swallows the new invocation.
    pub async fn run_guarded<Fut>(&self, name: &str, fut: Fut)
    where
        Fut: Future<Output = Result<()>>,
    {
        {
            let mut leases = self.leases.lock().unwrap();
            if !leases.insert(name.to_string()) {
                tracing::debug!("{} still running, tick skipped", name);
                return;
            }
        }
        if let Err(e) = fut.await {
            tracing::error!("{} tick failed: {:#}", name, e);
        }
        self.leases.lock().unwrap().remove(name);
    }

    /// Signal tick: force-refresh RSI and decide whether this timeframe
    /// should hold, replace or open a position
    pub async fn evaluate_signal(&self, timeframe: Timeframe) -> Result<()> {
        let (period, oversold, overbought, factor) = {
            let tunables = self.tunables.read().unwrap();
            (
                tunables.rsi_period,
                tunables.oversold,
                tunables.overbought,
                tunables.position_factor(timeframe),
            )
        };

        let rsi = self
            .indicators
            .rsi(&self.symbol, timeframe, period, true)
            .await?;
        let price = self.indicators.spot_price(&self.symbol).await?;
        let active = self.store.active_by_timeframe(timeframe);

        tracing::debug!(
            timeframe = %timeframe,
            rsi = format!("{:.1}", rsi.value),
            price,
            "Signal tick"
        );

        if rsi.value < oversold {
            self.enter(timeframe, Side::Buy, active, price, factor).await
        } else if rsi.value > overbought {
            self.enter(timeframe, Side::Sell, active, price, factor).await
        } else {
            // Neutral holds, unless the price has left the range so far
            // behind that waiting for the next signal makes no sense
            if let Some(position) = active {
                if is_extremely_out_of_range(&position, price) {
                    tracing::info!(
                        id = %position.id,
                        timeframe = %timeframe,
                        "Neutral signal but price {} is extremely out of range, closing",
                        price
                    );
                    self.manager.close(&position.id, false).await?;
                }
            }
            Ok(())
        }
    }

    async fn enter(
        &self,
        timeframe: Timeframe,
        desired: Side,
        active: Option<Position>,
        price: f64,
        factor: f64,
    ) -> Result<()> {
        if let Some(position) = active {
            if position.side == desired && self.manager.is_in_valid_range(&position, price)? {
                tracing::debug!(
                    id = %position.id,
                    "Already holding a valid {} position",
                    desired
                );
                return Ok(());
            }
            self.manager.close(&position.id, false).await?;
            tokio::time::sleep(self.manager.replace_wait()).await;
        }

        // The close path above may have raced an operator command
        if self.store.active_by_timeframe(timeframe).is_some() {
            return Ok(());
        }

        let balance = self.wallet.balance(false).await?;
        let (relevant, minimum) = match desired {
            Side::Buy => (balance.base, MIN_BASE_AMOUNT),
            Side::Sell => (balance.quote, MIN_QUOTE_AMOUNT),
        };
        let amount = relevant * factor;
        if amount < minimum {
            tracing::info!(
                timeframe = %timeframe,
                side = %desired,
                "Sized amount {:.6} below minimum {:.2}, skipping entry",
                amount,
                minimum
            );
            return Ok(());
        }

        self.manager.create(timeframe, desired, amount).await?;
        Ok(())
    }

    /// Range tick: apply the close rules to this timeframe's position
    pub async fn monitor_ranges(&self, timeframe: Timeframe) -> Result<()> {
        let Some(position) = self.store.active_by_timeframe(timeframe) else {
            return Ok(());
        };

        let (period, oversold, overbought) = {
            let tunables = self.tunables.read().unwrap();
            (tunables.rsi_period, tunables.oversold, tunables.overbought)
        };

        let rsi = self
            .indicators
            .rsi(&self.symbol, timeframe, period, false)
            .await?;
        let price = self.indicators.spot_price(&self.symbol).await?;

        let reason = match position.side {
            Side::Buy => {
                if rsi.value >= overbought {
                    Some("RSI reversal")
                } else if price >= position.price_range.max {
                    Some("price breakthrough")
                } else if !self.manager.is_in_valid_range(&position, price)? {
                    Some("out of range")
                } else {
                    None
                }
            }
            Side::Sell => {
                if rsi.value <= oversold {
                    Some("RSI reversal")
                } else if price <= position.price_range.min {
                    Some("price breakthrough")
                } else if !self.manager.is_in_valid_range(&position, price)? {
                    Some("out of range")
                } else {
                    None
                }
            }
        };

        if let Some(reason) = reason {
            tracing::info!(
                id = %position.id,
                timeframe = %timeframe,
                rsi = format!("{:.1}", rsi.value),
                price,
                "Closing position: {}",
                reason
            );
            self.manager.close(&position.id, false).await?;
        }
        Ok(())
    }

    /// Global harvest tick across every ACTIVE position
    pub async fn harvest_tick(&self) -> Result<()> {
        let harvest = {
            let tunables = self.tunables.read().unwrap();
            tunables.harvest.clone()
        };
        if !harvest.enabled {
            return Ok(());
        }

        for position in self.store.active_positions() {
            let price = self.indicators.spot_price(&self.symbol).await?;
            if !self.should_harvest(&position, price, &harvest).await {
                continue;
            }
            if let Err(e) = self
                .manager
                .harvest(&position, price, harvest.bps_threshold)
                .await
            {
                tracing::warn!(id = %position.id, "Harvest failed: {:#}", e);
            }
        }
        Ok(())
    }

    /// Harvest precondition: enough bins traded through since the original
    /// bounds. When the pool read fails the decision falls back to a pure
    /// price-move test at twice the configured minimum move.
    async fn should_harvest(
        &self,
        position: &Position,
        price: f64,
        harvest: &HarvestConfig,
    ) -> bool {
        match position.side {
            Side::Buy if price <= position.price_range.min => return false,
            Side::Sell if price >= position.price_range.max => return false,
            _ => {}
        }

        let Some(pool) = self.pools.get(&position.timeframe) else {
            return false;
        };

        match pool.active_bin().await {
            Ok(active) => {
                let traded_through = match position.side {
                    Side::Buy => active.bin_id - position.price_range.bin_range.min_bin,
                    Side::Sell => position.price_range.bin_range.max_bin - active.bin_id,
                };
                traded_through >= harvest.min_bins
            }
            Err(e) => {
                tracing::warn!(
                    id = %position.id,
                    "Active bin unavailable ({}), falling back to price-move test",
                    e
                );
                let move_pct = (price - position.entry_price).abs() / position.entry_price;
                move_pct >= harvest.min_price_move * 2.0
            }
        }
    }

    /// Hourly wallet tick: snapshot, then compress, as two separate steps
    pub async fn wallet_tick(&self) -> Result<()> {
        self.wallet.sample().await?;
        self.wallet.compress()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::KlineSource;
    use crate::chain::rpc::ChainExecutor;
    use crate::chain::sdk::{
        ActiveBin, CreatePositionRequest, CreatedPosition, DlmmSdk, OnchainPosition,
    };
    use crate::chain::wallet::BalanceReader;
    use crate::config::{CloseTuning, Tunables};
    use crate::error::{ChainError, VendorError};
    use crate::models::{Candle, PoolDescriptor, PositionStatus, StrategyKind};
    use crate::persistence::FileStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::{Keypair, Signature};
    use solana_sdk::transaction::Transaction;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
    use std::sync::Mutex;

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_files() -> Arc<FileStore> {
        let dir = std::env::temp_dir().join(format!(
            "lpbot-scheduler-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        Arc::new(FileStore::new(dir).unwrap())
    }

    /// Market regime the fake vendor replays
    #[derive(Clone, Copy, PartialEq)]
    enum Regime {
        Falling,  // RSI pinned low
        Rising,   // RSI pinned high
        Choppy,   // RSI near 50
    }

    struct FakeVendor {
        regime: Mutex<Regime>,
        spot: Mutex<f64>,
    }

    impl FakeVendor {
        fn new(regime: Regime, spot: f64) -> Self {
            Self {
                regime: Mutex::new(regime),
                spot: Mutex::new(spot),
            }
        }
    }

    #[async_trait]
    impl KlineSource for FakeVendor {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, VendorError> {
            let regime = *self.regime.lock().unwrap();
            let closes: Vec<f64> = (0..limit)
                .map(|i| match regime {
                    Regime::Falling => 200.0 - i as f64,
                    Regime::Rising => 100.0 + i as f64,
                    Regime::Choppy => 150.0 + if i % 2 == 0 { 1.0 } else { -1.0 },
                })
                .collect();
            let now = Utc::now();
            Ok(closes
                .iter()
                .enumerate()
                .map(|(i, close)| {
                    let open_time = now - chrono::Duration::minutes((limit - i) as i64);
                    Candle {
                        open_time,
                        open: *close,
                        high: close + 0.5,
                        low: close - 0.5,
                        close: *close,
                        volume: 1000.0,
                        close_time: open_time + chrono::Duration::minutes(1),
                    }
                })
                .collect())
        }

        async fn fetch_spot_price(&self, _symbol: &str) -> Result<f64, VendorError> {
            Ok(*self.spot.lock().unwrap())
        }
    }

    struct FakeReader {
        base: Mutex<f64>,
        quote: Mutex<f64>,
    }

    #[async_trait]
    impl BalanceReader for FakeReader {
        async fn read(&self) -> Result<(f64, f64), ChainError> {
            Ok((*self.base.lock().unwrap(), *self.quote.lock().unwrap()))
        }
    }

    struct StubSdk {
        active_bin_id: AtomicI32,
        price: Mutex<f64>,
        fail_active_bin: AtomicBool,
    }

    #[async_trait]
    impl DlmmSdk for StubSdk {
        async fn active_bin(&self, _pool: &Pubkey) -> Result<ActiveBin, ChainError> {
            if self.fail_active_bin.load(Ordering::SeqCst) {
                return Err(ChainError::Transient("rpc down".into()));
            }
            Ok(ActiveBin {
                bin_id: self.active_bin_id.load(Ordering::SeqCst),
                price: *self.price.lock().unwrap(),
            })
        }

        async fn ensure_bin_arrays(
            &self,
            _pool: &Pubkey,
            _min_bin: i32,
            _max_bin: i32,
        ) -> Result<Vec<Transaction>, ChainError> {
            Ok(vec![])
        }

        async fn create_one_sided_position(
            &self,
            _pool: &Pubkey,
            _request: &CreatePositionRequest,
        ) -> Result<CreatedPosition, ChainError> {
            Ok(CreatedPosition {
                tx: Transaction::default(),
                position: Arc::new(Keypair::new()),
            })
        }

        async fn remove_liquidity(
            &self,
            _pool: &Pubkey,
            _position: &Pubkey,
            _from_bin: i32,
            _to_bin: i32,
            _bps: u16,
            _claim_and_close: bool,
        ) -> Result<Vec<Transaction>, ChainError> {
            Ok(vec![Transaction::default()])
        }

        async fn claim_all_rewards(
            &self,
            _pool: &Pubkey,
            _position: &Pubkey,
        ) -> Result<Vec<Transaction>, ChainError> {
            Ok(vec![])
        }

        async fn close_position_account(
            &self,
            _pool: &Pubkey,
            _position: &Pubkey,
        ) -> Result<Transaction, ChainError> {
            Ok(Transaction::default())
        }

        async fn get_position(&self, _position: &Pubkey) -> Result<OnchainPosition, ChainError> {
            let bin = self.active_bin_id.load(Ordering::SeqCst);
            Ok(OnchainPosition {
                lower_bin: bin - 60,
                upper_bin: bin + 60,
                last_updated_at: Utc::now(),
                owner: Pubkey::new_unique(),
            })
        }

        async fn list_user_positions(&self, _pool: &Pubkey) -> Result<Vec<Pubkey>, ChainError> {
            Ok(vec![])
        }
    }

    struct NullExecutor;

    #[async_trait]
    impl ChainExecutor for NullExecutor {
        async fn submit(
            &self,
            _tx: Transaction,
            _extra_signers: Vec<Arc<Keypair>>,
            _label: &str,
        ) -> Result<Signature, ChainError> {
            Ok(Signature::default())
        }

        async fn account_exists(&self, _address: &Pubkey) -> Result<bool, ChainError> {
            Ok(true)
        }
    }

    struct Rig {
        scheduler: Arc<Scheduler>,
        vendor: Arc<FakeVendor>,
        sdk: Arc<StubSdk>,
        store: Arc<PositionStore>,
        manager: Arc<PositionManager>,
        tunables: SharedTunables,
    }

    fn rig(regime: Regime, base_balance: f64, quote_balance: f64) -> Rig {
        let vendor = Arc::new(FakeVendor::new(regime, 150.0));
        let sdk = Arc::new(StubSdk {
            active_bin_id: AtomicI32::new(1000),
            price: Mutex::new(150.0),
            fail_active_bin: AtomicBool::new(false),
        });

        let mut tunables = Tunables::default();
        tunables.position_factors.insert(Timeframe::H1, 0.2);
        let tunables: SharedTunables = Arc::new(std::sync::RwLock::new(tunables));

        let files = test_files();
        let store = Arc::new(PositionStore::load(files.clone()).unwrap());
        let wallet = Arc::new(
            WalletService::new(
                Arc::new(FakeReader {
                    base: Mutex::new(base_balance),
                    quote: Mutex::new(quote_balance),
                }),
                files,
            )
            .unwrap(),
        );

        let descriptor = PoolDescriptor {
            pool_id: Pubkey::new_unique(),
            bin_step_bps: 20,
            base_fee_pct: 0.2,
            max_fee_pct: 2.0,
            strategy: StrategyKind::Spot,
        };
        let pool = Arc::new(PoolClient::new(descriptor, sdk.clone()));
        let pools: HashMap<Timeframe, Arc<PoolClient>> =
            Timeframe::ALL.iter().map(|tf| (*tf, pool.clone())).collect();

        let manager = Arc::new(PositionManager::new(
            pools.clone(),
            Arc::new(NullExecutor),
            wallet.clone(),
            store.clone(),
            CloseTuning::immediate(),
        ));

        let indicators = Arc::new(IndicatorCache::new(vendor.clone(), tunables.clone()));

        let scheduler = Scheduler::new(
            "SOLUSDT".to_string(),
            vec![Timeframe::H1],
            indicators,
            manager.clone(),
            store.clone(),
            wallet,
            pools,
            tunables.clone(),
        );

        Rig {
            scheduler,
            vendor,
            sdk,
            store,
            manager,
            tunables,
        }
    }

    #[tokio::test]
    async fn test_oversold_opens_buy() {
        let r = rig(Regime::Falling, 2.0, 0.0);

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();

        let position = r.store.active_by_timeframe(Timeframe::H1).expect("position");
        assert_eq!(position.side, Side::Buy);
        // factor 0.2 of 2.0 base
        assert!((position.amount - 0.4).abs() < 1e-9);
        assert_eq!(position.price_range.bin_range.min_bin, 1000);
        assert_eq!(position.price_range.bin_range.max_bin, 1060);
        assert!((position.price_range.min - 150.0).abs() < 1e-9);
        assert!(position.price_range.max > 150.0);
    }

    #[tokio::test]
    async fn test_overbought_opens_sell() {
        let r = rig(Regime::Rising, 0.0, 500.0);

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();

        let position = r.store.active_by_timeframe(Timeframe::H1).expect("position");
        assert_eq!(position.side, Side::Sell);
        assert!((position.amount - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_oversold_holds_existing_valid_buy() {
        let r = rig(Regime::Falling, 2.0, 0.0);

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();
        let first = r.store.active_by_timeframe(Timeframe::H1).unwrap();

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();
        let second = r.store.active_by_timeframe(Timeframe::H1).unwrap();
        assert_eq!(first.id, second.id, "valid BUY is kept through oversold");
    }

    #[tokio::test]
    async fn test_signal_flip_replaces_position() {
        let r = rig(Regime::Falling, 2.0, 500.0);

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();
        let buy = r.store.active_by_timeframe(Timeframe::H1).unwrap();
        assert_eq!(buy.side, Side::Buy);

        *r.vendor.regime.lock().unwrap() = Regime::Rising;
        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();

        let sell = r.store.active_by_timeframe(Timeframe::H1).unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert_ne!(buy.id, sell.id);
        assert_eq!(r.store.get(&buy.id).unwrap().status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_dust_balance_skips_entry() {
        let r = rig(Regime::Falling, 0.01, 0.0);

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();
        assert!(r.store.active_by_timeframe(Timeframe::H1).is_none());
    }

    /// Open an H1 BUY through the manager without touching the indicator
    /// caches, so later phases see fresh vendor data
    async fn open_buy(r: &Rig) -> Position {
        r.manager
            .create(Timeframe::H1, Side::Buy, 0.4)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_neutral_holds_in_range_position() {
        let r = rig(Regime::Choppy, 2.0, 0.0);
        let position = open_buy(&r).await;

        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();

        assert_eq!(
            r.store.get(&position.id).unwrap().status,
            PositionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_neutral_closes_extremely_out_of_range() {
        let r = rig(Regime::Choppy, 2.0, 0.0);
        let position = open_buy(&r).await;

        // Far beyond max + 1.5x buffer
        *r.vendor.spot.lock().unwrap() = position.price_range.max * 2.0;
        r.scheduler.evaluate_signal(Timeframe::H1).await.unwrap();

        assert_eq!(
            r.store.get(&position.id).unwrap().status,
            PositionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_range_monitor_closes_on_rsi_reversal() {
        let r = rig(Regime::Rising, 2.0, 0.0);
        let position = open_buy(&r).await;

        r.scheduler.monitor_ranges(Timeframe::H1).await.unwrap();

        assert_eq!(
            r.store.get(&position.id).unwrap().status,
            PositionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_range_monitor_closes_on_breakthrough() {
        // RSI stays oversold (no reversal), only the price breaks out
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        *r.vendor.spot.lock().unwrap() = position.price_range.max + 0.5;
        r.scheduler.monitor_ranges(Timeframe::H1).await.unwrap();

        assert_eq!(
            r.store.get(&position.id).unwrap().status,
            PositionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_range_monitor_holds_inside_range() {
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        *r.vendor.spot.lock().unwrap() =
            (position.price_range.min + position.price_range.max) / 2.0;
        r.scheduler.monitor_ranges(Timeframe::H1).await.unwrap();

        assert_eq!(
            r.store.get(&position.id).unwrap().status,
            PositionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_harvest_tick_fires_after_enough_bins() {
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        // Price climbs 30 bins into the range
        r.sdk.active_bin_id.store(1030, Ordering::SeqCst);
        *r.sdk.price.lock().unwrap() = 156.0;
        *r.vendor.spot.lock().unwrap() = 156.0;

        r.scheduler.harvest_tick().await.unwrap();

        let refreshed = r.store.get(&position.id).unwrap();
        assert!(refreshed.has_been_harvested);
        assert!(refreshed.is_active());
    }

    #[tokio::test]
    async fn test_harvest_tick_respects_min_bins() {
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        // Only 3 bins traded through, below the default minimum of 5
        r.sdk.active_bin_id.store(1003, Ordering::SeqCst);
        *r.vendor.spot.lock().unwrap() = 151.0;

        r.scheduler.harvest_tick().await.unwrap();
        assert!(!r.store.get(&position.id).unwrap().has_been_harvested);
    }

    #[tokio::test]
    async fn test_harvest_tick_disabled() {
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        r.tunables.write().unwrap().harvest.enabled = false;
        r.sdk.active_bin_id.store(1030, Ordering::SeqCst);
        *r.vendor.spot.lock().unwrap() = 156.0;

        r.scheduler.harvest_tick().await.unwrap();
        assert!(!r.store.get(&position.id).unwrap().has_been_harvested);
    }

    #[tokio::test]
    async fn test_harvest_fallback_price_move_on_read_failure() {
        let r = rig(Regime::Falling, 2.0, 0.0);
        let position = open_buy(&r).await;

        r.sdk.fail_active_bin.store(true, Ordering::SeqCst);

        // 1% move: below the 2% fallback bar
        *r.vendor.spot.lock().unwrap() = position.entry_price * 1.01;
        let harvest = r.tunables.read().unwrap().harvest.clone();
        assert!(
            !r.scheduler
                .should_harvest(&position, position.entry_price * 1.01, &harvest)
                .await
        );

        // 3% move passes it
        assert!(
            r.scheduler
                .should_harvest(&position, position.entry_price * 1.03, &harvest)
                .await
        );
    }

    #[tokio::test]
    async fn test_reentrancy_lease_skips_second_entry() {
        let r = rig(Regime::Choppy, 2.0, 0.0);

        let ran = Arc::new(AtomicBool::new(false));
        r.scheduler
            .leases
            .lock()
            .unwrap()
            .insert("signal:1h".to_string());

        let flag = ran.clone();
        r.scheduler
            .run_guarded("signal:1h", async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(!ran.load(Ordering::SeqCst), "held lease must skip the tick");

        r.scheduler.leases.lock().unwrap().remove("signal:1h");
        let flag = ran.clone();
        r.scheduler
            .run_guarded("signal:1h", async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_tick_releases_lease() {
        let r = rig(Regime::Choppy, 2.0, 0.0);

        r.scheduler
            .run_guarded("range:1h", async { anyhow::bail!("boom") })
            .await;
        // The lease is free again
        assert!(!r.scheduler.leases.lock().unwrap().contains("range:1h"));
    }

    #[tokio::test]
    async fn test_wallet_tick_samples_and_compresses() {
        let r = rig(Regime::Choppy, 2.0, 100.0);
        r.scheduler.wallet_tick().await.unwrap();
        r.scheduler.wallet_tick().await.unwrap();
        assert_eq!(r.scheduler.wallet.history(None, None).len(), 2);
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let r = rig(Regime::Choppy, 2.0, 0.0);
        let (tx, rx) = watch::channel(false);

        let handles = r.scheduler.spawn(rx);
        assert_eq!(handles.len(), 4); // signal + range for 1h, harvest, wallet

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop exits promptly")
                .unwrap();
        }
        let _ = r.manager;
    }
}
