use lpbot::chain::sdk::{DlmmSdk, HttpDlmmSdk};
use lpbot::chain::wallet::{keypair_from_seed_phrase, OnchainBalanceReader, WalletService};
use lpbot::chain::{PoolClient, RpcExecutor};
use lpbot::config::{BotConfig, SharedTunables};
use lpbot::execution::{PositionManager, PositionStore, Scheduler};
use lpbot::indicators::IndicatorCache;
use lpbot::api::MarketDataClient;
use lpbot::models::Timeframe;
use lpbot::persistence::FileStore;
use solana_sdk::signer::Signer;
use spl_associated_token_account::get_associated_token_address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lpbot=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Service failed to start: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = BotConfig::from_env()?;

    tracing::info!("lpbot starting for {}", config.symbol);
    for tf in &config.enabled_timeframes {
        let pool = &config.pools[tf];
        tracing::info!(
            "  {} | pool {} | bin step {} bps | factor {:.2} | {:?}",
            tf,
            pool.pool_id,
            pool.bin_step_bps,
            config.tunables.position_factor(*tf),
            pool.strategy
        );
    }

    let payer = Arc::new(keypair_from_seed_phrase(&config.wallet_seed_phrase)?);
    let owner = payer.pubkey();
    tracing::info!("Trading wallet {}", owner);

    let executor = Arc::new(RpcExecutor::new(
        config.rpc_url.clone(),
        payer,
        config.tx.clone(),
    ));
    let files = Arc::new(FileStore::new(&config.data_dir)?);
    let store = Arc::new(PositionStore::load(files.clone())?);

    let reader = Arc::new(OnchainBalanceReader {
        executor: executor.clone(),
        owner,
        quote_token_account: get_associated_token_address(&owner, &config.quote_token.mint),
        base_decimals: config.base_token.decimals,
    });
    let wallet = Arc::new(WalletService::new(reader, files)?);

    let tunables: SharedTunables = Arc::new(std::sync::RwLock::new(config.tunables.clone()));
    let market = Arc::new(MarketDataClient::new(config.market_data_url.clone()));
    let indicators = Arc::new(IndicatorCache::new(market, tunables.clone()));

    let sdk: Arc<dyn DlmmSdk> = Arc::new(HttpDlmmSdk::new(config.dlmm_adapter_url.clone(), owner));
    let pools: HashMap<Timeframe, Arc<PoolClient>> = config
        .pools
        .iter()
        .map(|(tf, descriptor)| {
            (
                *tf,
                Arc::new(PoolClient::new(descriptor.clone(), sdk.clone())),
            )
        })
        .collect();

    let manager = Arc::new(PositionManager::new(
        pools.clone(),
        executor,
        wallet.clone(),
        store.clone(),
        config.close.clone(),
    ));

    // Positions whose close was interrupted last run are still ACTIVE in
    // the checkpoint; reconcile against the chain before any cron fires
    match manager.sync_with_chain().await {
        Ok(report) => {
            tracing::info!(
                "Chain sync: {}/{} positions reconciled",
                report.updated,
                report.total
            );
        }
        Err(e) => tracing::warn!("Startup chain sync failed: {:#}", e),
    }

    let scheduler = Scheduler::new(
        config.symbol.clone(),
        config.enabled_timeframes.clone(),
        indicators,
        manager.clone(),
        store,
        wallet,
        pools,
        tunables,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.spawn(shutdown_rx);
    tracing::info!(
        "Scheduler running: {} timeframes, harvest + wallet ticks",
        config.enabled_timeframes.len()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    // Stop the crons first, then let in-flight closes finish
    shutdown_tx.send(true).ok();
    for handle in handles {
        let _ = handle.await;
    }
    manager.drain_closes(Duration::from_secs(300)).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
