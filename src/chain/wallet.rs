use crate::chain::rpc::RpcExecutor;
use crate::error::ChainError;
use crate::models::{BalanceSnapshot, WalletBalance};
use crate::persistence::{FileStore, BALANCE_HISTORY_FILE};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bip39::{Language, Mnemonic, Seed};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use solana_sdk::derivation_path::DerivationPath;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::keypair::keypair_from_seed_and_derivation_path;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DERIVATION_PATH: &str = "m/44'/501'/0'/0'";
const BALANCE_TTL: Duration = Duration::from_secs(120);
/// 30 daily averages + 24 hourly entries
const MAX_HISTORY_ENTRIES: usize = 54;

/// Derive the trading wallet from a BIP39 seed phrase
pub fn keypair_from_seed_phrase(phrase: &str) -> Result<Keypair> {
    let mnemonic = Mnemonic::from_phrase(phrase.trim(), Language::English)
        .map_err(|e| anyhow!("invalid seed phrase: {}", e))?;
    let seed = Seed::new(&mnemonic, "");
    let path = DerivationPath::from_absolute_path_str(DERIVATION_PATH)
        .map_err(|e| anyhow!("derivation path: {}", e))?;
    keypair_from_seed_and_derivation_path(seed.as_bytes(), Some(path))
        .map_err(|e| anyhow!("deriving wallet keypair: {}", e))
}

/// Raw (base, quote) balance read in human units
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn read(&self) -> Result<(f64, f64), ChainError>;
}

/// Reads the native base balance and the quote token account through the
/// serialized RPC executor
pub struct OnchainBalanceReader {
    pub executor: Arc<RpcExecutor>,
    pub owner: Pubkey,
    pub quote_token_account: Pubkey,
    pub base_decimals: u8,
}

#[async_trait]
impl BalanceReader for OnchainBalanceReader {
    async fn read(&self) -> Result<(f64, f64), ChainError> {
        let lamports = self.executor.get_balance_lamports(&self.owner).await?;
        let base = lamports as f64 / 10f64.powi(self.base_decimals as i32);
        let quote = self
            .executor
            .get_token_balance(&self.quote_token_account)
            .await?;
        Ok((base, quote))
    }
}

/// Wallet balance view consumed by sizing and close-delta logic
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn balance(&self, force_refresh: bool) -> Result<WalletBalance>;
}

/// Balance snapshot service: a 2-minute cache in front of the chain reads,
/// an hourly snapshot history, and daily compression of entries older
/// than 24 h.
pub struct WalletService {
    reader: Arc<dyn BalanceReader>,
    cache: Mutex<Option<(WalletBalance, Instant)>>,
    history: std::sync::Mutex<Vec<BalanceSnapshot>>,
    files: Arc<FileStore>,
}

impl WalletService {
    pub fn new(reader: Arc<dyn BalanceReader>, files: Arc<FileStore>) -> Result<Self> {
        let history: Vec<BalanceSnapshot> =
            files.load(BALANCE_HISTORY_FILE)?.unwrap_or_default();
        if !history.is_empty() {
            tracing::info!("Restored {} balance history entries", history.len());
        }
        Ok(Self {
            reader,
            cache: Mutex::new(None),
            history: std::sync::Mutex::new(history),
            files,
        })
    }

    /// Append one fresh snapshot to the history. Called hourly; compression
    /// is a separate step so both can be exercised on their own.
    pub async fn sample(&self) -> Result<BalanceSnapshot> {
        let balance = self.balance(true).await?;
        let snapshot = BalanceSnapshot {
            base_qty: balance.base,
            quote_qty: balance.quote,
            timestamp: balance.timestamp,
            is_daily_average: false,
            original_count: None,
        };
        {
            let mut history = self.history.lock().unwrap();
            history.push(snapshot.clone());
        }
        self.persist_history()?;
        Ok(snapshot)
    }

    /// Compress entries older than 24 h into one average per calendar day
    /// and trim the history to its retention bound
    pub fn compress(&self) -> Result<()> {
        {
            let mut history = self.history.lock().unwrap();
            let entries = std::mem::take(&mut *history);
            *history = compress_history(entries, Utc::now());
        }
        self.persist_history()
    }

    pub fn history(&self, limit: Option<usize>, hours: Option<u64>) -> Vec<BalanceSnapshot> {
        let history = self.history.lock().unwrap();
        let mut entries: Vec<BalanceSnapshot> = match hours {
            Some(h) => {
                let cutoff = Utc::now() - ChronoDuration::hours(h as i64);
                history
                    .iter()
                    .filter(|s| s.timestamp >= cutoff)
                    .cloned()
                    .collect()
            }
            None => history.clone(),
        };
        if let Some(limit) = limit {
            if entries.len() > limit {
                entries = entries.split_off(entries.len() - limit);
            }
        }
        entries
    }

    fn persist_history(&self) -> Result<()> {
        let history = self.history.lock().unwrap().clone();
        self.files.save(BALANCE_HISTORY_FILE, &history)
    }
}

#[async_trait]
impl BalanceProvider for WalletService {
    async fn balance(&self, force_refresh: bool) -> Result<WalletBalance> {
        let mut cache = self.cache.lock().await;

        if !force_refresh {
            if let Some((balance, at)) = cache.as_ref() {
                if at.elapsed() < BALANCE_TTL {
                    return Ok(balance.clone());
                }
            }
        }

        match self.reader.read().await {
            Ok((base, quote)) => {
                let balance = WalletBalance {
                    base,
                    quote,
                    timestamp: Utc::now(),
                };
                *cache = Some((balance.clone(), Instant::now()));
                Ok(balance)
            }
            Err(e) => {
                if let Some((stale, _)) = cache.as_ref() {
                    tracing::warn!(
                        "Balance read failed ({}), serving stale snapshot from {}",
                        e,
                        stale.timestamp
                    );
                    Ok(stale.clone())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

/// Pure compression step, idempotent: entries older than `now - 24h` fold
/// into one average per calendar day (timestamp = newest of the group),
/// the combined list is trimmed to the newest [`MAX_HISTORY_ENTRIES`].
pub fn compress_history(
    entries: Vec<BalanceSnapshot>,
    now: DateTime<Utc>,
) -> Vec<BalanceSnapshot> {
    let cutoff = now - ChronoDuration::hours(24);

    let (older, recent): (Vec<_>, Vec<_>) =
        entries.into_iter().partition(|s| s.timestamp < cutoff);

    let mut by_day: BTreeMap<chrono::NaiveDate, Vec<BalanceSnapshot>> = BTreeMap::new();
    for snapshot in older {
        by_day
            .entry(snapshot.timestamp.date_naive())
            .or_default()
            .push(snapshot);
    }

    let mut compressed: Vec<BalanceSnapshot> = by_day
        .into_values()
        .map(|group| {
            let count = group.len() as f64;
            let base = group.iter().map(|s| s.base_qty).sum::<f64>() / count;
            let quote = group.iter().map(|s| s.quote_qty).sum::<f64>() / count;
            let timestamp = group
                .iter()
                .map(|s| s.timestamp)
                .max()
                .expect("non-empty group");
            let original_count = group
                .iter()
                .map(|s| s.original_count.unwrap_or(1))
                .sum::<u32>();
            BalanceSnapshot {
                base_qty: base,
                quote_qty: quote,
                timestamp,
                is_daily_average: true,
                original_count: Some(original_count),
            }
        })
        .collect();

    compressed.extend(recent);
    if compressed.len() > MAX_HISTORY_ENTRIES {
        compressed = compressed.split_off(compressed.len() - MAX_HISTORY_ENTRIES);
    }
    compressed
}
