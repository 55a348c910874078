use crate::config::TxConfig;
use crate::error::ChainError;
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::Transaction;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Minimum spacing between serialized RPC reads
const MIN_READ_GAP: Duration = Duration::from_millis(250);
const MAX_READ_RETRIES: u32 = 5;
const READ_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Poll interval while waiting for a submitted transaction to confirm
const CONFIRM_POLL: Duration = Duration::from_secs(2);

/// Backoff before read retry `attempt` (1-based): 2^n * 5s capped at 30s
fn read_backoff(attempt: u32) -> Duration {
    let secs = 5u64.saturating_mul(1 << (attempt - 1).min(6));
    Duration::from_secs(secs).min(READ_BACKOFF_CAP)
}

/// Pause before submit retry `attempt` (1-based): attempt * 2s
fn submit_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2 * attempt as u64)
}

/// Chain operations the position manager needs, behind a trait so tests
/// can record submissions instead of hitting a validator
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    /// Sign with the payer plus `extra_signers`, attach a fresh blockhash,
    /// send and confirm. Retries with a new blockhash on expiry.
    async fn submit(
        &self,
        tx: Transaction,
        extra_signers: Vec<Arc<Keypair>>,
        label: &str,
    ) -> Result<Signature, ChainError>;

    async fn account_exists(&self, address: &Pubkey) -> Result<bool, ChainError>;
}

/// Serialized RPC access: one read in flight at a time, paced at 250 ms,
/// with exponential backoff on rate limits and transient faults.
pub struct RpcExecutor {
    rpc: Arc<RpcClient>,
    payer: Arc<Keypair>,
    tx_config: TxConfig,
    read_lane: Mutex<Option<Instant>>,
}

impl RpcExecutor {
    pub fn new(rpc_url: String, payer: Arc<Keypair>, tx_config: TxConfig) -> Self {
        Self {
            rpc: Arc::new(RpcClient::new_with_commitment(
                rpc_url,
                CommitmentConfig::confirmed(),
            )),
            payer,
            tx_config,
            read_lane: Mutex::new(None),
        }
    }

    pub fn payer_pubkey(&self) -> Pubkey {
        self.payer.pubkey()
    }

    /// Run one read through the FIFO lane. The lane lock is held across the
    /// whole call, so reads never overlap and consecutive reads start at
    /// least [`MIN_READ_GAP`] apart.
    async fn paced_read<T, F, Fut>(&self, label: &str, op: F) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = solana_client::client_error::Result<T>>,
    {
        let mut lane = self.read_lane.lock().await;
        let mut attempt = 0u32;
        loop {
            if let Some(prev) = *lane {
                let since = prev.elapsed();
                if since < MIN_READ_GAP {
                    tokio::time::sleep(MIN_READ_GAP - since).await;
                }
            }
            *lane = Some(Instant::now());

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let classified = ChainError::classify(&e.to_string());
                    attempt += 1;
                    if classified.is_retriable_read() && attempt < MAX_READ_RETRIES {
                        let backoff = read_backoff(attempt);
                        tracing::warn!(
                            "RPC {} failed ({}), retrying in {:?} (attempt {}/{})",
                            label,
                            classified,
                            backoff,
                            attempt,
                            MAX_READ_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                    } else {
                        return Err(classified);
                    }
                }
            }
        }
    }

    pub async fn get_balance_lamports(&self, address: &Pubkey) -> Result<u64, ChainError> {
        let rpc = self.rpc.clone();
        let address = *address;
        self.paced_read("getBalance", move || {
            let rpc = rpc.clone();
            async move { rpc.get_balance(&address).await }
        })
        .await
    }

    /// Token account balance in human units. A missing account reads as zero.
    pub async fn get_token_balance(&self, token_account: &Pubkey) -> Result<f64, ChainError> {
        let rpc = self.rpc.clone();
        let token_account = *token_account;
        let result = self
            .paced_read("getTokenAccountBalance", move || {
                let rpc = rpc.clone();
                async move { rpc.get_token_account_balance(&token_account).await }
            })
            .await;
        match result {
            Ok(amount) => Ok(amount.ui_amount.unwrap_or(0.0)),
            Err(ChainError::AccountNotFound(_)) => Ok(0.0),
            Err(e) => Err(e),
        }
    }

    async fn latest_blockhash(&self) -> Result<solana_sdk::hash::Hash, ChainError> {
        let rpc = self.rpc.clone();
        self.paced_read("getLatestBlockhash", move || {
            let rpc = rpc.clone();
            async move { rpc.get_latest_blockhash().await }
        })
        .await
    }

    /// Send and poll until confirmed at `confirmed` commitment
    async fn send_and_confirm(
        &self,
        tx: &Transaction,
        config: RpcSendTransactionConfig,
    ) -> Result<Signature, ChainError> {
        let signature = self
            .rpc
            .send_transaction_with_config(tx, config)
            .await
            .map_err(|e| ChainError::classify(&e.to_string()))?;

        loop {
            let confirmed = self
                .rpc
                .confirm_transaction(&signature)
                .await
                .map_err(|e| ChainError::classify(&e.to_string()))?;
            if confirmed {
                return Ok(signature);
            }
            tokio::time::sleep(CONFIRM_POLL).await;
        }
    }
}

#[async_trait]
impl ChainExecutor for RpcExecutor {
    async fn submit(
        &self,
        mut tx: Transaction,
        extra_signers: Vec<Arc<Keypair>>,
        label: &str,
    ) -> Result<Signature, ChainError> {
        let send_config = RpcSendTransactionConfig {
            skip_preflight: self.tx_config.skip_preflight,
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            ..Default::default()
        };

        let mut last_err = ChainError::Fatal("transaction not attempted".into());
        for attempt in 1..=self.tx_config.max_retries {
            let blockhash = self.latest_blockhash().await?;

            {
                let mut signers: Vec<&dyn Signer> = vec![self.payer.as_ref()];
                for keypair in &extra_signers {
                    signers.push(keypair.as_ref());
                }
                tx.try_sign(&signers, blockhash)
                    .map_err(|e| ChainError::Fatal(format!("signing {}: {}", label, e)))?;
            }

            match tokio::time::timeout(
                self.tx_config.timeout,
                self.send_and_confirm(&tx, send_config.clone()),
            )
            .await
            {
                Ok(Ok(signature)) => {
                    tracing::info!(label, %signature, attempt, "Transaction confirmed");
                    return Ok(signature);
                }
                Ok(Err(e)) => {
                    if !e.is_retriable_submit() {
                        tracing::error!(label, attempt, "Transaction failed: {}", e);
                        return Err(e);
                    }
                    last_err = e;
                }
                Err(_elapsed) => {
                    last_err = ChainError::ConfirmationTimeout(self.tx_config.timeout.as_millis() as u64);
                }
            }

            let pause = submit_backoff(attempt);
            tracing::warn!(
                label,
                attempt,
                "Retrying with fresh blockhash in {:?} ({})",
                pause,
                last_err
            );
            tokio::time::sleep(pause).await;
        }

        tracing::error!(
            label,
            "Transaction exhausted {} attempts: {}",
            self.tx_config.max_retries,
            last_err
        );
        Err(last_err)
    }

    async fn account_exists(&self, address: &Pubkey) -> Result<bool, ChainError> {
        let rpc = self.rpc.clone();
        let address = *address;
        let result = self
            .paced_read("getAccountInfo", move || {
                let rpc = rpc.clone();
                async move { rpc.get_account(&address).await }
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(ChainError::AccountNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
