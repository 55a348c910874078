use crate::error::ChainError;
use crate::models::{Side, StrategyKind};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::transaction::Transaction;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Active bin of a pool: the bin the current price sits in
#[derive(Debug, Clone, Copy)]
pub struct ActiveBin {
    pub bin_id: i32,
    pub price: f64,
}

/// On-chain view of a position account
#[derive(Debug, Clone)]
pub struct OnchainPosition {
    pub lower_bin: i32,
    pub upper_bin: i32,
    pub last_updated_at: DateTime<Utc>,
    pub owner: Pubkey,
}

/// Parameters for a one-sided position deposit
#[derive(Debug, Clone)]
pub struct CreatePositionRequest {
    pub side: Side,
    pub amount_base: f64,
    pub amount_quote: f64,
    pub min_bin: i32,
    pub max_bin: i32,
    pub strategy: StrategyKind,
    pub slippage_pct: f64,
}

/// Unsubmitted create transaction plus the keypair of the new position
/// account, which must co-sign the submission
pub struct CreatedPosition {
    pub tx: Transaction,
    pub position: Arc<Keypair>,
}

/// Opaque boundary to the DLMM pool SDK. Everything the trading core needs
/// from the pool program, nothing more. Transactions come back unsigned;
/// submission and signing stay with the RPC executor.
#[async_trait]
pub trait DlmmSdk: Send + Sync {
    async fn active_bin(&self, pool: &Pubkey) -> Result<ActiveBin, ChainError>;

    /// Idempotent init of the bin arrays covering `[min_bin, max_bin]`.
    /// Returns an empty list when everything is already initialized.
    async fn ensure_bin_arrays(
        &self,
        pool: &Pubkey,
        min_bin: i32,
        max_bin: i32,
    ) -> Result<Vec<Transaction>, ChainError>;

    async fn create_one_sided_position(
        &self,
        pool: &Pubkey,
        request: &CreatePositionRequest,
    ) -> Result<CreatedPosition, ChainError>;

    async fn remove_liquidity(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
        from_bin: i32,
        to_bin: i32,
        bps: u16,
        claim_and_close: bool,
    ) -> Result<Vec<Transaction>, ChainError>;

    async fn claim_all_rewards(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
    ) -> Result<Vec<Transaction>, ChainError>;

    async fn close_position_account(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
    ) -> Result<Transaction, ChainError>;

    async fn get_position(&self, position: &Pubkey) -> Result<OnchainPosition, ChainError>;

    async fn list_user_positions(&self, pool: &Pubkey) -> Result<Vec<Pubkey>, ChainError>;
}

// ============== HTTP adapter ==============

#[derive(Debug, Serialize)]
struct BinArraysRequest {
    min_bin: i32,
    max_bin: i32,
}

#[derive(Debug, Serialize)]
struct CreatePositionBody<'a> {
    owner: String,
    side: Side,
    amount_base: f64,
    amount_quote: f64,
    min_bin: i32,
    max_bin: i32,
    strategy: &'a StrategyKind,
    slippage_pct: f64,
}

#[derive(Debug, Serialize)]
struct RemoveLiquidityBody {
    from_bin: i32,
    to_bin: i32,
    bps: u16,
    claim_and_close: bool,
}

#[derive(Debug, Deserialize)]
struct ActiveBinResponse {
    bin_id: i32,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    transaction: String,
}

#[derive(Debug, Deserialize)]
struct CreatePositionResponse {
    transaction: String,
    /// 64-byte ed25519 keypair of the new position account, base64
    position_keypair: String,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    lower_bin: i32,
    upper_bin: i32,
    last_updated_at: DateTime<Utc>,
    owner: String,
}

#[derive(Debug, Deserialize)]
struct PositionListResponse {
    #[serde(default)]
    positions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterError {
    error: String,
}

/// Adapter to the DLMM transaction-builder sidecar. The official pool SDK
/// only ships for TypeScript, so instruction building runs in a local
/// sidecar process and this client moves transactions back and forth,
/// base64 + bincode encoded.
pub struct HttpDlmmSdk {
    client: Client,
    base_url: String,
    owner: Pubkey,
}

impl HttpDlmmSdk {
    pub fn new(base_url: String, owner: Pubkey) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            base_url,
            owner,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ChainError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 429 {
            return Err(ChainError::RateLimited);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AdapterError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        if status.is_server_error() {
            return Err(ChainError::Transient(message));
        }
        // The sidecar forwards program errors verbatim, classify them here
        Err(ChainError::classify(&message))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChainError::Fatal(format!("adapter response: {}", e)))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChainError::Fatal(format!("adapter response: {}", e)))
    }
}

fn decode_tx(encoded: &str) -> Result<Transaction, ChainError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ChainError::Fatal(format!("transaction base64: {}", e)))?;
    bincode::deserialize(&bytes).map_err(|e| ChainError::Fatal(format!("transaction decode: {}", e)))
}

fn decode_txs(encoded: &[String]) -> Result<Vec<Transaction>, ChainError> {
    encoded.iter().map(|s| decode_tx(s)).collect()
}

fn decode_pubkey(raw: &str) -> Result<Pubkey, ChainError> {
    Pubkey::from_str(raw).map_err(|e| ChainError::Fatal(format!("pubkey {}: {}", raw, e)))
}

#[async_trait]
impl DlmmSdk for HttpDlmmSdk {
    async fn active_bin(&self, pool: &Pubkey) -> Result<ActiveBin, ChainError> {
        let response: ActiveBinResponse =
            self.get_json(&format!("/pool/{}/active-bin", pool)).await?;
        Ok(ActiveBin {
            bin_id: response.bin_id,
            price: response.price,
        })
    }

    async fn ensure_bin_arrays(
        &self,
        pool: &Pubkey,
        min_bin: i32,
        max_bin: i32,
    ) -> Result<Vec<Transaction>, ChainError> {
        let response: TransactionsResponse = self
            .post_json(
                &format!("/pool/{}/bin-arrays", pool),
                &BinArraysRequest { min_bin, max_bin },
            )
            .await?;
        decode_txs(&response.transactions)
    }

    async fn create_one_sided_position(
        &self,
        pool: &Pubkey,
        request: &CreatePositionRequest,
    ) -> Result<CreatedPosition, ChainError> {
        let body = CreatePositionBody {
            owner: self.owner.to_string(),
            side: request.side,
            amount_base: request.amount_base,
            amount_quote: request.amount_quote,
            min_bin: request.min_bin,
            max_bin: request.max_bin,
            strategy: &request.strategy,
            slippage_pct: request.slippage_pct,
        };
        let response: CreatePositionResponse = self
            .post_json(&format!("/pool/{}/position", pool), &body)
            .await?;

        let secret = BASE64
            .decode(&response.position_keypair)
            .map_err(|e| ChainError::Fatal(format!("position keypair base64: {}", e)))?;
        let position = Keypair::from_bytes(&secret)
            .map_err(|e| ChainError::Fatal(format!("position keypair: {}", e)))?;

        Ok(CreatedPosition {
            tx: decode_tx(&response.transaction)?,
            position: Arc::new(position),
        })
    }

    async fn remove_liquidity(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
        from_bin: i32,
        to_bin: i32,
        bps: u16,
        claim_and_close: bool,
    ) -> Result<Vec<Transaction>, ChainError> {
        let response: TransactionsResponse = self
            .post_json(
                &format!("/pool/{}/position/{}/remove-liquidity", pool, position),
                &RemoveLiquidityBody {
                    from_bin,
                    to_bin,
                    bps,
                    claim_and_close,
                },
            )
            .await?;
        decode_txs(&response.transactions)
    }

    async fn claim_all_rewards(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
    ) -> Result<Vec<Transaction>, ChainError> {
        let response: TransactionsResponse = self
            .post_json(
                &format!("/pool/{}/position/{}/claim", pool, position),
                &serde_json::json!({}),
            )
            .await?;
        decode_txs(&response.transactions)
    }

    async fn close_position_account(
        &self,
        pool: &Pubkey,
        position: &Pubkey,
    ) -> Result<Transaction, ChainError> {
        let response: TransactionResponse = self
            .post_json(
                &format!("/pool/{}/position/{}/close", pool, position),
                &serde_json::json!({}),
            )
            .await?;
        decode_tx(&response.transaction)
    }

    async fn get_position(&self, position: &Pubkey) -> Result<OnchainPosition, ChainError> {
        let response: PositionResponse = self.get_json(&format!("/position/{}", position)).await?;
        Ok(OnchainPosition {
            lower_bin: response.lower_bin,
            upper_bin: response.upper_bin,
            last_updated_at: response.last_updated_at,
            owner: decode_pubkey(&response.owner)?,
        })
    }

    async fn list_user_positions(&self, pool: &Pubkey) -> Result<Vec<Pubkey>, ChainError> {
        let response: PositionListResponse = self
            .get_json(&format!("/pool/{}/positions?owner={}", pool, self.owner))
            .await?;
        response.positions.iter().map(|p| decode_pubkey(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;

    #[test]
    fn test_decode_tx_roundtrip() {
        let payer = Keypair::new();
        let tx = Transaction::new_with_payer(&[], Some(&payer.pubkey()));
        let encoded = BASE64.encode(bincode::serialize(&tx).unwrap());

        let decoded = decode_tx(&encoded).unwrap();
        assert_eq!(decoded.message.account_keys, tx.message.account_keys);
    }

    #[test]
    fn test_decode_tx_rejects_garbage() {
        assert!(decode_tx("not-base64!!!").is_err());
        assert!(decode_tx(&BASE64.encode(b"not a transaction")).is_err());
    }

    #[test]
    fn test_decode_pubkey() {
        let key = Pubkey::new_unique();
        assert_eq!(decode_pubkey(&key.to_string()).unwrap(), key);
        assert!(decode_pubkey("garbage").is_err());
    }
}
