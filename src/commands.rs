use crate::chain::wallet::{BalanceProvider, WalletService};
use crate::config::{SharedTunables, TunablesPatch};
use crate::error::{ChainError, VendorError};
use crate::execution::manager::PositionManager;
use crate::execution::store::PositionStore;
use crate::indicators::IndicatorCache;
use crate::models::{Side, Timeframe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

/// Sort direction for position listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandError {
    pub code: u16,
    pub message: String,
}

/// Uniform envelope every command returns
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn err(code: u16, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError { code, message }),
            timestamp: Utc::now(),
        }
    }

    fn from_result(result: anyhow::Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(error_code(&e), format!("{:#}", e)),
        }
    }
}

/// Map an error to its boundary status code: 400 for validation, 429 when
/// an upstream rate limit bled through, 500 otherwise
fn error_code(error: &anyhow::Error) -> u16 {
    if let Some(vendor) = error.downcast_ref::<VendorError>() {
        return match vendor {
            VendorError::RateLimited => 429,
            _ => 500,
        };
    }
    if let Some(chain) = error.downcast_ref::<ChainError>() {
        return match chain {
            ChainError::Validation(_) => 400,
            ChainError::RateLimited => 429,
            _ => 500,
        };
    }
    500
}

/// Translates external commands into trading-core calls. Transport-agnostic:
/// whatever surface (HTTP, CLI, tests) owns the adapter just forwards the
/// already-parsed arguments.
pub struct BoundaryAdapter {
    manager: Arc<PositionManager>,
    store: Arc<PositionStore>,
    wallet: Arc<WalletService>,
    indicators: Arc<IndicatorCache>,
    tunables: SharedTunables,
    symbol: String,
    enabled: Vec<Timeframe>,
}

impl BoundaryAdapter {
    pub fn new(
        manager: Arc<PositionManager>,
        store: Arc<PositionStore>,
        wallet: Arc<WalletService>,
        indicators: Arc<IndicatorCache>,
        tunables: SharedTunables,
        symbol: String,
        enabled: Vec<Timeframe>,
    ) -> Self {
        Self {
            manager,
            store,
            wallet,
            indicators,
            tunables,
            symbol,
            enabled,
        }
    }

    pub fn get_positions(&self, limit: Option<usize>, order: Option<SortOrder>) -> CommandResponse {
        let ascending = order == Some(SortOrder::Asc);
        let positions = self.store.all_sorted(limit, ascending);
        CommandResponse::ok(json!(positions))
    }

    pub async fn create_position(
        &self,
        timeframe: &str,
        side: &str,
        amount: f64,
    ) -> CommandResponse {
        let parsed: Result<(Timeframe, Side), ChainError> = (|| {
            let tf = timeframe
                .parse::<Timeframe>()
                .map_err(ChainError::Validation)?;
            let side = side.parse::<Side>().map_err(ChainError::Validation)?;
            Ok((tf, side))
        })();
        let (tf, side) = match parsed {
            Ok(pair) => pair,
            Err(e) => return CommandResponse::from_result(Err(e.into())),
        };

        CommandResponse::from_result(
            self.manager
                .create(tf, side, amount)
                .await
                .map(|position| json!(position)),
        )
    }

    pub async fn close_position(&self, id: &str) -> CommandResponse {
        CommandResponse::from_result(self.manager.close(id, false).await.map(|outcome| {
            json!({
                "id": id,
                "received_base": outcome.received_base,
                "received_quote": outcome.received_quote,
            })
        }))
    }

    pub async fn sync_positions(&self) -> CommandResponse {
        CommandResponse::from_result(
            self.manager
                .sync_with_chain()
                .await
                .map(|report| json!(report)),
        )
    }

    pub async fn get_balance(&self) -> CommandResponse {
        CommandResponse::from_result(
            self.wallet
                .balance(false)
                .await
                .map(|balance| json!(balance)),
        )
    }

    pub fn get_balance_history(
        &self,
        limit: Option<usize>,
        hours: Option<u64>,
    ) -> CommandResponse {
        CommandResponse::ok(json!(self.wallet.history(limit, hours)))
    }

    pub async fn get_rsi(&self, timeframe: Option<&str>) -> CommandResponse {
        let period = self.tunables.read().unwrap().rsi_period;
        match timeframe {
            Some(raw) => {
                let tf = match raw.parse::<Timeframe>() {
                    Ok(tf) => tf,
                    Err(e) => return CommandResponse::err(400, e),
                };
                CommandResponse::from_result(
                    self.indicators
                        .rsi(&self.symbol, tf, period, false)
                        .await
                        .map(|value| json!(value)),
                )
            }
            None => {
                let values = self
                    .indicators
                    .rsi_all(&self.symbol, &self.enabled, period, false)
                    .await;
                CommandResponse::ok(json!(values))
            }
        }
    }

    pub async fn get_price(&self) -> CommandResponse {
        CommandResponse::from_result(
            self.indicators
                .spot_price(&self.symbol)
                .await
                .map(|price| json!({ "symbol": self.symbol, "price": price })),
        )
    }

    pub fn get_config(&self) -> CommandResponse {
        let tunables = self.tunables.read().unwrap().clone();
        CommandResponse::ok(json!(tunables))
    }

    pub fn update_config(&self, patch: &TunablesPatch) -> CommandResponse {
        let result = {
            let mut tunables = self.tunables.write().unwrap();
            tunables
                .apply_patch(patch)
                .map_err(|e| ChainError::Validation(format!("{:#}", e)))
                .map(|()| json!(tunables.clone()))
        };
        CommandResponse::from_result(result.map_err(Into::into))
    }
}
