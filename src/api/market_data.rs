use crate::error::VendorError;
use crate::models::{Candle, Timeframe};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const RATE_LIMIT_RPM: u32 = 120;
const MAX_RETRIES: u32 = 3;
/// Minimum spacing between any two outbound vendor calls
const MIN_REQUEST_GAP: Duration = Duration::from_millis(300);

type VendorRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Read-only market data source consumed by the indicator cache
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch up to `limit` OHLC candles, oldest first, last one possibly unclosed
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, VendorError>;

    async fn fetch_spot_price(&self, symbol: &str) -> Result<f64, VendorError>;
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

/// Client for the candle/price vendor (Binance-compatible REST surface)
///
/// All requests flow through a single FIFO lane: the pacer mutex is held
/// across the whole request, so no two vendor calls are ever in flight
/// concurrently and consecutive calls start at least 300 ms apart.
/// Caching belongs to the indicator cache, not here.
#[derive(Clone)]
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    lane: Arc<Mutex<Option<Instant>>>,
    rate_limiter: Arc<VendorRateLimiter>,
}

impl MarketDataClient {
    pub fn new(base_url: String) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            base_url,
            lane: Arc::new(Mutex::new(None)),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Serialized, paced, retried GET returning the raw response body
    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, VendorError> {
        let mut last_call = self.lane.lock().await;

        for attempt in 1..=MAX_RETRIES {
            if let Some(prev) = *last_call {
                let since = prev.elapsed();
                if since < MIN_REQUEST_GAP {
                    tokio::time::sleep(MIN_REQUEST_GAP - since).await;
                }
            }
            self.rate_limiter.until_ready().await;
            *last_call = Some(Instant::now());

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 {
                        // Not retried here: the caller decides whether to
                        // fall back or propagate the 429
                        return Err(VendorError::RateLimited);
                    }

                    if status.is_server_error() {
                        let backoff = Duration::from_secs(1 << (attempt - 1));
                        tracing::warn!(
                            "Vendor returned {}, retrying in {:?} (attempt {}/{})",
                            status,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(VendorError::Http {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| VendorError::Parse(e.to_string()));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        "Vendor network error: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(VendorError::Network(e.to_string())),
            }
        }

        Err(VendorError::Network(format!(
            "failed after {} retries",
            MAX_RETRIES
        )))
    }
}

/// Parse one kline row of the vendor wire format:
/// `[open_time_ms, "o", "h", "l", "c", "vol", close_time_ms, ...]`
fn parse_kline(row: &serde_json::Value) -> Result<Candle, VendorError> {
    let arr = row
        .as_array()
        .ok_or_else(|| VendorError::Parse("kline row is not an array".into()))?;

    let millis = |i: usize| -> Result<i64, VendorError> {
        arr.get(i)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| VendorError::Parse(format!("kline field {} is not a timestamp", i)))
    };
    let num = |i: usize| -> Result<f64, VendorError> {
        arr.get(i)
            .and_then(|v| v.as_str())
            .ok_or_else(|| VendorError::Parse(format!("kline field {} is not a string", i)))?
            .parse::<f64>()
            .map_err(|e| VendorError::Parse(format!("kline field {}: {}", i, e)))
    };
    let ts = |ms: i64| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| VendorError::Parse(format!("invalid timestamp {}", ms)))
    };

    Ok(Candle {
        open_time: ts(millis(0)?)?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
        close_time: ts(millis(6)?)?,
    })
}

#[async_trait]
impl KlineSource for MarketDataClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, VendorError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, limit
        );

        let rows: Vec<serde_json::Value> = self.request_json(&url).await?;
        let candles = rows
            .iter()
            .map(parse_kline)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            symbol,
            timeframe = %timeframe,
            count = candles.len(),
            "Fetched klines"
        );

        Ok(candles)
    }

    async fn fetch_spot_price(&self, symbol: &str) -> Result<f64, VendorError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let ticker: TickerPrice = self.request_json(&url).await?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|e| VendorError::Parse(format!("ticker price: {}", e)))
    }
}
