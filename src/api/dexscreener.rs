use anyhow::{anyhow, Context, Result};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::execution::PriceSource;

const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com/latest/dex";
const RATE_LIMIT_RPM: u32 = 300; // Public token endpoint: 300 requests per minute
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // Start with 2 seconds

type DexScreenerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// DexScreener-backed price source
///
/// Quotes `priceNative`, i.e. the token price in SOL, taken from the Solana
/// pair whose base token is the requested mint. Clones share the rate limiter.
#[derive(Clone)]
pub struct DexScreenerPriceSource {
    client: Client,
    base_url: String,
    rate_limiter: Arc<DexScreenerRateLimiter>,
    max_retries: u32,
    initial_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct DexScreenerResponse {
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    chain_id: String,
    base_token: TokenInfo,
    price_native: String,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    address: String,
}

impl DexScreenerPriceSource {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEXSCREENER_API_BASE)
    }

    /// Point the client at another host (tests, proxies)
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_retry(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// Current SOL price of a token, retried with exponential backoff
    pub async fn fetch_price(&self, token_address: &str) -> Result<f64> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match self.fetch_price_once(token_address).await {
                Ok(price) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Fetched price for {} after {} attempts",
                            token_address,
                            attempt
                        );
                    }
                    return Ok(price);
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = self.initial_backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {}: {:#}. Retrying in {:?}...",
                            attempt,
                            self.max_retries,
                            token_address,
                            e,
                            backoff
                        );
                        sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All retry attempts failed")))
    }

    async fn fetch_price_once(&self, token_address: &str) -> Result<f64> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/tokens/{}", self.base_url, token_address);
        let response: DexScreenerResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("DexScreener request failed")?
            .error_for_status()
            .context("DexScreener returned an error status")?
            .json()
            .await
            .context("Failed to parse DexScreener response")?;

        let pair = response
            .pairs
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.chain_id == "solana" && p.base_token.address == token_address)
            .ok_or_else(|| anyhow!("No Solana pair found for {}", token_address))?;

        let price: f64 = pair
            .price_native
            .parse()
            .with_context(|| format!("Invalid priceNative '{}'", pair.price_native))?;

        Ok(price)
    }
}

#[async_trait::async_trait]
impl PriceSource for DexScreenerPriceSource {
    async fn get_price(&self, token_address: &str) -> Result<f64> {
        self.fetch_price(token_address).await
    }
}
