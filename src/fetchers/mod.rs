pub mod btc;
pub mod eth;
pub mod hl;
pub mod price;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::core::{Chain, Transaction};
use crate::db::SharedDatabase;
use crate::error::{Result, WhaleError};
use price::PriceOracle;

/// Per-chain transaction source.
///
/// "No transactions" is an empty list, never an error.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn chain(&self) -> Chain;

    /// Transactions touching `address` in the last `hours`.
    async fn get_transactions(&self, address: &str, hours: u32) -> Result<Vec<Transaction>>;

    /// Days since the wallet's first visible transaction (0 when none).
    async fn get_wallet_age(&self, address: &str) -> Result<u32>;

    /// Format check only, no network.
    fn validate_address(&self, address: &str) -> bool {
        validate_address(self.chain(), address)
    }
}

fn is_hex_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Offline address validation for any supported chain.
pub fn validate_address(chain: Chain, address: &str) -> bool {
    match chain {
        Chain::Eth | Chain::Hl => is_hex_address(address),
        Chain::Btc => bitcoin::Address::from_str(address)
            .map(|a| a.is_valid_for_network(bitcoin::Network::Bitcoin))
            .unwrap_or(false),
    }
}

/// Used when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Decode a JSON response body, mapping 429 and non-2xx statuses onto the
/// error taxonomy.
pub(crate) async fn read_json<T: DeserializeOwned>(service: &'static str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Err(WhaleError::RateLimited {
            service,
            retry_after_secs,
        });
    }
    let body = resp.text().await.map_err(|e| WhaleError::from_http(service, e))?;
    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return Err(WhaleError::Api {
            service,
            message: format!("HTTP {}: {snippet}", status.as_u16()),
        });
    }
    serde_json::from_str(&body).map_err(|e| WhaleError::Api {
        service,
        message: format!("malformed response: {e}"),
    })
}

/// `raw` base units at `decimals` places. Precision is shed from the right
/// when the value does not fit a `Decimal`.
pub(crate) fn decimal_from_units(raw: u128, decimals: u32) -> Option<Decimal> {
    let mut mantissa = raw;
    let mut scale = decimals;
    loop {
        if let Ok(m) = i128::try_from(mantissa) {
            if let Ok(d) = Decimal::try_from_i128_with_scale(m, scale) {
                return Some(d.normalize());
            }
        }
        if scale == 0 {
            return None;
        }
        mantissa /= 10;
        scale -= 1;
    }
}

/// Whole days elapsed since `unix_secs`, never negative.
pub(crate) fn days_since(unix_secs: i64) -> u32 {
    let elapsed = chrono::Utc::now().timestamp() - unix_secs;
    (elapsed.max(0) / 86_400) as u32
}

/// Owned token bucket. `acquire` waits until a call slot is free.
pub struct TokenBucket {
    capacity: f64,
    per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(calls_per_sec: u32) -> Self {
        let rate = calls_per_sec.max(1) as f64;
        Self {
            capacity: rate,
            per_sec: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.per_sec);
            // Holding the lock while sleeping queues waiters in order
            tokio::time::sleep(wait).await;
            state.tokens = 0.0;
            state.last_refill = Instant::now();
        } else {
            state.tokens -= 1.0;
        }
    }
}

/// Registry of fetchers, one slot per chain.
#[derive(Clone, Default)]
pub struct Fetchers {
    eth: Option<Arc<dyn Fetcher>>,
    btc: Option<Arc<dyn Fetcher>>,
    hl: Option<Arc<dyn Fetcher>>,
}

impl Fetchers {
    pub fn from_config(config: &Config, db: SharedDatabase) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.http_timeout_secs))
            .user_agent(concat!("whalecli/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WhaleError::Config(format!("failed to build HTTP client: {e}")))?;
        let prices = Arc::new(PriceOracle::new(client.clone(), Some(db)));

        if config.api.etherscan_api_key.is_empty() {
            tracing::warn!("No Etherscan API key configured; ETH fetches will fail");
        }
        Ok(Self::default()
            .with(Arc::new(eth::EtherscanFetcher::new(
                client.clone(),
                &config.api.etherscan_api_key,
                config.api.etherscan_calls_per_sec,
                prices.clone(),
            )))
            .with(Arc::new(btc::MempoolFetcher::new(client.clone(), prices)))
            .with(Arc::new(hl::HyperliquidFetcher::new(client))))
    }

    /// Install `fetcher` in its chain's slot.
    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        match fetcher.chain() {
            Chain::Eth => self.eth = Some(fetcher),
            Chain::Btc => self.btc = Some(fetcher),
            Chain::Hl => self.hl = Some(fetcher),
        }
        self
    }

    pub fn get(&self, chain: Chain) -> Option<&Arc<dyn Fetcher>> {
        match chain {
            Chain::Eth => self.eth.as_ref(),
            Chain::Btc => self.btc.as_ref(),
            Chain::Hl => self.hl.as_ref(),
        }
    }
}
