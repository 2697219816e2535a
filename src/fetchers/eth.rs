use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::Value;

use super::price::{PriceOracle, known_token};
use super::{Fetcher, TokenBucket, decimal_from_units, days_since, read_json};
use crate::core::{Chain, Transaction};
use crate::error::{Result, WhaleError};

const SERVICE: &str = "Etherscan";
const ETHERSCAN_BASE: &str = "https://api.etherscan.io/api";
/// Etherscan's maximum `offset`.
const PAGE_SIZE: usize = 10_000;
const WEI_DECIMALS: u32 = 18;

/// Etherscan response envelope. `result` is an array on success and a
/// message string on failure.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

/// A `txlist` or `tokentx` row. Etherscan encodes every field as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTx {
    hash: String,
    #[serde(default)]
    block_number: String,
    time_stamp: String,
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    gas_price: String,
    #[serde(default)]
    gas_used: String,
    #[serde(default)]
    is_error: String,
    #[serde(default)]
    token_symbol: Option<String>,
    #[serde(default)]
    token_decimal: Option<String>,
    #[serde(default)]
    contract_address: Option<String>,
}

impl RawTx {
    fn unix_time(&self) -> Option<i64> {
        self.time_stamp.parse().ok()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.unix_time()?, 0)
    }

    fn gas_eth(&self) -> Option<Decimal> {
        let price: u128 = self.gas_price.parse().ok()?;
        let used: u128 = self.gas_used.parse().ok()?;
        decimal_from_units(price.checked_mul(used)?, WEI_DECIMALS)
    }
}

/// Turn an envelope into rows. "No transactions found" is an empty page.
fn classify(envelope: Envelope) -> Result<Vec<RawTx>> {
    if envelope.status == "0" {
        let detail = envelope.result.as_str().unwrap_or_default();
        if detail.contains("Invalid API Key") || detail.contains("Missing/Invalid API Key") {
            return Err(WhaleError::InvalidApiKey { service: SERVICE });
        }
        if detail.contains("rate limit") {
            return Err(WhaleError::RateLimited {
                service: SERVICE,
                retry_after_secs: super::DEFAULT_RETRY_AFTER_SECS,
            });
        }
        if envelope.message != "No transactions found" {
            tracing::debug!(status_message = %envelope.message, detail, "Etherscan returned status 0");
        }
        return Ok(Vec::new());
    }
    match envelope.result {
        Value::Array(_) => serde_json::from_value(envelope.result).map_err(|e| WhaleError::Api {
            service: SERVICE,
            message: format!("unexpected transaction shape: {e}"),
        }),
        Value::Null => Ok(Vec::new()),
        other => Err(WhaleError::Api {
            service: SERVICE,
            message: format!("unexpected result: {other}"),
        }),
    }
}

fn parse_native(raw: &RawTx, eth_usd: Option<f64>, fetched_at: DateTime<Utc>) -> Option<Transaction> {
    if raw.is_error == "1" {
        return None;
    }
    let value_native = decimal_from_units(raw.value.parse().ok()?, WEI_DECIMALS)?;
    let gas = raw.gas_eth();
    Some(Transaction {
        tx_hash: raw.hash.clone(),
        chain: Chain::Eth,
        block_num: raw.block_number.parse().ok(),
        from_addr: raw.from.to_ascii_lowercase(),
        to_addr: raw.to.to_ascii_lowercase(),
        timestamp: raw.timestamp()?,
        value_usd: usd(value_native, eth_usd),
        gas_usd: gas.and_then(|g| usd(g, eth_usd)),
        value_native,
        token_symbol: None,
        token_addr: None,
        fetched_at,
    })
}

/// ERC-20 transfers share their parent's hash, so the symbol is appended
/// to keep `(chain, tx_hash)` unique.
fn parse_token(
    raw: &RawTx,
    token_usd: Option<f64>,
    eth_usd: Option<f64>,
    fetched_at: DateTime<Utc>,
) -> Option<Transaction> {
    let symbol = raw.token_symbol.clone().filter(|s| !s.is_empty())?;
    let decimals = raw
        .token_decimal
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(WEI_DECIMALS);
    let value_native = decimal_from_units(raw.value.parse().ok()?, decimals)?;
    Some(Transaction {
        tx_hash: format!("{}:{symbol}", raw.hash),
        chain: Chain::Eth,
        block_num: raw.block_number.parse().ok(),
        from_addr: raw.from.to_ascii_lowercase(),
        to_addr: raw.to.to_ascii_lowercase(),
        timestamp: raw.timestamp()?,
        value_usd: usd(value_native, token_usd),
        gas_usd: raw.gas_eth().and_then(|g| usd(g, eth_usd)),
        value_native,
        token_addr: raw.contract_address.as_ref().map(|a| a.to_ascii_lowercase()),
        token_symbol: Some(symbol),
        fetched_at,
    })
}

/// The ticker a token row is priced as. Keyed on the contract, not on the
/// self-reported `tokenSymbol`.
fn priced_symbol(raw: &RawTx) -> Option<&'static str> {
    raw.contract_address.as_deref().and_then(known_token)
}

fn token_price(raw: &RawTx, prices: &HashMap<&'static str, Option<f64>>) -> Option<f64> {
    prices.get(priced_symbol(raw)?).copied().flatten()
}

fn usd(amount: Decimal, price: Option<f64>) -> Option<f64> {
    Some(amount.to_f64()? * price?)
}

/// Etherscan account API: native transfers plus ERC-20 transfers.
pub struct EtherscanFetcher {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    limiter: TokenBucket,
    prices: Arc<PriceOracle>,
}

impl EtherscanFetcher {
    pub fn new(client: reqwest::Client, api_key: &str, calls_per_sec: u32, prices: Arc<PriceOracle>) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: ETHERSCAN_BASE.to_string(),
            limiter: TokenBucket::new(calls_per_sec),
            prices,
        }
    }

    async fn account_call(&self, action: &str, address: &str, sort: &str, page: usize, offset: usize) -> Result<Vec<RawTx>> {
        self.limiter.acquire().await;
        let page = page.to_string();
        let offset = offset.to_string();
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("module", "account"),
                ("action", action),
                ("address", address),
                ("startblock", "0"),
                ("endblock", "99999999"),
                ("sort", sort),
                ("page", page.as_str()),
                ("offset", offset.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WhaleError::from_http(SERVICE, e))?;
        classify(read_json(SERVICE, resp).await?)
    }

    /// Newest-first pages until one crosses `cutoff`.
    async fn fetch_since(&self, action: &str, address: &str, cutoff: i64) -> Result<Vec<RawTx>> {
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let batch = self.account_call(action, address, "desc", page, PAGE_SIZE).await?;
            let full = batch.len() >= PAGE_SIZE;
            let oldest = batch.last().and_then(RawTx::unix_time).unwrap_or(0);
            rows.extend(batch);
            if !full || oldest < cutoff {
                break;
            }
            page += 1;
        }
        rows.retain(|r| r.unix_time().is_some_and(|t| t >= cutoff));
        Ok(rows)
    }
}

#[async_trait]
impl Fetcher for EtherscanFetcher {
    fn chain(&self) -> Chain {
        Chain::Eth
    }

    async fn get_transactions(&self, address: &str, hours: u32) -> Result<Vec<Transaction>> {
        if !self.validate_address(address) {
            return Err(WhaleError::InvalidAddress {
                chain: Chain::Eth,
                address: address.to_string(),
            });
        }
        let now = Utc::now();
        let cutoff = now.timestamp() - i64::from(hours) * 3600;

        let (native, tokens) = tokio::try_join!(
            self.fetch_since("txlist", address, cutoff),
            self.fetch_since("tokentx", address, cutoff),
        )?;

        let eth_usd = self.prices.usd_price("ETH").await;
        let mut token_prices: HashMap<&'static str, Option<f64>> = HashMap::new();
        for symbol in tokens.iter().filter_map(priced_symbol) {
            if !token_prices.contains_key(symbol) {
                let price = self.prices.usd_price(symbol).await;
                token_prices.insert(symbol, price);
            }
        }

        let mut txs: Vec<Transaction> = native
            .iter()
            .filter_map(|raw| parse_native(raw, eth_usd, now))
            .collect();
        txs.extend(
            tokens
                .iter()
                .filter_map(|raw| parse_token(raw, token_price(raw, &token_prices), eth_usd, now)),
        );
        txs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        tracing::debug!(address, hours, count = txs.len(), "Etherscan transactions fetched");
        Ok(txs)
    }

    async fn get_wallet_age(&self, address: &str) -> Result<u32> {
        let first = self.account_call("txlist", address, "asc", 1, 1).await?;
        Ok(first
            .first()
            .and_then(RawTx::unix_time)
            .map(days_since)
            .unwrap_or(0))
    }
}
