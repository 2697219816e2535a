use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

use super::price::PriceOracle;
use super::{Fetcher, TokenBucket, decimal_from_units, days_since, read_json};
use crate::core::{Chain, Transaction};
use crate::error::{Result, WhaleError};

const SERVICE: &str = "mempool.space";
const MEMPOOL_BASE: &str = "https://mempool.space/api";
const CALLS_PER_SEC: u32 = 10;
const SATS_DECIMALS: u32 = 8;
/// Upper bound on `/txs/chain` pages per fetch.
const MAX_PAGES: usize = 40;
/// Counterparty when no single address can be named.
const MULTIPLE: &str = "multiple";

#[derive(Debug, Clone, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    vin: Vec<RawInput>,
    #[serde(default)]
    vout: Vec<RawOutput>,
    #[serde(default)]
    fee: u64,
    #[serde(default)]
    status: RawStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct RawInput {
    #[serde(default)]
    prevout: Option<RawOutput>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawOutput {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    block_time: Option<i64>,
}

/// Largest counterparty by value among `legs`, excluding the wallet itself.
fn dominant_counterparty<'a>(legs: impl Iterator<Item = &'a RawOutput>, address: &str) -> String {
    let mut totals: HashMap<&str, u64> = HashMap::new();
    for leg in legs {
        if let Some(addr) = leg.scriptpubkey_address.as_deref() {
            if addr != address {
                *totals.entry(addr).or_default() += leg.value;
            }
        }
    }
    totals
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(addr, _)| addr.to_ascii_lowercase())
        .unwrap_or_else(|| MULTIPLE.to_string())
}

/// A UTXO transaction reduced to the wallet's net movement. Unconfirmed
/// transactions are stamped `fetched_at`.
fn parse_tx(raw: &RawTx, address: &str, btc_usd: Option<f64>, fetched_at: DateTime<Utc>) -> Option<Transaction> {
    let received: u64 = raw
        .vout
        .iter()
        .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
        .map(|o| o.value)
        .sum();
    let sent: u64 = raw
        .vin
        .iter()
        .filter_map(|i| i.prevout.as_ref())
        .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
        .map(|o| o.value)
        .sum();
    if received == sent {
        return None;
    }

    let inflow = received > sent;
    let value_native = decimal_from_units(u128::from(received.abs_diff(sent)), SATS_DECIMALS)?;
    let wallet = address.to_ascii_lowercase();
    let (from_addr, to_addr) = if inflow {
        let sender = dominant_counterparty(raw.vin.iter().filter_map(|i| i.prevout.as_ref()), address);
        (sender, wallet)
    } else {
        (wallet, dominant_counterparty(raw.vout.iter(), address))
    };
    // The fee is the sender's cost
    let gas_usd = if inflow {
        None
    } else {
        decimal_from_units(u128::from(raw.fee), SATS_DECIMALS)
            .and_then(|fee| Some(fee.to_f64()? * btc_usd?))
    };
    let timestamp = match (raw.status.confirmed, raw.status.block_time) {
        (true, Some(t)) => DateTime::from_timestamp(t, 0)?,
        _ => fetched_at,
    };

    Some(Transaction {
        tx_hash: raw.txid.clone(),
        chain: Chain::Btc,
        block_num: raw.status.block_height,
        from_addr,
        to_addr,
        timestamp,
        value_usd: value_native.to_f64().zip(btc_usd).map(|(v, p)| v * p),
        gas_usd,
        value_native,
        token_symbol: None,
        token_addr: None,
        fetched_at,
    })
}

/// mempool.space REST API. No key required.
pub struct MempoolFetcher {
    client: reqwest::Client,
    base_url: String,
    limiter: TokenBucket,
    prices: Arc<PriceOracle>,
}

impl MempoolFetcher {
    pub fn new(client: reqwest::Client, prices: Arc<PriceOracle>) -> Self {
        Self {
            client,
            base_url: MEMPOOL_BASE.to_string(),
            limiter: TokenBucket::new(CALLS_PER_SEC),
            prices,
        }
    }

    async fn get_page(&self, path: &str) -> Result<Vec<RawTx>> {
        self.limiter.acquire().await;
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| WhaleError::from_http(SERVICE, e))?;
        read_json(SERVICE, resp).await
    }

    /// Mempool plus newest confirmed, then older confirmed pages keyed by
    /// the last seen txid, until a page reaches `cutoff`.
    async fn fetch_since(&self, address: &str, cutoff: i64) -> Result<Vec<RawTx>> {
        let mut rows = self.get_page(&format!("/address/{address}/txs")).await?;
        for _ in 0..MAX_PAGES {
            let last_confirmed = rows.iter().rev().find(|t| t.status.confirmed);
            let Some(last) = last_confirmed else { break };
            if last.status.block_time.is_some_and(|t| t < cutoff) {
                break;
            }
            let path = format!("/address/{address}/txs/chain/{}", last.txid);
            let page = self.get_page(&path).await?;
            if page.is_empty() {
                break;
            }
            rows.extend(page);
        }
        rows.retain(|t| !t.status.confirmed || t.status.block_time.is_some_and(|bt| bt >= cutoff));
        Ok(rows)
    }
}

#[async_trait]
impl Fetcher for MempoolFetcher {
    fn chain(&self) -> Chain {
        Chain::Btc
    }

    async fn get_transactions(&self, address: &str, hours: u32) -> Result<Vec<Transaction>> {
        if !self.validate_address(address) {
            return Err(WhaleError::InvalidAddress {
                chain: Chain::Btc,
                address: address.to_string(),
            });
        }
        let now = Utc::now();
        let cutoff = now.timestamp() - i64::from(hours) * 3600;
        let raw = self.fetch_since(address, cutoff).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let btc_usd = self.prices.usd_price("BTC").await;
        let mut seen = std::collections::HashSet::new();
        let mut txs: Vec<Transaction> = raw
            .iter()
            .filter(|r| seen.insert(r.txid.clone()))
            .filter_map(|r| parse_tx(r, address, btc_usd, now))
            .collect();
        txs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        tracing::debug!(address, hours, count = txs.len(), "mempool.space transactions fetched");
        Ok(txs)
    }

    /// Age of the oldest transaction on the first page of history.
    async fn get_wallet_age(&self, address: &str) -> Result<u32> {
        let rows = self.get_page(&format!("/address/{address}/txs")).await?;
        Ok(rows
            .iter()
            .filter_map(|t| t.status.block_time)
            .min()
            .map(days_since)
            .unwrap_or(0))
    }
}
