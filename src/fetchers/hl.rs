use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::json;

use super::{Fetcher, TokenBucket, days_since, read_json};
use crate::core::{Chain, Transaction};
use crate::error::{Result, WhaleError};

const SERVICE: &str = "Hyperliquid";
const HL_INFO_URL: &str = "https://api.hyperliquid.xyz/info";
const CALLS_PER_SEC: u32 = 10;
/// Fills returned per `userFillsByTime` response at most.
const FILLS_PER_PAGE: usize = 2000;
const MAX_PAGES: usize = 10;
/// Counterparty of every fill.
const MARKET: &str = "market";

#[derive(Debug, Clone, Deserialize)]
struct Fill {
    coin: String,
    px: String,
    sz: String,
    /// "B" buy, "A" sell.
    side: String,
    /// Unix milliseconds.
    time: i64,
    #[serde(default)]
    oid: u64,
    #[serde(default)]
    tid: u64,
    #[serde(default)]
    fee: Option<String>,
}

/// A perp fill as a transfer between the wallet and the market. Buys flow
/// into the wallet; `value_usd` is the notional.
fn parse_fill(fill: &Fill, address: &str, fetched_at: DateTime<Utc>) -> Option<Transaction> {
    let size = Decimal::from_str(&fill.sz).ok()?;
    let price: f64 = fill.px.parse().ok()?;
    let wallet = address.to_ascii_lowercase();
    let (from_addr, to_addr) = if fill.side == "B" {
        (MARKET.to_string(), wallet)
    } else {
        (wallet, MARKET.to_string())
    };
    Some(Transaction {
        tx_hash: format!("hl_{}_{}", fill.oid, fill.tid),
        chain: Chain::Hl,
        block_num: None,
        from_addr,
        to_addr,
        timestamp: DateTime::from_timestamp_millis(fill.time)?,
        value_native: size,
        value_usd: size.to_f64().map(|s| s * price),
        gas_usd: fill.fee.as_deref().and_then(|f| f.parse().ok()),
        token_symbol: Some(fill.coin.clone()),
        token_addr: None,
        fetched_at,
    })
}

/// Hyperliquid `/info` endpoint. No key required.
pub struct HyperliquidFetcher {
    client: reqwest::Client,
    url: String,
    limiter: TokenBucket,
}

impl HyperliquidFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: HL_INFO_URL.to_string(),
            limiter: TokenBucket::new(CALLS_PER_SEC),
        }
    }

    async fn info(&self, body: serde_json::Value) -> Result<Vec<Fill>> {
        self.limiter.acquire().await;
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| WhaleError::from_http(SERVICE, e))?;
        read_json(SERVICE, resp).await
    }

    async fn fills_since(&self, address: &str, start_ms: i64) -> Result<Vec<Fill>> {
        let mut fills = Vec::new();
        let mut start = start_ms;
        for _ in 0..MAX_PAGES {
            let page = self
                .info(json!({"type": "userFillsByTime", "user": address, "startTime": start}))
                .await?;
            let full = page.len() >= FILLS_PER_PAGE;
            let newest = page.iter().map(|f| f.time).max();
            fills.extend(page);
            match newest {
                Some(t) if full => start = t + 1,
                _ => break,
            }
        }
        Ok(fills)
    }
}

#[async_trait]
impl Fetcher for HyperliquidFetcher {
    fn chain(&self) -> Chain {
        Chain::Hl
    }

    async fn get_transactions(&self, address: &str, hours: u32) -> Result<Vec<Transaction>> {
        if !self.validate_address(address) {
            return Err(WhaleError::InvalidAddress {
                chain: Chain::Hl,
                address: address.to_string(),
            });
        }
        let now = Utc::now();
        let start_ms = now.timestamp_millis() - i64::from(hours) * 3_600_000;
        let fills = self.fills_since(address, start_ms).await?;

        let mut txs: Vec<Transaction> = fills
            .iter()
            .filter(|f| f.time >= start_ms)
            .filter_map(|f| parse_fill(f, address, now))
            .collect();
        txs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        tracing::debug!(address, hours, count = txs.len(), "Hyperliquid fills fetched");
        Ok(txs)
    }

    /// Age of the oldest of the most recent fills.
    async fn get_wallet_age(&self, address: &str) -> Result<u32> {
        let fills = self.info(json!({"type": "userFills", "user": address})).await?;
        Ok(fills
            .iter()
            .map(|f| f.time)
            .min()
            .map(|ms| days_since(ms / 1000))
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x8f2a0000000000000000000000000000000000aa";

    fn fills() -> Vec<Fill> {
        serde_json::from_str(
            r#"[
                {"coin":"BTC","px":"65000.0","sz":"2.5","side":"B","time":1717000000000,
                 "oid":111,"tid":222,"fee":"48.75","dir":"Open Long","closedPnl":"0.0","hash":"0x00"},
                {"coin":"ETH","px":"3500.5","sz":"10","side":"A","time":1717000500000,
                 "oid":333,"tid":444,"fee":"10.5"}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn buy_flows_into_wallet() {
        let tx = parse_fill(&fills()[0], WALLET, Utc::now()).unwrap();
        assert_eq!(tx.tx_hash, "hl_111_222");
        assert_eq!(tx.from_addr, "market");
        assert_eq!(tx.to_addr, WALLET);
        assert_eq!(tx.value_native, Decimal::new(25, 1));
        assert_eq!(tx.value_usd, Some(162_500.0));
        assert_eq!(tx.gas_usd, Some(48.75));
        assert_eq!(tx.token_symbol.as_deref(), Some("BTC"));
        assert_eq!(tx.timestamp.timestamp_millis(), 1_717_000_000_000);
    }

    #[test]
    fn sell_flows_out_of_wallet() {
        let tx = parse_fill(&fills()[1], &WALLET.to_ascii_uppercase().replace("0X", "0x"), Utc::now()).unwrap();
        assert_eq!(tx.from_addr, WALLET);
        assert_eq!(tx.to_addr, "market");
        assert_eq!(tx.value_usd, Some(35_005.0));
    }

    #[test]
    fn malformed_size_is_skipped() {
        let mut fill = fills()[0].clone();
        fill.sz = "lots".into();
        assert!(parse_fill(&fill, WALLET, Utc::now()).is_none());
    }

    #[tokio::test]
    async fn invalid_address_rejected_before_network() {
        let fetcher = HyperliquidFetcher::new(reqwest::Client::new());
        let err = fetcher.get_transactions("0x123", 1).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_address");
    }
}
