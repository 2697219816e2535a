use std::collections::HashMap;
use std::time::Duration;

use crate::db::SharedDatabase;

const COINGECKO_BASE: &str = "https://api.coingecko.com/api/v3";
pub const PRICE_TTL: Duration = Duration::from_secs(600);

const STABLECOINS: &[&str] = &["USDT", "USDC", "DAI", "BUSD", "TUSD", "USDP", "FDUSD"];

/// Mainnet ERC-20 contracts that get a USD price, by lowercase address.
/// Transfers of any other contract stay unpriced whatever symbol they claim.
const KNOWN_TOKENS: &[(&str, &str)] = &[
    ("0xdac17f958d2ee523a2206206994597c13d831ec7", "USDT"),
    ("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", "USDC"),
    ("0x6b175474e89094c44da98b954eedeac495271d0f", "DAI"),
    ("0x4fabb145d64652a948d72533023f6e7a623c7c53", "BUSD"),
    ("0x0000000000085d4780b73119b644ae5ecd22b376", "TUSD"),
    ("0x8e870d67f660d95d5be530380d0ec0bd388289e1", "USDP"),
    ("0xc5f0f7b66764f6ec8c8dff7ba683102295e16409", "FDUSD"),
    ("0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "WETH"),
    ("0xae7ab96520de3a18e5e111b5eaab095312d7fe84", "STETH"),
    ("0x2260fac5e5542a773aa44fbcfedf7c193bc2c599", "WBTC"),
    ("0x514910771af9ca656af840dff83e8264ecf986ca", "LINK"),
    ("0x1f9840a85d5af5bf1d1762f925bdaddc4201f984", "UNI"),
    ("0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9", "AAVE"),
];

/// Ticker to price an ERC-20 contract by, if it is one we trust.
pub fn known_token(contract: &str) -> Option<&'static str> {
    let contract = contract.trim().to_ascii_lowercase();
    KNOWN_TOKENS
        .iter()
        .find(|(addr, _)| *addr == contract)
        .map(|(_, symbol)| *symbol)
}

/// CoinGecko id for a ticker, when we know it.
pub fn coingecko_id(symbol: &str) -> Option<&'static str> {
    match symbol.to_ascii_uppercase().as_str() {
        "ETH" | "WETH" | "STETH" => Some("ethereum"),
        "BTC" | "WBTC" => Some("bitcoin"),
        "LINK" => Some("chainlink"),
        "UNI" => Some("uniswap"),
        "AAVE" => Some("aave"),
        _ => None,
    }
}

/// Spot USD prices, memoised in the generic response cache.
pub struct PriceOracle {
    client: reqwest::Client,
    db: Option<SharedDatabase>,
    base_url: String,
}

impl PriceOracle {
    pub fn new(client: reqwest::Client, db: Option<SharedDatabase>) -> Self {
        Self {
            client,
            db,
            base_url: COINGECKO_BASE.to_string(),
        }
    }

    fn cache_key(id: &str) -> String {
        format!("coingecko:simple_price:{id}")
    }

    /// `None` when the price is unknown or the lookup failed; callers leave
    /// `value_usd` unset in that case.
    pub async fn usd_price(&self, symbol: &str) -> Option<f64> {
        if STABLECOINS.contains(&symbol.to_ascii_uppercase().as_str()) {
            return Some(1.0);
        }
        let id = coingecko_id(symbol)?;
        let key = Self::cache_key(id);

        if let Some(db) = &self.db {
            match db.cache_get(&key) {
                Ok(Some(cached)) => {
                    if let Ok(price) = cached.parse::<f64>() {
                        return Some(price);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("price cache read failed: {e}"),
            }
        }

        let price = self.fetch(id).await?;
        if let Some(db) = &self.db {
            if let Err(e) = db.cache_set(&key, &price.to_string(), PRICE_TTL) {
                tracing::debug!("price cache write failed: {e}");
            }
        }
        Some(price)
    }

    async fn fetch(&self, id: &str) -> Option<f64> {
        let url = format!("{}/simple/price", self.base_url);
        let resp = match self
            .client
            .get(&url)
            .query(&[("ids", id), ("vs_currencies", "usd")])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("CoinGecko price lookup for {id} failed: {e}");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!("CoinGecko returned HTTP {} for {id}", resp.status());
            return None;
        }
        let body: HashMap<String, HashMap<String, f64>> = resp.json().await.ok()?;
        parse_simple_price(&body, id)
    }
}

fn parse_simple_price(body: &HashMap<String, HashMap<String, f64>>, id: &str) -> Option<f64> {
    body.get(id)?.get("usd").copied().filter(|p| p.is_finite() && *p > 0.0)
}
