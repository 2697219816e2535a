use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Chain;
use crate::error::{Result, WhaleError};

/// A known exchange hot/cold wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeTag {
    pub address: String,
    pub chain: Chain,
    pub entity: String,
}

const BUILTIN: &[(Chain, &str, &str)] = &[
    (Chain::Eth, "0x28c6c06298d514db089934071355e5743bf21d60", "Binance"),
    (Chain::Eth, "0x21a31ee1afc51d94c2efccaa2092ad1028285549", "Binance"),
    (Chain::Eth, "0xdfd5293d8e347dfe59e90efd55b2956a1343963d", "Binance"),
    (Chain::Eth, "0xdf21d1c36786e0e8e2ddc149f842953ee27fee37", "Binance"),
    (Chain::Eth, "0x71660c4005ba85c37ccec55d0c4493e66fe775d3", "Coinbase"),
    (Chain::Eth, "0x503828976d22510aad0201ac7ec88293211d23da", "Coinbase"),
    (Chain::Eth, "0x2910543af39aba0cd09dbb2d50200b3e800a63d2", "Kraken"),
    (Chain::Eth, "0xf89d7b9c864f589bbf53a82105107622b35eaa40", "Bybit"),
    (Chain::Btc, "34xp4vrocgjym3xr7ycvpfhocnxv4twseo", "Binance"),
    (Chain::Btc, "3m219kr5venenb47ewrpfwyb5jq2djxrp6", "Binance"),
    (Chain::Btc, "bc1qgdjqv0av3q56jvd82tkdjpy7gdp9ut7tlqhqpm5s", "Binance"),
];

/// In-memory lookup of exchange addresses per chain.
///
/// Keys are lowercased so they match the transaction cache. For base58
/// BTC addresses this trades exactness for a case-insensitive match.
pub struct ExchangeDirectory {
    by_chain: HashMap<Chain, HashMap<String, String>>,
    empty: HashSet<String>,
    sets: HashMap<Chain, HashSet<String>>,
}

impl ExchangeDirectory {
    pub fn empty() -> Self {
        Self {
            by_chain: HashMap::new(),
            empty: HashSet::new(),
            sets: HashMap::new(),
        }
    }

    /// Directory seeded with the built-in exchange list.
    pub fn builtin() -> Self {
        let mut dir = Self::empty();
        for (chain, address, entity) in BUILTIN {
            dir.insert(ExchangeTag {
                address: address.to_string(),
                chain: *chain,
                entity: entity.to_string(),
            });
        }
        dir
    }

    pub fn insert(&mut self, tag: ExchangeTag) {
        let key = tag.address.trim().to_lowercase();
        self.sets.entry(tag.chain).or_default().insert(key.clone());
        self.by_chain.entry(tag.chain).or_default().insert(key, tag.entity);
    }

    /// Merge a CSV of `chain,address,entity` rows (header skipped).
    /// Malformed rows are skipped. Returns the number of rows loaded.
    pub fn load_csv(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WhaleError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut count = 0;
        for line in content.lines().skip(1) {
            let parts: Vec<&str> = line.splitn(3, ',').collect();
            if parts.len() < 2 {
                continue;
            }
            let Ok(chain) = parts[0].parse::<Chain>() else {
                tracing::debug!("skipping exchange row with unknown chain: {line}");
                continue;
            };
            let address = parts[1].trim();
            if address.is_empty() {
                continue;
            }
            self.insert(ExchangeTag {
                address: address.to_string(),
                chain,
                entity: parts.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
            });
            count += 1;
        }
        tracing::info!("Loaded {count} exchange addresses from {}", path.display());
        Ok(count)
    }

    /// Lowercased exchange addresses for a chain.
    pub fn addresses(&self, chain: Chain) -> &HashSet<String> {
        self.sets.get(&chain).unwrap_or(&self.empty)
    }

    pub fn entity(&self, chain: Chain, address: &str) -> Option<&str> {
        self.by_chain
            .get(&chain)?
            .get(&address.trim().to_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sets.values().map(HashSet::len).sum()
    }
}
