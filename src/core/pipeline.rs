use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::core::{Chain, ScoreSnapshot, Transaction, Wallet};
use crate::db::SharedDatabase;
use crate::error::Result;
use crate::fetchers::{Fetcher, Fetchers};
use crate::signals::WalletActivity;

/// Days of score history behind the velocity baseline.
pub const BASELINE_DAYS: u32 = 30;

/// Where transactions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Serve from the transaction cache while fresh, fetch and upsert otherwise.
    CacheAside { ttl: Duration },
    /// Always fetch; the cache is still refreshed.
    Fresh,
}

/// Mean |net_flow_usd| over the history, 0 when there is none.
pub fn baseline_from_history(history: &[ScoreSnapshot]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    history.iter().map(|s| s.net_flow_usd.abs()).sum::<f64>() / history.len() as f64
}

fn days_since_added(wallet: &Wallet) -> u32 {
    (Utc::now() - wallet.added_at).num_days().max(0) as u32
}

/// Fetch stage shared by batch scans and the stream: wallets in, scoring
/// inputs out.
pub struct Pipeline {
    db: SharedDatabase,
    fetchers: Fetchers,
}

impl Pipeline {
    pub fn new(db: SharedDatabase, fetchers: Fetchers) -> Self {
        Self { db, fetchers }
    }

    pub fn fetchers(&self) -> &Fetchers {
        &self.fetchers
    }

    /// Build activity for every wallet, grouped by chain. Wallets of one
    /// chain are fetched concurrently; a failed fetch yields no transactions
    /// for that wallet only. Storage errors propagate.
    pub async fn collect(&self, wallets: &[Wallet], hours: u32, mode: FetchMode) -> Result<BTreeMap<Chain, Vec<WalletActivity>>> {
        let mut by_chain: BTreeMap<Chain, Vec<&Wallet>> = BTreeMap::new();
        for wallet in wallets {
            by_chain.entry(wallet.chain).or_default().push(wallet);
        }

        let mut out = BTreeMap::new();
        for (chain, group) in by_chain {
            let fetcher: Option<&dyn Fetcher> = self.fetchers.get(chain).map(|f| f.as_ref());
            if fetcher.is_none() {
                warn!("No fetcher registered for {chain}; scoring {} wallet(s) without data", group.len());
            }
            let fetched = join_all(group.iter().map(|w| self.fetch_wallet(fetcher, w, hours, mode))).await;

            let mut activities = Vec::with_capacity(group.len());
            for (wallet, fetched) in group.into_iter().zip(fetched) {
                let (transactions, wallet_age_days) = fetched?;
                let history = self.db.score_history(&wallet.address, wallet.chain, BASELINE_DAYS)?;
                activities.push(WalletActivity {
                    address: wallet.address.clone(),
                    chain: wallet.chain,
                    label: wallet.label.clone(),
                    transactions,
                    wallet_age_days,
                    avg30d_daily_flow_usd: baseline_from_history(&history),
                });
            }
            out.insert(chain, activities);
        }
        Ok(out)
    }

    async fn fetch_wallet(
        &self,
        fetcher: Option<&dyn Fetcher>,
        wallet: &Wallet,
        hours: u32,
        mode: FetchMode,
    ) -> Result<(Vec<Transaction>, u32)> {
        let Some(fetcher) = fetcher else {
            return Ok((Vec::new(), days_since_added(wallet)));
        };
        let now = Utc::now();
        let from = now - chrono::Duration::hours(i64::from(hours));

        let cached = match mode {
            FetchMode::CacheAside { ttl } => self.db.cached_transactions(&wallet.address, wallet.chain, from, now, ttl)?,
            FetchMode::Fresh => None,
        };

        let transactions = match cached {
            Some(txs) => {
                debug!(address = %wallet.address, chain = %wallet.chain, count = txs.len(), "transaction cache hit");
                txs
            }
            None => match fetcher.get_transactions(&wallet.address, hours).await {
                Ok(txs) => {
                    if !txs.is_empty() {
                        let written = self.db.upsert_transactions(&txs)?;
                        debug!(address = %wallet.address, chain = %wallet.chain, written, "transactions cached");
                    }
                    txs
                }
                Err(e) => {
                    warn!(
                        address = %wallet.address,
                        chain = %wallet.chain,
                        error_code = e.error_code(),
                        "fetch failed, scoring with no transactions: {e}"
                    );
                    Vec::new()
                }
            },
        };

        if wallet.first_seen.is_none() {
            if let Some(earliest) = transactions.iter().map(|t| t.timestamp).min() {
                self.db.update_first_seen(&wallet.address, wallet.chain, earliest)?;
                info!(address = %wallet.address, chain = %wallet.chain, "first activity recorded at {earliest}");
            }
        }

        // Age only weighs net flow, which is zero without transactions
        let wallet_age_days = if transactions.is_empty() {
            days_since_added(wallet)
        } else {
            match fetcher.get_wallet_age(&wallet.address).await {
                Ok(days) if days > 0 => days,
                Ok(_) => days_since_added(wallet),
                Err(e) => {
                    debug!(address = %wallet.address, "wallet age lookup failed: {e}");
                    days_since_added(wallet)
                }
            }
        };

        Ok((transactions, wallet_age_days))
    }
}
