pub mod rules;
pub mod score;

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::core::{Chain, Direction, ScoreBreakdown, ScoreSnapshot, ScoredWallet, Transaction};
use crate::tags::ExchangeDirectory;
use rules::Flows;

/// Everything the scorer needs to know about one wallet in a window.
#[derive(Debug, Clone)]
pub struct WalletActivity {
    pub address: String,
    pub chain: Chain,
    pub label: String,
    pub transactions: Vec<Transaction>,
    pub wallet_age_days: u32,
    pub avg30d_daily_flow_usd: f64,
}

/// How peer directions feed the correlation sub-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Two passes over the cohort; each wallet sees every other wallet.
    Cohort,
    /// Empty peer map; correlation is always 0.
    Disabled,
}

/// Score one wallet. Pure apart from stamping `computed_at`.
pub fn score_wallet(
    activity: &WalletActivity,
    exchange_addresses: &HashSet<String>,
    peer_directions: &HashMap<String, Direction>,
    scan_hours: u32,
) -> ScoredWallet {
    let address = activity.address.as_str();
    let txs = &activity.transactions;

    let flows = Flows::collect(txs, address);
    let net = flows.net_usd();
    let direction = flows.direction();
    let (exchange_flow, exchange_flow_fraction) =
        rules::exchange_flow_score(txs, address, exchange_addresses, net, flows.volume_usd);

    let breakdown = ScoreBreakdown {
        net_flow: rules::net_flow_score(net, activity.wallet_age_days),
        velocity: rules::velocity_score(flows.volume_usd, activity.avg30d_daily_flow_usd, scan_hours),
        correlation: rules::correlation_score(direction, peer_directions),
        exchange_flow,
    };

    ScoredWallet {
        snapshot: ScoreSnapshot {
            address: activity.address.clone(),
            chain: activity.chain,
            computed_at: Utc::now(),
            window_hours: scan_hours,
            total: score::compute_total(&breakdown),
            breakdown,
            direction,
            net_flow_usd: net,
            inflow_usd: flows.inflow_usd,
            outflow_usd: flows.outflow_usd,
            alert_triggered: false,
        },
        label: activity.label.clone(),
        tx_count: txs.len(),
        wallet_age_days: activity.wallet_age_days,
        exchange_flow_fraction,
    }
}

fn peer_key(chain: Chain, address: &str) -> String {
    format!("{chain}:{address}")
}

/// The scoring engine holds the exchange directory and scores cohorts.
pub struct ScoringEngine {
    exchanges: ExchangeDirectory,
}

impl ScoringEngine {
    pub fn new(exchanges: ExchangeDirectory) -> Self {
        Self { exchanges }
    }

    pub fn score(&self, activity: &WalletActivity, peers: &HashMap<String, Direction>, scan_hours: u32) -> ScoredWallet {
        score_wallet(activity, self.exchanges.addresses(activity.chain), peers, scan_hours)
    }

    /// Score a cohort. In `Cohort` mode the first pass yields each wallet's
    /// direction and the second rescores against all *other* wallets, so
    /// the result does not depend on input order.
    pub fn score_cohort(&self, cohort: &[WalletActivity], scan_hours: u32, mode: Correlation) -> Vec<ScoredWallet> {
        let no_peers = HashMap::new();
        let first: Vec<ScoredWallet> = cohort
            .iter()
            .map(|activity| self.score(activity, &no_peers, scan_hours))
            .collect();

        if mode == Correlation::Disabled || cohort.len() < 2 {
            return first;
        }

        let directions: HashMap<String, Direction> = first
            .iter()
            .map(|s| (peer_key(s.snapshot.chain, &s.snapshot.address), s.snapshot.direction))
            .collect();

        cohort
            .iter()
            .map(|activity| {
                let mut peers = directions.clone();
                peers.remove(&peer_key(activity.chain, &activity.address));
                self.score(activity, &peers, scan_hours)
            })
            .collect()
    }
}
