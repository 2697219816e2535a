use std::collections::{HashMap, HashSet};

use crate::core::{Direction, Transaction};

pub const NET_FLOW_MAX: u8 = 40;
pub const VELOCITY_MAX: u8 = 25;
pub const CORRELATION_MAX: u8 = 20;
pub const EXCHANGE_FLOW_MAX: u8 = 15;

/// Net flow within ±this many USD is neutral.
pub const DIRECTION_DEAD_ZONE_USD: f64 = 100.0;
/// Velocity baseline when the wallet has no history.
pub const DEFAULT_BASELINE_USD: f64 = 50_000.0;
/// Fewer active peers than this yields no correlation signal.
pub const MIN_ACTIVE_PEERS: usize = 2;

const NET_FLOW_FACTOR: f64 = 3.5;
const VELOCITY_FACTOR: f64 = 8.3;
const EXCHANGE_BASE_CAP: f64 = 12.0;
const EXCHANGE_BASE_FACTOR: f64 = 5.0;
const EXCHANGE_DIRECTION_BONUS: f64 = 3.0;

fn clamp_round(value: f64, max: u8) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, max as f64) as u8
}

fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// USD aggregates over the transactions touching a wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Flows {
    pub inflow_usd: f64,
    pub outflow_usd: f64,
    /// Σ|value_usd| of counted legs.
    pub volume_usd: f64,
}

impl Flows {
    /// Transactions without a USD value and self-transfers are skipped.
    pub fn collect(txs: &[Transaction], address: &str) -> Self {
        let mut flows = Flows::default();
        for tx in txs {
            let Some(usd) = tx.value_usd else { continue };
            let incoming = same_address(&tx.to_addr, address);
            let outgoing = same_address(&tx.from_addr, address);
            match (incoming, outgoing) {
                (true, false) => flows.inflow_usd += usd,
                (false, true) => flows.outflow_usd += usd,
                _ => continue,
            }
            flows.volume_usd += usd.abs();
        }
        flows
    }

    pub fn net_usd(&self) -> f64 {
        self.inflow_usd - self.outflow_usd
    }

    pub fn direction(&self) -> Direction {
        let net = self.net_usd();
        if net > DIRECTION_DEAD_ZONE_USD {
            Direction::Accumulating
        } else if net < -DIRECTION_DEAD_ZONE_USD {
            Direction::Distributing
        } else {
            Direction::Neutral
        }
    }
}

/// Young wallets moving size are a stronger signal.
pub fn age_weight(wallet_age_days: u32) -> f64 {
    match wallet_age_days {
        0..30 => 1.3,
        30..180 => 1.1,
        180..730 => 1.0,
        _ => 0.9,
    }
}

pub fn net_flow_score(net_usd: f64, wallet_age_days: u32) -> u8 {
    let magnitude = net_usd.abs();
    if magnitude < 1.0 {
        return 0;
    }
    clamp_round(magnitude.log10() * age_weight(wallet_age_days) * NET_FLOW_FACTOR, NET_FLOW_MAX)
}

/// Window activity, scaled to a daily rate, against the 30-day baseline.
pub fn velocity_score(volume_usd: f64, avg30d_daily_flow_usd: f64, window_hours: u32) -> u8 {
    let days = window_hours.max(1) as f64 / 24.0;
    let recent = volume_usd / days;
    let baseline = if avg30d_daily_flow_usd > 0.0 {
        avg30d_daily_flow_usd
    } else {
        DEFAULT_BASELINE_USD
    };
    let ratio = recent / baseline;
    if ratio < 1.0 {
        return 0;
    }
    clamp_round(ratio.log2() * VELOCITY_FACTOR, VELOCITY_MAX)
}

/// Share of active peers moving the same way as this wallet.
pub fn correlation_score(direction: Direction, peers: &HashMap<String, Direction>) -> u8 {
    if direction == Direction::Neutral {
        return 0;
    }
    let active: Vec<Direction> = peers
        .values()
        .copied()
        .filter(|d| *d != Direction::Neutral)
        .collect();
    if active.len() < MIN_ACTIVE_PEERS {
        return 0;
    }
    let sharing = active.iter().filter(|d| **d == direction).count();
    clamp_round(sharing as f64 / active.len() as f64 * CORRELATION_MAX as f64, CORRELATION_MAX)
}

/// Exchange-flow sub-score and the fraction of volume crossing an exchange.
///
/// A leg from an exchange is an exchange inflow to the wallet, a leg to
/// an exchange an exchange outflow. One transaction can count on both
/// legs, so the fraction is clamped.
pub fn exchange_flow_score(
    txs: &[Transaction],
    address: &str,
    exchanges: &HashSet<String>,
    net_usd: f64,
    total_volume_usd: f64,
) -> (u8, f64) {
    if exchanges.is_empty() {
        return (0, 0.0);
    }
    let mut ex_in = 0.0;
    let mut ex_out = 0.0;
    for tx in txs {
        let Some(usd) = tx.value_usd else { continue };
        if !same_address(&tx.to_addr, address) && !same_address(&tx.from_addr, address) {
            continue;
        }
        if exchanges.contains(&tx.from_addr.to_lowercase()) {
            ex_in += usd.abs();
        }
        if exchanges.contains(&tx.to_addr.to_lowercase()) {
            ex_out += usd.abs();
        }
    }

    let signal = ex_in + ex_out;
    if signal < 1.0 {
        return (0, 0.0);
    }
    let fraction = (signal / total_volume_usd.max(1.0)).clamp(0.0, 1.0);

    let mut score = (signal.log10() * EXCHANGE_BASE_FACTOR).min(EXCHANGE_BASE_CAP);
    let ex_net = ex_in - ex_out;
    if ex_net != 0.0 && net_usd != 0.0 && ex_net.signum() == net_usd.signum() {
        score += EXCHANGE_DIRECTION_BONUS;
    }
    (clamp_round(score, EXCHANGE_FLOW_MAX), fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Chain;
    use chrono::Utc;
    use rust_decimal::Decimal;

    const WALLET: &str = "0xabcdef1234567890abcdef1234567890abcdef12";
    const EXCHANGE: &str = "0xexchange";

    fn tx(from: &str, to: &str, usd: Option<f64>) -> Transaction {
        let now = Utc::now();
        Transaction {
            tx_hash: format!("0x{from}{to}"),
            chain: Chain::Eth,
            block_num: Some(100),
            from_addr: from.into(),
            to_addr: to.into(),
            timestamp: now,
            value_native: Decimal::ONE,
            value_usd: usd,
            gas_usd: Some(5.0),
            token_symbol: None,
            token_addr: None,
            fetched_at: now,
        }
    }

    fn exchanges() -> HashSet<String> {
        [EXCHANGE.to_string()].into_iter().collect()
    }

    fn peers(dirs: &[Direction]) -> HashMap<String, Direction> {
        dirs.iter().enumerate().map(|(i, d)| (format!("0x{i:040x}"), *d)).collect()
    }

    #[test]
    fn flows_empty() {
        let flows = Flows::collect(&[], WALLET);
        assert_eq!(flows, Flows::default());
        assert_eq!(flows.direction(), Direction::Neutral);
        assert_eq!(net_flow_score(flows.net_usd(), 365), 0);
    }

    #[test]
    fn flows_match_case_insensitively() {
        let flows = Flows::collect(&[tx("0xsender", &WALLET.to_uppercase(), Some(10.0))], WALLET);
        assert_eq!(flows.inflow_usd, 10.0);
    }

    #[test]
    fn flows_skip_unpriced_and_self_transfers() {
        let txs = vec![
            tx("0xsender", WALLET, None),
            tx(WALLET, WALLET, Some(1_000_000.0)),
            tx(WALLET, "0xrecip", Some(250.0)),
        ];
        let flows = Flows::collect(&txs, WALLET);
        assert_eq!(flows.inflow_usd, 0.0);
        assert_eq!(flows.outflow_usd, 250.0);
        assert_eq!(flows.volume_usd, 250.0);
    }

    #[test]
    fn dead_zone_keeps_dust_neutral() {
        let flows = Flows::collect(&[tx("0xsender", WALLET, Some(100.0))], WALLET);
        assert_eq!(flows.direction(), Direction::Neutral);
        let flows = Flows::collect(&[tx("0xsender", WALLET, Some(100.01))], WALLET);
        assert_eq!(flows.direction(), Direction::Accumulating);
    }

    #[test]
    fn ten_million_inflow_accumulates() {
        let txs: Vec<_> = (0..5).map(|_| tx("0xsender", WALLET, Some(2_000_000.0))).collect();
        let flows = Flows::collect(&txs, WALLET);
        assert_eq!(flows.inflow_usd, 10_000_000.0);
        assert_eq!(flows.direction(), Direction::Accumulating);
        assert!(net_flow_score(flows.net_usd(), 365) > 0);
    }

    #[test]
    fn outflow_distributes() {
        let txs: Vec<_> = (0..3).map(|_| tx(WALLET, "0xrecip", Some(1_500_000.0))).collect();
        let flows = Flows::collect(&txs, WALLET);
        assert_eq!(flows.outflow_usd, 4_500_000.0);
        assert_eq!(flows.direction(), Direction::Distributing);
        assert!(net_flow_score(flows.net_usd(), 365) > 0);
    }

    #[test]
    fn age_weight_table() {
        assert_eq!(age_weight(0), 1.3);
        assert_eq!(age_weight(29), 1.3);
        assert_eq!(age_weight(30), 1.1);
        assert_eq!(age_weight(179), 1.1);
        assert_eq!(age_weight(180), 1.0);
        assert_eq!(age_weight(729), 1.0);
        assert_eq!(age_weight(730), 0.9);
    }

    #[test]
    fn new_wallet_outscores_old_wallet() {
        assert!(net_flow_score(500_000.0, 15) >= net_flow_score(500_000.0, 1000));
        assert!(net_flow_score(-500_000.0, 15) > net_flow_score(-500_000.0, 1000));
    }

    #[test]
    fn net_flow_bounded() {
        assert!(net_flow_score(12_000_000.0, 180) >= 25);
        assert_eq!(net_flow_score(1e12, 0), NET_FLOW_MAX);
        assert_eq!(net_flow_score(0.5, 0), 0);
        assert_eq!(net_flow_score(f64::NAN, 0), 0);
    }

    #[test]
    fn velocity_below_baseline_is_zero() {
        assert_eq!(velocity_score(0.0, 50_000.0, 24), 0);
        assert_eq!(velocity_score(100.0, 500_000.0, 24), 0);
    }

    #[test]
    fn velocity_ten_x_and_dormant() {
        assert!(velocity_score(10_000_000.0, 100_000.0, 24) > 20);
        assert_eq!(velocity_score(1_000_000.0, 1.0, 24), VELOCITY_MAX);
        // One hour of activity extrapolates to a day
        assert_eq!(velocity_score(50_000.0, 50_000.0, 1), 25);
    }

    #[test]
    fn velocity_defaults_baseline_without_history() {
        // 100k/day against the 50k default: log2(2) * 8.3 = 8.3
        assert_eq!(velocity_score(100_000.0, 0.0, 24), 8);
        assert_eq!(velocity_score(100_000.0, -3.0, 24), 8);
        // Zero-hour windows count as one hour
        assert_eq!(velocity_score(100_000.0, 0.0, 0), velocity_score(100_000.0, 0.0, 1));
    }

    #[test]
    fn correlation_needs_two_active_peers() {
        use Direction::*;
        assert_eq!(correlation_score(Accumulating, &peers(&[Accumulating])), 0);
        assert_eq!(correlation_score(Accumulating, &peers(&[Accumulating, Neutral, Neutral])), 0);
        assert_eq!(correlation_score(Accumulating, &peers(&[Accumulating, Accumulating])), 20);
    }

    #[test]
    fn correlation_ratio() {
        use Direction::*;
        assert_eq!(correlation_score(Neutral, &peers(&[Accumulating, Accumulating])), 0);
        assert_eq!(correlation_score(Accumulating, &peers(&[Distributing, Distributing])), 0);
        assert_eq!(
            correlation_score(Accumulating, &peers(&[Accumulating, Distributing, Accumulating, Distributing])),
            10
        );
        assert_eq!(correlation_score(Accumulating, &peers(&[Accumulating; 100])), CORRELATION_MAX);
    }

    #[test]
    fn exchange_flow_without_exchange_legs() {
        let txs = vec![tx("0xrandom", WALLET, Some(1_000.0))];
        assert_eq!(exchange_flow_score(&txs, WALLET, &exchanges(), 1_000.0, 1_000.0), (0, 0.0));
        assert_eq!(exchange_flow_score(&txs, WALLET, &HashSet::new(), 1_000.0, 1_000.0), (0, 0.0));
    }

    #[test]
    fn exchange_withdrawals_confirm_accumulation() {
        let txs: Vec<_> = (0..5).map(|_| tx(EXCHANGE, WALLET, Some(300_000.0))).collect();
        let flows = Flows::collect(&txs, WALLET);
        let (score, fraction) = exchange_flow_score(&txs, WALLET, &exchanges(), flows.net_usd(), flows.volume_usd);
        assert_eq!(score, EXCHANGE_FLOW_MAX);
        assert_eq!(fraction, 1.0);
    }

    #[test]
    fn exchange_deposit_against_accumulation_gets_no_bonus() {
        // Wallet deposits 10k to an exchange while netting +1M elsewhere
        let txs = vec![tx(WALLET, EXCHANGE, Some(10_000.0)), tx("0xotc", WALLET, Some(1_010_000.0))];
        let flows = Flows::collect(&txs, WALLET);
        let (score, fraction) = exchange_flow_score(&txs, WALLET, &exchanges(), flows.net_usd(), flows.volume_usd);
        // min(12, log10(10k) * 5) = 12, no bonus
        assert_eq!(score, 12);
        assert!(fraction > 0.0 && fraction < 0.01);
    }

    #[test]
    fn exchange_fraction_clamped_with_overlapping_legs() {
        // An exchange wallet shuffling between its own addresses counts on both legs
        let mut set = exchanges();
        set.insert(WALLET.to_string());
        let txs = vec![tx(EXCHANGE, WALLET, Some(1_000_000.0))];
        let (score, fraction) = exchange_flow_score(&txs, WALLET, &set, 1_000_000.0, 1_000_000.0);
        assert!(score <= EXCHANGE_FLOW_MAX);
        assert!((0.0..=1.0).contains(&fraction));
        assert_eq!(fraction, 1.0);
    }

    #[test]
    fn exchange_flow_bounded_for_huge_flows() {
        let txs: Vec<_> = (0..10).map(|_| tx(EXCHANGE, WALLET, Some(1e9))).collect();
        let (score, _) = exchange_flow_score(&txs, WALLET, &exchanges(), 1e10, 1e10);
        assert!(score <= EXCHANGE_FLOW_MAX);
    }
}
