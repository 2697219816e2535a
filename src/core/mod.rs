pub mod pipeline;
pub mod scan;
pub mod stream;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::WhaleError;

/// Supported chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Chain {
    #[serde(rename = "ETH")]
    Eth,
    #[serde(rename = "BTC")]
    Btc,
    #[serde(rename = "HL")]
    Hl,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Eth, Chain::Btc, Chain::Hl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Eth => "ETH",
            Chain::Btc => "BTC",
            Chain::Hl => "HL",
        }
    }

    /// Canonical registry form of an address. Hex chains are case-insensitive;
    /// base58 BTC addresses are kept as given.
    pub fn normalize_address(&self, address: &str) -> String {
        match self {
            Chain::Eth | Chain::Hl => address.trim().to_ascii_lowercase(),
            Chain::Btc => address.trim().to_string(),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = WhaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ETH" => Ok(Chain::Eth),
            "BTC" => Ok(Chain::Btc),
            "HL" => Ok(Chain::Hl),
            other => Err(WhaleError::InvalidInput(format!(
                "unsupported chain {other:?} (expected ETH, BTC or HL)"
            ))),
        }
    }
}

/// A tracked whale wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub chain: Chain,
    pub label: String,
    pub tags: BTreeSet<String>,
    pub added_at: DateTime<Utc>,
    pub first_seen: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Wallet {
    /// An untracked wallet scanned on demand.
    pub fn ad_hoc(address: &str, chain: Chain) -> Self {
        Self {
            address: address.to_string(),
            chain,
            label: String::new(),
            tags: BTreeSet::new(),
            added_at: Utc::now(),
            first_seen: None,
            active: true,
        }
    }
}

/// A transaction normalised across chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: String,
    pub chain: Chain,
    pub block_num: Option<u64>,
    pub from_addr: String,
    pub to_addr: String,
    pub timestamp: DateTime<Utc>,
    /// Amount in the chain's native unit (ETH, BTC, contracts).
    pub value_native: Decimal,
    /// `None` when no price was available.
    pub value_usd: Option<f64>,
    pub gas_usd: Option<f64>,
    /// `None` for native transfers.
    pub token_symbol: Option<String>,
    pub token_addr: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Accumulating,
    Distributing,
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Accumulating => "accumulating",
            Direction::Distributing => "distributing",
            Direction::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accumulating" => Some(Direction::Accumulating),
            "distributing" => Some(Direction::Distributing),
            "neutral" => Some(Direction::Neutral),
            _ => None,
        }
    }
}

/// Per-component whale score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub net_flow: u8,      // 0-40
    pub velocity: u8,      // 0-25
    pub correlation: u8,   // 0-20
    pub exchange_flow: u8, // 0-15
}

impl ScoreBreakdown {
    pub fn sum(&self) -> u32 {
        self.net_flow as u32 + self.velocity as u32 + self.correlation as u32 + self.exchange_flow as u32
    }
}

/// One row of the append-only score ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub address: String,
    pub chain: Chain,
    pub computed_at: DateTime<Utc>,
    pub window_hours: u32,
    #[serde(rename = "score")]
    pub total: u8,
    #[serde(rename = "score_breakdown")]
    pub breakdown: ScoreBreakdown,
    pub direction: Direction,
    pub net_flow_usd: f64,
    pub inflow_usd: f64,
    pub outflow_usd: f64,
    pub alert_triggered: bool,
}

/// A snapshot plus the scan context reported alongside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredWallet {
    #[serde(flatten)]
    pub snapshot: ScoreSnapshot,
    pub label: String,
    pub tx_count: usize,
    pub wallet_age_days: u32,
    pub exchange_flow_fraction: f64,
}

/// Alert severity derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical, // ≥90
    Warning,  // ≥80
    Info,     // ≥70
}

impl Severity {
    /// `None` below 70: no signal.
    pub fn from_score(score: u8) -> Option<Self> {
        if score >= 90 {
            Some(Severity::Critical)
        } else if score >= 80 {
            Some(Severity::Warning)
        } else if score >= 70 {
            Some(Severity::Info)
        } else {
            None
        }
    }
}

/// A triggered alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub rule_id: String,
    pub address: String,
    pub chain: Chain,
    pub label: String,
    pub score: u8,
    pub direction: Direction,
    pub net_flow_usd: f64,
    pub triggered_at: DateTime<Utc>,
    /// Not persisted; present on freshly created alerts.
    pub score_breakdown: Option<ScoreBreakdown>,
    pub webhook_sent: bool,
    pub webhook_status: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Score,
    Flow,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Score => "score",
            RuleType::Flow => "flow",
        }
    }
}

/// Evaluation window of a user-declared alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleWindow {
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "24h")]
    Hour24,
}

impl RuleWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleWindow::Min15 => "15m",
            RuleWindow::Min30 => "30m",
            RuleWindow::Hour1 => "1h",
            RuleWindow::Hour4 => "4h",
            RuleWindow::Hour24 => "24h",
        }
    }

    pub fn minutes(&self) -> u32 {
        match self {
            RuleWindow::Min15 => 15,
            RuleWindow::Min30 => 30,
            RuleWindow::Hour1 => 60,
            RuleWindow::Hour4 => 240,
            RuleWindow::Hour24 => 1440,
        }
    }
}

impl FromStr for RuleWindow {
    type Err = WhaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "15m" => Ok(RuleWindow::Min15),
            "30m" => Ok(RuleWindow::Min30),
            "1h" => Ok(RuleWindow::Hour1),
            "4h" => Ok(RuleWindow::Hour4),
            "24h" => Ok(RuleWindow::Hour24),
            other => Err(WhaleError::InvalidInput(format!(
                "invalid window {other:?} (expected 15m, 30m, 1h, 4h or 24h)"
            ))),
        }
    }
}

/// A user-declared alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: f64,
    pub window: RuleWindow,
    pub chain: Option<Chain>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}
