pub mod webhook;

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::AlertConfig;
use crate::core::{AlertEvent, Direction, ScoredWallet};
use crate::db::SharedDatabase;
use crate::error::Result;
use crate::signals::score::score_to_severity;
use webhook::{WebhookPayload, dispatch_webhook};

/// Rule id recorded on automatic threshold alerts.
pub const AUTO_RULE_ID: &str = "auto";

/// A threshold of zero disables that check.
pub fn score_passes_threshold(score: u8, cfg: &AlertConfig) -> bool {
    cfg.score_threshold > 0 && score >= cfg.score_threshold
}

pub fn flow_passes_threshold(net_flow_usd: f64, cfg: &AlertConfig) -> bool {
    cfg.flow_threshold_usd > 0.0 && net_flow_usd.abs() >= cfg.flow_threshold_usd
}

/// Turns scored wallets into deduplicated, persisted alerts and delivers
/// webhooks for them.
pub struct AlertEngine {
    db: SharedDatabase,
    config: AlertConfig,
    client: reqwest::Client,
}

impl AlertEngine {
    pub fn new(db: SharedDatabase, config: AlertConfig) -> Self {
        Self {
            db,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Override the score threshold (the stream runs with its own).
    pub fn with_score_threshold(mut self, threshold: u8) -> Self {
        self.config.score_threshold = threshold;
        self
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Alert on every wallet meeting the score or flow threshold that has
    /// not already alerted inside the dedup window. Marks alerted wallets
    /// and returns only the new alerts.
    pub async fn process_alerts(&self, wallets: &mut [ScoredWallet]) -> Result<Vec<AlertEvent>> {
        let window = self.config.dedup_window();
        let webhook_url = self.config.webhook_url();
        let timeout = Duration::from_secs(self.config.webhook_timeout_secs);
        let mut created = Vec::new();

        for wallet in wallets.iter_mut() {
            let snap = &wallet.snapshot;
            if !score_passes_threshold(snap.total, &self.config)
                && !flow_passes_threshold(snap.net_flow_usd, &self.config)
            {
                continue;
            }
            if self.db.is_duplicate_alert(&snap.address, snap.chain, window)? {
                tracing::debug!(address = %snap.address, chain = %snap.chain, "alert suppressed inside dedup window");
                continue;
            }

            let mut alert = AlertEvent {
                id: 0,
                rule_id: AUTO_RULE_ID.to_string(),
                address: snap.address.clone(),
                chain: snap.chain,
                label: wallet.label.clone(),
                score: snap.total,
                direction: snap.direction,
                net_flow_usd: snap.net_flow_usd,
                triggered_at: Utc::now(),
                score_breakdown: Some(snap.breakdown),
                webhook_sent: false,
                webhook_status: None,
            };
            alert.id = self.db.insert_alert(&alert)?;
            wallet.snapshot.alert_triggered = true;
            tracing::info!(
                alert_id = alert.id,
                address = %alert.address,
                chain = %alert.chain,
                score = alert.score,
                severity = ?score_to_severity(alert.score),
                "whale alert triggered"
            );

            if let Some(url) = webhook_url {
                let payload = WebhookPayload::from_alert(&alert, self.config.score_threshold);
                let status =
                    dispatch_webhook(&self.client, url, self.config.webhook_secret(), &payload, timeout).await;
                alert.webhook_sent = status.is_some_and(|s| (200..300).contains(&s));
                alert.webhook_status = status;
                self.db.update_alert_webhook(alert.id, alert.webhook_sent, status)?;
            }

            created.push(alert);
        }
        Ok(created)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DominantSignal {
    Accumulating,
    Distributing,
    Mixed,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub accumulating: usize,
    pub distributing: usize,
    pub neutral: usize,
    pub alerts_triggered: usize,
    pub dominant_signal: DominantSignal,
}

pub fn compute_scan_summary(wallets: &[ScoredWallet], alerts: &[AlertEvent]) -> ScanSummary {
    let count = |d: Direction| wallets.iter().filter(|w| w.snapshot.direction == d).count();
    let accumulating = count(Direction::Accumulating);
    let distributing = count(Direction::Distributing);
    let dominant_signal = if wallets.is_empty() {
        DominantSignal::Neutral
    } else if accumulating > distributing {
        DominantSignal::Accumulating
    } else if distributing > accumulating {
        DominantSignal::Distributing
    } else {
        DominantSignal::Mixed
    };
    ScanSummary {
        accumulating,
        distributing,
        neutral: count(Direction::Neutral),
        alerts_triggered: alerts.len(),
        dominant_signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Chain, ScoreBreakdown, ScoreSnapshot};
    use crate::db::temp_db;
    use chrono::Duration as ChronoDuration;

    fn scored(address: &str, total: u8, net: f64, direction: Direction) -> ScoredWallet {
        ScoredWallet {
            snapshot: ScoreSnapshot {
                address: address.into(),
                chain: Chain::Eth,
                computed_at: Utc::now(),
                window_hours: 24,
                total,
                breakdown: ScoreBreakdown {
                    net_flow: total.min(40),
                    velocity: total.saturating_sub(40).min(25),
                    correlation: 0,
                    exchange_flow: total.saturating_sub(65).min(15),
                },
                direction,
                net_flow_usd: net,
                inflow_usd: net.max(0.0),
                outflow_usd: (-net).max(0.0),
                alert_triggered: false,
            },
            label: "whale".into(),
            tx_count: 4,
            wallet_age_days: 400,
            exchange_flow_fraction: 0.0,
        }
    }

    fn config() -> AlertConfig {
        AlertConfig {
            score_threshold: 70,
            flow_threshold_usd: 1_000_000.0,
            window_minutes: 60,
            ..AlertConfig::default()
        }
    }

    #[test]
    fn threshold_comparisons_are_inclusive() {
        let cfg = config();
        assert!(score_passes_threshold(70, &cfg));
        assert!(!score_passes_threshold(69, &cfg));
        assert!(flow_passes_threshold(-1_000_000.0, &cfg));
        assert!(!flow_passes_threshold(999_999.0, &cfg));
    }

    #[test]
    fn zero_thresholds_disable_checks() {
        let cfg = AlertConfig {
            score_threshold: 0,
            flow_threshold_usd: 0.0,
            ..AlertConfig::default()
        };
        assert!(!score_passes_threshold(0, &cfg));
        assert!(!flow_passes_threshold(0.0, &cfg));
    }

    #[tokio::test]
    async fn alerts_on_score_or_flow() {
        let engine = AlertEngine::new(temp_db(), config());
        let mut wallets = vec![
            scored("0xscore", 85, 10.0, Direction::Accumulating),
            scored("0xflow", 20, -2_000_000.0, Direction::Distributing),
            scored("0xquiet", 30, 500.0, Direction::Accumulating),
        ];
        let alerts = engine.process_alerts(&mut wallets).await.unwrap();
        let ids: Vec<_> = alerts.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(ids, ["0xscore", "0xflow"]);
        assert!(alerts.iter().all(|a| a.rule_id == AUTO_RULE_ID && a.id > 0));
        assert!(wallets[0].snapshot.alert_triggered);
        assert!(wallets[1].snapshot.alert_triggered);
        assert!(!wallets[2].snapshot.alert_triggered);
        assert_eq!(alerts[0].score_breakdown, Some(wallets[0].snapshot.breakdown));
        assert!(!alerts[0].webhook_sent);
    }

    #[tokio::test]
    async fn duplicate_inside_window_is_suppressed() {
        let db = temp_db();
        let engine = AlertEngine::new(db.clone(), config());
        let mut first = vec![scored("0xw", 90, 0.0, Direction::Neutral)];
        assert_eq!(engine.process_alerts(&mut first).await.unwrap().len(), 1);

        let mut second = vec![scored("0xw", 95, 0.0, Direction::Neutral)];
        assert!(engine.process_alerts(&mut second).await.unwrap().is_empty());
        assert!(!second[0].snapshot.alert_triggered);
        assert_eq!(db.list_alerts(None, None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alert_after_window_fires_again() {
        let db = temp_db();
        let mut old = webhook::tests::sample_alert();
        old.address = "0xw".into();
        old.triggered_at = Utc::now() - ChronoDuration::minutes(61);
        db.insert_alert(&old).unwrap();

        let engine = AlertEngine::new(db.clone(), config());
        let mut wallets = vec![scored("0xw", 90, 0.0, Direction::Neutral)];
        assert_eq!(engine.process_alerts(&mut wallets).await.unwrap().len(), 1);
        assert_eq!(db.list_alerts(None, None, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stream_threshold_override() {
        let engine = AlertEngine::new(temp_db(), config()).with_score_threshold(90);
        let mut wallets = vec![scored("0xa", 85, 0.0, Direction::Neutral)];
        assert!(engine.process_alerts(&mut wallets).await.unwrap().is_empty());
        assert_eq!(engine.config().score_threshold, 90);
    }

    #[tokio::test]
    async fn webhook_status_is_persisted() {
        let (url, server) = webhook::tests::http_stub(202).await;
        let db = temp_db();
        let cfg = AlertConfig {
            webhook_url: url,
            webhook_secret: "k".into(),
            ..config()
        };
        let engine = AlertEngine::new(db.clone(), cfg);
        let mut wallets = vec![scored("0xa", 88, 0.0, Direction::Accumulating)];
        let alerts = engine.process_alerts(&mut wallets).await.unwrap();
        assert_eq!(alerts[0].webhook_status, Some(202));
        assert!(alerts[0].webhook_sent);

        let raw = server.await.unwrap();
        assert!(raw.contains("x-whalecli-signature: sha256="));
        let stored = db.list_alerts(None, None, 1).unwrap();
        assert_eq!(stored[0].webhook_status, Some(202));
        assert!(stored[0].webhook_sent);
    }

    #[tokio::test]
    async fn failed_webhook_is_recorded_not_raised() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let db = temp_db();
        let cfg = AlertConfig {
            webhook_url: format!("http://{addr}/hook"),
            webhook_timeout_secs: 2,
            ..config()
        };
        let engine = AlertEngine::new(db.clone(), cfg);
        let mut wallets = vec![scored("0xa", 88, 0.0, Direction::Accumulating)];
        let alerts = engine.process_alerts(&mut wallets).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].webhook_sent);
        assert_eq!(alerts[0].webhook_status, None);
        assert!(wallets[0].snapshot.alert_triggered);
    }

    #[test]
    fn summary_dominant_signal() {
        use Direction::*;
        assert_eq!(compute_scan_summary(&[], &[]).dominant_signal, DominantSignal::Neutral);

        let wallets = vec![
            scored("a", 0, 0.0, Accumulating),
            scored("b", 0, 0.0, Accumulating),
            scored("c", 0, 0.0, Distributing),
            scored("d", 0, 0.0, Neutral),
        ];
        let summary = compute_scan_summary(&wallets, &[]);
        assert_eq!(summary.accumulating, 2);
        assert_eq!(summary.distributing, 1);
        assert_eq!(summary.neutral, 1);
        assert_eq!(summary.dominant_signal, DominantSignal::Accumulating);

        let tie = vec![scored("a", 0, 0.0, Accumulating), scored("b", 0, 0.0, Distributing)];
        assert_eq!(compute_scan_summary(&tie, &[]).dominant_signal, DominantSignal::Mixed);
        let all_neutral = vec![scored("a", 0, 0.0, Neutral)];
        assert_eq!(compute_scan_summary(&all_neutral, &[]).dominant_signal, DominantSignal::Mixed);

        let alerts = vec![webhook::tests::sample_alert()];
        assert_eq!(compute_scan_summary(&wallets, &alerts).alerts_triggered, 1);
        let json = serde_json::to_value(compute_scan_summary(&wallets, &alerts)).unwrap();
        assert_eq!(json["dominant_signal"], "accumulating");
    }
}
