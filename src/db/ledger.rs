use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::time::Duration;

use super::{Database, conversion_error, parse_chain, parse_ts, ts};
use crate::core::{
    AlertEvent, AlertRule, Chain, Direction, RuleType, RuleWindow, ScoreBreakdown, ScoreSnapshot,
};
use crate::error::Result;

fn parse_direction(idx: usize, raw: &str) -> rusqlite::Result<Direction> {
    Direction::parse(raw).ok_or_else(|| conversion_error(idx, format!("unknown direction {raw:?}")))
}

fn window_start(window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now() - window
}

impl Database {
    // --- Scores ---

    pub fn save_score(&self, s: &ScoreSnapshot) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scores
                (address, chain, computed_at, window_hours, total_score, net_flow, velocity,
                 correlation, exchange_flow, net_flow_usd, inflow_usd, outflow_usd, direction,
                 alert_triggered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                s.address,
                s.chain.as_str(),
                ts(&s.computed_at),
                s.window_hours,
                s.total,
                s.breakdown.net_flow,
                s.breakdown.velocity,
                s.breakdown.correlation,
                s.breakdown.exchange_flow,
                s.net_flow_usd,
                s.inflow_usd,
                s.outflow_usd,
                s.direction.as_str(),
                s.alert_triggered,
            ],
        )?;
        Ok(())
    }

    /// Snapshots for a wallet over the last `days`, oldest first.
    pub fn score_history(&self, address: &str, chain: Chain, days: u32) -> Result<Vec<ScoreSnapshot>> {
        let since = Utc::now() - chrono::Duration::days(days as i64);
        let mut stmt = self.conn.prepare_cached(
            "SELECT address, chain, computed_at, window_hours, total_score, net_flow, velocity,
                    correlation, exchange_flow, net_flow_usd, inflow_usd, outflow_usd, direction,
                    alert_triggered
             FROM scores
             WHERE address = ?1 AND chain = ?2 AND computed_at >= ?3
             ORDER BY computed_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chain.normalize_address(address), chain.as_str(), ts(&since)],
            |row| {
                Ok(ScoreSnapshot {
                    address: row.get(0)?,
                    chain: parse_chain(1, &row.get::<_, String>(1)?)?,
                    computed_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                    window_hours: row.get(3)?,
                    total: row.get(4)?,
                    breakdown: ScoreBreakdown {
                        net_flow: row.get(5)?,
                        velocity: row.get(6)?,
                        correlation: row.get(7)?,
                        exchange_flow: row.get(8)?,
                    },
                    net_flow_usd: row.get(9)?,
                    inflow_usd: row.get(10)?,
                    outflow_usd: row.get(11)?,
                    direction: parse_direction(12, &row.get::<_, String>(12)?)?,
                    alert_triggered: row.get(13)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- Alerts ---

    pub fn insert_alert(&self, a: &AlertEvent) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO alerts
                (address, chain, label, score, direction, net_flow_usd, triggered_at, rule_id,
                 webhook_sent, webhook_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                a.address,
                a.chain.as_str(),
                a.label,
                a.score,
                a.direction.as_str(),
                a.net_flow_usd,
                ts(&a.triggered_at),
                a.rule_id,
                a.webhook_sent,
                a.webhook_status,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_alert_webhook(&self, alert_id: i64, sent: bool, status: Option<u16>) -> Result<()> {
        self.conn.execute(
            "UPDATE alerts SET webhook_sent = ?1, webhook_status = ?2 WHERE id = ?3",
            rusqlite::params![sent, status, alert_id],
        )?;
        Ok(())
    }

    /// Most recent alerts first.
    pub fn list_alerts(&self, chain: Option<Chain>, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<AlertEvent>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, rule_id, address, chain, label, score, direction, net_flow_usd,
                    triggered_at, webhook_sent, webhook_status
             FROM alerts
             WHERE (?1 IS NULL OR chain = ?1) AND (?2 IS NULL OR triggered_at >= ?2)
             ORDER BY triggered_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                chain.map(|c| c.as_str()),
                since.as_ref().map(ts),
                limit as i64
            ],
            |row| {
                Ok(AlertEvent {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    address: row.get(2)?,
                    chain: parse_chain(3, &row.get::<_, String>(3)?)?,
                    label: row.get(4)?,
                    score: row.get(5)?,
                    direction: parse_direction(6, &row.get::<_, String>(6)?)?,
                    net_flow_usd: row.get(7)?,
                    triggered_at: parse_ts(8, &row.get::<_, String>(8)?)?,
                    score_breakdown: None,
                    webhook_sent: row.get(9)?,
                    webhook_status: row.get(10)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// True when the wallet already alerted within the trailing window.
    pub fn is_duplicate_alert(&self, address: &str, chain: Chain, window: Duration) -> Result<bool> {
        let now = Utc::now();
        let found = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM alerts
                WHERE address = ?1 AND chain = ?2 AND triggered_at >= ?3 AND triggered_at <= ?4
             )",
            rusqlite::params![address, chain.as_str(), ts(&window_start(window)), ts(&now)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    // --- Alert rules ---

    /// Rules are never hard-deleted, so the count only grows.
    pub fn next_rule_id(&self) -> Result<String> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alert_rules", [], |row| row.get(0))?;
        Ok(format!("rule_{:03}", count + 1))
    }

    pub fn create_alert_rule(
        &self,
        rule_type: RuleType,
        value: f64,
        window: RuleWindow,
        chain: Option<Chain>,
        webhook_url: Option<&str>,
    ) -> Result<AlertRule> {
        let rule = AlertRule {
            id: self.next_rule_id()?,
            rule_type,
            value,
            window,
            chain,
            webhook_url: webhook_url.map(str::to_string),
            created_at: Utc::now(),
            active: true,
        };
        self.conn.execute(
            "INSERT INTO alert_rules (id, type, value, window, chain, webhook_url, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            rusqlite::params![
                rule.id,
                rule.rule_type.as_str(),
                rule.value,
                rule.window.as_str(),
                rule.chain.map(|c| c.as_str()),
                rule.webhook_url,
                ts(&rule.created_at),
            ],
        )?;
        Ok(rule)
    }

    pub fn list_alert_rules(&self, active_only: bool) -> Result<Vec<AlertRule>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, type, value, window, chain, webhook_url, created_at, active
             FROM alert_rules
             WHERE (?1 = 0 OR active = 1)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![active_only as i32], |row| {
            let rule_type: String = row.get(1)?;
            let window: String = row.get(3)?;
            let chain: Option<String> = row.get(4)?;
            Ok(AlertRule {
                id: row.get(0)?,
                rule_type: match rule_type.as_str() {
                    "score" => RuleType::Score,
                    "flow" => RuleType::Flow,
                    other => return Err(conversion_error(1, format!("unknown rule type {other:?}"))),
                },
                value: row.get(2)?,
                window: window
                    .parse()
                    .map_err(|e: crate::error::WhaleError| conversion_error(3, e.to_string()))?,
                chain: chain.as_deref().map(|c| parse_chain(4, c)).transpose()?,
                webhook_url: row.get(5)?,
                created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
                active: row.get::<_, i64>(7)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns false when no active rule has this id.
    pub fn deactivate_alert_rule(&self, id: &str) -> Result<bool> {
        let active: Option<i64> = self
            .conn
            .query_row("SELECT active FROM alert_rules WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        if active != Some(1) {
            return Ok(false);
        }
        self.conn
            .execute("UPDATE alert_rules SET active = 0 WHERE id = ?1", [id])?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{AlertEvent, Chain, Direction, RuleType, RuleWindow, ScoreBreakdown, ScoreSnapshot};
    use crate::db::temp_db;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn snapshot(address: &str, total: u8, net: f64) -> ScoreSnapshot {
        ScoreSnapshot {
            address: address.into(),
            chain: Chain::Eth,
            computed_at: Utc::now(),
            window_hours: 24,
            total,
            breakdown: ScoreBreakdown {
                net_flow: 30,
                velocity: 20,
                correlation: 10,
                exchange_flow: 5,
            },
            direction: Direction::Accumulating,
            net_flow_usd: net,
            inflow_usd: net,
            outflow_usd: 0.0,
            alert_triggered: false,
        }
    }

    fn alert(address: &str, minutes_ago: i64) -> AlertEvent {
        AlertEvent {
            id: 0,
            rule_id: "auto".into(),
            address: address.into(),
            chain: Chain::Eth,
            label: "whale".into(),
            score: 82,
            direction: Direction::Distributing,
            net_flow_usd: -2_500_000.0,
            triggered_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            score_breakdown: None,
            webhook_sent: false,
            webhook_status: None,
        }
    }

    #[test]
    fn score_history_round_trips_breakdown() {
        let db = temp_db();
        db.save_score(&snapshot("0xa", 65, 1_000.0)).unwrap();
        db.save_score(&snapshot("0xa", 71, 2_000.0)).unwrap();
        db.save_score(&snapshot("0xb", 10, 5.0)).unwrap();

        let history = db.score_history("0xA", Chain::Eth, 30).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].total, 65);
        assert_eq!(history[1].net_flow_usd, 2_000.0);
        assert_eq!(history[1].breakdown.correlation, 10);
        assert_eq!(history[1].direction, Direction::Accumulating);
    }

    #[test]
    fn score_history_respects_days() {
        let db = temp_db();
        let mut old = snapshot("0xa", 50, 1.0);
        old.computed_at = Utc::now() - ChronoDuration::days(40);
        db.save_score(&old).unwrap();
        db.save_score(&snapshot("0xa", 60, 1.0)).unwrap();
        assert_eq!(db.score_history("0xa", Chain::Eth, 30).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_within_window() {
        let db = temp_db();
        db.insert_alert(&alert("0xa", 5)).unwrap();
        assert!(db.is_duplicate_alert("0xa", Chain::Eth, Duration::from_secs(3600)).unwrap());
        assert!(!db.is_duplicate_alert("0xa", Chain::Btc, Duration::from_secs(3600)).unwrap());
        assert!(!db.is_duplicate_alert("0xb", Chain::Eth, Duration::from_secs(3600)).unwrap());
    }

    #[test]
    fn not_duplicate_after_window() {
        let db = temp_db();
        db.insert_alert(&alert("0xa", 90)).unwrap();
        assert!(!db.is_duplicate_alert("0xa", Chain::Eth, Duration::from_secs(3600)).unwrap());
    }

    #[test]
    fn webhook_status_update_and_listing() {
        let db = temp_db();
        let first = db.insert_alert(&alert("0xa", 30)).unwrap();
        let second = db.insert_alert(&alert("0xb", 1)).unwrap();
        db.update_alert_webhook(second, true, Some(200)).unwrap();

        let all = db.list_alerts(None, None, 50).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second);
        assert!(all[0].webhook_sent);
        assert_eq!(all[0].webhook_status, Some(200));
        assert_eq!(all[1].id, first);
        assert_eq!(all[1].webhook_status, None);

        let recent = db.list_alerts(Some(Chain::Eth), Some(Utc::now() - ChronoDuration::minutes(10)), 50).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(db.list_alerts(Some(Chain::Hl), None, 50).unwrap().len(), 0);
        assert_eq!(db.list_alerts(None, None, 1).unwrap().len(), 1);
    }

    #[test]
    fn rule_ids_are_sequential_and_never_reused() {
        let db = temp_db();
        assert_eq!(db.next_rule_id().unwrap(), "rule_001");
        let r1 = db
            .create_alert_rule(RuleType::Score, 75.0, RuleWindow::Hour1, None, None)
            .unwrap();
        let r2 = db
            .create_alert_rule(RuleType::Flow, 1_000_000.0, RuleWindow::Hour4, Some(Chain::Eth), Some("https://x"))
            .unwrap();
        assert_eq!(r1.id, "rule_001");
        assert_eq!(r2.id, "rule_002");

        assert!(db.deactivate_alert_rule("rule_001").unwrap());
        assert!(!db.deactivate_alert_rule("rule_001").unwrap());
        assert!(!db.deactivate_alert_rule("rule_999").unwrap());

        let r3 = db
            .create_alert_rule(RuleType::Score, 90.0, RuleWindow::Min15, None, None)
            .unwrap();
        assert_eq!(r3.id, "rule_003");

        let active = db.list_alert_rules(true).unwrap();
        assert_eq!(active.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["rule_002", "rule_003"]);
        assert_eq!(active[0].chain, Some(Chain::Eth));
        assert_eq!(active[0].window, RuleWindow::Hour4);
        assert_eq!(db.list_alert_rules(false).unwrap().len(), 3);
    }
}
