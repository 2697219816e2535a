pub mod cache;
pub mod ledger;
pub mod schema;
pub mod transactions;
pub mod wallets;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{AlertEvent, AlertRule, Chain, RuleType, RuleWindow, ScoreSnapshot, Transaction, Wallet};
use crate::error::Result;

pub use wallets::RemovedWallet;

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// A poisoned lock still guards a valid connection.
    fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Wallet registry ---

    pub fn add_wallet(&self, address: &str, chain: Chain, label: &str, tags: &BTreeSet<String>) -> Result<Wallet> {
        self.lock().add_wallet(address, chain, label, tags)
    }

    pub fn get_wallet(&self, address: &str, chain: Chain) -> Result<Wallet> {
        self.lock().get_wallet(address, chain)
    }

    pub fn list_wallets(&self, chain: Option<Chain>, active_only: bool) -> Result<Vec<Wallet>> {
        self.lock().list_wallets(chain, active_only)
    }

    pub fn remove_wallet(&self, address: &str, chain: Chain, purge: bool) -> Result<RemovedWallet> {
        self.lock().remove_wallet(address, chain, purge)
    }

    pub fn update_first_seen(&self, address: &str, chain: Chain, first_seen: DateTime<Utc>) -> Result<()> {
        self.lock().update_first_seen(address, chain, first_seen)
    }

    // --- Transaction cache ---

    pub fn upsert_transactions(&self, txs: &[Transaction]) -> Result<usize> {
        self.lock().upsert_transactions(txs)
    }

    /// `None` is a cache miss; `Some(vec![])` is a fresh "no activity" answer.
    pub fn cached_transactions(
        &self,
        address: &str,
        chain: Chain,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Vec<Transaction>>> {
        self.lock().cached_transactions(address, chain, from, to, ttl)
    }

    // --- Score ledger ---

    pub fn save_score(&self, snapshot: &ScoreSnapshot) -> Result<()> {
        self.lock().save_score(snapshot)
    }

    pub fn score_history(&self, address: &str, chain: Chain, days: u32) -> Result<Vec<ScoreSnapshot>> {
        self.lock().score_history(address, chain, days)
    }

    // --- Alert ledger ---

    pub fn insert_alert(&self, alert: &AlertEvent) -> Result<i64> {
        self.lock().insert_alert(alert)
    }

    pub fn update_alert_webhook(&self, alert_id: i64, sent: bool, status: Option<u16>) -> Result<()> {
        self.lock().update_alert_webhook(alert_id, sent, status)
    }

    pub fn list_alerts(&self, chain: Option<Chain>, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<AlertEvent>> {
        self.lock().list_alerts(chain, since, limit)
    }

    pub fn is_duplicate_alert(&self, address: &str, chain: Chain, window: Duration) -> Result<bool> {
        self.lock().is_duplicate_alert(address, chain, window)
    }

    // --- Alert rules ---

    pub fn next_rule_id(&self) -> Result<String> {
        self.lock().next_rule_id()
    }

    pub fn create_alert_rule(
        &self,
        rule_type: RuleType,
        value: f64,
        window: RuleWindow,
        chain: Option<Chain>,
        webhook_url: Option<&str>,
    ) -> Result<AlertRule> {
        self.lock().create_alert_rule(rule_type, value, window, chain, webhook_url)
    }

    pub fn list_alert_rules(&self, active_only: bool) -> Result<Vec<AlertRule>> {
        self.lock().list_alert_rules(active_only)
    }

    pub fn deactivate_alert_rule(&self, id: &str) -> Result<bool> {
        self.lock().deactivate_alert_rule(id)
    }

    // --- Generic response cache ---

    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        self.lock().cache_get(key)
    }

    pub fn cache_set(&self, key: &str, payload: &str, ttl: Duration) -> Result<()> {
        self.lock().cache_put(key, payload, Utc::now(), ttl)
    }

    pub fn cache_prune(&self) -> Result<usize> {
        self.lock().cache_prune()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }
}

/// Fixed-width RFC 3339 so TEXT columns order chronologically.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_chain(idx: usize, raw: &str) -> rusqlite::Result<Chain> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

#[cfg(test)]
pub(crate) fn temp_db() -> SharedDatabase {
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "whalecli_test_{}_{}.db",
        std::process::id(),
        id
    ));
    // Remove if leftover from previous run
    let _ = std::fs::remove_file(&path);
    SharedDatabase::open(&path).unwrap()
}
