use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS wallets (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            address     TEXT NOT NULL,
            chain       TEXT NOT NULL CHECK (chain IN ('ETH', 'BTC', 'HL')),
            label       TEXT NOT NULL DEFAULT '',
            tags        TEXT NOT NULL DEFAULT '[]', -- JSON array
            added_at    TEXT NOT NULL,
            first_seen  TEXT,
            active      INTEGER NOT NULL DEFAULT 1,
            UNIQUE (address, chain)
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            chain        TEXT NOT NULL,
            tx_hash      TEXT NOT NULL,
            block_num    INTEGER,
            timestamp    TEXT NOT NULL,
            from_addr    TEXT NOT NULL,
            to_addr      TEXT NOT NULL,
            value_native TEXT NOT NULL, -- exact decimal
            value_usd    REAL,
            gas_usd      REAL,
            token_symbol TEXT,
            token_addr   TEXT,
            fetched_at   TEXT NOT NULL,
            UNIQUE (chain, tx_hash)
        );

        CREATE TABLE IF NOT EXISTS scores (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            address         TEXT NOT NULL,
            chain           TEXT NOT NULL,
            computed_at     TEXT NOT NULL,
            window_hours    INTEGER NOT NULL,
            total_score     INTEGER NOT NULL,
            net_flow        INTEGER NOT NULL,
            velocity        INTEGER NOT NULL,
            correlation     INTEGER NOT NULL,
            exchange_flow   INTEGER NOT NULL,
            net_flow_usd    REAL NOT NULL DEFAULT 0,
            inflow_usd      REAL NOT NULL DEFAULT 0,
            outflow_usd     REAL NOT NULL DEFAULT 0,
            direction       TEXT NOT NULL CHECK (direction IN ('accumulating', 'distributing', 'neutral')),
            alert_triggered INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            address        TEXT NOT NULL,
            chain          TEXT NOT NULL,
            label          TEXT NOT NULL DEFAULT '',
            score          INTEGER NOT NULL,
            direction      TEXT NOT NULL,
            net_flow_usd   REAL NOT NULL DEFAULT 0,
            triggered_at   TEXT NOT NULL,
            rule_id        TEXT NOT NULL DEFAULT '',
            webhook_sent   INTEGER NOT NULL DEFAULT 0,
            webhook_status INTEGER
        );

        CREATE TABLE IF NOT EXISTS alert_rules (
            id          TEXT PRIMARY KEY,
            type        TEXT NOT NULL CHECK (type IN ('score', 'flow')),
            value       REAL NOT NULL,
            window      TEXT NOT NULL DEFAULT '1h',
            chain       TEXT,
            webhook_url TEXT,
            created_at  TEXT NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS api_cache (
            cache_key   TEXT PRIMARY KEY,
            response    TEXT NOT NULL,
            fetched_at  INTEGER NOT NULL, -- unix seconds
            ttl_seconds INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_wallets_chain ON wallets(chain);
        CREATE INDEX IF NOT EXISTS idx_transactions_chain_ts ON transactions(chain, timestamp);
        CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_addr);
        CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions(to_addr);
        CREATE INDEX IF NOT EXISTS idx_scores_addr ON scores(address, chain, computed_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_wallet ON alerts(address, chain, triggered_at);
        ",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        rusqlite::params![SCHEMA_VERSION],
    )?;
    Ok(())
}
