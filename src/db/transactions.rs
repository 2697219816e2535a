use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use super::{Database, conversion_error, parse_chain, parse_ts, ts};
use crate::core::{Chain, Transaction};
use crate::error::Result;

impl Database {
    /// Insert or refresh cached transactions. Re-upserting the same
    /// (chain, tx_hash) only refreshes the row.
    pub fn upsert_transactions(&self, txs: &[Transaction]) -> Result<usize> {
        if txs.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transactions
                    (chain, tx_hash, block_num, timestamp, from_addr, to_addr,
                     value_native, value_usd, gas_usd, token_symbol, token_addr, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(chain, tx_hash) DO UPDATE SET
                    block_num = excluded.block_num,
                    value_usd = COALESCE(excluded.value_usd, transactions.value_usd),
                    gas_usd = COALESCE(excluded.gas_usd, transactions.gas_usd),
                    fetched_at = excluded.fetched_at",
            )?;
            for t in txs {
                written += stmt.execute(rusqlite::params![
                    t.chain.as_str(),
                    t.tx_hash,
                    t.block_num.map(|b| b as i64),
                    ts(&t.timestamp),
                    t.from_addr.to_lowercase(),
                    t.to_addr.to_lowercase(),
                    t.value_native.to_string(),
                    t.value_usd,
                    t.gas_usd,
                    t.token_symbol,
                    t.token_addr,
                    ts(&t.fetched_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Cached transactions touching `address` in `[from, to]`. A miss (`None`)
    /// means no row for the wallet was fetched within `ttl`.
    pub fn cached_transactions(
        &self,
        address: &str,
        chain: Chain,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Vec<Transaction>>> {
        let needle = address.to_lowercase();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let fresh_after = Utc::now() - ttl;

        let fresh: bool = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM transactions
                WHERE chain = ?1 AND (from_addr = ?2 OR to_addr = ?2) AND fetched_at >= ?3
             )",
            rusqlite::params![chain.as_str(), needle, ts(&fresh_after)],
            |row| row.get(0),
        )?;
        if !fresh {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT tx_hash, chain, block_num, from_addr, to_addr, timestamp, value_native,
                    value_usd, gas_usd, token_symbol, token_addr, fetched_at
             FROM transactions
             WHERE chain = ?1 AND (from_addr = ?2 OR to_addr = ?2)
               AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chain.as_str(), needle, ts(&from), ts(&to)],
            |row| {
                let native: String = row.get(6)?;
                Ok(Transaction {
                    tx_hash: row.get(0)?,
                    chain: parse_chain(1, &row.get::<_, String>(1)?)?,
                    block_num: row.get::<_, Option<i64>>(2)?.map(|b| b as u64),
                    from_addr: row.get(3)?,
                    to_addr: row.get(4)?,
                    timestamp: parse_ts(5, &row.get::<_, String>(5)?)?,
                    value_native: Decimal::from_str(&native)
                        .map_err(|e| conversion_error(6, format!("bad decimal {native:?}: {e}")))?,
                    value_usd: row.get(7)?,
                    gas_usd: row.get(8)?,
                    token_symbol: row.get(9)?,
                    token_addr: row.get(10)?,
                    fetched_at: parse_ts(11, &row.get::<_, String>(11)?)?,
                })
            },
        )?;
        Ok(Some(rows.collect::<rusqlite::Result<Vec<_>>>()?))
    }
}
