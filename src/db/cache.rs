use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::time::Duration;

use super::Database;
use crate::error::Result;

impl Database {
    /// Payload for `key` while it is still fresh.
    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        self.cache_get_at(key, Utc::now().timestamp())
    }

    /// An entry is fresh through its expiry second; `cache_prune_at` takes
    /// exactly the complement.
    pub(crate) fn cache_get_at(&self, key: &str, now: i64) -> Result<Option<String>> {
        let payload = self
            .conn
            .query_row(
                "SELECT response FROM api_cache
                 WHERE cache_key = ?1 AND fetched_at + ttl_seconds >= ?2",
                rusqlite::params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    pub fn cache_put(&self, key: &str, payload: &str, fetched_at: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.conn.execute(
            "INSERT INTO api_cache (cache_key, response, fetched_at, ttl_seconds)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                response = excluded.response,
                fetched_at = excluded.fetched_at,
                ttl_seconds = excluded.ttl_seconds",
            rusqlite::params![key, payload, fetched_at.timestamp(), ttl.as_secs() as i64],
        )?;
        Ok(())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cache_prune(&self) -> Result<usize> {
        self.cache_prune_at(Utc::now().timestamp())
    }

    pub(crate) fn cache_prune_at(&self, now: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM api_cache WHERE fetched_at + ttl_seconds < ?1",
            [now],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "pruned expired cache entries");
        }
        Ok(removed)
    }
}
