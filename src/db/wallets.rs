use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;

use super::{Database, conversion_error, parse_chain, parse_ts, ts};
use crate::core::{Chain, Wallet};
use crate::error::{Result, WhaleError};

/// Outcome of a wallet removal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedWallet {
    pub address: String,
    pub chain: Chain,
    pub purged: bool,
    pub transactions_deleted: usize,
}

const WALLET_COLUMNS: &str = "address, chain, label, tags, added_at, first_seen, active";

impl Database {
    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<Wallet> {
        let tags_json: String = row.get(3)?;
        let tags: BTreeSet<String> = serde_json::from_str(&tags_json)
            .map_err(|e| conversion_error(3, format!("bad tags JSON: {e}")))?;
        let first_seen: Option<String> = row.get(5)?;
        Ok(Wallet {
            address: row.get(0)?,
            chain: parse_chain(1, &row.get::<_, String>(1)?)?,
            label: row.get(2)?,
            tags,
            added_at: parse_ts(4, &row.get::<_, String>(4)?)?,
            first_seen: first_seen.as_deref().map(|s| parse_ts(5, s)).transpose()?,
            active: row.get::<_, i64>(6)? != 0,
        })
    }

    /// Register a wallet. (address, chain) is unique across active and
    /// soft-deleted rows alike.
    pub fn add_wallet(&self, address: &str, chain: Chain, label: &str, tags: &BTreeSet<String>) -> Result<Wallet> {
        let wallet = Wallet {
            address: chain.normalize_address(address),
            chain,
            label: label.to_string(),
            tags: tags.clone(),
            added_at: Utc::now(),
            first_seen: None,
            active: true,
        };
        let tags_json = serde_json::to_string(&wallet.tags).unwrap_or_else(|_| "[]".into());
        let inserted = self.conn.execute(
            "INSERT INTO wallets (address, chain, label, tags, added_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            rusqlite::params![wallet.address, chain.as_str(), wallet.label, tags_json, ts(&wallet.added_at)],
        );
        match inserted {
            Ok(_) => Ok(wallet),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(WhaleError::WalletExists {
                    chain,
                    address: wallet.address,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up an active wallet.
    pub fn get_wallet(&self, address: &str, chain: Chain) -> Result<Wallet> {
        let address = chain.normalize_address(address);
        let wallet = self
            .conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1 AND chain = ?2 AND active = 1"),
                rusqlite::params![address, chain.as_str()],
                Self::row_to_wallet,
            )
            .optional()?;
        wallet.ok_or(WhaleError::WalletNotFound { chain, address })
    }

    pub fn list_wallets(&self, chain: Option<Chain>, active_only: bool) -> Result<Vec<Wallet>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets
             WHERE (?1 IS NULL OR chain = ?1) AND (?2 = 0 OR active = 1)
             ORDER BY added_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![chain.map(|c| c.as_str()), active_only as i32],
            Self::row_to_wallet,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Soft-delete by default. `purge` hard-deletes the row (active or not)
    /// together with every cached transaction touching the address.
    pub fn remove_wallet(&self, address: &str, chain: Chain, purge: bool) -> Result<RemovedWallet> {
        let address = chain.normalize_address(address);
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT active FROM wallets WHERE address = ?1 AND chain = ?2",
                rusqlite::params![address, chain.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => return Err(WhaleError::WalletNotFound { chain, address }),
            Some(0) if !purge => return Err(WhaleError::WalletNotFound { chain, address }),
            Some(_) => {}
        }

        let mut transactions_deleted = 0;
        if purge {
            let tx = self.conn.unchecked_transaction()?;
            let needle = address.to_lowercase();
            transactions_deleted = tx.execute(
                "DELETE FROM transactions WHERE chain = ?1 AND (from_addr = ?2 OR to_addr = ?2)",
                rusqlite::params![chain.as_str(), needle],
            )?;
            tx.execute(
                "DELETE FROM wallets WHERE address = ?1 AND chain = ?2",
                rusqlite::params![address, chain.as_str()],
            )?;
            tx.commit()?;
        } else {
            self.conn.execute(
                "UPDATE wallets SET active = 0 WHERE address = ?1 AND chain = ?2",
                rusqlite::params![address, chain.as_str()],
            )?;
        }

        Ok(RemovedWallet {
            address,
            chain,
            purged: purge,
            transactions_deleted,
        })
    }

    pub fn update_first_seen(&self, address: &str, chain: Chain, first_seen: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE wallets SET first_seen = ?1 WHERE address = ?2 AND chain = ?3",
            rusqlite::params![ts(&first_seen), chain.normalize_address(address), chain.as_str()],
        )?;
        Ok(())
    }
}
