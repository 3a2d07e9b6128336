//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engines call store methods; they never execute SQL directly.
//!
//! Reads go through `LedgerStore`. Anything that writes more than one row, or
//! must read-then-write without interleaving, goes through a `LedgerTx`
//! opened with `BEGIN IMMEDIATE`: SQLite grants the write lock up front, so two
//! connections can never both read the same balance and then both act on it.
//! A `LedgerTx` that is dropped without `commit()` rolls back.

use crate::{
    clock::from_unix,
    error::{LedgerError, LedgerResult},
};
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

mod claim;
mod commission;
mod referral;
mod report;
mod withdrawal;

pub use claim::ClaimTransition;
pub use commission::{CommissionBalance, CommissionFilter};
pub use referral::OutboxEvent;
pub use report::{
    CommissionLevelSummary, CommissionSummary, StatusCount, VerificationStats, WithdrawalStatusSummary,
    WithdrawalSummary,
};
pub use withdrawal::{WithdrawalFilter, WithdrawalUpdate};

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file, one per worker thread.
    pub fn reopen(&self) -> LedgerResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_claims.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_investments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_commissions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_withdrawals.sql"))?;
        Ok(())
    }

    /// Begin an immediate (write-locking) transaction.
    pub fn write_tx(&self) -> LedgerResult<LedgerTx<'_>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Ok(LedgerTx { tx })
    }
}

/// A write transaction. Commit explicitly; dropping rolls back.
pub struct LedgerTx<'s> {
    tx: Transaction<'s>,
}

impl LedgerTx<'_> {
    pub fn commit(self) -> LedgerResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.tx
    }
}

// ── Row helpers ───────────────────────────────────────────────────

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp())
}

fn read_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_unix(row.get::<_, i64>(idx)?))
}

fn read_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_unix))
}

/// Decode a JSON text column inside a row mapper.
fn read_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_opt_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn not_found(entity: &'static str, id: &str) -> LedgerError {
    LedgerError::NotFound {
        entity,
        id: id.to_string(),
    }
}
