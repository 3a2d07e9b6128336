use super::{not_found, read_opt_ts, read_ts, ts, LedgerStore, LedgerTx};
use crate::{
    error::LedgerResult,
    models::Investment,
    types::UserId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// A row of the event outbox. Payload is the JSON-serialized event body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

fn referrer_of(conn: &Connection, user_id: &str) -> LedgerResult<Option<UserId>> {
    let referrer = conn
        .query_row(
            "SELECT referrer_id FROM referral_link WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(referrer)
}

fn investment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Investment> {
    Ok(Investment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount_usd: row.get(2)?,
        source: row.get(3)?,
        source_id: row.get(4)?,
        created_at: read_ts(row, 5)?,
    })
}

impl LedgerStore {
    // ── Referral graph ────────────────────────────────────────────

    pub fn referrer_of(&self, user_id: &str) -> LedgerResult<Option<UserId>> {
        referrer_of(&self.conn, user_id)
    }

    /// Users who name `user_id` as their direct referrer.
    pub fn direct_referrals(&self, user_id: &str) -> LedgerResult<Vec<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM referral_link WHERE referrer_id = ?1 ORDER BY created_at, user_id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Investments ───────────────────────────────────────────────

    pub fn get_investment(&self, investment_id: &str) -> LedgerResult<Investment> {
        self.conn
            .query_row(
                "SELECT id, user_id, amount_usd, source, source_id, created_at
                 FROM investment WHERE id = ?1",
                params![investment_id],
                investment_from_row,
            )
            .optional()?
            .ok_or_else(|| not_found("investment", investment_id))
    }

    pub fn investments_for_user(&self, user_id: &str) -> LedgerResult<Vec<Investment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, amount_usd, source, source_id, created_at
             FROM investment WHERE user_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![user_id], investment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Event outbox ──────────────────────────────────────────────

    /// Unconsumed events of one type, oldest first.
    pub fn unconsumed_events(&self, event_type: &str, limit: usize) -> LedgerResult<Vec<OutboxEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, aggregate_id, payload, created_at, consumed_at
             FROM event_outbox
             WHERE event_type = ?1 AND consumed_at IS NULL
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![event_type, limit as i64], |row| {
                Ok(OutboxEvent {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    aggregate_id: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: read_ts(row, 4)?,
                    consumed_at: read_opt_ts(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn event_count(&self, event_type: &str) -> LedgerResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM event_outbox WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

impl LedgerTx<'_> {
    pub fn referrer_of(&self, user_id: &str) -> LedgerResult<Option<UserId>> {
        referrer_of(self.conn(), user_id)
    }

    pub fn insert_referral_link(
        &self,
        user_id: &str,
        referrer_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.conn().execute(
            "INSERT INTO referral_link (user_id, referrer_id, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, referrer_id, ts(now)],
        )?;
        Ok(())
    }

    pub fn insert_investment(&self, inv: &Investment) -> LedgerResult<()> {
        self.conn().execute(
            "INSERT INTO investment (id, user_id, amount_usd, source, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                inv.id,
                inv.user_id,
                inv.amount_usd,
                inv.source,
                inv.source_id,
                ts(inv.created_at),
            ],
        )?;
        Ok(())
    }

    /// Append an event. At most one event per (type, aggregate): returns
    /// false if one already exists.
    pub fn append_event(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO event_outbox (event_type, aggregate_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, aggregate_id, payload, ts(now)],
        )?;
        Ok(inserted == 1)
    }

    /// Mark an event consumed. Returns false if it was already consumed.
    pub fn mark_event_consumed(&self, event_id: i64, now: DateTime<Utc>) -> LedgerResult<bool> {
        let changed = self.conn().execute(
            "UPDATE event_outbox SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
            params![ts(now), event_id],
        )?;
        Ok(changed == 1)
    }
}
