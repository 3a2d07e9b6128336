use super::{not_found, opt_ts, read_opt_ts, read_ts, ts, LedgerStore, LedgerTx};
use crate::{
    error::LedgerResult,
    models::{WithdrawalAllocation, WithdrawalRequest},
    types::{UserId, WithdrawalStatus, WithdrawalType},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

const WITHDRAWAL_COLUMNS: &str = "id, user_id, withdrawal_type, amount, nft_quantity,
        wallet_address, transaction_hash, status, admin_notes, requested_at, processed_at,
        processed_by";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalFilter {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub status: Option<WithdrawalStatus>,
    #[serde(default)]
    pub withdrawal_type: Option<WithdrawalType>,
}

/// Fields written alongside a withdrawal status change. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default)]
pub struct WithdrawalUpdate<'a> {
    pub transaction_hash: Option<&'a str>,
    pub admin_notes: Option<&'a str>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<&'a str>,
}

fn withdrawal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WithdrawalRequest> {
    Ok(WithdrawalRequest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        withdrawal_type: row.get(2)?,
        amount: row.get(3)?,
        nft_quantity: row.get::<_, i64>(4)? as u32,
        wallet_address: row.get(5)?,
        transaction_hash: row.get(6)?,
        status: row.get(7)?,
        admin_notes: row.get(8)?,
        requested_at: read_ts(row, 9)?,
        processed_at: read_opt_ts(row, 10)?,
        processed_by: row.get(11)?,
    })
}

fn withdrawal_by_id(conn: &Connection, withdrawal_id: &str) -> LedgerResult<WithdrawalRequest> {
    conn.query_row(
        &format!("SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_request WHERE id = ?1"),
        params![withdrawal_id],
        withdrawal_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("withdrawal_request", withdrawal_id))
}

impl LedgerStore {
    // ── Withdrawals ───────────────────────────────────────────────

    pub fn get_withdrawal(&self, withdrawal_id: &str) -> LedgerResult<WithdrawalRequest> {
        withdrawal_by_id(&self.conn, withdrawal_id)
    }

    /// Newest first.
    pub fn list_withdrawals(&self, filter: &WithdrawalFilter) -> LedgerResult<Vec<WithdrawalRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_request
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR withdrawal_type = ?3)
             ORDER BY requested_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(
                params![filter.user_id, filter.status, filter.withdrawal_type],
                withdrawal_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn allocations_for_withdrawal(&self, withdrawal_id: &str) -> LedgerResult<Vec<WithdrawalAllocation>> {
        let mut stmt = self.conn.prepare(
            "SELECT withdrawal_id, commission_id, usdt, nft
             FROM withdrawal_allocation WHERE withdrawal_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![withdrawal_id], |row| {
                Ok(WithdrawalAllocation {
                    withdrawal_id: row.get(0)?,
                    commission_id: row.get(1)?,
                    usdt: row.get(2)?,
                    nft: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl LedgerTx<'_> {
    pub fn get_withdrawal(&self, withdrawal_id: &str) -> LedgerResult<WithdrawalRequest> {
        withdrawal_by_id(self.conn(), withdrawal_id)
    }

    pub fn insert_withdrawal(&self, w: &WithdrawalRequest) -> LedgerResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO withdrawal_request ({WITHDRAWAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                w.id,
                w.user_id,
                w.withdrawal_type,
                w.amount,
                i64::from(w.nft_quantity),
                w.wallet_address,
                w.transaction_hash,
                w.status,
                w.admin_notes,
                ts(w.requested_at),
                opt_ts(w.processed_at),
                w.processed_by,
            ],
        )?;
        Ok(())
    }

    pub fn insert_allocation(&self, a: &WithdrawalAllocation) -> LedgerResult<()> {
        self.conn().execute(
            "INSERT INTO withdrawal_allocation (withdrawal_id, commission_id, usdt, nft)
             VALUES (?1, ?2, ?3, ?4)",
            params![a.withdrawal_id, a.commission_id, a.usdt, a.nft],
        )?;
        Ok(())
    }

    /// Requests of this user still waiting on an operator.
    pub fn open_withdrawal_count(&self, user_id: &str) -> LedgerResult<u32> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM withdrawal_request
             WHERE user_id = ?1 AND status IN ('pending', 'processing')",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// Conditional status change: applies only while the request is still in
    /// `from`. Returns false if it has moved on.
    pub fn transition_withdrawal(
        &self,
        withdrawal_id: &str,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
        update: &WithdrawalUpdate<'_>,
    ) -> LedgerResult<bool> {
        let changed = self.conn().execute(
            "UPDATE withdrawal_request
             SET status = ?1,
                 transaction_hash = COALESCE(?2, transaction_hash),
                 admin_notes = COALESCE(?3, admin_notes),
                 processed_at = COALESCE(?4, processed_at),
                 processed_by = COALESCE(?5, processed_by)
             WHERE id = ?6 AND status = ?7",
            params![
                to,
                update.transaction_hash,
                update.admin_notes,
                opt_ts(update.processed_at),
                update.processed_by,
                withdrawal_id,
                from,
            ],
        )?;
        Ok(changed == 1)
    }
}
