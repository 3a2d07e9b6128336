use super::{opt_ts, read_opt_ts, read_ts, ts, LedgerStore, LedgerTx};
use crate::{
    error::LedgerResult,
    models::{CommissionAvailability, CommissionRecord},
    types::{round_cents, round_nft, CommissionStatus, EntityId, UserId, AMOUNT_EPSILON},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

const COMMISSION_COLUMNS: &str = "id, referrer_user_id, referred_user_id, level, investment_id,
        purchase_amount, commission_usdt, commission_nft, status, nft_settled_at, created_at, updated_at";

/// Narrow a commission ledger listing. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommissionFilter {
    #[serde(default)]
    pub referrer_user_id: Option<UserId>,
    #[serde(default)]
    pub investment_id: Option<EntityId>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub status: Option<CommissionStatus>,
}

/// One user's commission position. `reserved` is held by open withdrawals,
/// `withdrawn` by completed ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommissionBalance {
    pub user_id:         UserId,
    pub earned_usdt:     f64,
    pub earned_nft:      f64,
    pub reserved_usdt:   f64,
    pub reserved_nft:    f64,
    pub withdrawn_usdt:  f64,
    pub withdrawn_nft:   f64,
    pub available_usdt:  f64,
    pub available_nft:   f64,
}

fn commission_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommissionRecord> {
    Ok(CommissionRecord {
        id: row.get(0)?,
        referrer_user_id: row.get(1)?,
        referred_user_id: row.get(2)?,
        level: row.get::<_, i64>(3)? as u32,
        investment_id: row.get(4)?,
        purchase_amount: row.get(5)?,
        commission_usdt: row.get(6)?,
        commission_nft: row.get(7)?,
        status: row.get(8)?,
        nft_settled_at: read_opt_ts(row, 9)?,
        created_at: read_ts(row, 10)?,
        updated_at: read_ts(row, 11)?,
    })
}

/// Commissions of one user with the value no live withdrawal holds, oldest
/// first. A record paid on its USDT side can still carry NFT credits.
fn availability(conn: &Connection, user_id: &str) -> LedgerResult<Vec<CommissionAvailability>> {
    let mut stmt = conn.prepare(
        "SELECT c.id,
                c.commission_usdt - COALESCE(SUM(a.usdt), 0),
                c.commission_nft  - COALESCE(SUM(a.nft), 0)
         FROM commission_record c
         LEFT JOIN withdrawal_allocation a
                ON a.commission_id = c.id
               AND a.withdrawal_id IN (
                   SELECT id FROM withdrawal_request
                   WHERE status IN ('pending', 'processing', 'completed'))
         WHERE c.referrer_user_id = ?1
           AND (c.status = 'pending' OR c.nft_settled_at IS NULL)
         GROUP BY c.id
         ORDER BY c.created_at ASC, c.level ASC, c.id ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(CommissionAvailability {
                commission_id: row.get(0)?,
                unreserved_usdt: row.get::<_, f64>(1)?.max(0.0),
                unreserved_nft: row.get::<_, f64>(2)?.max(0.0),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|a| a.unreserved_usdt > AMOUNT_EPSILON || a.unreserved_nft > AMOUNT_EPSILON)
        .collect())
}

impl LedgerStore {
    // ── Commission ledger ─────────────────────────────────────────

    pub fn commission_ledger(&self, filter: &CommissionFilter) -> LedgerResult<Vec<CommissionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commission_record
             WHERE (?1 IS NULL OR referrer_user_id = ?1)
               AND (?2 IS NULL OR investment_id = ?2)
               AND (?3 IS NULL OR level = ?3)
               AND (?4 IS NULL OR status = ?4)
             ORDER BY created_at ASC, investment_id ASC, level ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    filter.referrer_user_id,
                    filter.investment_id,
                    filter.level.map(i64::from),
                    filter.status,
                ],
                commission_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn commissions_for_investment(&self, investment_id: &str) -> LedgerResult<Vec<CommissionRecord>> {
        self.commission_ledger(&CommissionFilter {
            investment_id: Some(investment_id.to_string()),
            ..CommissionFilter::default()
        })
    }

    pub fn commission_balance(&self, user_id: &str) -> LedgerResult<CommissionBalance> {
        let (earned_usdt, earned_nft): (f64, f64) = self.conn.query_row(
            "SELECT COALESCE(SUM(commission_usdt), 0), COALESCE(SUM(commission_nft), 0)
             FROM commission_record WHERE referrer_user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let held = |statuses: &str| -> LedgerResult<(f64, f64)> {
            let sql = format!(
                "SELECT COALESCE(SUM(a.usdt), 0), COALESCE(SUM(a.nft), 0)
                 FROM withdrawal_allocation a
                 JOIN withdrawal_request w ON w.id = a.withdrawal_id
                 JOIN commission_record c ON c.id = a.commission_id
                 WHERE c.referrer_user_id = ?1 AND w.status IN ({statuses})"
            );
            let sums = self
                .conn
                .query_row(&sql, params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(sums)
        };
        let (reserved_usdt, reserved_nft) = held("'pending', 'processing'")?;
        let (withdrawn_usdt, withdrawn_nft) = held("'completed'")?;

        Ok(CommissionBalance {
            user_id: user_id.to_string(),
            earned_usdt: round_cents(earned_usdt),
            earned_nft: round_nft(earned_nft),
            reserved_usdt: round_cents(reserved_usdt),
            reserved_nft: round_nft(reserved_nft),
            withdrawn_usdt: round_cents(withdrawn_usdt),
            withdrawn_nft: round_nft(withdrawn_nft),
            available_usdt: round_cents(earned_usdt - reserved_usdt - withdrawn_usdt).max(0.0),
            available_nft: round_nft(earned_nft - reserved_nft - withdrawn_nft).max(0.0),
        })
    }

    pub fn commission_availability(&self, user_id: &str) -> LedgerResult<Vec<CommissionAvailability>> {
        availability(&self.conn, user_id)
    }
}

impl LedgerTx<'_> {
    pub fn commissions_exist_for_investment(&self, investment_id: &str) -> LedgerResult<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM commission_record WHERE investment_id = ?1",
            params![investment_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn insert_commission(&self, c: &CommissionRecord) -> LedgerResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO commission_record ({COMMISSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                c.id,
                c.referrer_user_id,
                c.referred_user_id,
                i64::from(c.level),
                c.investment_id,
                c.purchase_amount,
                c.commission_usdt,
                c.commission_nft,
                c.status,
                opt_ts(c.nft_settled_at),
                ts(c.created_at),
                ts(c.updated_at),
            ],
        )?;
        Ok(())
    }

    /// See `LedgerStore::commission_availability`. Read inside the write lock
    /// so the reservation that follows cannot race another request.
    pub fn commission_availability(&self, user_id: &str) -> LedgerResult<Vec<CommissionAvailability>> {
        availability(self.conn(), user_id)
    }

    /// Settle the commissions touched by `withdrawal_id`. The USDT side flips
    /// `status` to `paid` once completed withdrawals cover `commission_usdt`;
    /// the NFT side sets `nft_settled_at` once they cover `commission_nft`.
    /// Returns the ids flipped to `paid`.
    pub fn settle_commissions_for_withdrawal(
        &self,
        withdrawal_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<EntityId>> {
        let touched: Vec<(EntityId, f64, f64, CommissionStatus, bool)> = {
            let mut stmt = self.conn().prepare(
                "SELECT c.id,
                        c.commission_usdt - COALESCE(SUM(CASE WHEN w.status = 'completed' THEN a.usdt END), 0),
                        c.commission_nft  - COALESCE(SUM(CASE WHEN w.status = 'completed' THEN a.nft END), 0),
                        c.status,
                        c.nft_settled_at IS NOT NULL
                 FROM commission_record c
                 JOIN withdrawal_allocation a ON a.commission_id = c.id
                 JOIN withdrawal_request w ON w.id = a.withdrawal_id
                 WHERE c.id IN (SELECT commission_id FROM withdrawal_allocation WHERE withdrawal_id = ?1)
                 GROUP BY c.id",
            )?;
            let rows = stmt
                .query_map(params![withdrawal_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut paid = Vec::new();
        for (id, usdt_left, nft_left, status, nft_settled) in touched {
            if status == CommissionStatus::Pending && usdt_left <= AMOUNT_EPSILON {
                self.conn().execute(
                    "UPDATE commission_record SET status = 'paid', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![ts(now), id],
                )?;
                paid.push(id.clone());
            }
            if !nft_settled && nft_left <= AMOUNT_EPSILON {
                self.conn().execute(
                    "UPDATE commission_record SET nft_settled_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND nft_settled_at IS NULL",
                    params![ts(now), id],
                )?;
            }
        }
        Ok(paid)
    }
}
