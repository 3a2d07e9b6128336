//! Read-only aggregate queries for operators.

use super::{claim::claim_from_row, claim::claim_select, ts, LedgerStore};
use crate::{error::LedgerResult, models::PaymentClaim, types::round_cents};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count:  i64,
}

/// Claim activity since `window_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStats {
    pub window_start:           DateTime<Utc>,
    pub total_claims:           i64,
    pub by_verification_status: Vec<StatusCount>,
    pub by_payment_status:      Vec<StatusCount>,
    /// Over claims with at least one completed attempt.
    pub average_confidence:     Option<f64>,
    pub recent_claims:          Vec<PaymentClaim>,
}

impl VerificationStats {
    pub fn count_for(&self, verification_status: &str) -> i64 {
        self.by_verification_status
            .iter()
            .find(|c| c.status == verification_status)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionLevelSummary {
    pub level:      u32,
    pub records:    i64,
    pub total_usdt: f64,
    pub total_nft:  f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionSummary {
    pub levels:       Vec<CommissionLevelSummary>,
    pub records:      i64,
    pub total_usdt:   f64,
    pub total_nft:    f64,
    pub pending_usdt: f64,
    pub paid_usdt:    f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalStatusSummary {
    pub status:       String,
    pub count:        i64,
    pub total_amount: f64,
    pub total_nft:    i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalSummary {
    pub by_status:        Vec<WithdrawalStatusSummary>,
    pub requests:         i64,
    pub open_amount:      f64,
    pub completed_amount: f64,
}

impl LedgerStore {
    pub fn verification_stats(
        &self,
        since: DateTime<Utc>,
        recent_limit: usize,
    ) -> LedgerResult<VerificationStats> {
        let group = |column: &str| -> LedgerResult<Vec<StatusCount>> {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {column}, COUNT(*) FROM payment_claim
                 WHERE created_at >= ?1
                 GROUP BY {column} ORDER BY {column}"
            ))?;
            let rows = stmt
                .query_map(params![ts(since)], |row| {
                    Ok(StatusCount {
                        status: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        };
        let by_verification_status = group("verification_status")?;
        let by_payment_status = group("payment_status")?;

        let (total_claims, average_confidence): (i64, Option<f64>) = self.conn.query_row(
            "SELECT COUNT(*), AVG(verification_confidence) FROM payment_claim WHERE created_at >= ?1",
            params![ts(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let recent_claims = {
            let mut stmt = self.conn.prepare(&claim_select(
                "WHERE created_at >= ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            ))?;
            let rows = stmt
                .query_map(params![ts(since), recent_limit as i64], claim_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(VerificationStats {
            window_start: since,
            total_claims,
            by_verification_status,
            by_payment_status,
            average_confidence: average_confidence.map(|a| (a * 100.0).round() / 100.0),
            recent_claims,
        })
    }

    /// Per-level totals, optionally for one referrer.
    pub fn commission_summary(&self, referrer_user_id: Option<&str>) -> LedgerResult<CommissionSummary> {
        let levels = {
            let mut stmt = self.conn.prepare(
                "SELECT level, COUNT(*), COALESCE(SUM(commission_usdt), 0), COALESCE(SUM(commission_nft), 0)
                 FROM commission_record
                 WHERE (?1 IS NULL OR referrer_user_id = ?1)
                 GROUP BY level ORDER BY level",
            )?;
            let rows = stmt
                .query_map(params![referrer_user_id], |row| {
                    Ok(CommissionLevelSummary {
                        level: row.get::<_, i64>(0)? as u32,
                        records: row.get(1)?,
                        total_usdt: round_cents(row.get(2)?),
                        total_nft: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let (pending_usdt, paid_usdt): (f64, f64) = self.conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN status = 'pending' THEN commission_usdt END), 0),
                    COALESCE(SUM(CASE WHEN status = 'paid' THEN commission_usdt END), 0)
             FROM commission_record
             WHERE (?1 IS NULL OR referrer_user_id = ?1)",
            params![referrer_user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CommissionSummary {
            records: levels.iter().map(|l| l.records).sum(),
            total_usdt: round_cents(levels.iter().map(|l| l.total_usdt).sum()),
            total_nft: levels.iter().map(|l| l.total_nft).sum(),
            pending_usdt: round_cents(pending_usdt),
            paid_usdt: round_cents(paid_usdt),
            levels,
        })
    }

    pub fn withdrawal_summary(&self, user_id: Option<&str>) -> LedgerResult<WithdrawalSummary> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(amount), 0), COALESCE(SUM(nft_quantity), 0)
             FROM withdrawal_request
             WHERE (?1 IS NULL OR user_id = ?1)
             GROUP BY status ORDER BY status",
        )?;
        let by_status = stmt
            .query_map(params![user_id], |row| {
                Ok(WithdrawalStatusSummary {
                    status: row.get(0)?,
                    count: row.get(1)?,
                    total_amount: round_cents(row.get(2)?),
                    total_nft: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let amount_in = |statuses: &[&str]| -> f64 {
            by_status
                .iter()
                .filter(|s| statuses.contains(&s.status.as_str()))
                .map(|s| s.total_amount)
                .sum()
        };

        Ok(WithdrawalSummary {
            requests: by_status.iter().map(|s| s.count).sum(),
            open_amount: round_cents(amount_in(&["pending", "processing"])),
            completed_amount: round_cents(amount_in(&["completed"])),
            by_status,
        })
    }
}
