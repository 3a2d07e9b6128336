use super::{
    not_found, opt_ts, read_json, read_opt_json, read_opt_ts, read_ts, ts, LedgerStore, LedgerTx,
};
use crate::{
    error::LedgerResult,
    models::{PaymentClaim, VerificationAttempt, VerificationData},
    types::{EntityId, PaymentStatus, VerificationStatus},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const CLAIM_COLUMNS: &str = "id, user_id, claimed_amount_usd, chain, company_wallet_address,
        sender_wallet_address, sender_name, transaction_hash, notes, payment_status,
        verification_status, verification_confidence, verification_reason, verification_data,
        transient_failures, next_retry_at, created_at, expires_at, verified_by, verified_at,
        investment_id";

pub(super) fn claim_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentClaim> {
    Ok(PaymentClaim {
        id: row.get(0)?,
        user_id: row.get(1)?,
        claimed_amount_usd: row.get(2)?,
        chain: row.get(3)?,
        company_wallet_address: row.get(4)?,
        sender_wallet_address: row.get(5)?,
        sender_name: row.get(6)?,
        transaction_hash: row.get(7)?,
        notes: row.get(8)?,
        payment_status: row.get(9)?,
        verification_status: row.get(10)?,
        verification_confidence: row.get::<_, Option<i64>>(11)?.map(|c| c.clamp(0, 100) as u8),
        verification_reason: row.get(12)?,
        verification_data: read_opt_json(row, 13)?,
        transient_failures: row.get::<_, i64>(14)? as u32,
        next_retry_at: read_opt_ts(row, 15)?,
        created_at: read_ts(row, 16)?,
        expires_at: read_ts(row, 17)?,
        verified_by: row.get(18)?,
        verified_at: read_opt_ts(row, 19)?,
        investment_id: row.get(20)?,
    })
}

pub(super) fn claim_select(filter_sql: &str) -> String {
    format!("SELECT {CLAIM_COLUMNS} FROM payment_claim {filter_sql}")
}

fn claim_by_id(conn: &Connection, claim_id: &str) -> LedgerResult<Option<PaymentClaim>> {
    let claim = conn
        .query_row(
            &claim_select("WHERE id = ?1"),
            params![claim_id],
            claim_from_row,
        )
        .optional()?;
    Ok(claim)
}

fn attempt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VerificationAttempt> {
    Ok(VerificationAttempt {
        id: row.get(0)?,
        claim_id: row.get(1)?,
        attempt_no: row.get::<_, i64>(2)? as u32,
        outcome: row.get(3)?,
        confidence: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
        checks: read_json(row, 5)?,
        errors: read_json(row, 6)?,
        on_chain: read_opt_json(row, 7)?,
        created_at: read_ts(row, 8)?,
    })
}

const ATTEMPT_COLUMNS: &str =
    "id, claim_id, attempt_no, outcome, confidence, checks, errors, on_chain, created_at";

/// Field values written by one claim state transition. `None` fields keep the
/// stored value.
#[derive(Debug, Clone)]
pub struct ClaimTransition<'a> {
    pub verification_status: VerificationStatus,
    pub payment_status: PaymentStatus,
    pub confidence: Option<u8>,
    pub reason: &'a str,
    pub data: Option<&'a VerificationData>,
    pub verified_by: Option<&'a str>,
    pub verified_at: Option<DateTime<Utc>>,
    pub investment_id: Option<&'a str>,
}

impl LedgerStore {
    // ── Payment claims ────────────────────────────────────────────

    pub fn get_claim(&self, claim_id: &str) -> LedgerResult<PaymentClaim> {
        claim_by_id(&self.conn, claim_id)?.ok_or_else(|| not_found("payment_claim", claim_id))
    }

    pub fn find_claim(&self, claim_id: &str) -> LedgerResult<Option<PaymentClaim>> {
        claim_by_id(&self.conn, claim_id)
    }

    /// Claims the sweep should verify now: never attempted, or whose retry
    /// backoff has elapsed. Oldest first.
    pub fn claims_ready_for_verification(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM payment_claim
             WHERE verification_status = 'pending' AND payment_status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![ts(now), limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ── Verification attempts ─────────────────────────────────────

    pub fn attempts_for_claim(&self, claim_id: &str) -> LedgerResult<Vec<VerificationAttempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM verification_attempt
             WHERE claim_id = ?1 ORDER BY attempt_no ASC"
        ))?;
        let rows = stmt
            .query_map(params![claim_id], attempt_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent attempts across all claims, newest first.
    pub fn recent_attempts(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<VerificationAttempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM verification_attempt
             WHERE created_at >= ?1
             ORDER BY created_at DESC, attempt_no DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![ts(since), limit as i64], attempt_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl LedgerTx<'_> {
    pub fn get_claim(&self, claim_id: &str) -> LedgerResult<PaymentClaim> {
        claim_by_id(self.conn(), claim_id)?.ok_or_else(|| not_found("payment_claim", claim_id))
    }

    pub fn insert_claim(&self, c: &PaymentClaim) -> LedgerResult<()> {
        let data = c
            .verification_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn().execute(
            &format!(
                "INSERT INTO payment_claim ({CLAIM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                c.id,
                c.user_id,
                c.claimed_amount_usd,
                c.chain,
                c.company_wallet_address,
                c.sender_wallet_address,
                c.sender_name,
                c.transaction_hash,
                c.notes,
                c.payment_status,
                c.verification_status,
                c.verification_confidence.map(i64::from),
                c.verification_reason,
                data,
                i64::from(c.transient_failures),
                opt_ts(c.next_retry_at),
                ts(c.created_at),
                ts(c.expires_at),
                c.verified_by,
                opt_ts(c.verified_at),
                c.investment_id,
            ],
        )?;
        Ok(())
    }

    /// Id of a pending or completed claim already backed by this transfer.
    pub fn live_claim_for_transaction(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> LedgerResult<Option<EntityId>> {
        let id = self
            .conn()
            .query_row(
                "SELECT id FROM payment_claim
                 WHERE chain = ?1 AND transaction_hash = ?2
                   AND payment_status IN ('pending', 'completed')
                 LIMIT 1",
                params![chain, tx_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Count one more oracle outage. Applies only while the claim is still
    /// pending with `expected_failures` recorded; returns false otherwise.
    pub fn record_transient_failure(
        &self,
        claim_id: &str,
        expected_failures: u32,
        next_retry_at: DateTime<Utc>,
        reason: &str,
    ) -> LedgerResult<bool> {
        let changed = self.conn().execute(
            "UPDATE payment_claim
             SET transient_failures = transient_failures + 1,
                 next_retry_at = ?1,
                 verification_reason = ?2
             WHERE id = ?3 AND verification_status = 'pending' AND payment_status = 'pending'
               AND transient_failures = ?4",
            params![ts(next_retry_at), reason, claim_id, i64::from(expected_failures)],
        )?;
        Ok(changed == 1)
    }

    /// Conditional state transition: applies only if the claim is still in
    /// `from` with payment pending. Returns false if another writer got there first.
    pub fn transition_claim(
        &self,
        claim_id: &str,
        from: VerificationStatus,
        t: &ClaimTransition<'_>,
    ) -> LedgerResult<bool> {
        let data = t.data.map(serde_json::to_string).transpose()?;
        let changed = self.conn().execute(
            "UPDATE payment_claim
             SET verification_status = ?1,
                 payment_status = ?2,
                 verification_confidence = COALESCE(?3, verification_confidence),
                 verification_reason = ?4,
                 verification_data = COALESCE(?5, verification_data),
                 verified_by = COALESCE(?6, verified_by),
                 verified_at = COALESCE(?7, verified_at),
                 investment_id = COALESCE(?8, investment_id),
                 transient_failures = 0,
                 next_retry_at = NULL
             WHERE id = ?9 AND verification_status = ?10 AND payment_status = 'pending'",
            params![
                t.verification_status,
                t.payment_status,
                t.confidence.map(i64::from),
                t.reason,
                data,
                t.verified_by,
                opt_ts(t.verified_at),
                t.investment_id,
                claim_id,
                from,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Mark every unresolved claim past its expiry as expired/rejected.
    /// Returns the ids that changed.
    pub fn expire_stale_claims(&self, now: DateTime<Utc>) -> LedgerResult<Vec<EntityId>> {
        let ids: Vec<EntityId> = {
            let mut stmt = self.conn().prepare(
                "SELECT id FROM payment_claim
                 WHERE payment_status = 'pending'
                   AND verification_status IN ('pending', 'manual_review_required')
                   AND expires_at < ?1
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![ts(now)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        self.conn().execute(
            "UPDATE payment_claim
             SET payment_status = 'expired',
                 verification_status = 'rejected',
                 verification_reason = 'claim expired before verification completed',
                 next_retry_at = NULL
             WHERE payment_status = 'pending'
               AND verification_status IN ('pending', 'manual_review_required')
               AND expires_at < ?1",
            params![ts(now)],
        )?;
        Ok(ids)
    }

    // ── Verification attempts ─────────────────────────────────────

    pub fn next_attempt_no(&self, claim_id: &str) -> LedgerResult<u32> {
        let n: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(attempt_no), 0) + 1 FROM verification_attempt WHERE claim_id = ?1",
            params![claim_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn insert_attempt(&self, a: &VerificationAttempt) -> LedgerResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO verification_attempt ({ATTEMPT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                a.id,
                a.claim_id,
                i64::from(a.attempt_no),
                a.outcome,
                i64::from(a.confidence),
                serde_json::to_string(&a.checks)?,
                serde_json::to_string(&a.errors)?,
                a.on_chain.as_ref().map(serde_json::to_string).transpose()?,
                ts(a.created_at),
            ],
        )?;
        Ok(())
    }
}
