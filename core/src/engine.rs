//! The payment engine: wires store, config, clock and oracle together.
//!
//! FLOW:
//!   1. submit_claim      → claim stored as pending
//!   2. verify_claim      → oracle + scorer decide; approval writes an outbox event
//!   3. drain_approvals   → each approval event is turned into commissions
//!   4. withdrawals       → users convert unpaid commission into payouts
//!
//! RULES:
//!   - Engines never share a connection across threads. Use `reopen()` to get
//!     an engine on a fresh connection to the same database.
//!   - An outbox event is consumed in the same transaction as the commissions
//!     it produces, so each approval is distributed exactly once.

use crate::{
    auth::{AdminContext, Capability},
    clock::{Clock, ManualClock},
    commission::CommissionEngine,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    event::{LedgerEvent, PAYMENT_APPROVED},
    models::{
        CommissionRecord, NewPaymentClaim, PaymentClaim, VerificationAttempt, WithdrawalRequest,
    },
    oracle::{ChainOracle, StaticOracle},
    store::{
        CommissionBalance, CommissionFilter, CommissionSummary, LedgerStore, VerificationStats,
        WithdrawalFilter, WithdrawalSummary,
    },
    types::{EntityId, WithdrawalType},
    verification::{VerificationEngine, VerificationOutcome},
    withdrawal::{Resolution, WithdrawalEngine},
};
use serde::Serialize;
use std::sync::Arc;

/// Events handled per `drain_approvals` call.
pub const DRAIN_BATCH: usize = 500;
/// Claims verified per sweep.
pub const SWEEP_BATCH: usize = 200;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub consumed:           usize,
    pub commissions_posted: usize,
    /// Claim id and reason for approvals left unconsumed.
    pub failed:             Vec<(EntityId, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired:  Vec<EntityId>,
    pub verified: Vec<(EntityId, VerificationOutcome)>,
    pub drained:  DrainReport,
}

pub struct PaymentEngine {
    store:  LedgerStore,
    config: EngineConfig,
    clock:  Arc<dyn Clock>,
    oracle: Arc<dyn ChainOracle>,
}

impl PaymentEngine {
    /// The store must already be migrated.
    pub fn new(
        store: LedgerStore,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        oracle: Arc<dyn ChainOracle>,
    ) -> LedgerResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock,
            oracle,
        })
    }

    /// In-memory engine with test config, driven by the given clock and oracle.
    pub fn build_test(clock: Arc<ManualClock>, oracle: Arc<StaticOracle>) -> LedgerResult<Self> {
        let store = LedgerStore::in_memory()?;
        store.migrate()?;
        Self::new(store, EngineConfig::default_test(), clock, oracle)
    }

    /// Same configuration, clock and oracle on a new connection.
    pub fn reopen(&self) -> LedgerResult<Self> {
        Ok(Self {
            store: self.store.reopen()?,
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            oracle: Arc::clone(&self.oracle),
        })
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn verification(&self) -> VerificationEngine<'_> {
        VerificationEngine::new(
            &self.store,
            &self.config.verification,
            &*self.clock,
            &*self.oracle,
        )
    }

    pub fn commissions(&self) -> CommissionEngine<'_> {
        CommissionEngine::new(&self.store, &self.config.commission, &*self.clock)
    }

    pub fn withdrawals(&self) -> WithdrawalEngine<'_> {
        WithdrawalEngine::new(&self.store, &self.config.withdrawal, &*self.clock)
    }

    // ── Claims ────────────────────────────────────────────────────

    pub fn submit_claim(&self, new: NewPaymentClaim) -> LedgerResult<PaymentClaim> {
        self.verification().submit_claim(new)
    }

    /// Verify one claim, then distribute commissions for any approval.
    pub fn verify_claim(&self, claim_id: &str) -> LedgerResult<VerificationOutcome> {
        let outcome = self.verification().verify(claim_id)?;
        if matches!(outcome, VerificationOutcome::AutoApproved { .. }) {
            self.drain_approvals()?;
        }
        Ok(outcome)
    }

    pub fn approve_claim(
        &self,
        admin: &AdminContext,
        claim_id: &str,
        notes: Option<&str>,
    ) -> LedgerResult<PaymentClaim> {
        let claim = self.verification().approve_claim(admin, claim_id, notes)?;
        self.drain_approvals()?;
        Ok(claim)
    }

    pub fn reject_claim(
        &self,
        admin: &AdminContext,
        claim_id: &str,
        reason: &str,
    ) -> LedgerResult<PaymentClaim> {
        self.verification().reject_claim(admin, claim_id, reason)
    }

    pub fn get_claim(&self, claim_id: &str) -> LedgerResult<PaymentClaim> {
        self.store.get_claim(claim_id)
    }

    // ── Outbox ────────────────────────────────────────────────────

    /// Consume pending `payment_approved` events. An event whose referral walk
    /// fails stays in the outbox for the next drain.
    pub fn drain_approvals(&self) -> LedgerResult<DrainReport> {
        let mut report = DrainReport::default();
        let commissions = self.commissions();

        for row in self.store.unconsumed_events(PAYMENT_APPROVED, DRAIN_BATCH)? {
            let event: LedgerEvent = serde_json::from_str(&row.payload)?;
            let LedgerEvent::PaymentApproved {
                claim_id,
                investment_id,
                buyer_user_id,
                purchase_amount,
                ..
            } = event;

            let tx = self.store.write_tx()?;
            if !tx.mark_event_consumed(row.id, self.clock.now())? {
                // Another worker took it.
                continue;
            }
            match commissions.distribute_in(&tx, &investment_id, purchase_amount, &buyer_user_id) {
                Ok(records) => {
                    tx.commit()?;
                    report.consumed += 1;
                    report.commissions_posted += records.len();
                }
                Err(e @ LedgerError::ReferralCycle { .. }) => {
                    log::error!("claim={claim_id} commissions: {e}; approval left in outbox");
                    report.failed.push((claim_id, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        if report.consumed > 0 {
            log::info!(
                "outbox: consumed {} approval(s), posted {} commission(s)",
                report.consumed,
                report.commissions_posted
            );
        }
        Ok(report)
    }

    /// Expire stale claims, verify due ones, distribute approvals.
    pub fn run_sweep(&self, admin: &AdminContext) -> LedgerResult<SweepReport> {
        admin.require(Capability::RunSweeps)?;
        let verification = self.verification();
        let expired = verification.expire_stale_claims()?;
        let verified = verification.retry_due_verifications(SWEEP_BATCH)?;
        let drained = self.drain_approvals()?;
        log::info!(
            "sweep by {}: expired={} verified={} drained={}",
            admin.admin_id,
            expired.len(),
            verified.len(),
            drained.consumed
        );
        Ok(SweepReport {
            expired,
            verified,
            drained,
        })
    }

    // ── Commissions ───────────────────────────────────────────────

    pub fn link_referral(&self, user_id: &str, referrer_id: &str) -> LedgerResult<()> {
        self.commissions().link_referral(user_id, referrer_id)
    }

    pub fn commission_ledger(&self, filter: &CommissionFilter) -> LedgerResult<Vec<CommissionRecord>> {
        self.commissions().commission_ledger(filter)
    }

    pub fn commission_summary(&self, referrer_user_id: Option<&str>) -> LedgerResult<CommissionSummary> {
        self.commissions().commission_summary(referrer_user_id)
    }

    pub fn commission_balance(&self, user_id: &str) -> LedgerResult<CommissionBalance> {
        self.commissions().commission_balance(user_id)
    }

    // ── Withdrawals ───────────────────────────────────────────────

    pub fn request_withdrawal(
        &self,
        user_id: &str,
        withdrawal_type: WithdrawalType,
        amount_or_quantity: f64,
        wallet_address: Option<&str>,
    ) -> LedgerResult<WithdrawalRequest> {
        self.withdrawals()
            .request(user_id, withdrawal_type, amount_or_quantity, wallet_address)
    }

    pub fn process_withdrawal(
        &self,
        admin: &AdminContext,
        withdrawal_id: &str,
        resolution: Resolution,
    ) -> LedgerResult<WithdrawalRequest> {
        self.withdrawals().process(admin, withdrawal_id, resolution)
    }

    pub fn cancel_withdrawal(&self, user_id: &str, withdrawal_id: &str) -> LedgerResult<WithdrawalRequest> {
        self.withdrawals().cancel(user_id, withdrawal_id)
    }

    pub fn list_withdrawals(&self, filter: &WithdrawalFilter) -> LedgerResult<Vec<WithdrawalRequest>> {
        self.withdrawals().list_withdrawals(filter)
    }

    pub fn withdrawal_summary(&self, user_id: Option<&str>) -> LedgerResult<WithdrawalSummary> {
        self.withdrawals().withdrawal_summary(user_id)
    }

    // ── Reporting ─────────────────────────────────────────────────

    /// Claim activity over the trailing `window_hours`.
    pub fn verification_stats(&self, window_hours: i64, recent_limit: usize) -> LedgerResult<VerificationStats> {
        let since = self.clock.now() - chrono::Duration::hours(window_hours.max(0));
        self.store.verification_stats(since, recent_limit)
    }

    pub fn verification_attempts(&self, claim_id: &str) -> LedgerResult<Vec<VerificationAttempt>> {
        self.store.attempts_for_claim(claim_id)
    }
}
