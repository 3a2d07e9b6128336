//! Commission engine: turns an approved investment into referral commissions.
//!
//! RULES:
//!   - The referral walk is bounded by `max_depth` and stops at the first user
//!     without a referrer.
//!   - A user seen twice during one walk aborts it with `ReferralCycle`; nothing
//!     is written.
//!   - All records for one investment land in one transaction, and a second
//!     distribution for the same investment writes nothing.

use crate::{
    clock::Clock,
    config::CommissionSchedule,
    error::{LedgerError, LedgerResult},
    models::CommissionRecord,
    store::{CommissionBalance, CommissionFilter, CommissionSummary, LedgerStore, LedgerTx},
    types::{round_cents, round_nft, CommissionStatus, UserId, AMOUNT_EPSILON},
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

pub struct CommissionEngine<'a> {
    store:    &'a LedgerStore,
    schedule: &'a CommissionSchedule,
    clock:    &'a dyn Clock,
}

impl<'a> CommissionEngine<'a> {
    pub fn new(store: &'a LedgerStore, schedule: &'a CommissionSchedule, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            schedule,
            clock,
        }
    }

    /// Post commissions for one investment in its own transaction.
    /// Returns the records written; empty if the investment was already paid out.
    pub fn distribute(
        &self,
        investment_id: &str,
        purchase_amount: f64,
        buyer_user_id: &str,
    ) -> LedgerResult<Vec<CommissionRecord>> {
        let tx = self.store.write_tx()?;
        let records = self.distribute_in(&tx, investment_id, purchase_amount, buyer_user_id)?;
        tx.commit()?;
        Ok(records)
    }

    /// Same as `distribute`, inside a transaction the caller commits.
    pub fn distribute_in(
        &self,
        tx: &LedgerTx<'_>,
        investment_id: &str,
        purchase_amount: f64,
        buyer_user_id: &str,
    ) -> LedgerResult<Vec<CommissionRecord>> {
        if !purchase_amount.is_finite() || purchase_amount <= 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "purchase amount must be positive, got {purchase_amount}"
            )));
        }
        if tx.commissions_exist_for_investment(investment_id)? {
            log::debug!("investment={investment_id} commissions: already distributed");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let chain = referral_chain(tx, buyer_user_id, self.schedule.max_depth)?;
        let mut records = Vec::with_capacity(chain.len());

        for (idx, referrer) in chain.into_iter().enumerate() {
            let level = idx + 1;
            let record = self.record_for_level(
                level,
                referrer,
                investment_id,
                purchase_amount,
                buyer_user_id,
                now,
            );
            if record.commission_usdt < AMOUNT_EPSILON && record.commission_nft < AMOUNT_EPSILON {
                continue;
            }
            tx.insert_commission(&record)?;
            records.push(record);
        }

        log::info!(
            "investment={investment_id} commissions: {} level(s) posted for buyer {buyer_user_id} on {purchase_amount:.2}",
            records.len()
        );
        Ok(records)
    }

    fn record_for_level(
        &self,
        level: usize,
        referrer: UserId,
        investment_id: &str,
        purchase_amount: f64,
        buyer_user_id: &str,
        now: DateTime<Utc>,
    ) -> CommissionRecord {
        let usdt = round_cents(purchase_amount * self.schedule.usdt_rate(level));
        let nft = round_nft(
            purchase_amount * self.schedule.nft_rate(level) / self.schedule.nft_unit_price_usd,
        );
        CommissionRecord {
            id: Uuid::new_v4().to_string(),
            referrer_user_id: referrer,
            referred_user_id: buyer_user_id.to_string(),
            level: level as u32,
            investment_id: investment_id.to_string(),
            purchase_amount,
            commission_usdt: usdt,
            commission_nft: nft,
            status: CommissionStatus::Pending,
            nft_settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store `referrer_id` as the direct referrer of `user_id`. A user is
    /// linked once; a link that would make the graph cyclic is refused.
    pub fn link_referral(&self, user_id: &str, referrer_id: &str) -> LedgerResult<()> {
        let (user_id, referrer_id) = (user_id.trim(), referrer_id.trim());
        if user_id.is_empty() || referrer_id.is_empty() {
            return Err(LedgerError::InvalidRequest("user_id and referrer_id are required".into()));
        }
        if user_id == referrer_id {
            return Err(LedgerError::ReferralCycle {
                user_id: user_id.to_string(),
            });
        }

        let tx = self.store.write_tx()?;
        if let Some(existing) = tx.referrer_of(user_id)? {
            return Err(LedgerError::InvalidRequest(format!(
                "user {user_id} is already referred by {existing}"
            )));
        }

        // Walk up from the new referrer; meeting `user_id` would close a loop.
        let mut seen = HashSet::new();
        let mut current = referrer_id.to_string();
        while let Some(next) = tx.referrer_of(&current)? {
            if next == user_id || !seen.insert(next.clone()) {
                return Err(LedgerError::ReferralCycle { user_id: next });
            }
            current = next;
        }

        tx.insert_referral_link(user_id, referrer_id, self.clock.now())?;
        tx.commit()?;
        log::info!("referral: {user_id} linked under {referrer_id}");
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn commission_ledger(&self, filter: &CommissionFilter) -> LedgerResult<Vec<CommissionRecord>> {
        self.store.commission_ledger(filter)
    }

    pub fn commission_summary(&self, referrer_user_id: Option<&str>) -> LedgerResult<CommissionSummary> {
        self.store.commission_summary(referrer_user_id)
    }

    pub fn commission_balance(&self, user_id: &str) -> LedgerResult<CommissionBalance> {
        self.store.commission_balance(user_id)
    }
}

/// Referrers of `buyer`, nearest first, at most `max_depth` of them.
fn referral_chain(tx: &LedgerTx<'_>, buyer: &str, max_depth: usize) -> LedgerResult<Vec<UserId>> {
    let mut seen: HashSet<UserId> = HashSet::from([buyer.to_string()]);
    let mut chain = Vec::with_capacity(max_depth);
    let mut current = buyer.to_string();

    while chain.len() < max_depth {
        let Some(referrer) = tx.referrer_of(&current)? else {
            break;
        };
        if !seen.insert(referrer.clone()) {
            log::warn!("commissions: referral cycle at {referrer} above buyer {buyer}");
            return Err(LedgerError::ReferralCycle { user_id: referrer });
        }
        chain.push(referrer.clone());
        current = referrer;
    }
    Ok(chain)
}
