//! Withdrawal engine: converts unpaid commission balance into payout requests.
//!
//!   pending ──▶ processing ──▶ completed | failed
//!      └──────────┴──────────▶ cancelled
//!
//! A request reserves commission value by allocating it oldest-first to the
//! request (`withdrawal_allocation`). Allocations count against the balance
//! while the request is pending, processing or completed; a failed or
//! cancelled request releases them. A commission record turns `paid` once
//! completed withdrawals cover all of it.
//!
//! RULES:
//!   - Balance check and reservation run in one `BEGIN IMMEDIATE` transaction,
//!     so two requests for the same balance are serialized.
//!   - An insufficient balance changes nothing.

use crate::{
    auth::{AdminContext, Capability},
    clock::Clock,
    config::WithdrawalPolicy,
    error::{LedgerError, LedgerResult},
    models::{CommissionAvailability, Investment, WithdrawalAllocation, WithdrawalRequest},
    store::{LedgerStore, LedgerTx, WithdrawalFilter, WithdrawalSummary, WithdrawalUpdate},
    types::{
        round_cents, round_nft, InvestmentSource, WithdrawalStatus, WithdrawalType, AMOUNT_EPSILON,
        SYSTEM_ACTOR,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator decision on a withdrawal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Processing,
    Completed { transaction_hash: String },
    Failed { notes: String },
    Cancelled { notes: String },
}

impl Resolution {
    fn target(&self) -> WithdrawalStatus {
        match self {
            Resolution::Processing => WithdrawalStatus::Processing,
            Resolution::Completed { .. } => WithdrawalStatus::Completed,
            Resolution::Failed { .. } => WithdrawalStatus::Failed,
            Resolution::Cancelled { .. } => WithdrawalStatus::Cancelled,
        }
    }
}

fn transition_allowed(from: WithdrawalStatus, to: WithdrawalStatus) -> bool {
    use WithdrawalStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Pending, Cancelled)
            | (Processing, Cancelled)
    )
}

pub struct WithdrawalEngine<'a> {
    store:  &'a LedgerStore,
    policy: &'a WithdrawalPolicy,
    clock:  &'a dyn Clock,
}

impl<'a> WithdrawalEngine<'a> {
    pub fn new(store: &'a LedgerStore, policy: &'a WithdrawalPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    /// Reserve commission balance for a payout. `amount_or_quantity` is USDT
    /// for `usdt`/`reinvest` and a whole NFT count for `nft`. Reinvest
    /// requests complete immediately and become new investment principal.
    pub fn request(
        &self,
        user_id: &str,
        withdrawal_type: WithdrawalType,
        amount_or_quantity: f64,
        wallet_address: Option<&str>,
    ) -> LedgerResult<WithdrawalRequest> {
        let wallet_address = wallet_address.map(str::trim).filter(|w| !w.is_empty());
        let (usdt, nft_quantity) =
            self.validate_request(withdrawal_type, amount_or_quantity, wallet_address)?;
        let now = self.clock.now();

        let tx = self.store.write_tx()?;
        if withdrawal_type != WithdrawalType::Reinvest
            && tx.open_withdrawal_count(user_id)? >= self.policy.max_open_requests
        {
            return Err(LedgerError::InvalidRequest(format!(
                "at most {} open withdrawal requests are allowed",
                self.policy.max_open_requests
            )));
        }

        let available = tx.commission_availability(user_id)?;
        let requested = match withdrawal_type {
            WithdrawalType::Nft => f64::from(nft_quantity),
            _ => usdt,
        };
        let balance = match withdrawal_type {
            WithdrawalType::Nft => round_nft(available.iter().map(|a| a.unreserved_nft).sum()),
            _ => round_cents(available.iter().map(|a| a.unreserved_usdt).sum()),
        };
        if requested > balance + AMOUNT_EPSILON {
            log::info!(
                "withdrawal: {user_id} requested {requested} {withdrawal_type}, available {balance}"
            );
            return Err(LedgerError::InsufficientBalance {
                requested,
                available: balance,
            });
        }

        let reinvest = withdrawal_type == WithdrawalType::Reinvest;
        let request = WithdrawalRequest {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            withdrawal_type,
            amount: usdt,
            nft_quantity,
            wallet_address: wallet_address.map(str::to_string),
            transaction_hash: None,
            status: if reinvest {
                WithdrawalStatus::Completed
            } else {
                WithdrawalStatus::Pending
            },
            admin_notes: None,
            requested_at: now,
            processed_at: reinvest.then_some(now),
            processed_by: reinvest.then(|| SYSTEM_ACTOR.to_string()),
        };
        tx.insert_withdrawal(&request)?;
        allocate(&tx, &request, &available, requested)?;

        if reinvest {
            tx.insert_investment(&Investment {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                amount_usd: usdt,
                source: InvestmentSource::Reinvest,
                source_id: request.id.clone(),
                created_at: now,
            })?;
            tx.settle_commissions_for_withdrawal(&request.id, now)?;
        }
        tx.commit()?;

        log::info!(
            "withdrawal={} requested: user={user_id} type={withdrawal_type} amount={:.2} nft={} status={}",
            request.id,
            request.amount,
            request.nft_quantity,
            request.status
        );
        Ok(request)
    }

    fn validate_request(
        &self,
        withdrawal_type: WithdrawalType,
        amount_or_quantity: f64,
        wallet_address: Option<&str>,
    ) -> LedgerResult<(f64, u32)> {
        // Cash amounts are judged after rounding to cents.
        let rounded = match withdrawal_type {
            WithdrawalType::Nft => amount_or_quantity,
            _ => round_cents(amount_or_quantity),
        };
        if !amount_or_quantity.is_finite() || rounded <= 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "amount must be positive, got {amount_or_quantity}"
            )));
        }
        if withdrawal_type != WithdrawalType::Reinvest && wallet_address.is_none() {
            return Err(LedgerError::InvalidRequest(format!(
                "{withdrawal_type} withdrawals require a wallet address"
            )));
        }
        match withdrawal_type {
            WithdrawalType::Nft => {
                if amount_or_quantity.fract() != 0.0 || amount_or_quantity > f64::from(u32::MAX) {
                    return Err(LedgerError::InvalidRequest(format!(
                        "NFT quantity must be a whole number, got {amount_or_quantity}"
                    )));
                }
                Ok((0.0, amount_or_quantity as u32))
            }
            WithdrawalType::Usdt => {
                let amount = rounded;
                if amount + AMOUNT_EPSILON < self.policy.min_usdt_amount {
                    return Err(LedgerError::InvalidRequest(format!(
                        "minimum USDT withdrawal is {:.2}",
                        self.policy.min_usdt_amount
                    )));
                }
                Ok((amount, 0))
            }
            WithdrawalType::Reinvest => Ok((rounded, 0)),
        }
    }

    /// Operator resolution. Completing settles the commissions it covered;
    /// failing or cancelling releases the reservation.
    pub fn process(
        &self,
        admin: &AdminContext,
        withdrawal_id: &str,
        resolution: Resolution,
    ) -> LedgerResult<WithdrawalRequest> {
        admin.require(Capability::ResolveWithdrawals)?;
        let now = self.clock.now();
        let tx = self.store.write_tx()?;
        let current = tx.get_withdrawal(withdrawal_id)?;
        let to = resolution.target();

        let update = match &resolution {
            Resolution::Processing => WithdrawalUpdate::default(),
            Resolution::Completed { transaction_hash } => {
                if transaction_hash.trim().is_empty() {
                    return Err(LedgerError::InvalidRequest(
                        "completing a withdrawal requires the payout transaction hash".into(),
                    ));
                }
                WithdrawalUpdate {
                    transaction_hash: Some(transaction_hash.trim()),
                    processed_at: Some(now),
                    processed_by: Some(&admin.admin_id),
                    ..WithdrawalUpdate::default()
                }
            }
            Resolution::Failed { notes } | Resolution::Cancelled { notes } => WithdrawalUpdate {
                admin_notes: Some(notes.as_str()),
                processed_at: Some(now),
                processed_by: Some(&admin.admin_id),
                ..WithdrawalUpdate::default()
            },
        };
        self.apply(&tx, &current, to, &update, now)?;
        tx.commit()?;

        log::info!(
            "withdrawal={withdrawal_id} {} -> {to} by {}",
            current.status,
            admin.admin_id
        );
        self.store.get_withdrawal(withdrawal_id)
    }

    /// Owner cancellation while the request is still open.
    pub fn cancel(&self, user_id: &str, withdrawal_id: &str) -> LedgerResult<WithdrawalRequest> {
        let now = self.clock.now();
        let tx = self.store.write_tx()?;
        let current = tx.get_withdrawal(withdrawal_id)?;
        if current.user_id != user_id {
            return Err(LedgerError::NotFound {
                entity: "withdrawal_request",
                id: withdrawal_id.to_string(),
            });
        }
        let update = WithdrawalUpdate {
            admin_notes: Some("cancelled by user"),
            processed_at: Some(now),
            processed_by: Some(user_id),
            ..WithdrawalUpdate::default()
        };
        self.apply(&tx, &current, WithdrawalStatus::Cancelled, &update, now)?;
        tx.commit()?;

        log::info!("withdrawal={withdrawal_id} cancelled by owner {user_id}");
        self.store.get_withdrawal(withdrawal_id)
    }

    fn apply(
        &self,
        tx: &LedgerTx<'_>,
        current: &WithdrawalRequest,
        to: WithdrawalStatus,
        update: &WithdrawalUpdate<'_>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let conflict = || LedgerError::InvalidStateTransition {
            entity: "withdrawal_request",
            id: current.id.clone(),
            from: current.status.to_string(),
            to: to.to_string(),
        };
        if !transition_allowed(current.status, to) {
            return Err(conflict());
        }
        if !tx.transition_withdrawal(&current.id, current.status, to, update)? {
            return Err(conflict());
        }
        if to == WithdrawalStatus::Completed {
            let settled = tx.settle_commissions_for_withdrawal(&current.id, now)?;
            log::debug!(
                "withdrawal={} settled {} commission record(s)",
                current.id,
                settled.len()
            );
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn list_withdrawals(&self, filter: &WithdrawalFilter) -> LedgerResult<Vec<WithdrawalRequest>> {
        self.store.list_withdrawals(filter)
    }

    pub fn withdrawal_summary(&self, user_id: Option<&str>) -> LedgerResult<WithdrawalSummary> {
        self.store.withdrawal_summary(user_id)
    }
}

/// Reserve `requested` against the user's commissions, oldest first.
fn allocate(
    tx: &LedgerTx<'_>,
    request: &WithdrawalRequest,
    available: &[CommissionAvailability],
    requested: f64,
) -> LedgerResult<()> {
    let nft = request.withdrawal_type == WithdrawalType::Nft;
    let mut remaining = requested;

    for slot in available {
        if remaining <= AMOUNT_EPSILON {
            break;
        }
        let free = if nft { slot.unreserved_nft } else { slot.unreserved_usdt };
        let take = remaining.min(free);
        if take <= AMOUNT_EPSILON {
            continue;
        }
        tx.insert_allocation(&WithdrawalAllocation {
            withdrawal_id: request.id.clone(),
            commission_id: slot.commission_id.clone(),
            usdt: if nft { 0.0 } else { take },
            nft: if nft { take } else { 0.0 },
        })?;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_transitions_are_allowed() {
        use WithdrawalStatus::*;
        assert!(transition_allowed(Pending, Processing));
        assert!(transition_allowed(Processing, Completed));
        assert!(transition_allowed(Processing, Cancelled));
        assert!(!transition_allowed(Pending, Completed));
        assert!(!transition_allowed(Completed, Cancelled));
        assert!(!transition_allowed(Failed, Processing));
    }
}
