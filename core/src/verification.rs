//! Verification engine: drives a payment claim through its state machine.
//!
//!   pending ──▶ auto_approved
//!      │   ──▶ manual_review_required ──▶ approved | rejected
//!      │   ──▶ rejected (expired)
//!      └─ transient oracle failure: stays pending, retried with backoff
//!
//! RULES:
//!   - The oracle is called before any transaction is opened.
//!   - Every transition is a conditional update on the expected prior state,
//!     so two workers verifying the same claim produce one outcome.
//!   - Approval creates the investment and the `payment_approved` outbox event
//!     in the same transaction as the status change.

use crate::{
    auth::{AdminContext, Capability},
    clock::Clock,
    config::VerificationPolicy,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    models::{Investment, NewPaymentClaim, PaymentClaim, VerificationAttempt, VerificationData},
    oracle::{ChainOracle, OnChainFact, OracleLookup},
    scorer::{self, ScoreCard},
    store::{ClaimTransition, LedgerStore, LedgerTx},
    types::{
        round_cents, EntityId, InvestmentSource, PaymentStatus, VerificationStatus, SYSTEM_ACTOR,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ORACLE_UNAVAILABLE: &str = "oracle unavailable";
const EXPIRED_REASON: &str = "claim expired before verification completed";

/// What one call to `verify` did to the claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    AutoApproved {
        confidence: u8,
        investment_id: EntityId,
    },
    ManualReview {
        confidence: Option<u8>,
        reason: String,
    },
    Rejected {
        confidence: u8,
        reason: String,
    },
    RetryScheduled {
        failures: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Another writer moved the claim first; nothing was changed.
    Superseded,
}

impl VerificationOutcome {
    pub fn status(&self) -> Option<VerificationStatus> {
        match self {
            Self::AutoApproved { .. } => Some(VerificationStatus::AutoApproved),
            Self::ManualReview { .. } => Some(VerificationStatus::ManualReviewRequired),
            Self::Rejected { .. } => Some(VerificationStatus::Rejected),
            Self::RetryScheduled { .. } => Some(VerificationStatus::Pending),
            Self::Superseded => None,
        }
    }
}

pub struct VerificationEngine<'a> {
    store:  &'a LedgerStore,
    policy: &'a VerificationPolicy,
    clock:  &'a dyn Clock,
    oracle: &'a dyn ChainOracle,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(
        store: &'a LedgerStore,
        policy: &'a VerificationPolicy,
        clock: &'a dyn Clock,
        oracle: &'a dyn ChainOracle,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
            oracle,
        }
    }

    /// Record a new claim. One on-chain transfer may back only one live claim.
    pub fn submit_claim(&self, new: NewPaymentClaim) -> LedgerResult<PaymentClaim> {
        validate_new_claim(&new)?;
        let now = self.clock.now();
        let claim = PaymentClaim {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            claimed_amount_usd: round_cents(new.claimed_amount_usd),
            chain: new.chain.trim().to_ascii_lowercase(),
            company_wallet_address: new.company_wallet_address.trim().to_string(),
            sender_wallet_address: new.sender_wallet_address.trim().to_string(),
            sender_name: new.sender_name,
            transaction_hash: new.transaction_hash.trim().to_string(),
            notes: new.notes,
            payment_status: PaymentStatus::Pending,
            verification_status: VerificationStatus::Pending,
            verification_confidence: None,
            verification_reason: None,
            verification_data: None,
            transient_failures: 0,
            next_retry_at: None,
            created_at: now,
            expires_at: now + self.policy.claim_ttl(),
            verified_by: None,
            verified_at: None,
            investment_id: None,
        };

        let tx = self.store.write_tx()?;
        if let Some(existing) = tx.live_claim_for_transaction(&claim.chain, &claim.transaction_hash)? {
            return Err(LedgerError::DuplicateTransaction {
                chain: claim.chain,
                tx_hash: claim.transaction_hash,
                claim_id: existing,
            });
        }
        tx.insert_claim(&claim)?;
        tx.commit()?;

        log::info!(
            "claim={} submitted: user={} amount={:.2} chain={}",
            claim.id,
            claim.user_id,
            claim.claimed_amount_usd,
            claim.chain
        );
        Ok(claim)
    }

    /// Run one verification attempt against a pending claim.
    pub fn verify(&self, claim_id: &str) -> LedgerResult<VerificationOutcome> {
        let claim = self.store.get_claim(claim_id)?;
        if claim.verification_status != VerificationStatus::Pending
            || claim.payment_status != PaymentStatus::Pending
        {
            return Err(LedgerError::InvalidStateTransition {
                entity: "payment_claim",
                id: claim.id,
                from: claim.verification_status.to_string(),
                to: "verifying".into(),
            });
        }

        // No transaction is open across this call.
        let lookup = self.oracle.fetch(&claim.chain, &claim.transaction_hash);
        let now = self.clock.now();

        match lookup {
            OracleLookup::Transient(reason) => self.on_transient(&claim, &reason, now),
            OracleLookup::NotFound => {
                let card = scorer::score(&claim, None, self.policy);
                self.on_scored(&claim, None, card, now)
            }
            OracleLookup::Found(fact) => {
                let card = scorer::score(&claim, Some(&fact), self.policy);
                self.on_scored(&claim, Some(fact), card, now)
            }
        }
    }

    fn on_transient(
        &self,
        claim: &PaymentClaim,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<VerificationOutcome> {
        let failures = claim.transient_failures + 1;
        log::warn!(
            "claim={} verify: oracle transient failure {failures}/{}: {reason}",
            claim.id,
            self.policy.max_transient_retries
        );

        let tx = self.store.write_tx()?;
        if failures >= self.policy.max_transient_retries {
            let moved = tx.transition_claim(
                &claim.id,
                VerificationStatus::Pending,
                &ClaimTransition {
                    verification_status: VerificationStatus::ManualReviewRequired,
                    payment_status: PaymentStatus::Pending,
                    confidence: None,
                    reason: ORACLE_UNAVAILABLE,
                    data: None,
                    verified_by: None,
                    verified_at: None,
                    investment_id: None,
                },
            )?;
            if !moved {
                return Ok(VerificationOutcome::Superseded);
            }
            tx.commit()?;
            log::warn!(
                "claim={} verify: retries exhausted, sent to manual review",
                claim.id
            );
            return Ok(VerificationOutcome::ManualReview {
                confidence: None,
                reason: ORACLE_UNAVAILABLE.into(),
            });
        }

        let next_retry_at = now + self.policy.retry_delay(failures);
        let recorded = tx.record_transient_failure(
            &claim.id,
            claim.transient_failures,
            next_retry_at,
            "blockchain lookup failed; retry scheduled",
        )?;
        if !recorded {
            return Ok(VerificationOutcome::Superseded);
        }
        tx.commit()?;
        Ok(VerificationOutcome::RetryScheduled {
            failures,
            next_retry_at,
        })
    }

    fn on_scored(
        &self,
        claim: &PaymentClaim,
        on_chain: Option<OnChainFact>,
        card: ScoreCard,
        now: DateTime<Utc>,
    ) -> LedgerResult<VerificationOutcome> {
        let auto = card.meets_threshold(self.policy) && !card.ceiling_exceeded;
        let (status, payment_status, reason) = if auto {
            (
                VerificationStatus::AutoApproved,
                PaymentStatus::Completed,
                format!(
                    "confidence {} meets threshold {}",
                    card.confidence, self.policy.confidence_threshold
                ),
            )
        } else if claim.expires_at < now {
            (
                VerificationStatus::Rejected,
                PaymentStatus::Expired,
                EXPIRED_REASON.to_string(),
            )
        } else if card.ceiling_exceeded {
            (
                VerificationStatus::ManualReviewRequired,
                PaymentStatus::Pending,
                format!(
                    "amount {:.2} exceeds auto-approval ceiling {:.2}",
                    claim.claimed_amount_usd, self.policy.max_auto_amount
                ),
            )
        } else {
            (
                VerificationStatus::ManualReviewRequired,
                PaymentStatus::Pending,
                format!(
                    "confidence {} below threshold {}",
                    card.confidence, self.policy.confidence_threshold
                ),
            )
        };

        let data = VerificationData {
            on_chain,
            checks: card.checks,
            errors: card.errors,
            confidence: card.confidence,
            ceiling_exceeded: card.ceiling_exceeded,
        };

        let tx = self.store.write_tx()?;
        let investment_id = auto.then(|| Uuid::new_v4().to_string());
        let moved = tx.transition_claim(
            &claim.id,
            VerificationStatus::Pending,
            &ClaimTransition {
                verification_status: status,
                payment_status,
                confidence: Some(card.confidence),
                reason: &reason,
                data: Some(&data),
                verified_by: auto.then_some(SYSTEM_ACTOR),
                verified_at: auto.then_some(now),
                investment_id: investment_id.as_deref(),
            },
        )?;
        if !moved {
            log::debug!("claim={} verify: superseded by another writer", claim.id);
            return Ok(VerificationOutcome::Superseded);
        }

        tx.insert_attempt(&VerificationAttempt {
            id: Uuid::new_v4().to_string(),
            claim_id: claim.id.clone(),
            attempt_no: tx.next_attempt_no(&claim.id)?,
            outcome: status,
            confidence: card.confidence,
            checks: data.checks.clone(),
            errors: data.errors.clone(),
            on_chain: data.on_chain.clone(),
            created_at: now,
        })?;

        if let Some(investment_id) = &investment_id {
            record_approval(&tx, claim, investment_id, SYSTEM_ACTOR, now)?;
        }
        tx.commit()?;

        log::info!(
            "claim={} verify: {status} (confidence={}, raw={})",
            claim.id,
            card.confidence,
            card.raw_score
        );

        Ok(match status {
            VerificationStatus::AutoApproved => VerificationOutcome::AutoApproved {
                confidence: card.confidence,
                investment_id: investment_id.unwrap_or_default(),
            },
            VerificationStatus::Rejected => VerificationOutcome::Rejected {
                confidence: card.confidence,
                reason,
            },
            _ => VerificationOutcome::ManualReview {
                confidence: Some(card.confidence),
                reason,
            },
        })
    }

    // ── Admin review ──────────────────────────────────────────────

    pub fn approve_claim(
        &self,
        admin: &AdminContext,
        claim_id: &str,
        notes: Option<&str>,
    ) -> LedgerResult<PaymentClaim> {
        admin.require(Capability::ReviewPayments)?;
        let now = self.clock.now();
        let tx = self.store.write_tx()?;
        let claim = tx.get_claim(claim_id)?;
        ensure_reviewable(&claim, now, VerificationStatus::Approved)?;

        let investment_id = Uuid::new_v4().to_string();
        let reason = notes.map_or_else(
            || format!("approved by {}", admin.admin_id),
            |n| format!("approved by {}: {n}", admin.admin_id),
        );
        let moved = tx.transition_claim(
            claim_id,
            VerificationStatus::ManualReviewRequired,
            &ClaimTransition {
                verification_status: VerificationStatus::Approved,
                payment_status: PaymentStatus::Completed,
                confidence: None,
                reason: &reason,
                data: None,
                verified_by: Some(&admin.admin_id),
                verified_at: Some(now),
                investment_id: Some(&investment_id),
            },
        )?;
        if !moved {
            return Err(conflict(&claim, VerificationStatus::Approved));
        }
        record_approval(&tx, &claim, &investment_id, &admin.admin_id, now)?;
        tx.commit()?;

        log::info!("claim={claim_id} review: approved by {}", admin.admin_id);
        self.store.get_claim(claim_id)
    }

    pub fn reject_claim(
        &self,
        admin: &AdminContext,
        claim_id: &str,
        reason: &str,
    ) -> LedgerResult<PaymentClaim> {
        admin.require(Capability::ReviewPayments)?;
        let now = self.clock.now();
        let tx = self.store.write_tx()?;
        let claim = tx.get_claim(claim_id)?;
        ensure_reviewable(&claim, now, VerificationStatus::Rejected)?;

        let moved = tx.transition_claim(
            claim_id,
            VerificationStatus::ManualReviewRequired,
            &ClaimTransition {
                verification_status: VerificationStatus::Rejected,
                payment_status: PaymentStatus::Failed,
                confidence: None,
                reason,
                data: None,
                verified_by: Some(&admin.admin_id),
                verified_at: Some(now),
                investment_id: None,
            },
        )?;
        if !moved {
            return Err(conflict(&claim, VerificationStatus::Rejected));
        }
        tx.commit()?;

        log::info!("claim={claim_id} review: rejected by {}", admin.admin_id);
        self.store.get_claim(claim_id)
    }

    // ── Sweeps ────────────────────────────────────────────────────

    /// Persist the expiry of every unresolved claim past `expires_at`.
    pub fn expire_stale_claims(&self) -> LedgerResult<Vec<EntityId>> {
        let now = self.clock.now();
        let tx = self.store.write_tx()?;
        let expired = tx.expire_stale_claims(now)?;
        tx.commit()?;
        if !expired.is_empty() {
            log::info!("sweep: expired {} claim(s)", expired.len());
        }
        Ok(expired)
    }

    /// Verify pending claims that are due: never attempted, or past their
    /// retry backoff. A claim another worker resolved meanwhile is skipped.
    pub fn retry_due_verifications(
        &self,
        limit: usize,
    ) -> LedgerResult<Vec<(EntityId, VerificationOutcome)>> {
        let due = self
            .store
            .claims_ready_for_verification(self.clock.now(), limit)?;
        let mut outcomes = Vec::with_capacity(due.len());
        for claim_id in due {
            match self.verify(&claim_id) {
                Ok(outcome) => outcomes.push((claim_id, outcome)),
                Err(LedgerError::InvalidStateTransition { .. }) => {
                    outcomes.push((claim_id, VerificationOutcome::Superseded))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }
}

/// Investment row plus outbox event for an approved claim. Runs inside the
/// approving transaction.
fn record_approval(
    tx: &LedgerTx<'_>,
    claim: &PaymentClaim,
    investment_id: &str,
    approved_by: &str,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    tx.insert_investment(&Investment {
        id: investment_id.to_string(),
        user_id: claim.user_id.clone(),
        amount_usd: claim.claimed_amount_usd,
        source: InvestmentSource::PaymentClaim,
        source_id: claim.id.clone(),
        created_at: now,
    })?;

    let event = LedgerEvent::PaymentApproved {
        claim_id: claim.id.clone(),
        investment_id: investment_id.to_string(),
        buyer_user_id: claim.user_id.clone(),
        purchase_amount: claim.claimed_amount_usd,
        approved_by: approved_by.to_string(),
    };
    let appended = tx.append_event(
        event.event_type(),
        event.aggregate_id(),
        &serde_json::to_string(&event)?,
        now,
    )?;
    if !appended {
        return Err(conflict(claim, VerificationStatus::Approved));
    }
    Ok(())
}

fn ensure_reviewable(
    claim: &PaymentClaim,
    now: DateTime<Utc>,
    to: VerificationStatus,
) -> LedgerResult<()> {
    if claim.verification_status != VerificationStatus::ManualReviewRequired
        || claim.effective_payment_status(now) != PaymentStatus::Pending
    {
        return Err(conflict(claim, to));
    }
    Ok(())
}

fn conflict(claim: &PaymentClaim, to: VerificationStatus) -> LedgerError {
    LedgerError::InvalidStateTransition {
        entity: "payment_claim",
        id: claim.id.clone(),
        from: claim.verification_status.to_string(),
        to: to.to_string(),
    }
}

fn validate_new_claim(new: &NewPaymentClaim) -> LedgerResult<()> {
    if !new.claimed_amount_usd.is_finite() || round_cents(new.claimed_amount_usd) <= 0.0 {
        return Err(LedgerError::InvalidRequest(format!(
            "claimed amount must be positive, got {}",
            new.claimed_amount_usd
        )));
    }
    let required = [
        ("user_id", &new.user_id),
        ("chain", &new.chain),
        ("transaction_hash", &new.transaction_hash),
        ("company_wallet_address", &new.company_wallet_address),
        ("sender_wallet_address", &new.sender_wallet_address),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(LedgerError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}
