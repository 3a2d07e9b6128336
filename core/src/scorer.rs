//! Confidence scoring: compares a claim against on-chain facts.
//!
//! Scoring is an ordered list of named checks. Each check passes or fails and
//! contributes its configured weight when it passes; the confidence is the sum.
//! Two rules can cap the sum one point below the auto-approval threshold:
//!   - the claimed amount exceeds the auto-approval ceiling
//!   - a check listed in `critical_checks` failed
//!
//! No I/O and no clock: the same inputs always produce the same card.

use crate::{config::VerificationPolicy, models::PaymentClaim, oracle::OnChainFact};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    SenderMatch,
    DestinationMatch,
    AmountMatch,
    Confirmations,
    TransactionAge,
    /// Gating only; carries no weight.
    AutoApprovalCeiling,
}

/// Evaluation order of the weighted checks.
pub const WEIGHTED_CHECKS: [CheckKind; 5] = [
    CheckKind::SenderMatch,
    CheckKind::DestinationMatch,
    CheckKind::AmountMatch,
    CheckKind::Confirmations,
    CheckKind::TransactionAge,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    pub weight: u32,
    pub awarded: u32,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreCard {
    pub confidence: u8,
    /// Sum of awarded weights before any cap.
    pub raw_score: u32,
    pub checks: Vec<CheckResult>,
    pub errors: Vec<String>,
    pub ceiling_exceeded: bool,
    pub capped: bool,
}

impl ScoreCard {
    pub fn meets_threshold(&self, policy: &VerificationPolicy) -> bool {
        self.confidence >= policy.confidence_threshold
    }
}

pub fn score(
    claim: &PaymentClaim,
    fact: Option<&OnChainFact>,
    policy: &VerificationPolicy,
) -> ScoreCard {
    let mut checks = Vec::with_capacity(WEIGHTED_CHECKS.len() + 1);
    let mut errors = Vec::new();

    match fact {
        Some(fact) => {
            for kind in WEIGHTED_CHECKS {
                let weight = policy.weights.weight_of(kind);
                let (passed, detail) = evaluate(kind, claim, fact, policy);
                checks.push(CheckResult {
                    check: kind,
                    passed,
                    weight,
                    awarded: if passed { weight } else { 0 },
                    detail,
                });
            }
        }
        None => {
            errors.push(format!(
                "transaction {} not found on {}",
                claim.transaction_hash, claim.chain
            ));
            for kind in WEIGHTED_CHECKS {
                checks.push(CheckResult {
                    check: kind,
                    passed: false,
                    weight: policy.weights.weight_of(kind),
                    awarded: 0,
                    detail: "not evaluated: no on-chain transaction".into(),
                });
            }
        }
    }

    let ceiling_exceeded = claim.claimed_amount_usd > policy.max_auto_amount;
    checks.push(CheckResult {
        check: CheckKind::AutoApprovalCeiling,
        passed: !ceiling_exceeded,
        weight: 0,
        awarded: 0,
        detail: format!(
            "claimed {:.2} vs ceiling {:.2}",
            claim.claimed_amount_usd, policy.max_auto_amount
        ),
    });

    let raw_score: u32 = checks.iter().map(|c| c.awarded).sum::<u32>().min(100);
    let critical_failed = checks
        .iter()
        .any(|c| !c.passed && policy.critical_checks.contains(&c.check));

    let cap = u32::from(policy.confidence_threshold.saturating_sub(1));
    let must_cap = ceiling_exceeded || critical_failed;
    let confidence = if must_cap { raw_score.min(cap) } else { raw_score };

    ScoreCard {
        confidence: confidence as u8,
        raw_score,
        checks,
        errors,
        ceiling_exceeded,
        capped: must_cap && raw_score > cap,
    }
}

fn evaluate(
    kind: CheckKind,
    claim: &PaymentClaim,
    fact: &OnChainFact,
    policy: &VerificationPolicy,
) -> (bool, String) {
    match kind {
        CheckKind::SenderMatch => {
            let passed = same_address(&claim.sender_wallet_address, &fact.from_address);
            (
                passed,
                format!(
                    "claimed sender {} vs on-chain {}",
                    claim.sender_wallet_address, fact.from_address
                ),
            )
        }
        CheckKind::DestinationMatch => {
            let passed = same_address(&claim.company_wallet_address, &fact.to_address);
            (
                passed,
                format!(
                    "company wallet {} vs on-chain {}",
                    claim.company_wallet_address, fact.to_address
                ),
            )
        }
        CheckKind::AmountMatch => {
            let claimed = claim.claimed_amount_usd;
            let diff_pct = if claimed > 0.0 {
                (fact.amount - claimed).abs() / claimed * 100.0
            } else {
                f64::INFINITY
            };
            // Small slack so a difference of exactly the tolerance passes.
            let passed = diff_pct <= policy.amount_tolerance_pct + 1e-9;
            (
                passed,
                format!(
                    "claimed {:.2} vs on-chain {:.2} ({:.3}% diff, tolerance {:.2}%)",
                    claimed, fact.amount, diff_pct, policy.amount_tolerance_pct
                ),
            )
        }
        CheckKind::Confirmations => {
            let required = policy.min_confirmations_for(&claim.chain);
            (
                fact.confirmations >= required,
                format!("{} confirmations, {} required", fact.confirmations, required),
            )
        }
        CheckKind::TransactionAge => {
            let earliest = claim.created_at - policy.max_tx_age();
            let passed = fact.block_time >= earliest && fact.block_time <= claim.expires_at;
            (
                passed,
                format!(
                    "block time {} within [{}, {}]",
                    fact.block_time.to_rfc3339(),
                    earliest.to_rfc3339(),
                    claim.expires_at.to_rfc3339()
                ),
            )
        }
        CheckKind::AutoApprovalCeiling => (true, String::new()),
    }
}

/// Addresses compare case-insensitively (EVM checksum casing is cosmetic).
fn same_address(claimed: &str, on_chain: &str) -> bool {
    let claimed = claimed.trim();
    !claimed.is_empty() && claimed.eq_ignore_ascii_case(on_chain.trim())
}
