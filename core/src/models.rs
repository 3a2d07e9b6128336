//! Ledger records as the engines see them.

use crate::{
    oracle::OnChainFact,
    scorer::CheckResult,
    types::{
        CommissionStatus, EntityId, InvestmentSource, PaymentStatus, UserId, VerificationStatus,
        WithdrawalStatus, WithdrawalType,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Payment claims ────────────────────────────────────────────────

/// A user's assertion that an on-chain transfer pays for a purchase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentClaim {
    pub id: EntityId,
    pub user_id: UserId,
    pub claimed_amount_usd: f64,
    pub chain: String,
    pub company_wallet_address: String,
    pub sender_wallet_address: String,
    pub sender_name: Option<String>,
    pub transaction_hash: String,
    pub notes: Option<String>,
    pub payment_status: PaymentStatus,
    pub verification_status: VerificationStatus,
    /// None until a verification attempt completes.
    pub verification_confidence: Option<u8>,
    pub verification_reason: Option<String>,
    pub verification_data: Option<VerificationData>,
    /// Consecutive oracle outages since the last completed attempt.
    pub transient_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Admin id, or "system" for automatic approval.
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Investment created when the claim was approved.
    pub investment_id: Option<EntityId>,
}

impl PaymentClaim {
    /// Stored status, except a stale pending claim reads as expired even
    /// before the sweep has rewritten it.
    pub fn effective_payment_status(&self, now: DateTime<Utc>) -> PaymentStatus {
        if self.payment_status == PaymentStatus::Pending && self.expires_at < now {
            PaymentStatus::Expired
        } else {
            self.payment_status
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_payment_status(now) == PaymentStatus::Expired
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPaymentClaim {
    pub user_id: UserId,
    pub claimed_amount_usd: f64,
    pub chain: String,
    pub company_wallet_address: String,
    pub sender_wallet_address: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub transaction_hash: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Structured evidence stored on the claim after each completed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationData {
    pub on_chain: Option<OnChainFact>,
    pub checks: Vec<CheckResult>,
    pub errors: Vec<String>,
    pub confidence: u8,
    pub ceiling_exceeded: bool,
}

/// One completed verification attempt (transient oracle failures are not attempts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationAttempt {
    pub id: EntityId,
    pub claim_id: EntityId,
    pub attempt_no: u32,
    pub outcome: VerificationStatus,
    pub confidence: u8,
    pub checks: Vec<CheckResult>,
    pub errors: Vec<String>,
    pub on_chain: Option<OnChainFact>,
    pub created_at: DateTime<Utc>,
}

// ── Investments ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Investment {
    pub id: EntityId,
    pub user_id: UserId,
    pub amount_usd: f64,
    pub source: InvestmentSource,
    /// Claim id or withdrawal id that produced this investment.
    pub source_id: EntityId,
    pub created_at: DateTime<Utc>,
}

// ── Commissions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommissionRecord {
    pub id: EntityId,
    pub referrer_user_id: UserId,
    pub referred_user_id: UserId,
    pub level: u32,
    pub investment_id: EntityId,
    pub purchase_amount: f64,
    pub commission_usdt: f64,
    pub commission_nft: f64,
    /// Tracks the USDT side: `paid` once completed withdrawals cover it.
    pub status: CommissionStatus,
    /// Set once completed withdrawals cover the NFT credits.
    pub nft_settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A commission row with the part of it not yet held by any live withdrawal.
#[derive(Debug, Clone, PartialEq)]
pub struct CommissionAvailability {
    pub commission_id: EntityId,
    pub unreserved_usdt: f64,
    pub unreserved_nft: f64,
}

// ── Withdrawals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithdrawalRequest {
    pub id: EntityId,
    pub user_id: UserId,
    pub withdrawal_type: WithdrawalType,
    /// USDT reserved; zero for NFT requests.
    pub amount: f64,
    pub nft_quantity: u32,
    pub wallet_address: Option<String>,
    pub transaction_hash: Option<String>,
    pub status: WithdrawalStatus,
    pub admin_notes: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithdrawalAllocation {
    pub withdrawal_id: EntityId,
    pub commission_id: EntityId,
    pub usdt: f64,
    pub nft: f64,
}
