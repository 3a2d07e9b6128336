//! Ledger events carried through the outbox.
//!
//! RULE: An event is written in the same transaction as the state change that
//! caused it, and consumed in the same transaction as the work it triggers.
//! The outbox holds at most one event per (type, aggregate), so a claim can
//! never produce two approval events however many writers race on it.

use crate::types::{EntityId, UserId};
use serde::{Deserialize, Serialize};

pub const PAYMENT_APPROVED: &str = "payment_approved";

/// Variants are added, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    PaymentApproved {
        claim_id:        EntityId,
        investment_id:   EntityId,
        buyer_user_id:   UserId,
        purchase_amount: f64,
        approved_by:     String,
    },
}

impl LedgerEvent {
    /// Stable name for the outbox `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::PaymentApproved { .. } => PAYMENT_APPROVED,
        }
    }

    /// The entity the event is about; unique per event type.
    pub fn aggregate_id(&self) -> &str {
        match self {
            LedgerEvent::PaymentApproved { claim_id, .. } => claim_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_approved_payload_is_tagged() {
        let event = LedgerEvent::PaymentApproved {
            claim_id: "c-1".into(),
            investment_id: "i-1".into(),
            buyer_user_id: "u-1".into(),
            purchase_amount: 500.0,
            approved_by: "system".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], PAYMENT_APPROVED);
        assert_eq!(event.aggregate_id(), "c-1");
        let back: LedgerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
