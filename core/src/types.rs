//! Shared primitive types and status enums used across the ledger.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, unique identifier for any ledger entity (uuid v4 string).
pub type EntityId = String;

/// Platform user identifier. Owned by the external user directory.
pub type UserId = String;

/// `verified_by` marker for automated approvals.
pub const SYSTEM_ACTOR: &str = "system";

/// Generates `as_str`, `Display`, `FromStr` and SQLite text conversions for a
/// fieldless status enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    AutoApproved,
    ManualReviewRequired,
    Approved,
    Rejected,
}

text_enum!(VerificationStatus {
    Pending => "pending",
    AutoApproved => "auto_approved",
    ManualReviewRequired => "manual_review_required",
    Approved => "approved",
    Rejected => "rejected",
});

impl VerificationStatus {
    /// Approved by either path. `auto_approved` keeps the audit distinction.
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Expired,
    Failed,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Expired => "expired",
    Failed => "failed",
});

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Paid,
}

text_enum!(CommissionStatus {
    Pending => "pending",
    Paid => "paid",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalType {
    Usdt,
    Nft,
    Reinvest,
}

text_enum!(WithdrawalType {
    Usdt => "usdt",
    Nft => "nft",
    Reinvest => "reinvest",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(WithdrawalStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl WithdrawalStatus {
    /// Statuses whose allocations still hold commission value.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Completed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentSource {
    PaymentClaim,
    Reinvest,
}

text_enum!(InvestmentSource {
    PaymentClaim => "payment_claim",
    Reinvest => "reinvest",
});

/// Round a USD/USDT amount to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Round fractional NFT credits to four decimals.
pub fn round_nft(amount: f64) -> f64 {
    (amount * 10_000.0).round() / 10_000.0
}

/// Amounts closer than this are treated as equal when comparing balances.
pub const AMOUNT_EPSILON: f64 = 0.000_001;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips_through_from_str() {
        for status in VerificationStatus::ALL {
            assert_eq!(status.as_str().parse::<VerificationStatus>().unwrap(), *status);
        }
        assert!("approved_ish".parse::<VerificationStatus>().is_err());
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_cents(1000.0 * 0.10), 100.0);
        assert_eq!(round_cents(33.333), 33.33);
        assert_eq!(round_nft(0.123456), 0.1235);
    }

    #[test]
    fn reservation_statuses() {
        assert!(WithdrawalStatus::Completed.holds_reservation());
        assert!(!WithdrawalStatus::Cancelled.holds_reservation());
        assert!(!WithdrawalStatus::Completed.is_open());
    }
}
