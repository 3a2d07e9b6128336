//! Explicit admin capabilities.
//!
//! Admin-triggered operations take an `AdminContext` instead of reading a
//! session. How the caller authenticated the admin is its own business; the
//! ledger only checks that the context carries the capability it needs.

use crate::error::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Approve or reject claims awaiting manual review.
    ReviewPayments,
    /// Move withdrawal requests through processing to a final state.
    ResolveWithdrawals,
    /// Run expiry and retry sweeps.
    RunSweeps,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReviewPayments => "review_payments",
            Self::ResolveWithdrawals => "resolve_withdrawals",
            Self::RunSweeps => "run_sweeps",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminContext {
    pub admin_id: String,
    capabilities: BTreeSet<Capability>,
}

impl AdminContext {
    pub fn new(admin_id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            admin_id: admin_id.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Every capability. For operator tooling and tests.
    pub fn superuser(admin_id: impl Into<String>) -> Self {
        Self::new(
            admin_id,
            [
                Capability::ReviewPayments,
                Capability::ResolveWithdrawals,
                Capability::RunSweeps,
            ],
        )
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> LedgerResult<()> {
        if self.has(capability) {
            Ok(())
        } else {
            log::warn!("auth: {} denied {capability}", self.admin_id);
            Err(LedgerError::Unauthorized {
                actor: self.admin_id.clone(),
                capability: capability.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capability_is_rejected() {
        let ctx = AdminContext::new("ops-1", [Capability::ResolveWithdrawals]);
        assert!(ctx.require(Capability::ResolveWithdrawals).is_ok());
        assert!(matches!(
            ctx.require(Capability::ReviewPayments),
            Err(LedgerError::Unauthorized { .. })
        ));
    }
}
