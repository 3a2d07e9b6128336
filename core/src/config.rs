use crate::{
    error::{LedgerError, LedgerResult},
    scorer::CheckKind,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Verification policy ───────────────────────────────────────────

/// Points each check contributes when it passes. Must sum to 100.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckWeights {
    pub sender_match: u32,
    pub destination_match: u32,
    pub amount_match: u32,
    pub confirmations: u32,
    pub transaction_age: u32,
}

impl CheckWeights {
    pub fn weight_of(&self, kind: CheckKind) -> u32 {
        match kind {
            CheckKind::SenderMatch => self.sender_match,
            CheckKind::DestinationMatch => self.destination_match,
            CheckKind::AmountMatch => self.amount_match,
            CheckKind::Confirmations => self.confirmations,
            CheckKind::TransactionAge => self.transaction_age,
            CheckKind::AutoApprovalCeiling => 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.sender_match
            + self.destination_match
            + self.amount_match
            + self.confirmations
            + self.transaction_age
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPolicy {
    /// Minimum confidence (0-100) for automatic approval.
    pub confidence_threshold: u8,
    /// Auto-approval ceiling in USD. Larger claims always go to a human.
    pub max_auto_amount: f64,
    /// Allowed relative difference between claimed and on-chain amount, in percent.
    pub amount_tolerance_pct: f64,
    pub weights: CheckWeights,
    /// Checks whose failure caps confidence below the threshold.
    #[serde(default)]
    pub critical_checks: Vec<CheckKind>,
    /// Chain id (lower-case) → required confirmations.
    #[serde(default)]
    pub min_confirmations: HashMap<String, u32>,
    pub default_min_confirmations: u32,
    /// How far before claim submission the transfer may have happened.
    pub max_tx_age_hours: i64,
    /// Lifetime of a claim before it expires unverified.
    pub claim_ttl_hours: i64,
    pub max_transient_retries: u32,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub oracle_timeout_ms: u64,
}

impl VerificationPolicy {
    pub fn min_confirmations_for(&self, chain: &str) -> u32 {
        self.min_confirmations
            .get(&chain.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_min_confirmations)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::hours(self.claim_ttl_hours)
    }

    pub fn max_tx_age(&self) -> Duration {
        Duration::hours(self.max_tx_age_hours)
    }

    /// Exponential backoff after the `failures`-th consecutive transient error.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let secs = self
            .retry_base_secs
            .saturating_mul(1i64 << shift)
            .min(self.retry_max_secs);
        Duration::seconds(secs)
    }

    pub fn oracle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.oracle_timeout_ms)
    }

    fn validate(&self) -> LedgerResult<()> {
        if self.weights.total() != 100 {
            return Err(LedgerError::Config(format!(
                "check weights must sum to 100, got {}",
                self.weights.total()
            )));
        }
        if self.confidence_threshold == 0 || self.confidence_threshold > 100 {
            return Err(LedgerError::Config(format!(
                "confidence_threshold must be in 1..=100, got {}",
                self.confidence_threshold
            )));
        }
        if self.amount_tolerance_pct < 0.0 {
            return Err(LedgerError::Config("amount_tolerance_pct must be >= 0".into()));
        }
        if self.max_auto_amount <= 0.0 {
            return Err(LedgerError::Config("max_auto_amount must be positive".into()));
        }
        if self.claim_ttl_hours <= 0 || self.max_tx_age_hours < 0 {
            return Err(LedgerError::Config("claim/transaction windows must be positive".into()));
        }
        if self.retry_base_secs <= 0 || self.retry_max_secs < self.retry_base_secs {
            return Err(LedgerError::Config("retry backoff bounds are inconsistent".into()));
        }
        if self.oracle_timeout_ms == 0 {
            return Err(LedgerError::Config("oracle_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

// ── Commission schedule ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionSchedule {
    /// USDT rate per level; index 0 is level 1 (direct referrer).
    pub usdt_rates: Vec<f64>,
    /// NFT reward rate per level, as a fraction of the purchase value.
    pub nft_rates: Vec<f64>,
    pub nft_unit_price_usd: f64,
    pub max_depth: usize,
}

impl CommissionSchedule {
    pub fn usdt_rate(&self, level: usize) -> f64 {
        level
            .checked_sub(1)
            .and_then(|i| self.usdt_rates.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn nft_rate(&self, level: usize) -> f64 {
        level
            .checked_sub(1)
            .and_then(|i| self.nft_rates.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    fn validate(&self) -> LedgerResult<()> {
        if self.usdt_rates.is_empty() {
            return Err(LedgerError::Config("usdt_rates must not be empty".into()));
        }
        if self.nft_rates.len() != self.usdt_rates.len() {
            return Err(LedgerError::Config(format!(
                "nft_rates has {} levels, usdt_rates has {}",
                self.nft_rates.len(),
                self.usdt_rates.len()
            )));
        }
        if self.max_depth == 0 || self.max_depth > self.usdt_rates.len() {
            return Err(LedgerError::Config(format!(
                "max_depth must be in 1..={}, got {}",
                self.usdt_rates.len(),
                self.max_depth
            )));
        }
        if self.usdt_rates.iter().chain(&self.nft_rates).any(|r| *r < 0.0) {
            return Err(LedgerError::Config("commission rates must be >= 0".into()));
        }
        let usdt_total: f64 = self.usdt_rates.iter().sum();
        if usdt_total >= 1.0 {
            return Err(LedgerError::Config(format!(
                "usdt_rates sum to {usdt_total}, which pays out the whole purchase"
            )));
        }
        if self.nft_unit_price_usd <= 0.0 {
            return Err(LedgerError::Config("nft_unit_price_usd must be positive".into()));
        }
        Ok(())
    }
}

// ── Withdrawal policy ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    pub min_usdt_amount: f64,
    /// Open (pending/processing) requests a user may hold at once.
    pub max_open_requests: u32,
}

impl WithdrawalPolicy {
    fn validate(&self) -> LedgerResult<()> {
        if self.min_usdt_amount < 0.0 {
            return Err(LedgerError::Config("min_usdt_amount must be >= 0".into()));
        }
        if self.max_open_requests == 0 {
            return Err(LedgerError::Config("max_open_requests must be positive".into()));
        }
        Ok(())
    }
}

// ── Engine config ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub verification: VerificationPolicy,
    pub commission: CommissionSchedule,
    pub withdrawal: WithdrawalPolicy,
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let config = Self {
            verification: read_json(&format!("{data_dir}/verification_policy.json"))?,
            commission: read_json(&format!("{data_dir}/commission_schedule.json"))?,
            withdrawal: read_json(&format!("{data_dir}/withdrawal_policy.json"))?,
        };
        config.validate()?;
        log::info!(
            "config loaded from {data_dir}: threshold={}, ceiling={}, levels={}",
            config.verification.confidence_threshold,
            config.verification.max_auto_amount,
            config.commission.max_depth
        );
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        self.verification.validate()?;
        self.commission.validate()?;
        self.withdrawal.validate()?;
        Ok(())
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            verification: VerificationPolicy {
                confidence_threshold: 80,
                max_auto_amount: 50_000.0,
                amount_tolerance_pct: 1.0,
                weights: CheckWeights {
                    sender_match: 30,
                    destination_match: 25,
                    amount_match: 25,
                    confirmations: 15,
                    transaction_age: 5,
                },
                critical_checks: vec![CheckKind::SenderMatch, CheckKind::DestinationMatch],
                min_confirmations: HashMap::from([
                    ("ethereum".to_string(), 12),
                    ("bsc".to_string(), 3),
                    ("tron".to_string(), 19),
                ]),
                default_min_confirmations: 3,
                max_tx_age_hours: 72,
                claim_ttl_hours: 24,
                max_transient_retries: 5,
                retry_base_secs: 60,
                retry_max_secs: 3_600,
                oracle_timeout_ms: 2_000,
            },
            commission: CommissionSchedule {
                usdt_rates: vec![0.10, 0.05, 0.03],
                nft_rates: vec![0.02, 0.01, 0.005],
                nft_unit_price_usd: 100.0,
                max_depth: 3,
            },
            withdrawal: WithdrawalPolicy {
                min_usdt_amount: 10.0,
                max_open_requests: 3,
            },
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content =
        std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_is_valid() {
        EngineConfig::default_test().validate().unwrap();
    }

    #[test]
    fn weights_must_sum_to_100() {
        let mut config = EngineConfig::default_test();
        config.verification.weights.transaction_age = 10;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn depth_cannot_exceed_rate_schedule() {
        let mut config = EngineConfig::default_test();
        config.commission.max_depth = 4;
        assert!(config.validate().is_err());
        config.commission.max_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = EngineConfig::default_test().verification;
        assert_eq!(policy.retry_delay(1), Duration::seconds(60));
        assert_eq!(policy.retry_delay(2), Duration::seconds(120));
        assert_eq!(policy.retry_delay(3), Duration::seconds(240));
        assert_eq!(policy.retry_delay(30), Duration::seconds(3_600));
    }

    #[test]
    fn unknown_chain_uses_default_confirmations() {
        let policy = EngineConfig::default_test().verification;
        assert_eq!(policy.min_confirmations_for("ETHEREUM"), 12);
        assert_eq!(policy.min_confirmations_for("solana"), 3);
    }
}
