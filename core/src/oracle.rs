//! Chain oracle contract and the in-process adapters around it.
//!
//! The engine never talks to a node directly. It asks a `ChainOracle` for the
//! canonical facts of one transaction and treats the answer as input:
//!   - `Found`     → scored against the claim
//!   - `NotFound`  → scored as a failed lookup (every check contributes zero)
//!   - `Transient` → retried later; never scored

use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Canonical on-chain facts for one transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnChainFact {
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub confirmations: u32,
    pub block_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OracleLookup {
    Found(OnChainFact),
    NotFound,
    Transient(String),
}

/// Read-only blockchain client. Implementations must be idempotent and
/// side-effect free from the ledger's point of view.
pub trait ChainOracle: Send + Sync {
    fn fetch(&self, chain: &str, tx_hash: &str) -> OracleLookup;
}

impl<O: ChainOracle + ?Sized> ChainOracle for Arc<O> {
    fn fetch(&self, chain: &str, tx_hash: &str) -> OracleLookup {
        (**self).fetch(chain, tx_hash)
    }
}

/// Chains and hashes are compared case-insensitively.
pub fn lookup_key(chain: &str, tx_hash: &str) -> (String, String) {
    (
        chain.trim().to_ascii_lowercase(),
        tx_hash.trim().to_ascii_lowercase(),
    )
}

// ── Timeout wrapper ──────────────────────────────────────────────

/// Bounds every lookup of the wrapped oracle. A lookup that does not answer
/// within `timeout` is reported as `Transient`; the worker thread is left to
/// finish on its own.
pub struct TimeoutOracle<O> {
    inner: Arc<O>,
    timeout: Duration,
}

impl<O: ChainOracle + 'static> TimeoutOracle<O> {
    pub fn new(inner: O, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    pub fn from_arc(inner: Arc<O>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<O: ChainOracle + 'static> ChainOracle for TimeoutOracle<O> {
    fn fetch(&self, chain: &str, tx_hash: &str) -> OracleLookup {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let (chain_owned, hash_owned) = (chain.to_string(), tx_hash.to_string());

        let spawned = std::thread::Builder::new()
            .name("oracle-fetch".into())
            .spawn(move || {
                let _ = tx.send(inner.fetch(&chain_owned, &hash_owned));
            });
        if let Err(e) = spawned {
            return OracleLookup::Transient(format!("cannot start oracle worker: {e}"));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(lookup) => lookup,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "oracle: {chain}/{tx_hash} timed out after {}ms",
                    self.timeout.as_millis()
                );
                OracleLookup::Transient(format!(
                    "oracle timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                OracleLookup::Transient("oracle worker exited without an answer".into())
            }
        }
    }
}

// ── Scripted oracle ──────────────────────────────────────────────

/// In-memory oracle answering from scripted responses.
///
/// Each transaction holds a queue of answers; every lookup pops the front
/// until one answer is left, which then repeats. Unknown transactions are
/// `NotFound`.
#[derive(Debug, Default)]
pub struct StaticOracle {
    responses: Mutex<HashMap<(String, String), VecDeque<OracleLookup>>>,
    calls: Mutex<HashMap<(String, String), u32>>,
}

#[derive(Debug, Deserialize)]
struct FixtureFile {
    transactions: Vec<FixtureEntry>,
}

#[derive(Debug, Deserialize)]
struct FixtureEntry {
    chain: String,
    tx_hash: String,
    response: OracleLookup,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load scripted answers from a JSON fixture file.
    pub fn from_fixture_file(path: &str) -> LedgerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::Config(format!("cannot read {path}: {e}")))?;
        let file: FixtureFile = serde_json::from_str(&content)?;
        let oracle = Self::new();
        for entry in file.transactions {
            oracle.push(&entry.chain, &entry.tx_hash, entry.response);
        }
        Ok(oracle)
    }

    /// Replace any scripted answers for this transaction with one fact.
    pub fn insert_fact(&self, chain: &str, tx_hash: &str, fact: OnChainFact) {
        self.set(chain, tx_hash, vec![OracleLookup::Found(fact)]);
    }

    /// Replace any scripted answers for this transaction.
    pub fn set(&self, chain: &str, tx_hash: &str, answers: Vec<OracleLookup>) {
        self.lock_responses()
            .insert(lookup_key(chain, tx_hash), answers.into());
    }

    /// Append one answer to this transaction's queue.
    pub fn push(&self, chain: &str, tx_hash: &str, answer: OracleLookup) {
        self.lock_responses()
            .entry(lookup_key(chain, tx_hash))
            .or_default()
            .push_back(answer);
    }

    /// How many times this transaction has been looked up.
    pub fn calls(&self, chain: &str, tx_hash: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&lookup_key(chain, tx_hash))
            .copied()
            .unwrap_or(0)
    }

    fn lock_responses(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), VecDeque<OracleLookup>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChainOracle for StaticOracle {
    fn fetch(&self, chain: &str, tx_hash: &str) -> OracleLookup {
        let key = lookup_key(chain, tx_hash);
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_insert(0) += 1;

        let mut responses = self.lock_responses();
        match responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(OracleLookup::NotFound),
            Some(queue) => queue.front().cloned().unwrap_or(OracleLookup::NotFound),
            None => OracleLookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fact() -> OnChainFact {
        OnChainFact {
            from_address: "0xabc".into(),
            to_address: "0xdef".into(),
            amount: 10.0,
            confirmations: 5,
            block_time: Utc.timestamp_opt(1_704_067_200, 0).unwrap(),
        }
    }

    #[test]
    fn scripted_answers_drain_then_repeat_last() {
        let oracle = StaticOracle::new();
        oracle.push("BSC", "0xAA", OracleLookup::Transient("rpc down".into()));
        oracle.push("bsc", "0xaa", OracleLookup::Found(fact()));

        assert!(matches!(oracle.fetch("bsc", "0xaa"), OracleLookup::Transient(_)));
        assert_eq!(oracle.fetch("bsc", "0xaa"), OracleLookup::Found(fact()));
        assert_eq!(oracle.fetch("bsc", "0xaa"), OracleLookup::Found(fact()));
        assert_eq!(oracle.calls("BSC", "0xAA"), 3);
    }

    #[test]
    fn unknown_transaction_is_not_found() {
        assert_eq!(StaticOracle::new().fetch("ethereum", "0x1"), OracleLookup::NotFound);
    }

    struct SlowOracle;

    impl ChainOracle for SlowOracle {
        fn fetch(&self, _chain: &str, _tx_hash: &str) -> OracleLookup {
            std::thread::sleep(Duration::from_millis(500));
            OracleLookup::NotFound
        }
    }

    #[test]
    fn timeout_becomes_transient() {
        let oracle = TimeoutOracle::new(SlowOracle, Duration::from_millis(20));
        assert!(matches!(oracle.fetch("bsc", "0x1"), OracleLookup::Transient(_)));
    }

    #[test]
    fn fast_answer_passes_through_timeout() {
        let inner = StaticOracle::new();
        inner.insert_fact("bsc", "0x1", fact());
        let oracle = TimeoutOracle::new(inner, Duration::from_secs(5));
        assert_eq!(oracle.fetch("bsc", "0x1"), OracleLookup::Found(fact()));
    }

    #[test]
    fn fixture_json_shape() {
        let json = r#"{"transactions":[
            {"chain":"bsc","tx_hash":"0x1","response":"not_found"},
            {"chain":"bsc","tx_hash":"0x2","response":{"transient":"rpc"}}
        ]}"#;
        let file: FixtureFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.transactions.len(), 2);
        assert_eq!(file.transactions[0].response, OracleLookup::NotFound);
    }
}
