//! Verification engine tests.
//!
//! Tests cover: auto-approval of an exact match, the auto-approval ceiling,
//! sender mismatch, missing transactions, transient oracle failures and their
//! bound, expiry (sweep and scoring path), duplicate transfers, admin review
//! and concurrent verification of one claim.

use chrono::Duration;
use payledger_core::{
    auth::{AdminContext, Capability},
    clock::{Clock, ManualClock},
    config::EngineConfig,
    engine::PaymentEngine,
    error::LedgerError,
    event::PAYMENT_APPROVED,
    models::NewPaymentClaim,
    oracle::{OnChainFact, OracleLookup, StaticOracle},
    store::LedgerStore,
    types::{PaymentStatus, VerificationStatus, SYSTEM_ACTOR},
    verification::{VerificationOutcome, ORACLE_UNAVAILABLE},
};
use std::sync::{Arc, Barrier};

const COMPANY: &str = "0x9999999999999999999999999999999999999999";
const SENDER: &str = "0x1111111111111111111111111111111111111111";

fn build() -> (PaymentEngine, Arc<ManualClock>, Arc<StaticOracle>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::at_epoch());
    let oracle = Arc::new(StaticOracle::new());
    let engine = PaymentEngine::build_test(clock.clone(), oracle.clone()).expect("build test engine");
    (engine, clock, oracle)
}

fn claim(user: &str, amount: f64, tx_hash: &str) -> NewPaymentClaim {
    NewPaymentClaim {
        user_id: user.into(),
        claimed_amount_usd: amount,
        chain: "bsc".into(),
        company_wallet_address: COMPANY.into(),
        sender_wallet_address: SENDER.into(),
        sender_name: Some("Test Sender".into()),
        transaction_hash: tx_hash.into(),
        notes: None,
    }
}

fn exact_fact(clock: &ManualClock, amount: f64, confirmations: u32) -> OnChainFact {
    OnChainFact {
        from_address: SENDER.into(),
        to_address: COMPANY.into(),
        amount,
        confirmations,
        block_time: clock.now() - Duration::minutes(10),
    }
}

/// $500 claim, exact match, 12 confirmations on a chain requiring 3.
#[test]
fn exact_match_is_auto_approved() {
    let (engine, clock, oracle) = build();
    let c = engine.submit_claim(claim("bob", 500.0, "0xaaa1")).unwrap();
    assert_eq!(c.verification_confidence, None);
    oracle.insert_fact("bsc", "0xaaa1", exact_fact(&clock, 500.0, 12));

    let outcome = engine.verify_claim(&c.id).unwrap();
    assert!(matches!(
        outcome,
        VerificationOutcome::AutoApproved { confidence: 100, .. }
    ));

    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(stored.verification_status, VerificationStatus::AutoApproved);
    assert_eq!(stored.payment_status, PaymentStatus::Completed);
    assert_eq!(stored.verification_confidence, Some(100));
    assert_eq!(stored.verified_by.as_deref(), Some(SYSTEM_ACTOR));
    assert_eq!(stored.verified_at, Some(clock.now()));

    let investment_id = stored.investment_id.expect("approval creates an investment");
    let investment = engine.store().get_investment(&investment_id).unwrap();
    assert_eq!(investment.amount_usd, 500.0);
    assert_eq!(investment.user_id, "bob");

    let attempts = engine.verification_attempts(&c.id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].confidence, 100);
    assert!(attempts[0].errors.is_empty());
}

/// $60,000 claim against a $50,000 ceiling never auto-approves.
#[test]
fn claim_above_ceiling_goes_to_manual_review() {
    let (engine, clock, oracle) = build();
    let c = engine.submit_claim(claim("bob", 60_000.0, "0xbig")).unwrap();
    oracle.insert_fact("bsc", "0xbig", exact_fact(&clock, 60_000.0, 40));

    let outcome = engine.verify_claim(&c.id).unwrap();
    assert_eq!(
        outcome.status(),
        Some(VerificationStatus::ManualReviewRequired)
    );

    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
    let confidence = stored.verification_confidence.unwrap();
    assert!(confidence < 80, "ceiling must cap confidence, got {confidence}");
    assert!(stored.verification_data.unwrap().ceiling_exceeded);
    assert_eq!(engine.store().event_count(PAYMENT_APPROVED).unwrap(), 0);
}

#[test]
fn sender_mismatch_never_auto_approves() {
    let (engine, clock, oracle) = build();
    let c = engine.submit_claim(claim("bob", 500.0, "0xmis")).unwrap();
    let mut fact = exact_fact(&clock, 500.0, 12);
    fact.from_address = "0x2222222222222222222222222222222222222222".into();
    oracle.insert_fact("bsc", "0xmis", fact);

    engine.verify_claim(&c.id).unwrap();
    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(
        stored.verification_status,
        VerificationStatus::ManualReviewRequired
    );
    assert!(stored.verification_confidence.unwrap() < 80);
}

/// Even when the remaining weights alone clear the threshold, a failed sender
/// check caps confidence below it.
#[test]
fn sender_mismatch_is_capped_under_lenient_weights() {
    let clock = Arc::new(ManualClock::at_epoch());
    let oracle = Arc::new(StaticOracle::new());
    let mut config = EngineConfig::default_test();
    config.verification.weights.sender_match = 10;
    config.verification.weights.amount_match = 45;
    let store = LedgerStore::in_memory().unwrap();
    store.migrate().unwrap();
    let engine = PaymentEngine::new(store, config, clock.clone(), oracle.clone()).unwrap();

    let c = engine.submit_claim(claim("bob", 500.0, "0xlen")).unwrap();
    let mut fact = exact_fact(&clock, 500.0, 12);
    fact.from_address = "0x3333333333333333333333333333333333333333".into();
    oracle.insert_fact("bsc", "0xlen", fact);

    let outcome = engine.verify_claim(&c.id).unwrap();
    assert_eq!(
        outcome,
        VerificationOutcome::ManualReview {
            confidence: Some(79),
            reason: "confidence 79 below threshold 80".into(),
        }
    );
}

#[test]
fn missing_transaction_scores_zero_and_records_error() {
    let (engine, _clock, _oracle) = build();
    let c = engine.submit_claim(claim("bob", 500.0, "0xnone")).unwrap();

    engine.verify_claim(&c.id).unwrap();
    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(
        stored.verification_status,
        VerificationStatus::ManualReviewRequired
    );
    assert_eq!(stored.verification_confidence, Some(0));
    let data = stored.verification_data.unwrap();
    assert!(data.on_chain.is_none());
    assert_eq!(data.errors.len(), 1);
}

#[test]
fn transient_failures_are_retried_then_forced_to_review() {
    let (engine, clock, oracle) = build();
    let c = engine.submit_claim(claim("bob", 500.0, "0xflaky")).unwrap();
    oracle.set(
        "bsc",
        "0xflaky",
        vec![OracleLookup::Transient("rpc 503".into())],
    );

    for expected in 1..5u32 {
        match engine.verify_claim(&c.id).unwrap() {
            VerificationOutcome::RetryScheduled { failures, .. } => assert_eq!(failures, expected),
            other => panic!("expected a retry, got {other:?}"),
        }
        let stored = engine.get_claim(&c.id).unwrap();
        assert_eq!(stored.verification_status, VerificationStatus::Pending);
        assert_eq!(stored.verification_confidence, None);
        clock.advance(Duration::hours(1));
    }

    let outcome = engine.verify_claim(&c.id).unwrap();
    assert_eq!(
        outcome,
        VerificationOutcome::ManualReview {
            confidence: None,
            reason: ORACLE_UNAVAILABLE.into(),
        }
    );
    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(
        stored.verification_status,
        VerificationStatus::ManualReviewRequired
    );
    assert_eq!(stored.verification_confidence, None);
    assert!(engine.verification_attempts(&c.id).unwrap().is_empty());
    assert_eq!(oracle.calls("bsc", "0xflaky"), 5);
}

#[test]
fn sweep_waits_for_retry_backoff() {
    let (engine, clock, oracle) = build();
    let admin = AdminContext::superuser("ops");
    let c = engine.submit_claim(claim("bob", 500.0, "0xslow")).unwrap();
    oracle.set(
        "bsc",
        "0xslow",
        vec![
            OracleLookup::Transient("timeout".into()),
            OracleLookup::Found(exact_fact(&clock, 500.0, 12)),
        ],
    );

    let first = engine.run_sweep(&admin).unwrap();
    assert!(matches!(
        first.verified[0].1,
        VerificationOutcome::RetryScheduled { failures: 1, .. }
    ));

    // Backoff is 60s after the first failure.
    let early = engine.run_sweep(&admin).unwrap();
    assert!(early.verified.is_empty());

    clock.advance(Duration::seconds(61));
    let due = engine.run_sweep(&admin).unwrap();
    assert_eq!(due.verified.len(), 1);
    assert!(matches!(
        due.verified[0].1,
        VerificationOutcome::AutoApproved { .. }
    ));
    assert_eq!(due.drained.consumed, 1);
    assert_eq!(
        engine.get_claim(&c.id).unwrap().payment_status,
        PaymentStatus::Completed
    );
}

#[test]
fn stale_claims_expire_on_sweep() {
    let (engine, clock, _oracle) = build();
    let admin = AdminContext::superuser("ops");
    let c = engine.submit_claim(claim("bob", 500.0, "0xold")).unwrap();

    clock.advance(Duration::hours(25));
    let before = engine.get_claim(&c.id).unwrap();
    assert_eq!(before.payment_status, PaymentStatus::Pending);
    assert_eq!(
        before.effective_payment_status(clock.now()),
        PaymentStatus::Expired
    );

    let report = engine.run_sweep(&admin).unwrap();
    assert_eq!(report.expired, vec![c.id.clone()]);
    assert!(report.verified.is_empty());

    let after = engine.get_claim(&c.id).unwrap();
    assert_eq!(after.payment_status, PaymentStatus::Expired);
    assert_eq!(after.verification_status, VerificationStatus::Rejected);
    assert_eq!(after.verification_confidence, None);
}

#[test]
fn failed_verification_after_expiry_rejects() {
    let (engine, clock, _oracle) = build();
    let c = engine.submit_claim(claim("bob", 500.0, "0xlate")).unwrap();
    clock.advance(Duration::hours(30));

    let outcome = engine.verify_claim(&c.id).unwrap();
    assert!(matches!(outcome, VerificationOutcome::Rejected { confidence: 0, .. }));
    let stored = engine.get_claim(&c.id).unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Expired);
    assert_eq!(stored.verification_status, VerificationStatus::Rejected);
}

#[test]
fn one_transfer_backs_one_live_claim() {
    let (engine, _clock, _oracle) = build();
    let admin = AdminContext::superuser("ops");
    let first = engine.submit_claim(claim("bob", 500.0, "0xdup")).unwrap();

    let err = engine.submit_claim(claim("eve", 500.0, "0xdup")).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateTransaction { ref claim_id, .. } if *claim_id == first.id));
    assert!(err.is_user_facing());

    // A rejected claim frees the transfer for a corrected resubmission.
    engine.verify_claim(&first.id).unwrap();
    engine.reject_claim(&admin, &first.id, "wrong amount").unwrap();
    assert!(engine.submit_claim(claim("bob", 450.0, "0xdup")).is_ok());
}

#[test]
fn submission_is_validated() {
    let (engine, _clock, _oracle) = build();
    let mut bad = claim("bob", 0.0, "0xzero");
    assert!(matches!(
        engine.submit_claim(bad.clone()),
        Err(LedgerError::InvalidRequest(_))
    ));
    // Rounds to $0.00.
    bad.claimed_amount_usd = 0.004;
    assert!(matches!(
        engine.submit_claim(bad.clone()),
        Err(LedgerError::InvalidRequest(_))
    ));
    bad.claimed_amount_usd = 10.0;
    bad.sender_wallet_address = "  ".into();
    assert!(matches!(
        engine.submit_claim(bad),
        Err(LedgerError::InvalidRequest(_))
    ));
}

#[test]
fn admin_review_requires_capability_and_manual_state() {
    let (engine, clock, oracle) = build();
    let c = engine.submit_claim(claim("bob", 60_000.0, "0xrev")).unwrap();

    let reviewer = AdminContext::new("alice-admin", [Capability::ReviewPayments]);
    let payouts_only = AdminContext::new("payouts", [Capability::ResolveWithdrawals]);

    // Still pending: not reviewable yet.
    assert!(matches!(
        engine.approve_claim(&reviewer, &c.id, None),
        Err(LedgerError::InvalidStateTransition { .. })
    ));

    oracle.insert_fact("bsc", "0xrev", exact_fact(&clock, 60_000.0, 20));
    engine.verify_claim(&c.id).unwrap();

    assert!(matches!(
        engine.approve_claim(&payouts_only, &c.id, None),
        Err(LedgerError::Unauthorized { .. })
    ));

    let approved = engine
        .approve_claim(&reviewer, &c.id, Some("KYC checked"))
        .unwrap();
    assert_eq!(approved.verification_status, VerificationStatus::Approved);
    assert_eq!(approved.payment_status, PaymentStatus::Completed);
    assert_eq!(approved.verified_by.as_deref(), Some("alice-admin"));
    assert!(approved.investment_id.is_some());
    assert_eq!(engine.store().event_count(PAYMENT_APPROVED).unwrap(), 1);

    // Terminal now.
    assert!(matches!(
        engine.reject_claim(&reviewer, &c.id, "changed my mind"),
        Err(LedgerError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        engine.verify_claim(&c.id),
        Err(LedgerError::InvalidStateTransition { .. })
    ));
}

#[test]
fn admin_reject_fails_the_payment() {
    let (engine, _clock, _oracle) = build();
    let admin = AdminContext::new("ops", [Capability::ReviewPayments]);
    let c = engine.submit_claim(claim("bob", 500.0, "0xrej")).unwrap();
    engine.verify_claim(&c.id).unwrap();

    let rejected = engine.reject_claim(&admin, &c.id, "no such transfer").unwrap();
    assert_eq!(rejected.verification_status, VerificationStatus::Rejected);
    assert_eq!(rejected.payment_status, PaymentStatus::Failed);
    assert_eq!(rejected.verification_reason.as_deref(), Some("no such transfer"));
    assert!(rejected.investment_id.is_none());
}

#[test]
fn sweep_requires_capability() {
    let (engine, _clock, _oracle) = build();
    let reviewer = AdminContext::new("ops", [Capability::ReviewPayments]);
    assert!(matches!(
        engine.run_sweep(&reviewer),
        Err(LedgerError::Unauthorized { .. })
    ));
}

#[test]
fn concurrent_verification_approves_once() {
    let path = std::env::temp_dir().join(format!("payledger-verify-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();
    let clock = Arc::new(ManualClock::at_epoch());
    let oracle = Arc::new(StaticOracle::new());
    let store = LedgerStore::open(&path).unwrap();
    store.migrate().unwrap();
    let engine =
        PaymentEngine::new(store, EngineConfig::default_test(), clock.clone(), oracle.clone()).unwrap();

    let c = engine.submit_claim(claim("bob", 500.0, "0xrace")).unwrap();
    oracle.insert_fact("bsc", "0xrace", exact_fact(&clock, 500.0, 12));

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let worker = engine.reopen().unwrap();
            let barrier = Arc::clone(&barrier);
            let claim_id = c.id.clone();
            std::thread::spawn(move || {
                barrier.wait();
                worker.verification().verify(&claim_id)
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let approvals = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(VerificationOutcome::AutoApproved { .. })))
        .count();
    assert_eq!(approvals, 1, "outcomes: {outcomes:?}");
    assert_eq!(engine.store().event_count(PAYMENT_APPROVED).unwrap(), 1);
    assert_eq!(engine.store().investments_for_user("bob").unwrap().len(), 1);

    drop(engine);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn stats_count_claims_in_window() {
    let (engine, clock, oracle) = build();
    let ok = engine.submit_claim(claim("bob", 500.0, "0xs1")).unwrap();
    oracle.insert_fact("bsc", "0xs1", exact_fact(&clock, 500.0, 12));
    engine.verify_claim(&ok.id).unwrap();
    let manual = engine.submit_claim(claim("eve", 300.0, "0xs2")).unwrap();
    engine.verify_claim(&manual.id).unwrap();
    engine.submit_claim(claim("dan", 100.0, "0xs3")).unwrap();

    let stats = engine.verification_stats(24, 10).unwrap();
    assert_eq!(stats.total_claims, 3);
    assert_eq!(stats.count_for("auto_approved"), 1);
    assert_eq!(stats.count_for("manual_review_required"), 1);
    assert_eq!(stats.count_for("pending"), 1);
    // Average over the two scored claims: (100 + 0) / 2.
    assert_eq!(stats.average_confidence, Some(50.0));
    assert_eq!(stats.recent_claims.len(), 3);
}
