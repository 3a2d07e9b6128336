//! ledger-runner: headless operator runner for the payment ledger.
//!
//! Usage:
//!   ledger-runner --db ledger.db --data-dir ./data
//!   ledger-runner --db ledger.db --oracle-fixtures ./data/oracle_fixtures.json --ipc-mode
//!
//! Default mode runs one sweep (expire, verify due claims, distribute
//! approvals) and prints a summary. `--ipc-mode` reads one JSON command per
//! line on stdin and answers with one JSON line per command.

use anyhow::Result;
use payledger_core::{
    auth::AdminContext,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::PaymentEngine,
    error::LedgerError,
    models::NewPaymentClaim,
    oracle::{ChainOracle, StaticOracle, TimeoutOracle},
    store::LedgerStore,
    types::WithdrawalType,
    withdrawal::Resolution,
};
use serde_json::{json, Value};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

const RUNNER_ADMIN: &str = "ledger-runner";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    SubmitClaim {
        claim: NewPaymentClaim,
    },
    Verify {
        claim_id: String,
    },
    Approve {
        claim_id: String,
        #[serde(default)]
        notes: Option<String>,
    },
    Reject {
        claim_id: String,
        reason: String,
    },
    LinkReferral {
        user_id: String,
        referrer_id: String,
    },
    Withdraw {
        user_id: String,
        withdrawal_type: WithdrawalType,
        amount: f64,
        #[serde(default)]
        wallet_address: Option<String>,
    },
    ResolveWithdrawal {
        withdrawal_id: String,
        resolution: Resolution,
    },
    Stats {
        #[serde(default = "default_window_hours")]
        window_hours: i64,
    },
    Sweep,
    Quit,
}

fn default_window_hours() -> i64 {
    24
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let window_hours = parse_arg(&args, "--window-hours", 24i64);
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");
    let fixtures = string_arg(&args, "--oracle-fixtures");

    if !ipc_mode {
        println!("payment ledger: ledger-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!("  fixtures:  {}", fixtures.unwrap_or("(none)"));
        println!();
    }

    let config = EngineConfig::load(data_dir)?;
    let store = if db == ":memory:" {
        LedgerStore::in_memory()?
    } else {
        LedgerStore::open(db)?
    };
    store.migrate()?;

    let scripted = match fixtures {
        Some(path) => StaticOracle::from_fixture_file(path)?,
        None => StaticOracle::new(),
    };
    let oracle: Arc<dyn ChainOracle> = Arc::new(TimeoutOracle::new(
        scripted,
        config.verification.oracle_timeout(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = PaymentEngine::new(store, config, clock, oracle)?;
    let admin = AdminContext::superuser(RUNNER_ADMIN);

    if ipc_mode {
        run_ipc_loop(&engine, &admin)?;
    } else {
        let report = engine.run_sweep(&admin)?;
        print_summary(&engine, &report, window_hours)?;
    }

    Ok(())
}

fn run_ipc_loop(engine: &PaymentEngine, admin: &AdminContext) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let response = match handle_command(engine, admin, cmd) {
            Ok(body) => json!({ "ok": body }),
            Err(e) => error_json(&e),
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(
    engine: &PaymentEngine,
    admin: &AdminContext,
    cmd: IpcCommand,
) -> Result<Value, LedgerError> {
    let body = match cmd {
        IpcCommand::SubmitClaim { claim } => serde_json::to_value(engine.submit_claim(claim)?)?,
        IpcCommand::Verify { claim_id } => {
            let outcome = engine.verify_claim(&claim_id)?;
            json!({ "outcome": outcome, "claim": engine.get_claim(&claim_id)? })
        }
        IpcCommand::Approve { claim_id, notes } => {
            serde_json::to_value(engine.approve_claim(admin, &claim_id, notes.as_deref())?)?
        }
        IpcCommand::Reject { claim_id, reason } => {
            serde_json::to_value(engine.reject_claim(admin, &claim_id, &reason)?)?
        }
        IpcCommand::LinkReferral {
            user_id,
            referrer_id,
        } => {
            engine.link_referral(&user_id, &referrer_id)?;
            json!({ "user_id": user_id, "referrer_id": referrer_id })
        }
        IpcCommand::Withdraw {
            user_id,
            withdrawal_type,
            amount,
            wallet_address,
        } => serde_json::to_value(engine.request_withdrawal(
            &user_id,
            withdrawal_type,
            amount,
            wallet_address.as_deref(),
        )?)?,
        IpcCommand::ResolveWithdrawal {
            withdrawal_id,
            resolution,
        } => serde_json::to_value(engine.process_withdrawal(admin, &withdrawal_id, resolution)?)?,
        IpcCommand::Stats { window_hours } => json!({
            "verification": engine.verification_stats(window_hours, 10)?,
            "commissions": engine.commission_summary(None)?,
            "withdrawals": engine.withdrawal_summary(None)?,
        }),
        IpcCommand::Sweep => serde_json::to_value(engine.run_sweep(admin)?)?,
        IpcCommand::Quit => Value::Null,
    };
    Ok(body)
}

/// User-facing errors carry their message; everything else is logged and
/// reported generically.
fn error_json(e: &LedgerError) -> Value {
    if !e.is_user_facing() {
        log::warn!("ipc: command failed: {e}");
    }
    json!({
        "error": e.public_message(),
        "retryable": e.is_retryable(),
    })
}

fn print_summary(
    engine: &PaymentEngine,
    report: &payledger_core::engine::SweepReport,
    window_hours: i64,
) -> Result<()> {
    let stats = engine.verification_stats(window_hours, 5)?;
    let commissions = engine.commission_summary(None)?;
    let withdrawals = engine.withdrawal_summary(None)?;

    println!("=== SWEEP ===");
    println!("  expired:            {}", report.expired.len());
    println!("  verified:           {}", report.verified.len());
    println!("  approvals drained:  {}", report.drained.consumed);
    println!("  commissions posted: {}", report.drained.commissions_posted);
    for (claim_id, reason) in &report.drained.failed {
        println!("  ! {claim_id}: {reason}");
    }

    println!();
    println!("=== CLAIMS (last {window_hours}h) ===");
    println!("  total:              {}", stats.total_claims);
    for c in &stats.by_verification_status {
        println!("  {:<20} {}", c.status, c.count);
    }
    match stats.average_confidence {
        Some(avg) => println!("  avg confidence:     {avg:.1}"),
        None => println!("  avg confidence:     (no completed attempts)"),
    }

    println!();
    println!("=== COMMISSIONS ===");
    for level in &commissions.levels {
        println!(
            "  level {} | records: {} | USDT: {:.2} | NFT: {:.4}",
            level.level, level.records, level.total_usdt, level.total_nft
        );
    }
    println!(
        "  pending: ${:.2} | paid: ${:.2}",
        commissions.pending_usdt, commissions.paid_usdt
    );

    println!();
    println!("=== WITHDRAWALS ===");
    println!("  requests:  {}", withdrawals.requests);
    println!("  open:      ${:.2}", withdrawals.open_amount);
    println!("  completed: ${:.2}", withdrawals.completed_amount);
    Ok(())
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
