//! payledger-core: automatic payment verification, referral commissions and
//! commission withdrawals over a SQLite ledger.

pub mod auth;
pub mod clock;
pub mod commission;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod models;
pub mod oracle;
pub mod scorer;
pub mod store;
pub mod types;
pub mod verification;
pub mod withdrawal;
