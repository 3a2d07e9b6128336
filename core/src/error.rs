use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain oracle unavailable: {reason}")]
    TransientOracle { reason: String },

    #[error("Insufficient balance: requested {requested:.2}, available {available:.2}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("Invalid state transition for {entity} '{id}': {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Transaction {tx_hash} on {chain} already backs claim '{claim_id}'")]
    DuplicateTransaction {
        chain: String,
        tx_hash: String,
        claim_id: String,
    },

    #[error("Referral cycle detected at user '{user_id}'")]
    ReferralCycle { user_id: String },

    #[error("Actor '{actor}' lacks capability {capability}")]
    Unauthorized { actor: String, capability: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// Errors the submitting user can act on (as opposed to conflicts and
    /// infrastructure failures).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. }
                | Self::DuplicateTransaction { .. }
                | Self::InvalidRequest(_)
                | Self::NotFound { .. }
        )
    }

    /// Retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientOracle { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Message safe to show an end user. Oracle and database internals are
    /// replaced with a generic line.
    pub fn public_message(&self) -> String {
        match self {
            Self::TransientOracle { .. } => {
                "Blockchain lookup is temporarily unavailable; verification will be retried".into()
            }
            Self::Database(_) | Self::Serialization(_) | Self::Other(_) | Self::Config(_) => {
                "Internal error; please try again later".into()
            }
            other => other.to_string(),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
