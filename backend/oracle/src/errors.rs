//! Error taxonomy for the oracle.
//!
//! Every failure class is surfaced as its own type so callers can tell a
//! network hiccup from a bad proof from a contract refusal.

use thiserror::Error;

use crate::verifier::ProofDigest;

/// Failures retrieving an artifact from the content-addressed gateway.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("artifact {cid} not found (HTTP {status})")]
    NotFound { cid: String, status: u16 },

    /// Permanent client-side refusal (bad CID, forbidden); retrying cannot help.
    #[error("gateway refused artifact {cid} (HTTP {status})")]
    Rejected { cid: String, status: u16 },

    #[error("timed out fetching artifact {cid}")]
    Timeout { cid: String },

    #[error("artifact too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("artifact {cid} is empty")]
    Empty { cid: String },

    #[error("network error: {0}")]
    Network(String),
}

/// Failures comparing an artifact against the registered commitment.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("proof hash mismatch: commitment {expected}, computed {computed}")]
    HashMismatch {
        expected: ProofDigest,
        computed: ProofDigest,
    },
}

/// Error kinds signalled by the PIFP contract itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractErrorKind {
    #[error("project not found")]
    ProjectNotFound,

    #[error("project already completed")]
    AlreadyCompleted,

    #[error("oracle not authorized")]
    NotAuthorized,

    #[error("project expired")]
    Expired,

    #[error("proof hash rejected by contract")]
    HashMismatchOnChain,

    #[error("protocol paused")]
    ProtocolPaused,

    #[error("unknown contract error (code: {0})")]
    Unknown(u32),
}

impl ContractErrorKind {
    /// Map a numeric `pifp_protocol::Error` discriminant to a kind.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::ProjectNotFound,
            3 => Self::AlreadyCompleted,
            6 => Self::NotAuthorized,
            14 => Self::Expired,
            16 => Self::HashMismatchOnChain,
            19 => Self::ProtocolPaused,
            other => Self::Unknown(other),
        }
    }
}

/// Failures talking to the Soroban RPC endpoint.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("contract error: {0}")]
    Contract(ContractErrorKind),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC request timed out")]
    Timeout,

    #[error("malformed RPC response: {0}")]
    Malformed(String),

    #[error("transaction {0} failed on-chain")]
    TransactionFailed(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout
        } else {
            ChainError::Rpc(e.to_string())
        }
    }
}

/// Vote ledger persistence failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("contract rejected release: {0}")]
    Contract(ContractErrorKind),

    #[error("chain error: {0}")]
    Chain(ChainError),

    #[error("transaction {tx_hash} not confirmed in time")]
    Unconfirmed { tx_hash: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<ChainError> for OracleError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Contract(kind) => OracleError::Contract(kind),
            other => OracleError::Chain(other),
        }
    }
}

impl OracleError {
    /// Whether re-running the attempt later, without operator action, can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Fetch(FetchError::Timeout { .. } | FetchError::Network(_)) => true,
            OracleError::Fetch(_) => false,
            OracleError::Verification(_) => false,
            OracleError::Contract(_) => false,
            OracleError::Chain(_) => true,
            // the next run re-reads project status before resubmitting
            OracleError::Unconfirmed { .. } => true,
            OracleError::Ledger(_) => true,
            OracleError::Config(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;
