//! Vote ledger: one attestation per (project, oracle).
//!
//! The ledger is a capability rather than a concrete store: a local SQLite
//! file, a database shared by several oracles, or an in-process map all
//! satisfy the same contract, and the quorum logic never knows which one it
//! is talking to.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

#[cfg(test)]
pub(crate) use sqlite::memory_ledger;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::LedgerError;
use crate::quorum::QuorumSettings;
use crate::verifier::ProofDigest;

/// A persisted oracle attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleVote {
    pub project_id: u64,
    pub oracle_address: String,
    pub proof_hash: ProofDigest,
    /// Unix seconds.
    pub voted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Inserted,
    /// The oracle already voted on this project. `existing` is the digest it
    /// voted for first, which is kept even when it differs from the new one.
    AlreadyRecorded { existing: ProofDigest },
}

#[async_trait]
pub trait VoteLedger: Send + Sync {
    /// Record a vote, first-vote-wins. Repeats never duplicate or error.
    async fn record_vote(
        &self,
        project_id: u64,
        oracle_address: &str,
        digest: &ProofDigest,
    ) -> Result<VoteOutcome, LedgerError>;

    /// Distinct oracles whose vote on `project_id` is exactly `digest`.
    async fn tally(&self, project_id: u64, digest: &ProofDigest) -> Result<u32, LedgerError>;

    /// The vote `oracle_address` cast on `project_id`, if any.
    async fn vote_of(
        &self,
        project_id: u64,
        oracle_address: &str,
    ) -> Result<Option<OracleVote>, LedgerError>;

    /// Audit trail for a project, oldest first.
    async fn votes(&self, project_id: u64) -> Result<Vec<OracleVote>, LedgerError>;
}

/// Storage for the global quorum threshold.
#[async_trait]
pub trait QuorumSettingsStore: Send + Sync {
    async fn quorum_settings(&self) -> Result<QuorumSettings, LedgerError>;

    async fn set_quorum_settings(&self, settings: QuorumSettings) -> Result<(), LedgerError>;
}
