//! Quorum evaluation.
//!
//! The threshold is handed in on every call instead of living in a global,
//! so an administrator raising it takes effect on the very next evaluation
//! and no vote ever needs replaying.

use serde::Serialize;

use crate::errors::{LedgerError, OracleError};
use crate::ledger::VoteLedger;
use crate::verifier::ProofDigest;

/// Number of distinct oracle votes on one digest required before release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumSettings {
    threshold: u32,
}

impl QuorumSettings {
    /// A threshold of 1 is single-oracle trust; 0 would release on no evidence.
    pub fn new(threshold: u32) -> Result<Self, OracleError> {
        if threshold == 0 {
            return Err(OracleError::Config(
                "quorum threshold must be at least 1".to_string(),
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self { threshold: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QuorumDecision {
    ReachedQuorum { count: u32, threshold: u32 },
    Pending { count: u32, threshold: u32 },
}

impl QuorumDecision {
    pub fn reached(&self) -> bool {
        matches!(self, QuorumDecision::ReachedQuorum { .. })
    }

    pub fn count(&self) -> u32 {
        match *self {
            QuorumDecision::ReachedQuorum { count, .. } | QuorumDecision::Pending { count, .. } => {
                count
            }
        }
    }
}

/// Decide on a tally that has already been read.
pub fn decide(count: u32, settings: QuorumSettings) -> QuorumDecision {
    let threshold = settings.threshold();
    if count >= threshold {
        QuorumDecision::ReachedQuorum { count, threshold }
    } else {
        QuorumDecision::Pending { count, threshold }
    }
}

/// Reads tallies from a ledger and applies [`decide`]. Never writes.
pub struct QuorumEvaluator<'a> {
    ledger: &'a dyn VoteLedger,
}

impl<'a> QuorumEvaluator<'a> {
    pub fn new(ledger: &'a dyn VoteLedger) -> Self {
        Self { ledger }
    }

    pub async fn evaluate(
        &self,
        project_id: u64,
        digest: &ProofDigest,
        settings: QuorumSettings,
    ) -> Result<QuorumDecision, LedgerError> {
        let count = self.ledger.tally(project_id, digest).await?;
        Ok(decide(count, settings))
    }

    /// Evaluate as if `oracle_address` had voted `digest`, without writing.
    ///
    /// An oracle that already holds a vote on the project adds nothing: its
    /// recorded vote is either already in the tally or, being first-wins,
    /// would not change.
    pub async fn evaluate_projected(
        &self,
        project_id: u64,
        oracle_address: &str,
        digest: &ProofDigest,
        settings: QuorumSettings,
    ) -> Result<QuorumDecision, LedgerError> {
        let mut count = self.ledger.tally(project_id, digest).await?;
        if self.ledger.vote_of(project_id, oracle_address).await?.is_none() {
            count += 1;
        }
        Ok(decide(count, settings))
    }
}
