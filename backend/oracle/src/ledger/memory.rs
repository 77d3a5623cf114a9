//! In-process vote ledger.
//!
//! Lets several oracle identities share one process, which is how quorum
//! behaviour is simulated without standing up a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{OracleVote, QuorumSettingsStore, VoteLedger, VoteOutcome};
use crate::errors::LedgerError;
use crate::quorum::QuorumSettings;
use crate::verifier::ProofDigest;

#[derive(Debug, Default)]
pub struct MemoryLedger {
    votes: RwLock<Vec<OracleVote>>,
    index: RwLock<HashMap<(u64, String), usize>>,
    settings: RwLock<QuorumSettings>,
}

impl MemoryLedger {
    pub fn new(settings: QuorumSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VoteLedger for MemoryLedger {
    async fn record_vote(
        &self,
        project_id: u64,
        oracle_address: &str,
        digest: &ProofDigest,
    ) -> Result<VoteOutcome, LedgerError> {
        // Lock order: index, then votes. Holding the index write lock across
        // the insert makes check-and-insert a single step.
        let mut index = self.index.write().await;
        let key = (project_id, oracle_address.to_string());
        if let Some(&pos) = index.get(&key) {
            let votes = self.votes.read().await;
            return Ok(VoteOutcome::AlreadyRecorded {
                existing: votes[pos].proof_hash,
            });
        }

        let mut votes = self.votes.write().await;
        votes.push(OracleVote {
            project_id,
            oracle_address: oracle_address.to_string(),
            proof_hash: *digest,
            voted_at: Utc::now().timestamp(),
        });
        index.insert(key, votes.len() - 1);
        Ok(VoteOutcome::Inserted)
    }

    async fn tally(&self, project_id: u64, digest: &ProofDigest) -> Result<u32, LedgerError> {
        let votes = self.votes.read().await;
        // One row per (project, oracle) already, so counting rows counts oracles.
        let count = votes
            .iter()
            .filter(|v| v.project_id == project_id && v.proof_hash == *digest)
            .count();
        Ok(count as u32)
    }

    async fn vote_of(
        &self,
        project_id: u64,
        oracle_address: &str,
    ) -> Result<Option<OracleVote>, LedgerError> {
        let index = self.index.read().await;
        let votes = self.votes.read().await;
        Ok(index
            .get(&(project_id, oracle_address.to_string()))
            .map(|&pos| votes[pos].clone()))
    }

    async fn votes(&self, project_id: u64) -> Result<Vec<OracleVote>, LedgerError> {
        let votes = self.votes.read().await;
        Ok(votes
            .iter()
            .filter(|v| v.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuorumSettingsStore for MemoryLedger {
    async fn quorum_settings(&self) -> Result<QuorumSettings, LedgerError> {
        Ok(*self.settings.read().await)
    }

    async fn set_quorum_settings(&self, settings: QuorumSettings) -> Result<(), LedgerError> {
        *self.settings.write().await = settings;
        Ok(())
    }
}
