//! Release submission.
//!
//! Several oracles may decide quorum was reached at the same moment and all
//! race to call `verify_and_release`. Exactly one wins on-chain; the others
//! see "already completed", which is the outcome they wanted anyway.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::chain::{ContractClient, ProjectStatus, TxRef, TxStatus};
use crate::errors::{ChainError, ContractErrorKind, OracleError, Result};
use crate::verifier::ProofDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Our transaction landed and released the funds.
    Dispatched(TxRef),
    /// Someone (possibly us, on an earlier run) already released them.
    AlreadyCompleted,
    Skipped(SkipReason),
    Failed(ContractErrorKind),
}

pub struct ReleaseSubmitter {
    chain: Arc<dyn ContractClient>,
    oracle_address: String,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl ReleaseSubmitter {
    pub fn new(
        chain: Arc<dyn ContractClient>,
        oracle_address: impl Into<String>,
        confirm_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain,
            oracle_address: oracle_address.into(),
            confirm_timeout,
            poll_interval,
        }
    }

    /// Submit `verify_and_release(project_id, digest)` at most once.
    ///
    /// Transport failures come back as `Err`; anything the contract itself
    /// decided comes back as a [`SubmitOutcome`].
    pub async fn submit(
        &self,
        project_id: u64,
        digest: &ProofDigest,
        dry_run: bool,
    ) -> Result<SubmitOutcome> {
        if dry_run {
            warn!("DRY RUN MODE - transaction will not be submitted");
            info!("Would submit verify_and_release for project {project_id} with hash {digest}");
            return Ok(SubmitOutcome::Skipped(SkipReason::DryRun));
        }

        // A previous run may have been cut off mid-submission; the chain
        // says whether that transaction landed.
        if let Some(outcome) = self.reconcile(project_id).await? {
            return Ok(outcome);
        }

        info!("Simulating verify_and_release for project {project_id}");
        if let Err(e) = self
            .chain
            .simulate_release(&self.oracle_address, project_id, digest)
            .await
        {
            return classify(e);
        }

        info!("Submitting verify_and_release for project {project_id}");
        let tx = match self
            .chain
            .send_release(&self.oracle_address, project_id, digest)
            .await
        {
            Ok(tx) => tx,
            Err(e) => return classify(e),
        };
        info!("Transaction {tx} accepted, waiting for confirmation");

        match tokio::time::timeout(self.confirm_timeout, self.await_confirmation(&tx)).await {
            Ok(status) => self.settle(project_id, tx, status?).await,
            Err(_) => {
                warn!("Transaction {tx} not confirmed within {:?}", self.confirm_timeout);
                Err(OracleError::Unconfirmed { tx_hash: tx.0 })
            }
        }
    }

    /// Terminal outcome from current project status, or `None` if release is still possible.
    async fn reconcile(&self, project_id: u64) -> Result<Option<SubmitOutcome>> {
        let project = match self.chain.get_project(project_id).await? {
            Some(project) => project,
            None => return Ok(Some(SubmitOutcome::Failed(ContractErrorKind::ProjectNotFound))),
        };
        match project.status {
            ProjectStatus::Completed => {
                info!("Project {project_id} already completed on-chain, nothing to submit");
                Ok(Some(SubmitOutcome::AlreadyCompleted))
            }
            ProjectStatus::Expired => Ok(Some(SubmitOutcome::Failed(ContractErrorKind::Expired))),
            ProjectStatus::Funding | ProjectStatus::Active => Ok(None),
        }
    }

    async fn await_confirmation(&self, tx: &TxRef) -> Result<TxStatus> {
        loop {
            match self.chain.transaction_status(tx).await {
                Ok(TxStatus::Pending) => {}
                Ok(status) => return Ok(status),
                Err(e @ (ChainError::Rpc(_) | ChainError::Timeout)) => {
                    warn!("Polling transaction {tx} failed, retrying: {e}");
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn settle(&self, project_id: u64, tx: TxRef, status: TxStatus) -> Result<SubmitOutcome> {
        match status {
            TxStatus::Success => {
                info!("Project {project_id} funds released in transaction {tx}");
                Ok(SubmitOutcome::Dispatched(tx))
            }
            TxStatus::Failed(Some(kind)) => classify(ChainError::Contract(kind)),
            TxStatus::Failed(None) | TxStatus::Pending => {
                // Lost a race the simulation could not see.
                match self.reconcile(project_id).await? {
                    Some(outcome) => Ok(outcome),
                    None => Err(ChainError::TransactionFailed(tx.0).into()),
                }
            }
        }
    }
}

fn classify(e: ChainError) -> Result<SubmitOutcome> {
    match e {
        ChainError::Contract(ContractErrorKind::AlreadyCompleted) => {
            info!("Contract reports release already completed");
            Ok(SubmitOutcome::AlreadyCompleted)
        }
        ChainError::Contract(kind) => {
            warn!("Contract rejected release: {kind}");
            Ok(SubmitOutcome::Failed(kind))
        }
        other => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::chain::mock::MockContract;
    use crate::verifier::compute_sha256;

    const ORACLE: &str = "GORACLE_A";

    fn submitter(contract: &Arc<MockContract>) -> ReleaseSubmitter {
        ReleaseSubmitter::new(
            Arc::clone(contract) as Arc<dyn ContractClient>,
            ORACLE,
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));

        let outcome = submitter(&contract).submit(7, &h, true).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::DryRun));
        assert_eq!(contract.sends(), 0);
        assert_eq!(contract.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_submission_dispatches_once() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));

        let outcome = submitter(&contract).submit(7, &h, false).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Dispatched(TxRef("tx-1".to_string())));
        assert_eq!(contract.sends(), 1);
        assert_eq!(contract.status(), Some(ProjectStatus::Completed));
    }

    #[tokio::test]
    async fn completed_project_is_success_without_sending() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Completed));

        let outcome = submitter(&contract).submit(7, &h, false).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyCompleted);
        assert_eq!(contract.sends(), 0);
    }

    #[tokio::test]
    async fn second_racer_loses_gracefully() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        let first = submitter(&contract);
        let second = submitter(&contract);

        assert!(matches!(
            first.submit(7, &h, false).await.unwrap(),
            SubmitOutcome::Dispatched(_)
        ));
        assert_eq!(
            second.submit(7, &h, false).await.unwrap(),
            SubmitOutcome::AlreadyCompleted
        );
        assert_eq!(contract.sends(), 1);
    }

    #[tokio::test]
    async fn simulation_already_completed_is_success() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        *contract.simulate_error.lock().unwrap() =
            Some(ChainError::Contract(ContractErrorKind::AlreadyCompleted));

        let outcome = submitter(&contract).submit(7, &h, false).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyCompleted);
        assert_eq!(contract.sends(), 0);
    }

    #[tokio::test]
    async fn contract_refusals_are_classified() {
        let h = compute_sha256(b"proof");

        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Expired));
        assert_eq!(
            submitter(&contract).submit(7, &h, false).await.unwrap(),
            SubmitOutcome::Failed(ContractErrorKind::Expired)
        );

        let contract = Arc::new(MockContract::default());
        assert_eq!(
            submitter(&contract).submit(7, &h, false).await.unwrap(),
            SubmitOutcome::Failed(ContractErrorKind::ProjectNotFound)
        );

        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        *contract.simulate_error.lock().unwrap() =
            Some(ChainError::Contract(ContractErrorKind::NotAuthorized));
        assert_eq!(
            submitter(&contract).submit(7, &h, false).await.unwrap(),
            SubmitOutcome::Failed(ContractErrorKind::NotAuthorized)
        );

        let other = compute_sha256(b"other");
        let contract = Arc::new(MockContract::with_project(7, other, ProjectStatus::Active));
        assert_eq!(
            submitter(&contract).submit(7, &h, false).await.unwrap(),
            SubmitOutcome::Failed(ContractErrorKind::HashMismatchOnChain)
        );
        assert_eq!(contract.sends(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_an_error_not_a_contract_outcome() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        *contract.simulate_error.lock().unwrap() = Some(ChainError::Timeout);

        let err = submitter(&contract).submit(7, &h, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Chain(ChainError::Timeout)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_pending_transaction() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        contract
            .statuses
            .lock()
            .unwrap()
            .extend([TxStatus::Pending, TxStatus::Pending, TxStatus::Success]);

        let outcome = submitter(&contract).submit(7, &h, false).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Dispatched(_)));
        assert!(contract.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_transaction_times_out() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        contract
            .statuses
            .lock()
            .unwrap()
            .extend(std::iter::repeat(TxStatus::Pending).take(1_000));

        let err = submitter(&contract).submit(7, &h, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Unconfirmed { ref tx_hash } if tx_hash == "tx-1"));
    }

    #[tokio::test]
    async fn failed_transaction_after_lost_race_is_success() {
        let h = compute_sha256(b"proof");
        let contract = Arc::new(MockContract::with_project(7, h, ProjectStatus::Active));
        // The mock marks the project completed on send, so a bare failure
        // reconciles to "someone else got there first".
        contract
            .statuses
            .lock()
            .unwrap()
            .push_back(TxStatus::Failed(None));

        let outcome = submitter(&contract).submit(7, &h, false).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyCompleted);
    }
}
