//! One verification attempt, start to finish.
//!
//! ```text
//! Fetching ──► Verifying ──► Voting ──► Evaluating ──┬──► Submitting ──► Terminal
//!                                                    └──► AwaitingMoreVotes
//! ```
//!
//! The attempt keeps nothing in memory between runs. Everything it needs to
//! resume lives in the vote ledger and on-chain, so re-running an attempt
//! for the same project is always safe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chain::{ContractClient, TxRef};
use crate::config::Config;
use crate::errors::{ContractErrorKind, FetchError, OracleError, Result};
use crate::fetcher::ArtifactFetcher;
use crate::ledger::{QuorumSettingsStore, VoteLedger, VoteOutcome};
use crate::quorum::{QuorumDecision, QuorumEvaluator};
use crate::submitter::{ReleaseSubmitter, SkipReason, SubmitOutcome};
use crate::verifier::{self, ProofArtifact, ProofDigest};

const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Fetching,
    Verifying,
    Voting,
    Evaluating,
    Submitting,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Voting => "voting",
            Self::Evaluating => "evaluating",
            Self::Submitting => "submitting",
        };
        f.write_str(name)
    }
}

/// How an attempt ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Released(TxRef),
    AlreadyCompleted,
    /// This oracle did its part; release waits on its peers.
    AwaitingMoreVotes,
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub project_id: u64,
    pub digest: ProofDigest,
    /// `None` in dry-run mode, where nothing is written.
    pub vote: Option<VoteOutcome>,
    pub quorum: QuorumDecision,
    pub terminal: Terminal,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    fn should_retry(err: &FetchError) -> bool {
        matches!(err, FetchError::Timeout { .. } | FetchError::Network(_))
    }

    fn first_backoff(&self) -> Duration {
        self.initial_backoff.min(Duration::from_secs(MAX_BACKOFF_SECS))
    }

    fn next_backoff(current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(Duration::from_secs(MAX_BACKOFF_SECS))
    }
}

pub struct Orchestrator {
    oracle_address: String,
    fetcher: ArtifactFetcher,
    chain: Arc<dyn ContractClient>,
    ledger: Arc<dyn VoteLedger>,
    settings: Arc<dyn QuorumSettingsStore>,
    submitter: ReleaseSubmitter,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn from_config(
        config: &Config,
        chain: Arc<dyn ContractClient>,
        ledger: Arc<dyn VoteLedger>,
        settings: Arc<dyn QuorumSettingsStore>,
    ) -> Result<Self> {
        let fetcher = ArtifactFetcher::new(
            &config.ipfs_gateway,
            config.fetch_timeout(),
            config.max_artifact_bytes,
        )?;
        let submitter = ReleaseSubmitter::new(
            Arc::clone(&chain),
            config.oracle_address.clone(),
            Duration::from_secs(config.confirm_timeout_secs),
            Duration::from_secs(config.confirm_poll_secs),
        );
        Ok(Self {
            oracle_address: config.oracle_address.clone(),
            fetcher,
            chain,
            ledger,
            settings,
            submitter,
            retry: RetryPolicy {
                retries: config.fetch_retries,
                initial_backoff: Duration::from_secs(config.fetch_backoff_secs),
            },
        })
    }

    /// Run one attempt for `project_id` against the artifact at `cid`.
    ///
    /// In dry-run mode the vote is not recorded and nothing is submitted;
    /// quorum is judged as if this oracle's vote had been counted.
    pub async fn run(&self, project_id: u64, cid: &str, dry_run: bool) -> Result<AttemptReport> {
        let span = info_span!(
            "attempt",
            project_id,
            oracle = %self.oracle_address,
            dry_run
        );
        self.run_inner(project_id, cid, dry_run).instrument(span).await
    }

    async fn run_inner(&self, project_id: u64, cid: &str, dry_run: bool) -> Result<AttemptReport> {
        enter(AttemptState::Fetching);
        let artifact = self.fetch_with_retry(cid).await?;

        enter(AttemptState::Verifying);
        let project = self
            .chain
            .get_project(project_id)
            .await?
            .ok_or(OracleError::Contract(ContractErrorKind::ProjectNotFound))?;
        debug!(
            id = project.id,
            status = ?project.status,
            goal = ?project.goal,
            tokens = project.accepted_tokens.len(),
            "project loaded"
        );
        if project.is_past_deadline(Utc::now().timestamp().max(0) as u64) {
            warn!("Project {project_id} is past its deadline; the contract may refuse release");
        }
        let digest = verifier::verify_commitment(&artifact, &project.proof_hash).map_err(|e| {
            warn!("Artifact {cid} does not match the commitment, not voting: {e}");
            e
        })?;
        info!("Computed proof hash: {digest}");

        enter(AttemptState::Voting);
        let vote = if dry_run {
            None
        } else {
            Some(self.record_vote(project_id, &digest).await?)
        };

        enter(AttemptState::Evaluating);
        let settings = self.settings.quorum_settings().await?;
        let evaluator = QuorumEvaluator::new(self.ledger.as_ref());
        let quorum = if dry_run {
            evaluator
                .evaluate_projected(project_id, &self.oracle_address, &digest, settings)
                .await?
        } else {
            evaluator.evaluate(project_id, &digest, settings).await?
        };

        let report = |terminal| AttemptReport {
            project_id,
            digest,
            vote,
            quorum,
            terminal,
        };

        if let QuorumDecision::Pending { count, threshold } = quorum {
            info!("Awaiting more votes: {count}/{threshold} oracles agree on {digest}");
            return Ok(report(Terminal::AwaitingMoreVotes));
        }

        enter(AttemptState::Submitting);
        let terminal = match self.submitter.submit(project_id, &digest, dry_run).await? {
            SubmitOutcome::Dispatched(tx) => Terminal::Released(tx),
            SubmitOutcome::AlreadyCompleted => Terminal::AlreadyCompleted,
            SubmitOutcome::Skipped(reason) => Terminal::Skipped(reason),
            // The vote stays recorded; it still counts toward a later release.
            SubmitOutcome::Failed(kind) => return Err(OracleError::Contract(kind)),
        };
        Ok(report(terminal))
    }

    async fn fetch_with_retry(&self, cid: &str) -> Result<ProofArtifact> {
        let mut backoff = self.retry.first_backoff();
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(cid).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) if attempt < self.retry.retries && RetryPolicy::should_retry(&e) => {
                    attempt += 1;
                    warn!(
                        "Fetch failed (retry {attempt}/{} in {backoff:?}): {e}",
                        self.retry.retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = RetryPolicy::next_backoff(backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_vote(&self, project_id: u64, digest: &ProofDigest) -> Result<VoteOutcome> {
        let outcome = self
            .ledger
            .record_vote(project_id, &self.oracle_address, digest)
            .await?;
        match outcome {
            VoteOutcome::Inserted => info!("Vote recorded for {digest}"),
            VoteOutcome::AlreadyRecorded { existing } if existing == *digest => {
                info!("Vote for {digest} already on record")
            }
            VoteOutcome::AlreadyRecorded { existing } => warn!(
                "Earlier vote for {existing} is kept; this oracle cannot change its vote to {digest}"
            ),
        }
        Ok(outcome)
    }
}

fn enter(state: AttemptState) {
    info!(%state, "entering state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockContract;
    use crate::chain::ProjectStatus;
    use crate::config::mock_config;
    use crate::ledger::MemoryLedger;
    use crate::quorum::QuorumSettings;
    use crate::verifier::compute_sha256;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROOF: &[u8] = b"solar panels installed at site 7";
    const CID: &str = "QmProof";

    struct Harness {
        gateway: MockServer,
        contract: Arc<MockContract>,
        ledger: Arc<MemoryLedger>,
    }

    impl Harness {
        async fn new(threshold: u32, status: ProjectStatus) -> Self {
            let gateway = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path(format!("/{CID}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(PROOF.to_vec()))
                .mount(&gateway)
                .await;
            Self {
                gateway,
                contract: Arc::new(MockContract::with_project(
                    7,
                    compute_sha256(PROOF),
                    status,
                )),
                ledger: Arc::new(MemoryLedger::new(QuorumSettings::new(threshold).unwrap())),
            }
        }

        fn oracle(&self, address: &str) -> Orchestrator {
            let mut config = mock_config();
            config.ipfs_gateway = self.gateway.uri();
            config.oracle_address = address.to_string();
            config.fetch_timeout_secs = 1;
            Orchestrator::from_config(
                &config,
                Arc::clone(&self.contract) as Arc<dyn ContractClient>,
                Arc::clone(&self.ledger) as Arc<dyn VoteLedger>,
                Arc::clone(&self.ledger) as Arc<dyn QuorumSettingsStore>,
            )
            .unwrap()
        }

        async fn rows(&self) -> usize {
            self.ledger.votes(7).await.unwrap().len()
        }
    }

    #[tokio::test]
    async fn single_oracle_releases() {
        let h = Harness::new(1, ProjectStatus::Active).await;

        let report = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert_eq!(report.terminal, Terminal::Released(TxRef("tx-1".to_string())));
        assert_eq!(report.digest, compute_sha256(PROOF));
        assert_eq!(report.vote, Some(VoteOutcome::Inserted));
        assert_eq!(h.rows().await, 1);
        assert_eq!(h.contract.sends(), 1);
    }

    #[tokio::test]
    async fn second_oracle_completes_quorum() {
        let h = Harness::new(2, ProjectStatus::Active).await;

        let first = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert_eq!(first.quorum, QuorumDecision::Pending { count: 1, threshold: 2 });
        assert_eq!(first.terminal, Terminal::AwaitingMoreVotes);
        assert_eq!(h.contract.sends(), 0);

        let second = h.oracle("GORACLE_B").run(7, CID, false).await.unwrap();
        assert_eq!(
            second.quorum,
            QuorumDecision::ReachedQuorum { count: 2, threshold: 2 }
        );
        assert!(matches!(second.terminal, Terminal::Released(_)));
        assert_eq!(h.contract.sends(), 1);

        // A rerun by the first oracle lands on the completed project.
        let rerun = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert_eq!(rerun.vote, Some(VoteOutcome::AlreadyRecorded { existing: rerun.digest }));
        assert_eq!(rerun.terminal, Terminal::AlreadyCompleted);
        assert_eq!(h.contract.sends(), 1);
        assert_eq!(h.rows().await, 2);
    }

    #[tokio::test]
    async fn stale_votes_do_not_count() {
        let h = Harness::new(2, ProjectStatus::Active).await;
        let stale = compute_sha256(b"superseded artifact");
        h.ledger.record_vote(7, "GORACLE_B", &stale).await.unwrap();

        let report = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert_eq!(report.quorum, QuorumDecision::Pending { count: 1, threshold: 2 });
        assert_eq!(report.terminal, Terminal::AwaitingMoreVotes);
        // kept for audit
        assert_eq!(h.rows().await, 2);
    }

    #[tokio::test]
    async fn mismatched_artifact_records_no_vote() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        if let Some(p) = h.contract.project.lock().unwrap().as_mut() {
            p.proof_hash = compute_sha256(b"the artifact that was committed");
        }

        let err = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Verification(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.rows().await, 0);
        assert_eq!(h.contract.sends(), 0);
    }

    #[tokio::test]
    async fn unknown_project_fails_before_voting() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        *h.contract.project.lock().unwrap() = None;

        let err = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::Contract(ContractErrorKind::ProjectNotFound)
        ));
        assert_eq!(h.rows().await, 0);
    }

    #[tokio::test]
    async fn fetch_timeout_writes_nothing_and_retry_succeeds() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        h.gateway.reset().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(PROOF.to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&h.gateway)
            .await;

        let err = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Fetch(FetchError::Timeout { .. })));
        assert!(err.is_retryable());
        assert_eq!(h.rows().await, 0);

        h.gateway.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PROOF.to_vec()))
            .mount(&h.gateway)
            .await;

        let report = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert!(matches!(report.terminal, Terminal::Released(_)));
        assert_eq!(h.rows().await, 1);
    }

    #[tokio::test]
    async fn transient_fetch_failure_is_retried() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        h.gateway.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&h.gateway)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PROOF.to_vec()))
            .mount(&h.gateway)
            .await;

        let mut oracle = h.oracle("GORACLE_A");
        oracle.retry = RetryPolicy {
            retries: 1,
            initial_backoff: Duration::ZERO,
        };
        let report = oracle.run(7, CID, false).await.unwrap();
        assert!(matches!(report.terminal, Terminal::Released(_)));
    }

    #[tokio::test]
    async fn missing_artifact_is_not_retried() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        h.gateway.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&h.gateway)
            .await;

        let mut oracle = h.oracle("GORACLE_A");
        oracle.retry.retries = 3;
        let err = oracle.run(7, CID, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Fetch(FetchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rejected_cid_is_not_retried() {
        let h = Harness::new(1, ProjectStatus::Active).await;
        h.gateway.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&h.gateway)
            .await;

        let mut oracle = h.oracle("GORACLE_A");
        oracle.retry.retries = 3;
        let err = oracle.run(7, CID, false).await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::Fetch(FetchError::Rejected { status: 400, .. })
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn backoff_is_capped_without_overflow() {
        let cap = Duration::from_secs(MAX_BACKOFF_SECS);
        let policy = RetryPolicy {
            retries: 5,
            initial_backoff: Duration::from_secs(u64::MAX),
        };
        assert_eq!(policy.first_backoff(), cap);
        assert_eq!(RetryPolicy::next_backoff(Duration::MAX), cap);
        assert_eq!(
            RetryPolicy::next_backoff(Duration::from_secs(2)),
            Duration::from_secs(4)
        );
        assert_eq!(RetryPolicy::next_backoff(Duration::from_secs(40)), cap);
    }

    #[tokio::test]
    async fn dry_run_with_quorum_reached_skips_without_writing() {
        let h = Harness::new(2, ProjectStatus::Active).await;
        let digest = compute_sha256(PROOF);
        h.ledger.record_vote(7, "GORACLE_B", &digest).await.unwrap();
        h.ledger.record_vote(7, "GORACLE_C", &digest).await.unwrap();

        let report = h.oracle("GORACLE_A").run(7, CID, true).await.unwrap();
        assert_eq!(report.terminal, Terminal::Skipped(SkipReason::DryRun));
        assert_eq!(report.digest, digest);
        assert_eq!(report.vote, None);
        assert_eq!(
            report.quorum,
            QuorumDecision::ReachedQuorum { count: 3, threshold: 2 }
        );
        assert_eq!(h.rows().await, 2);
        assert_eq!(h.contract.sends(), 0);
    }

    #[tokio::test]
    async fn dry_run_below_quorum_awaits() {
        let h = Harness::new(3, ProjectStatus::Active).await;

        let report = h.oracle("GORACLE_A").run(7, CID, true).await.unwrap();
        assert_eq!(report.quorum, QuorumDecision::Pending { count: 1, threshold: 3 });
        assert_eq!(report.terminal, Terminal::AwaitingMoreVotes);
        assert_eq!(h.rows().await, 0);
    }

    #[tokio::test]
    async fn completed_project_is_success() {
        let h = Harness::new(1, ProjectStatus::Completed).await;

        let report = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap();
        assert_eq!(report.terminal, Terminal::AlreadyCompleted);
        assert_eq!(h.contract.sends(), 0);
    }

    #[tokio::test]
    async fn contract_refusal_keeps_the_vote() {
        let h = Harness::new(1, ProjectStatus::Expired).await;

        let err = h.oracle("GORACLE_A").run(7, CID, false).await.unwrap_err();
        assert!(matches!(err, OracleError::Contract(ContractErrorKind::Expired)));
        assert!(!err.is_retryable());
        assert_eq!(h.rows().await, 1);
    }

    #[tokio::test]
    async fn racing_oracles_release_once() {
        let h = Harness::new(2, ProjectStatus::Active).await;
        let digest = compute_sha256(PROOF);
        h.ledger.record_vote(7, "GORACLE_C", &digest).await.unwrap();

        let a = h.oracle("GORACLE_A");
        let b = h.oracle("GORACLE_B");
        let (ra, rb) = tokio::join!(a.run(7, CID, false), b.run(7, CID, false));
        let terminals = [ra.unwrap().terminal, rb.unwrap().terminal];

        assert_eq!(
            terminals.iter().filter(|t| matches!(t, Terminal::Released(_))).count(),
            1
        );
        assert!(terminals.contains(&Terminal::AlreadyCompleted));
        assert_eq!(h.contract.sends(), 1);
    }
}
