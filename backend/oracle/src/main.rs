//! PIFP Oracle: entry point.
//!
//! `verify` runs one verification attempt: fetch the proof artifact, check
//! it against the project's on-chain commitment, record this oracle's vote
//! and, once enough oracles agree, release the escrowed funds.
//! `simulate` runs several oracle identities against one in-memory ledger.
//! `serve` exposes the vote ledger's quorum status over HTTP.

mod api;
mod chain;
mod config;
mod errors;
mod fetcher;
mod ledger;
mod orchestrator;
mod quorum;
mod submitter;
mod verifier;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chain::{ContractClient, SorobanRpc};
use config::Config;
use ledger::{MemoryLedger, QuorumSettingsStore, SqliteLedger, VoteLedger};
use orchestrator::{AttemptReport, Orchestrator, Terminal};
use quorum::QuorumSettings;

#[derive(Parser, Debug)]
#[command(name = "pifp-oracle")]
#[command(about = "PIFP Oracle - verify proofs, vote, and release funds on quorum", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a proof artifact for a project and vote on it
    Verify {
        /// Project ID to verify
        #[arg(long)]
        project_id: u64,

        /// IPFS CID of the proof artifact
        #[arg(long)]
        proof_cid: String,

        /// Compute the hash and evaluate quorum without voting or submitting
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run several oracle identities in this process over a shared in-memory ledger
    Simulate {
        #[arg(long)]
        project_id: u64,

        #[arg(long)]
        proof_cid: String,

        /// Comma-separated oracle addresses, run in order
        #[arg(long, value_delimiter = ',', required = true)]
        oracles: Vec<String>,

        /// Quorum threshold; defaults to the one stored in the database
        #[arg(long)]
        threshold: Option<u32>,

        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Serve the quorum status API
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.validate()?;

    let ledger = Arc::new(
        SqliteLedger::connect(&config.database_url, config.db_max_connections)
            .await
            .context("opening vote ledger")?,
    );

    match cli.command {
        Command::Verify {
            project_id,
            proof_cid,
            dry_run,
        } => verify(&config, ledger, project_id, &proof_cid, dry_run).await,
        Command::Simulate {
            project_id,
            proof_cid,
            oracles,
            threshold,
            dry_run,
        } => {
            let settings = match threshold {
                Some(t) => QuorumSettings::new(t)?,
                None => ledger.quorum_settings().await?,
            };
            simulate(&config, settings, project_id, &proof_cid, &oracles, dry_run).await
        }
        Command::Serve => serve(&config, ledger).await,
    }
}

async fn verify(
    config: &Config,
    ledger: Arc<SqliteLedger>,
    project_id: u64,
    proof_cid: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    info!("PIFP Oracle starting - Project ID: {project_id}, Proof CID: {proof_cid}");

    let chain = SorobanRpc::new(&config.rpc_url, &config.contract_id, config.submit_timeout())?;
    let orchestrator = Orchestrator::from_config(
        config,
        Arc::new(chain) as Arc<dyn ContractClient>,
        Arc::clone(&ledger) as Arc<dyn VoteLedger>,
        ledger as Arc<dyn QuorumSettingsStore>,
    )?;

    let result = tokio::select! {
        result = orchestrator.run(project_id, proof_cid, dry_run) => result,
        _ = tokio::signal::ctrl_c() => {
            // A vote written before this point is kept and is safe to repeat;
            // an unconfirmed release is reconciled against chain state next run.
            warn!("Interrupted, abandoning verification of project {project_id}");
            return Ok(());
        }
    };

    match result {
        Ok(report) => {
            log_report(&report);
            Ok(())
        }
        Err(e) => {
            log_failure(&e);
            Err(e.into())
        }
    }
}

/// Single-process multi-oracle deployment: every identity shares one
/// in-memory ledger and the real contract.
async fn simulate(
    config: &Config,
    settings: QuorumSettings,
    project_id: u64,
    proof_cid: &str,
    oracles: &[String],
    dry_run: bool,
) -> anyhow::Result<()> {
    info!(
        "Simulating {} oracles on project {project_id} with threshold {}",
        oracles.len(),
        settings.threshold()
    );

    let chain: Arc<dyn ContractClient> = Arc::new(SorobanRpc::new(
        &config.rpc_url,
        &config.contract_id,
        config.submit_timeout(),
    )?);
    let ledger = Arc::new(MemoryLedger::new(settings));

    for oracle in oracles {
        let mut oracle_config = config.clone();
        oracle_config.oracle_address = oracle.clone();
        oracle_config.validate()?;

        let orchestrator = Orchestrator::from_config(
            &oracle_config,
            Arc::clone(&chain),
            Arc::clone(&ledger) as Arc<dyn VoteLedger>,
            Arc::clone(&ledger) as Arc<dyn QuorumSettingsStore>,
        )?;
        match orchestrator.run(project_id, proof_cid, dry_run).await {
            Ok(report) => log_report(&report),
            Err(e) => log_failure(&e),
        }
    }

    let votes = ledger.votes(project_id).await?;
    info!("Simulation finished with {} votes recorded", votes.len());
    Ok(())
}

fn log_report(report: &AttemptReport) {
    let project_id = report.project_id;
    match &report.terminal {
        Terminal::Released(tx) => {
            info!("✓ Project {project_id} funds released, transaction {tx}")
        }
        Terminal::AlreadyCompleted => info!("✓ Project {project_id} was already released"),
        Terminal::AwaitingMoreVotes => info!(
            "Vote for {} counted ({} so far); waiting on other oracles",
            report.digest,
            report.quorum.count()
        ),
        Terminal::Skipped(reason) => {
            info!("Skipped ({reason:?}); proof hash {}", report.digest)
        }
    }
}

fn log_failure(e: &errors::OracleError) {
    if e.is_retryable() {
        error!("Verification attempt failed, safe to retry: {e}");
    } else {
        error!("Verification attempt failed, operator action required: {e}");
    }
}

async fn serve(config: &Config, ledger: Arc<SqliteLedger>) -> anyhow::Result<()> {
    let state = Arc::new(api::ApiState {
        ledger: Arc::clone(&ledger) as Arc<dyn VoteLedger>,
        settings: ledger as Arc<dyn QuorumSettingsStore>,
    });
    let app = api::router(state);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
