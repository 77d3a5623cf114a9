//! SQLite-backed vote ledger: migrations, vote writes and tallies.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::{OracleVote, QuorumSettingsStore, VoteLedger, VoteOutcome};
use crate::errors::LedgerError;
use crate::quorum::QuorumSettings;
use crate::verifier::ProofDigest;

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    project_id: i64,
    oracle_address: String,
    proof_hash: String,
    voted_at: i64,
}

impl TryFrom<VoteRow> for OracleVote {
    type Error = LedgerError;

    fn try_from(row: VoteRow) -> Result<Self, Self::Error> {
        Ok(OracleVote {
            project_id: u64::try_from(row.project_id)
                .map_err(|_| LedgerError::Corrupt(format!("project id {}", row.project_id)))?,
            proof_hash: row
                .proof_hash
                .parse()
                .map_err(|e| LedgerError::Corrupt(format!("proof hash {}: {e}", row.proof_hash)))?,
            oracle_address: row.oracle_address,
            voted_at: row.voted_at,
        })
    }
}

impl SqliteLedger {
    /// Open (creating if needed) the database and run pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{database_url}")
        };

        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Vote ledger migrations applied successfully");
        Ok(Self { pool })
    }
}

fn sql_id(project_id: u64) -> Result<i64, LedgerError> {
    i64::try_from(project_id)
        .map_err(|_| LedgerError::Corrupt(format!("project id {project_id} out of range")))
}

#[async_trait]
impl VoteLedger for SqliteLedger {
    async fn record_vote(
        &self,
        project_id: u64,
        oracle_address: &str,
        digest: &ProofDigest,
    ) -> Result<VoteOutcome, LedgerError> {
        let id = sql_id(project_id)?;

        // The UNIQUE constraint makes this a single atomic decision even
        // with several oracles writing to the same file.
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO oracle_votes (project_id, oracle_address, proof_hash, voted_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (project_id, oracle_address) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(oracle_address)
        .bind(digest.to_hex())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            return Ok(VoteOutcome::Inserted);
        }

        let existing = self
            .vote_of(project_id, oracle_address)
            .await?
            .ok_or_else(|| {
                LedgerError::Corrupt(format!(
                    "vote for project {project_id} by {oracle_address} conflicted but is missing"
                ))
            })?;
        Ok(VoteOutcome::AlreadyRecorded {
            existing: existing.proof_hash,
        })
    }

    async fn tally(&self, project_id: u64, digest: &ProofDigest) -> Result<u32, LedgerError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT oracle_address)
            FROM   oracle_votes
            WHERE  project_id = ?1 AND proof_hash = ?2
            "#,
        )
        .bind(sql_id(project_id)?)
        .bind(digest.to_hex())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn vote_of(
        &self,
        project_id: u64,
        oracle_address: &str,
    ) -> Result<Option<OracleVote>, LedgerError> {
        let row = sqlx::query_as::<_, VoteRow>(
            r#"
            SELECT project_id, oracle_address, proof_hash, voted_at
            FROM   oracle_votes
            WHERE  project_id = ?1 AND oracle_address = ?2
            "#,
        )
        .bind(sql_id(project_id)?)
        .bind(oracle_address)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OracleVote::try_from).transpose()
    }

    async fn votes(&self, project_id: u64) -> Result<Vec<OracleVote>, LedgerError> {
        let rows = sqlx::query_as::<_, VoteRow>(
            r#"
            SELECT project_id, oracle_address, proof_hash, voted_at
            FROM   oracle_votes
            WHERE  project_id = ?1
            ORDER  BY voted_at ASC, id ASC
            "#,
        )
        .bind(sql_id(project_id)?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OracleVote::try_from).collect()
    }
}

#[async_trait]
impl QuorumSettingsStore for SqliteLedger {
    /// Falls back to single-oracle trust when the settings row is absent.
    async fn quorum_settings(&self) -> Result<QuorumSettings, LedgerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT threshold FROM quorum_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(QuorumSettings::default()),
            Some((raw,)) => u32::try_from(raw)
                .ok()
                .and_then(|t| QuorumSettings::new(t).ok())
                .ok_or_else(|| LedgerError::Corrupt(format!("quorum threshold {raw}"))),
        }
    }

    async fn set_quorum_settings(&self, settings: QuorumSettings) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO quorum_settings (id, threshold) VALUES (1, ?1)
            ON CONFLICT (id) DO UPDATE SET threshold = excluded.threshold
            "#,
        )
        .bind(i64::from(settings.threshold()))
        .execute(&self.pool)
        .await?;
        info!("Quorum threshold set to {}", settings.threshold());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn memory_ledger() -> SqliteLedger {
    // One connection: every `sqlite::memory:` connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    SqliteLedger::from_pool(pool).await.unwrap()
}
