//! Oracle configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{OracleError, Result};

const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Soroban RPC endpoint (e.g. https://soroban-testnet.stellar.org)
    pub rpc_url: String,
    /// The PIFP contract address (Strkey format, `C...`)
    pub contract_id: String,
    /// This oracle's public address (Strkey format, `G...`); the vote identity
    pub oracle_address: String,
    /// Gateway prefix; artifacts are fetched from `{ipfs_gateway}/{cid}`
    pub ipfs_gateway: String,
    /// Path to the SQLite vote ledger
    pub database_url: String,
    pub db_max_connections: u32,
    pub fetch_timeout_secs: u64,
    /// Artifacts larger than this are rejected without being buffered
    pub max_artifact_bytes: u64,
    /// Extra fetch attempts after a timeout or network failure
    pub fetch_retries: u32,
    pub fetch_backoff_secs: u64,
    /// Per-request timeout for RPC calls
    pub submit_timeout_secs: u64,
    /// Upper bound on waiting for a sent transaction to land
    pub confirm_timeout_secs: u64,
    pub confirm_poll_secs: u64,
    /// Port for the quorum status API
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "https://soroban-testnet.stellar.org".to_string()),
            contract_id: env_var("CONTRACT_ID").map_err(|_| {
                OracleError::Config("CONTRACT_ID environment variable is required".to_string())
            })?,
            oracle_address: env_var("ORACLE_ADDRESS").map_err(|_| {
                OracleError::Config("ORACLE_ADDRESS environment variable is required".to_string())
            })?,
            ipfs_gateway: env_var("IPFS_GATEWAY")
                .unwrap_or_else(|_| "https://ipfs.io/ipfs".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./pifp_oracle.db".to_string()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 5)?,
            fetch_timeout_secs: parse_or("FETCH_TIMEOUT_SECS", 30)?,
            max_artifact_bytes: parse_or("MAX_ARTIFACT_BYTES", DEFAULT_MAX_ARTIFACT_BYTES)?,
            fetch_retries: parse_or("FETCH_RETRIES", 2)?,
            fetch_backoff_secs: parse_or("FETCH_BACKOFF_SECS", 2)?,
            submit_timeout_secs: parse_or("SUBMIT_TIMEOUT_SECS", 30)?,
            confirm_timeout_secs: parse_or("CONFIRM_TIMEOUT_SECS", 60)?,
            confirm_poll_secs: parse_or("CONFIRM_POLL_SECS", 2)?,
            api_port: parse_or("API_PORT", 3002)?,
        })
    }

    /// Check that addresses and URLs are well-formed and bounds are non-zero.
    pub fn validate(&self) -> Result<()> {
        if !self.contract_id.starts_with('C') {
            return Err(OracleError::Config(
                "CONTRACT_ID must be a Stellar contract address (starts with 'C')".to_string(),
            ));
        }
        if !self.oracle_address.starts_with('G') {
            return Err(OracleError::Config(
                "ORACLE_ADDRESS must be a Stellar account address (starts with 'G')".to_string(),
            ));
        }
        for (name, url) in [("RPC_URL", &self.rpc_url), ("IPFS_GATEWAY", &self.ipfs_gateway)] {
            if !url.starts_with("http") {
                return Err(OracleError::Config(format!(
                    "{name} must be a valid HTTP(S) URL"
                )));
            }
        }
        if self.fetch_timeout_secs == 0
            || self.submit_timeout_secs == 0
            || self.confirm_timeout_secs == 0
        {
            return Err(OracleError::Config("timeouts must be non-zero".to_string()));
        }
        if self.confirm_poll_secs == 0 {
            return Err(OracleError::Config(
                "CONFIRM_POLL_SECS must be non-zero".to_string(),
            ));
        }
        if self.max_artifact_bytes == 0 {
            return Err(OracleError::Config(
                "MAX_ARTIFACT_BYTES must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| OracleError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| OracleError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn mock_config() -> Config {
    Config {
        rpc_url: "https://soroban-testnet.stellar.org".to_string(),
        contract_id: "CAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAD2KM".to_string(),
        oracle_address: "GAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
        ipfs_gateway: "https://ipfs.io/ipfs".to_string(),
        database_url: "sqlite::memory:".to_string(),
        db_max_connections: 1,
        fetch_timeout_secs: 5,
        max_artifact_bytes: 1024,
        fetch_retries: 0,
        fetch_backoff_secs: 0,
        submit_timeout_secs: 5,
        confirm_timeout_secs: 10,
        confirm_poll_secs: 1,
        api_port: 3002,
    }
}
