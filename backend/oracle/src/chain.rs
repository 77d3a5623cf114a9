//! Soroban RPC client for the PIFP contract.
//!
//! Reads project state and drives `verify_and_release`. The contract is
//! the only arbiter of whether funds moved; this module reports what it
//! says and classifies its error codes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{ChainError, ContractErrorKind};
use crate::verifier::ProofDigest;

/// Lifecycle status of a project, as stored by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProjectStatus {
    #[serde(alias = "funding")]
    Funding,
    #[serde(alias = "active")]
    Active,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "expired")]
    Expired,
}

/// The subset of the on-chain project the oracle reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSnapshot {
    pub id: u64,
    pub status: ProjectStatus,
    /// Commitment registered at project creation.
    pub proof_hash: ProofDigest,
    /// Unix seconds.
    pub deadline: u64,
    /// Decimal string; i128 on-chain.
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub accepted_tokens: Vec<String>,
}

impl ProjectSnapshot {
    pub fn is_past_deadline(&self, now: u64) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet visible on a ledger.
    Pending,
    Success,
    Failed(Option<ContractErrorKind>),
}

#[async_trait]
pub trait ContractClient: Send + Sync {
    /// `get_project`; `None` when the contract reports no such project.
    async fn get_project(&self, project_id: u64) -> Result<Option<ProjectSnapshot>, ChainError>;

    /// Dry-run `verify_and_release` against current chain state.
    async fn simulate_release(
        &self,
        oracle: &str,
        project_id: u64,
        digest: &ProofDigest,
    ) -> Result<(), ChainError>;

    /// Send `verify_and_release`. Returns once the network accepted the transaction.
    async fn send_release(
        &self,
        oracle: &str,
        project_id: u64,
        digest: &ProofDigest,
    ) -> Result<TxRef, ChainError>;

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus, ChainError>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// ─────────────────────────────────────────────────────────
// Soroban RPC implementation
// ─────────────────────────────────────────────────────────

/// Signing is delegated to the RPC endpoint the oracle is configured
/// against; requests name the oracle address as the invoker.
#[derive(Debug, Clone)]
pub struct SorobanRpc {
    client: Client,
    rpc_url: String,
    contract_id: String,
}

impl SorobanRpc {
    pub fn new(rpc_url: &str, contract_id: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Rpc(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract_id: contract_id.to_string(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Rpc(format!("{method} returned HTTP {status}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{method}: {e}")))?;
        debug!("{method} response: {:?}", body.result);

        if let Some(err) = body.error {
            return Err(ChainError::Rpc(format!(
                "{method} error {}: {}",
                err.code, err.message
            )));
        }
        body.result
            .ok_or_else(|| ChainError::Malformed(format!("empty result from {method}")))
    }

    fn invocation(&self, function: &str, args: Value) -> Value {
        json!({
            "contractId": self.contract_id,
            "function": function,
            "args": args,
        })
    }

    fn release_invocation(&self, oracle: &str, project_id: u64, digest: &ProofDigest) -> Value {
        self.invocation(
            "verify_and_release",
            json!([
                { "address": oracle },
                { "u64": project_id },
                { "bytes": digest.to_hex() },
            ]),
        )
    }
}

#[async_trait]
impl ContractClient for SorobanRpc {
    async fn get_project(&self, project_id: u64) -> Result<Option<ProjectSnapshot>, ChainError> {
        let params = self.invocation("get_project", json!([{ "u64": project_id }]));
        let result = self.call("simulateTransaction", params).await?;

        if let Some(err) = result.get("error") {
            return match parse_contract_error(err)? {
                ContractErrorKind::ProjectNotFound => Ok(None),
                kind => Err(ChainError::Contract(kind)),
            };
        }

        let retval = result
            .get("retval")
            .cloned()
            .ok_or_else(|| ChainError::Malformed("get_project returned no value".to_string()))?;
        let project = serde_json::from_value(retval)
            .map_err(|e| ChainError::Malformed(format!("project {project_id}: {e}")))?;
        Ok(Some(project))
    }

    async fn simulate_release(
        &self,
        oracle: &str,
        project_id: u64,
        digest: &ProofDigest,
    ) -> Result<(), ChainError> {
        let params = self.release_invocation(oracle, project_id, digest);
        let result = self.call("simulateTransaction", params).await?;
        if let Some(err) = result.get("error") {
            return Err(ChainError::Contract(parse_contract_error(err)?));
        }
        Ok(())
    }

    async fn send_release(
        &self,
        oracle: &str,
        project_id: u64,
        digest: &ProofDigest,
    ) -> Result<TxRef, ChainError> {
        let params = self.release_invocation(oracle, project_id, digest);
        let result = self.call("sendTransaction", params).await?;
        if let Some(err) = result.get("error") {
            return Err(ChainError::Contract(parse_contract_error(err)?));
        }

        result
            .get("hash")
            .and_then(Value::as_str)
            .map(|h| TxRef(h.to_string()))
            .ok_or_else(|| ChainError::Malformed("no transaction hash in response".to_string()))
    }

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus, ChainError> {
        let result = self
            .call("getTransaction", json!({ "hash": tx.0 }))
            .await?;

        match result.get("status").and_then(Value::as_str) {
            Some("SUCCESS") => Ok(TxStatus::Success),
            Some("NOT_FOUND") | Some("PENDING") => Ok(TxStatus::Pending),
            Some("FAILED") => {
                let kind = match result.get("error") {
                    Some(err) => Some(parse_contract_error(err)?),
                    None => None,
                };
                Ok(TxStatus::Failed(kind))
            }
            other => Err(ChainError::Malformed(format!(
                "unknown transaction status {other:?}"
            ))),
        }
    }
}

/// Extract the contract error code from a `{"code": …}` object.
/// The RPC may encode the code as a number or a numeric string.
fn parse_contract_error(error: &Value) -> Result<ContractErrorKind, ChainError> {
    let code = error.get("code").and_then(|c| {
        c.as_u64()
            .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
    });
    match code {
        // Out-of-range codes must not wrap onto a known kind.
        Some(code) => Ok(u32::try_from(code)
            .map(ContractErrorKind::from_code)
            .unwrap_or(ContractErrorKind::Unknown(u32::MAX))),
        None => Err(ChainError::Rpc(format!("unrecognised contract error: {error}"))),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
