//! Axum REST API over the vote ledger.
//!
//! Read-only apart from the admin threshold route. Votes are never accepted
//! over HTTP: an oracle only votes on an artifact it fetched and hashed itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::ledger::{OracleVote, QuorumSettingsStore, VoteLedger};
use crate::quorum::{self, QuorumSettings};

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<dyn VoteLedger>,
    pub settings: Arc<dyn QuorumSettingsStore>,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuorumStatus {
    pub project_id: u64,
    pub threshold: u32,
    pub votes: Vec<VoteInfo>,
    pub consensus_reached: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteInfo {
    pub proof_hash: String,
    pub count: u32,
}

#[derive(Serialize)]
pub struct VotesResponse {
    pub project_id: u64,
    pub count: usize,
    pub votes: Vec<OracleVote>,
}

#[derive(Deserialize)]
pub struct ThresholdRequest {
    pub threshold: u32,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/projects/:id/quorum", get(get_project_quorum))
        .route("/projects/:id/votes", get(get_project_votes))
        .route("/admin/quorum", post(set_quorum_threshold))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Group a project's votes by digest and judge each group against `settings`.
pub fn quorum_status(
    project_id: u64,
    votes: &[OracleVote],
    settings: QuorumSettings,
) -> QuorumStatus {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for vote in votes {
        *counts.entry(vote.proof_hash.to_hex()).or_default() += 1;
    }
    let consensus_reached = counts
        .values()
        .any(|&count| quorum::decide(count, settings).reached());

    QuorumStatus {
        project_id,
        threshold: settings.threshold(),
        votes: counts
            .into_iter()
            .map(|(proof_hash, count)| VoteInfo { proof_hash, count })
            .collect(),
        consensus_reached,
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /projects/:id/quorum`
pub async fn get_project_quorum(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<u64>,
) -> impl IntoResponse {
    let settings = match state.settings.quorum_settings().await {
        Ok(s) => s,
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.ledger.votes(project_id).await {
        Ok(votes) => (
            StatusCode::OK,
            Json(quorum_status(project_id, &votes, settings)),
        )
            .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /projects/:id/votes`
///
/// Full audit trail, including votes for superseded artifacts.
pub async fn get_project_votes(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<u64>,
) -> impl IntoResponse {
    match state.ledger.votes(project_id).await {
        Ok(votes) => (
            StatusCode::OK,
            Json(VotesResponse {
                project_id,
                count: votes.len(),
                votes,
            }),
        )
            .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `POST /admin/quorum`
pub async fn set_quorum_threshold(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<ThresholdRequest>,
) -> impl IntoResponse {
    let settings = match QuorumSettings::new(payload.threshold) {
        Ok(s) => s,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    match state.settings.set_quorum_settings(settings).await {
        Ok(()) => {
            info!("Quorum threshold updated to {}", settings.threshold());
            (StatusCode::OK, Json(settings)).into_response()
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
