//! HTTP client API for a replica
//!
//! Endpoints for external clients:
//! - `POST /client/submit` - submit a command to the leader
//! - `GET /client/status` - node role, term, leader, and commit progress
//! - `GET /kv/:key` - read a key directly from the local KV store

use std::sync::atomic::Ordering;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::replica_core::{Role, SharedCore};
use crate::core::replica_server::{ReplicaHandle, ReplicationError};
use crate::state_machine::kv::SharedKvStore;

/// State for client HTTP handlers: the handle for submits, the core for
/// status reads, and the KV store for direct reads
#[derive(Clone)]
pub struct ClientState {
    pub handle: ReplicaHandle,
    pub core: SharedCore,
    pub kv_store: Option<SharedKvStore>,
}

/// Request body for submitting a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// The command to submit (e.g., "SET key value")
    pub command: String,
}

/// Response from a successful submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Result from the state machine
    pub result: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

/// Response for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: u64,
    pub role: String,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub last_log_index: u64,
}

/// Response for a KV read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetResponse {
    pub value: Option<String>,
}

/// Create an axum router for the client API
pub fn create_client_router(state: ClientState) -> Router {
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/status", get(handle_status))
        .route("/kv/:key", get(handle_kv_get))
        .with_state(state)
}

async fn handle_submit(
    State(state): State<ClientState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.handle.submit(req.command.into_bytes()).await {
        Ok(result) => Ok(Json(SubmitResponse { result })),
        Err(ReplicationError::NotLeader { leader_hint }) => Err((
            StatusCode::MISDIRECTED_REQUEST,
            Json(ErrorResponse {
                error: "not the leader".to_string(),
                leader_hint,
            }),
        )),
        Err(ReplicationError::StateMachine(message)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: message,
                leader_hint: None,
            }),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                leader_hint: None,
            }),
        )),
    }
}

async fn handle_status(State(state): State<ClientState>) -> Json<StatusResponse> {
    let core = state.core.lock().await;
    let role = match core.role {
        Role::Follower => "follower",
        Role::Candidate => "candidate",
        Role::Leader => "leader",
    };
    Json(StatusResponse {
        id: core.id,
        role: role.to_string(),
        term: core.term,
        leader: core.leader,
        commit_index: core
            .commit_state()
            .sm_commit_index
            .load(Ordering::SeqCst),
        last_log_index: core.next_slot() - 1,
    })
}

async fn handle_kv_get(
    State(state): State<ClientState>,
    Path(key): Path<String>,
) -> Result<Json<KvGetResponse>, StatusCode> {
    let Some(kv_store) = &state.kv_store else {
        return Err(StatusCode::NOT_FOUND);
    };
    let value = kv_store.lock().unwrap().get(&key);
    Ok(Json(KvGetResponse { value }))
}
