//! HTTP transport implementation for replication RPCs
//!
//! Uses axum for the server and reqwest for the client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};

use crate::core::message::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotSyncRequest, SnapshotSyncResponse,
};
use crate::core::replica_core::SharedCore;
use crate::transport::{Transport, TransportError};

/// HTTP transport for replication RPCs
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| TransportError::ConnectionFailed)?;

        Ok(HttpTransport { peers, client })
    }

    async fn post_json<Req, Resp>(&self, target: u64, path: &str, req: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/{}", addr, path);

        let response = self.client.post(&url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed);
        }

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.post_json(target, "append_entries", &req).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        req: SnapshotSyncRequest,
    ) -> Result<SnapshotSyncResponse, TransportError> {
        self.post_json(target, "install_snapshot", &req).await
    }
}

/// Create an axum router for handling incoming replication RPCs
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(core)
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(req): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, StatusCode> {
    let mut core = core.lock().await;
    match core.handle_append_entries(&req) {
        Ok(Some(resp)) => Ok(Json(resp)),
        // Another leader at the same term: no response by design
        Ok(None) => Err(StatusCode::CONFLICT),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn handle_install_snapshot(
    State(core): State<SharedCore>,
    Json(req): Json<SnapshotSyncRequest>,
) -> Result<Json<SnapshotSyncResponse>, StatusCode> {
    let mut core = core.lock().await;
    match core.handle_snapshot_sync(&req) {
        Some(resp) => Ok(Json(resp)),
        None => Err(StatusCode::CONFLICT),
    }
}
