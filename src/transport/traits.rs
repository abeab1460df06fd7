//! Transport abstraction for replication RPCs

use async_trait::async_trait;

use crate::core::message::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotSyncRequest, SnapshotSyncResponse,
};

/// Errors that can occur during transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("target node not found")]
    NodeNotFound,
}

/// Transport abstraction for replication RPCs
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    /// Send a single-shot snapshot install to a peer node
    async fn install_snapshot(
        &self,
        target: u64,
        req: SnapshotSyncRequest,
    ) -> Result<SnapshotSyncResponse, TransportError>;

    /// Re-establish the connection to a peer after prolonged inactivity.
    /// Transports without per-peer connection state ignore this.
    fn reconnect(&self, _target: u64) {}
}
