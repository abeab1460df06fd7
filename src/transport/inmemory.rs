//! In-memory transport implementation for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::core::message::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotSyncRequest, SnapshotSyncResponse,
};
use crate::core::replica_core::{ReplicaCore, SharedCore};
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub enum Request {
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        req: SnapshotSyncRequest,
        reply: oneshot::Sender<SnapshotSyncResponse>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all nodes (no timeout)
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            timeout: None,
        }
    }

    /// Create a new in-memory transport with a timeout
    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            senders,
            timeout: Some(timeout),
        }
    }

    async fn await_reply<R>(
        &self,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, TransportError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::AppendEntries {
                req,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        self.await_reply(reply_rx).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        req: SnapshotSyncRequest,
    ) -> Result<SnapshotSyncResponse, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::InstallSnapshot {
                req,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        self.await_reply(reply_rx).await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against the given core
    pub async fn process_one(&mut self, node: &mut ReplicaCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one request against a shared core (for use with a running
    /// server). Receives first, then locks briefly to process.
    pub async fn process_one_shared(&mut self, node: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    /// Drain requests against a shared core until the channel closes.
    /// Spawn this for followers that should just keep responding.
    pub async fn serve_shared(mut self, node: SharedCore) {
        while self.process_one_shared(&node).await {}
    }

    fn handle_request(request: Request, node: &mut ReplicaCore) {
        match request {
            Request::AppendEntries { req, reply } => {
                // No response (peer-bug case) or a store fault: drop the
                // reply, the sender sees a failed connection
                if let Ok(Some(resp)) = node.handle_append_entries(&req) {
                    let _ = reply.send(resp);
                }
            }
            Request::InstallSnapshot { req, reply } => {
                if let Some(resp) = node.handle_snapshot_sync(&req) {
                    let _ = reply.send(resp);
                }
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(node_ids: &[u64]) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of nodes with an optional
/// per-RPC timeout
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}
