//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process HTTP clusters. Node 1
//! starts as the leader; the rest start as followers (elections are outside
//! this crate).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::client_http::{create_client_router, ClientState};
use crate::core::config::ReplicationConfig;
use crate::core::peer::MemberConfig;
use crate::core::replica_core::{ReplicaCore, SharedCore};
use crate::core::replica_server::{ReplicaHandle, ReplicaServer};
use crate::state_machine::kv::{KeyValueStore, SharedKvStore};
use crate::storage::MemoryLogStore;
use crate::transport::http::{create_router, HttpTransport};

/// A single test node in the cluster
pub struct TestNode {
    pub id: u64,
    /// Address serving both the replication and the client endpoints
    pub addr: SocketAddr,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    pub raft_handle: ReplicaHandle,
    pub kv_store: SharedKvStore,
    pub shared_core: SharedCore,
}

impl TestNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// An in-process HTTP cluster with a static leader (node 1)
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the given number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    /// Create and start a cluster with the given number of nodes and config
    pub async fn with_nodes_and_config(count: usize, config: Option<ReplicationConfig>) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();

        // Bind every listener first so all addresses are known
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        // Fast heartbeats so tests converge quickly
        let config = config.unwrap_or_else(|| {
            ReplicationConfig::default()
                .with_heart_beat_interval(Duration::from_millis(30))
                .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        });

        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let members: Vec<MemberConfig> = node_ids
                .iter()
                .filter(|&&other| other != id)
                .map(|&other| MemberConfig::voter(other))
                .collect();
            let peer_addrs: HashMap<u64, String> = addrs
                .iter()
                .filter(|(&other, _)| other != id)
                .map(|(&other, addr)| (other, addr.clone()))
                .collect();

            let kv_store: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
            let mut core = ReplicaCore::new(
                id,
                members,
                Box::new(MemoryLogStore::new()),
                Box::new(kv_store.clone()),
                config.clone(),
            );
            core.term = 1;
            if id == 1 {
                core.become_leader().unwrap();
            }

            let transport =
                HttpTransport::new(peer_addrs, config.heart_beat_interval * 4).unwrap();
            let (server, shared_core) = ReplicaServer::new(core, transport);
            let raft_handle = server.start();

            let router = Router::new()
                .merge(create_router(shared_core.clone()))
                .merge(create_client_router(ClientState {
                    handle: raft_handle.clone(),
                    core: shared_core.clone(),
                    kv_store: Some(kv_store.clone()),
                }));

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                raft_handle,
                kv_store,
                shared_core,
            });
        }

        TestCluster { nodes }
    }

    /// The static leader (node 1)
    pub fn leader(&self) -> &TestNode {
        &self.nodes[0]
    }

    /// Shut every node down
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            node.raft_handle.shutdown().await;
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}
