//! Replication server binary
//!
//! Runs a single replica with a statically configured leader (elections are
//! outside the replication engine).
//!
//! Usage: raftline-server --id <NODE_ID> --port <PORT> --leader <NODE_ID>
//!                        --peers <ID=HOST:PORT,...> [--learners <ID,...>]
//!
//! Example for a 3-node cluster led by node 1:
//!   Node 1: raftline-server --id 1 --port 8001 --leader 1 --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   Node 2: raftline-server --id 2 --port 8002 --leader 1 --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   Node 3: raftline-server --id 3 --port 8003 --leader 1 --peers 1=127.0.0.1:8001,2=127.0.0.1:8002
//!
//! One port serves both surfaces: /raft/* for the cluster, /client/* and
//! /kv/* for clients.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tracing::info;

use raftline::api::client_http::{create_client_router, ClientState};
use raftline::core::config::ReplicationConfig;
use raftline::core::peer::MemberConfig;
use raftline::core::replica_core::ReplicaCore;
use raftline::core::replica_server::ReplicaServer;
use raftline::state_machine::kv::{KeyValueStore, SharedKvStore};
use raftline::storage::MemoryLogStore;
use raftline::transport::http::{create_router, HttpTransport};

struct Args {
    id: u64,
    port: u16,
    leader: u64,
    peers: HashMap<u64, String>,
    learners: Vec<u64>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let mut id: Option<u64> = None;
    let mut port: Option<u16> = None;
    let mut leader: Option<u64> = None;
    let mut peers: HashMap<u64, String> = HashMap::new();
    let mut learners: Vec<u64> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => {
                id = Some(args[i + 1].parse().context("invalid node ID")?);
                i += 2;
            }
            "--port" => {
                port = Some(args[i + 1].parse().context("invalid port")?);
                i += 2;
            }
            "--leader" => {
                leader = Some(args[i + 1].parse().context("invalid leader ID")?);
                i += 2;
            }
            "--peers" => {
                // Format: 2=127.0.0.1:8002,3=127.0.0.1:8003
                for peer_spec in args[i + 1].split(',') {
                    let parts: Vec<&str> = peer_spec.split('=').collect();
                    if parts.len() == 2 {
                        let peer_id: u64 = parts[0].parse().context("invalid peer ID")?;
                        peers.insert(peer_id, parts[1].to_string());
                    }
                }
                i += 2;
            }
            "--learners" => {
                for learner in args[i + 1].split(',') {
                    learners.push(learner.parse().context("invalid learner ID")?);
                }
                i += 2;
            }
            other => {
                anyhow::bail!("unknown argument: {}", other);
            }
        }
    }

    Ok(Args {
        id: id.context("--id is required")?,
        port: port.context("--port is required")?,
        leader: leader.context("--leader is required")?,
        peers,
        learners,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;

    info!(
        "starting node {} on port {}, leader {}, peers {:?}",
        args.id, args.port, args.leader, args.peers
    );

    let members: Vec<MemberConfig> = args
        .peers
        .keys()
        .map(|&peer_id| {
            if args.learners.contains(&peer_id) {
                MemberConfig::learner(peer_id)
            } else {
                MemberConfig::voter(peer_id)
            }
        })
        .collect();

    let kv_store: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
    let config = ReplicationConfig::default();
    let mut core = ReplicaCore::new(
        args.id,
        members,
        Box::new(MemoryLogStore::new()),
        Box::new(kv_store.clone()),
        config.clone(),
    );
    core.term = 1;
    if args.id == args.leader {
        core.become_leader()?;
    } else {
        core.leader = Some(args.leader);
    }

    let transport = HttpTransport::new(args.peers, Duration::from_secs(2))
        .map_err(|e| anyhow::anyhow!("transport setup failed: {}", e))?;
    let (server, shared_core) = ReplicaServer::new(core, transport);
    let raft_handle = server.start();

    let router = Router::new()
        .merge(create_router(shared_core.clone()))
        .merge(create_client_router(ClientState {
            handle: raft_handle.clone(),
            core: shared_core,
            kv_store: Some(kv_store),
        }));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .context("failed to bind")?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    raft_handle.shutdown().await;
    Ok(())
}
