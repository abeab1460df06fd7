//! Replica server runtime: heartbeat-driven dispatch and the client
//! submit path

use std::pin::pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::debug;

use crate::state_machine::ApplyResult;
use crate::storage::StorageError;
use crate::transport::Transport;

use super::config::ReplicationConfig;
use super::message::LogEntry;
use super::observer::{HookEvent, Observer};
use super::replica_core::{ReplicaCore, Role, SharedCore};
use super::replica_node::ReplicaNode;

/// Errors surfaced to clients of a replica
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// This node is not the leader (includes a leader hint if known)
    #[error("not the leader")]
    NotLeader { leader_hint: Option<u64> },
    /// The entry did not reach a quorum in time
    #[error("entry was not committed")]
    NotCommitted,
    /// The state machine rejected the committed payload
    #[error("state machine error: {0}")]
    StateMachine(String),
    /// The local log store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Replication was halted by a fatal invariant violation
    #[error("replication is halted")]
    Halted,
}

/// Command sent to the server from clients
enum Command {
    Submit {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<String, ReplicationError>>,
    },
}

/// Handle for interacting with a running [`ReplicaServer`]
#[derive(Clone)]
pub struct ReplicaHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ReplicaHandle {
    /// Submit a payload for replication.
    /// Returns the state machine result once the entry commits.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<String, ReplicationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ReplicationError::NotLeader { leader_hint: None })?;

        reply_rx
            .await
            .map_err(|_| ReplicationError::NotLeader { leader_hint: None })?
    }

    /// Shut the server down gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Runtime that drives a [`ReplicaNode`]: heartbeat ticks on the leader,
/// the election deadline on followers, and client submits
pub struct ReplicaServer<T: Transport> {
    node: ReplicaNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    observer: Option<Arc<dyn Observer>>,
    config: ReplicationConfig,
}

impl<T: Transport + 'static> ReplicaServer<T> {
    /// Create a new server over `core`.
    /// Returns the server and the shared core for incoming RPC handling.
    pub fn new(core: ReplicaCore, transport: T) -> (Self, SharedCore) {
        Self::with_observer(core, transport, None)
    }

    /// Like [`ReplicaServer::new`] with an observer
    pub fn with_observer(
        core: ReplicaCore,
        transport: T,
        observer: Option<Arc<dyn Observer>>,
    ) -> (Self, SharedCore) {
        let config = core.config().clone();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (node, shared_core) = ReplicaNode::with_observer(core, transport, observer.clone());
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            observer,
            config,
        };
        (server, shared_core)
    }

    pub fn node(&self) -> &ReplicaNode<T> {
        &self.node
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> ReplicaHandle {
        let handle = ReplicaHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heart_beat_interval);
        // Delay behavior so missed ticks cannot pile up and starve the
        // election branch
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // One jittered election timeout per server instance
        let election_timeout = self.config.random_election_timeout();

        loop {
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    self.node.commit_state().stopping.store(true, Ordering::SeqCst);
                    break;
                }
                Some(command) = self.command_rx.recv() => {
                    match command {
                        Command::Submit { payload, reply } => {
                            self.handle_submit(payload, reply).await;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if self.node.role().await == Role::Leader {
                        // Our own heartbeat keeps our election timer quiet
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.request_append_entries().await;
                    }
                }
                _ = election_sleep => {
                    self.on_election_deadline(election_timeout).await;
                }
                else => break,
            }
        }
    }

    async fn election_deadline(&self, timeout: Duration) -> Instant {
        self.node.shared_core().lock().await.last_heartbeat + timeout
    }

    /// The election deadline elapsed. Candidacy lives outside this crate;
    /// surface the event and re-arm the timer.
    async fn on_election_deadline(&self, timeout: Duration) {
        // Never fire while a request is being served
        if self.node.commit_state().serving_req.load(Ordering::SeqCst) {
            return;
        }
        let term = {
            let core_arc = self.node.shared_core();
            let mut core = core_arc.lock().await;
            if core.last_heartbeat.elapsed() < timeout {
                return;
            }
            // Re-arm in every case so the deadline cannot refire in a
            // tight loop
            core.last_heartbeat = Instant::now();
            if core.role == Role::Leader {
                return;
            }
            core.term
        };
        debug!("election timeout after {:?} without a leader heartbeat", timeout);
        if let Some(observer) = &self.observer {
            observer.on_event(&HookEvent::ElectionTimeout { term });
        }
    }

    async fn handle_submit(
        &self,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<String, ReplicationError>>,
    ) {
        match self.begin_submit(payload).await {
            Ok(committed_rx) => {
                // Wait for the commit off the server loop so heartbeats
                // keep flowing while the entry is in flight
                let timeout = self.config.submit_timeout;
                tokio::spawn(async move {
                    let result = match tokio::time::timeout(timeout, committed_rx).await {
                        Ok(Ok(apply_result)) => {
                            apply_result.map_err(ReplicationError::StateMachine)
                        }
                        Ok(Err(_)) | Err(_) => Err(ReplicationError::NotCommitted),
                    };
                    let _ = reply.send(result);
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Append the payload on the leader and kick one replication round.
    /// Returns the receiver that fires when the entry is applied.
    async fn begin_submit(
        &self,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<ApplyResult>, ReplicationError> {
        if self.node.commit_state().halted.load(Ordering::SeqCst) {
            return Err(ReplicationError::Halted);
        }
        let committed_rx = {
            let core_arc = self.node.shared_core();
            let mut core = core_arc.lock().await;
            if core.role != Role::Leader {
                return Err(ReplicationError::NotLeader {
                    leader_hint: core.leader,
                });
            }
            let term = core.term;
            let idx = core.append_entry(LogEntry::application(term, payload))?;
            let (tx, rx) = oneshot::channel();
            core.register_commit_waiter(idx, tx);
            rx
        };
        self.node.mark_pending_commit_all();
        self.node.request_append_entries().await;
        Ok(committed_rx)
    }
}
