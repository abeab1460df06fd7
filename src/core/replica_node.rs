//! Leader-side replication: per-peer dispatch, request building, and
//! response handling
//!
//! `ReplicaNode` wraps the shared [`ReplicaCore`] and drives one send loop
//! per peer. Each outbound request is awaited in its own task; completions
//! free the peer's busy flag, feed the response reducer, and immediately
//! re-dispatch when the peer still has catching up to do.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::transport::Transport;

use super::config::ReplicationConfig;
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, PeerRequest, SnapshotSyncRequest,
};
use super::observer::{HookAction, HookEvent, Observer};
use super::peer::Peer;
use super::replica_core::{CommitState, ReplicaCore, Role, SharedCore};
use super::state_manager::{FatalError, LoggingStateManager, StateManager};
use crate::storage::StorageError;

/// Leader-side replication engine over a shared core
pub struct ReplicaNode<T: Transport> {
    id: u64,
    core: SharedCore,
    commit_state: Arc<CommitState>,
    transport: Arc<T>,
    peers: Arc<HashMap<u64, Arc<Peer>>>,
    observer: Option<Arc<dyn Observer>>,
    state_manager: Arc<dyn StateManager>,
    config: ReplicationConfig,
}

impl<T: Transport> Clone for ReplicaNode<T> {
    fn clone(&self) -> Self {
        ReplicaNode {
            id: self.id,
            core: self.core.clone(),
            commit_state: self.commit_state.clone(),
            transport: self.transport.clone(),
            peers: self.peers.clone(),
            observer: self.observer.clone(),
            state_manager: self.state_manager.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport + 'static> ReplicaNode<T> {
    /// Create a node over `core`, tracking one [`Peer`] per cluster member.
    /// Returns the node and the shared core for incoming RPC handling.
    pub fn new(core: ReplicaCore, transport: T) -> (Self, SharedCore) {
        Self::with_observer(core, transport, None)
    }

    /// Like [`ReplicaNode::new`] with an observer wired into both the
    /// outbound and inbound hook points.
    pub fn with_observer(
        mut core: ReplicaCore,
        transport: T,
        observer: Option<Arc<dyn Observer>>,
    ) -> (Self, SharedCore) {
        if let Some(observer) = &observer {
            core.set_observer(observer.clone());
        }
        let id = core.id;
        let commit_state = core.commit_state();
        let config = core.config().clone();
        let peers: HashMap<u64, Arc<Peer>> = core
            .members()
            .iter()
            .map(|m| (m.id, Arc::new(Peer::new(*m))))
            .collect();
        let core = Arc::new(tokio::sync::Mutex::new(core));
        let node = ReplicaNode {
            id,
            core: core.clone(),
            commit_state,
            transport: Arc::new(transport),
            peers: Arc::new(peers),
            observer,
            state_manager: Arc::new(LoggingStateManager),
            config,
        };
        (node, core)
    }

    /// Replace the default (logging) state manager
    pub fn set_state_manager(&mut self, state_manager: Arc<dyn StateManager>) {
        self.state_manager = state_manager;
    }

    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    pub fn commit_state(&self) -> Arc<CommitState> {
        self.commit_state.clone()
    }

    pub fn peer(&self, id: u64) -> Option<&Arc<Peer>> {
        self.peers.get(&id)
    }

    pub async fn role(&self) -> Role {
        self.core.lock().await.role
    }

    /// Flag every peer as having unacked entries; set after the leader
    /// appends, so response handling knows to keep the pipeline running.
    pub fn mark_pending_commit_all(&self) {
        for peer in self.peers.values() {
            peer.set_pending_commit();
        }
    }

    fn halt(&self, err: FatalError) {
        self.state_manager.system_exit(&err);
        self.commit_state.halted.store(true, Ordering::SeqCst);
    }

    // === Dispatcher ===

    /// One replication round: ship a request to every peer that will take
    /// one.
    pub async fn request_append_entries(&self) {
        if self.commit_state.halted.load(Ordering::SeqCst) {
            return;
        }

        // One-node cluster or quorum of one: no response will ever arrive
        // to drive the commit, so commit here.
        let quorum_for_commit = self.core.lock().await.quorum_for_commit();
        if self.peers.is_empty() || quorum_for_commit == 0 {
            let mut core = self.core.lock().await;
            let target = core.next_slot() - 1;
            if let Err(e) = core.commit(target) {
                warn!("commit failed: {}", e);
            }
            return;
        }

        for peer in self.peers.values() {
            self.request_append_entries_to(peer).await;
        }
    }

    /// Try to ship one request to `peer`. Returns false when the peer's
    /// busy flag blocked the send.
    pub async fn request_append_entries_to(&self, peer: &Arc<Peer>) -> bool {
        if self.commit_state.halted.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(observer) = &self.observer {
            let event = HookEvent::RequestAppendEntries { peer: peer.id() };
            if observer.on_event(&event) == HookAction::Cancel {
                warn!("by callback, abort request_append_entries to peer {}", peer.id());
                return true;
            }
        }

        let hb = self.config.heart_beat_interval;
        let inactive = peer.active_elapsed();
        if inactive > hb * self.config.reconnect_limit {
            warn!(
                "connection to peer {} has been inactive for {:?}, force re-connect",
                peer.id(),
                inactive
            );
            self.transport.reconnect(peer.id());
            peer.reset_active_timer();
        }

        if !peer.make_busy() {
            debug!("peer {} is busy, skip the request", peer.id());

            let pause = peer.ls_elapsed();
            if pause > hb {
                let warnings = peer.inc_long_pause_warnings();
                if warnings < self.config.warnings_limit {
                    warn!(
                        "skipped sending to peer {} for too long, last message sent {:?} ago",
                        peer.id(),
                        pause
                    );
                } else if warnings == self.config.warnings_limit {
                    warn!(
                        "long pause warnings for peer {} are too verbose, \
                         will suppress them from now on",
                        peer.id()
                    );
                }

                // Resiliency: free a flag that has clearly wedged so the
                // next round can send a heartbeat.
                if pause > hb * self.config.busy_flag_limit {
                    warn!(
                        "probably something went wrong, temporarily freeing the busy flag \
                         for peer {}",
                        peer.id()
                    );
                    peer.set_free();
                    peer.set_manual_free();
                    peer.reset_ls_timer();
                }
            }
            return false;
        }

        trace!("sending request to peer {}", peer.id());
        let msg = match self.create_append_entries_req(peer).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                peer.set_free();
                return true;
            }
            Err(e) => {
                warn!("could not build a request for peer {}: {}", peer.id(), e);
                peer.set_free();
                return true;
            }
        };

        if !peer.is_manual_free() {
            // An actual recovery from a long pause, not a forced free.
            if peer.long_pause_warnings() >= self.config.warnings_limit {
                let recoveries = peer.inc_recovery_cnt();
                warn!(
                    "recovered from a long pause to peer {}: {} warnings, last send {:?} ago, \
                     {} recoveries",
                    peer.id(),
                    peer.long_pause_warnings(),
                    peer.ls_elapsed(),
                    recoveries
                );
                if recoveries >= self.config.recovery_reset_threshold {
                    peer.reset_recovery_cnt();
                }
            }
            peer.reset_long_pause_warnings();
        } else {
            peer.reset_manual_free();
        }

        let node = self.clone();
        let peer_handle = peer.clone();
        match msg {
            PeerRequest::Entries(req) => {
                tokio::spawn(async move { node.deliver_entries(peer_handle, req).await });
            }
            PeerRequest::Snapshot(req) => {
                tokio::spawn(async move { node.deliver_snapshot(peer_handle, req).await });
            }
        }
        peer.reset_ls_timer();
        true
    }

    // === Request builder ===

    /// Build the next request for `peer`: an entries batch, or a snapshot
    /// install when the peer is behind the log start. `Ok(None)` means
    /// nothing can be sent this round.
    pub async fn create_append_entries_req(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<Option<PeerRequest>, StorageError> {
        let core = self.core.lock().await;

        // Consistent view under the server lock.
        let starting_idx = core.start_index();
        let cur_nxt_idx = core.next_slot();
        let commit_idx = self.commit_state.quick_commit_index.load(Ordering::SeqCst);
        let term = core.term;

        let last_log_idx = {
            let mut indexes = peer.indexes();
            if indexes.next_log_idx == 0 {
                indexes.next_log_idx = cur_nxt_idx;
            }
            indexes.next_log_idx - 1
        };

        if last_log_idx >= cur_nxt_idx {
            // The tracker contradicts the leader log; replication state
            // can no longer be trusted.
            self.halt(FatalError::PeerIndexCorrupted {
                peer: peer.id(),
                last_log_idx,
                next_slot: cur_nxt_idx,
            });
            return Ok(None);
        }

        trace!(
            "peer {}: last_log_idx {}, starting_idx {}, cur_nxt_idx {}",
            peer.id(),
            last_log_idx,
            starting_idx,
            cur_nxt_idx
        );

        if let Some(snapshot) = core.last_snapshot() {
            if last_log_idx < starting_idx
                && last_log_idx < snapshot.metadata.last_included_index
            {
                debug!(
                    "sending snapshot to peer {}: peer log idx {}, my starting idx {}, \
                     snapshot idx {}",
                    peer.id(),
                    last_log_idx,
                    starting_idx,
                    snapshot.metadata.last_included_index
                );
                return Ok(Some(PeerRequest::Snapshot(SnapshotSyncRequest {
                    term,
                    src: self.id,
                    dst: peer.id(),
                    commit_idx,
                    snapshot: (*snapshot).clone(),
                })));
            }
        }

        let last_log_term = core.term_for_log(last_log_idx)?;
        let mut end_idx = cur_nxt_idx.min(last_log_idx + 1 + self.config.max_append_size as u64);

        // If this is a retry the follower is probably struggling; after a
        // few identical rounds narrow the batch down to a single entry.
        {
            let mut indexes = peer.indexes();
            if last_log_idx + 1 == indexes.last_sent_idx && last_log_idx + 2 < end_idx {
                indexes.cnt_not_applied += 1;
                debug!(
                    "last sent log ({}) to peer {} is not applied, count {}",
                    indexes.last_sent_idx,
                    peer.id(),
                    indexes.cnt_not_applied
                );
                if indexes.cnt_not_applied >= self.config.retry_narrow_threshold {
                    let prev_end_idx = end_idx;
                    end_idx = cur_nxt_idx.min(last_log_idx + 2);
                    debug!("reduce end_idx {} -> {}", prev_end_idx, end_idx);
                }
            } else {
                indexes.cnt_not_applied = 0;
            }
        }

        let entries = if last_log_idx + 1 >= cur_nxt_idx {
            Vec::new()
        } else {
            core.entries(last_log_idx + 1, end_idx)?
        };
        debug!(
            "append entries for peer {}: last_log_idx {}, last_log_term {}, {} entries, \
             commit idx {}, term {}",
            peer.id(),
            last_log_idx,
            last_log_term,
            entries.len(),
            commit_idx,
            term
        );

        peer.indexes().last_sent_idx = last_log_idx + 1;

        Ok(Some(PeerRequest::Entries(AppendEntriesRequest {
            term,
            src: self.id,
            dst: peer.id(),
            last_log_idx,
            last_log_term,
            commit_idx,
            entries,
        })))
    }

    // === Delivery tasks ===

    async fn deliver_entries(self, peer: Arc<Peer>, req: AppendEntriesRequest) {
        let result = self.transport.append_entries(peer.id(), req).await;
        peer.set_free();
        match result {
            Ok(resp) => {
                if self.handle_append_entries_resp(resp).await {
                    self.request_append_entries_to(&peer).await;
                }
            }
            Err(e) => {
                warn!("append entries to peer {} failed: {}", peer.id(), e);
            }
        }
    }

    async fn deliver_snapshot(self, peer: Arc<Peer>, req: SnapshotSyncRequest) {
        let last_included = req.snapshot.metadata.last_included_index;
        let result = self.transport.install_snapshot(peer.id(), req).await;
        peer.set_free();
        match result {
            Ok(resp) if resp.accepted => {
                peer.reset_active_timer();
                {
                    let mut indexes = peer.indexes();
                    indexes.next_log_idx = last_included + 1;
                    indexes.matched_idx = last_included;
                }
                info!(
                    "peer {} installed the snapshot through index {}",
                    peer.id(),
                    last_included
                );
            }
            Ok(resp) => {
                let mut core = self.core.lock().await;
                if resp.term > core.term {
                    core.term = resp.term;
                    core.become_follower();
                } else {
                    warn!("peer {} declined the snapshot install", peer.id());
                }
            }
            Err(e) => {
                warn!("snapshot sync to peer {} failed: {}", peer.id(), e);
            }
        }
    }

    // === Response reducer ===

    /// Fold one response into the peer's indices and the commit point.
    /// Returns true when this node is still leader and the peer needs an
    /// immediate next round.
    pub async fn handle_append_entries_resp(&self, resp: AppendEntriesResponse) -> bool {
        let Some(peer) = self.peers.get(&resp.src) else {
            info!("response from an unknown peer {}", resp.src);
            return false;
        };
        peer.reset_active_timer();

        let mut core = self.core.lock().await;
        if resp.term > core.term {
            core.term = resp.term;
            core.become_follower();
            return false;
        }

        trace!(
            "handle append entries resp from {}, next idx {}, accepted {}",
            resp.src,
            resp.next_idx,
            resp.accepted
        );

        let need_to_catchup = if resp.accepted {
            let new_matched_idx = resp.next_idx - 1;
            {
                let mut indexes = peer.indexes();
                indexes.next_log_idx = resp.next_idx;
                trace!(
                    "peer {} matched idx: {} -> {}",
                    resp.src,
                    indexes.matched_idx,
                    new_matched_idx
                );
                indexes.matched_idx = new_matched_idx;
            }
            peer.clear_suppress_errors();

            if let Some(observer) = &self.observer {
                observer.on_event(&HookEvent::GotAppendEntryRespFromPeer {
                    peer: resp.src,
                    matched_idx: new_matched_idx,
                });
            }

            // Highest index replicated on a majority: the
            // quorum_for_commit-th order statistic over voter matched
            // indices, leader included.
            let mut matched_indexes = Vec::with_capacity(self.peers.len() + 1);
            matched_indexes.push(core.next_slot() - 1);
            for p in self.peers.values() {
                if p.is_learner() {
                    continue;
                }
                matched_indexes.push(p.matched_idx());
            }
            debug_assert_eq!(matched_indexes.len(), core.num_voting_members());
            matched_indexes.sort_unstable_by(|a, b| b.cmp(a));

            let quorum_idx = core.quorum_for_commit();
            trace!("quorum idx {}, matched {:?}", quorum_idx, matched_indexes);
            if let Err(e) = core.commit(matched_indexes[quorum_idx]) {
                warn!("commit failed: {}", e);
            }

            peer.clear_pending_commit() || resp.next_idx < core.next_slot()
        } else {
            {
                let mut indexes = peer.indexes();
                let prev_next_log = indexes.next_log_idx;
                if resp.next_idx > 0 && resp.next_idx < indexes.next_log_idx {
                    // Fast jump to the follower's hint.
                    indexes.next_log_idx = resp.next_idx;
                } else {
                    // No usable hint, walk one entry back. Reaching 0 makes
                    // the next build re-initialize from the leader's next
                    // slot.
                    indexes.next_log_idx = indexes.next_log_idx.saturating_sub(1);
                }
                if peer.need_to_suppress_error() {
                    info!(
                        "declined append: peer {}, prev next log idx {}, resp next {}, \
                         new next log idx {}",
                        resp.src, prev_next_log, resp.next_idx, indexes.next_log_idx
                    );
                } else {
                    warn!(
                        "declined append: peer {}, prev next log idx {}, resp next {}, \
                         new next log idx {}",
                        resp.src, prev_next_log, resp.next_idx, indexes.next_log_idx
                    );
                }
            }
            true
        };

        // The role may have changed while the response was in flight.
        core.role == Role::Leader && need_to_catchup
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::core::message::{LogEntry, SnapshotSyncResponse};
    use crate::core::peer::MemberConfig;
    use crate::state_machine::TestStateMachine;
    use crate::storage::MemoryLogStore;
    use crate::transport::TransportError;

    /// Transport that never reaches anyone; node tests drive the reducer
    /// directly.
    struct UnreachableTransport;

    #[async_trait]
    impl Transport for UnreachableTransport {
        async fn append_entries(
            &self,
            _target: u64,
            _req: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::ConnectionFailed)
        }

        async fn install_snapshot(
            &self,
            _target: u64,
            _req: SnapshotSyncRequest,
        ) -> Result<SnapshotSyncResponse, TransportError> {
            Err(TransportError::ConnectionFailed)
        }
    }

    fn leader_core(members: Vec<MemberConfig>, entries: u64, term: u64) -> ReplicaCore {
        let mut core = ReplicaCore::new(
            1,
            members,
            Box::new(MemoryLogStore::new()),
            Box::new(TestStateMachine::new()),
            ReplicationConfig::default(),
        );
        core.term = term;
        core.role = Role::Leader;
        core.leader = Some(1);
        for i in 0..entries {
            core.append_entry(LogEntry::application(term, format!("e{}", i).into_bytes()))
                .unwrap();
        }
        core
    }

    fn accepted(src: u64, next_idx: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: 1,
            src,
            dst: 1,
            next_idx,
            accepted: true,
        }
    }

    fn declined(src: u64, next_idx: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: 1,
            src,
            dst: 1,
            next_idx,
            accepted: false,
        }
    }

    #[tokio::test]
    async fn test_builder_batches_from_peer_next_index() {
        let core = leader_core(vec![MemberConfig::voter(2)], 10, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 4;

        let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
        let PeerRequest::Entries(req) = msg else {
            panic!("expected an entries request");
        };
        assert_eq!(req.last_log_idx, 3);
        assert_eq!(req.last_log_term, 1);
        assert_eq!(req.entries.len(), 7);
        assert_eq!(peer.indexes().last_sent_idx, 4);
    }

    #[tokio::test]
    async fn test_builder_lazy_initializes_next_index_to_heartbeat() {
        let core = leader_core(vec![MemberConfig::voter(2)], 5, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        assert_eq!(peer.next_log_idx(), 0);

        let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
        let PeerRequest::Entries(req) = msg else {
            panic!("expected an entries request");
        };
        // Initialized to the leader's next slot: nothing to ship yet
        assert_eq!(peer.next_log_idx(), 6);
        assert_eq!(req.last_log_idx, 5);
        assert!(req.entries.is_empty());
    }

    #[tokio::test]
    async fn test_builder_respects_max_append_size() {
        let mut core = ReplicaCore::new(
            1,
            vec![MemberConfig::voter(2)],
            Box::new(MemoryLogStore::new()),
            Box::new(TestStateMachine::new()),
            ReplicationConfig::default().with_max_append_size(3),
        );
        core.term = 1;
        core.role = Role::Leader;
        for i in 0..10u64 {
            core.append_entry(LogEntry::application(1, format!("e{}", i).into_bytes()))
                .unwrap();
        }
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 1;

        let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
        let PeerRequest::Entries(req) = msg else {
            panic!("expected an entries request");
        };
        assert_eq!(req.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_fallback_when_peer_behind_log_start() {
        // Leader compacted through 49 (start index 50); the peer sits at 10
        let mut core = leader_core(vec![MemberConfig::voter(2)], 60, 1);
        core.commit_state()
            .quick_commit_index
            .store(49, Ordering::SeqCst);
        core.commit_state()
            .sm_commit_index
            .store(49, Ordering::SeqCst);
        core.take_snapshot().unwrap();
        assert_eq!(core.start_index(), 50);

        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 11;

        let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
        let PeerRequest::Snapshot(req) = msg else {
            panic!("expected a snapshot request");
        };
        assert_eq!(req.snapshot.metadata.last_included_index, 49);
    }

    #[tokio::test]
    async fn test_retry_narrowing_after_five_identical_rounds() {
        let core = leader_core(vec![MemberConfig::voter(2)], 10, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 1;

        for round in 0..6 {
            let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
            let PeerRequest::Entries(req) = msg else {
                panic!("expected an entries request");
            };
            if round < 5 {
                assert_eq!(req.entries.len(), 10, "round {}", round);
            } else {
                // 5th identical retry: ship exactly one entry
                assert_eq!(req.entries.len(), 1, "round {}", round);
            }
        }
    }

    #[tokio::test]
    async fn test_retry_counter_resets_on_progress() {
        let core = leader_core(vec![MemberConfig::voter(2)], 10, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 1;

        for _ in 0..4 {
            node.create_append_entries_req(&peer).await.unwrap();
        }
        assert_eq!(peer.indexes().cnt_not_applied, 3);

        // Progress: the peer acked up to 5
        peer.indexes().next_log_idx = 6;
        node.create_append_entries_req(&peer).await.unwrap();
        assert_eq!(peer.indexes().cnt_not_applied, 0);
    }

    /// State manager recording the fatal error it was handed
    struct RecordingStateManager {
        seen: Mutex<Vec<String>>,
    }

    impl StateManager for RecordingStateManager {
        fn system_exit(&self, err: &FatalError) {
            self.seen.lock().unwrap().push(err.to_string());
        }
    }

    #[tokio::test]
    async fn test_corrupt_peer_index_halts_replication() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (mut node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let state_manager = Arc::new(RecordingStateManager {
            seen: Mutex::new(Vec::new()),
        });
        node.set_state_manager(state_manager.clone());

        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 99;

        let msg = node.create_append_entries_req(&peer).await.unwrap();
        assert!(msg.is_none());
        assert!(node.commit_state().halted.load(Ordering::SeqCst));
        assert_eq!(state_manager.seen.lock().unwrap().len(), 1);

        // Halted: the dispatcher refuses every further round
        assert!(!node.request_append_entries_to(&peer).await);
    }

    #[tokio::test]
    async fn test_quorum_commit_excludes_learner() {
        // 3 voters matched {10, 9, 8}, leader at 10, learner at 10:
        // sorted voter list [10,10,9,8], quorum idx 2, commit candidate 9
        let core = leader_core(
            vec![
                MemberConfig::voter(2),
                MemberConfig::voter(3),
                MemberConfig::voter(4),
                MemberConfig::learner(5),
            ],
            10,
            1,
        );
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        node.peer(3).unwrap().indexes().matched_idx = 9;
        node.peer(4).unwrap().indexes().matched_idx = 8;
        node.peer(5).unwrap().indexes().matched_idx = 10;

        node.handle_append_entries_resp(accepted(2, 11)).await;

        assert_eq!(node.peer(2).unwrap().matched_idx(), 10);
        assert_eq!(
            node.commit_state().quick_commit_index.load(Ordering::SeqCst),
            9
        );
    }

    #[tokio::test]
    async fn test_accepted_response_updates_indices() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        let catchup = node.handle_append_entries_resp(accepted(2, 4)).await;
        let peer = node.peer(2).unwrap();
        assert_eq!(peer.next_log_idx(), 4);
        assert_eq!(peer.matched_idx(), 3);
        // Fully caught up and nothing pending
        assert!(!catchup);
    }

    #[tokio::test]
    async fn test_partially_caught_up_peer_requests_next_round() {
        let core = leader_core(vec![MemberConfig::voter(2)], 5, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        let catchup = node.handle_append_entries_resp(accepted(2, 3)).await;
        assert!(catchup);
    }

    #[tokio::test]
    async fn test_pending_commit_flag_requests_next_round() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        node.mark_pending_commit_all();

        let catchup = node.handle_append_entries_resp(accepted(2, 4)).await;
        assert!(catchup);
        // Flag is one-shot
        let catchup = node.handle_append_entries_resp(accepted(2, 4)).await;
        assert!(!catchup);
    }

    #[tokio::test]
    async fn test_declined_response_fast_jumps_to_hint() {
        let core = leader_core(vec![MemberConfig::voter(2)], 8, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 6;

        let catchup = node.handle_append_entries_resp(declined(2, 3)).await;
        assert!(catchup);
        assert_eq!(peer.next_log_idx(), 3);
    }

    #[tokio::test]
    async fn test_declined_response_without_hint_decrements() {
        let core = leader_core(vec![MemberConfig::voter(2)], 8, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 6;

        node.handle_append_entries_resp(declined(2, 0)).await;
        assert_eq!(peer.next_log_idx(), 5);
    }

    #[tokio::test]
    async fn test_losing_streak_reaches_sentinel_and_reinitializes() {
        let core = leader_core(vec![MemberConfig::voter(2)], 8, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();
        peer.indexes().next_log_idx = 1;

        // One more hintless decline walks the index down to the 0 sentinel
        node.handle_append_entries_resp(declined(2, 0)).await;
        assert_eq!(peer.next_log_idx(), 0);

        // The next build restarts from the leader's own next slot
        let msg = node.create_append_entries_req(&peer).await.unwrap().unwrap();
        let PeerRequest::Entries(req) = msg else {
            panic!("expected an entries request");
        };
        assert_eq!(peer.next_log_idx(), 9);
        assert_eq!(req.last_log_idx, 8);
        assert!(req.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_response_is_ignored() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        assert!(!node.handle_append_entries_resp(accepted(99, 4)).await);
    }

    #[tokio::test]
    async fn test_greater_term_response_steps_down() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, shared) = ReplicaNode::new(core, UnreachableTransport);

        let mut resp = declined(2, 0);
        resp.term = 7;
        assert!(!node.handle_append_entries_resp(resp).await);
        let core = shared.lock().await;
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.term, 7);
    }

    #[tokio::test]
    async fn test_matched_idx_monotonic_on_accept_path() {
        let core = leader_core(vec![MemberConfig::voter(2)], 5, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        node.handle_append_entries_resp(accepted(2, 6)).await;
        let before = node.peer(2).unwrap().matched_idx();
        node.handle_append_entries_resp(accepted(2, 6)).await;
        assert!(node.peer(2).unwrap().matched_idx() >= before);
    }

    #[tokio::test]
    async fn test_single_node_shortcut_commits_directly() {
        let core = leader_core(vec![], 4, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        node.request_append_entries().await;
        assert_eq!(
            node.commit_state().quick_commit_index.load(Ordering::SeqCst),
            4
        );
        assert_eq!(
            node.commit_state().sm_commit_index.load(Ordering::SeqCst),
            4
        );
    }

    #[tokio::test]
    async fn test_learner_only_cluster_commits_directly() {
        let core = leader_core(vec![MemberConfig::learner(2)], 4, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);

        node.request_append_entries().await;
        assert_eq!(
            node.commit_state().quick_commit_index.load(Ordering::SeqCst),
            4
        );
        // No message went out, the learner's busy flag was never claimed
        assert!(!node.peer(2).unwrap().is_busy());
    }

    struct VetoObserver;

    impl Observer for VetoObserver {
        fn on_event(&self, event: &HookEvent) -> HookAction {
            match event {
                HookEvent::RequestAppendEntries { .. } => HookAction::Cancel,
                _ => HookAction::Continue,
            }
        }
    }

    #[tokio::test]
    async fn test_observer_vetoes_outbound_send() {
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) =
            ReplicaNode::with_observer(core, UnreachableTransport, Some(Arc::new(VetoObserver)));
        let peer = node.peer(2).unwrap().clone();

        assert!(node.request_append_entries_to(&peer).await);
        // Vetoed before the busy flag was claimed
        assert!(!peer.is_busy());
        assert_eq!(peer.indexes().last_sent_idx, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_peer_busy_flag_is_force_freed() {
        let hb = Duration::from_millis(150);
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();

        // Simulate a wedged in-flight request
        assert!(peer.make_busy());
        tokio::time::advance(hb * 21).await;

        // Busy and over the limit: the dispatcher frees the flag
        assert!(!node.request_append_entries_to(&peer).await);
        assert!(!peer.is_busy());
        assert!(peer.is_manual_free());

        // Next round sends normally and clears manual_free without
        // counting a recovery
        assert!(node.request_append_entries_to(&peer).await);
        assert!(!peer.is_manual_free());
        assert_eq!(peer.recovery_cnt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_pause_warnings_are_throttled() {
        let hb = Duration::from_millis(150);
        let core = leader_core(vec![MemberConfig::voter(2)], 3, 1);
        let (node, _shared) = ReplicaNode::new(core, UnreachableTransport);
        let peer = node.peer(2).unwrap().clone();

        assert!(peer.make_busy());
        tokio::time::advance(hb * 2).await;

        for _ in 0..25 {
            node.request_append_entries_to(&peer).await;
        }
        // Counter keeps going past the limit; only the logging stops
        assert!(peer.long_pause_warnings() > 20);
        assert!(peer.is_busy());
    }
}

#[cfg(test)]
fn _diag_assert_send() {
    fn check_XYZ<T: Transport + 'static>(node: ReplicaNode<T>, peer: std::sync::Arc<super::peer::Peer>) {
        let _: std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>> =
            Box::pin(async move { node.request_append_entries_to(&peer).await });
    }
    fn sanity_negative(m: std::sync::Mutex<u32>) {
        let _: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> = Box::pin(async move {
            let g = m.lock().unwrap();
            tokio::task::yield_now().await;
            drop(g);
        });
    }
    fn check_deliver<T: Transport + 'static>(
        node: ReplicaNode<T>,
        peer: std::sync::Arc<super::peer::Peer>,
        req: super::message::AppendEntriesRequest,
    ) {
        let _: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(node.deliver_entries(peer, req));
    }
    fn check_spawn<T: Transport + 'static>(
        node: ReplicaNode<T>,
        peer: std::sync::Arc<super::peer::Peer>,
        req: super::message::AppendEntriesRequest,
    ) {
        tokio::spawn(async move { node.deliver_entries(peer, req).await });
    }
}
