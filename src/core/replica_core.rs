//! Replica core: the follower-side acceptor and the commit component
//!
//! `ReplicaCore` owns the log store, the state machine, and the node's
//! role/term state. It is shared behind the server lock
//! (`Arc<tokio::sync::Mutex<_>>`); the commit indices live in [`CommitState`]
//! atomics so they can be read without taking that lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::state_machine::{ApplyResult, StateMachine};
use crate::storage::{LogStore, StorageError};

use super::config::ReplicationConfig;
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, EntryKind, LogEntry, SnapshotSyncRequest,
    SnapshotSyncResponse,
};
use super::observer::{HookEvent, Observer};
use super::peer::MemberConfig;
use super::snapshot::{Snapshot, SnapshotMetadata};

/// Replica roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive state, receives entries from the leader
    Follower,
    /// Transitional state owned by the (external) election logic
    Candidate,
    /// Accepts client payloads and replicates the log
    Leader,
}

/// Commit progress and lifecycle flags, readable without the server lock
#[derive(Debug, Default)]
pub struct CommitState {
    /// Highest index known replicated on a quorum
    pub quick_commit_index: AtomicU64,
    /// Highest index applied to the state machine
    pub sm_commit_index: AtomicU64,
    /// Commit index last advertised by the leader
    pub leader_commit_index: AtomicU64,
    /// Set while an incoming request is being served, so the election
    /// timer does not fire mid-reconcile
    pub serving_req: AtomicBool,
    /// Set when the process is shutting down; the acceptor may bail out
    /// between entries
    pub stopping: AtomicBool,
    /// Set after a fatal invariant violation; all dispatching stops
    pub halted: AtomicBool,
}

/// Scoped `serving_req` marker: set on entry, cleared on every exit path
struct ServingReq<'a>(&'a AtomicBool);

impl<'a> ServingReq<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ServingReq(flag)
    }
}

impl Drop for ServingReq<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Shared reference to the replica core (the server lock)
pub type SharedCore = Arc<tokio::sync::Mutex<ReplicaCore>>;

/// Core replica state: log, state machine, role, and commit progress
pub struct ReplicaCore {
    pub id: u64,
    pub term: u64,
    pub role: Role,
    /// Current known leader, refreshed by accepted requests
    pub leader: Option<u64>,
    /// True while an uncommitted configuration entry sits in the log
    pub config_changing: bool,
    /// Set externally after a catch-up phase; suppresses the next round of
    /// expected mismatch warnings
    pub catching_up: bool,
    /// Last time a valid leader message arrived (election timer base)
    pub last_heartbeat: Instant,
    members: Vec<MemberConfig>,
    log_store: Box<dyn LogStore>,
    state_machine: Box<dyn StateMachine>,
    last_snapshot: Option<Arc<Snapshot>>,
    observer: Option<Arc<dyn Observer>>,
    commit_state: Arc<CommitState>,
    waiters: HashMap<u64, oneshot::Sender<ApplyResult>>,
    config: ReplicationConfig,
}

impl ReplicaCore {
    pub fn new(
        id: u64,
        members: Vec<MemberConfig>,
        log_store: Box<dyn LogStore>,
        state_machine: Box<dyn StateMachine>,
        config: ReplicationConfig,
    ) -> Self {
        ReplicaCore {
            id,
            term: 0,
            role: Role::Follower,
            leader: None,
            config_changing: false,
            catching_up: false,
            last_heartbeat: Instant::now(),
            members,
            log_store,
            state_machine,
            last_snapshot: None,
            observer: None,
            commit_state: Arc::new(CommitState::default()),
            waiters: HashMap::new(),
            config,
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observer = Some(observer);
    }

    // === Log view ===

    pub fn start_index(&self) -> u64 {
        self.log_store.start_index()
    }

    pub fn next_slot(&self) -> u64 {
        self.log_store.next_slot()
    }

    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, StorageError> {
        self.log_store.entries(lo, hi)
    }

    pub fn entry_at(&self, idx: u64) -> Result<LogEntry, StorageError> {
        self.log_store.entry_at(idx)
    }

    /// Term of the entry at `idx`, consulting the snapshot boundary.
    /// Returns 0 for index 0 and for indices this node knows nothing about.
    pub fn term_for_log(&self, idx: u64) -> Result<u64, StorageError> {
        if idx == 0 {
            return Ok(0);
        }
        if idx >= self.log_store.start_index() && idx < self.log_store.next_slot() {
            return self.log_store.term_at(idx);
        }
        if let Some(snapshot) = &self.last_snapshot {
            if snapshot.metadata.last_included_index == idx {
                return Ok(snapshot.metadata.last_included_term);
            }
        }
        Ok(0)
    }

    pub fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.last_snapshot.clone()
    }

    pub fn commit_state(&self) -> Arc<CommitState> {
        self.commit_state.clone()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    // === Membership ===

    pub fn members(&self) -> &[MemberConfig] {
        &self.members
    }

    /// Voting members including this node
    pub fn num_voting_members(&self) -> usize {
        1 + self.members.iter().filter(|m| !m.is_learner).count()
    }

    /// Position of the commit point in the descending matched-index list.
    /// 0 means this node alone is a quorum.
    pub fn quorum_for_commit(&self) -> usize {
        self.num_voting_members() / 2
    }

    // === Role transitions (election logic itself is external) ===

    pub fn become_follower(&mut self) {
        if self.role != Role::Follower {
            info!("node {} steps down to follower at term {}", self.id, self.term);
            self.role = Role::Follower;
        }
        self.last_heartbeat = Instant::now();
    }

    /// Assume leadership and anchor the term with a no-op entry, so that
    /// entries from earlier terms can commit through it.
    pub fn become_leader(&mut self) -> Result<u64, StorageError> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        let idx = self.append_entry(LogEntry::noop(self.term))?;
        info!(
            "node {} became leader at term {}, no-op entry at {}",
            self.id, self.term, idx
        );
        Ok(idx)
    }

    // === Leader-side log mutation ===

    /// Append one entry at the next slot, pre-committing application
    /// payloads and flagging configuration changes.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<u64, StorageError> {
        let kind = entry.kind;
        let payload = entry.payload.clone();
        let idx = self.log_store.append(entry)?;
        match kind {
            EntryKind::Application => self.state_machine.pre_commit(idx, &payload),
            EntryKind::Configuration => {
                info!("appending a config change at {}", idx);
                self.config_changing = true;
            }
            EntryKind::NoOp => {}
        }
        self.log_store.end_of_batch(idx, 1)?;
        Ok(idx)
    }

    /// Register a oneshot to be fired with the state machine result once
    /// the entry at `idx` is applied.
    pub fn register_commit_waiter(&mut self, idx: u64, tx: oneshot::Sender<ApplyResult>) {
        self.waiters.insert(idx, tx);
    }

    // === Follower acceptor ===

    /// Handle an incoming `AppendEntries` request.
    ///
    /// Returns `Ok(None)` when no response must be sent (another leader at
    /// the same term, which is a peer bug, not a reason to crash).
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<Option<AppendEntriesResponse>, StorageError> {
        let mut supp_exp_warning = false;
        if self.catching_up {
            info!("catch-up is done, suppressing the following expected warnings once");
            self.catching_up = false;
            supp_exp_warning = true;
        }

        // Keep the election timer quiet while we are in here, however long
        // the reconcile takes.
        let commit_state = self.commit_state.clone();
        let _serving = ServingReq::enter(&commit_state.serving_req);
        let started = Instant::now();

        trace!(
            "from peer {}, req term {}, req last idx {} ({} entries), req commit idx {}, my term {}, my role {:?}",
            req.src,
            req.term,
            req.last_log_idx,
            req.entries.len(),
            req.commit_idx,
            self.term,
            self.role
        );

        if req.term > self.term {
            self.term = req.term;
            self.become_follower();
        }

        if req.term == self.term {
            match self.role {
                Role::Candidate => self.become_follower(),
                Role::Leader => {
                    warn!(
                        "received AppendEntries from another leader ({}) with the same term {}, \
                         there must be a bug; ignoring it instead of exiting",
                        req.src, req.term
                    );
                    return Ok(None);
                }
                Role::Follower => {}
            }
        }

        // Declines carry our next slot so the leader can jump straight to
        // an index that might align.
        let mut resp = AppendEntriesResponse {
            term: self.term,
            src: self.id,
            dst: req.src,
            next_idx: self.log_store.next_slot(),
            accepted: false,
        };

        let log_term = if req.last_log_idx < self.log_store.next_slot() {
            self.term_for_log(req.last_log_idx)?
        } else {
            0
        };
        let log_okay = req.last_log_idx == 0
            || (log_term != 0 && req.last_log_term == log_term)
            || self.last_snapshot.as_ref().is_some_and(|s| {
                s.metadata.last_included_index == req.last_log_idx
                    && s.metadata.last_included_term == req.last_log_term
            });

        if req.term < self.term || !log_okay {
            if supp_exp_warning {
                info!(
                    "deny: req term {}, my term {}, req log idx {}, my log idx {}, log term {}",
                    req.term,
                    self.term,
                    req.last_log_idx,
                    self.log_store.next_slot() - 1,
                    log_term
                );
            } else {
                warn!(
                    "deny: req term {}, my term {}, req log idx {}, my log idx {}, log term {}",
                    req.term,
                    self.term,
                    req.last_log_idx,
                    self.log_store.next_slot() - 1,
                    log_term
                );
            }
            return Ok(Some(resp));
        }

        // The request is from the live leader and the logs line up.
        if let Some(observer) = &self.observer {
            observer.on_event(&HookEvent::GotAppendEntryReqFromLeader { leader: req.src });
        }

        if !req.entries.is_empty() {
            let mut log_idx = req.last_log_idx + 1;
            let mut cnt = 0usize;

            // Skip the overlapping prefix that already matches by term.
            while log_idx < self.log_store.next_slot()
                && cnt < req.entries.len()
                && self.log_store.term_at(log_idx)? == req.entries[cnt].term
            {
                log_idx += 1;
                cnt += 1;
            }
            debug!("after skip: log_idx {}, cnt {}", log_idx, cnt);

            // Overwrite the divergent suffix, undoing speculative state.
            while log_idx < self.log_store.next_slot() && cnt < req.entries.len() {
                let old = self.log_store.entry_at(log_idx)?;
                match old.kind {
                    EntryKind::Application => self.state_machine.rollback(log_idx, &old.payload),
                    EntryKind::Configuration => {
                        info!("reverting an uncommitted config change at {}", log_idx);
                        self.config_changing = false;
                    }
                    EntryKind::NoOp => {}
                }

                let entry = req.entries[cnt].clone();
                let kind = entry.kind;
                let payload = entry.payload.clone();
                debug!("overwrite at {}", log_idx);
                self.log_store.write_at(log_idx, entry)?;
                match kind {
                    EntryKind::Application => self.state_machine.pre_commit(log_idx, &payload),
                    EntryKind::Configuration => {
                        info!("received a config change from leader at {}", log_idx);
                        self.config_changing = true;
                    }
                    EntryKind::NoOp => {}
                }

                // A committed entry being overwritten is impossible under
                // correct operation; regress the commit point rather than
                // diverge from the store.
                let sm_commit = self.commit_state.sm_commit_index.load(Ordering::SeqCst);
                if log_idx <= sm_commit {
                    warn!("rolling back commit index from {} to {}", sm_commit, log_idx - 1);
                    self.commit_state
                        .sm_commit_index
                        .store(log_idx - 1, Ordering::SeqCst);
                    self.commit_state
                        .quick_commit_index
                        .store(log_idx - 1, Ordering::SeqCst);
                }

                log_idx += 1;
                cnt += 1;

                if self.commit_state.stopping.load(Ordering::SeqCst) {
                    return Ok(Some(resp));
                }
            }
            debug!("after overwrite: log_idx {}, cnt {}", log_idx, cnt);

            // Append the genuinely new tail.
            while cnt < req.entries.len() {
                let entry = req.entries[cnt].clone();
                cnt += 1;
                let kind = entry.kind;
                let payload = entry.payload.clone();
                let idx = self.log_store.append(entry)?;
                trace!("append at {}", idx);
                match kind {
                    EntryKind::Application => self.state_machine.pre_commit(idx, &payload),
                    EntryKind::Configuration => {
                        info!("received a config change from leader at {}", idx);
                        self.config_changing = true;
                    }
                    EntryKind::NoOp => {}
                }

                if self.commit_state.stopping.load(Ordering::SeqCst) {
                    return Ok(Some(resp));
                }
            }

            self.log_store
                .end_of_batch(req.last_log_idx + 1, req.entries.len() as u64)?;
        }

        self.leader = Some(req.src);
        self.commit_state
            .leader_commit_index
            .store(req.commit_idx, Ordering::SeqCst);

        // The leader's commit index can race ahead of what we just stored;
        // never let the commit point outrun the log.
        self.commit(req.commit_idx.min(self.log_store.next_slot() - 1))?;

        resp.accepted = true;
        resp.next_idx = req.last_log_idx + req.entries.len() as u64 + 1;

        let took = started.elapsed();
        if took >= self.config.heart_beat_interval {
            warn!(
                "appending entries from peer {} took {:?}, longer than the heartbeat interval",
                req.src, took
            );
        }

        // Restart the election timer last; the reconcile above may have
        // taken a while.
        if req.term == self.term && self.role == Role::Follower {
            self.last_heartbeat = Instant::now();
        }

        Ok(Some(resp))
    }

    // === Commit component ===

    /// Advance the commit point to `target_idx` and apply everything newly
    /// committed, in order.
    ///
    /// On the leader, the commit point only moves onto an entry of the
    /// current term (the Raft commitment rule); earlier-term entries commit
    /// indirectly once a current-term entry covers them.
    pub fn commit(&mut self, target_idx: u64) -> Result<(), StorageError> {
        let quick = self.commit_state.quick_commit_index.load(Ordering::SeqCst);
        if target_idx > quick {
            if self.role == Role::Leader && self.term_for_log(target_idx)? != self.term {
                debug!(
                    "not committing {} from an earlier term (current term {})",
                    target_idx, self.term
                );
            } else {
                self.commit_state
                    .quick_commit_index
                    .store(target_idx, Ordering::SeqCst);
            }
        }
        self.apply_committed_entries()
    }

    fn apply_committed_entries(&mut self) -> Result<(), StorageError> {
        loop {
            let sm_commit = self.commit_state.sm_commit_index.load(Ordering::SeqCst);
            let quick = self.commit_state.quick_commit_index.load(Ordering::SeqCst);
            if sm_commit >= quick {
                break;
            }
            let idx = sm_commit + 1;
            if idx >= self.log_store.next_slot() {
                break;
            }
            let entry = self.log_store.entry_at(idx)?;
            let result = match entry.kind {
                EntryKind::Application => Some(self.state_machine.commit(idx, &entry.payload)),
                EntryKind::Configuration => {
                    info!("config change committed at {}", idx);
                    self.config_changing = false;
                    None
                }
                EntryKind::NoOp => None,
            };
            self.commit_state
                .sm_commit_index
                .store(idx, Ordering::SeqCst);

            if let Some(result) = result {
                if let Some(tx) = self.waiters.remove(&idx) {
                    let _ = tx.send(result);
                }
            }
        }
        Ok(())
    }

    // === Snapshots ===

    /// Capture the state machine at the applied index and compact the log
    /// behind it.
    pub fn take_snapshot(&mut self) -> Result<(), String> {
        let sm_commit = self.commit_state.sm_commit_index.load(Ordering::SeqCst);
        if sm_commit == 0 {
            return Err("nothing applied yet".to_string());
        }
        let last_term = self.term_for_log(sm_commit).map_err(|e| e.to_string())?;
        let data = self.state_machine.snapshot()?;
        self.log_store
            .compact_through(sm_commit)
            .map_err(|e| e.to_string())?;
        self.last_snapshot = Some(Arc::new(Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: sm_commit,
                last_included_term: last_term,
            },
            data,
        }));
        info!("took snapshot through index {} (term {})", sm_commit, last_term);
        Ok(())
    }

    /// Handle a single-shot snapshot install from the leader.
    pub fn handle_snapshot_sync(
        &mut self,
        req: &SnapshotSyncRequest,
    ) -> Option<SnapshotSyncResponse> {
        let mut resp = SnapshotSyncResponse {
            term: self.term,
            src: self.id,
            dst: req.src,
            accepted: false,
        };

        if req.term < self.term {
            warn!(
                "deny snapshot: req term {} below my term {}",
                req.term, self.term
            );
            return Some(resp);
        }
        if req.term > self.term {
            self.term = req.term;
            resp.term = req.term;
            self.become_follower();
        }
        if self.role == Role::Candidate {
            self.become_follower();
        } else if self.role == Role::Leader {
            warn!(
                "received a snapshot from another leader ({}) with the same term, \
                 there must be a bug; ignoring it",
                req.src
            );
            return None;
        }

        self.leader = Some(req.src);
        self.last_heartbeat = Instant::now();

        let last_included = req.snapshot.metadata.last_included_index;
        let sm_commit = self.commit_state.sm_commit_index.load(Ordering::SeqCst);
        if last_included <= sm_commit {
            // Already covered; an idempotent success lets the leader move
            // this peer onto the append path.
            debug!(
                "snapshot through {} is stale, already applied {}",
                last_included, sm_commit
            );
            resp.accepted = true;
            return Some(resp);
        }

        if let Err(e) = self.state_machine.restore(&req.snapshot.data) {
            warn!("state machine refused the snapshot: {}", e);
            return Some(resp);
        }
        if let Err(e) = self.log_store.compact_through(last_included) {
            warn!("log compaction after snapshot install failed: {}", e);
            return Some(resp);
        }
        self.last_snapshot = Some(Arc::new(req.snapshot.clone()));

        self.commit_state
            .sm_commit_index
            .store(last_included, Ordering::SeqCst);
        let quick = self.commit_state.quick_commit_index.load(Ordering::SeqCst);
        if last_included > quick {
            self.commit_state
                .quick_commit_index
                .store(last_included, Ordering::SeqCst);
        }
        self.commit_state
            .leader_commit_index
            .store(req.commit_idx, Ordering::SeqCst);

        info!("installed snapshot through index {}", last_included);
        resp.accepted = true;
        Some(resp)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::snapshot::SnapshotMetadata;
    use crate::state_machine::{SharedRecord, TestStateMachine};
    use crate::storage::MemoryLogStore;

    fn new_core(members: Vec<MemberConfig>) -> (ReplicaCore, SharedRecord) {
        let record: SharedRecord = Arc::new(Mutex::new(Default::default()));
        let core = ReplicaCore::new(
            2,
            members,
            Box::new(MemoryLogStore::new()),
            Box::new(TestStateMachine::new_shared(record.clone())),
            ReplicationConfig::default(),
        );
        (core, record)
    }

    fn follower_with_log(terms: &[u64]) -> (ReplicaCore, SharedRecord) {
        let (mut core, record) = new_core(vec![MemberConfig::voter(1), MemberConfig::voter(3)]);
        core.term = *terms.iter().max().unwrap_or(&1);
        for &t in terms {
            core.append_entry(LogEntry::application(t, b"cmd".to_vec()))
                .unwrap();
        }
        (core, record)
    }

    fn req(term: u64, last_idx: u64, last_term: u64, entries: Vec<LogEntry>) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            src: 1,
            dst: 2,
            last_log_idx: last_idx,
            last_log_term: last_term,
            commit_idx: 0,
            entries,
        }
    }

    #[tokio::test]
    async fn test_happy_append() {
        // Leader log [t1,t1,t1], follower log [t1,t1]: entry 3 appends
        let (mut core, _record) = follower_with_log(&[1, 1]);
        let request = req(1, 2, 1, vec![LogEntry::application(1, b"e3".to_vec())]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 4);
        assert_eq!(core.next_slot(), 4);
        assert_eq!(core.term_for_log(3).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mismatch_fast_backtrack() {
        // Follower log [t1,t1] (next slot 3); leader claims last idx 5
        let (mut core, _record) = follower_with_log(&[1, 1]);
        core.term = 2;
        let request = req(2, 5, 2, vec![]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(!resp.accepted);
        assert_eq!(resp.next_idx, 3);
    }

    #[tokio::test]
    async fn test_overwrite_rolls_back_precommit() {
        // Follower log [t1,t1,t2] with entries 1..=2 applied; a new leader
        // at t3 overwrites entry 3
        let (mut core, record) = follower_with_log(&[1, 1, 2]);
        core.term = 2;
        core.commit_state.quick_commit_index.store(2, Ordering::SeqCst);
        core.commit_state.sm_commit_index.store(2, Ordering::SeqCst);

        let request = req(3, 2, 1, vec![LogEntry::application(3, b"new3".to_vec())]);
        let resp = core.handle_append_entries(&request).unwrap().unwrap();

        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 4);
        // 3 > sm_commit_index, so the commit point is untouched
        assert_eq!(core.commit_state.sm_commit_index.load(Ordering::SeqCst), 2);
        let record = record.lock().unwrap();
        assert_eq!(record.rollbacks, vec![(3, b"cmd".to_vec())]);
        assert!(record.pre_commits.contains(&(3, b"new3".to_vec())));
        assert_eq!(core.term_for_log(3).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_committed_overwrite_regresses_commit_point() {
        // Defensive branch: an entry at or below sm_commit_index gets
        // overwritten (impossible under correct operation)
        let (mut core, _record) = follower_with_log(&[1, 1, 2]);
        core.term = 2;
        core.commit_state.quick_commit_index.store(3, Ordering::SeqCst);
        core.commit_state.sm_commit_index.store(3, Ordering::SeqCst);

        let request = req(3, 2, 1, vec![LogEntry::application(3, b"new3".to_vec())]);
        let resp = core.handle_append_entries(&request).unwrap().unwrap();

        assert!(resp.accepted);
        assert_eq!(core.commit_state.sm_commit_index.load(Ordering::SeqCst), 2);
        assert_eq!(core.commit_state.quick_commit_index.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_heartbeat_advances_commit() {
        let (mut core, record) = follower_with_log(&[1, 1]);
        let mut request = req(1, 2, 1, vec![]);
        request.commit_idx = 5; // ahead of our log; must clamp to 2

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 3);
        assert_eq!(core.commit_state.quick_commit_index.load(Ordering::SeqCst), 2);
        assert_eq!(core.commit_state.sm_commit_index.load(Ordering::SeqCst), 2);
        assert_eq!(record.lock().unwrap().commits.len(), 2);
    }

    #[tokio::test]
    async fn test_last_idx_zero_is_always_log_okay() {
        let (mut core, _record) = new_core(vec![MemberConfig::voter(1)]);
        core.term = 1;
        let request = req(1, 0, 0, vec![LogEntry::application(1, b"first".to_vec())]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 2);
    }

    #[tokio::test]
    async fn test_stale_term_rejected() {
        let (mut core, _record) = follower_with_log(&[1, 1]);
        core.term = 5;
        let request = req(3, 2, 1, vec![]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(!resp.accepted);
        assert_eq!(resp.term, 5);
        assert_eq!(resp.next_idx, 3);
    }

    #[tokio::test]
    async fn test_snapshot_boundary_is_log_okay() {
        let (mut core, _record) = follower_with_log(&[1, 1, 2, 2, 2]);
        core.term = 2;
        core.commit_state.quick_commit_index.store(5, Ordering::SeqCst);
        core.commit_state.sm_commit_index.store(5, Ordering::SeqCst);
        core.take_snapshot().unwrap();
        assert_eq!(core.start_index(), 6);

        // The entry at index 5 lives only in the snapshot now
        let request = req(2, 5, 2, vec![LogEntry::application(2, b"e6".to_vec())]);
        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 7);
    }

    #[tokio::test]
    async fn test_same_term_leader_conflict_returns_no_response() {
        let (mut core, _record) = follower_with_log(&[1]);
        core.term = 1;
        core.role = Role::Leader;
        let request = req(1, 1, 1, vec![]);

        assert!(core.handle_append_entries(&request).unwrap().is_none());
        // Logged, not crashed; still leader
        assert_eq!(core.role, Role::Leader);
    }

    #[tokio::test]
    async fn test_candidate_steps_down_on_same_term_request() {
        let (mut core, _record) = follower_with_log(&[1]);
        core.term = 1;
        core.role = Role::Candidate;
        let request = req(1, 1, 1, vec![]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.leader, Some(1));
    }

    #[tokio::test]
    async fn test_greater_term_converts_leader_to_follower() {
        let (mut core, _record) = follower_with_log(&[1]);
        core.term = 1;
        core.role = Role::Leader;
        let request = req(2, 1, 1, vec![]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.term, 2);
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let (mut core, _record) = follower_with_log(&[1, 1]);
        let request = req(1, 2, 1, vec![LogEntry::application(1, b"e3".to_vec())]);

        let first = core.handle_append_entries(&request).unwrap().unwrap();
        let next_slot = core.next_slot();
        let second = core.handle_append_entries(&request).unwrap().unwrap();

        assert_eq!(first.accepted, second.accepted);
        assert_eq!(first.next_idx, second.next_idx);
        assert_eq!(core.next_slot(), next_slot);
    }

    #[tokio::test]
    async fn test_skip_phase_preserves_matching_entries() {
        // Replaying a window that overlaps existing entries must not
        // rewrite the matching prefix
        let (mut core, record) = follower_with_log(&[1, 1, 1]);
        let request = req(
            1,
            1,
            1,
            vec![
                LogEntry::application(1, b"dup2".to_vec()),
                LogEntry::application(1, b"dup3".to_vec()),
                LogEntry::application(1, b"e4".to_vec()),
            ],
        );

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.next_idx, 5);
        assert_eq!(core.next_slot(), 5);
        // Entries 2 and 3 matched by term and were skipped, not rolled back
        assert!(record.lock().unwrap().rollbacks.is_empty());
        assert_eq!(core.entry_at(2).unwrap().payload, b"cmd".to_vec());
        assert_eq!(core.entry_at(4).unwrap().payload, b"e4".to_vec());
    }

    #[tokio::test]
    async fn test_config_entry_toggles_config_changing() {
        let (mut core, _record) = follower_with_log(&[1]);
        let request = req(1, 1, 1, vec![LogEntry::configuration(1, b"members".to_vec())]);

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        assert!(resp.accepted);
        assert!(core.config_changing);

        // Committing the config entry clears the flag
        let mut hb = req(1, 2, 1, vec![]);
        hb.commit_idx = 2;
        core.handle_append_entries(&hb).unwrap().unwrap();
        assert!(!core.config_changing);
    }

    #[tokio::test]
    async fn test_leader_commit_respects_term_rule() {
        let (mut core, record) = new_core(vec![MemberConfig::voter(1), MemberConfig::voter(3)]);
        core.term = 1;
        core.append_entry(LogEntry::application(1, b"old".to_vec()))
            .unwrap();
        core.term = 2;
        core.role = Role::Leader;

        // A quorum on the term-1 entry alone must not commit it
        core.commit(1).unwrap();
        assert_eq!(core.commit_state.quick_commit_index.load(Ordering::SeqCst), 0);

        // Once a term-2 entry is covered, everything below commits with it
        core.append_entry(LogEntry::application(2, b"new".to_vec()))
            .unwrap();
        core.commit(2).unwrap();
        assert_eq!(core.commit_state.quick_commit_index.load(Ordering::SeqCst), 2);
        assert_eq!(record.lock().unwrap().commits.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_sync_installs_and_lifts_commit() {
        let (mut core, _record) = new_core(vec![MemberConfig::voter(1)]);
        core.term = 2;
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: 10,
                last_included_term: 2,
            },
            data: serde_json::to_vec(&Vec::<(u64, Vec<u8>)>::new()).unwrap(),
        };
        let request = SnapshotSyncRequest {
            term: 2,
            src: 1,
            dst: 2,
            commit_idx: 10,
            snapshot,
        };

        let resp = core.handle_snapshot_sync(&request).unwrap();
        assert!(resp.accepted);
        assert_eq!(core.start_index(), 11);
        assert_eq!(core.commit_state.sm_commit_index.load(Ordering::SeqCst), 10);
        assert_eq!(core.commit_state.quick_commit_index.load(Ordering::SeqCst), 10);
        assert_eq!(core.term_for_log(10).unwrap(), 2);

        // Replaying the same install is an idempotent success
        let replay = core.handle_snapshot_sync(&request).unwrap();
        assert!(replay.accepted);
    }

    #[tokio::test]
    async fn test_stopping_returns_early_between_entries() {
        let (mut core, _record) = follower_with_log(&[1, 1]);
        core.commit_state.stopping.store(true, Ordering::SeqCst);
        let request = req(
            1,
            2,
            1,
            vec![
                LogEntry::application(1, b"e3".to_vec()),
                LogEntry::application(1, b"e4".to_vec()),
            ],
        );

        let resp = core.handle_append_entries(&request).unwrap().unwrap();
        // Bailed out with the pre-accept response; the store keeps what was
        // written before the flag was noticed
        assert!(!resp.accepted);
    }

    #[tokio::test]
    async fn test_serving_req_cleared_after_handling() {
        let (mut core, _record) = follower_with_log(&[1]);
        let request = req(1, 1, 1, vec![]);
        core.handle_append_entries(&request).unwrap().unwrap();
        assert!(!core.commit_state.serving_req.load(Ordering::SeqCst));
    }

    /// Log store wrapper recording call order, to pin down that the batch
    /// marker lands after every write of a request.
    struct OrderTrackingStore {
        inner: MemoryLogStore,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl LogStore for OrderTrackingStore {
        fn start_index(&self) -> u64 {
            self.inner.start_index()
        }
        fn next_slot(&self) -> u64 {
            self.inner.next_slot()
        }
        fn term_at(&self, idx: u64) -> Result<u64, StorageError> {
            self.inner.term_at(idx)
        }
        fn entry_at(&self, idx: u64) -> Result<LogEntry, StorageError> {
            self.inner.entry_at(idx)
        }
        fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, StorageError> {
            self.inner.entries(lo, hi)
        }
        fn append(&mut self, entry: LogEntry) -> Result<u64, StorageError> {
            self.ops.lock().unwrap().push("append".to_string());
            self.inner.append(entry)
        }
        fn write_at(&mut self, idx: u64, entry: LogEntry) -> Result<(), StorageError> {
            self.ops.lock().unwrap().push("write_at".to_string());
            self.inner.write_at(idx, entry)
        }
        fn end_of_batch(&mut self, start: u64, count: u64) -> Result<(), StorageError> {
            self.ops.lock().unwrap().push("end_of_batch".to_string());
            self.inner.end_of_batch(start, count)
        }
        fn compact_through(&mut self, idx: u64) -> Result<(), StorageError> {
            self.inner.compact_through(idx)
        }
    }

    #[tokio::test]
    async fn test_end_of_batch_called_after_all_writes() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let mut core = ReplicaCore::new(
            2,
            vec![MemberConfig::voter(1)],
            Box::new(OrderTrackingStore {
                inner: MemoryLogStore::new(),
                ops: ops.clone(),
            }),
            Box::new(TestStateMachine::new()),
            ReplicationConfig::default(),
        );
        core.term = 1;
        let request = req(
            1,
            0,
            0,
            vec![
                LogEntry::application(1, b"a".to_vec()),
                LogEntry::application(1, b"b".to_vec()),
            ],
        );
        core.handle_append_entries(&request).unwrap().unwrap();

        let ops = ops.lock().unwrap();
        assert_eq!(*ops, vec!["append", "append", "end_of_batch"]);
    }
}
