//! Per-peer replication state
//!
//! Each remote voter or learner gets one [`Peer`]. The `busy` flag is the
//! sole admission gate for sending: at most one `AppendEntries` is in flight
//! per peer, except when the stuck-peer escape hatch in the dispatcher
//! temporarily frees the flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// One member of the cluster, as seen from the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberConfig {
    pub id: u64,
    /// Learners are replicated to but excluded from quorum
    pub is_learner: bool,
}

impl MemberConfig {
    pub fn voter(id: u64) -> Self {
        MemberConfig {
            id,
            is_learner: false,
        }
    }

    pub fn learner(id: u64) -> Self {
        MemberConfig {
            id,
            is_learner: true,
        }
    }
}

/// Index state protected by the per-peer lock
#[derive(Debug)]
pub struct PeerIndexes {
    /// Next index the leader believes this peer needs.
    /// 0 means "not yet initialized"; the request builder lazily
    /// initializes it to the leader's next slot.
    pub next_log_idx: u64,
    /// Highest index known replicated on this peer
    pub matched_idx: u64,
    /// Start index of the previous request, for retry detection
    pub last_sent_idx: u64,
    /// Consecutive requests that covered the same starting point
    pub cnt_not_applied: u32,
}

/// Replication state for one remote peer
pub struct Peer {
    id: u64,
    is_learner: bool,
    busy: AtomicBool,
    /// Set when the last `set_free` was the stuck-peer override rather
    /// than a real completion
    manual_free: AtomicBool,
    /// Set when the leader appended entries this peer has not acked yet
    pending_commit: AtomicBool,
    /// Declines from a freshly initialized tracker are expected; log them
    /// quietly until the first accepted response
    suppress_errors: AtomicBool,
    indexes: Mutex<PeerIndexes>,
    /// Elapsed time since the last request was sent
    ls_timer: Mutex<Instant>,
    /// Elapsed time since the last sign of life from the peer
    active_timer: Mutex<Instant>,
    long_pause_warnings: AtomicU32,
    recovery_cnt: AtomicU32,
}

impl Peer {
    pub fn new(member: MemberConfig) -> Self {
        Peer {
            id: member.id,
            is_learner: member.is_learner,
            busy: AtomicBool::new(false),
            manual_free: AtomicBool::new(false),
            pending_commit: AtomicBool::new(false),
            suppress_errors: AtomicBool::new(true),
            indexes: Mutex::new(PeerIndexes {
                next_log_idx: 0,
                matched_idx: 0,
                last_sent_idx: 0,
                cnt_not_applied: 0,
            }),
            ls_timer: Mutex::new(Instant::now()),
            active_timer: Mutex::new(Instant::now()),
            long_pause_warnings: AtomicU32::new(0),
            recovery_cnt: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_learner(&self) -> bool {
        self.is_learner
    }

    // === Busy flag ===

    /// Try to claim the in-flight slot. Returns true iff the flag
    /// transitioned free -> busy.
    pub fn make_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_free(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_manual_free(&self) {
        self.manual_free.store(true, Ordering::Release);
    }

    pub fn is_manual_free(&self) -> bool {
        self.manual_free.load(Ordering::Acquire)
    }

    pub fn reset_manual_free(&self) {
        self.manual_free.store(false, Ordering::Release);
    }

    // === Pending-commit flag ===

    pub fn set_pending_commit(&self) {
        self.pending_commit.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn clear_pending_commit(&self) -> bool {
        self.pending_commit.swap(false, Ordering::AcqRel)
    }

    // === Error suppression ===

    pub fn need_to_suppress_error(&self) -> bool {
        self.suppress_errors.load(Ordering::Acquire)
    }

    pub fn clear_suppress_errors(&self) {
        self.suppress_errors.store(false, Ordering::Release);
    }

    // === Index state ===

    pub fn indexes(&self) -> MutexGuard<'_, PeerIndexes> {
        self.indexes.lock().unwrap()
    }

    pub fn matched_idx(&self) -> u64 {
        self.indexes().matched_idx
    }

    pub fn next_log_idx(&self) -> u64 {
        self.indexes().next_log_idx
    }

    // === Timers ===

    pub fn ls_elapsed(&self) -> Duration {
        self.ls_timer.lock().unwrap().elapsed()
    }

    pub fn reset_ls_timer(&self) {
        *self.ls_timer.lock().unwrap() = Instant::now();
    }

    pub fn active_elapsed(&self) -> Duration {
        self.active_timer.lock().unwrap().elapsed()
    }

    pub fn reset_active_timer(&self) {
        *self.active_timer.lock().unwrap() = Instant::now();
    }

    // === Diagnostic counters ===

    /// Increment and return the new warning count
    pub fn inc_long_pause_warnings(&self) -> u32 {
        self.long_pause_warnings.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn long_pause_warnings(&self) -> u32 {
        self.long_pause_warnings.load(Ordering::Acquire)
    }

    pub fn reset_long_pause_warnings(&self) {
        self.long_pause_warnings.store(0, Ordering::Release);
    }

    /// Increment and return the new recovery count
    pub fn inc_recovery_cnt(&self) -> u32 {
        self.recovery_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn recovery_cnt(&self) -> u32 {
        self.recovery_cnt.load(Ordering::Acquire)
    }

    pub fn reset_recovery_cnt(&self) {
        self.recovery_cnt.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("is_learner", &self.is_learner)
            .field("busy", &self.is_busy())
            .finish()
    }
}
