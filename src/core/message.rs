//! Log entries and wire messages for log replication

use serde::{Deserialize, Serialize};

use super::snapshot::Snapshot;

/// What a log entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state machine command
    Application,
    /// A cluster configuration change
    Configuration,
    /// A no-op entry appended by a fresh leader to anchor its term
    NoOp,
}

/// A single log entry.
///
/// Entries do not carry their own index; the log store addresses them by
/// position, and the wire protocol derives positions from
/// `last_log_idx + 1` onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term under which the entry was created by a leader
    pub term: u64,
    pub kind: EntryKind,
    /// Opaque payload; the state machine interprets it
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn application(term: u64, payload: Vec<u8>) -> Self {
        LogEntry {
            term,
            kind: EntryKind::Application,
            payload,
        }
    }

    pub fn configuration(term: u64, payload: Vec<u8>) -> Self {
        LogEntry {
            term,
            kind: EntryKind::Configuration,
            payload,
        }
    }

    pub fn noop(term: u64) -> Self {
        LogEntry {
            term,
            kind: EntryKind::NoOp,
            payload: Vec::new(),
        }
    }
}

/// AppendEntries RPC request (heartbeat when `entries` is empty)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: u64,
    /// Sending node ID
    pub src: u64,
    /// Receiving node ID
    pub dst: u64,
    /// Index of the log entry immediately preceding `entries`
    pub last_log_idx: u64,
    /// Term of the entry at `last_log_idx`
    pub last_log_term: u64,
    /// Leader's commit index
    pub commit_idx: u64,
    /// Entries to store, in index order starting at `last_log_idx + 1`
    pub entries: Vec<LogEntry>,
}

/// AppendEntries RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's current term
    pub term: u64,
    pub src: u64,
    pub dst: u64,
    /// On accept: one past the last stored index. On decline: the
    /// responder's next slot, as a hint for the leader to jump to.
    pub next_idx: u64,
    pub accepted: bool,
}

/// Single-shot snapshot install, sent when a follower is behind the
/// leader's log start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSyncRequest {
    pub term: u64,
    pub src: u64,
    pub dst: u64,
    /// Leader's commit index
    pub commit_idx: u64,
    pub snapshot: Snapshot,
}

/// Response to a snapshot install
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSyncResponse {
    pub term: u64,
    pub src: u64,
    pub dst: u64,
    pub accepted: bool,
}

/// What the request builder produced for a peer this round
#[derive(Debug, Clone)]
pub enum PeerRequest {
    Entries(AppendEntriesRequest),
    Snapshot(SnapshotSyncRequest),
}
