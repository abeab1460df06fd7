//! Log store abstraction
//!
//! The log is an ordered sequence of entries addressed by 1-based index.
//! Entries below `start_index` have been compacted into a snapshot and are
//! no longer retrievable. All operations are synchronous to keep the
//! replication core simple; implementations may block on I/O.

use crate::core::message::LogEntry;

/// Errors that can occur during log store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The index is outside the stored range
    #[error("log index {0} is out of range")]
    OutOfRange(u64),
    /// The index has been compacted into a snapshot
    #[error("log index {0} has been compacted")]
    Compacted(u64),
    /// Underlying I/O failure
    #[error("log store I/O error: {0}")]
    Io(String),
}

/// Persistent, ordered log of replication entries
pub trait LogStore: Send {
    /// First retained index (1 for a store that was never compacted)
    fn start_index(&self) -> u64;

    /// Index at which the next entry will be written; `next_slot() - 1`
    /// is the last stored index
    fn next_slot(&self) -> u64;

    /// Term of the entry at `idx`
    fn term_at(&self, idx: u64) -> Result<u64, StorageError>;

    /// Entry at `idx`
    fn entry_at(&self, idx: u64) -> Result<LogEntry, StorageError>;

    /// Entries in the half-open range `[lo, hi)`
    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, StorageError>;

    /// Append an entry at the next slot, returning its index
    fn append(&mut self, entry: LogEntry) -> Result<u64, StorageError>;

    /// Overwrite the entry at `idx`, discarding everything after it
    fn write_at(&mut self, idx: u64, entry: LogEntry) -> Result<(), StorageError>;

    /// Durability marker: called once after all writes of a request batch
    /// starting at `start` with `count` entries, before the response goes
    /// out
    fn end_of_batch(&mut self, start: u64, count: u64) -> Result<(), StorageError>;

    /// Drop every entry at or below `idx` (snapshot compaction). After the
    /// call `start_index() == idx + 1`, and `next_slot()` is at least
    /// `idx + 1`.
    fn compact_through(&mut self, idx: u64) -> Result<(), StorageError>;
}
