//! State machine abstraction
//!
//! The state machine is the application logic replication coordinates.
//! Entries are *pre-committed* when first stored (a speculative, reversible
//! notification), *rolled back* if overwritten before commit, and
//! *committed* once the commit index crosses them. Implementations must be
//! deterministic: committing the same payloads in the same order must
//! produce the same state on every node.

use std::sync::{Arc, Mutex};

/// Result of committing a payload: Ok(output) or Err(message)
pub type ApplyResult = Result<String, String>;

pub trait StateMachine: Send {
    /// Speculative notification that `payload` was stored at `idx`.
    /// May be undone by `rollback`.
    fn pre_commit(&mut self, idx: u64, payload: &[u8]) {
        let _ = (idx, payload);
    }

    /// The entry at `idx` was overwritten before committing; undo its
    /// pre-commit.
    fn rollback(&mut self, idx: u64, payload: &[u8]) {
        let _ = (idx, payload);
    }

    /// Apply the committed payload at `idx`
    fn commit(&mut self, idx: u64, payload: &[u8]) -> ApplyResult;

    /// Serialize the current state for a snapshot
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a deserialized snapshot
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Everything a [`TestStateMachine`] has seen, in call order
#[derive(Debug, Default)]
pub struct RecordedOps {
    pub pre_commits: Vec<(u64, Vec<u8>)>,
    pub rollbacks: Vec<(u64, Vec<u8>)>,
    pub commits: Vec<(u64, Vec<u8>)>,
}

/// Shared record of operations for inspection from outside the core
pub type SharedRecord = Arc<Mutex<RecordedOps>>;

/// Test state machine that records every pre-commit, rollback, and commit
pub struct TestStateMachine {
    record: SharedRecord,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            record: Arc::new(Mutex::new(RecordedOps::default())),
        }
    }

    /// Create with a shared record to inspect operations from outside
    pub fn new_shared(record: SharedRecord) -> Self {
        TestStateMachine { record }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn pre_commit(&mut self, idx: u64, payload: &[u8]) {
        self.record
            .lock()
            .unwrap()
            .pre_commits
            .push((idx, payload.to_vec()));
    }

    fn rollback(&mut self, idx: u64, payload: &[u8]) {
        self.record
            .lock()
            .unwrap()
            .rollbacks
            .push((idx, payload.to_vec()));
    }

    fn commit(&mut self, idx: u64, payload: &[u8]) -> ApplyResult {
        self.record
            .lock()
            .unwrap()
            .commits
            .push((idx, payload.to_vec()));
        Ok(String::new())
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let record = self.record.lock().unwrap();
        serde_json::to_vec(&record.commits)
            .map_err(|e| format!("test state machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let commits: Vec<(u64, Vec<u8>)> = serde_json::from_slice(data)
            .map_err(|e| format!("test state machine restore failed: {}", e))?;
        self.record.lock().unwrap().commits = commits;
        Ok(())
    }
}
