//! Fatal-error reporting seam
//!
//! A fatal invariant violation means the local replication state can no
//! longer be trusted. The engine notifies the state manager, then halts all
//! further dispatching; it never kills the process itself.

use tracing::error;

/// Invariant violations that unambiguously halt replication
#[derive(Debug, Clone, thiserror::Error)]
pub enum FatalError {
    #[error(
        "peer {peer} last log index {last_log_idx} is not below leader next slot {next_slot}"
    )]
    PeerIndexCorrupted {
        peer: u64,
        last_log_idx: u64,
        next_slot: u64,
    },
}

/// Receives fatal invariant violations before replication halts
pub trait StateManager: Send + Sync {
    fn system_exit(&self, err: &FatalError);
}

/// Default state manager: records the violation in the log
pub struct LoggingStateManager;

impl StateManager for LoggingStateManager {
    fn system_exit(&self, err: &FatalError) {
        error!("fatal replication error, halting: {}", err);
    }
}
