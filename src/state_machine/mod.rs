//! State machine layer
//!
//! - `KeyValueStore`: simple key-value store
//! - `TestStateMachine`: records every operation for assertions

pub mod kv;
pub mod traits;

pub use traits::{ApplyResult, RecordedOps, SharedRecord, StateMachine, TestStateMachine};
