//! Simple key-value store state machine
//!
//! Payloads are UTF-8 commands:
//! - `SET key value` - set a key, returns Ok("")
//! - `DELETE key` - delete a key, returns Ok("") or Err("NOT_FOUND")
//!
//! For reads, use the `get()` method directly (bypasses the log).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{ApplyResult, StateMachine};

/// Simple in-memory key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore {
            data: HashMap::new(),
        }
    }

    /// Get a value directly (for read-only queries, bypasses the log)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Get all key-value pairs
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared key-value store usable for both replication and direct reads
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn commit(&mut self, idx: u64, payload: &[u8]) -> ApplyResult {
        self.lock().unwrap().commit(idx, payload)
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.lock().unwrap().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().unwrap().restore(data)
    }
}

impl StateMachine for KeyValueStore {
    fn commit(&mut self, _idx: u64, payload: &[u8]) -> ApplyResult {
        let command = String::from_utf8_lossy(payload);
        let parts: Vec<&str> = command.splitn(3, ' ').collect();

        match parts.as_slice() {
            ["SET", key, value] => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(String::new())
            }
            ["DELETE", key] => {
                if self.data.remove(*key).is_some() {
                    Ok(String::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
            _ => Err(format!("unknown command: {}", command)),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("kv snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let restored: KeyValueStore =
            serde_json::from_slice(data).map_err(|e| format!("kv restore failed: {}", e))?;
        self.data = restored.data;
        Ok(())
    }
}
