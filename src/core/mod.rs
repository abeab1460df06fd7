//! Replication core: configuration, wire messages, peer tracking, the
//! follower acceptor, the leader dispatcher, and the server runtime.

pub mod config;
pub mod message;
pub mod observer;
pub mod peer;
pub mod replica_core;
pub mod replica_node;
pub mod replica_server;
pub mod snapshot;
pub mod state_manager;
