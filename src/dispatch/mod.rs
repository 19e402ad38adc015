//! Dispatch module for spreading check batches over checker nodes
//!
//! This module provides:
//! - Per-node connections with serialized reconnects
//! - A pool of connected nodes with round-robin selection
//! - Sharded dispatch, one node per item
//! - Replicated dispatch, every node per item with merged verdicts

pub mod connection;
pub mod engine;
pub mod models;
pub mod pool;
pub mod replicated;
pub mod sharded;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::NodeConnection;
pub use engine::{DispatchEngine, DispatchMode, EngineConfig, FanOut, Job};
pub use models::{
    CheckRequest, CheckResult, CheckStatus, EngineStats, NodeConfig, NodeResponse, NodeStats, NodeTag,
    ProxyDetails, RemoteStatus,
};
pub use pool::ConnectionPool;
pub use replicated::ReplicatedDispatcher;
pub use sharded::ShardedDispatcher;
pub use transport::{CheckerChannel, Connector, ResponseStream};
