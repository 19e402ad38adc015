//! Proxy Dispatch - Distributed Proxy Check Dispatcher
//!
//! Spreads batches of proxy configs over a pool of remote checker nodes and
//! streams back one verdict per item. Items are either sharded across the
//! nodes or replicated to every node with the verdicts merged.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod rpc;

pub use dispatch::*;
pub use error::{DispatchError, Result};
pub use rpc::{GrpcChannel, GrpcConnector, TransportOptions};
