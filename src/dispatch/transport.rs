//! Transport abstraction for checker nodes
//!
//! Separates the dispatch logic from the RPC stack so that the engine can run
//! against real gRPC channels or an in-memory node in tests.

use std::future::Future;

use futures::stream::BoxStream;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::models::{CheckRequest, NodeResponse, NodeStats};
use crate::error::Result;

/// Stream of responses from one check call
pub type ResponseStream = BoxStream<'static, Result<NodeResponse>>;

/// Opens channels to checker nodes
pub trait Connector: Send + Sync + 'static {
    type Channel: CheckerChannel;

    /// Open a channel to the node at `addr`
    fn connect(&self, addr: &str) -> impl Future<Output = Result<Self::Channel>> + Send;
}

/// An open channel to one checker node
///
/// Handles are cheap to clone and share the underlying connection.
pub trait CheckerChannel: Clone + Send + Sync + 'static {
    /// Start a bidirectional check call fed by `requests`
    ///
    /// The request half is finished when the sender of `requests` is dropped.
    fn check(
        &self,
        requests: ReceiverStream<CheckRequest>,
    ) -> impl Future<Output = Result<ResponseStream>> + Send;

    /// Unary liveness probe
    fn health(&self) -> impl Future<Output = Result<()>> + Send;

    /// Unary counters query
    fn stats(&self) -> impl Future<Output = Result<NodeStats>> + Send;

    /// Release the channel
    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}
