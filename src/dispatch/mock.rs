//! Scripted in-memory checker nodes for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::models::{CheckRequest, NodeConfig, NodeResponse, NodeStats, RemoteStatus};
use crate::dispatch::transport::{CheckerChannel, Connector, ResponseStream};
use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Respond {
        status: RemoteStatus,
        is_valid: bool,
        latency_ms: i64,
    },
    Silent,
    Refuse,
    FailMidStream,
}

pub(crate) struct MockNode {
    behavior: Behavior,
    progress: bool,
    reachable: AtomicBool,
    healthy: bool,
    fail_close: bool,
    stats: NodeStats,
    requests: Mutex<Vec<CheckRequest>>,
    health_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MockNode {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            progress: false,
            reachable: AtomicBool::new(true),
            healthy: true,
            fail_close: false,
            stats: NodeStats::default(),
            requests: Mutex::new(Vec::new()),
            health_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Answers every item with the given verdict
    pub fn verdict(status: RemoteStatus, is_valid: bool, latency_ms: i64) -> Self {
        Self::with_behavior(Behavior::Respond {
            status,
            is_valid,
            latency_ms,
        })
    }

    pub fn success(latency_ms: i64) -> Self {
        Self::verdict(RemoteStatus::Success, true, latency_ms)
    }

    pub fn failure() -> Self {
        Self::verdict(RemoteStatus::Failed(3), false, 0)
    }

    /// Accepts the stream but never answers
    pub fn silent() -> Self {
        Self::with_behavior(Behavior::Silent)
    }

    /// Rejects the stream with `Unavailable`
    pub fn refusing() -> Self {
        Self::with_behavior(Behavior::Refuse)
    }

    /// Fails the stream after reading a request
    pub fn failing_mid_stream() -> Self {
        Self::with_behavior(Behavior::FailMidStream)
    }

    /// Cannot be connected to
    pub fn unreachable() -> Self {
        let node = Self::success(0);
        node.reachable.store(false, Ordering::SeqCst);
        node
    }

    /// Emit PENDING and CHECKING before each verdict
    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_stats(mut self, stats: NodeStats) -> Self {
        self.stats = stats;
        self
    }

    fn record(&self, request: CheckRequest) {
        self.requests.lock().unwrap().push(request);
    }

    fn script(&self, item: &str, tag: &str) -> Vec<Result<NodeResponse>> {
        let Behavior::Respond {
            status,
            is_valid,
            latency_ms,
        } = self.behavior
        else {
            return vec![Err(tonic::Status::internal("checker crashed").into())];
        };

        let mut script = Vec::new();
        if self.progress {
            script.push(Ok(response(item, tag, RemoteStatus::Pending, false, 0)));
            script.push(Ok(response(item, tag, RemoteStatus::Checking, false, 0)));
        }
        script.push(Ok(response(item, tag, status, is_valid, latency_ms)));
        script
    }
}

fn response(item: &str, tag: &str, status: RemoteStatus, is_valid: bool, latency_ms: i64) -> NodeResponse {
    let mut response = crate::dispatch::models::response(item, status, is_valid, latency_ms);
    response.node_tag = tag.to_string();
    response
}

/// Connector resolving addresses to scripted nodes
pub(crate) struct MockConnector {
    nodes: Vec<(String, Arc<MockNode>)>,
    connect_delay: Duration,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            connect_delay: Duration::ZERO,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Register a node; its address doubles as its tag
    pub fn with_node(mut self, addr: &str, node: MockNode) -> Self {
        self.nodes.push((addr.to_string(), Arc::new(node)));
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn node_configs(&self) -> Vec<NodeConfig> {
        self.nodes
            .iter()
            .map(|(addr, _)| NodeConfig::new(addr.clone(), addr.as_str()))
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        if let Some(node) = self.find(addr) {
            node.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    pub fn requests(&self, addr: &str) -> Vec<CheckRequest> {
        self.find(addr)
            .map(|node| node.requests.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn health_calls(&self, addr: &str) -> usize {
        self.find(addr)
            .map_or(0, |node| node.health_calls.load(Ordering::SeqCst))
    }

    pub fn close_calls(&self, addr: &str) -> usize {
        self.find(addr)
            .map_or(0, |node| node.close_calls.load(Ordering::SeqCst))
    }

    /// Items the node has received, in arrival order
    pub fn received(&self, addr: &str) -> Vec<String> {
        self.requests(addr).into_iter().map(|r| r.item).collect()
    }

    fn find(&self, addr: &str) -> Option<Arc<MockNode>> {
        self.nodes
            .iter()
            .find(|(a, _)| a == addr)
            .map(|(_, node)| Arc::clone(node))
    }
}

impl Connector for MockConnector {
    type Channel = MockChannel;

    async fn connect(&self, addr: &str) -> Result<MockChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let node = self
            .find(addr)
            .filter(|node| node.reachable.load(Ordering::SeqCst))
            .ok_or_else(|| DispatchError::connection(addr, "connection refused"))?;
        Ok(MockChannel {
            addr: addr.to_string(),
            node,
        })
    }
}

#[derive(Clone)]
pub(crate) struct MockChannel {
    addr: String,
    node: Arc<MockNode>,
}

impl CheckerChannel for MockChannel {
    async fn check(&self, mut requests: ReceiverStream<CheckRequest>) -> Result<ResponseStream> {
        let node = Arc::clone(&self.node);
        match node.behavior {
            Behavior::Refuse => return Err(tonic::Status::unavailable("node refused stream").into()),
            Behavior::Silent => {
                tokio::spawn(async move {
                    while let Some(request) = requests.next().await {
                        node.record(request);
                    }
                });
                return Ok(futures::stream::pending().boxed());
            }
            Behavior::Respond { .. } | Behavior::FailMidStream => {}
        }

        let tag = self.addr.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                let item = request.item.clone();
                node.record(request);
                for response in node.script(&item, &tag) {
                    if tx.send(response).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health(&self) -> Result<()> {
        self.node.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.node.healthy {
            Ok(())
        } else {
            Err(tonic::Status::internal(format!("checker {} unhealthy", self.addr)).into())
        }
    }

    async fn stats(&self) -> Result<NodeStats> {
        Ok(self.node.stats.clone())
    }

    async fn close(&self) -> Result<()> {
        self.node.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.node.fail_close {
            Err(DispatchError::connection(self.addr.clone(), "close failed"))
        } else {
            Ok(())
        }
    }
}
