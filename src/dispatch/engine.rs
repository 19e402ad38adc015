//! Dispatch engine: entry point for checking batches of items

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::models::{CheckResult, EngineStats, NodeConfig, NodeTag};
use crate::dispatch::pool::ConnectionPool;
use crate::dispatch::replicated::ReplicatedDispatcher;
use crate::dispatch::sharded::ShardedDispatcher;
use crate::dispatch::transport::Connector;
use crate::error::{DispatchError, Result};

/// Job timeout used when none is configured
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Concurrency limit used when none is configured
const DEFAULT_MAX_CONCURRENT: usize = 100;

/// Horizon used for deadlines too far out to represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How a batch is spread over the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Each item goes to exactly one node
    #[default]
    Sharded,
    /// Each item goes to every node and the verdicts are merged
    Replicated,
}

/// Concurrency policy for sharded dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOut {
    /// At most `max_concurrent` items in flight
    #[default]
    Bounded,
    /// Every item of the batch in flight at once
    Unbounded,
}

impl FromStr for FanOut {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bounded" => Ok(FanOut::Bounded),
            "unbounded" => Ok(FanOut::Unbounded),
            _ => Err(format!("invalid fan-out: {}. Use: bounded, unbounded", s)),
        }
    }
}

impl fmt::Display for FanOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanOut::Bounded => write!(f, "bounded"),
            FanOut::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Configuration for the dispatch engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checker nodes to connect to
    pub nodes: Vec<NodeConfig>,
    /// Single node address used when `nodes` is empty
    pub legacy_addr: Option<String>,
    /// Default job deadline, truncated to whole seconds
    pub timeout: Duration,
    /// Limit on items processed at once
    pub max_concurrent: usize,
    pub mode: DispatchMode,
    pub shard_fan_out: FanOut,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            legacy_addr: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            mode: DispatchMode::Sharded,
            shard_fan_out: FanOut::Bounded,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeConfig>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_legacy_addr(mut self, addr: String) -> Self {
        self.legacy_addr = Some(addr);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_shard_fan_out(mut self, fan_out: FanOut) -> Self {
        self.shard_fan_out = fan_out;
        self
    }

    /// Apply defaults for zero values
    fn normalized(mut self) -> Self {
        self.timeout = Duration::from_secs(self.timeout.as_secs());
        if self.timeout.is_zero() {
            self.timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        }
        if self.max_concurrent == 0 {
            self.max_concurrent = DEFAULT_MAX_CONCURRENT;
        }
        self
    }

    /// Nodes to connect to, falling back to the legacy address
    fn resolved_nodes(&self) -> Result<Vec<NodeConfig>> {
        if !self.nodes.is_empty() {
            return Ok(self.nodes.clone());
        }
        match &self.legacy_addr {
            Some(addr) if !addr.is_empty() => Ok(vec![NodeConfig::new(addr.clone(), NodeTag::legacy())]),
            _ => Err(DispatchError::config("no checker nodes configured")),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
}

/// Decrements the active job counter on drop
struct ActiveGuard {
    counters: Arc<Counters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One batch submission
pub struct Job {
    pub id: String,
    pub items: Vec<String>,
    pub deadline: Instant,
    /// Fires when the deadline passes or the job finishes
    pub cancel: CancellationToken,
    _active: ActiveGuard,
}

#[cfg(test)]
impl Job {
    /// Job with its own counters, for driving dispatchers directly
    pub(crate) fn detached(id: &str, items: Vec<String>) -> Self {
        let counters = Arc::new(Counters::default());
        counters.active_requests.fetch_add(1, Ordering::Relaxed);
        Self {
            id: id.to_string(),
            items,
            deadline: Instant::now() + Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            cancel: CancellationToken::new(),
            _active: ActiveGuard { counters },
        }
    }
}

/// Spreads batches of items over a pool of checker nodes
pub struct DispatchEngine<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    config: EngineConfig,
    counters: Arc<Counters>,
}

impl<C: Connector> DispatchEngine<C> {
    /// Connect to the configured nodes through `connector`
    pub async fn new(config: EngineConfig, connector: C) -> Result<Self> {
        let config = config.normalized();
        let nodes = config.resolved_nodes()?;
        let pool = ConnectionPool::connect(Arc::new(connector), &nodes).await?;

        info!(
            nodes = pool.len(),
            mode = ?config.mode,
            timeout_secs = config.timeout.as_secs(),
            max_concurrent = config.max_concurrent,
            "Dispatch engine ready"
        );

        Ok(Self {
            pool: Arc::new(pool),
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Check `items` and stream back one result per item in completion order
    ///
    /// A missing or zero `deadline` falls back to the configured timeout. The
    /// returned channel closes once every item has a result.
    pub fn submit(&self, items: Vec<String>, deadline: Option<Duration>) -> mpsc::Receiver<CheckResult> {
        let (results_tx, results_rx) = mpsc::channel(items.len().max(1));

        let deadline = deadline
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.timeout);
        let job = self.start_job(items, deadline);

        let pool = Arc::clone(&self.pool);
        let config = self.config.clone();
        tokio::spawn(async move {
            run_job(job, pool, config, results_tx).await;
        });

        results_rx
    }

    /// Check `items` and wait for every result
    pub async fn check_all(&self, items: Vec<String>, deadline: Option<Duration>) -> Vec<CheckResult> {
        let mut results_rx = self.submit(items, deadline);
        let mut results = Vec::new();
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }
        results
    }

    /// Probe every node, returning the last failure
    pub async fn health_check(&self) -> Result<()> {
        let nodes = self.pool.snapshot();
        if nodes.is_empty() {
            return Err(DispatchError::PoolExhausted);
        }

        let mut last_err = None;
        for node in nodes {
            let outcome = match tokio::time::timeout(self.config.timeout, node.health()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::timeout("health check")),
            };
            if let Err(err) = outcome {
                error!(addr = %node.addr(), node = %node.tag(), error = %err, "Health check failed for checker node");
                last_err = Some(err);
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Engine counters plus the counters of the next node in rotation
    pub async fn stats(&self) -> Result<EngineStats> {
        let node = self.pool.select_round_robin().ok_or(DispatchError::PoolExhausted)?;
        let remote = match tokio::time::timeout(self.config.timeout, node.stats()).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(DispatchError::timeout("stats query")),
        };

        Ok(EngineStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            active_requests: self.counters.active_requests.load(Ordering::Relaxed),
            node: node.tag().clone(),
            remote,
        })
    }

    /// Close all node connections
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }

    fn start_job(&self, items: Vec<String>, deadline: Duration) -> Job {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        self.counters.active_requests.fetch_add(1, Ordering::Relaxed);

        Job {
            id: format!("grpc-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            items,
            deadline: deadline_after(deadline),
            cancel: CancellationToken::new(),
            _active: ActiveGuard {
                counters: Arc::clone(&self.counters),
            },
        }
    }
}

/// Instant `after` from now, or [`FAR_FUTURE`] from now when that overflows
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

async fn run_job<C: Connector>(
    job: Job,
    pool: Arc<ConnectionPool<C>>,
    config: EngineConfig,
    results: mpsc::Sender<CheckResult>,
) {
    let nodes = pool.snapshot();
    info!(
        job_id = %job.id,
        items = job.items.len(),
        nodes = nodes.len(),
        mode = ?config.mode,
        "Starting config check"
    );

    {
        let run = async {
            match config.mode {
                DispatchMode::Sharded => {
                    ShardedDispatcher::new(nodes, config.shard_fan_out, config.max_concurrent)
                        .run(&job, &results)
                        .await
                }
                DispatchMode::Replicated => {
                    ReplicatedDispatcher::new(nodes, config.max_concurrent)
                        .run(&job, &results)
                        .await
                }
            }
        };
        tokio::pin!(run);

        if tokio::time::timeout_at(job.deadline, &mut run).await.is_err() {
            warn!(job_id = %job.id, "Job deadline exceeded");
            job.cancel.cancel();
            run.await;
        }
    }
    job.cancel.cancel();
    info!(job_id = %job.id, "Completed config check");

    // Release the active counter before the result channel closes
    drop(job);
    drop(results);
}
