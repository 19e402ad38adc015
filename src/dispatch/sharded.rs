//! Sharded dispatch: every item goes to exactly one node

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::dispatch::connection::NodeConnection;
use crate::dispatch::engine::{FanOut, Job};
use crate::dispatch::models::{preview, CheckResult};
use crate::dispatch::transport::Connector;
use crate::error::DispatchError;

/// Routes item `i` to node `i % nodes.len()` and forwards its verdict
pub struct ShardedDispatcher<C: Connector> {
    nodes: Vec<NodeConnection<C>>,
    fan_out: FanOut,
    max_concurrent: usize,
}

impl<C: Connector> ShardedDispatcher<C> {
    pub fn new(nodes: Vec<NodeConnection<C>>, fan_out: FanOut, max_concurrent: usize) -> Self {
        Self {
            nodes,
            fan_out,
            max_concurrent,
        }
    }

    /// Emit one result per item of `job`, returning once all are sent
    pub async fn run(&self, job: &Job, results: &mpsc::Sender<CheckResult>) {
        if self.nodes.is_empty() {
            error!(job_id = %job.id, "No available checker clients");
            reject_all(job, results, &DispatchError::PoolExhausted).await;
            return;
        }

        let limit = match self.fan_out {
            FanOut::Bounded => self.max_concurrent,
            FanOut::Unbounded => job.items.len(),
        }
        .max(1);

        let checks: Vec<_> = job
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| self.check_on(&self.nodes[index % self.nodes.len()], job, item))
            .collect();

        stream::iter(checks)
            .buffer_unordered(limit)
            .for_each(|result| async move {
                let _ = results.send(result).await;
            })
            .await;

        info!(
            job_id = %job.id,
            total_items = job.items.len(),
            workers_used = self.nodes.len(),
            "Completed distributed config check"
        );
    }

    async fn check_on(&self, node: &NodeConnection<C>, job: &Job, item: &str) -> CheckResult {
        let worker_job_id = format!("{}-w{}", job.id, node.tag());
        debug!(
            worker_job_id,
            node = %node.tag(),
            item = preview(item),
            "Sending item to worker"
        );

        let outcome = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(DispatchError::timeout("job deadline reached before the worker answered")),
            outcome = node.check_one(&job.cancel, &worker_job_id, item) => outcome,
        };

        match outcome {
            Ok(response) => {
                debug!(
                    worker_job_id,
                    node = %node.tag(),
                    reported_tag = %response.node_tag,
                    status = %response.status,
                    latency_ms = response.latency_ms,
                    "Worker completed item"
                );
                CheckResult::from_node(item.to_string(), &response, node.tag().clone())
            }
            Err(err) => {
                error!(
                    worker_job_id,
                    node = %node.tag(),
                    error = %err,
                    "Worker failed to process item"
                );
                CheckResult::error(item.to_string(), err.to_string(), BTreeSet::new())
            }
        }
    }
}

/// Finalize every item of `job` with the same error
pub(crate) async fn reject_all(job: &Job, results: &mpsc::Sender<CheckResult>, err: &DispatchError) {
    for item in &job.items {
        let result = CheckResult::error(item.clone(), err.to_string(), BTreeSet::new());
        let _ = results.send(result).await;
    }
}
