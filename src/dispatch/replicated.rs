//! Replicated dispatch: every item goes to every node and the verdicts are merged

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::dispatch::connection::NodeConnection;
use crate::dispatch::engine::Job;
use crate::dispatch::models::{latency_from_ms, preview, CheckResult, NodeResponse, NodeTag, ProxyDetails};
use crate::dispatch::sharded::reject_all;
use crate::dispatch::transport::Connector;
use crate::error::{DispatchError, Result};

const ALL_WORKERS_FAILED: &str = "all workers failed to validate config";
const WORKERS_TIMED_OUT: &str = "timeout waiting for worker results";

pub struct ReplicatedDispatcher<C: Connector> {
    nodes: Vec<NodeConnection<C>>,
    max_concurrent: usize,
}

impl<C: Connector> ReplicatedDispatcher<C> {
    pub fn new(nodes: Vec<NodeConnection<C>>, max_concurrent: usize) -> Self {
        Self { nodes, max_concurrent }
    }

    /// Emit one merged result per item of `job`
    ///
    /// At most `max_concurrent` items are in flight at once.
    pub async fn run(&self, job: &Job, results: &mpsc::Sender<CheckResult>) {
        if self.nodes.is_empty() {
            error!(job_id = %job.id, "No available checker clients");
            reject_all(job, results, &DispatchError::PoolExhausted).await;
            return;
        }

        info!(
            job_id = %job.id,
            total_items = job.items.len(),
            total_workers = self.nodes.len(),
            "Starting aggregated config check"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let checks: Vec<_> = job
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let sem = Arc::clone(&semaphore);
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = job.cancel.cancelled() => None,
                        permit = sem.acquire_owned() => permit.ok(),
                    };
                    match permit {
                        Some(_permit) => self.check_with_all(job, index, item).await,
                        None => CheckResult::error(item.clone(), WORKERS_TIMED_OUT.to_string(), BTreeSet::new()),
                    }
                }
            })
            .collect();

        stream::iter(checks)
            .buffer_unordered(job.items.len().max(1))
            .for_each(|result| async move {
                let _ = results.send(result).await;
            })
            .await;

        info!(job_id = %job.id, total_items = job.items.len(), "Completed aggregated config check");
    }

    async fn check_with_all(&self, job: &Job, index: usize, item: &str) -> CheckResult {
        let item_job_id = format!("{}-c{}", job.id, index);
        debug!(job_id = %item_job_id, item = preview(item), "Checking item on all workers");

        let mut pending: FuturesUnordered<_> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(n, node)| {
                let worker_job_id = format!("{}-w{}-{}", item_job_id, n, node.tag());
                async move {
                    let outcome = node.check_one(&job.cancel, &worker_job_id, item).await;
                    (node.tag().clone(), outcome)
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(self.nodes.len());
        loop {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => {
                    warn!(
                        job_id = %item_job_id,
                        answered = outcomes.len(),
                        total_workers = self.nodes.len(),
                        "Timeout waiting for worker results"
                    );
                    return CheckResult::error(
                        item.to_string(),
                        WORKERS_TIMED_OUT.to_string(),
                        successful_tags(&outcomes),
                    );
                }
                next = pending.next() => match next {
                    Some((tag, outcome)) => {
                        log_outcome(&item_job_id, &tag, &outcome);
                        outcomes.push((tag, outcome));
                    }
                    None => break,
                },
            }
        }

        merge_outcomes(item, &outcomes)
    }
}

fn log_outcome(job_id: &str, tag: &NodeTag, outcome: &Result<NodeResponse>) {
    match outcome {
        Ok(response) if response.is_success() => {
            debug!(job_id, node = %tag, latency_ms = response.latency_ms, "Worker validated item");
        }
        Ok(response) => {
            debug!(job_id, node = %tag, status = %response.status, error = %response.error, "Worker rejected item");
        }
        Err(err) => {
            warn!(job_id, node = %tag, error = %err, "Worker failed to process item");
        }
    }
}

fn successful_tags(outcomes: &[(NodeTag, Result<NodeResponse>)]) -> BTreeSet<NodeTag> {
    outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Ok(r) if r.is_success()))
        .map(|(tag, _)| tag.clone())
        .collect()
}

/// Reduce per-node outcomes for one item to a single verdict
///
/// Only nodes reporting a valid `SUCCESS` count. Latency is the truncated
/// mean over those nodes and details come from the first of them.
pub(crate) fn merge_outcomes(item: &str, outcomes: &[(NodeTag, Result<NodeResponse>)]) -> CheckResult {
    let successes: Vec<(&NodeTag, &NodeResponse)> = outcomes
        .iter()
        .filter_map(|(tag, outcome)| match outcome {
            Ok(response) if response.is_success() => Some((tag, response)),
            _ => None,
        })
        .collect();

    let Some((_, first)) = successes.first() else {
        return CheckResult::error(item.to_string(), ALL_WORKERS_FAILED.to_string(), BTreeSet::new());
    };

    let total_latency: i64 = successes.iter().map(|(_, r)| r.latency_ms).sum();
    let mean_latency = total_latency / successes.len() as i64;

    CheckResult::success(
        item.to_string(),
        latency_from_ms(mean_latency),
        ProxyDetails::from_response(first),
        successes.iter().map(|(tag, _)| (*tag).clone()).collect(),
    )
}
