//! Pool of checker node connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tracing::{error, info};

use crate::dispatch::connection::NodeConnection;
use crate::dispatch::models::{NodeConfig, NodeTag};
use crate::dispatch::transport::Connector;
use crate::error::{DispatchError, Result};

struct Members<C: Connector> {
    nodes: Vec<NodeConnection<C>>,
    tags: Vec<NodeTag>,
}

impl<C: Connector> Default for Members<C> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// Ordered set of connected checker nodes
pub struct ConnectionPool<C: Connector> {
    members: RwLock<Members<C>>,
    cursor: AtomicUsize,
}

impl<C: Connector> ConnectionPool<C> {
    /// Connect to every node, keeping the ones that answered
    ///
    /// Unreachable nodes are logged and left out. Fails only when no node
    /// could be connected.
    pub async fn connect(connector: Arc<C>, nodes: &[NodeConfig]) -> Result<Self> {
        let attempts = nodes.iter().map(|node| {
            let conn = NodeConnection::new(node.addr.clone(), node.tag.clone(), Arc::clone(&connector));
            async move {
                let outcome = conn.connect().await;
                (conn, outcome)
            }
        });

        let mut members = Members::default();
        for (conn, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    info!(addr = %conn.addr(), node = %conn.tag(), "Connected to checker node");
                    members.tags.push(conn.tag().clone());
                    members.nodes.push(conn);
                }
                Err(err) => {
                    error!(addr = %conn.addr(), node = %conn.tag(), error = %err, "Failed to create checker client");
                }
            }
        }

        if members.nodes.is_empty() {
            return Err(DispatchError::PoolExhausted);
        }

        Ok(Self {
            members: RwLock::new(members),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Copy of the current nodes, safe to iterate across awaits
    pub fn snapshot(&self) -> Vec<NodeConnection<C>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clone()
    }

    pub fn tags(&self) -> Vec<NodeTag> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tags
            .clone()
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next node in rotation, for calls that need a single target
    pub fn select_round_robin(&self) -> Option<NodeConnection<C>> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        if members.nodes.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % members.nodes.len();
        Some(members.nodes[index].clone())
    }

    /// Close every node and empty the pool, returning the last close error
    pub async fn close(&self) -> Result<()> {
        let members = std::mem::take(&mut *self.members.write().unwrap_or_else(PoisonError::into_inner));

        let mut last_err = None;
        for (node, tag) in members.nodes.iter().zip(&members.tags) {
            if let Err(err) = node.close().await {
                error!(node = %tag, error = %err, "Failed to close checker client");
                last_err = Some(err);
            }
        }

        last_err.map_or(Ok(()), Err)
    }
}
