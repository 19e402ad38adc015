//! Connection to a single checker node

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::models::{preview, CheckRequest, NodeResponse, NodeStats, NodeTag};
use crate::dispatch::transport::{CheckerChannel, Connector, ResponseStream};
use crate::error::{DispatchError, Result};

/// Time budget a node gets for probing one item
pub const PER_ITEM_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to one checker node
///
/// Clones share the same channel and connection state.
pub struct NodeConnection<C: Connector> {
    inner: Arc<NodeInner<C>>,
}

struct NodeInner<C: Connector> {
    addr: String,
    tag: NodeTag,
    connector: Arc<C>,
    /// `Some` while connected
    channel: RwLock<Option<C::Channel>>,
    reconnecting: AtomicBool,
}

/// Exclusive right to (re)open a node's channel, released on drop
struct ReconnectSlot<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReconnectSlot<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ReconnectSlot<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<C: Connector> Clone for NodeConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> NodeConnection<C> {
    /// Create a disconnected handle
    pub fn new(addr: impl Into<String>, tag: NodeTag, connector: Arc<C>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                addr: addr.into(),
                tag,
                connector,
                channel: RwLock::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn tag(&self) -> &NodeTag {
        &self.inner.tag
    }

    pub fn is_connected(&self) -> bool {
        self.current_channel().is_some()
    }

    /// Open the channel unless it is already open
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _slot = self.acquire_slot()?;
        if self.is_connected() {
            return Ok(());
        }

        let channel = self.open().await?;
        self.install(Some(channel));
        info!(addr = %self.addr(), node = %self.tag(), "Connected to checker node");
        Ok(())
    }

    /// Return the open channel, reconnecting first if needed
    pub async fn ensure_connected(&self) -> Result<C::Channel> {
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }
        self.reconnect().await
    }

    /// Replace the channel with a freshly opened one
    ///
    /// Fails with [`DispatchError::AlreadyReconnecting`] instead of waiting when
    /// another attempt is in flight.
    pub async fn reconnect(&self) -> Result<C::Channel> {
        let _slot = self.acquire_slot()?;
        if let Some(stale) = self.take_channel() {
            if let Err(err) = stale.close().await {
                warn!(addr = %self.addr(), node = %self.tag(), error = %err, "Failed to close stale channel");
            }
        }

        info!(addr = %self.addr(), node = %self.tag(), "Reconnecting to checker node");
        let channel = self.open().await?;
        self.install(Some(channel.clone()));
        info!(addr = %self.addr(), node = %self.tag(), "Successfully reconnected to checker node");
        Ok(channel)
    }

    /// Stream `items` to the node and return a channel of its responses
    ///
    /// Requests are written by one task and responses read by another, both
    /// stopping when `cancel` fires. A stream failure is delivered as the last
    /// element before the channel closes.
    pub async fn check(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        items: Vec<String>,
    ) -> Result<mpsc::Receiver<Result<NodeResponse>>> {
        let channel = self.ensure_connected().await?;

        let capacity = items.len().max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        tokio::spawn(send_requests(
            request_tx,
            job_id.to_string(),
            items,
            cancel.clone(),
        ));
        tokio::spawn(self.clone().receive_responses(
            channel,
            ReceiverStream::new(request_rx),
            result_tx,
            job_id.to_string(),
            cancel.clone(),
        ));

        Ok(result_rx)
    }

    /// Check one item and wait for its terminal response
    ///
    /// Progress markers are skipped. A stream that ends without a verdict
    /// yields [`DispatchError::NoResult`], or a timeout once `cancel` fired.
    pub async fn check_one(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        item: &str,
    ) -> Result<NodeResponse> {
        let mut responses = self.check(cancel, job_id, vec![item.to_string()]).await?;

        while let Some(next) = responses.recv().await {
            let response = next?;
            if response.status.is_terminal() {
                return Ok(response);
            }
            debug!(
                job_id,
                node = %self.tag(),
                status = %response.status,
                "Skipping progress update"
            );
        }

        if cancel.is_cancelled() {
            Err(DispatchError::timeout("node did not answer before the job deadline"))
        } else {
            Err(DispatchError::NoResult)
        }
    }

    pub async fn health(&self) -> Result<()> {
        let channel = self.ensure_connected().await?;
        channel.health().await.inspect_err(|e| self.note_failure(e))
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let channel = self.ensure_connected().await?;
        channel.stats().await.inspect_err(|e| self.note_failure(e))
    }

    /// Drop the channel. Closing a closed node is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(channel) = self.take_channel() else {
            return Ok(());
        };
        channel.close().await?;
        info!(addr = %self.addr(), node = %self.tag(), "Closed connection to checker node");
        Ok(())
    }

    fn acquire_slot(&self) -> Result<ReconnectSlot<'_>> {
        ReconnectSlot::try_acquire(&self.inner.reconnecting).ok_or_else(|| {
            DispatchError::AlreadyReconnecting {
                addr: self.addr().to_string(),
            }
        })
    }

    async fn open(&self) -> Result<C::Channel> {
        self.inner
            .connector
            .connect(self.addr())
            .await
            .inspect_err(|e| {
                error!(addr = %self.addr(), node = %self.tag(), error = %e, "Failed to connect to checker node");
            })
    }

    fn current_channel(&self) -> Option<C::Channel> {
        self.inner
            .channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, channel: Option<C::Channel>) {
        *self
            .inner
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner) = channel;
    }

    fn take_channel(&self) -> Option<C::Channel> {
        self.inner
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Mark the node disconnected when the transport itself failed
    fn note_failure(&self, err: &DispatchError) {
        if err.is_channel_failure() && self.take_channel().is_some() {
            warn!(addr = %self.addr(), node = %self.tag(), error = %err, "Checker node channel failed, marking disconnected");
        }
    }

    async fn receive_responses(
        self,
        channel: C::Channel,
        requests: ReceiverStream<CheckRequest>,
        results: mpsc::Sender<Result<NodeResponse>>,
        job_id: String,
        cancel: CancellationToken,
    ) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id, node = %self.tag(), "Job cancelled before the check stream opened");
                return;
            }
            opened = channel.check(requests) => opened,
        };

        let mut stream: ResponseStream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                error!(job_id, node = %self.tag(), error = %err, "Failed to create check stream");
                self.note_failure(&err);
                let _ = results.send(Err(err)).await;
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job_id, node = %self.tag(), "Job cancelled, stopping result processing");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                None => {
                    debug!(job_id, node = %self.tag(), "Stream ended normally");
                    return;
                }
                Some(Err(err)) => {
                    self.log_stream_error(&job_id, &err);
                    self.note_failure(&err);
                    let _ = results.send(Err(err)).await;
                    return;
                }
                Some(Ok(response)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = results.send(Ok(response)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn log_stream_error(&self, job_id: &str, err: &DispatchError) {
        match err {
            DispatchError::Stream {
                code: Some(code),
                message,
            } => error!(
                job_id,
                node = %self.tag(),
                code = ?code,
                message = %message,
                "Stream error"
            ),
            other => error!(
                job_id,
                node = %self.tag(),
                error = %other,
                "Failed to receive response"
            ),
        }
    }
}

async fn send_requests(
    requests: mpsc::Sender<CheckRequest>,
    job_id: String,
    items: Vec<String>,
    cancel: CancellationToken,
) {
    let total = items.len();
    for (index, item) in items.into_iter().enumerate() {
        debug!(job_id, index, item = preview(&item), "Sending item for checking");
        let request = CheckRequest {
            job_id: job_id.clone(),
            item,
            timeout: PER_ITEM_TIMEOUT,
            index,
            total,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job_id, "Job cancelled, stopping sending items");
                return;
            }
            sent = requests.send(request) => {
                if sent.is_err() {
                    error!(job_id, index, "Failed to send request: check stream closed");
                    return;
                }
            }
        }
    }

    debug!(job_id, total, "Sent all items for checking");
}
