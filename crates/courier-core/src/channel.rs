//! The broker boundary.
//!
//! Everything the RPC and dispatch layers need from a message broker is
//! expressed by [`Channel`]. Implementations must provide per-queue FIFO
//! delivery, at-least-once semantics until acknowledgment, and exclusive
//! broker-named temporary queues.

use crate::{AckToken, Delivery, Headers, QueueId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Consumer flow-control settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries held by this consumer. `0` = unlimited.
    pub prefetch: u16,
    /// Deliveries count as settled the moment they are handed out.
    pub auto_ack: bool,
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    /// Push everything, settle on hand-off.
    pub fn auto_ack() -> Self {
        ConsumeOptions {
            prefetch: 0,
            auto_ack: true,
            consumer_tag: None,
        }
    }

    /// Manual acknowledgment with a bounded number of in-flight deliveries.
    pub fn manual(prefetch: u16) -> Self {
        ConsumeOptions {
            prefetch,
            auto_ack: false,
            consumer_tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self::manual(1)
    }
}

/// Callback invoked for every delivery of a subscription.
///
/// The broker never runs two invocations for the same subscription at once.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// Broker operations used by this crate family.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a well-known queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<QueueId>;

    /// Declare an exclusive queue with a broker-generated name.
    ///
    /// The queue is removed when the first subscription on it is cancelled.
    async fn declare_temporary_queue(&self) -> Result<QueueId>;

    async fn delete_queue(&self, queue: &QueueId) -> Result<()>;

    async fn publish(&self, destination: &QueueId, headers: Headers, payload: Bytes) -> Result<()>;

    async fn consume(
        &self,
        queue: &QueueId,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription>;

    async fn ack(&self, token: AckToken) -> Result<()>;

    /// Reject a delivery. With `requeue` the message goes back to the head of
    /// its queue, otherwise it is discarded.
    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()>;
}

/// Handle to an active consumer.
///
/// Dropping the handle cancels the subscription; deliveries it still holds
/// unacknowledged are returned to the queue.
#[derive(Debug)]
pub struct Subscription {
    consumer_tag: String,
    queue: QueueId,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(consumer_tag: String, queue: QueueId, cancel: CancellationToken) -> Self {
        Subscription {
            consumer_tag,
            queue,
            cancel,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// A handle that fires when this subscription ends, for watchers that
    /// outlive the borrow of `self`.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
