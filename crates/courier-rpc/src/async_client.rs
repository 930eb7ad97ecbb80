use crate::{CorrelationRegistry, Result};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    Channel, ConsumeOptions, CorrelationId, Delivery, DeliveryHandler, Headers, QueueId,
    Subscription, TransportError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Async RPC client over a broker channel.
///
/// Every call from one client shares a single temporary reply queue, set up
/// on the first call. Calls may run concurrently.
pub struct AsyncRpcClient {
    channel: Arc<dyn Channel>,
    request_queue: QueueId,
    registry: CorrelationRegistry,
    reply: OnceCell<ReplyQueue>,
}

struct ReplyQueue {
    queue: QueueId,
    subscription: Subscription,
}

impl AsyncRpcClient {
    pub fn new(channel: Arc<dyn Channel>, request_queue: impl Into<QueueId>) -> Self {
        AsyncRpcClient {
            channel,
            request_queue: request_queue.into(),
            registry: CorrelationRegistry::new(),
            reply: OnceCell::new(),
        }
    }

    /// Send `payload` and wait for the matching reply.
    pub async fn call(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        let reply_to = self.ensure_reply_queue().await?.clone();
        let correlation_id = CorrelationId::new();
        let pending = self.registry.register(correlation_id)?;
        if self.reply_lost() {
            return Err(TransportError::Closed.into());
        }

        self.channel
            .publish(
                &self.request_queue,
                Headers::request(correlation_id, reply_to),
                payload.into(),
            )
            .await?;
        debug!(correlation_id = %correlation_id, "Request sent to {}", self.request_queue);

        pending.wait(timeout).await
    }

    /// JSON-encoded variant of [`call`](Self::call).
    pub async fn call_json<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.call(payload, timeout).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Calls waiting for a reply right now.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn request_queue(&self) -> &QueueId {
        &self.request_queue
    }

    /// The reply queue, once the first call has created it.
    pub fn reply_queue(&self) -> Option<&QueueId> {
        self.reply.get().map(|reply| &reply.queue)
    }

    /// Tear down the reply queue. Outstanding calls fail; later calls fail
    /// with a transport error.
    pub async fn close(&self) -> Result<()> {
        self.registry.cancel_all();
        let Some(reply) = self.reply.get() else {
            return Ok(());
        };

        reply.subscription.cancel();
        match self.channel.delete_queue(&reply.queue).await {
            Ok(()) | Err(TransportError::QueueNotFound(_)) | Err(TransportError::Closed) => {
                info!("Closed reply queue {}", reply.queue);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_reply_queue(&self) -> Result<&QueueId> {
        let reply = self
            .reply
            .get_or_try_init(|| async {
                let queue = self.channel.declare_temporary_queue().await?;
                let listener = Arc::new(ReplyListener {
                    registry: self.registry.clone(),
                });
                let subscription = match self
                    .channel
                    .consume(&queue, ConsumeOptions::auto_ack(), listener)
                    .await
                {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        // The queue has no owner yet.
                        if let Err(cleanup) = self.channel.delete_queue(&queue).await {
                            warn!("Failed to remove reply queue {}: {}", queue, cleanup);
                        }
                        return Err(e);
                    }
                };
                debug!("Listening for replies on {}", queue);

                let ended = subscription.token();
                let registry = self.registry.clone();
                let watched = queue.clone();
                tokio::spawn(async move {
                    ended.cancelled().await;
                    if !registry.is_empty() {
                        warn!(
                            "Reply subscription on {} ended, failing {} pending calls",
                            watched,
                            registry.len()
                        );
                    }
                    registry.cancel_all();
                });
                Ok::<_, TransportError>(ReplyQueue {
                    queue,
                    subscription,
                })
            })
            .await?;

        if reply.subscription.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        Ok(&reply.queue)
    }

    fn reply_lost(&self) -> bool {
        self.reply
            .get()
            .is_some_and(|reply| reply.subscription.is_cancelled())
    }
}

/// Routes replies into the registry by correlation id.
struct ReplyListener {
    registry: CorrelationRegistry,
}

#[async_trait]
impl DeliveryHandler for ReplyListener {
    async fn handle(&self, delivery: Delivery) {
        match delivery.headers.correlation_id {
            Some(id) => {
                self.registry.resolve(id, delivery.payload);
            }
            None => debug!("Dropping reply without correlation id"),
        }
    }
}
