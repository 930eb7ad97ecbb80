use crate::{RequestHandler, Result, RpcServerConfig};
use async_trait::async_trait;
use courier_core::{AckToken, Channel, ConsumeOptions, Delivery, DeliveryHandler, Headers, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the server does with a request whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerFailurePolicy {
    /// Acknowledge and send no reply; the caller times out.
    #[default]
    AckAndDrop,
    /// Return the request to the queue for another attempt.
    Requeue,
}

/// Serves requests from a well-known queue, one at a time per consumer.
pub struct RpcServer {
    channel: Arc<dyn Channel>,
    config: RpcServerConfig,
    handler: Arc<dyn RequestHandler>,
}

impl RpcServer {
    pub fn new(
        channel: Arc<dyn Channel>,
        config: RpcServerConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        RpcServer {
            channel,
            config,
            handler,
        }
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }

    /// Consume requests until `shutdown` fires or the broker closes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = self.channel.declare_queue(&self.config.request_queue).await?;
        let responder = Arc::new(Responder {
            channel: self.channel.clone(),
            handler: self.handler.clone(),
            failure_policy: self.config.failure_policy,
        });

        let mut subscriptions = Vec::new();
        for _ in 0..self.config.concurrency.max(1) {
            let subscription = self
                .channel
                .consume(&queue, ConsumeOptions::manual(1), responder.clone())
                .await?;
            subscriptions.push(subscription);
        }

        info!(
            "RPC server awaiting requests on {} ({} consumers)",
            queue,
            subscriptions.len()
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("RPC server on {} shutting down", queue);
            }
            _ = subscriptions[0].cancelled() => {
                warn!("RPC server subscription on {} cancelled by the broker", queue);
            }
        }

        for subscription in &subscriptions {
            subscription.cancel();
        }
        Ok(())
    }
}

/// Turns one request delivery into one reply.
struct Responder {
    channel: Arc<dyn Channel>,
    handler: Arc<dyn RequestHandler>,
    failure_policy: HandlerFailurePolicy,
}

impl Responder {
    async fn ack(&self, token: AckToken) {
        if let Err(e) = self.channel.ack(token).await {
            error!("Failed to ack request {}: {}", token.tag(), e);
        }
    }

    async fn requeue(&self, token: AckToken) {
        if let Err(e) = self.channel.nack(token, true).await {
            error!("Failed to requeue request {}: {}", token.tag(), e);
        }
    }
}

#[async_trait]
impl DeliveryHandler for Responder {
    async fn handle(&self, delivery: Delivery) {
        let Some(token) = delivery.ack else {
            warn!("Request {} delivered without an ack token", delivery.delivery_tag);
            return;
        };

        let (Some(correlation_id), Some(reply_to)) =
            (delivery.headers.correlation_id, delivery.headers.reply_to)
        else {
            warn!(
                "Dropping request {} without correlation id or reply destination",
                delivery.delivery_tag
            );
            self.ack(token).await;
            return;
        };

        debug!(correlation_id = %correlation_id, redelivered = delivery.redelivered, "Handling request");

        let body = match self.handler.handle(delivery.payload).await {
            Ok(body) => body,
            Err(e) => {
                warn!(correlation_id = %correlation_id, "Request handler failed: {}", e);
                match self.failure_policy {
                    HandlerFailurePolicy::AckAndDrop => self.ack(token).await,
                    HandlerFailurePolicy::Requeue => self.requeue(token).await,
                }
                return;
            }
        };

        match self
            .channel
            .publish(&reply_to, Headers::reply(correlation_id), body)
            .await
        {
            Ok(()) => self.ack(token).await,
            Err(TransportError::QueueNotFound(_)) => {
                debug!(correlation_id = %correlation_id, "Reply destination {} is gone", reply_to);
                self.ack(token).await;
            }
            Err(e @ TransportError::QueueFull { .. }) => {
                // Full reply queues are not retried.
                warn!(correlation_id = %correlation_id, "Dropping reply: {}", e);
                self.ack(token).await;
            }
            Err(e) => {
                error!(correlation_id = %correlation_id, "Failed to publish reply: {}", e);
                self.requeue(token).await;
            }
        }
    }
}
