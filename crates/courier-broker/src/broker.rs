use crate::{
    config::BrokerConfig,
    consumer_registry::{ConsumerInfo, ConsumerRegistry},
    metrics::BrokerMetrics,
    queue::{MessageQueue, QueuedMessage},
};
use courier_core::{
    AckToken, Channel, ConsumeOptions, Delivery, DeliveryHandler, DeliveryTag, Headers, QueueId,
    Result, Subscription, TransportError,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A delivery that is out with a manual-ack consumer.
struct Unacked {
    consumer_tag: String,
    queue: QueueId,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueId, MessageQueue>,
    consumers: ConsumerRegistry,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: DeliveryTag,
}

impl BrokerState {
    fn take_unacked(&mut self, token: AckToken) -> Result<Unacked> {
        let tag = token.tag();
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag(tag))?;
        if let Some(consumer) = self.consumers.get_mut(&entry.consumer_tag) {
            consumer.settle(tag);
        }
        Ok(entry)
    }
}

/// In-process broker implementing [`Channel`].
///
/// Queued messages are pushed to consumers in round-robin order; a consumer
/// whose unacknowledged count has reached its prefetch limit is skipped until
/// it settles a delivery. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    metrics: BrokerMetrics,
    shutdown: CancellationToken,
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig) -> prometheus::Result<Self> {
        Ok(MemoryBroker {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BrokerState::default()),
                metrics: BrokerMetrics::new()?,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Get metrics registry
    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn queue_exists(&self, queue: &QueueId) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &QueueId) -> Option<usize> {
        self.inner.state.lock().queues.get(queue).map(MessageQueue::len)
    }

    /// Deliveries of `queue` currently held unacknowledged by consumers.
    pub fn unacked_count(&self, queue: &QueueId) -> usize {
        self.inner.state.lock().consumers.unacked_on(queue)
    }

    pub fn consumer_count(&self, queue: &QueueId) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(MessageQueue::consumer_count)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Shut the broker down. Every subscription is cancelled and further
    /// operations fail with [`TransportError::Closed`].
    pub fn close(&self) {
        info!("Shutting down broker");
        self.inner.shutdown.cancel();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Delivery loop of one subscription. Runs the handler for one delivery at
    /// a time; cancellation abandons the delivery in progress.
    async fn run_consumer(
        &self,
        consumer_tag: String,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = handler.handle(delivery) => {}
            }
        }

        self.remove_consumer(&consumer_tag);
    }

    /// Detach a consumer and return everything it still holds to the queue.
    fn remove_consumer(&self, consumer_tag: &str) {
        let mut state = self.inner.state.lock();
        let Some(info) = state.consumers.deregister(consumer_tag) else {
            return;
        };
        self.inner.metrics.consumers_connected.dec();

        let queue_id = info.queue.clone();
        let mut requeued = 0;
        // Newest first so the oldest ends up at the head.
        for tag in info.unacked.iter().rev() {
            let Some(entry) = state.unacked.remove(tag) else {
                continue;
            };
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                queue.requeue(entry.message);
                self.inner.metrics.inc_messages("requeued", queue_id.as_str());
                requeued += 1;
            }
        }
        if requeued > 0 {
            warn!(
                "Consumer {} left with {} unacknowledged deliveries, requeued",
                consumer_tag, requeued
            );
        }

        let owned_exclusive = match state.queues.get_mut(&queue_id) {
            Some(queue) => {
                queue.detach(consumer_tag);
                queue.is_exclusive() && queue.owner() == Some(consumer_tag)
            }
            None => false,
        };

        if owned_exclusive {
            state.queues.remove(&queue_id);
            self.inner.metrics.remove_queue(queue_id.as_str());
            debug!("Deleted temporary queue {}", queue_id);
        } else {
            self.dispatch(&mut state, &queue_id);
        }

        debug!("Consumer {} detached from {}", consumer_tag, queue_id);
    }

    /// Hand ready messages of `queue_id` to consumers with free prefetch slots.
    fn dispatch(&self, state: &mut BrokerState, queue_id: &QueueId) {
        let BrokerState {
            queues,
            consumers,
            unacked,
            next_tag,
        } = state;

        let Some(queue) = queues.get_mut(queue_id) else {
            return;
        };

        while !queue.is_empty() {
            let Some(consumer_tag) = queue.next_consumer(|tag| consumers.has_capacity(tag)) else {
                break;
            };
            let Some(message) = queue.pop() else {
                break;
            };
            let Some(consumer) = consumers.get_mut(&consumer_tag) else {
                queue.restore(message);
                queue.detach(&consumer_tag);
                continue;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                queue: queue_id.clone(),
                headers: message.headers.clone(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
                ack: (!consumer.auto_ack).then(|| AckToken::new(tag)),
            };
            let manual = delivery.ack.is_some();

            match consumer.send(delivery) {
                Ok(()) => {
                    if manual {
                        unacked.insert(
                            tag,
                            Unacked {
                                consumer_tag,
                                queue: queue_id.clone(),
                                message,
                            },
                        );
                    }
                    self.inner.metrics.inc_messages("delivered", queue_id.as_str());
                }
                Err(_) => {
                    // Consumer task already gone; its own cleanup will follow.
                    queue.restore(message);
                    queue.detach(&consumer_tag);
                }
            }
        }

        self.inner.metrics.set_queue_depth(queue_id.as_str(), queue.len());
    }
}

#[async_trait]
impl Channel for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<QueueId> {
        self.ensure_open()?;
        let queue_id = QueueId::from(name);
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(&queue_id) {
            state
                .queues
                .insert(queue_id.clone(), MessageQueue::new(queue_id.clone()));
            info!("Declared queue {}", queue_id);
        }
        Ok(queue_id)
    }

    async fn declare_temporary_queue(&self) -> Result<QueueId> {
        self.ensure_open()?;
        let queue_id = QueueId::new(format!(
            "{}{}",
            self.inner.config.temp_queue_prefix,
            Uuid::new_v4().simple()
        ));
        self.inner
            .state
            .lock()
            .queues
            .insert(queue_id.clone(), MessageQueue::exclusive(queue_id.clone()));
        debug!("Declared temporary queue {}", queue_id);
        Ok(queue_id)
    }

    async fn delete_queue(&self, queue: &QueueId) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let mut removed = state
            .queues
            .remove(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.clone()))?;

        let tags: Vec<String> = state
            .consumers
            .on_queue(queue)
            .into_iter()
            .map(|c| c.consumer_tag.clone())
            .collect();
        for tag in tags {
            if let Some(consumer) = state.consumers.deregister(&tag) {
                consumer.cancel();
                self.inner.metrics.consumers_connected.dec();
            }
        }
        let before = state.unacked.len();
        state.unacked.retain(|_, entry| &entry.queue != queue);
        let dropped = removed.purge() + (before - state.unacked.len());
        self.inner.metrics.remove_queue(queue.as_str());

        info!("Deleted queue {} ({} messages dropped)", queue, dropped);
        Ok(())
    }

    async fn publish(&self, destination: &QueueId, headers: Headers, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let queue = state
            .queues
            .get_mut(destination)
            .ok_or_else(|| TransportError::QueueNotFound(destination.clone()))?;

        let max_depth = self.inner.config.max_queue_depth;
        if max_depth > 0 && queue.len() >= max_depth {
            warn!("Queue depth threshold exceeded on {}, rejecting message", destination);
            return Err(TransportError::QueueFull {
                queue: destination.clone(),
                depth: queue.len(),
            });
        }

        queue.push(QueuedMessage::new(headers, payload));
        self.inner.metrics.inc_messages("published", destination.as_str());
        self.dispatch(&mut state, destination);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueId,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        let cancel = self.inner.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let consumer_tag = {
            let mut state = self.inner.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(TransportError::QueueNotFound(queue.clone()));
            }

            let consumer_tag = match options.consumer_tag {
                Some(tag) if state.consumers.contains(&tag) => {
                    return Err(TransportError::ConsumerTagInUse(tag));
                }
                Some(tag) => tag,
                None => state.consumers.generate_tag(),
            };

            let attached = state
                .queues
                .get_mut(queue)
                .map(|q| q.attach(&consumer_tag))
                .unwrap_or(false);
            if !attached {
                return Err(TransportError::ExclusiveQueue(queue.clone()));
            }

            state.consumers.register(ConsumerInfo::new(
                consumer_tag.clone(),
                queue.clone(),
                options.prefetch,
                options.auto_ack,
                tx,
                cancel.clone(),
            ));
            self.inner.metrics.consumers_connected.inc();
            debug!(
                "Consumer {} attached to {} (prefetch: {}, auto_ack: {})",
                consumer_tag, queue, options.prefetch, options.auto_ack
            );

            self.dispatch(&mut state, queue);
            consumer_tag
        };

        let broker = self.clone();
        let task_tag = consumer_tag.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            broker.run_consumer(task_tag, rx, handler, task_cancel).await;
        });

        Ok(Subscription::new(consumer_tag, queue.clone(), cancel))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let entry = state.take_unacked(token)?;
        self.inner.metrics.inc_messages("acked", entry.queue.as_str());
        self.dispatch(&mut state, &entry.queue);
        Ok(())
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let entry = state.take_unacked(token)?;
        let queue_id = entry.queue.clone();

        match state.queues.get_mut(&queue_id) {
            Some(queue) if requeue => {
                queue.requeue(entry.message);
                self.inner.metrics.inc_messages("requeued", queue_id.as_str());
            }
            _ => {
                self.inner.metrics.inc_messages("dropped", queue_id.as_str());
            }
        }

        self.dispatch(&mut state, &queue_id);
        Ok(())
    }
}
