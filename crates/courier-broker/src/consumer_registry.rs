use courier_core::{Delivery, DeliveryTag, QueueId};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Information about an attached consumer
#[derive(Debug)]
pub struct ConsumerInfo {
    pub consumer_tag: String,
    pub queue: QueueId,
    pub prefetch: u16,
    pub auto_ack: bool,
    pub delivered: u64,
    /// Deliveries handed out and not yet settled, oldest first.
    pub unacked: BTreeSet<DeliveryTag>,
    sender: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
}

impl ConsumerInfo {
    pub fn new(
        consumer_tag: String,
        queue: QueueId,
        prefetch: u16,
        auto_ack: bool,
        sender: mpsc::UnboundedSender<Delivery>,
        cancel: CancellationToken,
    ) -> Self {
        ConsumerInfo {
            consumer_tag,
            queue,
            prefetch,
            auto_ack,
            delivered: 0,
            unacked: BTreeSet::new(),
            sender,
            cancel,
        }
    }

    /// Whether the prefetch window allows another delivery.
    pub fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }

    /// Hand a delivery to the consumer's task. Gives the delivery back if the
    /// task is gone.
    pub fn send(&mut self, delivery: Delivery) -> Result<(), Delivery> {
        let tag = delivery.delivery_tag;
        let tracked = delivery.ack.is_some();
        self.sender.send(delivery).map_err(|e| e.0)?;
        if tracked {
            self.unacked.insert(tag);
        }
        self.delivered += 1;
        Ok(())
    }

    pub fn settle(&mut self, tag: DeliveryTag) -> bool {
        self.unacked.remove(&tag)
    }

    /// Ask the consumer's task to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Registry of all attached consumers, keyed by consumer tag
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, ConsumerInfo>,
    next_id: u64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker-generated tag for consumers that did not name themselves.
    pub fn generate_tag(&mut self) -> String {
        loop {
            self.next_id += 1;
            let tag = format!("ctag-{}", self.next_id);
            if !self.consumers.contains_key(&tag) {
                return tag;
            }
        }
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.consumers.contains_key(consumer_tag)
    }

    pub fn register(&mut self, info: ConsumerInfo) {
        self.consumers.insert(info.consumer_tag.clone(), info);
    }

    pub fn deregister(&mut self, consumer_tag: &str) -> Option<ConsumerInfo> {
        self.consumers.remove(consumer_tag)
    }

    pub fn get_mut(&mut self, consumer_tag: &str) -> Option<&mut ConsumerInfo> {
        self.consumers.get_mut(consumer_tag)
    }

    pub fn has_capacity(&self, consumer_tag: &str) -> bool {
        self.consumers
            .get(consumer_tag)
            .map(ConsumerInfo::has_capacity)
            .unwrap_or(false)
    }

    /// Unsettled deliveries across every consumer of `queue`.
    pub fn unacked_on(&self, queue: &QueueId) -> usize {
        self.consumers
            .values()
            .filter(|c| &c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Every consumer attached to `queue`.
    pub fn on_queue(&self, queue: &QueueId) -> Vec<&ConsumerInfo> {
        self.consumers.values().filter(|c| &c.queue == queue).collect()
    }

    pub fn count(&self) -> usize {
        self.consumers.len()
    }
}
