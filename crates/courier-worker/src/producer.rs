use crate::Result;
use bytes::Bytes;
use courier_core::{Channel, Headers, QueueId, TaskItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delay between consecutive publishes of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    #[default]
    Immediate,
    /// Same pause before every task.
    Fixed(Duration),
    /// Pause before task `i` is `i` times the step.
    Linear(Duration),
}

impl Pacing {
    fn delay(&self, index: u64) -> Duration {
        match self {
            Pacing::Immediate => Duration::ZERO,
            Pacing::Fixed(delay) => *delay,
            Pacing::Linear(step) => step.saturating_mul(index.min(u32::MAX as u64) as u32),
        }
    }
}

/// Publishes sequenced tasks to a dispatch queue.
#[derive(Clone)]
pub struct TaskProducer {
    channel: Arc<dyn Channel>,
    queue: QueueId,
    next_sequence: Arc<AtomicU64>,
}

impl TaskProducer {
    pub fn new(channel: Arc<dyn Channel>, queue: QueueId) -> Self {
        TaskProducer {
            channel,
            queue,
            next_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish one task, returning its sequence number.
    pub async fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let task = TaskItem::new(sequence, payload.into())?;
        self.channel
            .publish(&self.queue, Headers::default(), Bytes::from(task.to_bytes()?))
            .await?;
        debug!("Published task {} to {}", sequence, self.queue);
        Ok(sequence)
    }

    /// Publish `count` tasks, building each payload from its batch index.
    pub async fn publish_batch<F>(&self, count: u64, mut make_payload: F, pacing: Pacing) -> Result<Vec<u64>>
    where
        F: FnMut(u64) -> Vec<u8>,
    {
        let mut sequences = Vec::with_capacity(count as usize);
        for index in 0..count {
            let delay = pacing.delay(index);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            sequences.push(self.publish(make_payload(index)).await?);
        }
        Ok(sequences)
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }
}
