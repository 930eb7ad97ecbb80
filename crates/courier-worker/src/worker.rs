use crate::executor::TaskExecutor;
use crate::handler::TaskHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{Channel, Delivery, DeliveryHandler, Subscription, TaskItem};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-worker bookkeeping, owned by the worker's loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub name: String,
    pub processed: u64,
    pub failed: u64,
    pub last_sequence: Option<u64>,
}

impl WorkerState {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerState {
            name: name.into(),
            processed: 0,
            failed: 0,
            last_sequence: None,
        }
    }

    /// Tasks this worker took off the queue, failed or not.
    pub fn completed(&self) -> u64 {
        self.processed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

/// Emitted once per task a worker finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub worker: String,
    /// `None` when the payload could not be decoded as a task.
    pub sequence: Option<u64>,
    pub outcome: Outcome,
    pub redelivered: bool,
    pub finished_at: DateTime<Utc>,
}

/// Hands broker deliveries to the worker loop.
pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Inbox {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Inbox { tx }, rx)
    }
}

#[async_trait]
impl DeliveryHandler for Inbox {
    async fn handle(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            debug!("Worker loop gone, delivery left to the broker");
        }
    }
}

/// One consumer of the dispatch queue.
pub(crate) struct Worker {
    state: WorkerState,
    channel: Arc<dyn Channel>,
    executor: TaskExecutor,
    completions: Option<mpsc::UnboundedSender<Completion>>,
}

impl Worker {
    pub(crate) fn new(
        name: String,
        channel: Arc<dyn Channel>,
        handler: Arc<dyn TaskHandler>,
        completions: Option<mpsc::UnboundedSender<Completion>>,
    ) -> Self {
        Worker {
            state: WorkerState::new(name),
            channel,
            executor: TaskExecutor::new(handler),
            completions,
        }
    }

    /// Process deliveries until `shutdown` fires. A task in progress is
    /// finished first. Dropping the subscription on the way out returns any
    /// unacknowledged tasks to the queue.
    pub(crate) async fn run(
        mut self,
        subscription: Subscription,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        shutdown: CancellationToken,
    ) -> WorkerState {
        info!(
            "Worker {} consuming from {}",
            self.state.name,
            subscription.queue()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = subscription.cancelled() => {
                    warn!("Worker {} lost its subscription", self.state.name);
                    break;
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => self.process(delivery).await,
                    None => break,
                },
            }
        }

        drop(subscription);
        info!(
            "Worker {} stopped after {} tasks ({} failed)",
            self.state.name,
            self.state.completed(),
            self.state.failed
        );
        self.state
    }

    async fn process(&mut self, delivery: Delivery) {
        let (sequence, outcome) = match TaskItem::from_bytes(&delivery.payload) {
            Ok(task) => {
                let outcome = match self.executor.execute(&task).await {
                    Ok(_) => Outcome::Succeeded,
                    Err(e) => {
                        warn!("Worker {} failed task {}: {}", self.state.name, task.sequence, e);
                        Outcome::Failed(e)
                    }
                };
                (Some(task.sequence), outcome)
            }
            Err(e) => {
                warn!("Worker {} dropping undecodable task: {}", self.state.name, e);
                (None, Outcome::Failed(e.to_string()))
            }
        };

        match outcome {
            Outcome::Succeeded => self.state.processed += 1,
            Outcome::Failed(_) => self.state.failed += 1,
        }
        if sequence.is_some() {
            self.state.last_sequence = sequence;
        }
        debug!(
            "Worker {} done with task {:?} [{}]",
            self.state.name,
            sequence,
            self.state.completed()
        );

        if let Some(completions) = &self.completions {
            let _ = completions.send(Completion {
                worker: self.state.name.clone(),
                sequence,
                outcome,
                redelivered: delivery.redelivered,
                finished_at: Utc::now(),
            });
        }

        // Failed tasks are acked too; requeueing them would loop forever.
        if let Some(token) = delivery.ack {
            if let Err(e) = self.channel.ack(token).await {
                error!("Worker {} failed to ack task {:?}: {}", self.state.name, sequence, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_counts() {
        let mut state = WorkerState::new("a");
        state.processed = 3;
        state.failed = 1;
        assert_eq!(state.completed(), 4);
        assert_eq!(state.last_sequence, None);
    }
}
