use crate::worker::{Completion, Inbox, Worker, WorkerState};
use crate::{DispatchError, DispatcherConfig, Result, TaskHandler, TaskProducer};
use courier_core::{Channel, QueueId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct WorkerHandle {
    name: String,
    shutdown: CancellationToken,
    handle: JoinHandle<WorkerState>,
}

/// Final per-worker tallies returned by [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub workers: Vec<WorkerState>,
}

impl DispatchReport {
    pub fn get(&self, name: &str) -> Option<&WorkerState> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Tasks completed across the pool.
    pub fn total_completed(&self) -> u64 {
        self.workers.iter().map(WorkerState::completed).sum()
    }

    /// Fraction of all completed tasks that `name` handled.
    pub fn share(&self, name: &str) -> f64 {
        let total = self.total_completed();
        match self.get(name) {
            Some(worker) if total > 0 => worker.completed() as f64 / total as f64,
            _ => 0.0,
        }
    }
}

/// Runs a pool of workers on one queue under one [`DispatchPolicy`](crate::DispatchPolicy).
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    config: DispatcherConfig,
    queue: QueueId,
    workers: Mutex<Vec<WorkerHandle>>,
    completions: Option<mpsc::UnboundedSender<Completion>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Declare the dispatch queue and return an empty pool.
    pub async fn new(channel: Arc<dyn Channel>, config: DispatcherConfig) -> Result<Self> {
        let queue = channel.declare_queue(&config.queue).await?;
        info!("Dispatching from {} using {}", queue, config.policy);

        Ok(Dispatcher {
            channel,
            config,
            queue,
            workers: Mutex::new(Vec::new()),
            completions: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Report every finished task on the returned channel. Applies to workers
    /// spawned afterwards.
    pub fn completions(&mut self) -> mpsc::UnboundedReceiver<Completion> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.completions = Some(tx);
        rx
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Producer publishing to this dispatcher's queue.
    pub fn producer(&self) -> TaskProducer {
        TaskProducer::new(self.channel.clone(), self.queue.clone())
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.lock().iter().map(|w| w.name.clone()).collect()
    }

    /// Subscribe a new worker named `name`. The name doubles as its consumer tag.
    pub async fn spawn_worker(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.workers.lock().iter().any(|w| w.name == name) {
            return Err(DispatchError::DuplicateWorker(name));
        }

        let (inbox, deliveries) = Inbox::new();
        let options = self.config.policy.consume_options().with_tag(name.clone());
        let subscription = self
            .channel
            .consume(&self.queue, options, Arc::new(inbox))
            .await?;

        let worker = Worker::new(
            name.clone(),
            self.channel.clone(),
            handler,
            self.completions.clone(),
        );
        let shutdown = self.shutdown.child_token();
        let handle = tokio::spawn(worker.run(subscription, deliveries, shutdown.clone()));

        self.workers.lock().push(WorkerHandle {
            name,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Stop one worker after its current task.
    pub async fn stop_worker(&self, name: &str) -> Result<WorkerState> {
        let worker = self.take_worker(name)?;
        worker.shutdown.cancel();
        worker
            .handle
            .await
            .map_err(|_| DispatchError::WorkerAborted(worker.name))
    }

    /// Abort one worker mid-task, as if its process had died. Unacknowledged
    /// tasks it held go back to the queue.
    pub fn kill_worker(&self, name: &str) -> Result<()> {
        let worker = self.take_worker(name)?;
        warn!("Killing worker {}", worker.name);
        worker.handle.abort();
        Ok(())
    }

    /// Stop every worker and collect their final state.
    ///
    /// Workers finish their current task first; any still busy after the
    /// configured grace period are aborted and left out of the report.
    pub async fn shutdown(self) -> DispatchReport {
        info!("Shutting down dispatcher on {}", self.queue);
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout();
        let mut report = DispatchReport::default();

        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(state)) => report.workers.push(state),
                Ok(Err(e)) => warn!("Worker {} ended abnormally: {}", worker.name, e),
                Err(_) => {
                    warn!("Shutdown deadline exceeded, aborting worker {}", worker.name);
                    worker.handle.abort();
                }
            }
        }

        report
    }

    fn take_worker(&self, name: &str) -> Result<WorkerHandle> {
        let mut workers = self.workers.lock();
        let index = workers
            .iter()
            .position(|w| w.name == name)
            .ok_or_else(|| DispatchError::UnknownWorker(name.to_string()))?;
        Ok(workers.remove(index))
    }
}
