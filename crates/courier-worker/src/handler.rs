use async_trait::async_trait;
use courier_core::TaskItem;
use std::time::Duration;

/// Result type for task handlers
pub type TaskResult = Result<Vec<u8>, String>;

/// Trait for task handlers
///
/// Tasks may be delivered more than once, so handlers should tolerate
/// repeated execution of the same item.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the given task
    async fn execute(&self, task: &TaskItem) -> TaskResult;
}

/// Example task handler that just echoes the payload
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &TaskItem) -> TaskResult {
        Ok(task.payload.clone())
    }
}

/// Example task handler that simulates work of a fixed cost
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        SleepHandler { duration }
    }

    pub fn from_millis(duration_ms: u64) -> Self {
        Self::new(Duration::from_millis(duration_ms))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, task: &TaskItem) -> TaskResult {
        tokio::time::sleep(self.duration).await;
        Ok(task.payload.clone())
    }
}
