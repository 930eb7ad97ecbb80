use crate::handler::{TaskHandler, TaskResult};
use courier_core::TaskItem;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Runs a handler, turning panics into task failures
pub struct TaskExecutor {
    handler: Arc<dyn TaskHandler>,
}

impl TaskExecutor {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        TaskExecutor { handler }
    }

    /// Execute a task with panic recovery
    pub async fn execute(&self, task: &TaskItem) -> TaskResult {
        debug!("Executing task {}", task.sequence);

        match AssertUnwindSafe(self.handler.execute(task)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("Task {} panicked", task.sequence);
                Err("Task panicked during execution".to_string())
            }
        }
    }
}
