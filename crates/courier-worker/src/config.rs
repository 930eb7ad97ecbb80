use crate::DispatchPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue: String,
    pub policy: DispatchPolicy,
    /// How long `shutdown` waits for in-flight tasks before aborting workers.
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue: "task_queue".to_string(),
            policy: DispatchPolicy::default(),
            graceful_shutdown_timeout_secs: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: DispatcherConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}
