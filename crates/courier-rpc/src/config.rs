use crate::HandlerFailurePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    pub request_queue: String,
    /// Independent consumers on the request queue, each with prefetch 1.
    pub concurrency: usize,
    pub failure_policy: HandlerFailurePolicy,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        RpcServerConfig {
            request_queue: "rpc_queue".to_string(),
            concurrency: 1,
            failure_policy: HandlerFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    pub request_queue: String,
    pub default_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        RpcClientConfig {
            request_queue: "rpc_queue".to_string(),
            default_timeout_ms: 5000,
        }
    }
}

impl RpcClientConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
