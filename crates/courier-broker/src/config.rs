use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Reject publishes once a queue holds this many ready messages. `0` disables the check.
    pub max_queue_depth: usize,
    /// Prefix of broker-generated temporary queue names.
    pub temp_queue_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            max_queue_depth: 100000,
            temp_queue_prefix: "amq.gen-".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
