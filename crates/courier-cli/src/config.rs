use courier_broker::BrokerConfig;
use courier_rpc::{RpcClientConfig, RpcServerConfig};
use courier_worker::DispatcherConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file of the `courier` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub broker: BrokerConfig,
    pub rpc_server: RpcServerConfig,
    pub rpc_client: RpcClientConfig,
    pub dispatch: DispatcherConfig,
}

impl CourierConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: CourierConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
