pub mod broker;
pub mod config;
pub mod consumer_registry;
pub mod metrics;
pub mod queue;

pub use broker::MemoryBroker;
pub use config::BrokerConfig;
