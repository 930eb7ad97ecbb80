use crate::QueueId;
use thiserror::Error;

/// Failures reported by a broker channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Queue not found: {0}")]
    QueueNotFound(QueueId),

    #[error("Queue {queue} is full ({depth} messages)")]
    QueueFull { queue: QueueId, depth: usize },

    #[error("Queue {0} is exclusive to another consumer")]
    ExclusiveQueue(QueueId),

    #[error("Consumer tag already in use: {0}")]
    ConsumerTagInUse(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
