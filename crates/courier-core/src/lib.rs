mod channel;
mod error;
mod message;
mod task;

pub use channel::{Channel, ConsumeOptions, DeliveryHandler, Subscription};
pub use error::{CodecError, Result, TransportError};
pub use message::{AckToken, CorrelationId, Delivery, DeliveryTag, Headers, QueueId};
pub use task::TaskItem;

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
