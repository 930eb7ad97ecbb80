use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque token linking an RPC request to its reply.
///
/// Generated fresh per call. Only ever compared for equality, never ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(CorrelationId)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        CorrelationId(id)
    }
}

/// Name of a broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(name: impl Into<String>) -> Self {
        QueueId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueId {
    fn from(name: &str) -> Self {
        QueueId(name.to_string())
    }
}

impl From<String> for QueueId {
    fn from(name: String) -> Self {
        QueueId(name)
    }
}

/// Message properties carried alongside the payload.
///
/// RPC requests must carry both fields; replies echo only `correlation_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<QueueId>,
}

impl Headers {
    pub fn request(correlation_id: CorrelationId, reply_to: QueueId) -> Self {
        Headers {
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
        }
    }

    pub fn reply(correlation_id: CorrelationId) -> Self {
        Headers {
            correlation_id: Some(correlation_id),
            reply_to: None,
        }
    }
}

/// Broker-assigned delivery sequence number.
pub type DeliveryTag = u64;

/// Proof of delivery handed to manual-ack consumers.
///
/// Settling it (ack or nack) releases the consumer's prefetch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken {
    tag: DeliveryTag,
}

impl AckToken {
    pub fn new(tag: DeliveryTag) -> Self {
        AckToken { tag }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }
}

/// A message as handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub queue: QueueId,
    pub headers: Headers,
    pub payload: Bytes,
    /// Set when the message was previously delivered and never acknowledged.
    pub redelivered: bool,
    /// `None` when the subscription runs in auto-ack mode.
    pub ack: Option<AckToken>,
}
