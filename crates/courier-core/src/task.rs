use crate::{CodecError, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work published to a dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Producer-assigned position in the stream.
    pub sequence: u64,

    /// Application payload (max 10MB)
    pub payload: Vec<u8>,

    /// When the producer created the item
    pub published_at: DateTime<Utc>,
}

impl TaskItem {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }

        Ok(TaskItem {
            sequence,
            payload,
            published_at: Utc::now(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::from)
    }
}
