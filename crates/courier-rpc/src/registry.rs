use crate::{Result, RpcError};
use bytes::Bytes;
use courier_core::{CorrelationId, TransportError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of handing a reply to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply filled a pending call's slot.
    Delivered,
    /// Nobody was waiting: late, duplicate or misrouted reply.
    Orphaned,
}

/// Rendezvous between reply deliveries and waiting callers.
///
/// Each pending call owns a one-shot slot keyed by its correlation id. The
/// map is sharded, so resolving one id never contends with unrelated calls.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<DashMap<CorrelationId, oneshot::Sender<Bytes>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty result slot for `id`.
    pub fn register(&self, id: CorrelationId) -> Result<PendingCall> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCorrelation(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(PendingCall {
                    id,
                    rx,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Fill the slot of `id`. The first reply wins; anything after it, or a
    /// reply for an id nobody registered, is dropped.
    pub fn resolve(&self, id: CorrelationId, body: Bytes) -> Resolution {
        let Some((_, tx)) = self.pending.remove(&id) else {
            debug!(correlation_id = %id, "Dropping reply with no pending call");
            return Resolution::Orphaned;
        };

        match tx.send(body) {
            Ok(()) => Resolution::Delivered,
            Err(_) => {
                debug!(correlation_id = %id, "Caller went away before the reply arrived");
                Resolution::Orphaned
            }
        }
    }

    /// Abandon a pending call. Its waiter fails with a transport error.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Abandon every pending call.
    pub fn cancel_all(&self) {
        self.pending.clear();
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A registered call waiting for its reply.
///
/// Dropping it, waited on or not, removes the registry entry.
pub struct PendingCall {
    id: CorrelationId,
    rx: oneshot::Receiver<Bytes>,
    registry: CorrelationRegistry,
}

impl PendingCall {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the reply or until `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(RpcError::Transport(TransportError::Closed)),
            Err(_) => {
                if self.registry.cancel(&self.id) {
                    debug!(correlation_id = %self.id, "Call timed out after {:?}", timeout);
                    return Err(RpcError::Timeout(timeout));
                }
                // A resolver took the entry first and is handing over the body.
                (&mut self.rx)
                    .await
                    .map_err(|_| RpcError::Timeout(timeout))
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.registry.cancel(&self.id);
    }
}
