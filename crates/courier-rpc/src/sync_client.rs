use crate::{AsyncRpcClient, Result};
use bytes::Bytes;
use courier_core::{Channel, QueueId};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Blocking RPC client (wraps the async client)
///
/// `call` blocks the calling thread until the reply arrives or the timeout
/// elapses. Share it across threads by reference; concurrent calls each get
/// their own correlation id. Must not be created or dropped inside an async
/// context.
pub struct RpcClient {
    inner: AsyncRpcClient,
    runtime: tokio::runtime::Runtime,
}

impl RpcClient {
    pub fn new(channel: Arc<dyn Channel>, request_queue: impl Into<QueueId>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("courier-rpc-client")
            .enable_all()
            .build()?;

        Ok(RpcClient {
            inner: AsyncRpcClient::new(channel, request_queue),
            runtime,
        })
    }

    /// Send `payload` and block until the matching reply arrives.
    pub fn call(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        self.runtime.block_on(self.inner.call(payload, timeout))
    }

    pub fn call_json<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.runtime.block_on(self.inner.call_json(request, timeout))
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending_calls()
    }

    pub fn reply_queue(&self) -> Option<&QueueId> {
        self.inner.reply_queue()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.block_on(self.inner.close()) {
            warn!("Failed to close RPC client: {}", e);
        }
    }
}
