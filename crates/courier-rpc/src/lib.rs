mod async_client;
mod config;
mod handler;
mod registry;
mod server;
mod sync_client;

pub use async_client::AsyncRpcClient;
pub use config::{RpcClientConfig, RpcServerConfig};
pub use handler::{handler_fn, FibonacciService, HandlerFn, RequestHandler};
pub use registry::{CorrelationRegistry, PendingCall, Resolution};
pub use server::{HandlerFailurePolicy, RpcServer};
pub use sync_client::RpcClient;

use courier_core::{CodecError, CorrelationId, TransportError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelation(CorrelationId),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Codec(CodecError::Json(e))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Failure raised by a [`RequestHandler`] while computing a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Handler failed: {0}")]
    Failed(String),
}
