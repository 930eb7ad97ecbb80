pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod handler;
pub mod policy;
pub mod producer;
pub mod worker;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use handler::{EchoHandler, SleepHandler, TaskHandler, TaskResult};
pub use policy::DispatchPolicy;
pub use producer::{Pacing, TaskProducer};
pub use worker::{Completion, Outcome, WorkerState};

use courier_core::{CodecError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Worker {0} is already running")]
    DuplicateWorker(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker {0} ended abnormally")]
    WorkerAborted(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
