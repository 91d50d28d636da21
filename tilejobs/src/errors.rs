use std::{io, result};
use thiserror::Error;

/// Batch-level failures. A single job failing is an [`Outcome`](crate::Outcome), not an error.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("malformed job input {source_name}: {reason}")]
    MalformedInput { source_name: String, reason: String },
    #[error("could not allocate an execution context: {0}")]
    Scheduling(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no worker registered as {0:?}")]
    UnknownWorker(String),
    #[error("bad parameters for worker {worker:?}: {reason}")]
    WorkerParams { worker: String, reason: String },
    #[error("worker host: {0}")]
    Host(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    pub(crate) fn malformed(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedInput {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = result::Result<T, DispatchError>;
