//! Error taxonomy for lifecycle and tool-invocation operations

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Every failure a caller of the controller or invoker can observe.
///
/// All variants are recoverable by the caller; none of them is fatal to the
/// control process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker '{0}' is not configured")]
    NotConfigured(String),

    #[error("worker '{0}' is already running")]
    AlreadyRunning(String),

    #[error("worker '{0}' is not running")]
    NotRunning(String),

    #[error("worker '{0}' is being stopped")]
    Stopping(String),

    #[error("failed to start worker '{worker}' ({command}): {source}")]
    StartFailed {
        worker: String,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal worker '{worker}': {source}")]
    StopFailed {
        worker: String,
        #[source]
        source: io::Error,
    },

    #[error("no active worker; switch to a worker first")]
    NoActiveWorker,

    #[error("active worker '{0}' has exited")]
    WorkerNotRunning(String),

    #[error("worker '{0}' closed its channel before answering")]
    WorkerDisconnected(String),

    #[error("worker '{worker}' did not answer '{method}' within {timeout:?}")]
    InvocationTimeout {
        worker: String,
        method: String,
        timeout: Duration,
    },

    #[error("worker '{0}' is busy with another call")]
    WorkerBusy(String),

    #[error("malformed response from worker '{worker}': {reason}")]
    MalformedResponse { worker: String, reason: String },

    #[error("worker returned an error: {message}")]
    Remote { message: String },

    #[error("could not connect to worker '{worker}' at {address}: {source}")]
    ConnectFailed {
        worker: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
