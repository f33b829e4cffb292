//! Tool invoker - relays tool calls to whichever worker is active

use crate::error::{WorkerError, WorkerResult};
use crate::process::ActiveWorker;
use crate::protocol::{Capabilities, Request, RequestId};
use crate::transport::WorkerChannel;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Relays requests to the active worker.
///
/// The invoker never retries: tool calls may not be idempotent, so retry
/// policy belongs to the caller.
#[derive(Clone)]
pub struct ToolInvoker {
    source: Arc<dyn ActiveWorker>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(source: Arc<dyn ActiveWorker>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `tool` on the active worker and return its result payload
    /// untouched
    pub async fn invoke(&self, tool: &str, arguments: Map<String, Value>) -> WorkerResult<Value> {
        self.send(Request::tool_call(RequestId::generate(), tool, arguments))
            .await
    }

    /// Ask the active worker what it offers
    pub async fn initialize(&self) -> WorkerResult<Capabilities> {
        let channel = self.source.active_channel()?;
        let result = self
            .exchange(&channel, Request::initialize(RequestId::generate()))
            .await?;
        serde_json::from_value(result).map_err(|e| WorkerError::MalformedResponse {
            worker: channel.worker().to_string(),
            reason: format!("invalid capability descriptor: {e}"),
        })
    }

    /// Read a resource exposed by the active worker
    pub async fn read_resource(&self, uri: &str) -> WorkerResult<Value> {
        self.send(Request::read_resource(RequestId::generate(), uri))
            .await
    }

    /// Relay an arbitrary method
    pub async fn call(&self, method: &str, params: Option<Value>) -> WorkerResult<Value> {
        self.send(Request::new(RequestId::generate(), method, params))
            .await
    }

    async fn send(&self, request: Request) -> WorkerResult<Value> {
        // Only the snapshot touches controller state; the exchange runs
        // outside any lifecycle lock.
        let channel = self.source.active_channel()?;
        self.exchange(&channel, request).await
    }

    async fn exchange(&self, channel: &WorkerChannel, request: Request) -> WorkerResult<Value> {
        let worker = channel.worker().to_string();
        let method = request.method.clone();
        let tool = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let started = Instant::now();
        let outcome = channel.call(request, self.timeout).await;
        let elapsed_ms = millis(started.elapsed());

        match &outcome {
            Ok(_) => info!(worker = %worker, %method, %tool, elapsed_ms, "Worker call succeeded"),
            Err(e) => {
                warn!(worker = %worker, %method, %tool, elapsed_ms, error = %e, "Worker call failed")
            }
        }
        outcome
    }
}

/// Whole milliseconds, saturating instead of wrapping
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl ActiveWorker for Idle {
        fn active_channel(&self) -> WorkerResult<Arc<WorkerChannel>> {
            Err(WorkerError::NoActiveWorker)
        }
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_no_active_worker_fails_before_any_io() {
        let invoker = ToolInvoker::new(Arc::new(Idle), Duration::from_secs(1));
        let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoActiveWorker));
    }
}
