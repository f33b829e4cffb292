//! Request/response channel to one worker
//!
//! A channel owns the write half of the worker's transport and a background
//! task reading the other half. Each line read back is routed by request id
//! to the caller waiting on it. Only one call is in flight per channel: the
//! gate mutex is held for the whole exchange, so concurrent callers queue and
//! bytes from different requests never interleave.

use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{parse_incoming, Incoming, Outcome, Request, RequestId, Response};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Ids of abandoned requests remembered so their late answers can be dropped
const ABANDONED_CAPACITY: usize = 64;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What the reader hands to a waiting caller
#[derive(Debug)]
enum Delivery {
    Response(Response),
    Malformed(String),
}

#[derive(Default)]
struct Routing {
    waiting: HashMap<RequestId, oneshot::Sender<Delivery>>,
    abandoned: VecDeque<RequestId>,
    closed: bool,
}

impl Routing {
    fn abandon(&mut self, id: RequestId) {
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(id);
    }

    fn take_abandoned(&mut self, id: &RequestId) -> bool {
        match self.abandoned.iter().position(|a| a == id) {
            Some(pos) => {
                self.abandoned.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Routing table shared between callers and the reader task
#[derive(Default)]
struct Router {
    routing: Mutex<Routing>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in `id`; `None` once the reader has stopped
    fn expect(&self, id: RequestId) -> Option<oneshot::Receiver<Delivery>> {
        let mut routing = self.lock();
        if routing.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        routing.waiting.insert(id, tx);
        Some(rx)
    }

    fn forget(&self, id: &RequestId) {
        self.lock().waiting.remove(id);
    }

    /// Stop waiting for `id`; an answer arriving later is discarded
    fn abandon(&self, id: &RequestId) {
        let mut routing = self.lock();
        routing.waiting.remove(id);
        routing.abandon(id.clone());
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn route(&self, worker: &str, line: &str) {
        match parse_incoming(line) {
            Ok(Incoming::Response(response)) => {
                let mut routing = self.lock();
                if let Some(tx) = routing.waiting.remove(&response.id) {
                    let _ = tx.send(Delivery::Response(response));
                } else if routing.take_abandoned(&response.id) {
                    debug!(worker, id = %response.id, "Discarding late response");
                } else {
                    let reason = format!("response id {} does not match any request", response.id);
                    warn!(worker, "{reason}");
                    Self::fail_waiting(&mut routing, &reason);
                }
            }
            Ok(Incoming::Notification { method }) => {
                debug!(worker, %method, "Ignoring worker-initiated message");
            }
            Err(reason) => {
                warn!(worker, %reason, "Unreadable line from worker");
                Self::fail_waiting(&mut self.lock(), &reason);
            }
        }
    }

    /// Fail every outstanding call; their real answers, if any, get dropped
    fn fail_waiting(routing: &mut Routing, reason: &str) {
        let waiting: Vec<_> = routing.waiting.drain().collect();
        for (id, tx) in waiting {
            let _ = tx.send(Delivery::Malformed(reason.to_string()));
            routing.abandon(id);
        }
    }

    /// Drop all waiters; they observe a closed channel
    fn close(&self) {
        let mut routing = self.lock();
        routing.closed = true;
        routing.waiting.clear();
    }
}

/// One live transport connection: writer plus reader task
struct Connection {
    writer: BoxedWriter,
    router: Arc<Router>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn start<R, W>(worker: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let router = Arc::new(Router::default());
        let reader = tokio::spawn(read_loop(worker.to_string(), reader, router.clone()));
        Self {
            writer: Box::new(writer),
            router,
            reader,
        }
    }

    async fn send(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(worker: String, reader: R, router: Arc<Router>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(worker = %worker, "Worker channel reached end of stream");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    router.route(&worker, line);
                }
            }
            Err(e) => {
                warn!(worker = %worker, error = %e, "Failed to read from worker");
                break;
            }
        }
    }
    router.close();
}

enum Endpoint {
    /// Pipes handed over at spawn time; cannot be re-established
    Pipe,
    /// TCP address, connected on first use and again after a drop
    Tcp {
        address: String,
        connect_timeout: Duration,
    },
}

/// The transport handle of one running worker
pub struct WorkerChannel {
    worker: String,
    endpoint: Endpoint,
    gate: tokio::sync::Mutex<Option<Connection>>,
    shut: AtomicBool,
}

impl WorkerChannel {
    /// Channel over an already-open byte stream pair (stdio pipes, or any
    /// in-memory stream)
    pub fn from_stream<R, W>(worker: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            worker: worker.to_string(),
            endpoint: Endpoint::Pipe,
            gate: tokio::sync::Mutex::new(Some(Connection::start(worker, reader, writer))),
            shut: AtomicBool::new(false),
        }
    }

    /// Channel to a network worker; nothing is connected until the first call
    pub fn tcp(worker: &str, address: String, connect_timeout: Duration) -> Self {
        Self {
            worker: worker.to_string(),
            endpoint: Endpoint::Tcp {
                address,
                connect_timeout,
            },
            gate: tokio::sync::Mutex::new(None),
            shut: AtomicBool::new(false),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Send `request` and wait for its correlated response.
    ///
    /// Waiting for the gate maps to `WorkerBusy` after `timeout`. Once the
    /// gate is held, writing the request and waiting for the answer share a
    /// single `timeout` deadline whose expiry maps to `InvocationTimeout`.
    pub async fn call(&self, request: Request, timeout: Duration) -> WorkerResult<Value> {
        let mut gate = tokio::time::timeout(timeout, self.gate.lock())
            .await
            .map_err(|_| WorkerError::WorkerBusy(self.worker.clone()))?;
        let deadline = tokio::time::Instant::now() + timeout;

        let id = request.id.clone();
        let line = request
            .to_line()
            .map_err(|e| WorkerError::Transport(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let connection = self.ensure_connected(&mut gate).await?;
        let router = connection.router.clone();
        let Some(rx) = router.expect(id.clone()) else {
            return Err(WorkerError::WorkerDisconnected(self.worker.clone()));
        };

        let sent = tokio::time::timeout_at(deadline, connection.send(&line)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                router.forget(&id);
                return Err(match e.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected => {
                        WorkerError::WorkerDisconnected(self.worker.clone())
                    }
                    _ => WorkerError::Transport(e),
                });
            }
            Err(_) => {
                // A partly written line can never be framed again
                router.abandon(&id);
                gate.take();
                warn!(worker = %self.worker, %id, "Worker stopped reading requests; dropped connection");
                return Err(self.timed_out(request.method, timeout));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Delivery::Response(response))) => match response.outcome {
                Outcome::Success(result) => Ok(result),
                Outcome::Failure(message) => Err(WorkerError::Remote { message }),
            },
            Ok(Ok(Delivery::Malformed(reason))) => Err(WorkerError::MalformedResponse {
                worker: self.worker.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(WorkerError::WorkerDisconnected(self.worker.clone())),
            Err(_) => {
                router.abandon(&id);
                Err(self.timed_out(request.method, timeout))
            }
        }
    }

    fn timed_out(&self, method: String, timeout: Duration) -> WorkerError {
        WorkerError::InvocationTimeout {
            worker: self.worker.clone(),
            method,
            timeout,
        }
    }

    /// Wait (up to `wait`) for any in-flight call to finish, then drop the
    /// connection for good. Returns false if the wait expired first; the
    /// channel is shut either way.
    pub async fn shut(&self, wait: Duration) -> bool {
        self.shut.store(true, Ordering::SeqCst);
        match tokio::time::timeout(wait, self.gate.lock()).await {
            Ok(mut gate) => {
                gate.take();
                true
            }
            Err(_) => false,
        }
    }

    async fn ensure_connected<'a>(
        &self,
        gate: &'a mut Option<Connection>,
    ) -> WorkerResult<&'a mut Connection> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(WorkerError::WorkerDisconnected(self.worker.clone()));
        }

        let stale = gate.as_ref().map_or(true, |c| c.router.is_closed());
        if stale {
            match &self.endpoint {
                Endpoint::Pipe => {
                    return Err(WorkerError::WorkerDisconnected(self.worker.clone()));
                }
                Endpoint::Tcp {
                    address,
                    connect_timeout,
                } => {
                    let stream = connect_with_retry(&self.worker, address, *connect_timeout).await?;
                    let (reader, writer) = stream.into_split();
                    *gate = Some(Connection::start(&self.worker, reader, writer));
                }
            }
        }

        gate.as_mut()
            .ok_or_else(|| WorkerError::WorkerDisconnected(self.worker.clone()))
    }
}

/// The worker process may still be binding its socket; keep trying until
/// `connect_timeout` has passed.
async fn connect_with_retry(
    worker: &str,
    address: &str,
    connect_timeout: Duration,
) -> WorkerResult<TcpStream> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                debug!(worker, address, "Connected to network worker");
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                debug!(worker, address, error = %e, "Worker not reachable yet, retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(source) => {
                return Err(WorkerError::ConnectFailed {
                    worker: worker.to_string(),
                    address: address.to_string(),
                    source,
                });
            }
        }
    }
}
