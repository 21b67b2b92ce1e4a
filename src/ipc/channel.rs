//! RPC channel to a worker over a framed byte stream.
//!
//! This module provides `RpcChannel`, which owns one long-lived duplex
//! connection to the worker. Any number of callers may `send` concurrently;
//! responses are matched to callers by id, never by arrival order.
//!
//! Frames are written by a dedicated writer task fed from a queue, so a
//! worker that stops reading its input stalls only the queue, never a
//! caller: every send is bounded by its own deadline, write included.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::ipc::framing::{encode_frame, FrameDecoder, MAX_MESSAGE_SIZE};
use crate::ipc::pending::{DuplicateId, PendingTable};
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size for the worker's output stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Channel-specific error types.
///
/// Timeouts, transport failures and JSON-RPC error responses are separate
/// variants so callers can tell them apart.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No response arrived within the timeout window.
    #[error("Timeout waiting for worker response after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Writing the request to the worker failed.
    #[error("Failed to write to worker: {0}")]
    Write(#[source] std::io::Error),

    /// The worker's output stream has ended; no request can succeed.
    #[error("Worker process is not running")]
    WorkerUnavailable,

    /// The worker's output stream ended while this request was pending.
    #[error("Worker connection closed before a response arrived")]
    ChannelClosed,

    /// The assigned id collided with a live entry.
    #[error("Request id {0} is already pending")]
    DuplicateId(u64),

    /// The request could not be sent as-is.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Worker returned a JSON-RPC error response.
    #[error("Worker error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<Value>,
    },

    /// Response did not follow the JSON-RPC shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

impl From<DuplicateId> for RpcError {
    fn from(err: DuplicateId) -> Self {
        RpcError::DuplicateId(err.0)
    }
}

impl From<JsonRpcError> for RpcError {
    fn from(err: JsonRpcError) -> Self {
        RpcError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Channel tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long a request may wait for its response.
    pub timeout: Duration,
    /// Largest frame body accepted from the worker.
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// An encoded frame queued for the writer task, with a handle for the
/// write outcome.
struct Outgoing {
    frame: Vec<u8>,
    written: oneshot::Sender<std::io::Result<()>>,
}

/// State shared by every clone of a channel and its reader task.
struct Shared {
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: PendingTable,
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    closed: AtomicBool,
    config: ChannelConfig,
}

/// Removes a request from the pending table when the send future ends,
/// whatever the outcome.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// RPC channel to a single worker connection.
///
/// Cloning is cheap; clones share the same connection, id counter and
/// pending table.
///
/// # Example
///
/// ```ignore
/// use toolbridge::ipc::{ChannelConfig, RpcChannel};
/// use serde_json::json;
///
/// let channel = RpcChannel::new(child_stdout, child_stdin, ChannelConfig::default());
/// let response = channel.send(json!({"jsonrpc": "2.0", "method": "ping"})).await?;
/// ```
#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.is_closed())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl RpcChannel {
    /// Wrap a worker connection and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbox, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbox,
            pending: PendingTable::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        });

        tokio::spawn(write_loop(writer, queue));
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Self { shared }
    }

    /// A channel with no worker behind it. Every send fails with
    /// [`RpcError::WorkerUnavailable`].
    pub fn detached(config: ChannelConfig) -> Self {
        // No writer task: the queue's receiving end is dropped right away.
        let (outbox, _) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                outbox,
                pending: PendingTable::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(true),
                config,
            }),
        }
    }

    /// Whether the worker's output stream has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.config.timeout
    }

    /// Send a JSON-RPC request and wait for the matching response message.
    ///
    /// The request is forwarded as given except for its `id`, which is
    /// replaced by the channel's next sequential id. The full response
    /// message is returned, including JSON-RPC error responses.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The request is not a JSON object (`RpcError::InvalidRequest`)
    /// - The worker has gone away (`RpcError::WorkerUnavailable`, `RpcError::ChannelClosed`)
    /// - Writing to the worker fails (`RpcError::Write`)
    /// - No response arrives in time (`RpcError::Timeout`)
    pub async fn send(&self, request: Value) -> Result<Value, RpcError> {
        self.send_with_timeout(request, self.shared.config.timeout)
            .await
    }

    /// Like [`send`](Self::send), with an explicit timeout.
    ///
    /// The timeout covers the whole exchange, from registration through the
    /// write to the response.
    pub async fn send_with_timeout(
        &self,
        request: Value,
        wait: Duration,
    ) -> Result<Value, RpcError> {
        let Value::Object(mut request) = request else {
            return Err(RpcError::InvalidRequest(
                "request must be a JSON object".to_string(),
            ));
        };

        if self.is_closed() {
            return Err(RpcError::WorkerUnavailable);
        }

        let deadline = Instant::now() + wait;
        let id = self.next_id();
        let mut receiver = self.shared.pending.register(id).map_err(|e| {
            error!("Refusing to send: request id {} is already pending", e.0);
            RpcError::from(e)
        })?;
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };

        // The reader may have drained the table between the check above and
        // registration.
        if self.is_closed() {
            return Err(RpcError::WorkerUnavailable);
        }

        request.insert("id".to_string(), Value::from(id));
        let method = request
            .get("method")
            .and_then(|method| method.as_str())
            .unwrap_or("<none>");
        debug!("Sending request {} to worker: {}", id, method);

        let frame = encode_frame(&request)
            .map_err(|e| RpcError::InvalidRequest(format!("Failed to encode request: {}", e)))?;
        let (written_tx, written_rx) = oneshot::channel();
        let queued = self.shared.outbox.send(Outgoing {
            frame,
            written: written_tx,
        });
        if queued.is_err() {
            return Err(RpcError::WorkerUnavailable);
        }

        match timeout_at(deadline, written_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!("Failed to write request {} to worker: {}", id, e);
                return Err(RpcError::Write(e));
            }
            Ok(Err(_)) => return Err(RpcError::WorkerUnavailable),
            Err(_) => {
                // The frame stays queued and is written whole later; only
                // this caller gives up.
                if let Ok(response) = receiver.try_recv() {
                    return Ok(response);
                }
                warn!("Request {} timed out before the worker took it", id);
                return Err(RpcError::Timeout(wait));
            }
        }

        self.wait_for_response(id, receiver, deadline, wait).await
    }

    /// Call `method` and return its `result`, mapping JSON-RPC error
    /// responses to [`RpcError::Server`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, self.shared.config.timeout)
            .await
    }

    /// Like [`call`](Self::call), with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<Value, RpcError> {
        let request = serde_json::to_value(JsonRpcRequest::new(method, params))
            .map_err(|e| RpcError::InvalidRequest(format!("Failed to serialize request: {}", e)))?;
        let response = self.send_with_timeout(request, wait).await?;
        process_response(response)
    }

    /// Generate the next request ID.
    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn wait_for_response(
        &self,
        id: u64,
        mut receiver: oneshot::Receiver<Value>,
        deadline: Instant,
        wait: Duration,
    ) -> Result<Value, RpcError> {
        match timeout_at(deadline, &mut receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => {
                if self.shared.pending.remove(id).is_some() {
                    warn!("Request {} timed out after {:?}", id, wait);
                    Err(RpcError::Timeout(wait))
                } else {
                    // Resolved (or closed) between the deadline and removal.
                    receiver.try_recv().map_err(|_| RpcError::ChannelClosed)
                }
            }
        }
    }
}

/// Extract `result` from a response message, or its error.
fn process_response(response: Value) -> Result<Value, RpcError> {
    if let Some(error) = response.get("error") {
        let error: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| RpcError::Protocol(format!("Malformed error object: {}", e)))?;
        return Err(error.into());
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Protocol("Response missing both result and error".to_string()))
}

/// Background task: write queued frames in order, each one whole.
///
/// Ends when every sender is gone.
async fn write_loop<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(Outgoing { frame, written }) = queue.recv().await {
        let result = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let _ = written.send(result);
    }
    debug!("Worker writer task finished");
}

/// Background task: decode the worker's output and resolve pending requests.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_message_size(shared.config.max_message_size);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => {
                warn!("Worker output stream closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("Failed to read from worker: {}", e);
                break;
            }
        };

        for frame in decoder.push(&chunk[..read]) {
            match frame {
                Ok(message) => dispatch(&shared.pending, message),
                Err(e) => warn!("Dropping worker frame: {}", e),
            }
        }
    }

    if decoder.buffered_len() > 0 {
        debug!(
            "Discarding {} trailing bytes from worker",
            decoder.buffered_len()
        );
    }

    shared.closed.store(true, Ordering::SeqCst);
    let failed = shared.pending.close();
    if failed > 0 {
        warn!("Failed {} pending requests after worker stream closed", failed);
    }
}

/// Route one decoded message to its waiting caller, if any.
fn dispatch(pending: &PendingTable, message: Value) {
    match message.get("id").and_then(Value::as_u64) {
        Some(id) => {
            pending.resolve(id, message);
        }
        None => {
            debug!("Ignoring worker message without a numeric id: {}", message);
        }
    }
}
