//! Worker side of the protocol: answers framed JSON-RPC requests on stdio.
//!
//! Supported methods:
//!
//! - `ping` -> `{"ok": true}`
//! - `tools/list` -> `{"tools": [descriptor, ...]}`
//! - `tools/call` with `{name, arguments}` ->
//!   `{"content": [{"type": "json", "json": <tool result>}]}`
//!
//! Each request runs in its own task, so a slow tool never holds up the
//! requests behind it. Notifications (no `id` member at all) are processed
//! but never answered; `"id": null` still gets a response.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ipc::{write_frame, FrameDecoder};
use crate::jsonrpc::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, SERVER_ERROR,
};
use crate::tools::{ToolBox, ToolKind};

/// Read buffer size for the request stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Dispatches JSON-RPC methods to the tool box.
#[derive(Debug, Clone)]
pub struct Worker {
    tools: ToolBox,
}

impl Worker {
    pub fn new(tools: ToolBox) -> Self {
        Self { tools }
    }

    /// Handle one request. Returns `None` for notifications.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let result = match request.method.as_str() {
            "ping" => Ok(json!({"ok": true})),
            "tools/list" => Ok(tool_list()),
            "tools/call" => self.call_tool(request.params.unwrap_or(Value::Null)).await,
            other => Err(JsonRpcError::method_not_found(format!(
                "Unknown method: {}",
                other
            ))),
        };

        let Some(id) = request.id else {
            debug!("Not answering notification {}", request.method);
            return None;
        };

        Some(match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    /// Handle a decoded message that may not be a well-formed request.
    pub async fn handle_message(&self, message: Value) -> Option<JsonRpcResponse> {
        let id = message.get("id").cloned();
        match serde_json::from_value::<JsonRpcRequest>(message) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Invalid JSON-RPC request: {}", e);
                id.map(|id| {
                    JsonRpcResponse::failure(
                        id,
                        JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e)),
                    )
                })
            }
        }
    }

    async fn call_tool(&self, params: Value) -> Result<Value, JsonRpcError> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let Some(kind) = ToolKind::from_name(name) else {
            return Err(JsonRpcError::method_not_found(format!(
                "Unknown tool: {}",
                name
            )));
        };

        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        match self.tools.call(kind, &arguments).await {
            Ok(result) => Ok(json!({
                "content": [{"type": "json", "json": result}]
            })),
            Err(e) => {
                error!("Tool execution error in {}: {}", kind.name(), e);
                Err(JsonRpcError::new(SERVER_ERROR, "Tool execution error")
                    .with_data(json!({"message": e.to_string()})))
            }
        }
    }
}

fn tool_list() -> Value {
    let tools: Vec<_> = ToolKind::ALL.iter().map(ToolKind::descriptor).collect();
    json!({"tools": tools})
}

/// Serve framed requests from `reader`, writing responses to `writer`.
///
/// Returns once `reader` reaches EOF and every in-flight request has been
/// answered.
///
/// # Errors
///
/// Returns an error if reading the request stream fails.
pub async fn serve<R, W>(mut reader: R, writer: W, worker: Arc<Worker>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut decoder = FrameDecoder::new();
    let mut in_flight = JoinSet::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let outcome = loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        for frame in decoder.push(&chunk[..read]) {
            let message = match frame {
                Ok(message) => message,
                Err(e) => {
                    warn!("Invalid JSON: {}", e);
                    continue;
                }
            };

            let worker = Arc::clone(&worker);
            let writer = Arc::clone(&writer);
            in_flight.spawn(async move {
                let Some(response) = worker.handle_message(message).await else {
                    return;
                };
                debug!("Sending response for id {}", response.id);
                let mut writer = writer.lock().await;
                if let Err(e) = write_frame(&mut *writer, &response).await {
                    error!("Failed to write response: {}", e);
                }
            });
        }

        // Reap finished handlers so the set does not grow without bound.
        while in_flight.try_join_next().is_some() {}
    };

    info!("Request stream closed, finishing {} in-flight requests", in_flight.len());
    while in_flight.join_next().await.is_some() {}

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::ipc::encode_frame;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn worker() -> Worker {
        Worker::new(ToolBox::new(WorkerConfig::default()).unwrap())
    }

    fn request(value: Value) -> JsonRpcRequest {
        serde_json::from_value(value).unwrap()
    }

    fn to_value(response: Option<JsonRpcResponse>) -> Value {
        serde_json::to_value(response.expect("expected a response")).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let response = worker()
            .handle(request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
            .await;
        assert_eq!(
            to_value(response),
            json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})
        );
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = to_value(
            worker()
                .handle(request(json!({"id": 2, "method": "tools/list", "params": {}})))
                .await,
        );
        let names: Vec<_> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["getWeather", "getCurrentTime", "getCurrencyExchange", "getWikiSummary"]
        );
        assert_eq!(
            response["result"]["tools"][0]["inputSchema"]["required"],
            json!(["city"])
        );
    }

    #[tokio::test]
    async fn test_tools_call_wraps_result() {
        let response = to_value(
            worker()
                .handle(request(json!({
                    "id": 3,
                    "method": "tools/call",
                    "params": {"name": "getCurrentTime", "arguments": {}}
                })))
                .await,
        );
        let content = &response["result"]["content"][0];
        assert_eq!(content["type"], json!("json"));
        assert_eq!(content["json"]["success"], json!(true));
        assert!(content["json"]["time"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_method_and_tool() {
        let response = to_value(
            worker()
                .handle(request(json!({"id": 4, "method": "resources/list"})))
                .await,
        );
        assert_eq!(
            response["error"],
            json!({"code": -32601, "message": "Unknown method: resources/list"})
        );

        let response = to_value(
            worker()
                .handle(request(json!({
                    "id": 5,
                    "method": "tools/call",
                    "params": {"name": "getStockPrice", "arguments": {}}
                })))
                .await,
        );
        assert_eq!(
            response["error"],
            json!({"code": -32601, "message": "Unknown tool: getStockPrice"})
        );
    }

    #[tokio::test]
    async fn test_tool_execution_error() {
        let response = to_value(
            worker()
                .handle(request(json!({
                    "id": 6,
                    "method": "tools/call",
                    "params": {"name": "getWeather", "arguments": [1, 2]}
                })))
                .await,
        );
        assert_eq!(
            response["error"],
            json!({
                "code": -32000,
                "message": "Tool execution error",
                "data": {"message": "Tool arguments must be a JSON object, got array"}
            })
        );
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        assert!(worker()
            .handle(request(json!({"method": "ping"})))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_null_id_request_is_answered() {
        let response = worker()
            .handle(request(json!({"jsonrpc": "2.0", "id": null, "method": "ping"})))
            .await;
        assert_eq!(
            to_value(response),
            json!({"jsonrpc": "2.0", "id": null, "result": {"ok": true}})
        );
    }

    #[tokio::test]
    async fn test_malformed_request_with_id() {
        let response = to_value(worker().handle_message(json!({"id": 8, "params": {}})).await);
        assert_eq!(response["error"]["code"], json!(-32600));

        assert!(worker().handle_message(json!({"params": {}})).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let (mut client, worker_side) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let server = tokio::spawn(serve(worker_read, worker_write, Arc::new(worker())));

        let mut stream = b"Content-Length: abc\r\n\r\n".to_vec();
        stream.extend(encode_frame(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap());
        stream.extend(encode_frame(&json!({"jsonrpc": "2.0", "method": "ping"})).unwrap());
        stream.extend(encode_frame(&json!({"jsonrpc": "2.0", "id": 2, "method": "nope"})).unwrap());
        client.write_all(&stream).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut responses = Vec::new();
        let mut chunk = [0u8; 1024];
        while responses.len() < 2 {
            let n = timeout(TEST_TIMEOUT, client.read(&mut chunk))
                .await
                .expect("Test timed out")
                .unwrap();
            assert!(n > 0);
            responses.extend(decoder.push(&chunk[..n]).into_iter().map(Result::unwrap));
        }
        responses.sort_by_key(|response| response["id"].as_u64());

        assert_eq!(
            responses,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}),
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "error": {"code": -32601, "message": "Unknown method: nope"}
                }),
            ]
        );

        client.shutdown().await.unwrap();
        drop(client);
        timeout(TEST_TIMEOUT, server)
            .await
            .expect("serve should return after EOF")
            .unwrap()
            .unwrap();
    }
}
