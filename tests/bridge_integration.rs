//! Integration tests for the HTTP bridge.
//!
//! These tests run the real hyper server on a loopback port in front of an
//! in-memory worker (`worker::serve` over `tokio::io::duplex`), and drive it
//! with `reqwest` the way an HTTP client would.
//!
//! # Running
//!
//! ```bash
//! cargo test --test bridge_integration -- --nocapture
//! ```

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use toolbridge::bridge;
use toolbridge::config::WorkerConfig;
use toolbridge::ipc::{ChannelConfig, RpcChannel};
use toolbridge::models::{extract_tool_result, is_success, ToolInvocation};
use toolbridge::tools::ToolBox;
use toolbridge::worker::{self, Worker};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A bridge serving on a loopback port.
struct TestBridge {
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestBridge {
    fn start(channel: RpcChannel) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(bridge::serve(listener, channel, async {
            let _ = shutdown_rx.await;
        }));

        Self {
            base_url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_mcp(&self, body: &Value) -> (u16, Value) {
        let response = tokio::time::timeout(
            TEST_TIMEOUT,
            reqwest::Client::new()
                .post(self.url(bridge::MCP_PATH))
                .json(body)
                .send(),
        )
        .await
        .expect("Test timed out")
        .expect("request failed");

        let status = response.status().as_u16();
        (status, response.json().await.expect("JSON body"))
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        tokio::time::timeout(TEST_TIMEOUT, self.server)
            .await
            .expect("bridge should stop after shutdown")
            .expect("bridge task panicked")
            .expect("bridge returned an error");
    }
}

/// Start an in-memory worker and return a channel connected to it.
fn in_memory_worker(config: WorkerConfig, channel_config: ChannelConfig) -> RpcChannel {
    let (bridge_side, worker_side) = tokio::io::duplex(64 * 1024);
    let (worker_read, worker_write) = tokio::io::split(worker_side);
    let worker = Arc::new(Worker::new(ToolBox::new(config).expect("tool box")));
    tokio::spawn(worker::serve(worker_read, worker_write, worker));

    let (read, write) = tokio::io::split(bridge_side);
    RpcChannel::new(read, write, channel_config)
}

fn default_worker() -> RpcChannel {
    in_memory_worker(WorkerConfig::default(), ChannelConfig::default())
}

#[tokio::test]
async fn test_get_current_time_end_to_end() {
    let bridge = TestBridge::start(default_worker());

    let (status, body) = bridge
        .post_mcp(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "getCurrentTime", "arguments": {}}
        }))
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["jsonrpc"], json!("2.0"));
    let content = &body["result"]["content"][0];
    assert_eq!(content["type"], json!("json"));
    assert_eq!(content["json"]["success"], json!(true));
    assert!(content["json"]["time"].is_string());

    let result = extract_tool_result(&body);
    assert!(is_success(&result));

    bridge.stop().await;
}

#[tokio::test]
async fn test_llm_invocation_through_bridge() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/v6/latest/USD");
            then.status(200).json_body(json!({
                "time_last_update_utc": "Fri, 16 Oct 2026 00:00:01 +0000",
                "rates": {"USD": 1, "EUR": 0.92}
            }));
        })
        .await;

    let config = WorkerConfig {
        exchange_base_url: Url::parse(&server.base_url()).unwrap(),
        ..WorkerConfig::default()
    };
    let bridge = TestBridge::start(in_memory_worker(config, ChannelConfig::default()));

    let request = ToolInvocation::parse("getCurrencyExchange", r#"{"from":"usd","to":"eur"}"#)
        .unwrap()
        .into_request();
    let (status, body) = bridge.post_mcp(&serde_json::to_value(request).unwrap()).await;

    assert_eq!(status, 200);
    mock.assert_async().await;
    assert_eq!(
        extract_tool_result(&body),
        json!({
            "success": true,
            "from": "USD",
            "to": "EUR",
            "rate": 0.92,
            "result": 0.92,
            "date": "Fri, 16 Oct 2026 00:00:01 +0000"
        })
    );

    bridge.stop().await;
}

#[tokio::test]
async fn test_tools_list() {
    let bridge = TestBridge::start(default_worker());

    let (status, body) = bridge
        .post_mcp(&json!({"jsonrpc": "2.0", "method": "tools/list", "params": {}}))
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 4);

    bridge.stop().await;
}

#[tokio::test]
async fn test_worker_errors_pass_through() {
    let bridge = TestBridge::start(default_worker());

    let (status, body) = bridge
        .post_mcp(&json!({"jsonrpc": "2.0", "id": "client-id", "method": "resources/list"}))
        .await;

    // The bridge replaces the caller's id with its own.
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Unknown method: resources/list"}
        })
    );

    bridge.stop().await;
}

#[tokio::test]
async fn test_failed_write_returns_500_before_timeout() {
    let (reader, _reader_peer) = tokio::io::duplex(1024);
    let (writer, writer_peer) = tokio::io::duplex(1024);
    drop(writer_peer);

    let channel = RpcChannel::new(
        reader,
        writer,
        ChannelConfig {
            timeout: Duration::from_secs(5),
            ..ChannelConfig::default()
        },
    );
    let bridge = TestBridge::start(channel);

    let started = Instant::now();
    let (status, body) = bridge
        .post_mcp(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .await;

    assert_eq!(status, 500);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to write to worker"));
    assert!(started.elapsed() < Duration::from_secs(2));

    bridge.stop().await;
}

#[tokio::test]
async fn test_silent_worker_times_out() {
    let (reader, _reader_peer) = tokio::io::duplex(1024);
    let (writer, _writer_peer) = tokio::io::duplex(64 * 1024);

    let channel = RpcChannel::new(
        reader,
        writer,
        ChannelConfig {
            timeout: Duration::from_millis(200),
            ..ChannelConfig::default()
        },
    );
    let bridge = TestBridge::start(channel.clone());

    let (status, body) = bridge
        .post_mcp(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .await;

    assert_eq!(status, 500);
    assert_eq!(
        body,
        json!({"error": "Timeout waiting for worker response after 200ms"})
    );
    assert_eq!(channel.pending_count(), 0);

    bridge.stop().await;
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let bridge = TestBridge::start(default_worker());

    let response = reqwest::Client::new()
        .post(bridge.url(bridge::MCP_PATH))
        .header("content-type", "application/json")
        .body("{\"jsonrpc\": ")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON"));

    bridge.stop().await;
}

#[tokio::test]
async fn test_health_reports_connected_worker() {
    let bridge = TestBridge::start(default_worker());

    let response = reqwest::get(bridge.url(bridge::HEALTH_PATH)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["worker"], json!("connected"));
    assert!(body["timestamp"].is_string());

    bridge.stop().await;
}

#[tokio::test]
async fn test_health_reports_exited_worker() {
    let (bridge_side, worker_side) = tokio::io::duplex(1024);
    drop(worker_side);
    let (read, write) = tokio::io::split(bridge_side);
    let channel = RpcChannel::new(read, write, ChannelConfig::default());

    tokio::time::timeout(TEST_TIMEOUT, async {
        while !channel.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel should close after worker EOF");

    let bridge = TestBridge::start(channel);

    let response = reqwest::get(bridge.url(bridge::HEALTH_PATH)).await.unwrap();
    assert_eq!(response.status().as_u16(), 503);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("unhealthy"));
    assert_eq!(body["worker"], json!("disconnected"));
    assert_eq!(body["error"], json!("Worker process is not running"));

    let (status, body) = bridge
        .post_mcp(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .await;
    assert_eq!(status, 500);
    assert_eq!(body, json!({"error": "Worker process is not running"}));

    bridge.stop().await;
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let bridge = TestBridge::start(default_worker());

    let response = reqwest::get(bridge.url("/chat")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Not found"}));

    bridge.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let bridge = Arc::new(TestBridge::start(default_worker()));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let bridge = Arc::clone(&bridge);
        tasks.spawn(async move {
            bridge
                .post_mcp(&json!({"jsonrpc": "2.0", "method": "ping"}))
                .await
        });
    }

    let mut ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (status, body) = joined.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["result"], json!({"ok": true}));
        ids.push(body["id"].as_u64().unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    let bridge = Arc::try_unwrap(bridge).unwrap_or_else(|_| panic!("bridge still shared"));
    bridge.stop().await;
}
