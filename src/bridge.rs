//! HTTP front end for the worker channel.
//!
//! - `POST /mcp`: forward a JSON-RPC request to the worker and answer with
//!   the worker's response message.
//! - `GET /health`: ping the worker.
//!
//! Every answer is a JSON body, including failures.

use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::ipc::{RpcChannel, RpcError};

pub const MCP_PATH: &str = "/mcp";
pub const HEALTH_PATH: &str = "/health";

/// How long `/health` waits for the worker's `ping` answer.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

const SERVER_NAME: &str = "toolbridge";

/// Serve the bridge on `listener` until `shutdown` completes.
///
/// Each connection and each request runs in its own task; they all share
/// `channel`.
///
/// # Errors
///
/// Returns an error if the listener cannot be handed to the runtime or the
/// server fails while accepting connections.
pub async fn serve<F>(listener: TcpListener, channel: RpcChannel, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener
        .set_nonblocking(true)
        .context("Failed to make listener non-blocking")?;
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;

    let make_svc = make_service_fn(move |_conn| {
        let channel = channel.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let channel = channel.clone();
                async move { Ok::<_, Infallible>(route(req, channel).await) }
            }))
        }
    });

    info!("HTTP bridge listening on http://{}{}", addr, MCP_PATH);

    Server::from_tcp(listener)
        .context("Failed to create HTTP server")?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    info!("HTTP bridge stopped");
    Ok(())
}

async fn route(req: Request<Body>, channel: RpcChannel) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, MCP_PATH) => forward(req, &channel).await,
        (&Method::GET, HEALTH_PATH) => health(&channel).await,
        (method, path) => {
            debug!("No route for {} {}", method, path);
            json_response(StatusCode::NOT_FOUND, &json!({"error": "Not found"}))
        }
    }
}

async fn forward(req: Request<Body>, channel: &RpcChannel) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, format!("Failed to read body: {}", e));
        }
    };

    let request: Value = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejecting request with invalid JSON: {}", e);
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e));
        }
    };

    match channel.send(request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e @ RpcError::InvalidRequest(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            warn!("Worker request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health(channel: &RpcChannel) -> Response<Body> {
    let timestamp = chrono::Utc::now().to_rfc3339();

    match channel.call_with_timeout("ping", json!({}), HEALTH_TIMEOUT).await {
        Ok(_) => json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "server": SERVER_NAME,
                "worker": "connected",
                "timestamp": timestamp,
            }),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({
                    "status": "unhealthy",
                    "server": SERVER_NAME,
                    "worker": "disconnected",
                    "error": e.to_string(),
                    "timestamp": timestamp,
                }),
            )
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    json_response(status, &json!({"error": message}))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
