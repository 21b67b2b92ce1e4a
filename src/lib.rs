//! toolbridge Library
//!
//! An HTTP-to-stdio bridge for a Content-Length framed JSON-RPC tool worker:
//!
//! - `ipc` - frame codec, pending-request table and the shared `RpcChannel`
//! - `bridge` - hyper HTTP endpoint (`POST /mcp`, `GET /health`)
//! - `supervisor` - spawns the worker process and watches it
//! - `worker` - the worker side: `ping`, `tools/list`, `tools/call`
//! - `tools` - the tool implementations behind `tools/call`
//! - `jsonrpc` - JSON-RPC 2.0 envelope types
//! - `models` - tool descriptors and LLM-facing helpers
//! - `config` - environment configuration for both binaries
//!
//! # Usage
//!
//! ```ignore
//! use toolbridge::config::WorkerCommand;
//! use toolbridge::ipc::ChannelConfig;
//! use toolbridge::supervisor::spawn_worker;
//!
//! let (channel, worker) = spawn_worker(&WorkerCommand::bundled(), ChannelConfig::default())?;
//! let tools = channel.call("tools/list", serde_json::json!({})).await?;
//! ```

pub mod bridge;
pub mod config;
pub mod ipc;
pub mod jsonrpc;
pub mod models;
pub mod supervisor;
pub mod tools;
pub mod worker;
