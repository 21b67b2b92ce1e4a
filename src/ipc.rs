//! Framed JSON-RPC transport between the bridge and the tool worker.
//!
//! This module provides the stream side of the system: it turns a worker's
//! stdin/stdout pipes into an `RpcChannel` that many callers can share.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐        stdin / stdout        ┌─────────────────────┐
//! │   HTTP bridge   │  ◄──────────────────────────►│     tool-worker     │
//! │  (RpcChannel)   │    JSON-RPC 2.0 + framing    │   (child process)   │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 47\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"ping","id":1}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use toolbridge::ipc::{ChannelConfig, RpcChannel};
//! use serde_json::json;
//!
//! let channel = RpcChannel::new(stdout, stdin, ChannelConfig::default());
//! let result = channel.call("tools/list", json!({})).await?;
//! ```

mod channel;
mod framing;
mod pending;

pub use channel::{ChannelConfig, RpcChannel, RpcError, DEFAULT_TIMEOUT};
pub use framing::{encode_frame, write_frame, FrameDecoder, FrameError, MAX_MESSAGE_SIZE};
pub use pending::{DuplicateId, PendingTable};
