//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). It turns an unbounded byte
//! stream (a child process's stdout, an in-memory duplex) into discrete
//! JSON messages.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! `<length>` is the body's UTF-8 byte length. Header lookup is
//! case-insensitive. Headers without a usable length are dropped and decoding
//! continues after their separator. A frame declaring more than the maximum
//! size is skipped whole: its body bytes are discarded as they arrive and
//! never parsed as headers.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Separator between the header block and the body.
const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Header name, lowercased for case-insensitive matching.
const CONTENT_LENGTH: &[u8] = b"content-length:";

/// A frame whose body could not be turned into a message.
///
/// The stream position is unaffected: the body bytes were consumed and the
/// decoder is already looking for the next header.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON in frame body: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// Encode a message as a Content-Length framed byte sequence.
///
/// The output is deterministic for identical input.
pub fn encode_frame<T>(message: &T) -> Result<Vec<u8>, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write a Content-Length framed message to the stream and flush it.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized, or if the write or
/// flush fails.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for the `\r\n\r\n` that ends a header block.
    Header,
    /// Header parsed, waiting for `len` body bytes.
    Body { len: usize },
    /// Skipping the body of an oversized frame without buffering it.
    Discard { remaining: usize },
}

/// Incremental decoder for Content-Length framed JSON.
///
/// Bytes are pushed in whatever chunks the transport delivers; every complete
/// frame is returned as soon as its last byte arrives. Partial data is kept
/// across calls, so a frame split byte-by-byte decodes the same as one
/// delivered whole.
///
/// # Example
///
/// ```ignore
/// let mut decoder = FrameDecoder::new();
/// for frame in decoder.push(&chunk) {
///     match frame {
///         Ok(message) => handle(message),
///         Err(e) => warn!("Dropping frame: {}", e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    /// Accumulated bytes not yet consumed as a frame.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Largest body length accepted from a header.
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default [`MAX_MESSAGE_SIZE`] limit.
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a decoder with a custom body size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Header,
            max_message_size,
        }
    }

    /// Append a chunk and return every frame it completes, in stream order.
    ///
    /// A frame whose body is not valid JSON shows up as an `Err` entry; the
    /// frames around it are unaffected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, FrameError>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a header has been parsed and its body is still incomplete.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::Body { .. } | State::Discard { .. })
    }

    /// Extract the next complete frame, or `None` if more bytes are needed.
    fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        loop {
            match self.state {
                State::Header => {
                    let header_end = find_separator(&self.buffer)?;
                    let header = self.buffer.split_to(header_end);
                    self.buffer.advance(HEADER_SEPARATOR.len());

                    match parse_content_length(&header) {
                        Some(len) if len <= self.max_message_size => {
                            self.state = State::Body { len };
                        }
                        Some(len) => {
                            warn!(
                                "Dropping frame: size {} exceeds maximum {} bytes",
                                len, self.max_message_size
                            );
                            self.state = State::Discard { remaining: len };
                        }
                        None => {
                            debug!(
                                "Dropping header without Content-Length: {:?}",
                                String::from_utf8_lossy(&header)
                            );
                        }
                    }
                }
                State::Body { len } => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    let body = self.buffer.split_to(len);
                    self.state = State::Header;
                    return Some(serde_json::from_slice(&body).map_err(FrameError::InvalidJson));
                }
                State::Discard { remaining } => {
                    let skipped = remaining.min(self.buffer.len());
                    self.buffer.advance(skipped);
                    if skipped < remaining {
                        self.state = State::Discard {
                            remaining: remaining - skipped,
                        };
                        return None;
                    }
                    self.state = State::Header;
                }
            }
        }
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
}

/// Find `Content-Length: <digits>` anywhere in a header block.
///
/// Returns `None` when the header is missing or its value does not start with
/// a decimal digit.
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let start = header
        .windows(CONTENT_LENGTH.len())
        .position(|window| window.eq_ignore_ascii_case(CONTENT_LENGTH))?;

    let value = &header[start + CONTENT_LENGTH.len()..];
    let value = match value.iter().position(|b| *b != b' ' && *b != b'\t') {
        Some(offset) => &value[offset..],
        None => return None,
    };

    let digits = value.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }

    std::str::from_utf8(&value[..digits]).ok()?.parse().ok()
}
