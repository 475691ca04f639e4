//! Error taxonomy shared by the transport, protocol and session layers.
//!
//! Library code returns these typed errors; the binary and tests wrap them
//! in `anyhow` with context.

use thiserror::Error;

use crate::session::SessionState;
use crate::ws::OpCode;

/// Failures while establishing or using the WebSocket transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("handshake rejected: {status_line}")]
    HandshakeRejected { status_line: String },

    #[error("malformed handshake response: {0}")]
    MalformedResponse(String),

    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },

    #[error("connection closed by peer")]
    Closed,

    #[error("connection is not open")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame-level violations that make the byte stream unrecoverable.
///
/// Oversized or unallocatable frames are not errors: the decoder drains them
/// and reports a discard instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),

    #[error("invalid 64-bit payload length {0:#x}")]
    InvalidLength(u64),

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(u64),

    #[error("control frame {0:?} is fragmented")]
    FragmentedControl(OpCode),
}

/// Binary protocol envelope errors. The offending message is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated message: needed {needed} bytes, {available} available")]
    TruncatedMessage { needed: usize, available: usize },

    #[error("unknown message type {0:#06b}")]
    UnknownMessageType(u8),

    #[error("invalid header size of {0} words")]
    InvalidHeaderSize(u8),

    #[error("unknown serialization method {0:#06b}")]
    UnknownSerialization(u8),

    #[error("unknown compression method {0:#06b}")]
    UnknownCompression(u8),

    #[error("session id is not valid UTF-8")]
    InvalidSessionId,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to inflate gzip payload: {0}")]
    Decompress(#[source] std::io::Error),
}

/// No tier of the allocation strategy could satisfy a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no memory pool could provide a buffer (largest candidate {largest} bytes)")]
    Exhausted { largest: usize },
}

/// Errors surfaced by the session clients.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("not connected")]
    NotConnected,

    #[error("session start rejected by server: {0}")]
    SessionFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("playback sink already released by shutdown")]
    PlaybackClosed,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
