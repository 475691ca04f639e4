use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::assembler::{Message, MessageAssembler, DEFAULT_MAX_MESSAGE_SIZE};
use super::frame::{encode_frame, DecodedFrame, FrameDecoder, OpCode, DEFAULT_MAX_FRAME_PAYLOAD};
use super::handshake::{self, UpgradeRequest};
use crate::audio::alloc::MemoryPools;
use crate::error::TransportError;

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

/// Limits and timeouts for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on the upgrade exchange
    pub handshake_timeout: Duration,

    /// Upper bound on receiving the rest of a started frame
    pub payload_timeout: Duration,

    /// Frames declaring more than this are drained and dropped
    pub max_frame_payload: usize,

    /// Fragmented messages larger than this are dropped
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            payload_timeout: Duration::from_secs(5),
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// What [`WsConnection::recv`] hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    /// The peer sent a close frame; the connection is finished.
    Closed { code: Option<u16>, reason: String },
}

/// An upgraded client connection over any byte stream.
///
/// Ping frames are answered inline while receiving, so the caller only sees
/// data messages and the close signal.
pub struct WsConnection<S> {
    stream: S,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    payload_timeout: Duration,
    open: bool,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Perform the upgrade handshake on `stream`.
    pub async fn handshake(
        mut stream: S,
        request: &UpgradeRequest,
        config: &ConnectionConfig,
        pools: Arc<MemoryPools>,
    ) -> Result<Self, TransportError> {
        let leftover = handshake::perform(&mut stream, request, config.handshake_timeout).await?;
        Ok(Self::from_upgraded(stream, leftover, config, pools))
    }

    /// Wrap a stream whose upgrade already happened.
    pub fn from_upgraded(
        stream: S,
        read_buf: BytesMut,
        config: &ConnectionConfig,
        pools: Arc<MemoryPools>,
    ) -> Self {
        Self {
            stream,
            read_buf,
            decoder: FrameDecoder::new(pools).with_max_payload(config.max_frame_payload),
            assembler: MessageAssembler::new(config.max_message_size),
            payload_timeout: config.payload_timeout,
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send one masked, final frame.
    pub async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let frame = encode_frame(payload, opcode, true);
        let result = async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = result {
            self.open = false;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn send_binary(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.send(OpCode::Binary, payload).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    /// Wait up to `wait` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. Once a frame has started,
    /// the rest of it must arrive within the payload timeout or the
    /// connection is failed.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Inbound>, TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }

        loop {
            while let Some(decoded) = self.decode_next()? {
                let frame = match decoded {
                    DecodedFrame::Frame(frame) => frame,
                    DecodedFrame::Discarded {
                        opcode,
                        len,
                        reason,
                    } => {
                        warn!(
                            "Dropped frame (opcode {:#x}, {} bytes): {:?}",
                            opcode, len, reason
                        );
                        continue;
                    }
                };

                match frame.opcode {
                    OpCode::Ping => {
                        debug!("Ping ({} bytes), sending pong", frame.payload.len());
                        self.send(OpCode::Pong, &frame.payload).await?;
                    }
                    OpCode::Pong => debug!("Pong received"),
                    OpCode::Close => {
                        let (code, reason) = parse_close_payload(&frame.payload);
                        debug!("Close frame received: {:?} {}", code, reason);
                        // Echo the close; the peer may already be gone
                        let _ = self.send(OpCode::Close, &frame.payload).await;
                        self.open = false;
                        return Ok(Some(Inbound::Closed { code, reason }));
                    }
                    _ => {
                        if let Some(message) = self.assembler.push(frame) {
                            return Ok(Some(Inbound::Message(message)));
                        }
                    }
                }
            }

            let mid_frame = self.decoder.is_mid_frame() || !self.read_buf.is_empty();
            let limit = if mid_frame { self.payload_timeout } else { wait };

            self.read_buf.reserve(4096);
            match tokio::time::timeout(limit, self.stream.read_buf(&mut self.read_buf)).await {
                Err(_) if mid_frame => {
                    self.open = false;
                    return Err(TransportError::Timeout {
                        what: "frame payload",
                    });
                }
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.open = false;
                    return Err(TransportError::Closed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.open = false;
                    return Err(e.into());
                }
            }
        }
    }

    /// Send a normal close frame and shut the stream down.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        let payload = CLOSE_NORMAL.to_be_bytes();
        let result = self.send(OpCode::Close, &payload).await;
        self.open = false;
        let _ = self.stream.shutdown().await;
        result
    }

    fn decode_next(&mut self) -> Result<Option<DecodedFrame>, TransportError> {
        match self.decoder.decode(&mut self.read_buf) {
            Ok(decoded) => Ok(decoded),
            Err(e) => {
                self.open = false;
                Err(e.into())
            }
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}
