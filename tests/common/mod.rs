// Shared helpers for the integration tests
//
// A scripted WebSocket server on localhost and a playback sink whose
// throughput the test controls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use loqa_voicelink::audio::{MemoryPools, PlaybackSink};
use loqa_voicelink::config::EndpointConfig;
use loqa_voicelink::ws::frame::encode_frame_with_mask;
use loqa_voicelink::ws::handshake::accept_key;
use loqa_voicelink::ws::{DecodedFrame, Frame, FrameDecoder, OpCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A 101 response carrying `accept` as its `Sec-WebSocket-Accept`.
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}

/// Listens on an ephemeral localhost port and plays the server side.
pub struct TestServer {
    listener: TcpListener,
    accepted: usize,
}

impl TestServer {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            listener,
            accepted: 0,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<EndpointConfig> {
        let port = self.listener.local_addr()?.port();
        Ok(EndpointConfig::new("127.0.0.1", port, path))
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Accept one client and complete its upgrade.
    pub async fn accept(&mut self) -> Result<ServerConn> {
        let mut conn = self.accept_request().await?;
        let Some(key) = conn.header("Sec-WebSocket-Key") else {
            bail!("upgrade request without Sec-WebSocket-Key");
        };
        conn.send_raw(switching_protocols(&accept_key(&key)).as_bytes())
            .await?;
        Ok(conn)
    }

    /// Accept one client and answer its upgrade with `response`.
    pub async fn accept_with(&mut self, response: &str) -> Result<ServerConn> {
        let mut conn = self.accept_request().await?;
        conn.send_raw(response.as_bytes()).await?;
        Ok(conn)
    }

    async fn accept_request(&mut self) -> Result<ServerConn> {
        let (stream, _) = tokio::time::timeout(IO_TIMEOUT, self.listener.accept())
            .await
            .context("no client connected")??;
        self.accepted += 1;

        let mut conn = ServerConn {
            stream,
            buf: BytesMut::with_capacity(4096),
            decoder: FrameDecoder::new(MemoryPools::unbounded()),
            request_head: String::new(),
        };
        conn.read_request_head().await?;
        Ok(conn)
    }
}

/// Server end of one upgraded connection
pub struct ServerConn {
    stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
    pub request_head: String,
}

impl ServerConn {
    async fn read_request_head(&mut self) -> Result<()> {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(pos + 4);
                self.request_head = String::from_utf8_lossy(&head).into_owned();
                return Ok(());
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(4096);
        let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .context("timed out reading from client")??;
        if n == 0 {
            bail!("client closed the connection");
        }
        Ok(())
    }

    /// Value of a request header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<String> {
        self.request_head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    /// Next complete frame from the client.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.decoder.decode(&mut self.buf)? {
                Some(DecodedFrame::Frame(frame)) => return Ok(frame),
                Some(other) => bail!("client frame was discarded: {:?}", other),
                None => self.fill().await?,
            }
        }
    }

    /// Next data frame, skipping pongs.
    pub async fn read_data_frame(&mut self) -> Result<Frame> {
        loop {
            let frame = self.read_frame().await?;
            if frame.opcode != OpCode::Pong {
                return Ok(frame);
            }
        }
    }

    /// Send one unmasked final frame.
    pub async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.send_fragment(opcode, payload, true).await
    }

    pub async fn send_fragment(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let bytes = encode_frame_with_mask(payload, opcode, fin, None);
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a close frame with `code`.
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.send(OpCode::Close, &payload).await
    }
}

/// Sink that accepts nothing until opened, then records everything.
#[derive(Clone, Default)]
pub struct GatedSink {
    open: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl GatedSink {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open() -> Self {
        let sink = Self::default();
        sink.set_open(true);
        sink
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PlaybackSink for GatedSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(0);
        }
        if let Ok(mut received) = self.received.lock() {
            received.extend_from_slice(pcm);
        }
        Ok(pcm.len())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn eventually<F>(mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            bail!("condition not reached within {:?}", IO_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
