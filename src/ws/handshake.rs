//! HTTP/1.1 upgrade handshake for the client side of a WebSocket.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::TransportError;

/// Response heads larger than this are rejected.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Appended to the request key before hashing (RFC 6455 section 1.3).
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Where to connect and which extra headers to send.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub endpoint: EndpointConfig,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// The `Sec-WebSocket-Accept` value a server must send back for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Render the upgrade request head.
pub fn build_request(request: &UpgradeRequest, key: &str) -> String {
    let mut head = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        request.endpoint.path,
        request.endpoint.host_header(),
        key
    );
    for (name, value) in &request.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Check the status line of a response head. Only 101 is accepted.
pub fn check_response(head: &str) -> Result<(), TransportError> {
    let status_line = head.lines().next().unwrap_or_default().trim();
    let mut parts = status_line.split_whitespace();

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::MalformedResponse(format!(
            "unexpected status line {:?}",
            status_line
        )));
    }

    match parts.next().map(str::parse::<u16>) {
        Some(Ok(101)) => Ok(()),
        Some(Ok(_)) => Err(TransportError::HandshakeRejected {
            status_line: status_line.to_string(),
        }),
        _ => Err(TransportError::MalformedResponse(format!(
            "no status code in {:?}",
            status_line
        ))),
    }
}

/// Check that the response proves the server read our key.
pub fn check_accept(head: &str, key: &str) -> Result<(), TransportError> {
    let accept = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("sec-websocket-accept")
            .then(|| value.trim())
    });
    match accept {
        Some(value) if value == accept_key(key) => Ok(()),
        Some(value) => Err(TransportError::MalformedResponse(format!(
            "Sec-WebSocket-Accept {:?} does not match the request key",
            value
        ))),
        None => Err(TransportError::MalformedResponse(
            "missing Sec-WebSocket-Accept header".to_string(),
        )),
    }
}

/// Send the upgrade request and wait for `101 Switching Protocols`.
///
/// Returns any bytes that arrived after the response head; they belong to
/// the first frame.
pub async fn perform<S>(
    stream: &mut S,
    request: &UpgradeRequest,
    timeout: Duration,
) -> Result<BytesMut, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let head = build_request(request, &key);

    debug!("Sending upgrade request to {}", request.endpoint);
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_len = tokio::time::timeout(timeout, read_head(stream, &mut buf))
        .await
        .map_err(|_| TransportError::Timeout {
            what: "handshake response",
        })??;

    let response_head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
    check_response(&response_head)?;
    check_accept(&response_head, &key)?;

    let leftover = buf.split_off(head_len);
    info!("WebSocket connected to {}", request.endpoint);
    Ok(leftover)
}

/// Read until the blank line that ends the head; returns its length.
async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(pos);
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(TransportError::MalformedResponse(format!(
                "response head exceeds {} bytes",
                MAX_RESPONSE_HEAD
            )));
        }
        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Err(TransportError::Closed);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_custom_headers() {
        let request = UpgradeRequest::new(EndpointConfig::new("h.example", 443, "/api/v2/asr"))
            .header("x-api-key", "secret");
        let head = build_request(&request, "abc==");

        assert!(head.starts_with("GET /api/v2/asr HTTP/1.1\r\n"));
        assert!(head.contains("Host: h.example\r\n"));
        assert!(head.contains("Sec-WebSocket-Key: abc==\r\n"));
        assert!(head.contains("x-api-key: secret\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_status_line_checks() {
        assert!(check_response("HTTP/1.1 101 Switching Protocols\r\n\r\n").is_ok());
        assert!(matches!(
            check_response("HTTP/1.1 401 Unauthorized\r\n\r\n"),
            Err(TransportError::HandshakeRejected { .. })
        ));
        assert!(matches!(
            check_response("garbage"),
            Err(TransportError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_accept_key_matches_rfc_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_accept_header_is_verified() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let good = "HTTP/1.1 101 Switching Protocols\r\n\
                    sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(check_accept(good, key).is_ok());
        assert!(matches!(
            check_accept(good, "AAAAAAAAAAAAAAAAAAAAAA=="),
            Err(TransportError::MalformedResponse(_))
        ));
        assert!(matches!(
            check_accept("HTTP/1.1 101 Switching Protocols\r\n\r\n", key),
            Err(TransportError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_generated_keys_are_16_bytes() {
        let decoded = BASE64.decode(generate_key()).unwrap();
        assert_eq!(decoded.len(), 16);
    }
}
