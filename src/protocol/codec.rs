//! Envelope encoding and decoding for both protocol profiles.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::events::is_connection_scoped;
use super::header::{
    Compression, MessageFlags, MessageType, Serialization, DEFAULT_HEADER_WORDS,
    PROTOCOL_VERSION,
};
use crate::error::ProtocolError;

/// Which optional fields a peer puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Header, optional sequence / error code, payload.
    Simple,
    /// Adds event ids and session ids for session-scoped events.
    EventSession,
}

/// One decoded (or to-be-encoded) protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub version: u8,
    pub header_size_words: u8,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub error_code: Option<u32>,
    pub event_id: Option<i32>,
    pub session_id: Option<String>,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn new(message_type: MessageType, serialization: Serialization) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_size_words: DEFAULT_HEADER_WORDS,
            message_type,
            flags: MessageFlags::NONE,
            serialization,
            compression: Compression::None,
            sequence: None,
            error_code: None,
            event_id: None,
            session_id: None,
            payload: Vec::new(),
        }
    }

    /// A client-full request carrying `value` as JSON.
    pub fn json<T: Serialize>(message_type: MessageType, value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(message_type, Serialization::Json).with_payload(serde_json::to_vec(value)?))
    }

    /// A raw audio chunk.
    pub fn audio(chunk: Vec<u8>) -> Self {
        Self::new(MessageType::ClientAudioOnly, Serialization::Raw).with_payload(chunk)
    }

    /// Empty audio-only message flagged as the last of the stream.
    pub fn end_of_audio() -> Self {
        let mut msg = Self::new(MessageType::ClientAudioOnly, Serialization::Raw);
        msg.flags = MessageFlags::NEGATIVE_SEQUENCE;
        msg
    }

    pub fn with_event(mut self, event_id: i32) -> Self {
        self.flags.insert(MessageFlags::HAS_EVENT);
        self.event_id = Some(event_id);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.flags.insert(MessageFlags::HAS_SEQUENCE);
        self.sequence = Some(sequence);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// True when the negative-sequence flag marks the end of a stream.
    pub fn is_last(&self) -> bool {
        self.flags.contains(MessageFlags::NEGATIVE_SEQUENCE)
    }

    /// Payload with gzip compression removed.
    pub fn payload_bytes(&self) -> Result<Cow<'_, [u8]>, ProtocolError> {
        match self.compression {
            Compression::None => Ok(Cow::Borrowed(&self.payload)),
            Compression::Gzip => {
                let mut out = Vec::with_capacity(self.payload.len() * 2);
                GzDecoder::new(&self.payload[..])
                    .read_to_end(&mut out)
                    .map_err(ProtocolError::Decompress)?;
                Ok(Cow::Owned(out))
            }
        }
    }

    /// Deserialize the (decompressed) payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let bytes = self.payload_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Whether a session id follows the event id on the wire.
fn carries_session_id(profile: Profile, event_id: Option<i32>) -> bool {
    match (profile, event_id) {
        (Profile::EventSession, Some(event)) => !is_connection_scoped(event),
        _ => false,
    }
}

/// Serialize a message for a peer speaking `profile`. Extension header
/// words are written as zeros.
///
/// The session id is written exactly where [`decode`] expects one: under
/// the event/session profile for session-scoped events. A missing id there
/// is written as an empty string; anywhere else the id is left out.
pub fn encode(msg: &ProtocolMessage, profile: Profile) -> Vec<u8> {
    let header_len = msg.header_size_words.max(1) as usize * 4;
    let event_id = msg
        .flags
        .contains(MessageFlags::HAS_EVENT)
        .then(|| msg.event_id.unwrap_or_default());
    let with_session = carries_session_id(profile, event_id);
    let session_id = msg.session_id.as_deref().unwrap_or_default();
    if !with_session && !session_id.is_empty() {
        debug!("Session id {:?} not carried by {:?} message", session_id, event_id);
    }
    let session_len = if with_session { 4 + session_id.len() } else { 0 };
    let mut out = Vec::with_capacity(header_len + 16 + session_len + msg.payload.len());

    out.push((msg.version << 4) | (msg.header_size_words.max(1) & 0x0F));
    out.push((msg.message_type.nibble() << 4) | msg.flags.bits());
    out.push((msg.serialization.nibble() << 4) | msg.compression.nibble());
    out.push(0x00);
    out.resize(header_len, 0x00);

    if msg.flags.contains(MessageFlags::HAS_SEQUENCE) {
        out.extend_from_slice(&msg.sequence.unwrap_or_default().to_be_bytes());
    }
    if msg.message_type == MessageType::ServerError {
        out.extend_from_slice(&msg.error_code.unwrap_or_default().to_be_bytes());
    }
    if let Some(event) = event_id {
        out.extend_from_slice(&event.to_be_bytes());
    }
    if with_session {
        out.extend_from_slice(&(session_id.len() as u32).to_be_bytes());
        out.extend_from_slice(session_id.as_bytes());
    }

    out.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.payload);
    out
}

/// Parse a message received under `profile`.
///
/// Returns `Ok(None)` for message type 0, which carries nothing the client
/// acts on.
pub fn decode(bytes: &[u8], profile: Profile) -> Result<Option<ProtocolMessage>, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let header = cursor.take(4)?;

    let version = header[0] >> 4;
    let header_size_words = header[0] & 0x0F;
    if header_size_words == 0 {
        return Err(ProtocolError::InvalidHeaderSize(header_size_words));
    }

    let Some(message_type) =
        MessageType::from_nibble(header[1] >> 4).map_err(ProtocolError::UnknownMessageType)?
    else {
        return Ok(None);
    };
    let flags = MessageFlags::from_bits(header[1]);
    let serialization = Serialization::from_nibble(header[2] >> 4)
        .ok_or(ProtocolError::UnknownSerialization(header[2] >> 4))?;
    let compression = Compression::from_nibble(header[2] & 0x0F)
        .ok_or(ProtocolError::UnknownCompression(header[2] & 0x0F))?;

    // Skip header extension words
    cursor.take(header_size_words as usize * 4 - 4)?;

    let sequence = if flags.contains(MessageFlags::HAS_SEQUENCE) {
        Some(cursor.read_i32()?)
    } else {
        None
    };
    let error_code = if message_type == MessageType::ServerError {
        Some(cursor.read_u32()?)
    } else {
        None
    };
    let event_id = if flags.contains(MessageFlags::HAS_EVENT) {
        Some(cursor.read_i32()?)
    } else {
        None
    };

    let session_id = if carries_session_id(profile, event_id) {
        let len = cursor.read_u32()? as usize;
        let raw = cursor.take(len)?;
        Some(
            std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidSessionId)?
                .to_string(),
        )
    } else {
        None
    };

    let payload_len = cursor.read_u32()? as usize;
    let payload = cursor.take(payload_len)?.to_vec();

    Ok(Some(ProtocolMessage {
        version,
        header_size_words,
        message_type,
        flags,
        serialization,
        compression,
        sequence,
        error_code,
        event_id,
        session_id,
        payload,
    }))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(ProtocolError::TruncatedMessage {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_u32()? as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_audio_wire_bytes() {
        assert_eq!(
            encode(&ProtocolMessage::end_of_audio(), Profile::Simple),
            vec![0x11, 0x22, 0x00, 0x00, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_extension_words_are_skipped() {
        let mut msg = ProtocolMessage::new(MessageType::ServerFullResponse, Serialization::Json)
            .with_payload(b"{}".to_vec());
        msg.header_size_words = 2;
        let bytes = encode(&msg, Profile::Simple);
        assert_eq!(bytes.len(), 8 + 4 + 2);

        let decoded = decode(&bytes, Profile::Simple).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
