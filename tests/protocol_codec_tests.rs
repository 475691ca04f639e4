// Integration tests for the binary session protocol
//
// These tests verify the envelope layout for both profiles, the handling of
// session ids on connection-scoped events and rejection of bad input.

use std::io::Write;

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use loqa_voicelink::protocol::events::{ClientEvent, ServerEvent};
use loqa_voicelink::protocol::{
    decode, encode, Compression, MessageFlags, MessageType, Profile, ProtocolMessage,
    Serialization,
};
use loqa_voicelink::ProtocolError;
use serde_json::json;

#[test]
fn test_session_event_layout() -> Result<()> {
    let msg = ProtocolMessage::json(MessageType::ClientFullRequest, &json!({}))?
        .with_event(ClientEvent::StartSession.id())
        .with_session("abc");
    let bytes = encode(&msg, Profile::EventSession);

    assert_eq!(&bytes[..4], &[0x11, 0x14, 0x10, 0x00]);
    assert_eq!(&bytes[4..8], &100i32.to_be_bytes());
    assert_eq!(&bytes[8..12], &3u32.to_be_bytes());
    assert_eq!(&bytes[12..15], b"abc");
    assert_eq!(&bytes[15..19], &2u32.to_be_bytes());
    assert_eq!(&bytes[19..], b"{}");

    let decoded = decode(&bytes, Profile::EventSession)?.expect("typed message");
    assert_eq!(decoded, msg);
    Ok(())
}

#[test]
fn test_connection_scoped_events_have_no_session_id() -> Result<()> {
    let start = ProtocolMessage::json(MessageType::ClientFullRequest, &json!({}))?
        .with_event(ClientEvent::StartConnection.id());
    let bytes = encode(&start, Profile::EventSession);
    // header, event id, payload length, payload
    assert_eq!(bytes.len(), 4 + 4 + 4 + 2);

    let started = ProtocolMessage::new(MessageType::ServerFullResponse, Serialization::Json)
        .with_event(ServerEvent::ConnectionStarted.id())
        .with_payload(b"{}".to_vec());
    let decoded = decode(&encode(&started, Profile::EventSession), Profile::EventSession)?.expect("typed message");
    assert_eq!(decoded.event_id, Some(50));
    assert_eq!(decoded.session_id, None);
    assert_eq!(decoded.payload, b"{}");
    Ok(())
}

#[test]
fn test_simple_profile_ignores_session_ids() -> Result<()> {
    // Under the simple profile an event flag never implies a session id
    let msg = ProtocolMessage::new(MessageType::ServerFullResponse, Serialization::Json)
        .with_event(ServerEvent::SessionStarted.id())
        .with_session("dropped")
        .with_payload(b"{\"a\":1}".to_vec());
    let bytes = encode(&msg, Profile::Simple);
    // header, event id, payload length, payload
    assert_eq!(bytes.len(), 4 + 4 + 4 + 7);

    let decoded = decode(&bytes, Profile::Simple)?.expect("typed message");
    assert_eq!(decoded.session_id, None);
    assert_eq!(decoded.payload, b"{\"a\":1}");
    Ok(())
}

#[test]
fn test_session_id_follows_the_decoder_rule() -> Result<()> {
    // A stray session id on a connection-scoped event is left off the wire
    let finish = ProtocolMessage::json(MessageType::ClientFullRequest, &json!({}))?
        .with_event(ClientEvent::FinishConnection.id())
        .with_session("abc");
    let decoded =
        decode(&encode(&finish, Profile::EventSession), Profile::EventSession)?.expect("typed message");
    assert_eq!(decoded.session_id, None);
    assert_eq!(decoded.payload, b"{}");

    // A session-scoped event without one still gets the length field
    let task = ProtocolMessage::new(MessageType::ClientAudioOnly, Serialization::Raw)
        .with_event(ClientEvent::TaskRequest.id())
        .with_payload(vec![1, 2, 3, 4]);
    let decoded =
        decode(&encode(&task, Profile::EventSession), Profile::EventSession)?.expect("typed message");
    assert_eq!(decoded.session_id.as_deref(), Some(""));
    assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn test_server_error_carries_code() -> Result<()> {
    let mut msg = ProtocolMessage::new(MessageType::ServerError, Serialization::Json)
        .with_payload(b"{\"error\":\"quota exceeded\"}".to_vec());
    msg.error_code = Some(45000001);

    let bytes = encode(&msg, Profile::Simple);
    assert_eq!(bytes[1] >> 4, 0b1111);
    assert_eq!(&bytes[4..8], &45000001u32.to_be_bytes());

    let decoded = decode(&bytes, Profile::Simple)?.expect("typed message");
    assert_eq!(decoded.error_code, Some(45000001));
    assert_eq!(decoded.payload, msg.payload);
    Ok(())
}

#[test]
fn test_sequence_and_last_flag() -> Result<()> {
    let mut msg = ProtocolMessage::new(MessageType::ServerFullResponse, Serialization::Json)
        .with_sequence(-3)
        .with_payload(b"{}".to_vec());
    msg.flags.insert(MessageFlags::NEGATIVE_SEQUENCE);

    let decoded = decode(&encode(&msg, Profile::Simple), Profile::Simple)?.expect("typed message");
    assert_eq!(decoded.sequence, Some(-3));
    assert!(decoded.is_last());
    Ok(())
}

#[test]
fn test_gzip_payload_is_inflated() -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(br#"{"code":1000,"result":[{"text":" hello "}]}"#)?;
    let compressed = encoder.finish()?;

    let mut msg = ProtocolMessage::new(MessageType::ServerFullResponse, Serialization::Json)
        .with_payload(compressed);
    msg.compression = Compression::Gzip;

    let decoded = decode(&encode(&msg, Profile::Simple), Profile::Simple)?.expect("typed message");
    let value: serde_json::Value = decoded.parse_json()?;
    assert_eq!(value["code"], 1000);
    assert_eq!(value["result"][0]["text"], " hello ");
    Ok(())
}

#[test]
fn test_type_zero_is_ignored() -> Result<()> {
    let bytes = [0x11, 0x00, 0x10, 0x00, 0, 0, 0, 0];
    assert!(decode(&bytes, Profile::EventSession)?.is_none());
    Ok(())
}

#[test]
fn test_malformed_input_is_rejected() {
    assert!(matches!(
        decode(&[0x11, 0x90], Profile::Simple),
        Err(ProtocolError::TruncatedMessage { .. })
    ));

    assert!(matches!(
        decode(&[0x11, 0x50, 0x10, 0x00, 0, 0, 0, 0], Profile::Simple),
        Err(ProtocolError::UnknownMessageType(0b0101))
    ));

    assert!(matches!(
        decode(&[0x10, 0x90, 0x10, 0x00, 0, 0, 0, 0], Profile::Simple),
        Err(ProtocolError::InvalidHeaderSize(0))
    ));

    // Payload length promises more than is present
    let mut short = vec![0x11, 0x90, 0x10, 0x00];
    short.extend_from_slice(&10u32.to_be_bytes());
    short.extend_from_slice(b"{}");
    assert!(matches!(
        decode(&short, Profile::Simple),
        Err(ProtocolError::TruncatedMessage { .. })
    ));
}

#[test]
fn test_invalid_session_id_is_rejected() {
    let mut bytes = vec![0x11, 0x94, 0x10, 0x00];
    bytes.extend_from_slice(&150i32.to_be_bytes());
    bytes.extend_from_slice(&2u32.to_be_bytes());
    bytes.extend_from_slice(&[0xff, 0xfe]);
    bytes.extend_from_slice(&0u32.to_be_bytes());

    assert!(matches!(
        decode(&bytes, Profile::EventSession),
        Err(ProtocolError::InvalidSessionId)
    ));
}
