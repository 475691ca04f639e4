// Integration tests for the recognizer client
//
// These tests verify the request/audio/end-marker sequence, client-side
// stop detection and the reconnect that follows a finished recording.

mod common;

use std::time::Duration;

use anyhow::{bail, Result};
use common::{ServerConn, TestServer};
use loqa_voicelink::audio::MemoryPools;
use loqa_voicelink::config::RecognizerConfig;
use loqa_voicelink::protocol::{
    decode, encode, MessageFlags, MessageType, Profile, ProtocolMessage, Serialization,
};
use loqa_voicelink::session::{
    EventReceiver, RecognizerClient, SessionConfig, SessionEvent, SessionState,
};
use loqa_voicelink::vad::{StopReason, VadConfig, STABILITY_THRESHOLD};
use loqa_voicelink::ws::{OpCode, TcpConnector};
use serde_json::{json, Value};

const END_OF_AUDIO: [u8; 8] = [0x11, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

fn recognizer(
    server: &TestServer,
    vad: VadConfig,
) -> Result<(RecognizerClient<TcpConnector>, EventReceiver)> {
    let settings = RecognizerConfig {
        endpoint: server.endpoint("/api/v2/asr")?,
        api_key: "asr-key".to_string(),
        cluster: "test_cluster".to_string(),
        uid: Some("tester".to_string()),
        ..RecognizerConfig::default()
    };
    Ok(RecognizerClient::new(
        TcpConnector::new(Duration::from_secs(2)),
        settings,
        vad,
        SessionConfig::default(),
        MemoryPools::unbounded(),
    ))
}

async fn read_message(conn: &mut ServerConn) -> Result<(Vec<u8>, ProtocolMessage)> {
    let frame = conn.read_data_frame().await?;
    match decode(&frame.payload, Profile::Simple)? {
        Some(msg) => Ok((frame.payload, msg)),
        None => bail!("client sent a type 0 message"),
    }
}

async fn read_full_request(conn: &mut ServerConn) -> Result<Value> {
    let (_, request) = read_message(conn).await?;
    assert_eq!(request.message_type, MessageType::ClientFullRequest);
    assert_eq!(request.serialization, Serialization::Json);
    Ok(request.parse_json()?)
}

async fn send_result(conn: &mut ServerConn, text: &str, last: bool) -> Result<()> {
    let body = json!({ "code": 1000, "result": [{ "text": text }] });
    let mut msg = ProtocolMessage::json(MessageType::ServerFullResponse, &body)?;
    if last {
        msg = msg.with_sequence(-2);
        msg.flags.insert(MessageFlags::NEGATIVE_SEQUENCE);
    }
    conn.send(OpCode::Binary, &encode(&msg, Profile::Simple)).await
}

async fn poll_until<F>(client: &mut RecognizerClient<TcpConnector>, mut done: F) -> Result<()>
where
    F: FnMut(&RecognizerClient<TcpConnector>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(&*client) {
        if tokio::time::Instant::now() > deadline {
            bail!("condition not reached, client is {}", client.state());
        }
        client.poll().await?;
    }
    Ok(())
}

fn drain(events: &mut EventReceiver) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_stable_transcript_ends_recording_and_next_start_reconnects() -> Result<()> {
    let mut server = TestServer::bind().await?;
    let (mut client, mut events) = recognizer(&server, VadConfig::default())?;

    let script = tokio::spawn(async move {
        let mut conn = server.accept().await?;
        assert_eq!(conn.header("x-api-key").as_deref(), Some("asr-key"));

        let request = read_full_request(&mut conn).await?;
        assert_eq!(request["app"]["cluster"], "test_cluster");
        assert_eq!(request["user"]["uid"], "tester");
        assert_eq!(request["audio"]["rate"], 16000);
        assert_eq!(request["audio"]["bits"], 16);

        let (_, batch) = read_message(&mut conn).await?;
        assert_eq!(batch.message_type, MessageType::ClientAudioOnly);
        assert_eq!(batch.payload.len(), 3200);
        assert_eq!(&batch.payload[..2], &1234i16.to_le_bytes());

        for _ in 0..STABILITY_THRESHOLD {
            send_result(&mut conn, "hello world", false).await?;
        }

        // Partial batch, then the end marker
        let (_, rest) = read_message(&mut conn).await?;
        assert_eq!(rest.payload.len(), 200);
        let (raw, end) = read_message(&mut conn).await?;
        assert_eq!(raw, END_OF_AUDIO);
        assert!(end.is_last());

        send_result(&mut conn, "Hello world.", true).await?;

        // The next recording must use a fresh connection
        let close = conn.read_frame().await?;
        assert_eq!(close.opcode, OpCode::Close);

        let mut second = server.accept().await?;
        read_full_request(&mut second).await?;
        let _ = second.read_frame().await;
        anyhow::Ok(server.accepted())
    });

    client.start_recording().await?;
    assert!(client.is_recording());
    client.send_samples(&vec![1234i16; 1700]).await?;

    poll_until(&mut client, |c| c.state() == SessionState::SessionEnding).await?;
    assert_eq!(client.recognized_text(), "hello world");

    let mut seen = drain(&mut events);
    poll_until(&mut client, |c| c.recognized_text() == "Hello world.").await?;
    seen.extend(drain(&mut events));

    assert!(seen.contains(&SessionEvent::RecordingStopped {
        reason: StopReason::Stable,
        text: "hello world".to_string(),
    }));
    assert!(seen.contains(&SessionEvent::RecognitionEnded {
        text: "Hello world.".to_string(),
    }));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, SessionEvent::Transcript { .. }))
            .count(),
        STABILITY_THRESHOLD as usize + 1
    );

    // Samples after the stop are ignored
    client.send_samples(&[1234; 1600]).await?;
    assert_eq!(client.stats().audio_bytes_sent, 3400);

    client.start_recording().await?;
    assert!(client.is_recording());
    assert_eq!(client.stats().connections, 2);

    client.disconnect().await?;
    assert_eq!(script.await??, 2);
    Ok(())
}

#[tokio::test]
async fn test_no_speech_times_out() -> Result<()> {
    let mut server = TestServer::bind().await?;
    let vad = VadConfig {
        silence_timeout: Duration::from_millis(1000),
        max_duration: Duration::from_millis(200),
    };
    let (mut client, mut events) = recognizer(&server, vad)?;

    let script = tokio::spawn(async move {
        let mut conn = server.accept().await?;
        read_full_request(&mut conn).await?;

        let body = json!({ "code": 1001, "message": "invalid audio format" });
        let msg = ProtocolMessage::json(MessageType::ServerFullResponse, &body)?;
        conn.send(OpCode::Binary, &encode(&msg, Profile::Simple)).await?;

        let (raw, _) = read_message(&mut conn).await?;
        assert_eq!(raw, END_OF_AUDIO);
        anyhow::Ok(())
    });

    client.start_recording().await?;
    // Sentinel samples never reach the wire
    client.send_samples(&[0, -1, 1, 0, 0]).await?;

    poll_until(&mut client, |c| c.state() == SessionState::SessionEnding).await?;
    script.await??;

    // The server hung up after the end marker; that is not an error
    poll_until(&mut client, |c| c.state() == SessionState::Disconnected).await?;
    client.poll().await?;

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::ServerError {
        code: Some(1001),
        message: "invalid audio format".to_string(),
    }));
    assert!(seen.contains(&SessionEvent::RecordingStopped {
        reason: StopReason::NoSpeech,
        text: String::new(),
    }));
    assert!(seen.contains(&SessionEvent::NoSpeechTimeout));
    assert_eq!(client.stats().audio_bytes_sent, 0);

    client.disconnect().await?;
    assert_eq!(client.state(), SessionState::Disconnected);
    Ok(())
}
