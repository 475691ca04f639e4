// Integration tests for WebSocket framing
//
// These tests verify header length forms, incremental decoding, masking and
// how the decoder stays in sync when it has to drop a payload.

use anyhow::Result;
use bytes::BytesMut;
use loqa_voicelink::audio::MemoryPools;
use loqa_voicelink::ws::frame::{encode_frame_with_mask, MAX_HEADER_LEN};
use loqa_voicelink::ws::{encode_frame, DecodedFrame, DiscardReason, FrameDecoder, OpCode};
use loqa_voicelink::FrameError;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn decode_one(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<Option<DecodedFrame>> {
    let mut src = BytesMut::from(bytes);
    let decoded = decoder.decode(&mut src)?;
    assert!(src.is_empty(), "decoder left {} bytes behind", src.len());
    Ok(decoded)
}

#[test]
fn test_masked_frames_decode_at_every_length_form() -> Result<()> {
    for len in [0usize, 1, 125, 126, 65535, 65536] {
        let payload = patterned(len);
        let encoded = encode_frame(&payload, OpCode::Binary, true);
        let header_len = match len {
            0..=125 => 2,
            126..=65535 => 4,
            _ => 10,
        };
        assert_eq!(encoded.len(), header_len + 4 + len, "length {}", len);

        let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
        let Some(DecodedFrame::Frame(frame)) = decode_one(&mut decoder, &encoded)? else {
            panic!("length {} did not decode to a frame", len);
        };
        assert!(frame.fin);
        assert!(frame.masked);
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, payload, "length {}", len);
    }
    Ok(())
}

#[test]
fn test_mask_key_is_applied_from_offset_zero() -> Result<()> {
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let encoded = encode_frame_with_mask(b"Hello", OpCode::Text, true, Some(key));

    // Example from RFC 6455 section 5.7
    assert_eq!(
        encoded,
        vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
    );
    Ok(())
}

#[test]
fn test_byte_at_a_time_decoding() -> Result<()> {
    let payload = patterned(300);
    let mut stream = encode_frame(&payload, OpCode::Binary, true);
    stream.extend(encode_frame(b"second", OpCode::Text, false));

    let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
    let mut src = BytesMut::new();
    let mut frames = Vec::new();

    for byte in stream {
        src.extend_from_slice(&[byte]);
        while let Some(decoded) = decoder.decode(&mut src)? {
            frames.push(decoded);
        }
    }

    assert_eq!(frames.len(), 2);
    match &frames[0] {
        DecodedFrame::Frame(frame) => assert_eq!(frame.payload, payload),
        other => panic!("unexpected {:?}", other),
    }
    match &frames[1] {
        DecodedFrame::Frame(frame) => {
            assert_eq!(frame.opcode, OpCode::Text);
            assert!(!frame.masked);
            assert_eq!(frame.payload, b"second");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!decoder.is_mid_frame());
    Ok(())
}

#[test]
fn test_unallocatable_payload_is_drained_and_stream_stays_in_sync() -> Result<()> {
    // Both pools are too small for the first payload
    let pools = MemoryPools::new(1024, 1024);
    let mut decoder = FrameDecoder::new(pools);

    let mut stream = encode_frame(&patterned(4096), OpCode::Binary, false);
    stream.extend(encode_frame(b"after", OpCode::Binary, false));

    let mut src = BytesMut::from(&stream[..]);
    assert_eq!(
        decoder.decode(&mut src)?,
        Some(DecodedFrame::Discarded {
            opcode: OpCode::Binary.as_u8(),
            len: 4096,
            reason: DiscardReason::AllocationFailed,
        })
    );

    match decoder.decode(&mut src)? {
        Some(DecodedFrame::Frame(frame)) => assert_eq!(frame.payload, b"after"),
        other => panic!("expected the next frame, got {:?}", other),
    }
    assert!(src.is_empty());
    Ok(())
}

#[test]
fn test_discard_spans_partial_reads() -> Result<()> {
    let mut decoder = FrameDecoder::new(MemoryPools::unbounded()).with_max_payload(100);
    let oversized = encode_frame(&patterned(1000), OpCode::Binary, false);

    let mut src = BytesMut::from(&oversized[..500]);
    assert_eq!(decoder.decode(&mut src)?, None);
    assert!(src.is_empty(), "partial payload should be drained");
    assert!(decoder.is_mid_frame());

    src.extend_from_slice(&oversized[500..]);
    src.extend_from_slice(&encode_frame(b"ok", OpCode::Text, false));

    assert_eq!(
        decoder.decode(&mut src)?,
        Some(DecodedFrame::Discarded {
            opcode: OpCode::Binary.as_u8(),
            len: 1000,
            reason: DiscardReason::Oversized,
        })
    );
    match decoder.decode(&mut src)? {
        Some(DecodedFrame::Frame(frame)) => assert_eq!(frame.payload, b"ok"),
        other => panic!("expected the next frame, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_reserved_opcode_is_skipped() -> Result<()> {
    let mut stream = vec![0x83, 0x02, 0xaa, 0xbb];
    stream.extend(encode_frame(b"x", OpCode::Binary, false));

    let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
    let mut src = BytesMut::from(&stream[..]);

    assert_eq!(
        decoder.decode(&mut src)?,
        Some(DecodedFrame::Discarded {
            opcode: 0x3,
            len: 2,
            reason: DiscardReason::UnknownOpcode,
        })
    );
    assert!(matches!(decoder.decode(&mut src)?, Some(DecodedFrame::Frame(_))));
    Ok(())
}

#[test]
fn test_control_frame_violations_are_errors() {
    let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
    let long_ping = encode_frame(&[0u8; 126], OpCode::Ping, false);
    let mut src = BytesMut::from(&long_ping[..]);
    assert_eq!(
        decoder.decode(&mut src),
        Err(FrameError::ControlFrameTooLong(126))
    );

    let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
    let fragmented_close = encode_frame_with_mask(&[0x03, 0xe8], OpCode::Close, false, None);
    let mut src = BytesMut::from(&fragmented_close[..]);
    assert_eq!(
        decoder.decode(&mut src),
        Err(FrameError::FragmentedControl(OpCode::Close))
    );
}

#[test]
fn test_sixty_four_bit_length_with_high_bit_is_rejected() {
    let mut header = vec![0x82, 0x7f];
    header.extend_from_slice(&(1u64 << 63).to_be_bytes());
    assert_eq!(header.len(), MAX_HEADER_LEN - 4);

    let mut decoder = FrameDecoder::new(MemoryPools::unbounded());
    let mut src = BytesMut::from(&header[..]);
    assert_eq!(
        decoder.decode(&mut src),
        Err(FrameError::InvalidLength(1u64 << 63))
    );
}
