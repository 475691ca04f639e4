//! RFC 6455 frame encoding and incremental decoding.
//!
//! The decoder works over a `BytesMut` the connection keeps filling and
//! returns `Ok(None)` whenever it needs more bytes. Once a header is parsed
//! the declared payload is always consumed in full, either into a pooled
//! buffer or into the void, so the stream stays aligned on frame
//! boundaries even when the payload is dropped.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::audio::alloc::{MemoryPools, PooledBuffer};
use crate::error::FrameError;

/// Largest payload the decoder will buffer by default.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 1_000_000;

/// Largest possible frame header (2 + 8 extended length + 4 mask).
pub const MAX_HEADER_LEN: usize = 14;

const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, masked frame as a client would send it.
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: true,
            payload,
        }
    }
}

/// Why a frame's payload was consumed without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Declared length is above the decoder's payload limit.
    Oversized,
    /// Neither memory pool could hold the payload.
    AllocationFailed,
    /// Reserved opcode; no extension was negotiated.
    UnknownOpcode,
}

/// Output of [`FrameDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Frame(Frame),
    Discarded {
        opcode: u8,
        len: u64,
        reason: DiscardReason,
    },
}

/// Encode a single final frame. Client frames must be masked.
pub fn encode_frame(payload: &[u8], opcode: OpCode, masked: bool) -> Vec<u8> {
    let mask = masked.then(rand::random::<[u8; 4]>);
    encode_frame_with_mask(payload, opcode, true, mask)
}

/// Encode a frame with an explicit FIN bit and mask key.
pub fn encode_frame_with_mask(
    payload: &[u8],
    opcode: OpCode,
    fin: bool,
    mask: Option<[u8; 4]>,
) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(MAX_HEADER_LEN + len);

    let fin_bit = if fin { 0x80 } else { 0x00 };
    out.push(fin_bit | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }

    out
}

/// XOR `buf` with the 4-byte key, starting at key offset 0.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    len: u64,
}

#[derive(Debug)]
enum DecodeState {
    Header,
    Payload {
        header: FrameHeader,
        opcode: OpCode,
        buf: PooledBuffer,
    },
    Discard {
        opcode: u8,
        len: u64,
        remaining: u64,
        reason: DiscardReason,
    },
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    pools: Arc<MemoryPools>,
    max_payload: usize,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new(pools: Arc<MemoryPools>) -> Self {
        Self {
            pools,
            max_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            state: DecodeState::Header,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// True while a header has been consumed but its payload has not.
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, DecodeState::Header)
    }

    /// Decode at most one frame from `src`, consuming the bytes it uses.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodedFrame>, FrameError> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Header) {
                DecodeState::Header => {
                    let Some(header) = parse_header(src)? else {
                        return Ok(None);
                    };
                    self.state = self.begin_payload(header)?;
                    if let Some(done) = self.try_complete() {
                        return Ok(Some(done));
                    }
                }
                DecodeState::Payload {
                    header,
                    opcode,
                    mut buf,
                } => {
                    let take = buf.remaining().min(src.len());
                    buf.extend_from_slice(&src[..take]);
                    src.advance(take);
                    self.state = DecodeState::Payload {
                        header,
                        opcode,
                        buf,
                    };
                    match self.try_complete() {
                        Some(done) => return Ok(Some(done)),
                        None => return Ok(None),
                    }
                }
                DecodeState::Discard {
                    opcode,
                    len,
                    remaining,
                    reason,
                } => {
                    let take = remaining.min(src.len() as u64);
                    src.advance(take as usize);
                    self.state = DecodeState::Discard {
                        opcode,
                        len,
                        remaining: remaining - take,
                        reason,
                    };
                    match self.try_complete() {
                        Some(done) => return Ok(Some(done)),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    fn begin_payload(&self, header: FrameHeader) -> Result<DecodeState, FrameError> {
        let discard = |reason| DecodeState::Discard {
            opcode: header.opcode,
            len: header.len,
            remaining: header.len,
            reason,
        };

        let Some(opcode) = OpCode::from_u8(header.opcode) else {
            warn!("Discarding frame with reserved opcode {:#x}", header.opcode);
            return Ok(discard(DiscardReason::UnknownOpcode));
        };

        if opcode.is_control() {
            if !header.fin {
                return Err(FrameError::FragmentedControl(opcode));
            }
            if header.len > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLong(header.len));
            }
        }

        if header.len > self.max_payload as u64 {
            warn!(
                "Discarding {:?} frame of {} bytes (limit {})",
                opcode, header.len, self.max_payload
            );
            return Ok(discard(DiscardReason::Oversized));
        }

        match self.pools.try_allocate(header.len as usize) {
            Some(buf) => Ok(DecodeState::Payload {
                header,
                opcode,
                buf,
            }),
            None => {
                warn!(
                    "No pool can hold {} byte {:?} payload, draining it",
                    header.len, opcode
                );
                Ok(discard(DiscardReason::AllocationFailed))
            }
        }
    }

    /// Finish the current frame if its payload is complete.
    fn try_complete(&mut self) -> Option<DecodedFrame> {
        let complete = match &self.state {
            DecodeState::Header => false,
            DecodeState::Payload { buf, .. } => buf.remaining() == 0,
            DecodeState::Discard { remaining, .. } => *remaining == 0,
        };
        if !complete {
            return None;
        }

        match std::mem::replace(&mut self.state, DecodeState::Header) {
            DecodeState::Payload {
                header,
                opcode,
                mut buf,
            } => {
                if let Some(key) = header.mask {
                    apply_mask(buf.as_mut_slice(), key);
                }
                Some(DecodedFrame::Frame(Frame {
                    fin: header.fin,
                    opcode,
                    masked: header.mask.is_some(),
                    payload: buf.into_vec(),
                }))
            }
            DecodeState::Discard {
                opcode,
                len,
                reason,
                ..
            } => Some(DecodedFrame::Discarded {
                opcode,
                len,
                reason,
            }),
            DecodeState::Header => None,
        }
    }
}

/// Parse a complete header from the front of `src`, or leave it untouched.
fn parse_header(src: &mut BytesMut) -> Result<Option<FrameHeader>, FrameError> {
    if src.len() < 2 {
        return Ok(None);
    }

    let b0 = src[0];
    let b1 = src[1];

    let reserved = b0 & 0x70;
    if reserved != 0 {
        return Err(FrameError::ReservedBits(reserved));
    }

    let masked = b1 & 0x80 != 0;
    let ext_len = match b1 & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let needed = 2 + ext_len + if masked { 4 } else { 0 };
    if src.len() < needed {
        return Ok(None);
    }

    let len = match ext_len {
        2 => u16::from_be_bytes([src[2], src[3]]) as u64,
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            len
        }
        _ => (b1 & 0x7F) as u64,
    };

    let mask = masked.then(|| {
        let at = 2 + ext_len;
        [src[at], src[at + 1], src[at + 2], src[at + 3]]
    });

    src.advance(needed);

    Ok(Some(FrameHeader {
        fin: b0 & 0x80 != 0,
        opcode: b0 & 0x0F,
        mask,
        len,
    }))
}
