//! Reassembly of fragmented data messages.

use tracing::{debug, warn};

use super::frame::{Frame, OpCode};

/// Default cap on a reassembled fragmented message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }
}

#[derive(Debug)]
struct Partial {
    kind: MessageKind,
    payload: Vec<u8>,
}

/// Joins data frames into messages.
///
/// Unfragmented frames pass straight through. Fragmented messages are
/// bounded by `max_size`; one that grows past it is dropped, and its
/// remaining continuation frames are skipped.
#[derive(Debug)]
pub struct MessageAssembler {
    max_size: usize,
    partial: Option<Partial>,
    skipping: bool,
}

impl MessageAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            partial: None,
            skipping: false,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.partial.is_some() || self.skipping
    }

    /// Feed one data frame; returns a message when one completes.
    pub fn push(&mut self, frame: Frame) -> Option<Message> {
        let kind = match frame.opcode {
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
            OpCode::Continuation => return self.push_continuation(frame),
            other => {
                debug!("Assembler ignoring control frame {:?}", other);
                return None;
            }
        };

        if self.is_assembling() {
            warn!("New {:?} message interrupted a fragmented message, dropping it", kind);
            self.partial = None;
            self.skipping = false;
        }

        if frame.fin {
            return Some(Message {
                kind,
                payload: frame.payload,
            });
        }

        if frame.payload.len() > self.max_size {
            warn!(
                "Fragmented message exceeds {} bytes on first frame, skipping",
                self.max_size
            );
            self.skipping = true;
        } else {
            self.partial = Some(Partial {
                kind,
                payload: frame.payload,
            });
        }
        None
    }

    fn push_continuation(&mut self, frame: Frame) -> Option<Message> {
        if self.skipping {
            if frame.fin {
                self.skipping = false;
            }
            return None;
        }

        let Some(mut partial) = self.partial.take() else {
            warn!("Continuation frame without a message in progress, dropping");
            return None;
        };

        if partial.payload.len() + frame.payload.len() > self.max_size {
            warn!(
                "Fragmented message exceeds {} bytes, dropping",
                self.max_size
            );
            self.skipping = !frame.fin;
            return None;
        }

        partial.payload.extend_from_slice(&frame.payload);
        if frame.fin {
            Some(Message {
                kind: partial.kind,
                payload: partial.payload,
            })
        } else {
            self.partial = Some(partial);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            masked: false,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_fragments_are_joined() {
        let mut assembler = MessageAssembler::new(64);
        assert_eq!(assembler.push(fragment(OpCode::Text, false, b"{\"a\":")), None);
        assert_eq!(assembler.push(fragment(OpCode::Continuation, false, b"1")), None);
        let message = assembler
            .push(fragment(OpCode::Continuation, true, b"}"))
            .unwrap();
        assert_eq!(message, Message::text(&b"{\"a\":1}"[..]));
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_oversized_message_is_skipped_until_fin() {
        let mut assembler = MessageAssembler::new(4);
        assert_eq!(assembler.push(fragment(OpCode::Binary, false, b"abc")), None);
        assert_eq!(assembler.push(fragment(OpCode::Continuation, false, b"de")), None);
        assert_eq!(assembler.push(fragment(OpCode::Continuation, true, b"f")), None);

        // Next message is delivered normally
        let message = assembler.push(fragment(OpCode::Binary, true, b"ok")).unwrap();
        assert_eq!(message.payload, b"ok");
    }

    #[test]
    fn test_orphan_continuation_is_dropped() {
        let mut assembler = MessageAssembler::new(16);
        assert_eq!(assembler.push(fragment(OpCode::Continuation, true, b"x")), None);
    }
}
