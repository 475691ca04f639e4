//! The 4-byte envelope header and its nibble-sized fields.

use std::ops::BitOr;

/// Protocol version carried in the high nibble of byte 0.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte words for every message this crate emits.
pub const DEFAULT_HEADER_WORDS: u8 = 0b0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ClientFullRequest,
    ClientAudioOnly,
    ServerFullResponse,
    ServerAck,
    ServerError,
}

impl MessageType {
    /// `Ok(None)` for the reserved type 0, which receivers ignore.
    pub fn from_nibble(value: u8) -> Result<Option<Self>, u8> {
        match value {
            0b0000 => Ok(None),
            0b0001 => Ok(Some(MessageType::ClientFullRequest)),
            0b0010 => Ok(Some(MessageType::ClientAudioOnly)),
            0b1001 => Ok(Some(MessageType::ServerFullResponse)),
            0b1011 => Ok(Some(MessageType::ServerAck)),
            0b1111 => Ok(Some(MessageType::ServerError)),
            other => Err(other),
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            MessageType::ClientFullRequest => 0b0001,
            MessageType::ClientAudioOnly => 0b0010,
            MessageType::ServerFullResponse => 0b1001,
            MessageType::ServerAck => 0b1011,
            MessageType::ServerError => 0b1111,
        }
    }
}

/// Type-specific flag bits from the low nibble of byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: Self = Self(0b0000);
    /// A 4-byte sequence number follows the header.
    pub const HAS_SEQUENCE: Self = Self(0b0001);
    /// Last message of a stream.
    pub const NEGATIVE_SEQUENCE: Self = Self(0b0010);
    /// A 4-byte event id follows the header (and sequence, if any).
    pub const HAS_EVENT: Self = Self(0b0100);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    Raw,
    Json,
}

impl Serialization {
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0b0000 => Some(Serialization::Raw),
            0b0001 => Some(Serialization::Json),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Serialization::Raw => 0b0000,
            Serialization::Json => 0b0001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0b0000 => Some(Compression::None),
            0b0001 => Some(Compression::Gzip),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Compression::None => 0b0000,
            Compression::Gzip => 0b0001,
        }
    }
}
