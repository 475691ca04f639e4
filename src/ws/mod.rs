//! Minimal WebSocket client: framing, reassembly, upgrade handshake and
//! the connection that ties them to a byte stream.

pub mod assembler;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod transport;

pub use assembler::{Message, MessageAssembler, MessageKind};
pub use connection::{ConnectionConfig, Inbound, WsConnection};
pub use frame::{
    encode_frame, DecodedFrame, DiscardReason, Frame, FrameDecoder, OpCode,
};
pub use handshake::UpgradeRequest;
pub use transport::{Connector, TcpConnector, TlsConnector};
