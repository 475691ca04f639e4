//! The binary session protocol carried inside WebSocket binary messages,
//! and the JSON messages of the synthesis service.

pub mod codec;
pub mod events;
pub mod header;
pub mod synthesis;

pub use codec::{decode, encode, Profile, ProtocolMessage};
pub use events::{ClientEvent, ServerEvent};
pub use header::{Compression, MessageFlags, MessageType, Serialization};
pub use synthesis::{SynthesisRequest, SynthesisResponse};
