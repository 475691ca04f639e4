pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod vad;
pub mod ws;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioRing,
    AudioSource, MemoryPools, NullSink, PlaybackSink, WavFileSink,
};
pub use config::Config;
pub use error::{
    AllocationError, FrameError, ProtocolError, Result, SessionError, TransportError,
};
pub use session::{
    ActivePhase, DialogClient, EventReceiver, RecognizerClient, SessionConfig, SessionEvent,
    SessionState, SessionStats, SynthesizerClient,
};
pub use vad::{StopReason, VadConfig, VoiceActivityController};
pub use ws::{Connector, TcpConnector, TlsConnector};
