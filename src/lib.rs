//! Dialog Wire: real-time voice dialogue transport
//!
//! This library implements the binary framing, session state machine and
//! duplex audio pump used to hold a live spoken conversation with a remote
//! dialogue service over one persistent WebSocket.
pub mod audio;
pub mod core;
pub mod network;
pub mod protocol;
pub mod session;
pub mod util;

// Re-export commonly used items
pub use crate::audio::{AudioSink, AudioSource};
pub use crate::core::{
    AudioConfig,
    ClientConfig,
    ConnectConfig,
    ConnectionState,
    ConnectionStats,
    Error,
    ErrorKind,
    Result,
    SequencePolicy,
    SessionInfo,
};
pub use crate::network::ReconnectConfig;
pub use crate::protocol::{ChatTtsText, Compression, FrameCodec, MessageBody, MessageType, ProtocolMessage};
pub use crate::session::{AudioEvent, DialogClient, DialogEvent, ErrorEvent, EventRegistry, SubscriptionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
