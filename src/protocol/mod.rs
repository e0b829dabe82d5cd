//! Protocol implementation module
//!
//! This module defines the dialogue frame header, the closed message
//! catalog, encoding/decoding, and sequence bookkeeping.

pub mod codec;
pub mod header;
pub mod message;
pub mod sequence;

pub use self::codec::{checksum, EncodedFrame, FrameCodec, PreparedFrame};
pub use self::header::{flags, Compression, Header, Serialization, HEADER_SIZE};
pub use self::message::{
    AudioFrame,
    ChatTtsText,
    ClientRequest,
    Heartbeat,
    MessageBody,
    MessageType,
    ProtocolMessage,
    RequestEvent,
    ServerAck,
    ServerError,
    ServerResponse,
    SessionEnd,
    SessionStart,
    TtsTrigger,
};
pub use self::sequence::{SequenceAllocator, SequenceTracker, SequenceVerdict};
