//! Core types shared by every layer of the dialogue transport
//!
//! Errors, configuration, connection state and statistics live here.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, ErrorKind, Result};
pub use self::types::{
    AudioConfig,
    ClientConfig,
    ConnectConfig,
    ConnectionState,
    ConnectionStats,
    SequencePolicy,
    SessionInfo,
};

/// Default ceiling on a single frame's payload (4 MiB)
pub const DEFAULT_MAX_FRAME_PAYLOAD: u32 = 4 * 1024 * 1024;
