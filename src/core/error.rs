use std::io;
use thiserror::Error;

/// Custom error types for the dialogue transport
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed (code {code:?}): {reason}")]
    ConnectionClosed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer
        reason: String,
    },

    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required to make progress
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    #[error("Checksum mismatch: header says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum recomputed over the payload
        actual: u32,
    },

    #[error("Unsupported message type tag {0:#04x}")]
    UnsupportedMessageType(u8),

    #[error("Unsupported frame: {0}")]
    Unsupported(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Server error {code}: {message}")]
    Protocol {
        /// Error code reported by the remote service
        code: u32,
        /// Error message reported by the remote service
        message: String,
    },

    #[error("Invalid operation: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by error notifications and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection-level failure; fatal to the connection
    Transport,
    /// A single frame failed verification; local to that frame
    Integrity,
    /// The remote service reported an error
    Protocol,
    /// Operation invoked in a state that does not permit it
    Validation,
    /// Programmer or configuration error; never retryable
    Configuration,
    /// An awaited reply did not arrive in time
    Timeout,
    /// The caller cancelled the operation
    Cancelled,
}

impl Error {
    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new unsupported-frame error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Creates a new malformed-payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Creates a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Returns the taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Transport(_) | Error::ConnectionClosed { .. } => {
                ErrorKind::Transport
            }
            Error::Incomplete { .. }
            | Error::ChecksumMismatch { .. }
            | Error::UnsupportedMessageType(_)
            | Error::Unsupported(_)
            | Error::Malformed(_) => ErrorKind::Integrity,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Config(_) | Error::Encoder(_) => ErrorKind::Configuration,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether repeating the operation could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Whether this is the "not enough bytes yet" decode outcome
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionClosed {
                code: None,
                reason: err.to_string(),
            },
            WsError::Io(io_err) => Error::Io(io_err),
            other => Error::Transport(other.to_string()),
        }
    }
}
