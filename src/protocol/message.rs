use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::header::{Header, Serialization};
use crate::core::{Error, Result};

/// Type tag carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ClientFullRequest,
    ClientAudioOnly,
    Heartbeat,
    SessionStart,
    SessionEnd,
    TtsTrigger,
    ServerFullResponse,
    ServerAck,
    ServerErrorResponse,
}

impl MessageType {
    /// Every type in the catalog
    pub const ALL: [MessageType; 9] = [
        MessageType::ClientFullRequest,
        MessageType::ClientAudioOnly,
        MessageType::Heartbeat,
        MessageType::SessionStart,
        MessageType::SessionEnd,
        MessageType::TtsTrigger,
        MessageType::ServerFullResponse,
        MessageType::ServerAck,
        MessageType::ServerErrorResponse,
    ];

    /// Wire tag
    pub fn tag(self) -> u8 {
        match self {
            MessageType::ClientFullRequest => 0x01,
            MessageType::ClientAudioOnly => 0x02,
            MessageType::Heartbeat => 0x03,
            MessageType::SessionStart => 0x04,
            MessageType::SessionEnd => 0x05,
            MessageType::TtsTrigger => 0x06,
            MessageType::ServerFullResponse => 0x09,
            MessageType::ServerAck => 0x0B,
            MessageType::ServerErrorResponse => 0x0F,
        }
    }

    /// Maps a wire tag back to its type
    pub fn from_tag(tag: u8) -> Result<Self> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|kind| kind.tag() == tag)
            .ok_or(Error::UnsupportedMessageType(tag))
    }

    /// The only serialization this type may travel with
    pub fn serialization(self) -> Serialization {
        match self {
            MessageType::ClientAudioOnly => Serialization::Raw,
            _ => Serialization::Json,
        }
    }

    /// Snake-case name used in logs and dialog events
    pub fn name(self) -> &'static str {
        match self {
            MessageType::ClientFullRequest => "client_full_request",
            MessageType::ClientAudioOnly => "client_audio_only",
            MessageType::Heartbeat => "heartbeat",
            MessageType::SessionStart => "session_start",
            MessageType::SessionEnd => "session_end",
            MessageType::TtsTrigger => "tts_trigger",
            MessageType::ServerFullResponse => "server_full_response",
            MessageType::ServerAck => "server_ack",
            MessageType::ServerErrorResponse => "server_error_response",
        }
    }
}

/// What a full client request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEvent {
    /// Ask the service to greet the user
    SayHello,
    /// Free-form text query
    ChatQuery,
}

/// Structured client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub session_id: String,
    pub event: RequestEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Raw PCM chunk
///
/// The sequence is not part of the payload; it travels in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// PCM bytes
    pub data: Bytes,
    /// Caller-chosen sequence, used for retransmission
    pub sequence: Option<u32>,
}

impl AudioFrame {
    /// Creates a frame that takes the next allocated sequence
    pub fn new(data: impl Into<Bytes>) -> Self {
        AudioFrame {
            data: data.into(),
            sequence: None,
        }
    }

    /// Creates a frame that carries an explicit sequence
    pub fn with_sequence(data: impl Into<Bytes>, sequence: u32) -> Self {
        AudioFrame {
            data: data.into(),
            sequence: Some(sequence),
        }
    }
}

/// Structured server response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Server acknowledgement, optionally carrying synthesized audio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Sequence of the client frame being acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_sequence: Option<u32>,
    /// Audio bytes, base64 inside the JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(serialize_with = "crate::core::serde::serialize_base64_opt")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_base64_opt")]
    pub audio: Option<Vec<u8>>,
}

/// Error reported by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub code: u32,
    pub message: String,
}

/// Presence signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's Unix time in milliseconds
    pub timestamp_ms: u64,
}

/// Opens a dialogue session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Closes a dialogue session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub session_id: String,
}

/// Text the service should speak verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTtsText {
    /// Text fragment
    pub content: String,
    /// First fragment of an utterance
    #[serde(default)]
    pub start: bool,
    /// Last fragment of an utterance
    #[serde(default)]
    pub end: bool,
}

/// Session-scoped TTS trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsTrigger {
    pub session_id: String,
    #[serde(flatten)]
    pub text: ChatTtsText,
}

/// Closed set of protocol message bodies
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    ClientFullRequest(ClientRequest),
    ClientAudioOnly(AudioFrame),
    ServerFullResponse(ServerResponse),
    ServerAck(ServerAck),
    ServerErrorResponse(ServerError),
    Heartbeat(Heartbeat),
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    TtsTrigger(TtsTrigger),
}

impl MessageBody {
    /// Type tag for this body
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::ClientFullRequest(_) => MessageType::ClientFullRequest,
            MessageBody::ClientAudioOnly(_) => MessageType::ClientAudioOnly,
            MessageBody::ServerFullResponse(_) => MessageType::ServerFullResponse,
            MessageBody::ServerAck(_) => MessageType::ServerAck,
            MessageBody::ServerErrorResponse(_) => MessageType::ServerErrorResponse,
            MessageBody::Heartbeat(_) => MessageType::Heartbeat,
            MessageBody::SessionStart(_) => MessageType::SessionStart,
            MessageBody::SessionEnd(_) => MessageType::SessionEnd,
            MessageBody::TtsTrigger(_) => MessageType::TtsTrigger,
        }
    }

    /// Session the body refers to, if it names one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            MessageBody::ClientFullRequest(req) => Some(&req.session_id),
            MessageBody::ServerFullResponse(resp) => resp.session_id.as_deref(),
            MessageBody::ServerAck(ack) => ack.session_id.as_deref(),
            MessageBody::ServerErrorResponse(err) => err.session_id.as_deref(),
            MessageBody::SessionStart(start) => Some(&start.session_id),
            MessageBody::SessionEnd(end) => Some(&end.session_id),
            MessageBody::TtsTrigger(tts) => Some(&tts.session_id),
            MessageBody::ClientAudioOnly(_) | MessageBody::Heartbeat(_) => None,
        }
    }

    /// Serializes the payload, before compression
    pub(crate) fn to_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            MessageBody::ClientAudioOnly(frame) => return Ok(frame.data.to_vec()),
            MessageBody::ClientFullRequest(body) => serde_json::to_vec(body)?,
            MessageBody::ServerFullResponse(body) => serde_json::to_vec(body)?,
            MessageBody::ServerAck(body) => serde_json::to_vec(body)?,
            MessageBody::ServerErrorResponse(body) => serde_json::to_vec(body)?,
            MessageBody::Heartbeat(body) => serde_json::to_vec(body)?,
            MessageBody::SessionStart(body) => serde_json::to_vec(body)?,
            MessageBody::SessionEnd(body) => serde_json::to_vec(body)?,
            MessageBody::TtsTrigger(body) => serde_json::to_vec(body)?,
        };
        Ok(payload)
    }

    /// Rebuilds a body from a decompressed payload.
    ///
    /// Audio is copied out so the receive buffer is never shared with
    /// subscribers.
    pub(crate) fn from_payload(header: &Header, payload: &[u8]) -> Result<Self> {
        let body = match header.message_type {
            MessageType::ClientAudioOnly => MessageBody::ClientAudioOnly(AudioFrame {
                data: Bytes::copy_from_slice(payload),
                sequence: header.has_sequence_override().then_some(header.sequence),
            }),
            MessageType::ClientFullRequest => {
                MessageBody::ClientFullRequest(serde_json::from_slice(payload)?)
            }
            MessageType::ServerFullResponse => {
                MessageBody::ServerFullResponse(serde_json::from_slice(payload)?)
            }
            MessageType::ServerAck => MessageBody::ServerAck(serde_json::from_slice(payload)?),
            MessageType::ServerErrorResponse => {
                MessageBody::ServerErrorResponse(serde_json::from_slice(payload)?)
            }
            MessageType::Heartbeat => MessageBody::Heartbeat(serde_json::from_slice(payload)?),
            MessageType::SessionStart => {
                MessageBody::SessionStart(serde_json::from_slice(payload)?)
            }
            MessageType::SessionEnd => MessageBody::SessionEnd(serde_json::from_slice(payload)?),
            MessageType::TtsTrigger => MessageBody::TtsTrigger(serde_json::from_slice(payload)?),
        };
        Ok(body)
    }

    /// JSON view of a structured body, used for dialog events
    pub fn to_json_value(&self) -> serde_json::Value {
        let value = match self {
            MessageBody::ClientAudioOnly(frame) => {
                return serde_json::json!({ "audio_bytes": frame.data.len() })
            }
            MessageBody::ClientFullRequest(body) => serde_json::to_value(body),
            MessageBody::ServerFullResponse(body) => serde_json::to_value(body),
            MessageBody::ServerAck(body) => serde_json::to_value(body),
            MessageBody::ServerErrorResponse(body) => serde_json::to_value(body),
            MessageBody::Heartbeat(body) => serde_json::to_value(body),
            MessageBody::SessionStart(body) => serde_json::to_value(body),
            MessageBody::SessionEnd(body) => serde_json::to_value(body),
            MessageBody::TtsTrigger(body) => serde_json::to_value(body),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// A decoded frame: header plus body
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub header: Header,
    pub body: MessageBody,
}

impl ProtocolMessage {
    /// Type tag of this message
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Sequence number from the header
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }
}
