use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::network::ReconnectConfig;
use crate::protocol::Compression;

/// Lifecycle of one dialogue connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport being opened
    Connecting,
    /// Transport open, no session
    Connected,
    /// Transport open and a session is running
    SessionActive,
    /// Teardown in progress
    Closing,
}

impl ConnectionState {
    /// Projects the state onto the connection level reported to subscribers.
    ///
    /// Session activity and teardown ride on an open transport, so both map
    /// to `Connected`.
    pub fn connection_level(self) -> Self {
        match self {
            ConnectionState::SessionActive | ConnectionState::Closing => ConnectionState::Connected,
            other => other,
        }
    }

    /// Whether the transport is open
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::SessionActive
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::SessionActive => "session_active",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Snapshot of the active dialogue session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Caller-chosen session identifier
    pub session_id: String,
    /// When the server acknowledged the session
    pub started_at: DateTime<Utc>,
    /// Configuration sent with the session start
    pub config: serde_json::Value,
}

/// How inbound sequence numbers are policed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// Accept duplicates and reordering silently
    Lenient,
    /// Accept, but log and count
    Warn,
    /// Drop the frame and report an integrity error
    Reject,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        SequencePolicy::Warn
    }
}

/// PCM format and pump sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Bytes per captured chunk
    pub chunk_bytes: usize,
    /// Maximum chunks waiting for the output sink
    pub playback_capacity: usize,
}

impl AudioConfig {
    /// Playback time covered by one chunk
    pub fn chunk_duration(&self) -> Duration {
        let bytes_per_second = self.sample_rate as u64
            * self.channels as u64
            * (self.bits_per_sample as u64 / 8).max(1);
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.chunk_bytes as u64 * 1_000_000 / bytes_per_second)
    }

    /// Checks the values make sense together
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.bits_per_sample == 0 {
            return Err(Error::config("audio format fields must be non-zero"));
        }
        if self.bits_per_sample % 8 != 0 {
            return Err(Error::config("bits_per_sample must be a multiple of 8"));
        }
        if self.chunk_bytes == 0 {
            return Err(Error::config("chunk_bytes must be non-zero"));
        }
        if self.playback_capacity == 0 {
            return Err(Error::config("playback_capacity must be non-zero"));
        }
        Ok(())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
            chunk_bytes: 3200,
            playback_capacity: 32,
        }
    }
}

/// Configuration for a dialogue client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long `start_session` waits for the server's acknowledgement
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub request_timeout: Duration,
    /// Upper bound on the best-effort session end send
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub finish_timeout: Duration,
    /// Heartbeat period while connected
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// Compression for JSON control frames
    pub compression: Compression,
    /// Compression for outbound audio frames
    pub audio_compression: Compression,
    /// Inbound sequence handling
    pub sequence_policy: SequencePolicy,
    /// Largest payload accepted in a single frame
    pub max_frame_payload: u32,
    /// Automatic reconnection
    pub reconnect: ReconnectConfig,
    /// Audio format and pump sizing
    pub audio: AudioConfig,
}

impl ClientConfig {
    /// Parses a TOML document; absent keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(text).map_err(|e| Error::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values make sense together
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be non-zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat_interval must be non-zero"));
        }
        if self.max_frame_payload == 0 {
            return Err(Error::config("max_frame_payload must be non-zero"));
        }
        self.reconnect.validate()?;
        self.audio.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout: Duration::from_secs(5),
            finish_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            compression: Compression::None,
            audio_compression: Compression::None,
            sequence_policy: SequencePolicy::default(),
            max_frame_payload: super::DEFAULT_MAX_FRAME_PAYLOAD,
            reconnect: ReconnectConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

/// Where and how to open the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// WebSocket endpoint, e.g. `wss://host/api/v3/realtime/dialogue`
    pub endpoint: String,
    /// Extra handshake headers (credentials, resource ids)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Upper bound on the handshake
    #[serde(default = "default_connect_timeout")]
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ConnectConfig {
    /// Creates a config for an endpoint with no extra headers
    pub fn new(endpoint: impl Into<String>) -> Self {
        ConnectConfig {
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Adds a handshake header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Read-only snapshot of connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub integrity_failures: u64,
    pub out_of_order_frames: u64,
    pub server_errors: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_replies: u64,
    pub missed_heartbeats: u64,
    pub playback_frames_dropped: u64,
    pub reconnect_count: u64,
    /// Unix milliseconds of the last heartbeat sent
    pub last_heartbeat_sent_ms: Option<u64>,
    /// Round trip measured from the last heartbeat reply
    pub last_heartbeat_rtt_ms: Option<u64>,
}

impl ConnectionStats {
    /// Named-counter view; unset timings are omitted
    pub fn as_map(&self) -> BTreeMap<&'static str, u64> {
        let mut map = BTreeMap::from([
            ("bytes_sent", self.bytes_sent),
            ("bytes_received", self.bytes_received),
            ("frames_sent", self.frames_sent),
            ("frames_received", self.frames_received),
            ("integrity_failures", self.integrity_failures),
            ("out_of_order_frames", self.out_of_order_frames),
            ("server_errors", self.server_errors),
            ("heartbeats_sent", self.heartbeats_sent),
            ("heartbeat_replies", self.heartbeat_replies),
            ("missed_heartbeats", self.missed_heartbeats),
            ("playback_frames_dropped", self.playback_frames_dropped),
            ("reconnect_count", self.reconnect_count),
        ]);
        if let Some(sent) = self.last_heartbeat_sent_ms {
            map.insert("last_heartbeat_sent_ms", sent);
        }
        if let Some(rtt) = self.last_heartbeat_rtt_ms {
            map.insert("last_heartbeat_rtt_ms", rtt);
        }
        map
    }
}
