//! Transport and connection supervision
//!
//! This module owns the WebSocket transport, heartbeat supervision,
//! reconnection backoff and the shared connection counters.

mod channel;
mod reconnect;
mod supervisor;

pub use self::channel::TransportChannel;
pub use self::reconnect::{ReconnectConfig, ReconnectState};
pub use self::supervisor::{ConnectionSupervisor, StatsRegistry, SupervisorExit};
