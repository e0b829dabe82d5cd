//! Heartbeat timer and connection statistics.
//!
//! The supervisor sends an uncompressed heartbeat every interval while the
//! connection is up. A missing reply only counts against the statistics,
//! unless a missed-heartbeat limit is configured.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::TransportChannel;
use crate::core::{ConnectionStats, Error};
use crate::protocol::{Compression, FrameCodec, Heartbeat, MessageBody, Serialization};
use crate::util::unix_millis;

/// Counters shared by the channel, the state machine and the supervisor.
///
/// Writers take the lock briefly; readers copy a snapshot.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    stats: RwLock<ConnectionStats>,
}

impl StatsRegistry {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counters
    pub fn snapshot(&self) -> ConnectionStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies an update under the write lock
    pub fn update(&self, apply: impl FnOnce(&mut ConnectionStats)) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut stats);
    }

    /// Records one outbound frame
    pub fn record_sent(&self, bytes: usize) {
        self.update(|stats| {
            stats.bytes_sent += bytes as u64;
            stats.frames_sent += 1;
        });
    }

    /// Records inbound transport bytes
    pub fn record_received_bytes(&self, bytes: usize) {
        self.update(|stats| stats.bytes_received += bytes as u64);
    }

    /// Records a heartbeat from the peer.
    ///
    /// A reply echoing our last timestamp yields a round-trip measurement.
    pub fn record_heartbeat_reply(&self, timestamp_ms: u64) {
        let now = unix_millis();
        self.update(|stats| {
            stats.heartbeat_replies += 1;
            if stats.last_heartbeat_sent_ms == Some(timestamp_ms) {
                stats.last_heartbeat_rtt_ms = Some(now.saturating_sub(timestamp_ms));
            }
        });
    }
}

/// Why the supervisor stopped
#[derive(Debug)]
pub enum SupervisorExit {
    /// The connection scope was cancelled
    Cancelled,
    /// Too many consecutive intervals passed without inbound traffic
    HeartbeatTimeout,
    /// Writing a heartbeat failed
    TransportFailed(Error),
}

/// Drives heartbeats for one connection
pub struct ConnectionSupervisor {
    stats: Arc<StatsRegistry>,
    interval: Duration,
    max_missed: Option<u32>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor; `max_missed` of `None` never gives up
    pub fn new(stats: Arc<StatsRegistry>, interval: Duration, max_missed: Option<u32>) -> Self {
        ConnectionSupervisor {
            stats,
            interval,
            max_missed,
        }
    }

    /// Runs until cancelled or the connection is judged dead
    pub async fn run(
        self,
        codec: FrameCodec,
        channel: Arc<TransportChannel>,
        cancel: CancellationToken,
    ) -> SupervisorExit {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut frames_seen = self.stats.snapshot().frames_received;
        let mut sent_any = false;
        let mut consecutive_missed = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SupervisorExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let frames_now = self.stats.snapshot().frames_received;
            if sent_any && frames_now == frames_seen {
                consecutive_missed += 1;
                self.stats.update(|stats| stats.missed_heartbeats += 1);
                warn!(consecutive_missed, "no inbound traffic since last heartbeat");
            } else {
                consecutive_missed = 0;
            }
            frames_seen = frames_now;

            if let Some(limit) = self.max_missed {
                if consecutive_missed >= limit {
                    return SupervisorExit::HeartbeatTimeout;
                }
            }

            let timestamp_ms = unix_millis();
            let body = MessageBody::Heartbeat(Heartbeat { timestamp_ms });
            let prepared = match codec.prepare(&body, Compression::None, Serialization::Json) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(error = %e, "failed to encode heartbeat");
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SupervisorExit::Cancelled,
                sent = channel.send_with(|| {
                    let frame = codec.stamp(&prepared);
                    (frame.bytes, frame.header.sequence)
                }) => sent,
            };
            match sent {
                Ok(sequence) => {
                    sent_any = true;
                    self.stats.update(|stats| {
                        stats.heartbeats_sent += 1;
                        stats.last_heartbeat_sent_ms = Some(timestamp_ms);
                    });
                    debug!(sequence, "heartbeat sent");
                }
                Err(e) => return SupervisorExit::TransportFailed(e),
            }
        }
    }
}
