//! Client-side reconnection with exponential backoff.
//!
//! Disabled unless configured. After a transport loss, [`ReconnectState`]
//! computes increasing delays with jitter until an attempt succeeds or the
//! attempt budget runs out.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::serde::{deserialize_duration, serialize_duration};
use crate::core::{Error, Result};

/// Reconnection behaviour after an unexpected transport loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically. Default: false.
    pub enabled: bool,
    /// Delay before the first attempt. Default: 1 s.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Ceiling on the delay between attempts. Default: 30 s.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub max_delay: Duration,
    /// Attempts before giving up. Default: 10.
    pub max_attempts: u32,
    /// Jitter factor in [0, 1), applied as +/- jitter. Default: 0.25.
    pub jitter: f64,
    /// Consecutive silent heartbeat intervals that count as a lost
    /// connection when `enabled`. Otherwise, and with `None`, silence is
    /// only recorded.
    pub max_missed_heartbeats: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.25,
            max_missed_heartbeats: None,
        }
    }
}

impl ReconnectConfig {
    /// Checks the backoff parameters
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config("reconnect.backoff_multiplier must be at least 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::config("reconnect.jitter must be in [0, 1)"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::config("reconnect.max_delay is below initial_delay"));
        }
        if self.max_missed_heartbeats == Some(0) {
            return Err(Error::config("reconnect.max_missed_heartbeats must be positive"));
        }
        Ok(())
    }
}

/// Attempt counter and next backoff delay
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        ReconnectState {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Next delay, advancing the attempt counter.
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::thread_rng()
                .gen_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        self.current_delay = self
            .current_delay
            .mul_f64(self.config.backoff_multiplier)
            .min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Starts over after a successful reconnect
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
            jitter: 0.0,
            max_missed_heartbeats: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut state = ReconnectState::new(no_jitter());
        let delays: Vec<u64> = std::iter::from_fn(|| state.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(state.attempts(), 5);

        state.reset();
        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = ReconnectConfig {
            jitter: 0.25,
            max_attempts: 200,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.0,
            ..no_jitter()
        };
        let mut state = ReconnectState::new(config);
        while let Some(delay) = state.next_delay() {
            assert!(delay >= Duration::from_millis(74), "{:?}", delay);
            assert!(delay <= Duration::from_millis(126), "{:?}", delay);
        }
    }

    #[test]
    fn test_reconnect_section_from_toml() {
        let config = crate::core::ClientConfig::from_toml_str(
            "[reconnect]\nenabled = true\ninitial_delay = 0.5\nmax_missed_heartbeats = 3\n",
        )
        .unwrap();
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_missed_heartbeats, Some(3));
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectConfig::default().validate().is_ok());
        assert!(!ReconnectConfig::default().enabled);

        let bad = ReconnectConfig { backoff_multiplier: 0.5, ..ReconnectConfig::default() };
        assert!(bad.validate().is_err());
        let bad = ReconnectConfig { jitter: 1.5, ..ReconnectConfig::default() };
        assert!(bad.validate().is_err());
        let bad = ReconnectConfig { max_missed_heartbeats: Some(0), ..ReconnectConfig::default() };
        assert!(bad.validate().is_err());
    }
}
