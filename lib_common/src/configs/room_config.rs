//! # Room Configuration
//!
//! The knobs recognized by the engine. Durations are stored as milliseconds so
//! the struct reads and writes cleanly as camelCase JSON, the same shape the
//! server config files use.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of messages retained for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
/// Default heartbeat period (30 seconds).
pub const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 30_000;
/// Default liveness probe timeout (10 seconds).
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
/// Default per-peer delivery timeout (5 seconds).
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;
/// Default number of history entries replayed to a new member.
pub const DEFAULT_REPLAY_LIMIT: usize = 20;
/// Default buffer of the analytics subscription stream.
pub const DEFAULT_STREAM_BUFFER: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse room config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read room config: {0}")]
    Io(#[from] std::io::Error),
}

/// # Room Config
///
/// Every field has a default, so a partial JSON document only overrides what
/// it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomConfig {
    /// History capacity `C`. Oldest entries are evicted beyond this.
    pub history_capacity: usize,
    /// Heartbeat period `P` in milliseconds.
    pub heartbeat_period_ms: u64,
    /// Probe timeout `T` in milliseconds. Must be shorter than `P`.
    pub probe_timeout_ms: u64,
    /// Per-peer delivery timeout `D` in milliseconds. Must be shorter than `T`.
    pub delivery_timeout_ms: u64,
    /// Replay recent history to a connection before it joins.
    pub replay_on_join: bool,
    /// Maximum number of history entries replayed on join.
    pub replay_limit: usize,
    /// Broadcast join/leave notices from the `system` sender.
    pub announce_presence: bool,
    /// Send every member the user list after each join and leave.
    pub broadcast_user_list: bool,
    /// Capacity of the read-only subscription stream.
    pub stream_buffer: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            replay_on_join: true,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            announce_presence: true,
            broadcast_user_list: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl RoomConfig {
    /// Parses a (possibly partial) camelCase JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RoomConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// # Validate
    ///
    /// Rejects settings the engine cannot honor. The probe timeout has to be
    /// strictly shorter than the heartbeat period, otherwise an unresponsive
    /// connection could still be registered when the next period begins.
    ///
    /// The delivery timeout has to be shorter than the probe timeout. A
    /// transport may only see a probe answer while its session is reading,
    /// and a session is not reading while one of its broadcasts is in flight.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(invalid("historyCapacity", "must be at least 1"));
        }
        if self.heartbeat_period_ms == 0 {
            return Err(invalid("heartbeatPeriodMs", "must be greater than zero"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("probeTimeoutMs", "must be greater than zero"));
        }
        if self.probe_timeout_ms >= self.heartbeat_period_ms {
            return Err(invalid(
                "probeTimeoutMs",
                format!(
                    "{}ms must be shorter than the heartbeat period ({}ms)",
                    self.probe_timeout_ms, self.heartbeat_period_ms
                ),
            ));
        }
        if self.delivery_timeout_ms == 0 {
            return Err(invalid("deliveryTimeoutMs", "must be greater than zero"));
        }
        if self.delivery_timeout_ms >= self.probe_timeout_ms {
            return Err(invalid(
                "deliveryTimeoutMs",
                format!(
                    "{}ms must be shorter than the probe timeout ({}ms)",
                    self.delivery_timeout_ms, self.probe_timeout_ms
                ),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(invalid("streamBuffer", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}
