//! # Configuration Modules
//!
//! This module aggregates the configuration surface recognized by the room
//! engine. Binaries layer their own sources (CLI, environment, files) on top
//! and hand the engine a validated `RoomConfig`.

/// Room engine settings: history capacity, heartbeat period, probe and delivery timeouts.
pub mod room_config;

pub use room_config::{ConfigError, RoomConfig};
