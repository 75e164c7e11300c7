//! # lib_common
//!
//! Shared library for the room broadcast servers. Each top-level folder is a
//! module gated behind a cargo feature of the same name:
//!
//! - **`configs`**: the `RoomConfig` knobs (history capacity, heartbeat period,
//!   probe and delivery timeouts) with JSON loading and validation.
//! - **`core`**: the engine itself. Connections join a shared room, every
//!   accepted message is fanned out concurrently to all members, a heartbeat
//!   probes liveness, and a lifecycle controller owns shutdown.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "core")]
pub mod core;
