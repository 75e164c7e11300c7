//! # Core Engine Module
//!
//! The room broadcast engine: a registry of live connections, a bounded
//! history, a dispatcher that fans each message out to every member, a
//! heartbeat monitor that evicts silent peers, and a lifecycle controller that
//! runs all of it as cancellable units with a two-phase shutdown.
//!
//! ## Core Components:
//!
//! - **`registry`**: identity → connection record map. Every eviction in the
//!   engine goes through it, which is what guarantees a handle is closed once.
//!
//! - **`history`**: fixed-capacity FIFO replayed to newcomers.
//!
//! - **`dispatcher`**: the zero-copy broadcaster. One encode per message, one
//!   isolated delivery task per member, failures turned into evictions.
//!
//! - **`heartbeat`**: periodic liveness probes with a bounded timeout.
//!
//! - **`lifecycle`**: the `Idle → Running → CancelRequested → CleaningUp →
//!   Terminated` state machine around the serve loop and the heartbeat.
//!
//! Transports plug in through `connection::Connection` and
//! `lifecycle::Acceptor`; everything else is transport agnostic.

/// The transport boundary and an in-memory transport.
pub mod connection;
/// The central, zero-copy broadcaster for distributing messages.
pub mod dispatcher;
/// Error types shared by the engine.
pub mod error;
/// JSON wire frames handed to transports.
pub mod frame;
/// Periodic liveness probing.
pub mod heartbeat;
/// Bounded message history.
pub mod history;
/// Serve loop, sessions and shutdown.
pub mod lifecycle;
/// Room messages.
pub mod message;
/// Live membership.
pub mod registry;

pub use connection::{Connection, ConnectionHandle, Inbound, MemoryConnection, MemoryPeer, RoomRequest};
pub use dispatcher::{BroadcastReport, DispatchCounters, Dispatcher, RoomStats};
pub use error::{
    AcceptError, ConnectionError, DeliveryFailure, LifecycleError, ProbeFailure, RoomError,
};
pub use frame::{Frame, PayloadEncoding};
pub use heartbeat::{HeartbeatMonitor, ProbeReport};
pub use history::HistoryBuffer;
pub use lifecycle::{
    Acceptor, ChannelAcceptor, Incoming, LifecycleController, LifecycleState, Termination,
};
pub use message::{Message, MessageKind, SYSTEM_SENDER};
pub use registry::{ConnectionRecord, LogHooks, MemberInfo, NoHooks, Registry, RegistryHooks};
