//! # Error Taxonomy
//!
//! Per-connection failures (`ConnectionError`, `DeliveryFailure`,
//! `ProbeFailure`) never leave the component that observed them: they are
//! turned into evictions on the spot. Only `AcceptError` escalates to the
//! lifecycle controller, which reports it as a failed termination.

use std::time::Duration;

use thiserror::Error;

use crate::core::lifecycle::LifecycleState;

/// Registration conflict. The join is rejected and the existing member is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("identity '{0}' is already registered")]
    DuplicateIdentity(String),
}

/// Failures reported by a transport through the `Connection` trait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

/// Why a single peer did not receive a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("{0}")]
    Send(#[from] ConnectionError),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery task aborted: {0}")]
    Aborted(String),
}

/// Why a single peer failed its liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("no probe response within {0:?}")]
    Timeout(Duration),
}

/// Failures of the accept-loop collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("listener closed")]
    ListenerClosed,

    #[error("accept failed: {0}")]
    Failed(String),
}

/// Abnormal terminations surfaced by `LifecycleController::await_termination`.
///
/// A requested shutdown is not an error; it completes with
/// `Termination::Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("lifecycle controller cannot start from state {0}")]
    AlreadyStarted(LifecycleState),

    #[error("lifecycle controller was never started")]
    NotStarted,

    #[error("accept loop failed: {0}")]
    Accept(#[from] AcceptError),

    #[error("{0} panicked")]
    UnitPanicked(&'static str),
}
