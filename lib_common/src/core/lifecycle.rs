//! # Lifecycle Controller
//!
//! Owns the cancellation token and runs the room's two long-lived units, the
//! serve loop and the heartbeat monitor, under it.
//!
//! ## States
//!
//! `Idle → Running → CancelRequested → CleaningUp → Terminated`, published
//! through a `watch` channel. `Terminated` is final.
//!
//! ## Shutdown
//!
//! 1.  `request_shutdown` cancels the token. Every wait in the engine (accept,
//!     receive, heartbeat tick, probe pass) is selected against it.
//! 2.  The serve loop stops accepting and enters `CleaningUp`: it waits for all
//!     sessions to return, then sends each remaining member a shutdown frame
//!     (bounded by the delivery timeout) and closes it while draining the
//!     registry.
//! 3.  Once both units are done the outcome is recorded and the state becomes
//!     `Terminated`.
//!
//! If either unit ends on its own (accept failure, panic) it cancels the token,
//! so the other one follows and the same cleanup runs.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::configs::{ConfigError, RoomConfig};
use crate::core::connection::{ConnectionHandle, Inbound, RoomRequest};
use crate::core::dispatcher::Dispatcher;
use crate::core::error::{AcceptError, LifecycleError, RoomError};
use crate::core::frame::Frame;
use crate::core::heartbeat::HeartbeatMonitor;
use crate::core::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    CancelRequested,
    CleaningUp,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "Idle",
            LifecycleState::Running => "Running",
            LifecycleState::CancelRequested => "CancelRequested",
            LifecycleState::CleaningUp => "CleaningUp",
            LifecycleState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// Clean outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Shutdown was requested and cleanup completed.
    Cancelled,
}

/// A connection handed over by the accept-loop collaborator.
pub struct Incoming {
    pub identity: String,
    pub handle: ConnectionHandle,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Incoming {
    pub fn new(identity: impl Into<String>, handle: ConnectionHandle) -> Self {
        Self {
            identity: identity.into(),
            handle,
        }
    }
}

/// # Acceptor
///
/// Source of new connections. `accept` must be cancel-safe: the serve loop
/// drops the pending call when shutdown is requested.
#[async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(&mut self) -> Result<Incoming, AcceptError>;
}

/// Acceptor fed through an `mpsc` channel. Network front ends push upgraded
/// connections into the sender half. Once every sender is dropped, `accept`
/// reports `ListenerClosed`.
pub struct ChannelAcceptor {
    incoming: mpsc::Receiver<Incoming>,
}

impl ChannelAcceptor {
    pub fn channel(buffer: usize) -> (mpsc::Sender<Incoming>, ChannelAcceptor) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, ChannelAcceptor { incoming: rx })
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> Result<Incoming, AcceptError> {
        self.incoming.recv().await.ok_or(AcceptError::ListenerClosed)
    }
}

struct Shared {
    state: watch::Sender<LifecycleState>,
    outcome: OnceLock<Result<Termination, LifecycleError>>,
}

impl Shared {
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// What a session needs from the room.
struct SessionContext {
    dispatcher: Arc<Dispatcher>,
    replay_limit: Option<usize>,
}

impl SessionContext {
    fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }
}

pub struct LifecycleController {
    config: RoomConfig,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    shared: Arc<Shared>,
}

impl LifecycleController {
    /// Validates `config` and builds an idle controller.
    pub fn new(config: RoomConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, ConfigError> {
        Self::with_token(config, dispatcher, CancellationToken::new())
    }

    /// Like `new`, but cancelling `parent` also shuts this room down.
    pub fn with_parent(
        config: RoomConfig,
        dispatcher: Arc<Dispatcher>,
        parent: &CancellationToken,
    ) -> Result<Self, ConfigError> {
        Self::with_token(config, dispatcher, parent.child_token())
    }

    fn with_token(
        config: RoomConfig,
        dispatcher: Arc<Dispatcher>,
        token: CancellationToken,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(LifecycleState::Idle);
        Ok(Self {
            config,
            dispatcher,
            token,
            shared: Arc::new(Shared {
                state,
                outcome: OnceLock::new(),
            }),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// A token cancelled when this room shuts down, for outer components
    /// (HTTP front ends, background jobs) that should stop with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// # Start
    ///
    /// Spawns the serve loop and the heartbeat monitor on the current runtime.
    /// Only an `Idle` controller can start.
    pub fn start<A: Acceptor>(&self, acceptor: A) -> Result<(), LifecycleError> {
        if !self.shared.transition(LifecycleState::Idle, LifecycleState::Running) {
            return Err(LifecycleError::AlreadyStarted(self.state()));
        }

        let context = Arc::new(SessionContext {
            dispatcher: Arc::clone(&self.dispatcher),
            replay_limit: self.config.replay_on_join.then_some(self.config.replay_limit),
        });
        let delivery_timeout = self.config.delivery_timeout();
        let monitor = HeartbeatMonitor::new(Arc::clone(self.dispatcher.registry()), &self.config);

        let serve_task = tokio::spawn(serve(
            acceptor,
            Arc::clone(&context),
            self.token.clone(),
            Arc::clone(&self.shared),
        ));
        let heartbeat_task = {
            let token = self.token.clone();
            tokio::spawn(async move { monitor.run(token).await })
        };

        let token = self.token.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // Whichever unit ends first takes the other one down with it.
            let (serve_result, heartbeat_result) = tokio::join!(
                async {
                    let result = serve_task.await;
                    token.cancel();
                    result
                },
                async {
                    let result = heartbeat_task.await;
                    token.cancel();
                    result
                },
            );

            let outcome = match serve_result {
                Ok(result) => match heartbeat_result {
                    Ok(()) => result,
                    Err(e) => {
                        log::error!("Heartbeat monitor failed: {}", e);
                        Err(LifecycleError::UnitPanicked("heartbeat monitor"))
                    }
                },
                Err(e) => {
                    log::error!("Serve loop failed: {}. Closing remaining members.", e);
                    close_remaining(context.registry(), delivery_timeout).await;
                    Err(LifecycleError::UnitPanicked("serve loop"))
                }
            };

            match &outcome {
                Ok(termination) => log::info!("Room terminated: {:?}.", termination),
                Err(e) => log::error!("Room terminated abnormally: {}", e),
            }
            let _ = shared.outcome.set(outcome);
            shared.state.send_replace(LifecycleState::Terminated);
        });

        Ok(())
    }

    /// Cancels the room. Idempotent and non-blocking.
    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            log::info!("Shutdown requested.");
        }
        self.token.cancel();
        self.shared
            .transition(LifecycleState::Running, LifecycleState::CancelRequested);
    }

    /// Waits until the room is `Terminated` and returns its outcome.
    pub async fn await_termination(&self) -> Result<Termination, LifecycleError> {
        let mut state = self.shared.state.subscribe();
        if *state.borrow() == LifecycleState::Idle {
            return Err(LifecycleError::NotStarted);
        }
        // The sender lives in `self.shared`, so the channel cannot close here.
        let _ = state.wait_for(|s| *s == LifecycleState::Terminated).await;
        self.shared
            .outcome
            .get()
            .cloned()
            .unwrap_or(Err(LifecycleError::NotStarted))
    }

    /// `request_shutdown` followed by `await_termination`.
    pub async fn shutdown(&self) -> Result<Termination, LifecycleError> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// # Serve Loop
///
/// Accepts connections until cancelled or until the acceptor fails, then runs
/// the cleanup phase.
async fn serve<A: Acceptor>(
    mut acceptor: A,
    context: Arc<SessionContext>,
    token: CancellationToken,
    shared: Arc<Shared>,
) -> Result<Termination, LifecycleError> {
    let sessions = TaskTracker::new();
    log::info!("Serve loop started.");

    // --- Phase 1: accept ---
    let result = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(Termination::Cancelled),
            accepted = acceptor.accept() => match accepted {
                Ok(incoming) => {
                    spawn_session(&sessions, Arc::clone(&context), token.clone(), incoming);
                }
                Err(e) => {
                    log::error!("Accept failed: {}. Shutting the room down.", e);
                    token.cancel();
                    break Err(LifecycleError::Accept(e));
                }
            },
        }
    };

    // --- Phase 2: cleanup ---
    shared.transition(LifecycleState::Running, LifecycleState::CancelRequested);
    shared.state.send_replace(LifecycleState::CleaningUp);
    drop(acceptor);

    sessions.close();
    sessions.wait().await;
    log::info!("All sessions finished.");

    close_remaining(context.registry(), context.dispatcher.delivery_timeout()).await;
    result
}

/// Drains the registry, sending every member a shutdown frame before closing
/// it. Sends run concurrently, each bounded by `timeout`.
async fn close_remaining(registry: &Registry, timeout: Duration) {
    let records = registry.drain();
    if records.is_empty() {
        return;
    }
    log::info!("Closing {} remaining connection(s).", records.len());

    let frame = match Frame::shutdown().encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode shutdown frame: {}", e);
            None
        }
    };

    let mut tasks = JoinSet::new();
    for record in records {
        let frame = frame.clone();
        tasks.spawn(async move {
            if let Some(frame) = frame {
                match tokio::time::timeout(timeout, record.handle.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("Shutdown notice to '{}' failed: {}", record.identity, e),
                    Err(_) => log::debug!("Shutdown notice to '{}' timed out.", record.identity),
                }
            }
            record.close().await;
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            log::error!("Closing a connection failed: {}", e);
        }
    }
}

/// Runs one session under a supervisor task. A panicking session is logged
/// and its connection evicted; sibling sessions are unaffected.
fn spawn_session(
    sessions: &TaskTracker,
    context: Arc<SessionContext>,
    token: CancellationToken,
    incoming: Incoming,
) {
    let Incoming { identity, handle } = incoming;
    sessions.spawn(async move {
        let session = tokio::spawn(run_session(
            Arc::clone(&context),
            token,
            identity.clone(),
            Arc::clone(&handle),
        ));
        if let Err(e) = session.await {
            log::error!("Session for '{}' failed: {}", identity, e);
            let evicted = context
                .registry()
                .evict_connection(&identity, &handle, &"session failed")
                .await;
            if !evicted {
                handle.close().await;
            }
        }
    });
}

/// # Session
///
/// 1.  Reject an identity that is already present.
/// 2.  Replay recent history, before registering, so the newcomer's first
///     frames are the backlog and never interleave with live traffic.
/// 3.  Register and announce the join.
/// 4.  Publish every inbound payload and answer requests until the peer
///     leaves or the room is cancelled. Any inbound item refreshes
///     `last_seen_at`. On cancellation the record is left for the cleanup
///     phase.
async fn run_session(
    context: Arc<SessionContext>,
    token: CancellationToken,
    identity: String,
    handle: ConnectionHandle,
) {
    let registry = context.registry();
    let dispatcher = &context.dispatcher;

    if registry.contains(&identity) {
        log::warn!("Rejecting connection: {}", RoomError::DuplicateIdentity(identity));
        handle.close().await;
        return;
    }

    if let Some(limit) = context.replay_limit {
        let replayed = tokio::select! {
            biased;
            _ = token.cancelled() => {
                handle.close().await;
                return;
            }
            replayed = dispatcher.replay_to(&handle, limit) => replayed,
        };
        match replayed {
            Ok(count) => log::debug!("Replayed {} message(s) to '{}'.", count, identity),
            Err(e) => {
                log::warn!("History replay to '{}' failed: {}", identity, e);
                handle.close().await;
                return;
            }
        }
    }

    if let Err(e) = registry.register(&identity, Arc::clone(&handle)) {
        log::warn!("Rejecting connection: {}", e);
        handle.close().await;
        return;
    }
    dispatcher.announce_join(&identity).await;
    dispatcher.announce_members().await;

    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            received = handle.receive() => received,
        };
        let inbound = match received {
            Ok(inbound) => inbound,
            Err(e) => {
                let removed = registry.evict_connection(&identity, &handle, &e).await;
                // Also announce members that a failed delivery or probe already evicted.
                if removed || !registry.contains(&identity) {
                    dispatcher.announce_leave(&identity).await;
                    dispatcher.announce_members().await;
                }
                return;
            }
        };

        registry.touch(&identity, Utc::now());
        match inbound {
            Inbound::Payload(payload) => {
                dispatcher.publish(&identity, payload).await;
            }
            Inbound::Heartbeat => log::trace!("Heartbeat from '{}'.", identity),
            Inbound::Request(RoomRequest::Members) => {
                dispatcher.broadcast_members().await;
            }
            Inbound::Request(RoomRequest::History { limit }) => {
                match dispatcher.send_history(&handle, limit).await {
                    Ok(count) => log::debug!("Sent {} history entries to '{}'.", count, identity),
                    Err(e) => log::warn!("History request from '{}' failed: {}", identity, e),
                }
            }
        }
    }
}
