//! End-to-end room scenarios over in-memory connections.

use std::sync::Arc;
use std::time::Duration;

use lib_common::configs::RoomConfig;
use lib_common::core::{
    AcceptError, ChannelAcceptor, Dispatcher, Frame, HistoryBuffer, Inbound, Incoming,
    LifecycleController, LifecycleError, LifecycleState, MemoryConnection, MemoryPeer, MessageKind,
    Registry, RoomRequest, Termination, SYSTEM_SENDER,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn room(config: RoomConfig) -> (LifecycleController, mpsc::Sender<Incoming>) {
    init_logger();
    let registry = Arc::new(Registry::new());
    let history = Arc::new(HistoryBuffer::new(config.history_capacity));
    let dispatcher = Arc::new(Dispatcher::new(registry, history, &config));
    let controller = LifecycleController::new(config, dispatcher).unwrap();
    let (tx, acceptor) = ChannelAcceptor::channel(16);
    controller.start(acceptor).unwrap();
    (controller, tx)
}

async fn connect(tx: &mpsc::Sender<Incoming>, identity: &str) -> MemoryPeer {
    let (handle, peer) = MemoryConnection::handle_pair();
    tx.send(Incoming::new(identity, handle)).await.unwrap();
    peer
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    timeout(Duration::from_secs(5), peer.recv_frame())
        .await
        .expect("no frame within 5s")
        .expect("connection stream ended")
}

/// (sender, kind, text) of a message frame.
fn summary(frame: &Frame) -> (String, MessageKind, String) {
    match frame {
        Frame::Message { sender, kind, .. } => {
            let text = String::from_utf8(frame.payload_bytes().unwrap()).unwrap();
            (sender.clone(), *kind, text)
        }
        other => panic!("expected a message frame, got {:?}", other),
    }
}

fn user_names(frame: &Frame) -> Vec<String> {
    match frame {
        Frame::UserList { users, .. } => users.iter().map(|u| u.identity.clone()).collect(),
        other => panic!("expected a user list, got {:?}", other),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

fn system(kind: MessageKind, text: &str) -> (String, MessageKind, String) {
    (SYSTEM_SENDER.to_string(), kind, text.to_string())
}

fn chat(sender: &str, text: &str) -> (String, MessageKind, String) {
    (sender.to_string(), MessageKind::Chat, text.to_string())
}

#[tokio::test(start_paused = true)]
async fn newcomer_gets_replay_then_live_traffic() {
    let (room, tx) = room(RoomConfig::default());

    let mut alice = connect(&tx, "alice").await;
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Join, "alice joined the room"));

    let mut bob = connect(&tx, "bob").await;
    // Replay of the history, then bob's own join notice.
    assert_eq!(summary(&next_frame(&mut bob).await), system(MessageKind::Join, "alice joined the room"));
    assert_eq!(summary(&next_frame(&mut bob).await), system(MessageKind::Join, "bob joined the room"));
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Join, "bob joined the room"));

    assert!(alice.send("hello"));
    let to_alice = next_frame(&mut alice).await;
    let to_bob = next_frame(&mut bob).await;
    assert_eq!(summary(&to_alice), chat("alice", "hello"));
    assert_eq!(to_alice, to_bob);
    assert_eq!(to_bob.seq(), Some(3));

    assert_eq!(room.dispatcher().history().len(), 3);
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn duplicate_identity_is_rejected_and_closed() {
    let (room, tx) = room(RoomConfig::default());

    let mut first = connect(&tx, "u1").await;
    next_frame(&mut first).await;

    let second = connect(&tx, "u1").await;
    timeout(Duration::from_secs(5), async {
        while !second.is_closed() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let registry = room.dispatcher().registry();
    assert_eq!(registry.len(), 1);
    assert!(!first.is_closed());

    // The original member still gets traffic.
    assert!(first.send("still here"));
    assert_eq!(summary(&next_frame(&mut first).await), chat("u1", "still here"));
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
    assert_eq!(second.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn departure_is_announced_to_the_rest() {
    let (room, tx) = room(RoomConfig::default());

    let mut alice = connect(&tx, "alice").await;
    next_frame(&mut alice).await;
    let mut bob = connect(&tx, "bob").await;
    next_frame(&mut alice).await;

    bob.disconnect();
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Leave, "bob left the room"));
    assert!(!room.dispatcher().registry().contains("bob"));
    assert_eq!(bob.close_count(), 1);

    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn silent_member_is_evicted_within_one_period() {
    let config = RoomConfig {
        heartbeat_period_ms: 1_000,
        probe_timeout_ms: 100,
        delivery_timeout_ms: 50,
        ..RoomConfig::default()
    };
    let (room, tx) = room(config);

    let mut alice = connect(&tx, "alice").await;
    next_frame(&mut alice).await;
    let mut ghost = connect(&tx, "ghost").await;
    next_frame(&mut alice).await;
    ghost.ignore_probes(true);

    // The next probe pass starts at t=1000ms and times out 100ms later.
    sleep(Duration::from_millis(1_150)).await;
    assert!(!room.dispatcher().registry().contains("ghost"));
    assert_eq!(ghost.close_count(), 1);
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Leave, "ghost left the room"));
    assert!(room.dispatcher().registry().last_seen("alice").is_some());

    // Before eviction the ghost saw the replayed join of alice and its own join.
    assert_eq!(ghost.drain_frames().len(), 2);
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn shutdown_notifies_closes_and_goes_quiet() {
    let (room, tx) = room(RoomConfig::default());
    let mut states = room.subscribe_state();

    let mut alice = connect(&tx, "alice").await;
    next_frame(&mut alice).await;
    let mut bob = connect(&tx, "bob").await;
    next_frame(&mut alice).await;
    let _ = bob.drain_frames();

    room.request_shutdown();
    assert_ne!(*states.borrow_and_update(), LifecycleState::Running);
    assert_eq!(room.await_termination().await, Ok(Termination::Cancelled));
    assert_eq!(room.state(), LifecycleState::Terminated);
    assert!(room.dispatcher().registry().is_empty());

    for peer in [&mut alice, &mut bob] {
        let frames = peer.drain_frames();
        assert!(matches!(frames.last(), Some(Frame::Shutdown { .. })));
        assert_eq!(peer.close_count(), 1);
    }

    let probes = (alice.probe_count(), bob.probe_count());
    sleep(Duration::from_secs(120)).await;
    assert_eq!((alice.probe_count(), bob.probe_count()), probes);
    assert!(alice.drain_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn accept_failure_terminates_with_cleanup() {
    let (room, tx) = room(RoomConfig::default());

    let mut alice = connect(&tx, "alice").await;
    next_frame(&mut alice).await;
    drop(tx);

    assert_eq!(
        room.await_termination().await,
        Err(LifecycleError::Accept(AcceptError::ListenerClosed))
    );
    assert!(room.dispatcher().registry().is_empty());
    assert!(matches!(alice.drain_frames().last(), Some(Frame::Shutdown { .. })));
    assert_eq!(alice.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn replay_can_be_disabled() {
    let (room, tx) = room(RoomConfig {
        replay_on_join: false,
        ..RoomConfig::default()
    });

    let mut alice = connect(&tx, "alice").await;
    next_frame(&mut alice).await;
    assert!(alice.send("before bob"));
    next_frame(&mut alice).await;

    let mut bob = connect(&tx, "bob").await;
    assert_eq!(summary(&next_frame(&mut bob).await), system(MessageKind::Join, "bob joined the room"));
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_and_requests_are_answered_not_broadcast() {
    let (room, tx) = room(RoomConfig {
        announce_presence: false,
        ..RoomConfig::default()
    });
    let registry = room.dispatcher().registry().clone();

    let mut alice = connect(&tx, "alice").await;
    let mut bob = connect(&tx, "bob").await;
    wait_until(|| registry.len() == 2).await;

    assert!(alice.send("hi"));
    assert_eq!(summary(&next_frame(&mut alice).await), chat("alice", "hi"));
    assert_eq!(summary(&next_frame(&mut bob).await), chat("alice", "hi"));

    // A heartbeat only refreshes the sender's last-seen time.
    let stale = chrono::Utc::now() - chrono::Duration::hours(1);
    registry.touch("alice", stale);
    assert!(alice.send_inbound(Inbound::Heartbeat));
    wait_until(|| registry.last_seen("alice").is_some_and(|seen| seen > stale)).await;

    // History goes to the requester only.
    assert!(bob.send_inbound(Inbound::Request(RoomRequest::History { limit: 5 })));
    match next_frame(&mut bob).await {
        Frame::MessageHistory { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(summary(&messages[0]), chat("alice", "hi"));
        }
        other => panic!("expected message history, got {:?}", other),
    }

    // The member list goes to everyone.
    assert!(bob.send_inbound(Inbound::Request(RoomRequest::Members)));
    assert_eq!(user_names(&next_frame(&mut alice).await), vec!["alice", "bob"]);
    assert_eq!(user_names(&next_frame(&mut bob).await), vec!["alice", "bob"]);

    assert!(alice.drain_frames().is_empty());
    assert_eq!(room.dispatcher().counters().accepted, 1);
    assert_eq!(room.dispatcher().history().len(), 1);
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn member_list_follows_joins_and_leaves() {
    let (room, tx) = room(RoomConfig {
        broadcast_user_list: true,
        ..RoomConfig::default()
    });

    let mut alice = connect(&tx, "alice").await;
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Join, "alice joined the room"));
    assert_eq!(user_names(&next_frame(&mut alice).await), vec!["alice"]);

    let mut bob = connect(&tx, "bob").await;
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Join, "bob joined the room"));
    assert_eq!(user_names(&next_frame(&mut alice).await), vec!["alice", "bob"]);
    // Replayed join of alice, own join, then the list.
    next_frame(&mut bob).await;
    next_frame(&mut bob).await;
    assert_eq!(user_names(&next_frame(&mut bob).await), vec!["alice", "bob"]);

    bob.disconnect();
    assert_eq!(summary(&next_frame(&mut alice).await), system(MessageKind::Leave, "bob left the room"));
    assert_eq!(user_names(&next_frame(&mut alice).await), vec!["alice"]);
    assert_eq!(room.shutdown().await, Ok(Termination::Cancelled));
}
