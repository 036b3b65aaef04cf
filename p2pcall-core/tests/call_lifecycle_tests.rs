//! End-to-end call lifecycle tests
//!
//! Two or three managers run on their own tasks and talk through a loopback
//! hub, the way an application drives them through handles.

use p2pcall_core::loopback::{LoopbackHub, SimulatedDevices, SimulatedLinkFactory};
use p2pcall_core::{
    CallError, CallEvent, CallId, CallManager, CallManagerConfig, CallManagerHandle, CallPorts,
    CallRole, CallState, EndReason, LinkState, MediaError, MediaKind, PeerId, PeerInfo,
    RejectReason, SignalPayload, TrackKind,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Route manager logs to the test output, filtered by `RUST_LOG`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Party {
    info: PeerInfo,
    handle: CallManagerHandle,
    events: broadcast::Receiver<CallEvent>,
    links: Arc<SimulatedLinkFactory>,
    devices: Arc<SimulatedDevices>,
}

fn spawn_party(
    hub: &LoopbackHub,
    id: &str,
    name: &str,
    links: SimulatedLinkFactory,
    devices: SimulatedDevices,
) -> Party {
    init_tracing();
    let info = PeerInfo::new(id, name);
    let links = Arc::new(links);
    let devices = Arc::new(devices);
    let manager = CallManager::new(
        info.clone(),
        CallManagerConfig::default(),
        CallPorts {
            signaling: hub.endpoint(id),
            links: links.clone(),
            devices: devices.clone(),
        },
    );
    let handle = manager.handle();
    let events = manager.subscribe_events();
    tokio::spawn(manager.run());
    Party {
        info,
        handle,
        events,
        links,
        devices,
    }
}

fn default_party(hub: &LoopbackHub, id: &str, name: &str) -> Party {
    spawn_party(
        hub,
        id,
        name,
        SimulatedLinkFactory::new(),
        SimulatedDevices::new(),
    )
}

/// Next event matching `pred`; events before it are skipped
async fn expect_event(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap()
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Let queued triggers on every manager run
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn connect(caller: &mut Party, callee: &mut Party, kind: MediaKind) -> CallId {
    let call_id = caller
        .handle
        .start_call(callee.info.clone(), kind)
        .await
        .unwrap();
    expect_event(&mut callee.events, |e| {
        matches!(e, CallEvent::IncomingCall { call_id: id, .. } if *id == call_id)
    })
    .await;
    callee.handle.accept_incoming().await.unwrap();
    expect_event(&mut caller.events, |e| matches!(e, CallEvent::Connected { .. })).await;
    expect_event(&mut callee.events, |e| matches!(e, CallEvent::Connected { .. })).await;
    call_id
}

#[tokio::test(start_paused = true)]
async fn audio_call_connects_on_both_sides() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");

    let call_id = alice
        .handle
        .start_call(bob.info.clone(), MediaKind::Audio)
        .await
        .unwrap();

    let incoming = expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    match incoming {
        CallEvent::IncomingCall {
            call_id: id,
            peer,
            media_kind,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(peer, alice.info);
            assert_eq!(media_kind, MediaKind::Audio);
        }
        other => panic!("unexpected event {other:?}"),
    }

    bob.handle.accept_incoming().await.unwrap();
    let connected = expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::Connected { .. })
    })
    .await;
    assert!(matches!(
        connected,
        CallEvent::Connected { media_kind: MediaKind::Audio, ref peer, .. } if peer.id == bob.info.id
    ));
    expect_event(&mut bob.events, |e| matches!(e, CallEvent::Connected { .. })).await;

    let snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.call_id, call_id);
    assert_eq!(snapshot.role, CallRole::Caller);
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.local_tracks, vec![(TrackKind::Audio, true)]);
    let connected_at = snapshot.connected_at.unwrap();

    let bob_snapshot = bob.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(bob_snapshot.role, CallRole::Callee);
    assert_eq!(bob_snapshot.state, CallState::Connected);

    // connect time does not move while the call goes on
    let tick = expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::DurationTick { .. })
    })
    .await;
    assert!(matches!(tick, CallEvent::DurationTick { elapsed_secs: 1, .. }));
    let later = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(later.connected_at, Some(connected_at));
}

#[tokio::test(start_paused = true)]
async fn hangup_ends_both_sides_and_releases_devices() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    let call_id = connect(&mut alice, &mut bob, MediaKind::Video).await;

    alice.handle.end_call().await.unwrap();

    let ended = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        ended,
        CallEvent::Ended { call_id: id, reason: EndReason::LocalHangup } if id == call_id
    ));
    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));

    settle().await;
    assert_eq!(alice.handle.snapshot().await.unwrap(), None);
    assert_eq!(bob.handle.snapshot().await.unwrap(), None);
    assert_eq!(alice.devices.live_tracks(), 0);
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(alice.devices.release_count(), 2);
    assert!(alice.links.last().unwrap().is_closed());
    assert!(bob.links.last().unwrap().is_closed());

    // no farewell goes back to the side that hung up
    assert!(!hub
        .sent_to(&alice.info.id)
        .iter()
        .any(|p| matches!(p, SignalPayload::End)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_after_dial_window() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    // registered but nobody answers
    let _bob = hub.endpoint("bob");

    let started = Instant::now();
    let call_id = alice
        .handle
        .start_call(PeerInfo::new("bob", "Bob"), MediaKind::Audio)
        .await
        .unwrap();

    let progress = expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::DialProgress { .. })
    })
    .await;
    match progress {
        CallEvent::DialProgress { ratio, .. } => assert!((ratio - 0.05).abs() < 1e-6),
        other => panic!("unexpected event {other:?}"),
    }

    let terminal = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        terminal,
        CallEvent::Error { call_id: id, error: CallError::DialTimeout } if id == call_id
    ));
    assert!(started.elapsed() >= Duration::from_millis(20_000));

    settle().await;
    assert_eq!(alice.handle.snapshot().await.unwrap(), None);
    assert!(drain(&mut alice.events).iter().all(|e| !e.is_terminal()));

    let to_bob = hub.sent_to(&PeerId::new("bob"));
    assert!(matches!(to_bob[0], SignalPayload::StartRequest { .. }));
    assert_eq!(to_bob.last(), Some(&SignalPayload::Cancel));
}

#[tokio::test(start_paused = true)]
async fn busy_callee_rejects_second_caller_without_touching_active_call() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    let mut carol = default_party(&hub, "carol", "Carol");
    let call_id = connect(&mut alice, &mut bob, MediaKind::Audio).await;

    let carol_call = carol
        .handle
        .start_call(bob.info.clone(), MediaKind::Audio)
        .await
        .unwrap();
    let terminal = expect_event(&mut carol.events, CallEvent::is_terminal).await;
    assert!(matches!(
        terminal,
        CallEvent::Error { call_id: id, error: CallError::PeerBusy } if id == carol_call
    ));

    let bob_snapshot = bob.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(bob_snapshot.call_id, call_id);
    assert_eq!(bob_snapshot.state, CallState::Connected);
    assert_eq!(bob_snapshot.peer.id, alice.info.id);
    assert!(drain(&mut bob.events)
        .iter()
        .all(|e| !matches!(e, CallEvent::IncomingCall { .. }) && e.call_id() == call_id));
}

#[tokio::test(start_paused = true)]
async fn camera_upgrade_keeps_call_connected() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    let call_id = connect(&mut alice, &mut bob, MediaKind::Audio).await;
    drain(&mut alice.events);
    drain(&mut bob.events);

    alice.handle.toggle_camera().await.unwrap();

    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::MediaUpgraded { media_kind: MediaKind::Video, .. })
    })
    .await;
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::MediaUpgraded { media_kind: MediaKind::Video, .. })
    })
    .await;
    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::RemoteTrack { kind: TrackKind::Video, .. })
    })
    .await;
    settle().await;

    let alice_snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(alice_snapshot.call_id, call_id);
    assert_eq!(alice_snapshot.state, CallState::Connected);
    assert_eq!(alice_snapshot.media_kind, MediaKind::Video);
    assert_eq!(
        alice_snapshot.local_tracks,
        vec![(TrackKind::Audio, true), (TrackKind::Video, true)]
    );
    let bob_snapshot = bob.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(bob_snapshot.media_kind, MediaKind::Video);
    assert_eq!(bob.devices.acquire_count(TrackKind::Video), 1);

    let transitions: Vec<CallEvent> = drain(&mut alice.events)
        .into_iter()
        .chain(drain(&mut bob.events))
        .filter(|e| matches!(e, CallEvent::StateChanged { .. } | CallEvent::Ended { .. }))
        .collect();
    assert!(transitions.is_empty(), "upgrade changed state: {transitions:?}");
}

#[tokio::test(start_paused = true)]
async fn toggling_mic_flips_the_same_track() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;

    alice.handle.toggle_mic().await.unwrap();
    alice.handle.toggle_mic().await.unwrap();

    let toggles: Vec<bool> = drain(&mut alice.events)
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::TrackToggled {
                kind: TrackKind::Audio,
                enabled,
                ..
            } => Some(enabled),
            _ => None,
        })
        .collect();
    assert_eq!(toggles, vec![false, true]);
    assert_eq!(
        alice.devices.enabled_log(),
        vec![("audio-1".to_string(), false), ("audio-1".to_string(), true)]
    );
    assert_eq!(alice.devices.acquire_count(TrackKind::Audio), 1);
}

fn camera_toggles(events: &mut broadcast::Receiver<CallEvent>) -> Vec<bool> {
    drain(events)
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::TrackToggled {
                kind: TrackKind::Video,
                enabled,
                ..
            } => Some(enabled),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn toggling_camera_after_acquisition_only_flips_the_flag() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;
    drain(&mut alice.events);

    alice.handle.toggle_camera().await.unwrap();
    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::TrackToggled { kind: TrackKind::Video, enabled: true, .. })
    })
    .await;
    settle().await;
    let offers_after_acquire = hub
        .sent_to(&bob.info.id)
        .iter()
        .filter(|p| matches!(p, SignalPayload::Offer(_)))
        .count();

    alice.handle.toggle_camera().await.unwrap();
    alice.handle.toggle_camera().await.unwrap();
    settle().await;

    assert_eq!(camera_toggles(&mut alice.events), vec![false, true]);
    assert_eq!(alice.devices.acquire_count(TrackKind::Video), 1);
    let snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(
        snapshot.local_tracks,
        vec![(TrackKind::Audio, true), (TrackKind::Video, true)]
    );
    let offers = hub
        .sent_to(&bob.info.id)
        .iter()
        .filter(|p| matches!(p, SignalPayload::Offer(_)))
        .count();
    assert_eq!(offers, offers_after_acquire, "flipping the flag renegotiated");
}

#[tokio::test(start_paused = true)]
async fn camera_toggled_twice_while_acquiring_ends_disabled() {
    let hub = LoopbackHub::new();
    let mut alice = spawn_party(
        &hub,
        "alice",
        "Alice",
        SimulatedLinkFactory::new(),
        SimulatedDevices::with_delay(Duration::from_secs(2)),
    );
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;
    drain(&mut alice.events);

    // second press lands while the camera prompt is still open
    alice.handle.toggle_camera().await.unwrap();
    alice.handle.toggle_camera().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    let snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(
        snapshot.local_tracks,
        vec![(TrackKind::Audio, true), (TrackKind::Video, false)]
    );
    assert_eq!(camera_toggles(&mut alice.events), vec![false]);
    assert_eq!(alice.devices.acquire_count(TrackKind::Video), 1);
    assert_eq!(
        alice.devices.enabled_log(),
        vec![("video-2".to_string(), false)]
    );
}

#[tokio::test(start_paused = true)]
async fn callee_camera_toggle_after_accept_lets_caller_offer_first() {
    let hub = LoopbackHub::new();
    let mut alice = spawn_party(
        &hub,
        "alice",
        "Alice",
        SimulatedLinkFactory::new(),
        SimulatedDevices::with_delay(Duration::from_secs(2)),
    );
    let mut bob = default_party(&hub, "bob", "Bob");

    alice
        .handle
        .start_call(bob.info.clone(), MediaKind::Audio)
        .await
        .unwrap();
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    bob.handle.accept_incoming().await.unwrap();
    bob.handle.toggle_camera().await.unwrap();

    expect_event(&mut alice.events, |e| matches!(e, CallEvent::Connected { .. })).await;
    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::MediaUpgraded { media_kind: MediaKind::Video, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    let negotiation = |peer: &PeerId| -> Vec<&'static str> {
        hub.sent_to(peer)
            .iter()
            .filter(|p| !matches!(p, SignalPayload::Candidate(_)))
            .map(SignalPayload::kind)
            .collect()
    };
    assert_eq!(
        negotiation(&bob.info.id),
        vec!["StartRequest", "Offer", "Answer"]
    );
    assert_eq!(negotiation(&alice.info.id), vec!["Accept", "Answer", "Offer"]);

    let calls = alice.links.last().unwrap().calls();
    let camera_attached = calls.iter().rposition(|c| *c == "add_track").unwrap();
    let answered = calls.iter().position(|c| *c == "create_answer").unwrap();
    assert!(camera_attached < answered, "answer before camera: {calls:?}");

    let alice_snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(alice_snapshot.state, CallState::Connected);
    assert_eq!(alice_snapshot.media_kind, MediaKind::Video);
    let bob_snapshot = bob.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(bob_snapshot.state, CallState::Connected);
    assert_eq!(
        bob_snapshot.local_tracks,
        vec![(TrackKind::Audio, true), (TrackKind::Video, true)]
    );
}

#[tokio::test(start_paused = true)]
async fn link_that_never_connects_times_out() {
    let hub = LoopbackHub::new();
    let mut alice = spawn_party(
        &hub,
        "alice",
        "Alice",
        SimulatedLinkFactory::without_auto_connect(),
        SimulatedDevices::new(),
    );
    let mut bob = default_party(&hub, "bob", "Bob");

    alice
        .handle
        .start_call(bob.info.clone(), MediaKind::Audio)
        .await
        .unwrap();
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    let accepted_at = Instant::now();
    bob.handle.accept_incoming().await.unwrap();

    let terminal = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        terminal,
        CallEvent::Error {
            error: CallError::NegotiationTimeout,
            ..
        }
    ));
    assert!(accepted_at.elapsed() >= Duration::from_millis(30_000));

    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn link_failure_after_connect_is_connection_lost() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;

    alice.links.last().unwrap().report_state(LinkState::Failed);

    let terminal = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        terminal,
        CallEvent::Error {
            error: CallError::ConnectionLost,
            ..
        }
    ));
    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    settle().await;
    assert_eq!(alice.devices.live_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn link_closed_after_connect_ends_without_error() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;

    alice.links.last().unwrap().report_state(LinkState::Closed);

    let terminal = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        terminal,
        CallEvent::Ended {
            reason: EndReason::ConnectionClosed,
            ..
        }
    ));
    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    settle().await;
    assert_eq!(alice.devices.live_tracks(), 0);
    assert!(alice.links.last().unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn callee_without_microphone_declines_with_device_reason() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    bob.devices.fail(
        TrackKind::Audio,
        MediaError::PermissionDenied("microphone".to_string()),
    );

    alice
        .handle
        .start_call(bob.info.clone(), MediaKind::Audio)
        .await
        .unwrap();
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    bob.handle.accept_incoming().await.unwrap();

    let local = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        local,
        CallEvent::Error {
            error: CallError::DeviceAccessDenied(_),
            ..
        }
    ));
    let remote = expect_event(&mut alice.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteDeclined {
                reason: RejectReason::DeviceUnavailable
            },
            ..
        }
    ));
    assert!(hub
        .sent_to(&alice.info.id)
        .iter()
        .all(|p| !matches!(p, SignalPayload::Accept)));
}

#[tokio::test(start_paused = true)]
async fn tracks_acquired_after_cancel_are_released() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = spawn_party(
        &hub,
        "bob",
        "Bob",
        SimulatedLinkFactory::new(),
        SimulatedDevices::with_delay(Duration::from_secs(5)),
    );

    alice
        .handle
        .start_call(bob.info.clone(), MediaKind::Video)
        .await
        .unwrap();
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    // permission prompt still open when the caller gives up
    bob.handle.accept_incoming().await.unwrap();
    alice.handle.cancel_outgoing().await.unwrap();

    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteCancelled,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(bob.devices.acquire_count(TrackKind::Audio), 1);
    assert_eq!(bob.devices.acquire_count(TrackKind::Video), 1);
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(bob.handle.snapshot().await.unwrap(), None);
    assert!(bob.links.last().unwrap().sender_kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn manager_handles_next_call_after_previous_one() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");

    let first = connect(&mut alice, &mut bob, MediaKind::Audio).await;
    bob.handle.end_call().await.unwrap();
    expect_event(&mut alice.events, CallEvent::is_terminal).await;
    expect_event(&mut bob.events, CallEvent::is_terminal).await;

    let second = connect(&mut bob, &mut alice, MediaKind::Audio).await;
    assert_ne!(first, second);
    let snapshot = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.role, CallRole::Callee);
    assert_eq!(snapshot.call_id, second);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_active_call() {
    let hub = LoopbackHub::new();
    let mut alice = default_party(&hub, "alice", "Alice");
    let mut bob = default_party(&hub, "bob", "Bob");
    connect(&mut alice, &mut bob, MediaKind::Audio).await;

    alice.handle.shutdown();

    let remote = expect_event(&mut bob.events, CallEvent::is_terminal).await;
    assert!(matches!(
        remote,
        CallEvent::Ended {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    settle().await;
    assert_eq!(
        alice.handle.end_call().await,
        Err(CallError::ManagerStopped)
    );
}
