//! Two simulated peers calling each other in-process

use anyhow::{bail, Result};
use p2pcall_core::loopback::{LoopbackHub, SimulatedDevices, SimulatedLinkFactory};
use p2pcall_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// How the simulated callee behaves
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    /// Start as a video call
    pub video: bool,
    /// Turn the camera on once connected
    pub upgrade: bool,
    /// Callee declines instead of answering
    pub decline: bool,
    /// Callee never reacts
    pub no_answer: bool,
    /// How long to stay connected before hanging up
    pub hold: Duration,
}

fn spawn_manager(hub: &LoopbackHub, info: PeerInfo, config: &CallManagerConfig) -> CallManagerHandle {
    let manager = CallManager::new(
        info.clone(),
        config.clone(),
        CallPorts {
            signaling: hub.endpoint(info.id.clone()),
            links: Arc::new(SimulatedLinkFactory::new()),
            devices: Arc::new(SimulatedDevices::new()),
        },
    );
    let handle = manager.handle();
    tokio::spawn(manager.run());
    handle
}

fn print_event(side: &str, event: &CallEvent) {
    match event {
        CallEvent::IncomingCall {
            peer, media_kind, ..
        } => println!("[{side}] 📞 Incoming {media_kind} call from {}", peer.display_name),
        CallEvent::DialProgress { ratio, .. } => {
            println!("[{side}] ⏳ Ringing {:.0}%", ratio * 100.0);
        }
        CallEvent::StateChanged { from, to, .. } => println!("[{side}]    {from:?} → {to:?}"),
        CallEvent::Connected {
            peer, media_kind, ..
        } => println!("[{side}] ✅ Connected to {} ({media_kind})", peer.display_name),
        CallEvent::MediaUpgraded { media_kind, .. } => {
            println!("[{side}] 🎥 Upgraded to {media_kind}");
        }
        CallEvent::TrackToggled { kind, enabled, .. } => {
            println!("[{side}]    {kind} {}", if *enabled { "on" } else { "off" });
        }
        CallEvent::RemoteTrack { kind, .. } => println!("[{side}]    Receiving {kind}"),
        CallEvent::DurationTick { elapsed_secs, .. } => {
            println!("[{side}]    {elapsed_secs}s");
        }
        CallEvent::Ended { reason, .. } => println!("[{side}] 📴 Ended: {reason:?}"),
        CallEvent::Error { error, .. } => println!("[{side}] ❌ Failed: {error}"),
    }
}

/// Callee side: react to the first incoming call, print everything
fn spawn_callee(
    handle: CallManagerHandle,
    mut events: broadcast::Receiver<CallEvent>,
    options: SimulateOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Callee missed events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            print_event("bob", &event);
            if let CallEvent::IncomingCall { .. } = event {
                let result = if options.no_answer {
                    Ok(())
                } else if options.decline {
                    handle.reject_incoming(RejectReason::Declined).await
                } else {
                    handle.accept_incoming().await
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Callee could not react");
                }
            }
            if event.is_terminal() {
                break;
            }
        }
    })
}

async fn next_event(events: &mut broadcast::Receiver<CallEvent>) -> Result<CallEvent> {
    loop {
        match events.recv().await {
            Ok(event) => {
                print_event("alice", &event);
                return Ok(event);
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("call manager stopped"),
        }
    }
}

/// Run one call from `alice` to `bob` and return the caller's final event
pub async fn run(config: &CallManagerConfig, options: SimulateOptions) -> Result<CallEvent> {
    let hub = LoopbackHub::new();
    let alice_info = PeerInfo::new("alice", "Alice");
    let bob_info = PeerInfo::new("bob", "Bob");
    let alice = spawn_manager(&hub, alice_info, config);
    let bob = spawn_manager(&hub, bob_info.clone(), config);

    let callee = spawn_callee(bob.clone(), bob.subscribe(), options.clone());
    let mut events = alice.subscribe();

    let media_kind = if options.video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let call_id = alice.start_call(bob_info, media_kind).await?;
    tracing::info!(call_id = %call_id, "Simulated call started");

    let terminal = loop {
        let event = next_event(&mut events).await?;
        match event {
            CallEvent::Connected { .. } => {
                if options.upgrade && !options.video {
                    alice.toggle_camera().await?;
                }
                tokio::time::sleep(options.hold).await;
                // the call may have ended on its own while we waited
                if let Err(e) = alice.end_call().await {
                    tracing::debug!(error = %e, "Call already over");
                }
            }
            event if event.is_terminal() => break event,
            _ => {}
        }
    };

    alice.shutdown();
    bob.shutdown();
    if let Err(e) = callee.await {
        tracing::warn!(error = %e, "Callee task failed");
    }
    Ok(terminal)
}
