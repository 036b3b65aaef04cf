//! p2pcall - call session management for peer-to-peer audio/video calls
//!
//! This library is the lifecycle core of a one-to-one calling feature. It
//! decides what a call is doing at any moment and drives the collaborators
//! that do the actual work:
//!
//! - **Signaling**: call control envelopes exchanged with the remote peer
//!   through any [`SignalingPort`]
//! - **Media Link**: SDP offer/answer and ICE candidates over a
//!   [`MediaLink`], backed by `webrtc` with the `webrtc-link` feature
//! - **Capture devices**: microphone and camera tracks from a
//!   [`DeviceCapture`]
//! - **Events**: every state change is broadcast as a [`CallEvent`]
//!
//! At most one call is active per [`CallManager`]. A second incoming call is
//! answered busy, a second outgoing call is refused.
//!
//! # Examples
//!
//! ```rust,no_run
//! use p2pcall_core::prelude::*;
//! use p2pcall_core::loopback::{LoopbackHub, SimulatedDevices, SimulatedLinkFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let ports = CallPorts {
//!     signaling: hub.endpoint("alice"),
//!     links: Arc::new(SimulatedLinkFactory::new()),
//!     devices: Arc::new(SimulatedDevices::new()),
//! };
//! let manager = CallManager::new(
//!     PeerInfo::new("alice", "Alice"),
//!     CallManagerConfig::default(),
//!     ports,
//! );
//! let handle = manager.handle();
//! let mut events = handle.subscribe();
//! tokio::spawn(manager.run());
//!
//! let call_id = handle
//!     .start_call(PeerInfo::new("bob", "Bob"), MediaKind::Audio)
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     if event.call_id() == call_id && event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and events
pub mod types;

/// Peer identity
pub mod identity;

/// Signaling envelopes and the port they travel over
pub mod signaling;

/// Media link and capture device abstractions
pub mod media;

/// Early ICE candidate buffering
pub mod candidates;

/// Per-session timers
pub mod timers;

/// The active call session and its state machine
pub mod session;

/// Call manager
pub mod call;

/// In-process signaling, media and devices
pub mod loopback;

/// Media link over `RTCPeerConnection` (requires webrtc-link feature)
#[cfg(feature = "webrtc-link")]
pub mod webrtc_link;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerConfig, CallManagerHandle, CallPorts};
pub use candidates::CandidateQueue;
pub use identity::{PeerId, PeerInfo};
pub use media::{
    DeviceCapture, IceCandidate, LinkState, LocalTrack, MediaError, MediaEventSink, MediaLink,
    MediaLinkEvent, MediaLinkFactory, SdpType, SessionDescription,
};
pub use session::{is_valid_transition, CallSession};
pub use signaling::{
    RejectReason, SignalEnvelope, SignalPayload, SignalingError, SignalingHandler, SignalingPort,
};
pub use timers::{SessionTimers, TimerFired, TimerKind};
pub use types::*;
#[cfg(feature = "webrtc-link")]
pub use webrtc_link::{WebRtcLinkConfig, WebRtcLinkFactory, WebRtcMediaLink};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig, CallManagerHandle, CallPorts};
    pub use crate::identity::{PeerId, PeerInfo};
    pub use crate::media::{DeviceCapture, MediaLink, MediaLinkFactory};
    pub use crate::signaling::{RejectReason, SignalEnvelope, SignalPayload, SignalingPort};
    pub use crate::types::{
        CallEvent, CallId, CallRole, CallSnapshot, CallState, EndReason, MediaKind, TrackKind,
    };
    #[cfg(feature = "webrtc-link")]
    pub use crate::webrtc_link::{WebRtcLinkConfig, WebRtcLinkFactory};
}
