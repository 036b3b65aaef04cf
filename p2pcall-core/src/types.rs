//! Call types and data structures

use crate::call::CallError;
use crate::identity::PeerInfo;
use crate::signaling::RejectReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation token for one call
///
/// Generated locally for outgoing calls and taken from the `StartRequest` for
/// incoming ones. Never reused across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Negotiated media kind of a call
///
/// Ordered: `Video` is richer than `Audio`. A call can only move upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl MediaKind {
    /// Whether this kind carries a video section
    pub fn includes_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Capture tracks a participant needs for this kind
    pub fn required_tracks(self) -> &'static [TrackKind] {
        match self {
            Self::Audio => &[TrackKind::Audio],
            Self::Video => &[TrackKind::Audio, TrackKind::Video],
        }
    }

    /// The richer of the two kinds
    #[must_use]
    pub fn upgraded_with(self, other: MediaKind) -> MediaKind {
        self.max(other)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// What a single local capture track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Local client dialed
    Caller,
    /// Remote peer dialed
    Callee,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call waiting for the peer to accept or reject
    Dialing,
    /// Incoming call waiting for the local user to decide
    RingingIncoming,
    /// Both sides accepted, descriptions and candidates in flight
    Negotiating,
    /// Media link is up
    Connected,
    /// Terminal transition in progress, resources being released
    Ending,
}

impl CallState {
    /// A session exists in this state
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Descriptions and candidates may be exchanged in this state
    pub fn is_negotiable(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

/// Why a call ended without an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote peer hung up
    RemoteHangup,
    /// Local user cancelled the outgoing call
    Cancelled,
    /// Remote peer cancelled before the local user answered
    RemoteCancelled,
    /// Local user declined the incoming call
    Declined,
    /// Remote peer declined the outgoing call
    RemoteDeclined {
        /// Reason given by the peer
        reason: RejectReason,
    },
    /// The media link closed underneath the call
    ConnectionClosed,
}

/// Read-only view of the active call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Local role
    pub role: CallRole,
    /// Remote participant
    pub peer: PeerInfo,
    /// Current media kind
    pub media_kind: MediaKind,
    /// Current state
    pub state: CallState,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the media link first connected
    pub connected_at: Option<DateTime<Utc>>,
    /// Local tracks currently held, with their enabled flag
    pub local_tracks: Vec<(TrackKind, bool)>,
}

impl CallSnapshot {
    /// Time spent connected so far
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

/// Lifecycle notifications for the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// A remote peer is calling
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        peer: PeerInfo,
        /// Requested media kind
        media_kind: MediaKind,
    },
    /// Outgoing call still ringing; `ratio` runs from 0 to 1 over the dial window
    DialProgress {
        /// Call identifier
        call_id: CallId,
        /// Elapsed share of the dial window
        ratio: f32,
    },
    /// The session moved between states
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Media link connected
    Connected {
        /// Call identifier
        call_id: CallId,
        /// Remote participant
        peer: PeerInfo,
        /// Media kind at connect time
        media_kind: MediaKind,
    },
    /// The call was upgraded to a richer media kind
    MediaUpgraded {
        /// Call identifier
        call_id: CallId,
        /// New media kind
        media_kind: MediaKind,
    },
    /// A local track was muted or unmuted
    TrackToggled {
        /// Call identifier
        call_id: CallId,
        /// Track kind
        kind: TrackKind,
        /// New enabled flag
        enabled: bool,
    },
    /// The peer started sending a track
    RemoteTrack {
        /// Call identifier
        call_id: CallId,
        /// Track kind
        kind: TrackKind,
    },
    /// Periodic tick while connected
    DurationTick {
        /// Call identifier
        call_id: CallId,
        /// Whole seconds since connect
        elapsed_secs: u64,
    },
    /// The call ended normally
    Ended {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
    /// The call ended because of an error
    Error {
        /// Call identifier
        call_id: CallId,
        /// What went wrong
        error: CallError,
    },
}

impl CallEvent {
    /// Call the event belongs to
    pub fn call_id(&self) -> CallId {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::DialProgress { call_id, .. }
            | Self::StateChanged { call_id, .. }
            | Self::Connected { call_id, .. }
            | Self::MediaUpgraded { call_id, .. }
            | Self::TrackToggled { call_id, .. }
            | Self::RemoteTrack { call_id, .. }
            | Self::DurationTick { call_id, .. }
            | Self::Ended { call_id, .. }
            | Self::Error { call_id, .. } => *call_id,
        }
    }

    /// Whether this is the final notification of a call
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Error { .. })
    }
}
