//! Media Link and Device Capture ports
//!
//! The call manager never touches codecs, sockets or capture hardware. It
//! drives two collaborators through the traits in this module:
//!
//! - [`MediaLink`]: a negotiable bidirectional media session (one per call),
//!   opened through a [`MediaLinkFactory`] and reporting back through a
//!   [`MediaEventSink`].
//! - [`DeviceCapture`]: acquires and releases local microphone/camera tracks.

use crate::types::{CallId, MediaKind, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or OS refused access to a capture device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Description or candidate could not be produced or applied
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// The link was already closed
    #[error("Media link closed")]
    Closed,
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Negotiated capability description exchanged as offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build a description
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    /// Whether the description carries an active video section
    ///
    /// An `m=video` line with port 0 is a rejected section and does not count.
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some("m=video") && parts.next().is_some_and(|port| port != "0")
        })
    }

    /// Media kind this description implies
    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        if self.has_video() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

/// Connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media-section hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Media link connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Created, nothing negotiated
    New,
    /// Connectivity checks running
    Connecting,
    /// Media can flow
    Connected,
    /// Lost connectivity
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed
    Closed,
}

impl LinkState {
    /// The link will not carry media any more
    pub fn is_down(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Events a media link reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLinkEvent {
    /// The link wants a new description round
    NegotiationNeeded,
    /// A local connectivity candidate was gathered
    LocalCandidate(IceCandidate),
    /// Connection state changed
    ConnectionStateChanged(LinkState),
    /// The peer started sending a track
    RemoteTrack(TrackKind),
}

type Deliver = dyn Fn(CallId, MediaLinkEvent) + Send + Sync;

/// Where a media link reports its events
///
/// Every event is tagged with the call the link was opened for, so the
/// manager can drop events from a link that belongs to a finished call.
#[derive(Clone)]
pub struct MediaEventSink {
    call_id: CallId,
    deliver: Arc<Deliver>,
}

impl MediaEventSink {
    /// Create a sink delivering to `deliver`
    pub fn new(call_id: CallId, deliver: impl Fn(CallId, MediaLinkEvent) + Send + Sync + 'static) -> Self {
        Self {
            call_id,
            deliver: Arc::new(deliver),
        }
    }

    /// Call this sink is bound to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Report an event
    pub fn emit(&self, event: MediaLinkEvent) {
        (self.deliver)(self.call_id, event);
    }
}

impl std::fmt::Debug for MediaEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaEventSink")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// Negotiable bidirectional media session
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Produce an offer covering `kind`
    async fn create_offer(&self, kind: MediaKind) -> Result<SessionDescription, MediaError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply our own description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Apply the peer's description
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;

    /// Apply a peer candidate
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Start sending a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError>;

    /// Stop sending a local track
    async fn remove_track(&self, track: &LocalTrack) -> Result<(), MediaError>;

    /// Tear the link down; closing twice is not an error
    async fn close(&self) -> Result<(), MediaError>;
}

/// Opens one media link per call
#[async_trait]
pub trait MediaLinkFactory: Send + Sync {
    /// Open a link whose events are reported to `events`
    async fn open(
        &self,
        call_id: CallId,
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaLink>, MediaError>;
}

/// Handle to an acquired capture track
///
/// Deliberately not `Clone`: [`DeviceCapture::release`] consumes it, so a
/// track can be released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier, unique per device port
    pub id: String,
    /// What the track carries
    pub kind: TrackKind,
    /// Whether samples are forwarded (false = muted / camera off)
    pub enabled: bool,
}

impl LocalTrack {
    /// A freshly acquired, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
        }
    }
}

/// Local microphone/camera access
#[async_trait]
pub trait DeviceCapture: Send + Sync {
    /// Open a capture track
    async fn acquire(&self, kind: TrackKind) -> Result<LocalTrack, MediaError>;

    /// Stop and release a capture track
    async fn release(&self, track: LocalTrack);

    /// Mute/unmute without releasing the device
    async fn set_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), MediaError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_has_video_detects_active_section() {
        let audio = SessionDescription::new(
            SdpType::Offer,
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=sendrecv\r\n",
        );
        assert!(!audio.has_video());
        assert_eq!(audio.media_kind(), MediaKind::Audio);

        let video = SessionDescription::new(
            SdpType::Offer,
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        assert!(video.has_video());
        assert_eq!(video.media_kind(), MediaKind::Video);
    }

    #[test]
    fn test_rejected_video_section_is_ignored() {
        let rejected = SessionDescription::new(
            SdpType::Answer,
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 0 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        assert!(!rejected.has_video());
    }

    #[test]
    fn test_link_state_down() {
        assert!(LinkState::Failed.is_down());
        assert!(LinkState::Disconnected.is_down());
        assert!(LinkState::Closed.is_down());
        assert!(!LinkState::Connecting.is_down());
        assert!(!LinkState::Connected.is_down());
    }

    #[test]
    fn test_sink_tags_events_with_call_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let call_id = CallId::new();
        let sink = {
            let seen = seen.clone();
            MediaEventSink::new(call_id, move |id, event| seen.lock().push((id, event)))
        };

        sink.emit(MediaLinkEvent::ConnectionStateChanged(LinkState::Connecting));
        sink.clone().emit(MediaLinkEvent::RemoteTrack(TrackKind::Audio));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(id, _)| *id == call_id));
        assert_eq!(seen[1].1, MediaLinkEvent::RemoteTrack(TrackKind::Audio));
    }
}
