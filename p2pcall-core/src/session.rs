//! The single in-flight call
//!
//! A [`CallSession`] exists from `startCall`/`StartRequest` until cleanup. It
//! owns everything the call acquired: capture tracks, the media link, the
//! early candidate queue and the timers. Only the call manager mutates it.

use crate::call::CallError;
use crate::candidates::CandidateQueue;
use crate::identity::PeerInfo;
use crate::media::{LocalTrack, MediaLink};
use crate::timers::SessionTimers;
use crate::types::{CallId, CallRole, CallSnapshot, CallState, MediaKind, TrackKind};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Check a state transition against the call state machine
///
/// ```text
///   Idle ──startCall──▶ Dialing ──Accept──▶ Negotiating ──link up──▶ Connected
///     │                   │                     │                       │
///     └─StartRequest─▶ RingingIncoming ─accept──┘                       │
///                         │     │               └──────▶ Ending ◀───────┘
///                         ▼     ▼                          │
///                        Idle  Idle                        ▼
///                                                         Idle
/// ```
///
/// `Dialing` and `RingingIncoming` end straight back in `Idle` since nothing
/// needs releasing beyond the timers.
#[must_use]
pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
    matches!(
        (from, to),
        (CallState::Idle, CallState::Dialing)
            | (CallState::Idle, CallState::RingingIncoming)
            | (CallState::Dialing, CallState::Negotiating)
            | (CallState::Dialing, CallState::Idle)
            | (CallState::RingingIncoming, CallState::Negotiating)
            | (CallState::RingingIncoming, CallState::Idle)
            | (CallState::Negotiating, CallState::Connected)
            | (CallState::Negotiating, CallState::Ending)
            | (CallState::Connected, CallState::Ending)
            | (CallState::Ending, CallState::Idle)
    )
}

/// Active call session
pub struct CallSession {
    call_id: CallId,
    role: CallRole,
    peer: PeerInfo,
    media_kind: MediaKind,
    state: CallState,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    pub(crate) local_tracks: HashMap<TrackKind, LocalTrack>,
    pub(crate) pending_acquisitions: HashSet<TrackKind>,
    /// Enabled flag to apply once a pending acquisition of that kind attaches
    pub(crate) pending_enabled: HashMap<TrackKind, bool>,
    pub(crate) candidate_queue: CandidateQueue,
    pub(crate) remote_description_applied: bool,
    /// Both sides agreed to the call (Accept sent by the callee, received by the caller)
    pub(crate) accepted: bool,
    /// A remote offer is waiting for a track before it can be answered
    pub(crate) answer_pending: bool,
    /// A track was attached while no offer could go out
    pub(crate) offer_pending: bool,
    pub(crate) link: Option<Arc<dyn MediaLink>>,
    pub(crate) timers: SessionTimers,
}

impl CallSession {
    /// New session in `Idle`; the manager transitions it right away
    pub fn new(
        call_id: CallId,
        role: CallRole,
        peer: PeerInfo,
        media_kind: MediaKind,
        timers: SessionTimers,
    ) -> Self {
        Self {
            call_id,
            role,
            peer,
            media_kind,
            state: CallState::Idle,
            created_at: Utc::now(),
            connected_at: None,
            local_tracks: HashMap::new(),
            pending_acquisitions: HashSet::new(),
            pending_enabled: HashMap::new(),
            candidate_queue: CandidateQueue::new(),
            remote_description_applied: false,
            accepted: false,
            answer_pending: false,
            offer_pending: false,
            link: None,
            timers,
        }
    }

    /// Call identifier
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Local role
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Remote participant
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Current media kind
    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// First time the link reported connected
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Move to `to`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` and leaves the state untouched if the
    /// state machine does not allow the move.
    pub fn transition(&mut self, to: CallState) -> Result<CallState, CallError> {
        let from = self.state;
        if !is_valid_transition(from, to) {
            return Err(CallError::InvalidStateTransition {
                state: from,
                trigger: format!("transition to {to:?}"),
            });
        }
        self.state = to;
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        Ok(from)
    }

    /// Stamp `connected_at` the first time only; returns whether it was stamped
    pub fn mark_connected(&mut self) -> bool {
        if self.connected_at.is_some() {
            return false;
        }
        self.connected_at = Some(Utc::now());
        true
    }

    /// Raise the media kind; a lower kind is ignored. Returns whether it changed.
    pub fn upgrade_media_kind(&mut self, kind: MediaKind) -> bool {
        let upgraded = self.media_kind.upgraded_with(kind);
        if upgraded == self.media_kind {
            return false;
        }
        self.media_kind = upgraded;
        true
    }

    /// Track of `kind`, if acquired
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.local_tracks.get(&kind)
    }

    /// Whether a track of `kind` is held or on its way
    pub fn has_or_awaits_track(&self, kind: TrackKind) -> bool {
        self.local_tracks.contains_key(&kind) || self.pending_acquisitions.contains(&kind)
    }

    /// Whether a local offer may be sent now
    ///
    /// Needs both sides agreed, no answer owed, no acquisition in flight and,
    /// for the callee, the caller's first offer applied.
    pub fn may_offer(&self) -> bool {
        self.accepted
            && !self.answer_pending
            && self.pending_acquisitions.is_empty()
            && (self.role == CallRole::Caller || self.remote_description_applied)
    }

    /// Read-only view for the UI
    pub fn snapshot(&self) -> CallSnapshot {
        let mut local_tracks: Vec<(TrackKind, bool)> = self
            .local_tracks
            .values()
            .map(|t| (t.kind, t.enabled))
            .collect();
        local_tracks.sort_by_key(|(kind, _)| matches!(kind, TrackKind::Video));
        CallSnapshot {
            call_id: self.call_id,
            role: self.role,
            peer: self.peer.clone(),
            media_kind: self.media_kind,
            state: self.state,
            created_at: self.created_at,
            connected_at: self.connected_at,
            local_tracks,
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("peer", &self.peer.id)
            .field("media_kind", &self.media_kind)
            .field("state", &self.state)
            .field("tracks", &self.local_tracks.len())
            .field("queued_candidates", &self.candidate_queue.len())
            .field("accepted", &self.accepted)
            .field("pending", &self.pending_acquisitions)
            .field("offer_pending", &self.offer_pending)
            .field("timers", &self.timers)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    fn session(kind: MediaKind) -> CallSession {
        let call_id = CallId::new();
        CallSession::new(
            call_id,
            CallRole::Caller,
            PeerInfo::anonymous(PeerId::new("bob")),
            kind,
            SessionTimers::new(call_id, |_| {}),
        )
    }

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(CallState::Idle, CallState::Dialing));
        assert!(is_valid_transition(CallState::Idle, CallState::RingingIncoming));
        assert!(is_valid_transition(CallState::Dialing, CallState::Negotiating));
        assert!(is_valid_transition(CallState::Dialing, CallState::Idle));
        assert!(is_valid_transition(CallState::RingingIncoming, CallState::Negotiating));
        assert!(is_valid_transition(CallState::Negotiating, CallState::Connected));
        assert!(is_valid_transition(CallState::Connected, CallState::Ending));
        assert!(is_valid_transition(CallState::Ending, CallState::Idle));

        assert!(!is_valid_transition(CallState::Idle, CallState::Connected));
        assert!(!is_valid_transition(CallState::Connected, CallState::Dialing));
        assert!(!is_valid_transition(CallState::Connected, CallState::Negotiating));
        assert!(!is_valid_transition(CallState::Ending, CallState::Connected));
        assert!(!is_valid_transition(CallState::Dialing, CallState::Connected));
    }

    #[tokio::test]
    async fn test_invalid_transition_keeps_state() {
        let mut s = session(MediaKind::Audio);
        s.transition(CallState::Dialing).unwrap();
        let err = s.transition(CallState::Connected).unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidStateTransition {
                state: CallState::Dialing,
                ..
            }
        ));
        assert_eq!(s.state(), CallState::Dialing);
    }

    #[tokio::test]
    async fn test_connected_at_stamped_once() {
        let mut s = session(MediaKind::Audio);
        assert!(s.mark_connected());
        let first = s.connected_at();
        assert!(!s.mark_connected());
        assert_eq!(s.connected_at(), first);
    }

    #[tokio::test]
    async fn test_media_kind_never_downgrades() {
        let mut s = session(MediaKind::Audio);
        assert!(s.upgrade_media_kind(MediaKind::Video));
        assert!(!s.upgrade_media_kind(MediaKind::Video));
        assert!(!s.upgrade_media_kind(MediaKind::Audio));
        assert_eq!(s.media_kind(), MediaKind::Video);
    }

    #[tokio::test]
    async fn test_snapshot_lists_tracks_audio_first() {
        let mut s = session(MediaKind::Video);
        s.local_tracks
            .insert(TrackKind::Video, LocalTrack::new("cam-0", TrackKind::Video));
        let mut mic = LocalTrack::new("mic-0", TrackKind::Audio);
        mic.enabled = false;
        s.local_tracks.insert(TrackKind::Audio, mic);

        let snap = s.snapshot();
        assert_eq!(
            snap.local_tracks,
            vec![(TrackKind::Audio, false), (TrackKind::Video, true)]
        );
    }

    #[tokio::test]
    async fn test_pending_camera_counts_as_awaited() {
        let mut s = session(MediaKind::Audio);
        assert!(!s.has_or_awaits_track(TrackKind::Video));
        s.pending_acquisitions.insert(TrackKind::Video);
        assert!(s.has_or_awaits_track(TrackKind::Video));
        assert!(s.snapshot().local_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_callee_offers_only_after_first_remote_offer() {
        let call_id = CallId::new();
        let mut s = CallSession::new(
            call_id,
            CallRole::Callee,
            PeerInfo::anonymous(PeerId::new("alice")),
            MediaKind::Audio,
            SessionTimers::new(call_id, |_| {}),
        );
        assert!(!s.may_offer());
        s.accepted = true;
        assert!(!s.may_offer());
        s.remote_description_applied = true;
        assert!(s.may_offer());
        s.answer_pending = true;
        assert!(!s.may_offer());
        s.answer_pending = false;
        s.pending_acquisitions.insert(TrackKind::Video);
        assert!(!s.may_offer());
    }

    #[tokio::test]
    async fn test_caller_offers_once_accepted_and_idle() {
        let mut s = session(MediaKind::Audio);
        assert!(!s.may_offer());
        s.accepted = true;
        assert!(s.may_offer());
        s.pending_acquisitions.insert(TrackKind::Audio);
        assert!(!s.may_offer());
    }
}
