//! In-memory collaborators
//!
//! Everything a [`CallManager`](crate::call::CallManager) needs, without a
//! network or capture hardware: a signaling hub routing envelopes between
//! endpoints in the same process, a media link that fakes SDP and
//! connectivity, and capture devices that hand out numbered tracks. Tests and
//! the CLI simulator run whole calls on top of these.

use crate::identity::PeerId;
use crate::media::{
    DeviceCapture, IceCandidate, LinkState, LocalTrack, MediaError, MediaEventSink, MediaLink,
    MediaLinkEvent, MediaLinkFactory, SdpType, SessionDescription,
};
use crate::signaling::{SignalEnvelope, SignalPayload, SignalingError, SignalingPort};
use crate::types::{CallId, MediaKind, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct HubInner {
    mailboxes: HashMap<PeerId, mpsc::UnboundedSender<SignalEnvelope>>,
    sent: Vec<(PeerId, SignalEnvelope)>,
    fail_sends: bool,
}

/// Routes envelopes between endpoints of the same process
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    /// Empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` and return its signaling port
    ///
    /// Registering the same peer again replaces its mailbox.
    pub fn endpoint(&self, peer: impl Into<PeerId>) -> Arc<LoopbackSignaling> {
        let id = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().mailboxes.insert(id.clone(), tx);
        Arc::new(LoopbackSignaling {
            id,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Unregister `peer`; envelopes to it fail from now on
    pub fn disconnect(&self, peer: &PeerId) {
        self.inner.lock().mailboxes.remove(peer);
    }

    /// Make every send fail with `Unavailable`
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.lock().fail_sends = fail;
    }

    /// Every delivered envelope with its recipient, in send order
    pub fn sent(&self) -> Vec<(PeerId, SignalEnvelope)> {
        self.inner.lock().sent.clone()
    }

    /// Payloads delivered to `peer`, in send order
    pub fn sent_to(&self, peer: &PeerId) -> Vec<SignalPayload> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, envelope)| envelope.payload.clone())
            .collect()
    }

    fn route(&self, to: &PeerId, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        if inner.fail_sends {
            return Err(SignalingError::Unavailable("send failure injected".to_string()));
        }
        let mailbox = inner
            .mailboxes
            .get(to)
            .ok_or_else(|| SignalingError::Unavailable(format!("peer {to} not connected")))?;
        mailbox
            .send(envelope.clone())
            .map_err(|_| SignalingError::Unavailable(format!("peer {to} went away")))?;
        inner.sent.push((to.clone(), envelope));
        Ok(())
    }
}

/// One endpoint of a [`LoopbackHub`]
pub struct LoopbackSignaling {
    id: PeerId,
    hub: LoopbackHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalEnvelope>>,
}

impl LoopbackSignaling {
    /// Peer this endpoint belongs to
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Next envelope if one is waiting and nobody else is receiving
    pub fn try_next(&self) -> Option<SignalEnvelope> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }

    /// Send as this endpoint without going through a manager
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the hub refuses the envelope.
    pub fn inject(
        &self,
        to: &PeerId,
        call_id: CallId,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        self.hub
            .route(to, SignalEnvelope::new(call_id, self.id.clone(), payload))
    }
}

#[async_trait]
impl SignalingPort for LoopbackSignaling {
    async fn send(&self, peer: &PeerId, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.hub.route(peer, envelope)
    }

    async fn receive(&self) -> Result<SignalEnvelope, SignalingError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }
}

#[derive(Default)]
struct LinkInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(String, TrackKind)>,
    applied_candidates: Vec<IceCandidate>,
    remote_kinds: HashSet<TrackKind>,
    calls: Vec<&'static str>,
    generation: u32,
    connected: bool,
    closed: bool,
}

/// Media link that fakes negotiation
///
/// Descriptions are minimal SDP with an `m=audio` section and, when video is
/// involved, an `m=video` section. Applying a local description produces one
/// host candidate. Once both descriptions are applied the link reports
/// `Connecting` then `Connected`, unless auto-connect is off.
pub struct SimulatedMediaLink {
    call_id: CallId,
    events: MediaEventSink,
    auto_connect: bool,
    inner: Mutex<LinkInner>,
}

impl SimulatedMediaLink {
    fn new(call_id: CallId, events: MediaEventSink, auto_connect: bool) -> Self {
        Self {
            call_id,
            events,
            auto_connect,
            inner: Mutex::new(LinkInner::default()),
        }
    }

    /// Call the link was opened for
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied_candidates.clone()
    }

    /// Names of the link operations invoked, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.lock().calls.clone()
    }

    /// Kinds of the tracks currently being sent
    pub fn sender_kinds(&self) -> Vec<TrackKind> {
        self.inner.lock().senders.iter().map(|(_, k)| *k).collect()
    }

    /// Last applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    /// Last applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Report a connection state as if the network changed
    pub fn report_state(&self, state: LinkState) {
        if state == LinkState::Connected {
            self.inner.lock().connected = true;
        }
        self.events
            .emit(MediaLinkEvent::ConnectionStateChanged(state));
    }

    fn render(inner: &mut LinkInner, sdp_type: SdpType, video: bool) -> SessionDescription {
        inner.generation += 1;
        let version = inner.generation;
        let mut sdp = format!(
            "v=0\r\no=- 4611 {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\n"
        );
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=rtpmap:96 VP8/90000\r\n");
        }
        SessionDescription::new(sdp_type, sdp)
    }

    /// Emits Connecting/Connected the first time both descriptions are in place
    fn maybe_connect(&self, inner: &mut LinkInner) -> bool {
        if !self.auto_connect || inner.connected || inner.local.is_none() || inner.remote.is_none()
        {
            return false;
        }
        inner.connected = true;
        true
    }

    fn check_open(inner: &LinkInner) -> Result<(), MediaError> {
        if inner.closed {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaLink for SimulatedMediaLink {
    async fn create_offer(&self, kind: MediaKind) -> Result<SessionDescription, MediaError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.calls.push("create_offer");
        let video =
            kind.includes_video() || inner.senders.iter().any(|(_, k)| *k == TrackKind::Video);
        Ok(Self::render(&mut inner, SdpType::Offer, video))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.calls.push("create_answer");
        let video = match &inner.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => remote.has_video(),
            _ => {
                return Err(MediaError::Negotiation(
                    "no remote offer to answer".to_string(),
                ))
            }
        };
        Ok(Self::render(&mut inner, SdpType::Answer, video))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let connect = {
            let mut inner = self.inner.lock();
            Self::check_open(&inner)?;
            inner.calls.push("set_local_description");
            inner.local = Some(description);
            self.maybe_connect(&mut inner)
        };
        let port = 50_000 + (self.inner.lock().generation % 1000);
        self.events
            .emit(MediaLinkEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        if connect {
            self.report_state(LinkState::Connecting);
            self.report_state(LinkState::Connected);
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let mut new_kinds = Vec::new();
        let connect = {
            let mut inner = self.inner.lock();
            Self::check_open(&inner)?;
            inner.calls.push("set_remote_description");
            let mut kinds = vec![TrackKind::Audio];
            if description.has_video() {
                kinds.push(TrackKind::Video);
            }
            for kind in kinds {
                if inner.remote_kinds.insert(kind) {
                    new_kinds.push(kind);
                }
            }
            inner.remote = Some(description);
            self.maybe_connect(&mut inner)
        };
        for kind in new_kinds {
            self.events.emit(MediaLinkEvent::RemoteTrack(kind));
        }
        if connect {
            self.report_state(LinkState::Connecting);
            self.report_state(LinkState::Connected);
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if inner.remote.is_none() {
            return Err(MediaError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        inner.calls.push("add_candidate");
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.calls.push("add_track");
        inner.senders.push((track.id.clone(), track.kind));
        Ok(())
    }

    async fn remove_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.calls.push("remove_track");
        inner.senders.retain(|(id, _)| *id != track.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        let first = {
            let mut inner = self.inner.lock();
            let first = !inner.closed;
            inner.closed = true;
            inner.calls.push("close");
            first
        };
        if first {
            self.report_state(LinkState::Closed);
        }
        Ok(())
    }
}

/// Opens [`SimulatedMediaLink`]s and keeps them for inspection
pub struct SimulatedLinkFactory {
    auto_connect: bool,
    fail_open: Mutex<Option<MediaError>>,
    links: Mutex<Vec<Arc<SimulatedMediaLink>>>,
}

impl Default for SimulatedLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLinkFactory {
    /// Links connect as soon as both descriptions are applied
    pub fn new() -> Self {
        Self {
            auto_connect: true,
            fail_open: Mutex::new(None),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Links never connect on their own; use [`SimulatedMediaLink::report_state`]
    pub fn without_auto_connect() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self, error: MediaError) {
        *self.fail_open.lock() = Some(error);
    }

    /// Every link opened so far
    pub fn links(&self) -> Vec<Arc<SimulatedMediaLink>> {
        self.links.lock().clone()
    }

    /// Most recently opened link
    pub fn last(&self) -> Option<Arc<SimulatedMediaLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl MediaLinkFactory for SimulatedLinkFactory {
    async fn open(
        &self,
        call_id: CallId,
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaLink>, MediaError> {
        if let Some(error) = self.fail_open.lock().take() {
            return Err(error);
        }
        let link = Arc::new(SimulatedMediaLink::new(call_id, events, self.auto_connect));
        self.links.lock().push(link.clone());
        tracing::debug!(call_id = %call_id, "Opened simulated media link");
        Ok(link)
    }
}

#[derive(Default)]
struct DevicesInner {
    next_id: u32,
    acquired: HashMap<TrackKind, u32>,
    released: u32,
    live: HashSet<String>,
    failures: HashMap<TrackKind, MediaError>,
    enabled_log: Vec<(String, bool)>,
}

/// Capture devices that hand out numbered tracks
#[derive(Default)]
pub struct SimulatedDevices {
    delay: Duration,
    inner: Mutex<DevicesInner>,
}

impl SimulatedDevices {
    /// Devices that answer immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices that take `delay` per acquisition, like a permission prompt
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make every acquisition of `kind` fail with `error`
    pub fn fail(&self, kind: TrackKind, error: MediaError) {
        self.inner.lock().failures.insert(kind, error);
    }

    /// Let `kind` succeed again
    pub fn heal(&self, kind: TrackKind) {
        self.inner.lock().failures.remove(&kind);
    }

    /// Successful acquisitions of `kind`
    pub fn acquire_count(&self, kind: TrackKind) -> u32 {
        self.inner.lock().acquired.get(&kind).copied().unwrap_or(0)
    }

    /// Releases so far
    pub fn release_count(&self) -> u32 {
        self.inner.lock().released
    }

    /// Tracks acquired and not yet released
    pub fn live_tracks(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Every `set_enabled` call, in order
    pub fn enabled_log(&self) -> Vec<(String, bool)> {
        self.inner.lock().enabled_log.clone()
    }
}

#[async_trait]
impl DeviceCapture for SimulatedDevices {
    async fn acquire(&self, kind: TrackKind) -> Result<LocalTrack, MediaError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut inner = self.inner.lock();
        if let Some(error) = inner.failures.get(&kind) {
            return Err(error.clone());
        }
        inner.next_id += 1;
        let id = format!("{kind}-{}", inner.next_id);
        *inner.acquired.entry(kind).or_insert(0) += 1;
        inner.live.insert(id.clone());
        Ok(LocalTrack::new(id, kind))
    }

    async fn release(&self, track: LocalTrack) {
        let mut inner = self.inner.lock();
        if inner.live.remove(&track.id) {
            inner.released += 1;
        } else {
            tracing::warn!(track = %track.id, "Released a track that was not live");
        }
    }

    async fn set_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        if !inner.live.contains(&track.id) {
            return Err(MediaError::DeviceNotFound(track.id.clone()));
        }
        inner.enabled_log.push((track.id.clone(), enabled));
        Ok(())
    }
}
