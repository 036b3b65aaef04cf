//! Call session management
//!
//! [`CallManager`] is the single authority over the active call. Local
//! intents, signaling envelopes, media link events, timer expiries and device
//! completions all enter one trigger queue and are handled one at a time, to
//! completion. Nothing else mutates the session.
//!
//! ```text
//!   UI ──CallManagerHandle──┐
//!   SignalingPort ──pump────┤
//!   MediaLink events ───────┼──▶ trigger queue ──▶ CallManager ──▶ CallEvent broadcast
//!   SessionTimers ──────────┤                          │
//!   DeviceCapture tasks ────┘                          └──▶ SignalingPort / MediaLink
//! ```
//!
//! Device acquisition can take as long as a permission prompt, so it runs on a
//! separate task. Its completion re-enters the queue tagged with the call it
//! was started for; a completion for a call that is gone releases its tracks.

use crate::identity::{PeerId, PeerInfo};
use crate::media::{
    DeviceCapture, IceCandidate, LinkState, LocalTrack, MediaError, MediaEventSink, MediaLink,
    MediaLinkEvent, MediaLinkFactory, SessionDescription,
};
use crate::session::CallSession;
use crate::signaling::{
    RejectReason, SignalEnvelope, SignalPayload, SignalingError, SignalingHandler, SignalingPort,
};
use crate::timers::{SessionTimers, TimerFired, TimerKind};
use crate::types::{
    CallEvent, CallId, CallRole, CallSnapshot, CallState, EndReason, MediaKind, TrackKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallError {
    /// The user or OS refused microphone/camera access
    #[error("Device access denied: {0}")]
    DeviceAccessDenied(String),

    /// The capture device is missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The signaling channel could not deliver
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// The peer is already in a call
    #[error("Peer is busy")]
    PeerBusy,

    /// The peer is not reachable
    #[error("Peer is offline")]
    PeerOffline,

    /// The peer blocked us
    #[error("Peer blocked the call")]
    PeerBlocked,

    /// The media link did not connect in time
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    /// Nobody answered in time
    #[error("No answer")]
    DialTimeout,

    /// The media link went down after connecting
    #[error("Connection lost")]
    ConnectionLost,

    /// The trigger is not allowed in the current state; nothing changed
    #[error("Invalid state transition: {trigger} in {state:?}")]
    InvalidStateTransition {
        /// State the session was in
        state: CallState,
        /// What was attempted
        trigger: String,
    },

    /// A call is already active
    #[error("Already in a call")]
    AlreadyInCall,

    /// No call is active
    #[error("No active call")]
    NoActiveCall,

    /// A description or link operation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The manager task is gone
    #[error("Call manager stopped")]
    ManagerStopped,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => CallError::DeviceAccessDenied(msg),
            MediaError::DeviceNotFound(msg) => CallError::DeviceUnavailable(msg),
            MediaError::Negotiation(msg) => CallError::NegotiationFailed(msg),
            MediaError::Closed => CallError::NegotiationFailed("media link closed".to_string()),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingUnavailable(err.to_string())
    }
}

impl CallError {
    /// Whether the failure came from the capture devices
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            CallError::DeviceAccessDenied(_) | CallError::DeviceUnavailable(_)
        )
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// How long an outgoing call rings before giving up
    pub dial_timeout_ms: u64,
    /// How long the media link may take to connect after both sides accepted
    pub connect_timeout_ms: u64,
    /// Period of dial progress notifications
    pub dial_progress_interval_ms: u64,
    /// Period of duration ticks while connected
    pub duration_tick_ms: u64,
    /// Buffered notifications per subscriber
    pub event_channel_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 20_000,
            connect_timeout_ms: 30_000,
            dial_progress_interval_ms: 1_000,
            duration_tick_ms: 1_000,
            event_channel_capacity: 100,
        }
    }
}

impl CallManagerConfig {
    /// Dial window
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Connect window
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Dial progress period, never zero
    pub fn dial_progress_interval(&self) -> Duration {
        Duration::from_millis(self.dial_progress_interval_ms.max(1))
    }

    /// Duration tick period, never zero
    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms.max(1))
    }
}

/// External collaborators of the manager
#[derive(Clone)]
pub struct CallPorts {
    /// Envelope transport to peers
    pub signaling: Arc<dyn SignalingPort>,
    /// Opens one media link per call
    pub links: Arc<dyn MediaLinkFactory>,
    /// Microphone and camera
    pub devices: Arc<dyn DeviceCapture>,
}

/// What a device acquisition is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquirePurpose {
    /// Tracks for the negotiated media kind, right after both sides agreed
    Setup,
    /// Camera for a remote offer that added video
    Upgrade,
    /// A track the local user switched on
    Toggle(TrackKind),
}

/// Ties an asynchronous operation to the call that started it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OperationToken {
    call_id: CallId,
    purpose: AcquirePurpose,
}

#[derive(Debug)]
enum Intent {
    StartCall {
        call_id: CallId,
        peer: PeerInfo,
        media_kind: MediaKind,
    },
    AcceptIncoming,
    RejectIncoming(RejectReason),
    CancelOutgoing,
    EndCall,
    ToggleMic,
    ToggleCamera,
}

#[derive(Debug)]
enum Trigger {
    Intent {
        intent: Intent,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Snapshot(oneshot::Sender<Option<CallSnapshot>>),
    Signal(SignalEnvelope),
    Media {
        call_id: CallId,
        event: MediaLinkEvent,
    },
    Timer(TimerFired),
    DeviceReady {
        token: OperationToken,
        kinds: Vec<TrackKind>,
        result: Result<Vec<LocalTrack>, MediaError>,
    },
    Shutdown,
}

enum Termination {
    Ended(EndReason),
    Failed(CallError),
}

/// Call manager
///
/// Owns at most one [`CallSession`]. Drive it either with [`CallManager::run`]
/// on its own task and talk to it through a [`CallManagerHandle`], or call the
/// intent methods directly and pump queued triggers with
/// [`CallManager::step`].
///
/// Second attempts while a call is active never touch the active session: a
/// local `start_call` fails with [`CallError::AlreadyInCall`] and a remote
/// `StartRequest` is answered with `Reject(busy)`.
pub struct CallManager {
    local: PeerInfo,
    config: CallManagerConfig,
    signaling: Arc<SignalingHandler>,
    links: Arc<dyn MediaLinkFactory>,
    devices: Arc<dyn DeviceCapture>,
    session: Option<CallSession>,
    triggers_tx: mpsc::UnboundedSender<Trigger>,
    triggers_rx: mpsc::UnboundedReceiver<Trigger>,
    event_sender: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Create a manager for the local participant `local`
    pub fn new(local: PeerInfo, config: CallManagerConfig, ports: CallPorts) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        Self {
            local,
            config,
            signaling: Arc::new(SignalingHandler::new(ports.signaling)),
            links: ports.links,
            devices: ports.devices,
            session: None,
            triggers_tx,
            triggers_rx,
            event_sender,
        }
    }

    /// Local participant
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    /// Active configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Cloneable handle for the UI layer
    pub fn handle(&self) -> CallManagerHandle {
        CallManagerHandle {
            triggers: self.triggers_tx.clone(),
            events: self.event_sender.clone(),
        }
    }

    /// Current state, `Idle` when no call is active
    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map_or(CallState::Idle, CallSession::state)
    }

    /// View of the active call
    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.as_ref().map(CallSession::snapshot)
    }

    /// Run the actor loop until [`CallManagerHandle::shutdown`]
    ///
    /// Also pumps the signaling port into the trigger queue.
    pub async fn run(mut self) {
        let pump = self.spawn_signal_pump();
        tracing::info!(local = %self.local.id, "Call manager running");
        while self.step().await {}
        pump.abort();
        tracing::info!(local = %self.local.id, "Call manager stopped");
    }

    /// Forward envelopes from the signaling port into the trigger queue
    ///
    /// [`CallManager::run`] does this itself; use it when driving the manager
    /// with [`CallManager::step`].
    pub fn spawn_signal_pump(&self) -> JoinHandle<()> {
        let signaling = self.signaling.clone();
        let triggers = self.triggers_tx.clone();
        tokio::spawn(async move {
            loop {
                match signaling.receive().await {
                    Ok(envelope) => {
                        if triggers.send(Trigger::Signal(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(SignalingError::Closed) => {
                        tracing::debug!("Signaling channel closed, stopping pump");
                        break;
                    }
                    // the handler already logged and backed off
                    Err(_) => {}
                }
            }
        })
    }

    /// Wait for the next queued trigger and handle it
    ///
    /// Returns `false` once a shutdown was requested.
    pub async fn step(&mut self) -> bool {
        match self.triggers_rx.recv().await {
            Some(trigger) => self.dispatch(trigger).await,
            None => false,
        }
    }

    /// Handle one trigger if one is already queued; returns whether one was
    pub async fn try_step(&mut self) -> bool {
        match self.triggers_rx.try_recv() {
            Ok(trigger) => {
                self.dispatch(trigger).await;
                true
            }
            Err(_) => false,
        }
    }

    async fn dispatch(&mut self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Intent { intent, reply } => {
                let result = self.apply_intent(intent).await;
                let _ = reply.send(result);
            }
            Trigger::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Trigger::Signal(envelope) => self.handle_signal(envelope).await,
            Trigger::Media { call_id, event } => self.on_media_event(call_id, event).await,
            Trigger::Timer(fired) => self.on_timer(fired).await,
            Trigger::DeviceReady {
                token,
                kinds,
                result,
            } => self.on_device_ready(token, kinds, result).await,
            Trigger::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn apply_intent(&mut self, intent: Intent) -> Result<(), CallError> {
        match intent {
            Intent::StartCall {
                call_id,
                peer,
                media_kind,
            } => self.begin_outgoing(call_id, peer, media_kind).await,
            Intent::AcceptIncoming => self.accept_incoming().await,
            Intent::RejectIncoming(reason) => self.reject_incoming(reason).await,
            Intent::CancelOutgoing => self.cancel_outgoing().await,
            Intent::EndCall => self.end_call().await,
            Intent::ToggleMic => self.toggle_mic().await,
            Intent::ToggleCamera => self.toggle_camera().await,
        }
    }

    // ----- local intents -----

    /// Call `peer`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` if a call is active, or `SignalingUnavailable`
    /// if the `StartRequest` could not be sent. In the latter case the call
    /// had already entered `Dialing`, so subscribers also get its terminal
    /// [`CallEvent::Error`].
    #[tracing::instrument(skip(self, peer), fields(peer = %peer.id))]
    pub async fn start_call(
        &mut self,
        peer: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        self.begin_outgoing(call_id, peer, media_kind).await?;
        Ok(call_id)
    }

    async fn begin_outgoing(
        &mut self,
        call_id: CallId,
        peer: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<(), CallError> {
        if let Some(active) = &self.session {
            tracing::warn!(active_call = %active.call_id(), "Already in a call, refusing to dial");
            return Err(CallError::AlreadyInCall);
        }

        let timers = self.session_timers(call_id);
        self.session = Some(CallSession::new(
            call_id,
            CallRole::Caller,
            peer,
            media_kind,
            timers,
        ));
        self.move_to(CallState::Dialing)?;
        if let Some(session) = self.session.as_mut() {
            session
                .timers
                .arm_once(TimerKind::Dial, self.config.dial_timeout());
            session
                .timers
                .arm_periodic(TimerKind::DialProgress, self.config.dial_progress_interval());
        }
        tracing::info!(call_id = %call_id, media_kind = %media_kind, "Dialing");

        let start = SignalPayload::StartRequest {
            media_kind,
            caller: self.local.clone(),
        };
        if let Err(error) = self.send_to_peer(start).await {
            self.terminate(Termination::Failed(error.clone()), None)
                .await;
            return Err(error);
        }
        Ok(())
    }

    /// Take the ringing incoming call
    ///
    /// Opens the media link and starts acquiring the capture tracks; `Accept`
    /// goes out once they are attached.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` or `InvalidStateTransition` if nothing is
    /// ringing. A failure to open the link ends the call: the error is
    /// returned and also broadcast as the call's terminal
    /// [`CallEvent::Error`].
    #[tracing::instrument(skip(self))]
    pub async fn accept_incoming(&mut self) -> Result<(), CallError> {
        self.require_state("accept_incoming", &[CallState::RingingIncoming])?;
        self.move_to(CallState::Negotiating)?;
        if let Err(error) = self.enter_negotiation().await {
            self.fail(error.clone()).await;
            return Err(error);
        }
        Ok(())
    }

    /// Refuse the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` or `InvalidStateTransition` if nothing is ringing.
    #[tracing::instrument(skip(self))]
    pub async fn reject_incoming(&mut self, reason: RejectReason) -> Result<(), CallError> {
        self.require_state("reject_incoming", &[CallState::RingingIncoming])?;
        self.terminate(
            Termination::Ended(EndReason::Declined),
            Some(SignalPayload::Reject { reason }),
        )
        .await;
        Ok(())
    }

    /// Give up on the outgoing call
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` or `InvalidStateTransition` unless dialing.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_outgoing(&mut self) -> Result<(), CallError> {
        self.require_state("cancel_outgoing", &[CallState::Dialing])?;
        self.terminate(
            Termination::Ended(EndReason::Cancelled),
            Some(SignalPayload::Cancel),
        )
        .await;
        Ok(())
    }

    /// Hang up
    ///
    /// While dialing this cancels, while ringing it declines.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` if there is nothing to hang up.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        match self.state() {
            CallState::Idle => Err(CallError::NoActiveCall),
            CallState::Dialing => self.cancel_outgoing().await,
            CallState::RingingIncoming => self.reject_incoming(RejectReason::Declined).await,
            CallState::Negotiating | CallState::Connected => {
                self.terminate(
                    Termination::Ended(EndReason::LocalHangup),
                    Some(SignalPayload::End),
                )
                .await;
                Ok(())
            }
            CallState::Ending => Err(invalid_transition(CallState::Ending, "end_call")),
        }
    }

    /// Mute/unmute, or acquire the microphone if the call has none yet
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` before negotiation starts, or the
    /// device error if the track could not be flipped.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_mic(&mut self) -> Result<(), CallError> {
        self.toggle(TrackKind::Audio, "toggle_mic").await
    }

    /// Camera on/off, acquiring it (and upgrading to video) on first use
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` before negotiation starts, or the
    /// device error if the track could not be flipped.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_camera(&mut self) -> Result<(), CallError> {
        self.toggle(TrackKind::Video, "toggle_camera").await
    }

    async fn toggle(&mut self, kind: TrackKind, trigger: &str) -> Result<(), CallError> {
        self.require_state(trigger, &[CallState::Negotiating, CallState::Connected])?;
        let call_id = self.active_call_id()?;
        let session = self.session_mut()?;
        if session.pending_acquisitions.contains(&kind) {
            let desired = session.pending_enabled.entry(kind).or_insert(true);
            *desired = !*desired;
            tracing::debug!(call_id = %call_id, track = %kind, enabled = *desired, "Acquisition in flight, applying toggle on attach");
            return Ok(());
        }

        let enabled = match self
            .session
            .as_mut()
            .and_then(|s| s.local_tracks.get_mut(&kind))
        {
            Some(track) => {
                let enabled = !track.enabled;
                self.devices.set_enabled(track, enabled).await?;
                track.enabled = enabled;
                enabled
            }
            None => {
                tracing::info!(call_id = %call_id, track = %kind, "Acquiring track");
                return self.spawn_acquisition(AcquirePurpose::Toggle(kind), vec![kind]);
            }
        };

        tracing::debug!(call_id = %call_id, track = %kind, enabled, "Track toggled");
        self.emit(CallEvent::TrackToggled {
            call_id,
            kind,
            enabled,
        });
        Ok(())
    }

    /// End whatever call is active and stop accepting work
    pub async fn shutdown(&mut self) {
        if self.state().is_active() {
            if let Err(e) = self.end_call().await {
                tracing::warn!(error = %e, "Failed to end call during shutdown");
            }
        }
    }

    // ----- signaling -----

    /// Handle an envelope from the signaling port
    ///
    /// Envelopes for another call, or from anyone but the session peer, are
    /// dropped. `StartRequest` is the only payload accepted without a session.
    #[tracing::instrument(
        skip(self, envelope),
        fields(call_id = %envelope.call_id, from = %envelope.sender_id, message_type = envelope.payload.kind())
    )]
    pub async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope {
            call_id,
            sender_id,
            payload,
        } = envelope;

        if let SignalPayload::StartRequest { media_kind, caller } = payload {
            if let Err(e) = self
                .on_start_request(call_id, sender_id, media_kind, caller)
                .await
            {
                tracing::warn!(error = %e, "Failed to handle StartRequest");
            }
            return;
        }

        let Some(session) = self.session.as_ref() else {
            tracing::debug!("No active call, dropping envelope");
            return;
        };
        if session.call_id() != call_id {
            tracing::debug!(active_call = %session.call_id(), "Stale envelope, dropping");
            return;
        }
        if session.peer().id != sender_id {
            tracing::warn!(expected = %session.peer().id, "Envelope from unexpected sender, dropping");
            return;
        }

        let state = session.state();
        let result = match (payload, state) {
            (SignalPayload::Accept, CallState::Dialing) => self.on_remote_accept().await,
            (SignalPayload::Reject { reason }, CallState::Dialing) => {
                self.on_remote_reject(reason).await;
                Ok(())
            }
            (SignalPayload::Cancel, _) => {
                self.terminate(Termination::Ended(EndReason::RemoteCancelled), None)
                    .await;
                Ok(())
            }
            (SignalPayload::End, _) => {
                self.terminate(Termination::Ended(EndReason::RemoteHangup), None)
                    .await;
                Ok(())
            }
            (SignalPayload::Offer(offer), CallState::Negotiating | CallState::Connected) => {
                self.on_remote_offer(offer).await
            }
            (SignalPayload::Answer(answer), CallState::Negotiating | CallState::Connected) => {
                self.on_remote_answer(answer).await
            }
            (SignalPayload::Candidate(candidate), CallState::Negotiating | CallState::Connected) => {
                self.on_remote_candidate(candidate).await
            }
            (payload, state) => {
                tracing::warn!(state = ?state, trigger = payload.kind(), "Unexpected envelope for state, ignoring");
                Ok(())
            }
        };

        if let Err(error) = result {
            self.fail(error).await;
        }
    }

    async fn on_start_request(
        &mut self,
        call_id: CallId,
        sender_id: PeerId,
        media_kind: MediaKind,
        caller: PeerInfo,
    ) -> Result<(), CallError> {
        if sender_id == self.local.id {
            tracing::warn!("StartRequest from ourselves, dropping");
            return Ok(());
        }

        if let Some(active) = &self.session {
            if active.call_id() == call_id && active.peer().id == sender_id {
                tracing::debug!("Duplicate StartRequest for the active call, ignoring");
                return Ok(());
            }
            tracing::info!(active_call = %active.call_id(), "Busy, rejecting incoming call");
            let busy = SignalEnvelope::new(
                call_id,
                self.local.id.clone(),
                SignalPayload::Reject {
                    reason: RejectReason::Busy,
                },
            );
            return Ok(self.signaling.send(&sender_id, busy).await?);
        }

        let peer = if caller.id == sender_id {
            caller
        } else {
            tracing::warn!(claimed = %caller.id, "Caller profile does not match sender");
            PeerInfo::anonymous(sender_id)
        };

        let timers = self.session_timers(call_id);
        self.session = Some(CallSession::new(
            call_id,
            CallRole::Callee,
            peer.clone(),
            media_kind,
            timers,
        ));
        self.move_to(CallState::RingingIncoming)?;
        tracing::info!(call_id = %call_id, peer = %peer.id, media_kind = %media_kind, "Incoming call");
        self.emit(CallEvent::IncomingCall {
            call_id,
            peer,
            media_kind,
        });
        Ok(())
    }

    async fn on_remote_accept(&mut self) -> Result<(), CallError> {
        let session = self.session_mut()?;
        session.timers.disarm(TimerKind::Dial);
        session.timers.disarm(TimerKind::DialProgress);
        session.accepted = true;
        tracing::info!(call_id = %session.call_id(), "Call accepted by peer");
        self.move_to(CallState::Negotiating)?;
        self.enter_negotiation().await
    }

    async fn on_remote_reject(&mut self, reason: RejectReason) {
        let termination = match reason {
            RejectReason::Busy => Termination::Failed(CallError::PeerBusy),
            RejectReason::Offline => Termination::Failed(CallError::PeerOffline),
            RejectReason::Blocked => Termination::Failed(CallError::PeerBlocked),
            RejectReason::Declined | RejectReason::DeviceUnavailable => {
                Termination::Ended(EndReason::RemoteDeclined { reason })
            }
        };
        self.terminate(termination, None).await;
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        let link = self.active_link()?;
        let offered = offer.media_kind();
        link.set_remote_description(offer).await?;
        self.session_mut()?.remote_description_applied = true;
        self.flush_candidates(&link).await;

        let session = self.session_mut()?;
        if !offered.includes_video() || session.track(TrackKind::Video).is_some() {
            self.send_answer().await?;
            return self.send_held_offer().await;
        }
        session.answer_pending = true;
        if session.has_or_awaits_track(TrackKind::Video) {
            tracing::debug!("Camera already on its way, answering once attached");
            return Ok(());
        }
        tracing::info!(call_id = %session.call_id(), "Peer added video, acquiring camera");
        self.spawn_acquisition(AcquirePurpose::Upgrade, vec![TrackKind::Video])
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let link = self.active_link()?;
        link.set_remote_description(answer).await?;
        self.session_mut()?.remote_description_applied = true;
        self.flush_candidates(&link).await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        let link = self.active_link()?;
        let session = self.session_mut()?;
        let candidate = if session.remote_description_applied {
            candidate
        } else {
            match session.candidate_queue.push(candidate) {
                Ok(()) => {
                    tracing::trace!(queued = session.candidate_queue.len(), "Queued early candidate");
                    return Ok(());
                }
                Err(candidate) => candidate,
            }
        };
        if let Err(e) = link.add_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply remote candidate");
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, link: &Arc<dyn MediaLink>) {
        let queued = match self.session.as_mut() {
            Some(session) => session.candidate_queue.take_for_flush(),
            None => return,
        };
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "Flushing early candidates");
        for candidate in queued {
            if let Err(e) = link.add_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply queued candidate");
            }
        }
    }

    // ----- negotiation -----

    async fn enter_negotiation(&mut self) -> Result<(), CallError> {
        let call_id = self.active_call_id()?;
        let link = self.links.open(call_id, self.media_sink(call_id)).await?;
        let connect_timeout = self.config.connect_timeout();
        let session = self.session_mut()?;
        session.link = Some(link);
        session
            .timers
            .arm_once(TimerKind::ConnectTimeout, connect_timeout);
        let kinds = session.media_kind().required_tracks().to_vec();
        self.spawn_acquisition(AcquirePurpose::Setup, kinds)
    }

    async fn send_offer(&mut self) -> Result<(), CallError> {
        let link = self.active_link()?;
        let media_kind = self.session_ref()?.media_kind();
        let offer = link.create_offer(media_kind).await?;
        link.set_local_description(offer.clone()).await?;
        tracing::debug!(media_kind = %media_kind, "Sending offer");
        self.send_to_peer(SignalPayload::Offer(offer)).await
    }

    async fn send_answer(&mut self) -> Result<(), CallError> {
        let link = self.active_link()?;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.session_mut()?.answer_pending = false;
        tracing::debug!("Sending answer");
        self.send_to_peer(SignalPayload::Answer(answer)).await
    }

    /// Send the offer for tracks attached while none could go out
    async fn send_held_offer(&mut self) -> Result<(), CallError> {
        let session = self.session_mut()?;
        if !session.offer_pending || !session.may_offer() {
            return Ok(());
        }
        session.offer_pending = false;
        self.send_offer().await
    }

    // ----- devices -----

    fn spawn_acquisition(
        &mut self,
        purpose: AcquirePurpose,
        kinds: Vec<TrackKind>,
    ) -> Result<(), CallError> {
        let session = self.session_mut()?;
        session.pending_acquisitions.extend(kinds.iter().copied());
        let token = OperationToken {
            call_id: session.call_id(),
            purpose,
        };
        tracing::debug!(call_id = %token.call_id, purpose = ?purpose, kinds = ?kinds, "Acquiring capture tracks");

        let devices = self.devices.clone();
        let triggers = self.triggers_tx.clone();
        tokio::spawn(async move {
            let result = acquire_tracks(devices.as_ref(), &kinds).await;
            let ready = Trigger::DeviceReady {
                token,
                kinds,
                result,
            };
            if let Err(mpsc::error::SendError(Trigger::DeviceReady {
                result: Ok(tracks), ..
            })) = triggers.send(ready)
            {
                for track in tracks {
                    devices.release(track).await;
                }
            }
        });
        Ok(())
    }

    async fn on_device_ready(
        &mut self,
        token: OperationToken,
        kinds: Vec<TrackKind>,
        result: Result<Vec<LocalTrack>, MediaError>,
    ) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.call_id() == token.call_id && s.state().is_negotiable());
        if !current {
            if let Ok(tracks) = result {
                tracing::debug!(call_id = %token.call_id, count = tracks.len(), "Releasing tracks acquired for a finished call");
                for track in tracks {
                    self.devices.release(track).await;
                }
            }
            return;
        }

        if let Some(session) = self.session.as_mut() {
            for kind in &kinds {
                session.pending_acquisitions.remove(kind);
            }
        }

        let outcome = match result {
            Ok(tracks) => self.attach_tracks(token.purpose, tracks).await,
            Err(e) => {
                tracing::warn!(call_id = %token.call_id, error = %e, "Device acquisition failed");
                Err(CallError::from(e))
            }
        };
        if let Err(error) = outcome {
            self.fail(error).await;
        }
    }

    async fn attach_tracks(
        &mut self,
        purpose: AcquirePurpose,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), CallError> {
        let link = self.active_link()?;
        let kinds: Vec<TrackKind> = tracks.iter().map(|t| t.kind).collect();

        let mut replaced = Vec::new();
        {
            let session = self.session_mut()?;
            for track in tracks {
                if let Some(old) = session.local_tracks.insert(track.kind, track) {
                    replaced.push(old);
                }
            }
        }
        for old in replaced {
            self.devices.release(old).await;
        }

        let mut toggled = Vec::new();
        for kind in &kinds {
            let desired = self.session_mut()?.pending_enabled.remove(kind);
            let Some(track) = self.session.as_mut().and_then(|s| s.local_tracks.get_mut(kind))
            else {
                continue;
            };
            if desired == Some(false) {
                self.devices.set_enabled(track, false).await?;
                track.enabled = false;
            }
            link.add_track(track).await?;
            if desired.is_some() || purpose == AcquirePurpose::Toggle(*kind) {
                toggled.push((*kind, track.enabled));
            }
        }

        let session = self.session_mut()?;
        let call_id = session.call_id();
        let role = session.role();
        let upgraded =
            kinds.contains(&TrackKind::Video) && session.upgrade_media_kind(MediaKind::Video);
        if upgraded {
            tracing::info!(call_id = %call_id, "Call upgraded to video");
            self.emit(CallEvent::MediaUpgraded {
                call_id,
                media_kind: MediaKind::Video,
            });
        }
        for (kind, enabled) in toggled {
            tracing::debug!(call_id = %call_id, track = %kind, enabled, "Track toggled");
            self.emit(CallEvent::TrackToggled {
                call_id,
                kind,
                enabled,
            });
        }

        let session = self.session_mut()?;
        if purpose == AcquirePurpose::Setup && role == CallRole::Callee {
            session.accepted = true;
            return self.send_to_peer(SignalPayload::Accept).await;
        }
        if session.answer_pending {
            if !session.pending_acquisitions.is_empty() {
                tracing::debug!(call_id = %call_id, pending = ?session.pending_acquisitions, "Answer waits for pending tracks");
                return Ok(());
            }
            self.send_answer().await?;
            return self.send_held_offer().await;
        }
        if purpose != AcquirePurpose::Upgrade {
            session.offer_pending = true;
        }
        self.send_held_offer().await
    }

    // ----- media link -----

    async fn on_media_event(&mut self, call_id: CallId, event: MediaLinkEvent) {
        let Some(session) = self.session.as_ref() else {
            tracing::trace!(call_id = %call_id, "No active call, dropping media event");
            return;
        };
        if session.call_id() != call_id {
            tracing::debug!(call_id = %call_id, "Dropping event from a stale media link");
            return;
        }

        match event {
            MediaLinkEvent::NegotiationNeeded => {
                tracing::debug!(call_id = %call_id, "Media link asked for renegotiation");
            }
            MediaLinkEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send_to_peer(SignalPayload::Candidate(candidate)).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Failed to send local candidate");
                }
            }
            MediaLinkEvent::ConnectionStateChanged(LinkState::Connected) => {
                self.on_link_connected();
            }
            MediaLinkEvent::ConnectionStateChanged(link_state) if link_state.is_down() => {
                self.on_link_down(link_state).await;
            }
            MediaLinkEvent::ConnectionStateChanged(link_state) => {
                tracing::trace!(call_id = %call_id, link_state = ?link_state, "Media link state");
            }
            MediaLinkEvent::RemoteTrack(kind) => {
                tracing::debug!(call_id = %call_id, track = %kind, "Remote track added");
                self.emit(CallEvent::RemoteTrack { call_id, kind });
            }
        }
    }

    fn on_link_connected(&mut self) {
        if self.state() != CallState::Negotiating {
            return;
        }
        if let Err(e) = self.move_to(CallState::Connected) {
            tracing::warn!(error = %e, "Could not enter Connected");
            return;
        }
        let tick = self.config.duration_tick();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.timers.disarm(TimerKind::ConnectTimeout);
        if session.mark_connected() {
            session.timers.arm_periodic(TimerKind::Duration, tick);
        }
        let event = CallEvent::Connected {
            call_id: session.call_id(),
            peer: session.peer().clone(),
            media_kind: session.media_kind(),
        };
        tracing::info!(call_id = %session.call_id(), media_kind = %session.media_kind(), "Call connected");
        self.emit(event);
    }

    async fn on_link_down(&mut self, link_state: LinkState) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.state().is_negotiable() {
            return;
        }
        if link_state == LinkState::Closed && session.connected_at().is_some() {
            tracing::info!(call_id = %session.call_id(), "Media link closed");
            self.terminate(
                Termination::Ended(EndReason::ConnectionClosed),
                Some(SignalPayload::End),
            )
            .await;
            return;
        }
        let error = if session.connected_at().is_some() {
            CallError::ConnectionLost
        } else {
            CallError::NegotiationFailed(format!("media link {link_state:?} before connecting"))
        };
        tracing::warn!(call_id = %session.call_id(), link_state = ?link_state, "Media link went down");
        self.fail(error).await;
    }

    // ----- timers -----

    async fn on_timer(&mut self, fired: TimerFired) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.call_id() != fired.call_id || !session.timers.is_armed(fired.kind) {
            tracing::debug!(call_id = %fired.call_id, timer = ?fired.kind, "Ignoring stale timer");
            return;
        }

        match (fired.kind, session.state()) {
            (TimerKind::Dial, CallState::Dialing) => {
                tracing::info!(call_id = %fired.call_id, "No answer, giving up");
                self.fail(CallError::DialTimeout).await;
            }
            (TimerKind::DialProgress, CallState::Dialing) => {
                let elapsed = f64::from(fired.tick) * self.config.dial_progress_interval_ms as f64;
                let window = self.config.dial_timeout_ms.max(1) as f64;
                let ratio = (elapsed / window).clamp(0.0, 1.0) as f32;
                self.emit(CallEvent::DialProgress {
                    call_id: fired.call_id,
                    ratio,
                });
            }
            (TimerKind::ConnectTimeout, CallState::Negotiating) => {
                tracing::warn!(call_id = %fired.call_id, "Media link did not connect in time");
                self.fail(CallError::NegotiationTimeout).await;
            }
            (TimerKind::Duration, CallState::Connected) => {
                let elapsed_ms = u64::from(fired.tick) * self.config.duration_tick_ms;
                self.emit(CallEvent::DurationTick {
                    call_id: fired.call_id,
                    elapsed_secs: elapsed_ms / 1000,
                });
            }
            (kind, state) => {
                tracing::debug!(call_id = %fired.call_id, timer = ?kind, state = ?state, "Timer fired outside its state");
            }
        }
    }

    // ----- termination -----

    /// End the call because of `error`, telling the peer whatever fits the state
    async fn fail(&mut self, error: CallError) {
        let farewell = self
            .session
            .as_ref()
            .and_then(|session| farewell_for(session, &error));
        self.terminate(Termination::Failed(error), farewell).await;
    }

    /// The single exit path of every call
    ///
    /// Idempotent: the session is taken first, so a second call finds nothing.
    async fn terminate(&mut self, termination: Termination, farewell: Option<SignalPayload>) {
        if let Some(payload) = farewell {
            if let Err(e) = self.send_to_peer(payload).await {
                tracing::warn!(error = %e, "Failed to notify peer about call end");
            }
        }

        let Some(mut session) = self.session.take() else {
            return;
        };
        let call_id = session.call_id();

        if session.state().is_negotiable() {
            if let Ok(from) = session.transition(CallState::Ending) {
                self.emit(CallEvent::StateChanged {
                    call_id,
                    from,
                    to: CallState::Ending,
                });
            }
        }

        self.release_session(&mut session).await;

        if let Ok(from) = session.transition(CallState::Idle) {
            self.emit(CallEvent::StateChanged {
                call_id,
                from,
                to: CallState::Idle,
            });
        }

        match termination {
            Termination::Ended(reason) => {
                tracing::info!(call_id = %call_id, reason = ?reason, "Call ended");
                self.emit(CallEvent::Ended { call_id, reason });
            }
            Termination::Failed(error) => {
                tracing::warn!(call_id = %call_id, error = %error, "Call failed");
                self.emit(CallEvent::Error { call_id, error });
            }
        }
    }

    async fn release_session(&self, session: &mut CallSession) {
        let armed_timers = session.timers.armed_count();
        session.timers.disarm_all();
        session.candidate_queue.clear();
        session.pending_acquisitions.clear();
        session.pending_enabled.clear();
        session.answer_pending = false;
        session.offer_pending = false;

        if let Some(link) = session.link.take() {
            if let Err(e) = link.close().await {
                tracing::warn!(call_id = %session.call_id(), error = %e, "Failed to close media link");
            }
        }

        let tracks: Vec<LocalTrack> = session.local_tracks.drain().map(|(_, t)| t).collect();
        let released = tracks.len();
        for track in tracks {
            self.devices.release(track).await;
        }
        tracing::debug!(call_id = %session.call_id(), released, armed_timers, "Released call resources");
    }

    // ----- helpers -----

    fn move_to(&mut self, to: CallState) -> Result<(), CallError> {
        let session = self.session_mut()?;
        let from = session.transition(to)?;
        let call_id = session.call_id();
        self.emit(CallEvent::StateChanged { call_id, from, to });
        Ok(())
    }

    fn require_state(&self, trigger: &str, allowed: &[CallState]) -> Result<CallState, CallError> {
        let state = self.session_ref()?.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(invalid_transition(state, trigger))
        }
    }

    fn session_ref(&self) -> Result<&CallSession, CallError> {
        self.session.as_ref().ok_or(CallError::NoActiveCall)
    }

    fn session_mut(&mut self) -> Result<&mut CallSession, CallError> {
        self.session.as_mut().ok_or(CallError::NoActiveCall)
    }

    fn active_call_id(&self) -> Result<CallId, CallError> {
        Ok(self.session_ref()?.call_id())
    }

    fn active_link(&self) -> Result<Arc<dyn MediaLink>, CallError> {
        self.session_ref()?
            .link
            .clone()
            .ok_or_else(|| CallError::NegotiationFailed("no media link".to_string()))
    }

    async fn send_to_peer(&self, payload: SignalPayload) -> Result<(), CallError> {
        let session = self.session_ref()?;
        let peer = session.peer().id.clone();
        let envelope = SignalEnvelope::new(session.call_id(), self.local.id.clone(), payload);
        Ok(self.signaling.send(&peer, envelope).await?)
    }

    fn emit(&self, event: CallEvent) {
        // no subscribers is fine
        let _ = self.event_sender.send(event);
    }

    fn session_timers(&self, call_id: CallId) -> SessionTimers {
        let triggers = self.triggers_tx.clone();
        SessionTimers::new(call_id, move |fired| {
            let _ = triggers.send(Trigger::Timer(fired));
        })
    }

    fn media_sink(&self, call_id: CallId) -> MediaEventSink {
        let triggers = self.triggers_tx.clone();
        MediaEventSink::new(call_id, move |call_id, event| {
            let _ = triggers.send(Trigger::Media { call_id, event });
        })
    }
}

fn invalid_transition(state: CallState, trigger: &str) -> CallError {
    tracing::warn!(state = ?state, trigger, "Invalid state transition, ignoring");
    CallError::InvalidStateTransition {
        state,
        trigger: trigger.to_string(),
    }
}

fn farewell_for(session: &CallSession, error: &CallError) -> Option<SignalPayload> {
    match session.state() {
        CallState::Dialing => Some(SignalPayload::Cancel),
        CallState::RingingIncoming => Some(SignalPayload::Reject {
            reason: RejectReason::Declined,
        }),
        // the caller is still dialing until it sees our Accept
        CallState::Negotiating | CallState::Connected
            if session.role() == CallRole::Callee && !session.accepted =>
        {
            let reason = if error.is_device_error() {
                RejectReason::DeviceUnavailable
            } else {
                RejectReason::Declined
            };
            Some(SignalPayload::Reject { reason })
        }
        CallState::Negotiating | CallState::Connected => Some(SignalPayload::End),
        CallState::Idle | CallState::Ending => None,
    }
}

/// Acquire every kind or nothing
async fn acquire_tracks(
    devices: &dyn DeviceCapture,
    kinds: &[TrackKind],
) -> Result<Vec<LocalTrack>, MediaError> {
    let mut tracks = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match devices.acquire(*kind).await {
            Ok(track) => tracks.push(track),
            Err(e) => {
                for track in tracks {
                    devices.release(track).await;
                }
                return Err(e);
            }
        }
    }
    Ok(tracks)
}

/// Cloneable handle to a running [`CallManager`]
///
/// Every intent is queued behind whatever the manager is doing and answered
/// once handled.
#[derive(Clone)]
pub struct CallManagerHandle {
    triggers: mpsc::UnboundedSender<Trigger>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManagerHandle {
    async fn request(&self, intent: Intent) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.triggers
            .send(Trigger::Intent { intent, reply })
            .map_err(|_| CallError::ManagerStopped)?;
        response.await.map_err(|_| CallError::ManagerStopped)?
    }

    /// Call `peer`
    ///
    /// # Errors
    ///
    /// See [`CallManager::start_call`]; `ManagerStopped` if the manager is gone.
    pub async fn start_call(
        &self,
        peer: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        self.request(Intent::StartCall {
            call_id,
            peer,
            media_kind,
        })
        .await?;
        Ok(call_id)
    }

    /// Take the ringing incoming call
    ///
    /// # Errors
    ///
    /// See [`CallManager::accept_incoming`].
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(Intent::AcceptIncoming).await
    }

    /// Refuse the ringing incoming call
    ///
    /// # Errors
    ///
    /// See [`CallManager::reject_incoming`].
    pub async fn reject_incoming(&self, reason: RejectReason) -> Result<(), CallError> {
        self.request(Intent::RejectIncoming(reason)).await
    }

    /// Give up on the outgoing call
    ///
    /// # Errors
    ///
    /// See [`CallManager::cancel_outgoing`].
    pub async fn cancel_outgoing(&self) -> Result<(), CallError> {
        self.request(Intent::CancelOutgoing).await
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// See [`CallManager::end_call`].
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Intent::EndCall).await
    }

    /// Mute/unmute
    ///
    /// # Errors
    ///
    /// See [`CallManager::toggle_mic`].
    pub async fn toggle_mic(&self) -> Result<(), CallError> {
        self.request(Intent::ToggleMic).await
    }

    /// Camera on/off
    ///
    /// # Errors
    ///
    /// See [`CallManager::toggle_camera`].
    pub async fn toggle_camera(&self) -> Result<(), CallError> {
        self.request(Intent::ToggleCamera).await
    }

    /// View of the active call
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager is gone.
    pub async fn snapshot(&self) -> Result<Option<CallSnapshot>, CallError> {
        let (reply, response) = oneshot::channel();
        self.triggers
            .send(Trigger::Snapshot(reply))
            .map_err(|_| CallError::ManagerStopped)?;
        response.await.map_err(|_| CallError::ManagerStopped)
    }

    /// Push an envelope received outside the signaling port
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager is gone.
    pub fn deliver_signal(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        self.triggers
            .send(Trigger::Signal(envelope))
            .map_err(|_| CallError::ManagerStopped)
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// End the active call and stop the manager loop
    pub fn shutdown(&self) {
        let _ = self.triggers.send(Trigger::Shutdown);
    }
}

impl std::fmt::Debug for CallManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerHandle")
            .field("closed", &self.triggers.is_closed())
            .finish()
    }
}
