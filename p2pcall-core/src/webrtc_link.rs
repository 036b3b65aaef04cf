//! Media Link backed by the `webrtc` crate
//!
//! One `RTCPeerConnection` per call. Local capture tracks are represented by
//! `TrackLocalStaticSample` senders (Opus for audio, VP8 for video); the
//! capture pipeline writes samples into them through
//! [`WebRtcMediaLink::sample_track`]. Peer connection callbacks are mapped onto
//! [`MediaLinkEvent`]s.

use crate::media::{
    IceCandidate, LinkState, LocalTrack, MediaError, MediaEventSink, MediaLink, MediaLinkEvent,
    MediaLinkFactory, SdpType, SessionDescription,
};
use crate::types::{CallId, MediaKind, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "p2pcall";

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcLinkConfig {
    /// STUN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcLinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

fn negotiation(err: webrtc::Error) -> MediaError {
    MediaError::Negotiation(err.to_string())
}

/// Opens one `RTCPeerConnection` per call
pub struct WebRtcLinkFactory {
    config: WebRtcLinkConfig,
}

impl WebRtcLinkFactory {
    /// Factory using `config` for every connection
    pub fn new(config: WebRtcLinkConfig) -> Self {
        Self { config }
    }

    fn build_api() -> Result<API, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(negotiation)?;
        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

impl Default for WebRtcLinkFactory {
    fn default() -> Self {
        Self::new(WebRtcLinkConfig::default())
    }
}

#[async_trait]
impl MediaLinkFactory for WebRtcLinkFactory {
    async fn open(
        &self,
        call_id: CallId,
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaLink>, MediaError> {
        let api = Self::build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| {
                    tracing::error!(call_id = %call_id, error = %e, "Failed to create peer connection");
                    negotiation(e)
                })?,
        );
        wire_callbacks(&pc, &events);
        tracing::debug!(call_id = %call_id, "Created peer connection");

        Ok(Arc::new(WebRtcMediaLink {
            call_id,
            pc,
            senders: Mutex::new(HashMap::new()),
            video_receiver: Mutex::new(false),
        }))
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, events: &MediaEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(MediaLinkEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => tracing::warn!(error = %e, "Failed to encode local candidate"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        if let Some(link_state) = mapped {
            sink.emit(MediaLinkEvent::ConnectionStateChanged(link_state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        sink.emit(MediaLinkEvent::RemoteTrack(kind));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(MediaLinkEvent::NegotiationNeeded);
        Box::pin(async {})
    }));
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(negotiation)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(MediaError::Negotiation(format!(
                "unsupported description type {other}"
            )))
        }
    };
    Ok(SessionDescription::new(sdp_type, description.sdp))
}

struct Sender {
    kind: TrackKind,
    rtp_sender: Arc<RTCRtpSender>,
    sample_track: Arc<TrackLocalStaticSample>,
}

/// Media link over an `RTCPeerConnection`
pub struct WebRtcMediaLink {
    call_id: CallId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Sender>>,
    video_receiver: Mutex<bool>,
}

impl WebRtcMediaLink {
    /// Sample sink for the local track `track_id`, if attached
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .get(track_id)
            .map(|s| s.sample_track.clone())
    }

    /// The underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sends_video(&self) -> bool {
        self.senders
            .lock()
            .values()
            .any(|s| s.kind == TrackKind::Video)
    }

    /// Receive-only video section so a video offer works before the camera is on
    async fn ensure_video_receiver(&self) -> Result<(), MediaError> {
        if self.sends_video() || *self.video_receiver.lock() {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(negotiation)?;
        *self.video_receiver.lock() = true;
        Ok(())
    }
}

#[async_trait]
impl MediaLink for WebRtcMediaLink {
    async fn create_offer(&self, kind: MediaKind) -> Result<SessionDescription, MediaError> {
        if kind.includes_video() {
            self.ensure_video_receiver().await?;
        }
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(negotiation)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            STREAM_ID.to_string(),
        ));
        let rtp_sender = self
            .pc
            .add_track(sample_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        tracing::debug!(call_id = %self.call_id, track = %track.id, kind = %track.kind, "Track attached");
        self.senders.lock().insert(
            track.id.clone(),
            Sender {
                kind: track.kind,
                rtp_sender,
                sample_track,
            },
        );
        Ok(())
    }

    async fn remove_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let sender = self.senders.lock().remove(&track.id);
        match sender {
            Some(sender) => self
                .pc
                .remove_track(&sender.rtp_sender)
                .await
                .map_err(negotiation),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(negotiation)
    }
}
