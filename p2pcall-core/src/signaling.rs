//! Call signaling protocol
//!
//! Every message exchanged with the peer is a [`SignalEnvelope`] whose payload
//! is one of a closed set of [`SignalPayload`] kinds. The transport that moves
//! envelopes is external and plugged in through [`SignalingPort`].

use crate::identity::{PeerId, PeerInfo};
use crate::media::{IceCandidate, SessionDescription};
use crate::types::{CallId, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The channel cannot deliver right now
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// The channel was shut down
    #[error("Signaling channel closed")]
    Closed,

    /// Envelope could not be encoded or decoded
    #[error("Malformed envelope: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Codec(err.to_string())
    }
}

/// Why a call was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Callee is already in a call
    Busy,
    /// Callee declined
    Declined,
    /// Callee is not reachable
    Offline,
    /// Callee blocked the caller
    Blocked,
    /// Callee could not open its devices
    DeviceUnavailable,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Busy => "busy",
            Self::Declined => "declined",
            Self::Offline => "offline",
            Self::Blocked => "blocked",
            Self::DeviceUnavailable => "device unavailable",
        };
        f.write_str(s)
    }
}

/// Payload of a signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Ask the peer to take a call
    StartRequest {
        /// Requested media kind
        media_kind: MediaKind,
        /// Caller profile shown on the ringing screen
        caller: PeerInfo,
    },
    /// Callee took the call
    Accept,
    /// Callee refused the call
    Reject {
        /// Why
        reason: RejectReason,
    },
    /// Caller gave up before the callee decided
    Cancel,
    /// Either side hung up
    End,
    /// Session description offer
    Offer(SessionDescription),
    /// Session description answer
    Answer(SessionDescription),
    /// Connectivity candidate
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartRequest { .. } => "StartRequest",
            Self::Accept => "Accept",
            Self::Reject { .. } => "Reject",
            Self::Cancel => "Cancel",
            Self::End => "End",
            Self::Offer(_) => "Offer",
            Self::Answer(_) => "Answer",
            Self::Candidate(_) => "Candidate",
        }
    }
}

/// Unit exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Call this envelope belongs to
    pub call_id: CallId,
    /// Who sent it
    pub sender_id: PeerId,
    /// What it carries
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    /// Build an envelope
    pub fn new(call_id: CallId, sender_id: PeerId, payload: SignalPayload) -> Self {
        Self {
            call_id,
            sender_id,
            payload,
        }
    }

    /// Encode for a text transport
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a text transport
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid envelope
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Signaling transport trait
///
/// Implement this for the channel your application already has (websocket,
/// event bus, etc.). Delivery is assumed reliable and ordered per sender; the
/// call manager takes care of stale envelopes itself.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Send an envelope to a peer
    async fn send(&self, peer: &PeerId, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    /// Wait for the next envelope addressed to the local client
    async fn receive(&self) -> Result<SignalEnvelope, SignalingError>;
}

/// Signaling handler with receive backoff
pub struct SignalingHandler {
    port: Arc<dyn SignalingPort>,
    error_count: tokio::sync::Mutex<u32>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(port: Arc<dyn SignalingPort>) -> Self {
        Self {
            port,
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Send an envelope to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, envelope), fields(peer = %peer, call_id = %envelope.call_id, message_type = envelope.payload.kind()))]
    pub async fn send(&self, peer: &PeerId, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling envelope");
        self.port.send(peer, envelope).await
    }

    /// Receive the next envelope, backing off after transport errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    pub async fn receive(&self) -> Result<SignalEnvelope, SignalingError> {
        match self.port.receive().await {
            Ok(envelope) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(
                    peer = %envelope.sender_id,
                    call_id = %envelope.call_id,
                    message_type = envelope.payload.kind(),
                    "Received signaling envelope"
                );
                Ok(envelope)
            }
            Err(SignalingError::Closed) => Err(SignalingError::Closed),
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving envelope, backing off"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Get access to the underlying port
    #[must_use]
    pub fn port(&self) -> &Arc<dyn SignalingPort> {
        &self.port
    }
}
