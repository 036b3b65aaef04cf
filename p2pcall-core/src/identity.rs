//! Peer identity
//!
//! A call is always between the local client and exactly one remote peer. The
//! signaling channel addresses peers by an opaque identifier; the UI layer
//! additionally shows a display name and an avatar.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Opaque identifier the Signaling Port routes envelopes by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The remote participant of a call, as presented to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Signaling identity
    pub id: PeerId,
    /// Human-readable name
    pub display_name: String,
    /// Avatar reference (URL or asset key), if the peer has one
    pub avatar_ref: Option<String>,
}

impl PeerInfo {
    /// Peer with a display name and no avatar
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Attach an avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Peer known only by its identifier
    pub fn anonymous(id: PeerId) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            avatar_ref: None,
        }
    }
}
