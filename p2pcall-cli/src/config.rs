//! CLI configuration file

use anyhow::{Context, Result};
use p2pcall_core::{CallManagerConfig, WebRtcLinkConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the CLI can be configured with, as one JSON document
///
/// Missing sections and fields fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Call manager timings
    pub calls: CallManagerConfig,
    /// Peer connection settings for `offer`
    pub link: WebRtcLinkConfig,
}

impl CliConfig {
    /// Read `path`, or use defaults when no file was given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Command-line flags win over the file
    pub fn apply_overrides(&mut self, dial_timeout_ms: Option<u64>, connect_timeout_ms: Option<u64>) {
        if let Some(ms) = dial_timeout_ms {
            self.calls.dial_timeout_ms = ms;
        }
        if let Some(ms) = connect_timeout_ms {
            self.calls.connect_timeout_ms = ms;
        }
    }
}
