use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::QualityLevel;

/// Policy knobs for one connection session.
///
/// The relay gives no delivery guarantees and the host platform gives no
/// completion deadline, so the negotiation timeout and the relay failure budget
/// are explicit here rather than hidden defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Interval between relay polls.
    #[serde(alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    /// Upper bound on time spent in `Negotiating` before the session faults.
    #[serde(alias = "negotiationTimeoutMs")]
    pub negotiation_timeout_ms: u64,
    /// Consecutive relay publish/poll failures after which the session faults.
    #[serde(alias = "maxRelayFailures")]
    pub max_relay_failures: u32,
    #[serde(alias = "initialQuality")]
    pub initial_quality: QualityLevel,
    #[serde(alias = "controlChannelLabel")]
    pub control_channel_label: String,
    /// Ask for audio alongside video (falls back to video-only when denied).
    #[serde(alias = "preferAudio")]
    pub prefer_audio: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            negotiation_timeout_ms: 30_000,
            max_relay_failures: 5,
            initial_quality: QualityLevel::Low,
            control_channel_label: "control".to_owned(),
            prefer_audio: true,
        }
    }
}

impl SessionPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}
