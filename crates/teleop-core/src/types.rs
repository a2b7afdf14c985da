use serde::{Deserialize, Serialize};

// MARK: - QualityLevel

/// Capture quality requested by the operator side.
///
/// Each level maps to a fixed [`QualityProfile`]; the table is never mutated
/// at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn profile(self) -> QualityProfile {
        match self {
            Self::Low => QualityProfile::LOW,
            Self::Medium => QualityProfile::MEDIUM,
            Self::High => QualityProfile::HIGH,
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// MARK: - QualityProfile

/// Capture constraints for one quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_bps: u32,
}

impl QualityProfile {
    pub const LOW: Self = Self { width: 320, height: 240, frame_rate: 15, bitrate_bps: 250_000 };
    pub const MEDIUM: Self = Self { width: 640, height: 480, frame_rate: 24, bitrate_bps: 800_000 };
    pub const HIGH: Self = Self { width: 1280, height: 720, frame_rate: 30, bitrate_bps: 2_500_000 };

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}×{}@{}fps {}kbps",
            self.width,
            self.height,
            self.frame_rate,
            self.bitrate_bps / 1000
        )
    }
}

/// What a capture acquisition asks the host platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub profile: QualityProfile,
    pub audio: bool,
}

impl CaptureConstraints {
    pub fn new(level: QualityLevel, audio: bool) -> Self {
        Self { profile: level.profile(), audio }
    }

    pub fn video_only(self) -> Self {
        Self { audio: false, ..self }
    }
}

// MARK: - Role

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Robot side: owns the camera and sends media.
    Streamer,
    /// Operator side: receives media and asks for quality changes.
    Receiver,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streamer => write!(f, "streamer"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

// MARK: - SessionState

/// Coarse lifecycle of a connection session.
///
/// ```text
/// New → Initializing → Negotiating → Connected → Closed
///   └──────────┴─────────────┴───────────┴──→ Faulted → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    New,
    Initializing,
    Negotiating,
    Connected,
    Closed,
    Faulted,
}

impl SessionState {
    /// Whether the transition `self → next` is part of the state machine.
    /// `cleanup` (→ Closed) and faults are allowed from any non-closed state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Faulted, _) => false,
            (_, Faulted) => true,
            (New, Initializing) => true,
            (Initializing, Negotiating) => true,
            (Negotiating, Connected) => true,
            // Streamer rebuild or receiver reset on a live connection.
            (Connected, Negotiating) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// MARK: - Negotiation primitives

/// Signaling state of the host peer connection (offer/answer exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport state of the host peer connection, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerLinkState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Trickle ICE candidate descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", alias = "sdp_mid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        alias = "sdp_m_line_index",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), sdp_mid: Some("0".into()), sdp_m_line_index: Some(0) }
    }
}

// MARK: - Media tracks

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: id.into(), kind }
    }
}
