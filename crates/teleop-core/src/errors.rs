use thiserror::Error;

use crate::types::{SessionState, SignalingState, TrackKind};

/// Errors surfaced by a connection session.
///
/// Only a subset is fatal: see [`SessionError::is_fatal`].
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No usable video capture device: {reason}")]
    CaptureUnavailable { reason: String },

    #[error("Audio capture unavailable: {reason}")]
    AudioUnavailable { reason: String },

    #[error("Cannot {operation} in signaling state {state:?}")]
    InvalidSignalingState { operation: &'static str, state: SignalingState },

    #[error("Malformed {kind} envelope: {reason}")]
    MalformedEnvelope { kind: String, reason: String },

    #[error("Signaling relay unavailable after {failures} consecutive failures")]
    RelayUnavailable { failures: u32 },

    #[error("Track replacement failed: {reason}")]
    TrackReplaceFailure { reason: String },

    #[error("Peer connection error: {reason}")]
    PeerConnection { reason: String },

    #[error("Negotiation did not complete within {ms}ms")]
    NegotiationTimeout { ms: u64 },

    #[error("Invalid state transition {from} → {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Session is closed")]
    SessionClosed,
}

impl SessionError {
    /// Whether the error ends the session (state → Faulted).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable { .. }
                | Self::RelayUnavailable { .. }
                | Self::PeerConnection { .. }
                | Self::NegotiationTimeout { .. }
        )
    }
}

/// Failure reported by the host media / peer-connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{kind} device unavailable")]
    DeviceUnavailable { kind: TrackKind },

    #[error("Permission denied: {device}")]
    PermissionDenied { device: String },

    #[error("{operation} not allowed in signaling state {state:?}")]
    InvalidState { operation: &'static str, state: SignalingState },

    #[error("No {kind} sender on the peer connection")]
    NoSender { kind: TrackKind },

    #[error("Platform failure: {reason}")]
    Failed { reason: String },
}

/// Failure of the signaling relay collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Relay rejected envelope: {reason}")]
    Rejected { reason: String },
}
