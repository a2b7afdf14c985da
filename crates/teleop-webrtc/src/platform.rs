//! Host-platform collaborator interfaces.
//!
//! Media capture and the peer connection (ICE, DTLS, codecs) are provided by
//! the host. The session only drives the negotiation through these traits and
//! consumes their notifications as [`PeerEvent`]s on a single channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use teleop_core::{
    CaptureConstraints, IceCandidate, MediaTrack, PeerLinkState, PlatformError, QualityProfile,
    SessionDescription, SignalingState, TrackKind,
};
use tokio::sync::mpsc;

// MARK: - Capture

/// A live local capture (camera, optionally microphone).
pub trait CaptureStream: Send + Sync {
    fn id(&self) -> &str;

    fn profile(&self) -> QualityProfile;

    fn video_track(&self) -> &MediaTrack;

    fn audio_track(&self) -> Option<&MediaTrack>;

    /// Stop every track. Must be idempotent.
    fn stop(&mut self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a capture matching `constraints`. Not cancellable once started.
    async fn acquire(&self, constraints: CaptureConstraints) -> Result<Box<dyn CaptureStream>, PlatformError>;
}

// MARK: - Data channel

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<(), PlatformError>;

    async fn close(&self);
}

// MARK: - Peer connection

/// Notifications from the host peer connection, in the order they fired.
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    LinkState(PeerLinkState),
    /// The remote side started sending a track.
    TrackReceived(MediaTrack),
    /// The remote side opened a data channel.
    DataChannelOpened(Box<dyn DataChannel>),
    DataChannelMessage(Bytes),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(&c.candidate).finish(),
            Self::LinkState(s) => f.debug_tuple("LinkState").field(s).finish(),
            Self::TrackReceived(t) => f.debug_tuple("TrackReceived").field(&t.kind).finish(),
            Self::DataChannelOpened(ch) => f.debug_tuple("DataChannelOpened").field(&ch.label()).finish(),
            Self::DataChannelMessage(b) => f.debug_tuple("DataChannelMessage").field(&b.len()).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Event stream for this connection. Returns `Some` exactly once.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), PlatformError>;

    /// Swap the outgoing track of `kind` without renegotiation.
    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<(), PlatformError>;

    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>, PlatformError>;

    async fn create_offer(&self) -> Result<SessionDescription, PlatformError>;

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PlatformError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerConnection>, PlatformError>;
}

/// Everything a session needs from the host, injected at construction.
#[derive(Clone)]
pub struct HostPlatform {
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

impl HostPlatform {
    pub fn new(media: Arc<dyn MediaDevices>, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        Self { media, peers }
    }
}
