//! In-process simulated host platform.
//!
//! Stands in for browser-grade media capture and peer connections in loopback
//! runs and tests. Peer connections enforce the offer/answer signaling-state
//! rules (an offer cannot be applied over an outstanding local offer, a
//! candidate cannot be added before the remote description) and every
//! observable operation is appended to a shared [`SimJournal`].
//!
//! The simulation carries no media: two simulated peers never talk to each
//! other directly, only through whatever relay the sessions use.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use teleop_core::{
    CaptureConstraints, IceCandidate, MediaTrack, PeerLinkState, PlatformError, QualityProfile,
    SdpType, SessionDescription, SignalingState, TrackKind,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::platform::{
    CaptureStream, DataChannel, HostPlatform, MediaDevices, PeerConnection, PeerConnectionFactory,
    PeerEvent,
};

// ── Journal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Acquired { capture: String, audio: bool },
    TrackStopped { track: String },
    PeerCreated { peer: u32 },
    PeerClosed { peer: u32 },
    TrackAdded { peer: u32, kind: TrackKind },
    TrackReplaced { peer: u32, kind: TrackKind, track: String },
    ChannelCreated { peer: u32, label: String },
    ChannelClosed { peer: u32 },
    ChannelSent { peer: u32, text: String },
    LocalDescription { peer: u32, sdp_type: SdpType },
    RemoteDescription { peer: u32, sdp_type: SdpType },
    CandidateAdded { peer: u32, candidate: String },
    CandidateRejected { peer: u32, candidate: String },
}

/// Shared, append-only record of simulated platform operations.
#[derive(Debug, Clone, Default)]
pub struct SimJournal(Arc<Mutex<Vec<SimOp>>>);

impl SimJournal {
    pub fn record(&self, op: SimOp) {
        if let Ok(mut ops) = self.0.lock() {
            ops.push(op);
        }
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.0.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&SimOp) -> bool) -> usize {
        self.0.lock().map(|ops| ops.iter().filter(|op| pred(op)).count()).unwrap_or(0)
    }

    /// Candidates successfully added to `peer`, in order.
    pub fn candidates_added(&self, peer: u32) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::CandidateAdded { peer: p, candidate } if p == peer => Some(candidate),
                _ => None,
            })
            .collect()
    }
}

// ── Media ─────────────────────────────────────────────────────────────────────

pub struct SimMedia {
    journal: SimJournal,
    video_available: AtomicBool,
    audio_available: AtomicBool,
    delay_ms: AtomicU64,
    next_id: AtomicU32,
}

impl SimMedia {
    pub fn new(journal: SimJournal) -> Self {
        Self {
            journal,
            video_available: AtomicBool::new(true),
            audio_available: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn set_video_available(&self, available: bool) {
        self.video_available.store(available, Ordering::SeqCst);
    }

    pub fn set_audio_available(&self, available: bool) {
        self.audio_available.store(available, Ordering::SeqCst);
    }

    /// Make every acquisition take `delay` (device warm-up, permission prompt).
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.delay_ms.store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for SimMedia {
    async fn acquire(&self, constraints: CaptureConstraints) -> Result<Box<dyn CaptureStream>, PlatformError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.video_available.load(Ordering::SeqCst) {
            return Err(PlatformError::DeviceUnavailable { kind: TrackKind::Video });
        }
        if constraints.audio && !self.audio_available.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied { device: "microphone".into() });
        }

        let id = format!("cap{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let video = MediaTrack::new(format!("{id}-video"), TrackKind::Video);
        let audio = constraints.audio.then(|| MediaTrack::new(format!("{id}-audio"), TrackKind::Audio));
        self.journal.record(SimOp::Acquired { capture: id.clone(), audio: audio.is_some() });
        Ok(Box::new(SimCapture {
            id,
            profile: constraints.profile,
            video,
            audio,
            journal: self.journal.clone(),
            stopped: false,
        }))
    }
}

struct SimCapture {
    id: String,
    profile: QualityProfile,
    video: MediaTrack,
    audio: Option<MediaTrack>,
    journal: SimJournal,
    stopped: bool,
}

impl CaptureStream for SimCapture {
    fn id(&self) -> &str {
        &self.id
    }

    fn profile(&self) -> QualityProfile {
        self.profile
    }

    fn video_track(&self) -> &MediaTrack {
        &self.video
    }

    fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for track in std::iter::once(&self.video).chain(self.audio.iter()) {
            self.journal.record(SimOp::TrackStopped { track: track.id.clone() });
        }
    }
}

// ── Peer connections ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FactoryKnobs {
    fail_create: AtomicBool,
    fail_replace: AtomicBool,
    preset_local_offers: AtomicU32,
    rejected: Mutex<HashSet<String>>,
}

pub struct SimPeerFactory {
    journal: SimJournal,
    next_id: AtomicU32,
    knobs: Arc<FactoryKnobs>,
}

impl SimPeerFactory {
    pub fn new(journal: SimJournal) -> Self {
        Self { journal, next_id: AtomicU32::new(1), knobs: Arc::new(FactoryKnobs::default()) }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.knobs.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_replace(&self, fail: bool) {
        self.knobs.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// The next `n` connections start with a local offer already applied, as
    /// if the host fired its own negotiation before the session asked.
    pub fn preset_local_offers(&self, n: u32) {
        self.knobs.preset_local_offers.store(n, Ordering::SeqCst);
    }

    /// Make `add_ice_candidate` fail for this candidate string.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        if let Ok(mut rejected) = self.knobs.rejected.lock() {
            rejected.insert(candidate.into());
        }
    }

    /// Id the next created connection will get.
    pub fn next_peer_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnectionFactory for SimPeerFactory {
    async fn create(&self) -> Result<Box<dyn PeerConnection>, PlatformError> {
        if self.knobs.fail_create.load(Ordering::SeqCst) {
            return Err(PlatformError::Failed { reason: "peer connection creation refused".into() });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut inner = PeerInner::default();
        let preset = self
            .knobs
            .preset_local_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if preset {
            inner.signaling = SignalingState::HaveLocalOffer;
            inner.local = Some(SessionDescription::offer(format!("v=0\r\no=sim {id} 0 IN IP4 127.0.0.1\r\n")));
        }

        self.journal.record(SimOp::PeerCreated { peer: id });
        Ok(Box::new(SimPeer {
            id,
            journal: self.journal.clone(),
            knobs: Arc::clone(&self.knobs),
            inner: Mutex::new(inner),
            events_tx,
            events_rx: Some(events_rx),
        }))
    }
}

#[derive(Debug)]
struct PeerInner {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<TrackKind>,
    channel: Option<String>,
    gathered: u32,
    closed: bool,
}

impl Default for PeerInner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            senders: Vec::new(),
            channel: None,
            gathered: 0,
            closed: false,
        }
    }
}

struct SimPeer {
    id: u32,
    journal: SimJournal,
    knobs: Arc<FactoryKnobs>,
    inner: Mutex<PeerInner>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl SimPeer {
    fn inner(&self) -> Result<MutexGuard<'_, PeerInner>, PlatformError> {
        self.inner.lock().map_err(|_| PlatformError::Failed { reason: "sim peer poisoned".into() })
    }

    fn emit(&self, event: PeerEvent) {
        // The session may already have dropped the receiver.
        let _ = self.events_tx.send(event);
    }

    fn render_sdp(&self, inner: &PeerInner, origin: &str) -> String {
        let mut sdp = format!("v=0\r\no=sim {} {} IN IP4 127.0.0.1\r\n", self.id, origin);
        for kind in &inner.senders {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        }
        if inner.channel.is_some() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }

    fn gather(&self, inner: &mut PeerInner) {
        for _ in 0..2 {
            inner.gathered += 1;
            let candidate = format!(
                "candidate:{}{} 1 udp 2122260223 192.0.2.{} {} typ host",
                self.id,
                inner.gathered,
                self.id,
                50_000 + inner.gathered
            );
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(candidate)));
        }
    }

    fn maybe_connected(&self, inner: &PeerInner) {
        if inner.signaling == SignalingState::Stable && inner.local.is_some() && inner.remote.is_some() {
            self.emit(PeerEvent::LinkState(PeerLinkState::Connecting));
            self.emit(PeerEvent::LinkState(PeerLinkState::Connected));
        }
    }

    fn announce_remote_media(&self, sdp: &str) {
        for line in sdp.lines() {
            if line.starts_with("m=video") {
                self.emit(PeerEvent::TrackReceived(MediaTrack::new(format!("remote{}-video", self.id), TrackKind::Video)));
            } else if line.starts_with("m=audio") {
                self.emit(PeerEvent::TrackReceived(MediaTrack::new(format!("remote{}-audio", self.id), TrackKind::Audio)));
            } else if line.starts_with("m=application") {
                self.journal.record(SimOp::ChannelCreated { peer: self.id, label: "control".into() });
                self.emit(PeerEvent::DataChannelOpened(Box::new(SimChannel::new(
                    self.id,
                    "control",
                    self.journal.clone(),
                ))));
            }
        }
    }
}

fn invalid(operation: &'static str, state: SignalingState) -> PlatformError {
    PlatformError::InvalidState { operation, state }
}

#[async_trait]
impl PeerConnection for SimPeer {
    fn signaling_state(&self) -> SignalingState {
        self.inner().map(|i| i.signaling).unwrap_or(SignalingState::Closed)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.take()
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), PlatformError> {
        let mut inner = self.inner()?;
        if inner.closed {
            return Err(invalid("add_track", SignalingState::Closed));
        }
        inner.senders.push(track.kind);
        self.journal.record(SimOp::TrackAdded { peer: self.id, kind: track.kind });
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<(), PlatformError> {
        let inner = self.inner()?;
        if self.knobs.fail_replace.load(Ordering::SeqCst) {
            return Err(PlatformError::Failed { reason: "replace_track refused".into() });
        }
        if !inner.senders.contains(&kind) {
            return Err(PlatformError::NoSender { kind });
        }
        self.journal.record(SimOp::TrackReplaced { peer: self.id, kind, track: track.id.clone() });
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>, PlatformError> {
        let mut inner = self.inner()?;
        if inner.closed {
            return Err(invalid("create_data_channel", SignalingState::Closed));
        }
        inner.channel = Some(label.to_owned());
        self.journal.record(SimOp::ChannelCreated { peer: self.id, label: label.to_owned() });
        Ok(Box::new(SimChannel::new(self.id, label, self.journal.clone())))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PlatformError> {
        let inner = self.inner()?;
        if inner.closed {
            return Err(invalid("create_offer", SignalingState::Closed));
        }
        Ok(SessionDescription::offer(self.render_sdp(&inner, "1")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError> {
        let inner = self.inner()?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(invalid("create_answer", inner.signaling));
        }
        Ok(SessionDescription::answer(self.render_sdp(&inner, "2")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        let mut inner = self.inner()?;
        let next = match (desc.sdp_type, inner.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, state) => return Err(invalid("set_local_description", state)),
        };
        self.journal.record(SimOp::LocalDescription { peer: self.id, sdp_type: desc.sdp_type });
        inner.signaling = next;
        inner.local = Some(desc);
        self.gather(&mut inner);
        self.maybe_connected(&inner);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        let mut inner = self.inner()?;
        let next = match (desc.sdp_type, inner.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, state) => return Err(invalid("set_remote_description", state)),
        };
        self.journal.record(SimOp::RemoteDescription { peer: self.id, sdp_type: desc.sdp_type });
        inner.signaling = next;
        let sdp = desc.sdp.clone();
        inner.remote = Some(desc);
        if next == SignalingState::HaveRemoteOffer {
            self.announce_remote_media(&sdp);
        }
        self.maybe_connected(&inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError> {
        let inner = self.inner()?;
        if inner.remote.is_none() {
            return Err(invalid("add_ice_candidate", inner.signaling));
        }
        let rejected = self
            .knobs
            .rejected
            .lock()
            .map(|r| r.contains(&candidate.candidate))
            .unwrap_or(false);
        if rejected || candidate.candidate.trim().is_empty() {
            self.journal.record(SimOp::CandidateRejected { peer: self.id, candidate: candidate.candidate.clone() });
            return Err(PlatformError::Failed { reason: format!("bad candidate {:?}", candidate.candidate) });
        }
        self.journal.record(SimOp::CandidateAdded { peer: self.id, candidate: candidate.candidate });
        Ok(())
    }

    async fn close(&self) {
        let Ok(mut inner) = self.inner() else { return };
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.signaling = SignalingState::Closed;
        self.journal.record(SimOp::PeerClosed { peer: self.id });
        self.emit(PeerEvent::LinkState(PeerLinkState::Closed));
        debug!("SimPeer[{}] closed", self.id);
    }
}

// ── Data channel ──────────────────────────────────────────────────────────────

struct SimChannel {
    peer: u32,
    label: String,
    journal: SimJournal,
    open: AtomicBool,
}

impl SimChannel {
    fn new(peer: u32, label: &str, journal: SimJournal) -> Self {
        Self { peer, label: label.to_owned(), journal, open: AtomicBool::new(true) }
    }
}

#[async_trait]
impl DataChannel for SimChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), PlatformError> {
        if !self.is_open() {
            return Err(PlatformError::Failed { reason: format!("channel {} closed", self.label) });
        }
        let text = String::from_utf8_lossy(&data).into_owned();
        self.journal.record(SimOp::ChannelSent { peer: self.peer, text });
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.journal.record(SimOp::ChannelClosed { peer: self.peer });
        }
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// A simulated platform plus handles to its knobs and journal.
pub struct SimPlatform {
    pub journal: SimJournal,
    pub media: Arc<SimMedia>,
    pub peers: Arc<SimPeerFactory>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        let journal = SimJournal::default();
        Self {
            media: Arc::new(SimMedia::new(journal.clone())),
            peers: Arc::new(SimPeerFactory::new(journal.clone())),
            journal,
        }
    }

    pub fn host(&self) -> HostPlatform {
        HostPlatform::new(self.media.clone(), self.peers.clone())
    }
}
