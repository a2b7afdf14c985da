//! Connection session: one negotiated stream between a robot-side streamer
//! and an operator-side receiver.
//!
//! # Lifecycle
//!
//! ```text
//! 1. ConnectionSession::new(role, stream_id, policy, platform, relay)
//! 2. session.initialize()        New → Initializing → Negotiating
//!       ├─ streamer: capture + peer + control channel, publish offer
//!       └─ receiver: peer, publish connection request
//! 3. session.poll_once()         ← repeatedly; one batch applied to completion
//!    session.handle_peer_event() ← host notifications, same logical flow
//! 4. session.cleanup()           any state → Closed, handles released once
//! ```
//!
//! Every method takes `&mut self`: a session is only ever advanced by one
//! logical flow (see [`crate::driver`]).

mod receiver;
mod streamer;

use std::sync::Arc;

use teleop_core::{
    IceCandidate, PeerLinkState, PlatformError, QualityLevel, Role, SessionError, SessionPolicy,
    SessionState, TrackKind,
};
use teleop_signaling::{
    new_sender_id, Admission, ControlMessage, EnvelopeFilter, EnvelopeKind, RelayClient,
    SignalingEnvelope, SignalingRelay,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::platform::{CaptureStream, DataChannel, HostPlatform, PeerConnection, PeerEvent};
use crate::quality::acquire_with_fallback;

use self::receiver::ReceiverState;
use self::streamer::StreamerState;

// ── Status ────────────────────────────────────────────────────────────────────

/// Snapshot published to observers (UI) on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub quality: QualityLevel,
    pub has_audio: bool,
    pub link: PeerLinkState,
    /// Set once the session faulted; kept after cleanup.
    pub fault: Option<String>,
    pub last_quality_error: Option<String>,
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// Host resources owned by a session, installed and released as one unit.
///
/// The streamer always carries all three. The receiver has no capture and
/// gets its channel from the remote side once the offer is applied.
struct Handles {
    channel: Option<Box<dyn DataChannel>>,
    peer: Box<dyn PeerConnection>,
    capture: Option<Box<dyn CaptureStream>>,
}

impl Handles {
    /// Release order: data channel, peer connection, capture tracks.
    async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.peer.close().await;
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

fn peer_error(e: PlatformError) -> SessionError {
    SessionError::PeerConnection { reason: e.to_string() }
}

// ── ConnectionSession ─────────────────────────────────────────────────────────

pub struct ConnectionSession {
    id: String,
    tag: String,
    role: Role,
    policy: SessionPolicy,
    platform: HostPlatform,
    relay: RelayClient,
    filter: EnvelopeFilter,

    state: SessionState,
    quality: QualityLevel,
    has_audio: bool,
    link: PeerLinkState,
    fault: Option<String>,
    quality_error: Option<String>,

    handles: Option<Handles>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    remote_applied: bool,
    negotiating_since: Option<Instant>,
    /// Latest quality asked for by the peer, not yet handed to the driver.
    inbound_quality: Option<QualityLevel>,

    streamer: StreamerState,
    receiver: ReceiverState,
}

impl ConnectionSession {
    pub fn new(
        role: Role,
        stream_id: impl Into<String>,
        policy: SessionPolicy,
        platform: HostPlatform,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        let stream_id = stream_id.into();
        let id = new_sender_id();
        let tag = format!("{}/{}", role, id.chars().take(8).collect::<String>());
        Self {
            relay: RelayClient::new(relay, stream_id.clone(), id.clone(), policy.max_relay_failures),
            filter: EnvelopeFilter::new(id.clone(), stream_id),
            quality: policy.initial_quality,
            id,
            tag,
            role,
            policy,
            platform,
            state: SessionState::New,
            has_audio: false,
            link: PeerLinkState::New,
            fault: None,
            quality_error: None,
            handles: None,
            events: None,
            pending_candidates: Vec::new(),
            remote_applied: false,
            negotiating_since: None,
            inbound_quality: None,
            streamer: StreamerState::default(),
            receiver: ReceiverState::default(),
        }
    }

    pub fn streamer(
        stream_id: impl Into<String>,
        policy: SessionPolicy,
        platform: HostPlatform,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self::new(Role::Streamer, stream_id, policy, platform, relay)
    }

    pub fn receiver(
        stream_id: impl Into<String>,
        policy: SessionPolicy,
        platform: HostPlatform,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self::new(Role::Receiver, stream_id, policy, platform, relay)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Sender identity used on the relay.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short `role/id` prefix used in logs.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stream_id(&self) -> &str {
        self.relay.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn quality(&self) -> QualityLevel {
        self.quality
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio
    }

    pub fn link_state(&self) -> PeerLinkState {
        self.link
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn platform(&self) -> &HostPlatform {
        &self.platform
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_applied
    }

    /// Whether capture, peer connection and channel are currently held.
    pub fn has_handles(&self) -> bool {
        self.handles.is_some()
    }

    /// When the current `Negotiating` phase must have completed by.
    pub fn negotiation_deadline(&self) -> Option<Instant> {
        self.negotiating_since.map(|t| t + self.policy.negotiation_timeout())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            quality: self.quality,
            has_audio: self.has_audio,
            link: self.link,
            fault: self.fault.clone(),
            last_quality_error: self.quality_error.clone(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Acquire handles and open negotiation.
    ///
    /// On success the session is `Negotiating` and holds all of its handles.
    /// On failure it is `Faulted` and holds none.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Initializing)?;

        let opened = match self.role {
            Role::Streamer => self.open_streamer().await,
            Role::Receiver => self.open_receiver().await,
        };
        let handles = match opened {
            Ok(handles) => handles,
            Err(e) => return Err(self.fail(e)),
        };
        self.install(handles);
        self.transition(SessionState::Negotiating)?;

        let opening = match self.role {
            Role::Streamer => self.publish_offer().await,
            Role::Receiver => self.announce().await,
        };
        opening.map_err(|e| self.fail(e))
    }

    /// Release everything and enter `Closed`. Safe from any state; repeated
    /// calls do nothing.
    pub async fn cleanup(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let from = self.state;
        let held = self.handles.is_some();
        if let Some(handles) = self.handles.take() {
            handles.release().await;
        }
        self.events = None;
        self.pending_candidates.clear();
        self.remote_applied = false;
        self.negotiating_since = None;
        self.inbound_quality = None;
        if held {
            self.link = PeerLinkState::Closed;
        }
        self.state = SessionState::Closed;
        info!("Session[{}] {} → Closed (handles released: {})", self.tag, from, held);
    }

    /// Enter `Faulted` (unless already terminal) and hand the error back.
    pub fn fail(&mut self, err: SessionError) -> SessionError {
        if !self.state.is_terminal() {
            error!("Session[{}] faulted in {}: {}", self.tag, self.state, err);
            self.state = SessionState::Faulted;
            self.fault = Some(err.to_string());
            self.negotiating_since = None;
        }
        err
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from: self.state, to: next });
        }
        info!("Session[{}] {} → {}", self.tag, self.state, next);
        self.negotiating_since = (next == SessionState::Negotiating).then(Instant::now);
        self.state = next;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::New => Err(SessionError::InvalidTransition {
                from: SessionState::New,
                to: SessionState::Negotiating,
            }),
            SessionState::Closed | SessionState::Faulted => Err(SessionError::SessionClosed),
            _ => Ok(()),
        }
    }

    fn install(&mut self, mut handles: Handles) {
        self.events = handles.peer.take_events();
        self.handles = Some(handles);
        self.link = PeerLinkState::New;
    }

    /// Drop the current peer connection (and channel) and forget everything
    /// negotiated on it. Capture is handed back to the caller.
    async fn discard_peer(&mut self) -> Option<Box<dyn CaptureStream>> {
        let mut handles = self.handles.take()?;
        let capture = handles.capture.take();
        handles.release().await;
        self.events = None;
        self.pending_candidates.clear();
        self.remote_applied = false;
        capture
    }

    fn peer(&self) -> Result<&dyn PeerConnection, SessionError> {
        self.handles.as_ref().map(|h| h.peer.as_ref()).ok_or(SessionError::SessionClosed)
    }

    // ── Signaling ────────────────────────────────────────────────────────────

    /// Poll the relay once and apply the batch to completion. Returns the
    /// number of envelopes applied (duplicates and echoes excluded).
    pub async fn poll_once(&mut self) -> Result<usize, SessionError> {
        self.ensure_live()?;
        let batch = match self.relay.poll().await {
            Ok(batch) => batch,
            Err(e) => return Err(self.fail(e)),
        };
        self.apply_batch(batch).await
    }

    pub async fn apply_batch(&mut self, batch: Vec<SignalingEnvelope>) -> Result<usize, SessionError> {
        let mut applied = 0;
        for envelope in batch {
            if self.handle_envelope(envelope).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply one inbound envelope at most once.
    ///
    /// Returns `Ok(false)` for duplicates, self-echoes and foreign streams.
    /// Protocol-level failures are logged and swallowed; only fatal errors
    /// are returned (and fault the session).
    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Result<bool, SessionError> {
        self.ensure_live()?;
        match self.filter.admit(&envelope) {
            Admission::Fresh => {}
            Admission::Duplicate => {
                debug!("Session[{}] duplicate {} from {} dropped", self.tag, envelope.kind, envelope.sender_id);
                return Ok(false);
            }
            Admission::SelfEcho | Admission::ForeignSession => return Ok(false),
        }
        debug!("Session[{}] ← {} from {}", self.tag, envelope.kind, envelope.sender_id);

        let outcome = match (envelope.kind, self.role) {
            (EnvelopeKind::IceCandidate, _) => self.on_remote_candidate(&envelope).await,
            (EnvelopeKind::Answer, Role::Streamer) => self.on_answer(&envelope).await,
            (EnvelopeKind::ConnectionRequest, Role::Streamer) => self.on_connection_request(&envelope).await,
            (EnvelopeKind::QualityRequest, Role::Streamer) => {
                envelope.quality().map(|level| self.queue_quality_request(level))
            }
            (EnvelopeKind::Offer, Role::Receiver) => self.on_offer(&envelope).await,
            (kind, role) => {
                debug!("Session[{}] {} is not handled by a {}", self.tag, kind, role);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            Err(e) => {
                warn!("Session[{}] dropped {} from {}: {}", self.tag, envelope.kind, envelope.sender_id, e);
                Ok(true)
            }
        }
    }

    async fn on_remote_candidate(&mut self, envelope: &SignalingEnvelope) -> Result<(), SessionError> {
        let candidate = envelope.candidate()?;
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            debug!("Session[{}] buffered candidate ({} pending)", self.tag, self.pending_candidates.len());
            return Ok(());
        }
        if let Err(e) = self.peer()?.add_ice_candidate(candidate).await {
            warn!("Session[{}] remote candidate rejected: {}", self.tag, e);
        }
        Ok(())
    }

    /// Mark the remote description applied and drain buffered candidates in
    /// arrival order. A rejected candidate does not stop the rest.
    async fn on_remote_description_applied(&mut self) {
        self.remote_applied = true;
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }
        let Some(handles) = self.handles.as_ref() else { return };
        let total = pending.len();
        let mut rejected = 0;
        for candidate in pending {
            if let Err(e) = handles.peer.add_ice_candidate(candidate).await {
                rejected += 1;
                warn!("Session[{}] buffered candidate rejected: {}", self.tag, e);
            }
        }
        debug!("Session[{}] drained {} buffered candidates ({} rejected)", self.tag, total, rejected);
    }

    // ── Host events ──────────────────────────────────────────────────────────

    /// Next host notification. Pends forever while there is no peer
    /// connection, so it can sit in a `select!`.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let event = events.recv().await;
        if event.is_none() {
            self.events = None;
        }
        event
    }

    /// Handle every notification already queued, without waiting.
    pub async fn pump_events(&mut self) -> Result<usize, SessionError> {
        let mut handled = 0;
        loop {
            let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) else {
                return Ok(handled);
            };
            self.handle_peer_event(event).await?;
            handled += 1;
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.relay.publish_candidate(&candidate).await {
                    return Err(self.fail(e));
                }
            }
            PeerEvent::LinkState(link) => {
                if link != self.link {
                    info!("Session[{}] link {:?} → {:?}", self.tag, self.link, link);
                    if link == PeerLinkState::Failed {
                        warn!("Session[{}] media path failed", self.tag);
                    }
                    self.link = link;
                }
            }
            PeerEvent::TrackReceived(track) => self.on_track_received(track.kind),
            PeerEvent::DataChannelOpened(channel) => self.attach_channel(channel).await,
            PeerEvent::DataChannelMessage(data) => match ControlMessage::from_bytes(&data) {
                Ok(ControlMessage::QualityRequest { level }) if self.role == Role::Streamer => {
                    self.queue_quality_request(level);
                }
                Ok(msg) => debug!("Session[{}] control message ignored: {:?}", self.tag, msg),
                Err(e) => warn!("Session[{}] {}", self.tag, e),
            },
        }
        Ok(())
    }

    async fn attach_channel(&mut self, channel: Box<dyn DataChannel>) {
        match self.handles.as_mut() {
            Some(handles) if handles.channel.is_none() => {
                info!("Session[{}] data channel '{}' open", self.tag, channel.label());
                handles.channel = Some(channel);
            }
            _ => channel.close().await,
        }
    }

    fn on_track_received(&mut self, kind: TrackKind) {
        match self.role {
            Role::Receiver => self.record_remote_track(kind),
            Role::Streamer => debug!("Session[{}] unexpected remote {} track", self.tag, kind),
        }
    }

    // ── Quality ──────────────────────────────────────────────────────────────

    fn queue_quality_request(&mut self, level: QualityLevel) {
        info!("Session[{}] peer asked for {} quality", self.tag, level);
        self.inbound_quality = Some(level);
    }

    /// Latest quality level the peer asked for since the last call.
    pub fn take_quality_request(&mut self) -> Option<QualityLevel> {
        self.inbound_quality.take()
    }

    /// Change quality inline: the streamer re-acquires capture and swaps
    /// tracks, the receiver asks the streamer.
    pub async fn request_quality(&mut self, level: QualityLevel) -> Result<(), SessionError> {
        self.ensure_live()?;
        match self.role {
            Role::Streamer => {
                if level == self.quality {
                    return Ok(());
                }
                let acquired =
                    acquire_with_fallback(self.platform.media.as_ref(), level, self.policy.prefer_audio).await;
                match acquired {
                    Ok(capture) => self.apply_capture(level, capture).await,
                    Err(e) => {
                        self.record_quality_failure(&e);
                        Err(e)
                    }
                }
            }
            Role::Receiver => self.send_quality_request(level).await,
        }
    }

    pub fn record_quality_failure(&mut self, err: &SessionError) {
        warn!("Session[{}] quality change failed: {}", self.tag, err);
        self.quality_error = Some(err.to_string());
    }
}
