//! Streamer side: owns the capture, makes the offers.

use teleop_core::{
    PeerLinkState, PlatformError, QualityLevel, Role, SessionDescription, SessionError, SessionState,
    SignalingState, TrackKind,
};
use teleop_signaling::{EnvelopeId, SignalingEnvelope};
use tracing::{debug, info, warn};

use super::{peer_error, ConnectionSession, Handles};
use crate::platform::{CaptureStream, DataChannel, PeerConnection};
use crate::quality::acquire_with_fallback;

#[derive(Debug, Default)]
pub(super) struct StreamerState {
    /// Offer currently outstanding (or answered) on the live connection.
    offer: Option<SessionDescription>,
    /// Identity of the answer applied to the live connection.
    answered_by: Option<EnvelopeId>,
    /// Whether the live connection carries an audio sender.
    audio_sender: bool,
}

/// What to do with a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejoin {
    /// Still waiting for an answer: re-send the outstanding offer.
    Republish,
    /// The bound receiver restarted, or its link is gone: negotiate on a
    /// fresh connection.
    Rebuild,
    /// Older than the answer its sender already gave.
    Stale,
    /// Another receiver while the bound one is still connected.
    Busy,
}

impl ConnectionSession {
    pub(super) async fn open_streamer(&mut self) -> Result<Handles, SessionError> {
        let capture =
            acquire_with_fallback(self.platform.media.as_ref(), self.quality, self.policy.prefer_audio).await?;
        self.attach_capture(capture).await
    }

    /// New peer connection carrying `capture`'s tracks plus the control
    /// channel. On failure everything, `capture` included, is released.
    async fn attach_capture(&mut self, mut capture: Box<dyn CaptureStream>) -> Result<Handles, SessionError> {
        let peer = match self.platform.peers.create().await {
            Ok(peer) => peer,
            Err(e) => {
                capture.stop();
                return Err(peer_error(e));
            }
        };
        match self.wire(peer.as_ref(), capture.as_ref()).await {
            Ok((channel, audio_sender)) => {
                self.streamer.audio_sender = audio_sender;
                self.has_audio = audio_sender;
                Ok(Handles { channel: Some(channel), peer, capture: Some(capture) })
            }
            Err(e) => {
                peer.close().await;
                capture.stop();
                Err(e)
            }
        }
    }

    async fn wire(
        &self,
        peer: &dyn PeerConnection,
        capture: &dyn CaptureStream,
    ) -> Result<(Box<dyn DataChannel>, bool), SessionError> {
        peer.add_track(capture.video_track()).await.map_err(peer_error)?;
        let mut audio_sender = false;
        if let Some(track) = capture.audio_track() {
            match peer.add_track(track).await {
                Ok(()) => audio_sender = true,
                Err(e) => warn!("Session[{}] audio track not added: {}", self.tag, e),
            }
        }
        let channel = peer.create_data_channel(&self.policy.control_channel_label).await.map_err(peer_error)?;
        Ok((channel, audio_sender))
    }

    pub(super) async fn publish_offer(&mut self) -> Result<(), SessionError> {
        let offer = {
            let peer = self.peer()?;
            let offer = peer.create_offer().await.map_err(peer_error)?;
            peer.set_local_description(offer.clone()).await.map_err(peer_error)?;
            offer
        };
        self.relay.publish_offer(&offer).await?;
        info!("Session[{}] offer published ({} bytes)", self.tag, offer.sdp.len());
        self.streamer.offer = Some(offer);
        self.streamer.answered_by = None;
        Ok(())
    }

    pub(super) async fn on_answer(&mut self, envelope: &SignalingEnvelope) -> Result<(), SessionError> {
        let answer = envelope.description()?;
        let state = self.peer()?.signaling_state();
        if self.state != SessionState::Negotiating || state != SignalingState::HaveLocalOffer {
            return Err(SessionError::InvalidSignalingState { operation: "apply answer", state });
        }
        let applied = self.peer()?.set_remote_description(answer).await;
        if let Err(e) = applied {
            return Err(match e {
                PlatformError::InvalidState { state, .. } => {
                    SessionError::InvalidSignalingState { operation: "apply answer", state }
                }
                other => SessionError::MalformedEnvelope { kind: "answer".into(), reason: other.to_string() },
            });
        }
        self.streamer.answered_by = Some(envelope.id());
        self.on_remote_description_applied().await;
        self.transition(SessionState::Connected)
    }

    /// Stamps are only compared against the answer from the same sender;
    /// clocks of different hosts are never ordered against each other.
    pub(super) async fn on_connection_request(&mut self, envelope: &SignalingEnvelope) -> Result<(), SessionError> {
        let rejoin = match &self.streamer.answered_by {
            None => Rejoin::Republish,
            Some(answer) if answer.sender_id == envelope.sender_id => {
                if envelope.created_at < answer.created_at {
                    Rejoin::Stale
                } else {
                    Rejoin::Rebuild
                }
            }
            Some(_) if self.link_lost() => Rejoin::Rebuild,
            Some(_) => Rejoin::Busy,
        };
        match rejoin {
            Rejoin::Stale => {
                debug!("Session[{}] connection request already served", self.tag);
                Ok(())
            }
            Rejoin::Busy => {
                info!("Session[{}] stream already bound, ignoring request from {}", self.tag, envelope.sender_id);
                Ok(())
            }
            Rejoin::Republish => match self.streamer.offer.clone() {
                // Same SDP as before; a receiver that already applied it ignores the copy.
                Some(offer) => {
                    info!("Session[{}] receiver (re)joined, re-sending offer", self.tag);
                    self.relay.publish_offer(&offer).await
                }
                None => self.publish_offer().await,
            },
            Rejoin::Rebuild => {
                info!("Session[{}] receiver restarted, renegotiating on a new connection", self.tag);
                self.rebuild().await
            }
        }
    }

    fn link_lost(&self) -> bool {
        matches!(self.link, PeerLinkState::Disconnected | PeerLinkState::Failed | PeerLinkState::Closed)
    }

    /// Replace the peer connection and channel, keeping the capture.
    async fn rebuild(&mut self) -> Result<(), SessionError> {
        let capture = self.discard_peer().await.ok_or(SessionError::SessionClosed)?;
        self.streamer = StreamerState::default();
        let handles = self.attach_capture(capture).await?;
        self.install(handles);
        self.transition(SessionState::Negotiating)?;
        self.publish_offer().await
    }

    /// Swap the outgoing tracks to `capture` at `level`.
    ///
    /// Video is replaced first, then audio. If the audio replacement fails the
    /// previous video track is put back. Either way a failure leaves quality
    /// untouched and stops `capture`; success stops the previous capture.
    pub async fn apply_capture(
        &mut self,
        level: QualityLevel,
        mut capture: Box<dyn CaptureStream>,
    ) -> Result<(), SessionError> {
        if self.role != Role::Streamer || self.state.is_terminal() {
            capture.stop();
            return Err(SessionError::SessionClosed);
        }
        let outcome = {
            let Some(handles) = self.handles.as_ref() else {
                capture.stop();
                return Err(SessionError::SessionClosed);
            };
            replace_outgoing(
                handles.peer.as_ref(),
                handles.capture.as_deref(),
                capture.as_ref(),
                self.streamer.audio_sender,
            )
            .await
        };

        match outcome {
            Ok(sending_audio) => {
                if let Some(handles) = self.handles.as_mut() {
                    if let Some(mut previous) = handles.capture.replace(capture) {
                        previous.stop();
                    }
                }
                info!("Session[{}] quality {} → {}", self.tag, self.quality, level);
                self.quality = level;
                self.has_audio = sending_audio;
                self.quality_error = None;
                Ok(())
            }
            Err(e) => {
                capture.stop();
                let err = SessionError::TrackReplaceFailure { reason: e.to_string() };
                self.record_quality_failure(&err);
                Err(err)
            }
        }
    }
}

/// Returns whether audio is being sent afterwards.
async fn replace_outgoing(
    peer: &dyn PeerConnection,
    previous: Option<&dyn CaptureStream>,
    next: &dyn CaptureStream,
    audio_sender: bool,
) -> Result<bool, PlatformError> {
    peer.replace_track(TrackKind::Video, next.video_track()).await?;
    let Some(audio) = next.audio_track().filter(|_| audio_sender) else {
        return Ok(false);
    };
    if let Err(e) = peer.replace_track(TrackKind::Audio, audio).await {
        if let Some(previous) = previous {
            // Best effort; the original error is what gets reported.
            let _ = peer.replace_track(TrackKind::Video, previous.video_track()).await;
        }
        return Err(e);
    }
    Ok(true)
}
