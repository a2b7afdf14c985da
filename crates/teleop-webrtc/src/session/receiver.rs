//! Receiver side: asks for a stream, answers offers, forwards quality asks.

use bytes::Bytes;
use teleop_core::{PlatformError, QualityLevel, SessionDescription, SessionError, SessionState, SignalingState, TrackKind};
use teleop_signaling::{ControlMessage, SignalingEnvelope};
use tracing::{debug, info, warn};

use super::{peer_error, ConnectionSession, Handles};

#[derive(Debug, Default)]
pub(super) struct ReceiverState {
    /// Offer applied to the live connection.
    remote_offer: Option<SessionDescription>,
    remote_tracks: Vec<TrackKind>,
    resets: u32,
}

impl ConnectionSession {
    pub(super) async fn open_receiver(&mut self) -> Result<Handles, SessionError> {
        let peer = self.platform.peers.create().await.map_err(peer_error)?;
        Ok(Handles { channel: None, peer, capture: None })
    }

    /// Tell any streamer on this stream that we want an offer.
    pub(super) async fn announce(&mut self) -> Result<(), SessionError> {
        self.relay.publish_connection_request().await?;
        info!("Session[{}] connection request published", self.tag);
        Ok(())
    }

    /// Number of times the receiver threw its connection away and started over.
    pub fn resets(&self) -> u32 {
        self.receiver.resets
    }

    /// Kinds of remote tracks received on the live connection.
    pub fn remote_tracks(&self) -> &[TrackKind] {
        &self.receiver.remote_tracks
    }

    pub(super) async fn on_offer(&mut self, envelope: &SignalingEnvelope) -> Result<(), SessionError> {
        let offer = envelope.description()?;
        let state = self.peer()?.signaling_state();
        match state {
            SignalingState::Stable if self.remote_applied => {
                let same = self.receiver.remote_offer.as_ref().is_some_and(|applied| applied.sdp == offer.sdp);
                if same {
                    debug!("Session[{}] offer already applied", self.tag);
                    return Ok(());
                }
                info!("Session[{}] new offer on a negotiated connection", self.tag);
                return self.full_reset().await;
            }
            SignalingState::Stable => {}
            state => {
                warn!("Session[{}] offer collided with signaling state {:?}", self.tag, state);
                return self.full_reset().await;
            }
        }

        let applied = self.peer()?.set_remote_description(offer.clone()).await;
        if let Err(e) = applied {
            return match e {
                PlatformError::InvalidState { state, .. } => {
                    warn!("Session[{}] offer rejected in {:?}", self.tag, state);
                    self.full_reset().await
                }
                other => Err(SessionError::MalformedEnvelope { kind: "offer".into(), reason: other.to_string() }),
            };
        }
        self.receiver.remote_offer = Some(offer);
        self.on_remote_description_applied().await;

        let answer = match self.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Session[{}] could not answer: {}", self.tag, e);
                return self.full_reset().await;
            }
        };
        self.relay.publish_answer(&answer).await?;
        info!("Session[{}] answer published", self.tag);
        self.transition(SessionState::Connected)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError> {
        let peer = self.peer().map_err(|e| PlatformError::Failed { reason: e.to_string() })?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Discard the connection and everything negotiated on it, then ask for
    /// a fresh offer on a new one.
    async fn full_reset(&mut self) -> Result<(), SessionError> {
        self.receiver.resets += 1;
        info!("Session[{}] full reset #{}", self.tag, self.receiver.resets);
        self.discard_peer().await;
        self.receiver.remote_offer = None;
        self.receiver.remote_tracks.clear();
        self.has_audio = false;

        let handles = self.open_receiver().await?;
        self.install(handles);
        self.transition(SessionState::Negotiating)?;
        self.announce().await
    }

    pub(super) fn record_remote_track(&mut self, kind: TrackKind) {
        info!("Session[{}] remote {} track", self.tag, kind);
        self.receiver.remote_tracks.push(kind);
        if kind == TrackKind::Audio {
            self.has_audio = true;
        }
    }

    /// Ask the streamer for `level` over the relay, and over the control
    /// channel as well when it is open.
    ///
    /// On a receiver `quality` is the level last asked for, not a level the
    /// streamer confirmed. During a relay outage the ask waits in the outbox
    /// and goes out on the next successful flush.
    pub(super) async fn send_quality_request(&mut self, level: QualityLevel) -> Result<(), SessionError> {
        if level == self.quality {
            return Ok(());
        }
        if let Err(e) = self.relay.publish_quality_request(level).await {
            return Err(self.fail(e));
        }
        let channel = self.handles.as_ref().and_then(|h| h.channel.as_deref()).filter(|c| c.is_open());
        if let Some(channel) = channel {
            let message = ControlMessage::QualityRequest { level };
            if let Err(e) = channel.send(Bytes::from(message.to_bytes())).await {
                warn!("Session[{}] control channel send failed: {}", self.tag, e);
            }
        }
        if self.relay.pending() > 0 {
            info!("Session[{}] requested {} quality (queued until the relay is back)", self.tag, level);
        } else {
            info!("Session[{}] requested {} quality", self.tag, level);
        }
        self.quality = level;
        Ok(())
    }
}
