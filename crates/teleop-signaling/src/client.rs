//! Session-side relay client.
//!
//! Wraps a shared [`SignalingRelay`] with what one session needs on top of it:
//!
//! ```text
//! publish_*() ──► outbox ──flush──► relay.publish()
//! poll()      ──flush──► relay.poll(session_id, sender_id) ──► batch
//! ```
//!
//! Publishing is fire-and-forget: a publish that fails while the relay is
//! unavailable stays queued and is retried before the next poll. Consecutive
//! outages are counted against a budget. Envelopes the relay rejects are
//! dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use teleop_core::{IceCandidate, QualityLevel, RelayError, SessionDescription, SessionError};
use tracing::{debug, warn};

use crate::envelope::{
    candidate_payload, description_payload, quality_payload, EnvelopeKind, SignalingEnvelope,
};
use crate::relay::SignalingRelay;

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Wall-clock microsecond timestamps, forced strictly increasing so one
/// sender never emits two envelopes with the same identity.
#[derive(Debug, Default)]
pub struct EnvelopeClock {
    last: u64,
}

impl EnvelopeClock {
    pub fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Fresh random sender identity for a session.
pub fn new_sender_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── RelayClient ───────────────────────────────────────────────────────────────

pub struct RelayClient {
    relay: Arc<dyn SignalingRelay>,
    session_id: String,
    sender_id: String,
    clock: EnvelopeClock,
    outbox: VecDeque<SignalingEnvelope>,
    failures: u32,
    max_failures: u32,
}

impl RelayClient {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        max_failures: u32,
    ) -> Self {
        Self {
            relay,
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            clock: EnvelopeClock::default(),
            outbox: VecDeque::new(),
            failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Envelopes waiting for the relay to come back.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    // ── Typed publishers ─────────────────────────────────────────────────────

    pub async fn publish_offer(&mut self, offer: &SessionDescription) -> Result<(), SessionError> {
        self.publish(EnvelopeKind::Offer, description_payload(offer)).await
    }

    pub async fn publish_answer(&mut self, answer: &SessionDescription) -> Result<(), SessionError> {
        self.publish(EnvelopeKind::Answer, description_payload(answer)).await
    }

    pub async fn publish_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.publish(EnvelopeKind::IceCandidate, candidate_payload(candidate)).await
    }

    pub async fn publish_quality_request(&mut self, level: QualityLevel) -> Result<(), SessionError> {
        self.publish(EnvelopeKind::QualityRequest, quality_payload(level)).await
    }

    pub async fn publish_connection_request(&mut self) -> Result<(), SessionError> {
        self.publish(EnvelopeKind::ConnectionRequest, serde_json::Value::Null).await
    }

    /// Queue an envelope and try to flush. Only fails once the failure budget
    /// is exhausted; otherwise the envelope stays queued.
    pub async fn publish(
        &mut self,
        kind: EnvelopeKind,
        payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        let envelope = SignalingEnvelope::new(
            kind,
            self.session_id.clone(),
            self.sender_id.clone(),
            payload,
            self.clock.next(),
        );
        self.outbox.push_back(envelope);
        self.flush().await
    }

    /// Send queued envelopes in order, stopping at the first outage. An
    /// envelope the relay rejects is dropped; retrying it would block
    /// everything queued behind it.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        while let Some(envelope) = self.outbox.front().cloned() {
            let kind = envelope.kind;
            match self.relay.publish(envelope).await {
                Ok(()) => {
                    self.outbox.pop_front();
                    self.failures = 0;
                    debug!("Relay[{}] sent {}", self.session_id, kind);
                }
                Err(RelayError::Rejected { reason }) => {
                    self.outbox.pop_front();
                    warn!("Relay[{}] rejected {}, dropped: {}", self.session_id, kind, reason);
                }
                Err(e) => return self.record_failure("publish", e),
            }
        }
        Ok(())
    }

    /// Flush the outbox, then fetch the next batch. A failed poll yields an
    /// empty batch until the budget is exhausted.
    pub async fn poll(&mut self) -> Result<Vec<SignalingEnvelope>, SessionError> {
        self.flush().await?;
        match self.relay.poll(&self.session_id, &self.sender_id).await {
            Ok(batch) => {
                self.failures = 0;
                Ok(batch)
            }
            Err(e) => self.record_failure("poll", e).map(|()| Vec::new()),
        }
    }

    fn record_failure(&mut self, op: &str, err: RelayError) -> Result<(), SessionError> {
        self.failures += 1;
        warn!(
            "Relay[{}] {} failed ({}/{}): {}",
            self.session_id, op, self.failures, self.max_failures, err
        );
        if self.failures >= self.max_failures {
            Err(SessionError::RelayUnavailable { failures: self.failures })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = EnvelopeClock::default();
        let stamps: Vec<u64> = (0..1000).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn outbox_survives_outage_and_keeps_order() {
        let relay = Arc::new(MemoryRelay::new());
        let mut client = RelayClient::new(relay.clone(), "robot-1", "me", 5);

        relay.set_available(false);
        client.publish_connection_request().await.unwrap();
        client.publish_quality_request(QualityLevel::High).await.unwrap();
        assert_eq!(client.pending(), 2);
        assert!(relay.history("robot-1").is_empty());

        relay.set_available(true);
        let batch = client.poll().await.unwrap();
        assert_eq!(client.pending(), 0);
        assert_eq!(client.consecutive_failures(), 0);
        let kinds: Vec<EnvelopeKind> = batch.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::ConnectionRequest, EnvelopeKind::QualityRequest]);
    }

    /// Relay that refuses one envelope kind and stores the rest.
    struct Refusing {
        inner: MemoryRelay,
        kind: EnvelopeKind,
    }

    #[async_trait::async_trait]
    impl SignalingRelay for Refusing {
        async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), RelayError> {
            if envelope.kind == self.kind {
                return Err(RelayError::Rejected { reason: format!("{} not accepted", envelope.kind) });
            }
            self.inner.publish(envelope).await
        }

        async fn poll(&self, session_id: &str, reader_id: &str) -> Result<Vec<SignalingEnvelope>, RelayError> {
            self.inner.poll(session_id, reader_id).await
        }
    }

    #[tokio::test]
    async fn rejected_envelope_does_not_block_the_outbox() {
        let relay = Arc::new(Refusing { inner: MemoryRelay::new(), kind: EnvelopeKind::QualityRequest });
        let mut client = RelayClient::new(relay.clone(), "robot-1", "me", 5);

        client.publish_quality_request(QualityLevel::High).await.unwrap();
        for i in 0..20 {
            client.publish_candidate(&IceCandidate::new(format!("cand-{i}"))).await.unwrap();
        }
        assert_eq!(client.pending(), 0);
        assert_eq!(client.consecutive_failures(), 0);

        let history = relay.inner.history("robot-1");
        assert_eq!(history.len(), 20);
        assert!(history.iter().all(|e| e.kind == EnvelopeKind::IceCandidate));
    }

    #[tokio::test]
    async fn budget_exhaustion_is_reported() {
        let relay = Arc::new(MemoryRelay::new());
        let mut client = RelayClient::new(relay.clone(), "robot-1", "me", 3);
        relay.set_available(false);

        assert!(client.poll().await.unwrap().is_empty());
        assert!(client.poll().await.unwrap().is_empty());
        let err = client.poll().await.unwrap_err();
        assert!(matches!(err, SessionError::RelayUnavailable { failures: 3 }));
    }

    #[tokio::test]
    async fn envelopes_carry_identity() {
        let relay = Arc::new(MemoryRelay::new());
        let mut client = RelayClient::new(relay.clone(), "robot-1", "me", 3);
        client.publish_offer(&SessionDescription::offer("v=0")).await.unwrap();
        client.publish_offer(&SessionDescription::offer("v=0")).await.unwrap();

        let history = relay.history("robot-1");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.sender_id == "me" && e.session_id == "robot-1"));
        assert_ne!(history[0].id(), history[1].id());
    }
}
