use std::collections::HashSet;

use crate::envelope::{EnvelopeId, SignalingEnvelope};

/// Outcome of offering an inbound envelope to the [`EnvelopeFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; apply it.
    Fresh,
    /// Same `(kind, created_at, sender_id)` already admitted.
    Duplicate,
    /// Our own envelope echoed back by the relay.
    SelfEcho,
    /// Addressed to a different stream.
    ForeignSession,
}

/// Idempotence guard for at-least-once delivery.
///
/// An envelope is recorded as seen when it is admitted, before it is applied,
/// so a payload that later fails to apply is still never retried.
#[derive(Debug)]
pub struct EnvelopeFilter {
    own_id: String,
    session_id: String,
    seen: HashSet<EnvelopeId>,
}

impl EnvelopeFilter {
    pub fn new(own_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { own_id: own_id.into(), session_id: session_id.into(), seen: HashSet::new() }
    }

    pub fn admit(&mut self, envelope: &SignalingEnvelope) -> Admission {
        if envelope.session_id != self.session_id {
            return Admission::ForeignSession;
        }
        if envelope.sender_id == self.own_id {
            return Admission::SelfEcho;
        }
        if self.seen.insert(envelope.id()) {
            Admission::Fresh
        } else {
            Admission::Duplicate
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
