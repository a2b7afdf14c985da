//! Signaling relay collaborator.
//!
//! The session core depends on two operations only: `publish` and `poll`.
//! Neither ordering nor deduplication is assumed of an implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use teleop_core::RelayError;
use tracing::debug;

use crate::envelope::SignalingEnvelope;

// MARK: - Relay trait

/// Best-effort, at-least-once message relay keyed by stream id.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Append an envelope to the stream identified by `envelope.session_id`.
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), RelayError>;

    /// Envelopes appended to `session_id` since `reader_id` last polled.
    /// May contain duplicates and the reader's own envelopes.
    async fn poll(&self, session_id: &str, reader_id: &str) -> Result<Vec<SignalingEnvelope>, RelayError>;
}

// MARK: - MemoryRelay

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<SignalingEnvelope>,
    cursors: HashMap<String, usize>,
}

/// In-process relay service shared by reference between sessions.
///
/// Each reader has its own cursor into a per-stream append-only log. An entry
/// is flagged `processed` once any reader other than its sender has read it.
#[derive(Debug)]
pub struct MemoryRelay {
    streams: Mutex<HashMap<String, StreamLog>>,
    available: AtomicBool,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self { streams: Mutex::new(HashMap::new()), available: AtomicBool::new(true) }
    }

    /// Simulate an outage: while unavailable every publish/poll fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of everything published to a stream, in append order.
    pub fn history(&self, session_id: &str) -> Vec<SignalingEnvelope> {
        self.streams
            .lock()
            .map(|s| s.get(session_id).map(|log| log.entries.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Rewind a reader's cursor so its next poll redelivers the whole log.
    pub fn rewind(&self, session_id: &str, reader_id: &str) {
        if let Ok(mut streams) = self.streams.lock() {
            if let Some(log) = streams.get_mut(session_id) {
                log.cursors.insert(reader_id.to_owned(), 0);
            }
        }
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable { reason: "memory relay offline".into() })
        }
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), RelayError> {
        self.check_available()?;
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| RelayError::Unavailable { reason: "relay lock poisoned".into() })?;
        debug!("Relay[{}] publish {} from {}", envelope.session_id, envelope.kind, envelope.sender_id);
        streams.entry(envelope.session_id.clone()).or_default().entries.push(envelope);
        Ok(())
    }

    async fn poll(&self, session_id: &str, reader_id: &str) -> Result<Vec<SignalingEnvelope>, RelayError> {
        self.check_available()?;
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| RelayError::Unavailable { reason: "relay lock poisoned".into() })?;
        let log = streams.entry(session_id.to_owned()).or_default();
        let start = log.cursors.get(reader_id).copied().unwrap_or(0);
        let batch: Vec<SignalingEnvelope> = log.entries[start..].to_vec();
        for entry in &mut log.entries[start..] {
            if entry.sender_id != reader_id {
                entry.mark_processed();
            }
        }
        log.cursors.insert(reader_id.to_owned(), log.entries.len());
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;

    fn env(sender: &str, at: u64) -> SignalingEnvelope {
        SignalingEnvelope::new(EnvelopeKind::ConnectionRequest, "robot-1", sender, serde_json::Value::Null, at)
    }

    #[tokio::test]
    async fn readers_have_independent_cursors() {
        let relay = MemoryRelay::new();
        relay.publish(env("a", 1)).await.unwrap();
        relay.publish(env("b", 2)).await.unwrap();

        assert_eq!(relay.poll("robot-1", "a").await.unwrap().len(), 2);
        assert!(relay.poll("robot-1", "a").await.unwrap().is_empty());
        assert_eq!(relay.poll("robot-1", "b").await.unwrap().len(), 2);

        relay.publish(env("a", 3)).await.unwrap();
        let next = relay.poll("robot-1", "b").await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].created_at, 3);
    }

    #[tokio::test]
    async fn processed_is_set_by_peers_only() {
        let relay = MemoryRelay::new();
        relay.publish(env("a", 1)).await.unwrap();
        relay.poll("robot-1", "a").await.unwrap();
        assert!(!relay.history("robot-1")[0].processed);
        relay.poll("robot-1", "b").await.unwrap();
        assert!(relay.history("robot-1")[0].processed);
    }

    #[tokio::test]
    async fn outage_fails_both_operations() {
        let relay = MemoryRelay::new();
        relay.set_available(false);
        assert!(relay.publish(env("a", 1)).await.is_err());
        assert!(relay.poll("robot-1", "a").await.is_err());
        relay.set_available(true);
        assert!(relay.poll("robot-1", "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewind_redelivers() {
        let relay = MemoryRelay::new();
        relay.publish(env("a", 1)).await.unwrap();
        relay.poll("robot-1", "b").await.unwrap();
        relay.rewind("robot-1", "b");
        assert_eq!(relay.poll("robot-1", "b").await.unwrap().len(), 1);
    }
}
