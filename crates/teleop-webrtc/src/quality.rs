//! Capture acquisition and single-flight quality changes.

use teleop_core::{CaptureConstraints, QualityLevel, SessionError};
use tracing::{info, warn};

use crate::platform::{CaptureStream, MediaDevices};

/// Acquire a capture at `level`, asking for audio first when `prefer_audio`
/// and falling back to video-only if that attempt fails.
///
/// Fails with [`SessionError::CaptureUnavailable`] only when video-only
/// capture fails too.
pub async fn acquire_with_fallback(
    media: &dyn MediaDevices,
    level: QualityLevel,
    prefer_audio: bool,
) -> Result<Box<dyn CaptureStream>, SessionError> {
    let constraints = CaptureConstraints::new(level, prefer_audio);

    if prefer_audio {
        match media.acquire(constraints).await {
            Ok(capture) => return Ok(capture),
            Err(e) => {
                let degraded = SessionError::AudioUnavailable { reason: e.to_string() };
                warn!("Capture {}: {}, retrying video-only", level, degraded);
            }
        }
    }

    let capture = media
        .acquire(constraints.video_only())
        .await
        .map_err(|e| SessionError::CaptureUnavailable { reason: e.to_string() })?;
    info!("Capture {} acquired: {} (audio={})", level, capture.profile(), capture.audio_track().is_some());
    Ok(capture)
}

// ── QualityGate ───────────────────────────────────────────────────────────────

/// What the caller should do with a quality request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Start acquiring at this level now.
    Start(QualityLevel),
    /// Already current or already in flight.
    Ignore,
    /// Held until the in-flight acquisition settles.
    Queued,
}

/// Serializes quality changes for one session.
///
/// At most one capture acquisition is in flight. Requests arriving meanwhile
/// are coalesced to the newest one, which is started after the in-flight
/// acquisition settles, unless it equals the level that was just applied.
#[derive(Debug)]
pub struct QualityGate {
    current: QualityLevel,
    in_flight: Option<QualityLevel>,
    queued: Option<QualityLevel>,
}

impl QualityGate {
    pub fn new(current: QualityLevel) -> Self {
        Self { current, in_flight: None, queued: None }
    }

    pub fn current(&self) -> QualityLevel {
        self.current
    }

    pub fn in_flight(&self) -> Option<QualityLevel> {
        self.in_flight
    }

    pub fn request(&mut self, level: QualityLevel) -> GateDecision {
        match self.in_flight {
            Some(flying) if flying == level => {
                self.queued = None;
                GateDecision::Ignore
            }
            Some(_) => {
                self.queued = Some(level);
                GateDecision::Queued
            }
            None if level == self.current => GateDecision::Ignore,
            None => {
                self.in_flight = Some(level);
                GateDecision::Start(level)
            }
        }
    }

    /// Record the outcome of the in-flight change (`applied` is `None` when it
    /// failed) and return the next level to start, if any.
    pub fn settle(&mut self, applied: Option<QualityLevel>) -> Option<QualityLevel> {
        if let Some(level) = applied {
            self.current = level;
        }
        self.in_flight = None;
        match self.queued.take() {
            Some(next) if next != self.current => {
                self.in_flight = Some(next);
                Some(next)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimJournal, SimMedia};
    use teleop_core::QualityLevel::*;

    #[test]
    fn same_level_as_current_is_ignored() {
        let mut gate = QualityGate::new(Low);
        assert_eq!(gate.request(Low), GateDecision::Ignore);
        assert_eq!(gate.request(High), GateDecision::Start(High));
        assert_eq!(gate.request(High), GateDecision::Ignore);
    }

    #[test]
    fn newest_request_wins_after_settle() {
        let mut gate = QualityGate::new(Low);
        assert_eq!(gate.request(High), GateDecision::Start(High));
        assert_eq!(gate.request(Medium), GateDecision::Queued);
        assert_eq!(gate.request(Low), GateDecision::Queued);
        assert_eq!(gate.settle(Some(High)), Some(Low));
        assert_eq!(gate.in_flight(), Some(Low));
        assert_eq!(gate.settle(Some(Low)), None);
        assert_eq!(gate.current(), Low);
    }

    #[test]
    fn queued_request_for_in_flight_level_is_dropped() {
        let mut gate = QualityGate::new(Low);
        gate.request(High);
        gate.request(Medium);
        assert_eq!(gate.request(High), GateDecision::Ignore);
        assert_eq!(gate.settle(Some(High)), None);
    }

    #[test]
    fn failed_change_keeps_current_and_retries_queued() {
        let mut gate = QualityGate::new(Low);
        gate.request(High);
        gate.request(Medium);
        assert_eq!(gate.settle(None), Some(Medium));
        assert_eq!(gate.current(), Low);
    }

    #[tokio::test]
    async fn audio_denied_falls_back_to_video_only() {
        let media = SimMedia::new(SimJournal::default());
        media.set_audio_available(false);
        let capture = acquire_with_fallback(&media, Low, true).await.unwrap();
        assert!(capture.audio_track().is_none());
        assert_eq!(capture.profile(), Low.profile());
    }

    #[tokio::test]
    async fn no_camera_is_capture_unavailable() {
        let media = SimMedia::new(SimJournal::default());
        media.set_video_available(false);
        let err = acquire_with_fallback(&media, Low, true).await.err().unwrap();
        assert!(matches!(err, SessionError::CaptureUnavailable { .. }));
    }
}
