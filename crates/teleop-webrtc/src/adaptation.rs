//! Focus-driven quality adaptation.
//!
//! The operator UI shows many streams at once but only one has focus. The
//! focused stream is asked for high quality; everything else stays low.

use teleop_core::QualityLevel;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::driver::WeakSessionHandle;

/// Focus/assignment change from the operator UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusEvent {
    pub stream_id: String,
    pub focused: bool,
}

impl FocusEvent {
    pub fn new(stream_id: impl Into<String>, focused: bool) -> Self {
        Self { stream_id: stream_id.into(), focused }
    }
}

/// Maps focus changes of one stream to quality requests on its session.
///
/// Holds only a weak handle: the controller never keeps a session alive and
/// goes quiet once the session is gone.
pub struct QualityAdaptationController {
    stream_id: String,
    session: WeakSessionHandle,
    focused: bool,
}

impl QualityAdaptationController {
    pub fn new(stream_id: impl Into<String>, session: WeakSessionHandle) -> Self {
        Self { stream_id: stream_id.into(), session, focused: false }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn target_for(focused: bool) -> QualityLevel {
        if focused {
            QualityLevel::High
        } else {
            QualityLevel::Low
        }
    }

    /// Apply a focus change. Returns the level requested, or `None` when the
    /// event was for another stream, did not change focus, or the session
    /// is gone. Focus is only recorded once the request went out, so a
    /// failed one is retried by the next identical event.
    pub async fn on_focus_changed(&mut self, event: &FocusEvent) -> Option<QualityLevel> {
        if event.stream_id != self.stream_id || event.focused == self.focused {
            return None;
        }
        let level = Self::target_for(event.focused);
        match self.session.request_quality(level).await {
            Ok(()) => {
                self.focused = event.focused;
                info!("Adapt[{}] focus={} → {}", self.stream_id, event.focused, level);
                Some(level)
            }
            Err(e) => {
                debug!("Adapt[{}] {} not requested: {}", self.stream_id, level, e);
                None
            }
        }
    }

    /// Follow focus events until the source closes or the session is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<FocusEvent>) {
        while let Some(event) = events.recv().await {
            self.on_focus_changed(&event).await;
            if !self.session.is_alive() {
                debug!("Adapt[{}] session gone, stopping", self.stream_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SessionCommand;

    const STREAM: &str = "robot-4/front";

    fn controller() -> (QualityAdaptationController, mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let controller = QualityAdaptationController::new(STREAM, WeakSessionHandle::new(&tx));
        (controller, tx, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SessionCommand>) -> Vec<SessionCommand> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn focus_cycle_issues_high_then_low() {
        let (mut controller, _tx, mut rx) = controller();

        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, false)).await, None);
        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, true)).await, Some(QualityLevel::High));
        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, false)).await, Some(QualityLevel::Low));

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionCommand::RequestQuality(QualityLevel::High),
                SessionCommand::RequestQuality(QualityLevel::Low),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_focus_is_not_re_requested() {
        let (mut controller, _tx, mut rx) = controller();
        controller.on_focus_changed(&FocusEvent::new(STREAM, true)).await;
        drain(&mut rx);

        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, true)).await, None);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn other_streams_are_ignored() {
        let (mut controller, _tx, mut rx) = controller();
        assert_eq!(controller.on_focus_changed(&FocusEvent::new("robot-4/rear", true)).await, None);
        assert!(drain(&mut rx).is_empty());
        assert!(!controller.is_focused());
    }

    #[tokio::test]
    async fn gone_session_is_not_kept_alive() {
        let (mut controller, tx, rx) = controller();
        drop(tx);
        drop(rx);
        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, true)).await, None);
    }

    #[tokio::test]
    async fn failed_request_leaves_focus_unrecorded() {
        let (mut controller, _tx, rx) = controller();
        drop(rx);

        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, true)).await, None);
        assert!(!controller.is_focused());

        // Later focus-out is still a no-op against the unchanged state.
        assert_eq!(controller.on_focus_changed(&FocusEvent::new(STREAM, false)).await, None);
        assert!(!controller.is_focused());
    }

    #[tokio::test]
    async fn run_stops_when_events_end() {
        let (controller, _tx, mut rx) = controller();
        let (events_tx, events_rx) = mpsc::channel(4);
        events_tx.send(FocusEvent::new(STREAM, true)).await.unwrap();
        events_tx.send(FocusEvent::new(STREAM, false)).await.unwrap();
        drop(events_tx);

        controller.run(events_rx).await;
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
