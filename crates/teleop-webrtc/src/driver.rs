//! Session driver — runs one [`ConnectionSession`] as a task.
//!
//! The driver is the single logical flow that advances a session:
//!
//! ```text
//!            ┌──────────── SessionHandle / WeakSessionHandle (commands)
//!            │  ┌───────── poll interval (relay batches)
//!            │  │  ┌────── host notifications (PeerEvent)
//!            │  │  │  ┌─── capture acquisition settled
//!            ▼  ▼  ▼  ▼
//!         select! ─► ConnectionSession ─► watch<SessionStatus>
//! ```
//!
//! Streamer quality changes go through a [`QualityGate`]: the capture is
//! acquired on its own task (acquisition cannot be cancelled) and the
//! result is applied back on the driver, so the session is never touched
//! from two places at once.

use std::sync::Arc;
use std::time::Duration;

use teleop_core::{QualityLevel, Role, SessionError};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::platform::{CaptureStream, MediaDevices};
use crate::quality::{acquire_with_fallback, GateDecision, QualityGate};
use crate::session::{ConnectionSession, SessionStatus};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    RequestQuality(QualityLevel),
    Stop,
}

type Acquisition = JoinHandle<(QualityLevel, Result<Box<dyn CaptureStream>, SessionError>)>;

// ── Handles ───────────────────────────────────────────────────────────────────

/// Owning handle to a running session. Dropping every handle stops it.
pub struct SessionHandle {
    id: String,
    role: Role,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start driving `session` on the current runtime.
    pub fn spawn(session: ConnectionSession) -> Self {
        let id = session.id().to_owned();
        let role = session.role();
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status) = watch::channel(session.status());
        let task = tokio::spawn(drive(session, rx, status_tx));
        Self { id, role, commands, status, task }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `pred`. Returns the last
    /// status if the session ends first.
    pub async fn wait_for(&self, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.status.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    pub async fn request_quality(&self, level: QualityLevel) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::RequestQuality(level))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    pub fn downgrade(&self) -> WeakSessionHandle {
        WeakSessionHandle::new(&self.commands)
    }

    /// Stop the session and wait for cleanup to finish.
    pub async fn stop(self) -> SessionStatus {
        let _ = self.commands.send(SessionCommand::Stop).await;
        if let Err(e) = self.task.await {
            warn!("Session[{}] driver task ended abnormally: {}", self.id, e);
        }
        self.status.borrow().clone()
    }
}

/// Non-owning handle: does not keep the session alive.
#[derive(Debug, Clone)]
pub struct WeakSessionHandle {
    commands: mpsc::WeakSender<SessionCommand>,
}

impl WeakSessionHandle {
    pub(crate) fn new(commands: &mpsc::Sender<SessionCommand>) -> Self {
        Self { commands: commands.downgrade() }
    }

    pub fn is_alive(&self) -> bool {
        self.commands.upgrade().is_some_and(|tx| !tx.is_closed())
    }

    pub async fn request_quality(&self, level: QualityLevel) -> Result<(), SessionError> {
        let commands = self.commands.upgrade().ok_or(SessionError::SessionClosed)?;
        commands
            .send(SessionCommand::RequestQuality(level))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }
}

// ── Driver loop ───────────────────────────────────────────────────────────────

async fn drive(
    mut session: ConnectionSession,
    mut commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<SessionStatus>,
) {
    let tag = session.tag().to_owned();

    if let Err(e) = session.initialize().await {
        warn!("Session[{}] could not start: {}", tag, e);
        publish(&status, &session);
        session.cleanup().await;
        publish(&status, &session);
        return;
    }
    publish(&status, &session);

    let media = session.platform().media.clone();
    let prefer_audio = session.policy().prefer_audio;
    let mut ticker = interval(session.policy().poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gate = QualityGate::new(session.quality());
    let mut acquiring: Option<Acquisition> = None;

    loop {
        let deadline = session.negotiation_deadline();

        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::RequestQuality(level)) => {
                    route_quality(&mut session, &mut gate, &mut acquiring, &media, prefer_audio, level).await;
                }
                Some(SessionCommand::Stop) | None => {
                    info!("Session[{}] stop requested", tag);
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = session.poll_once().await {
                    debug!("Session[{}] poll: {}", tag, e);
                }
            }
            Some(event) = session.next_event() => {
                if let Err(e) = session.handle_peer_event(event).await {
                    debug!("Session[{}] peer event: {}", tag, e);
                }
            }
            settled = settle(&mut acquiring), if acquiring.is_some() => {
                acquiring = None;
                let applied = match settled {
                    Ok((level, Ok(capture))) => session.apply_capture(level, capture).await.ok().map(|()| level),
                    Ok((_, Err(e))) => {
                        session.record_quality_failure(&e);
                        None
                    }
                    Err(e) => {
                        session.record_quality_failure(&SessionError::CaptureUnavailable { reason: e.to_string() });
                        None
                    }
                };
                if let Some(next) = gate.settle(applied) {
                    acquiring = Some(spawn_acquire(media.clone(), next, prefer_audio));
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                let ms = session.policy().negotiation_timeout_ms;
                session.fail(SessionError::NegotiationTimeout { ms });
            }
        }

        if let Some(level) = session.take_quality_request() {
            route_quality(&mut session, &mut gate, &mut acquiring, &media, prefer_audio, level).await;
        }

        publish(&status, &session);
        if session.state().is_terminal() {
            break;
        }
    }

    // Nothing polls the relay past this point. An acquisition still running
    // cannot be cancelled: wait for it and release whatever it produced.
    if let Some(pending) = acquiring.take() {
        if let Ok((level, Ok(mut capture))) = pending.await {
            debug!("Session[{}] discarding late {} capture", tag, level);
            capture.stop();
        }
    }
    session.cleanup().await;
    publish(&status, &session);
    info!("Session[{}] driver exited", tag);
}

async fn route_quality(
    session: &mut ConnectionSession,
    gate: &mut QualityGate,
    acquiring: &mut Option<Acquisition>,
    media: &Arc<dyn MediaDevices>,
    prefer_audio: bool,
    level: QualityLevel,
) {
    match session.role() {
        Role::Receiver => {
            if let Err(e) = session.request_quality(level).await {
                session.record_quality_failure(&e);
            }
        }
        Role::Streamer => match gate.request(level) {
            GateDecision::Start(level) => {
                *acquiring = Some(spawn_acquire(media.clone(), level, prefer_audio));
            }
            GateDecision::Queued => {
                debug!("Session[{}] {} queued behind {:?}", session.tag(), level, gate.in_flight());
            }
            GateDecision::Ignore => {}
        },
    }
}

fn spawn_acquire(media: Arc<dyn MediaDevices>, level: QualityLevel, prefer_audio: bool) -> Acquisition {
    tokio::spawn(async move {
        let result = acquire_with_fallback(media.as_ref(), level, prefer_audio).await;
        (level, result)
    })
}

async fn settle(
    slot: &mut Option<Acquisition>,
) -> Result<(QualityLevel, Result<Box<dyn CaptureStream>, SessionError>), JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

fn publish(status: &watch::Sender<SessionStatus>, session: &ConnectionSession) {
    let next = session.status();
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimOp, SimPlatform};
    use std::sync::Arc;
    use teleop_core::{SessionPolicy, SessionState};
    use teleop_signaling::{EnvelopeKind, MemoryRelay};

    const STREAM: &str = "robot-2/arm";

    fn spawn(role: Role, relay: &Arc<MemoryRelay>, sim: &SimPlatform) -> SessionHandle {
        let policy = SessionPolicy { poll_interval_ms: 100, ..SessionPolicy::default() };
        SessionHandle::spawn(ConnectionSession::new(role, STREAM, policy, sim.host(), relay.clone()))
    }

    async fn connected(relay: &Arc<MemoryRelay>, streamer: &SimPlatform, receiver: &SimPlatform) -> (SessionHandle, SessionHandle) {
        let rx = spawn(Role::Receiver, relay, receiver);
        let tx = spawn(Role::Streamer, relay, streamer);
        let connected = |s: &SessionStatus| s.state == SessionState::Connected;
        assert_eq!(tx.wait_for(connected).await.state, SessionState::Connected);
        assert_eq!(rx.wait_for(connected).await.state, SessionState::Connected);
        (tx, rx)
    }

    #[tokio::test]
    async fn loopback_connects_and_stops_cleanly() {
        let relay = Arc::new(MemoryRelay::new());
        let (streamer, receiver) = (SimPlatform::new(), SimPlatform::new());
        let (tx, rx) = connected(&relay, &streamer, &receiver).await;

        assert!(rx.wait_for(|s| s.has_audio).await.has_audio);

        let status = tx.stop().await;
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::PeerClosed { .. })), 1);
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::TrackStopped { .. })), 2);

        assert_eq!(rx.stop().await.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn operator_quality_request_reaches_streamer() {
        let relay = Arc::new(MemoryRelay::new());
        let (streamer, receiver) = (SimPlatform::new(), SimPlatform::new());
        let (tx, rx) = connected(&relay, &streamer, &receiver).await;

        rx.request_quality(QualityLevel::High).await.unwrap();
        let status = tx.wait_for(|s| s.quality == QualityLevel::High).await;
        assert_eq!(status.quality, QualityLevel::High);
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::Acquired { .. })), 2);

        tx.stop().await;
        rx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn requests_during_acquisition_collapse_to_newest() {
        let relay = Arc::new(MemoryRelay::new());
        let (streamer, receiver) = (SimPlatform::new(), SimPlatform::new());
        let (tx, rx) = connected(&relay, &streamer, &receiver).await;
        streamer.media.set_acquire_delay(Duration::from_millis(500));

        tx.request_quality(QualityLevel::High).await.unwrap();
        tx.request_quality(QualityLevel::Medium).await.unwrap();
        tx.request_quality(QualityLevel::Low).await.unwrap();
        tx.request_quality(QualityLevel::Medium).await.unwrap();

        let status = tx.wait_for(|s| s.quality == QualityLevel::Medium).await;
        assert_eq!(status.quality, QualityLevel::Medium);
        // Initial capture, High, then the newest queued level.
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::Acquired { .. })), 3);

        tx.stop().await;
        rx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_acquisition_releases_late_capture() {
        let relay = Arc::new(MemoryRelay::new());
        let (streamer, receiver) = (SimPlatform::new(), SimPlatform::new());
        let (tx, rx) = connected(&relay, &streamer, &receiver).await;
        streamer.media.set_acquire_delay(Duration::from_secs(2));

        tx.request_quality(QualityLevel::High).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = tx.stop().await;

        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.quality, QualityLevel::Low);
        // Both captures end up stopped: the live one and the one that landed late.
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::TrackStopped { .. })), 4);
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::TrackReplaced { .. })), 0);

        rx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_times_out_without_streamer() {
        let relay = Arc::new(MemoryRelay::new());
        let receiver = SimPlatform::new();
        let rx = spawn(Role::Receiver, &relay, &receiver);

        let status = rx.wait_for(|s| s.state == SessionState::Closed).await;
        assert!(status.fault.unwrap_or_default().contains("30000"));
        assert_eq!(receiver.journal.count(|op| matches!(op, SimOp::PeerClosed { .. })), 1);
        assert_eq!(relay.history(STREAM).iter().filter(|e| e.kind == EnvelopeKind::ConnectionRequest).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_outage_faults_the_session() {
        let relay = Arc::new(MemoryRelay::new());
        let (streamer, receiver) = (SimPlatform::new(), SimPlatform::new());
        let (tx, rx) = connected(&relay, &streamer, &receiver).await;

        relay.set_available(false);
        let status = tx.wait_for(|s| s.state == SessionState::Closed).await;
        assert!(status.fault.is_some());
        assert_eq!(streamer.journal.count(|op| matches!(op, SimOp::PeerClosed { .. })), 1);

        drop(rx);
    }

    #[tokio::test]
    async fn capture_failure_at_start_closes_with_fault() {
        let relay = Arc::new(MemoryRelay::new());
        let streamer = SimPlatform::new();
        streamer.media.set_video_available(false);

        let tx = spawn(Role::Streamer, &relay, &streamer);
        let status = tx.wait_for(|s| s.state == SessionState::Closed).await;
        assert!(status.fault.is_some());
        assert!(!tx.downgrade().is_alive());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_session() {
        let relay = Arc::new(MemoryRelay::new());
        let streamer = SimPlatform::new();
        let tx = spawn(Role::Streamer, &relay, &streamer);
        let weak = tx.downgrade();
        let mut status = tx.subscribe();

        drop(tx);
        while status.borrow_and_update().state != SessionState::Closed {
            if status.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(status.borrow().state, SessionState::Closed);
        assert!(weak.request_quality(QualityLevel::High).await.is_err());
    }
}
