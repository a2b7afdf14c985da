use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use teleop_core::{Role, SessionPolicy, SessionState};
use teleop_signaling::MemoryRelay;
use teleop_webrtc::sim::SimPlatform;
use teleop_webrtc::{ConnectionSession, FocusEvent, QualityAdaptationController, SessionHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_STREAM_ID: &str = "robot-1/front";

/// One streamer/receiver pair plus the operator-side focus controller.
struct Link {
    stream_id: String,
    streamer: SessionHandle,
    receiver: SessionHandle,
    focus: mpsc::Sender<FocusEvent>,
    controller: JoinHandle<()>,
}

/// Loopback run: streamers and receivers negotiate over an in-process relay
/// on simulated devices, then operator focus moves across the streams.
///
/// # Environment
/// - `TELEOP_POLICY`: path to a JSON session policy (defaults otherwise)
/// - `TELEOP_STREAM_ID`: base stream id (default `robot-1/front`)
/// - `TELEOP_STREAM_COUNT`: streams to run side by side (default 1, max 8)
///
/// # Flow
/// 1. Spawn a receiver and a streamer session per stream
/// 2. Wait for every pair to reach `Connected`
/// 3. Focus each stream in turn (High), then release it (Low)
/// 4. Stop everything; cleanup releases all devices
pub async fn run() -> Result<()> {
    let policy = load_policy()?;
    let base = std::env::var("TELEOP_STREAM_ID").unwrap_or_else(|_| DEFAULT_STREAM_ID.to_owned());
    let stream_count: usize = std::env::var("TELEOP_STREAM_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
        .clamp(1, 8);

    info!(
        "Starting {} stream(s), poll every {}ms, negotiation timeout {}ms",
        stream_count, policy.poll_interval_ms, policy.negotiation_timeout_ms
    );

    let relay = Arc::new(MemoryRelay::new());
    let platform = SimPlatform::new();
    let mut links = Vec::with_capacity(stream_count);
    for n in 0..stream_count {
        let stream_id = if stream_count == 1 { base.clone() } else { format!("{base}-{n}") };
        links.push(open_link(&stream_id, &policy, &relay, &platform));
    }

    // Negotiation completes well within the timeout, or the session faults.
    let settle = policy.negotiation_timeout() + policy.poll_interval() * 2;
    for link in &links {
        let settled = link.receiver.wait_for(|s| {
            !matches!(s.state, SessionState::New | SessionState::Initializing | SessionState::Negotiating)
        });
        let status = tokio::time::timeout(settle, settled)
            .await
            .with_context(|| format!("Stream[{}] did not settle", link.stream_id))?;
        if status.state != SessionState::Connected {
            bail!("Stream[{}] ended in {}: {}", link.stream_id, status.state, status.fault.unwrap_or_default());
        }
        info!("Stream[{}] connected (audio: {})", link.stream_id, status.has_audio);
    }

    tokio::select! {
        result = cycle_focus(&links, policy.poll_interval() * 3) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    for link in links {
        let Link { stream_id, streamer, receiver, focus, controller } = link;
        drop(focus);
        join_controller(&stream_id, controller).await;
        let rx = receiver.stop().await;
        let tx = streamer.stop().await;
        info!(
            "Stream[{}] closed: streamer {} at {}, receiver {}",
            stream_id, tx.state, tx.quality, rx.state
        );
        if let Some(fault) = tx.fault.or(rx.fault) {
            warn!("Stream[{}] fault: {}", stream_id, fault);
        }
    }
    Ok(())
}

fn load_policy() -> Result<SessionPolicy> {
    let Ok(path) = std::env::var("TELEOP_POLICY") else {
        return Ok(SessionPolicy::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading policy {path}"))?;
    let policy = serde_json::from_str(&text).with_context(|| format!("parsing policy {path}"))?;
    info!("Loaded session policy from {}", path);
    Ok(policy)
}

fn open_link(stream_id: &str, policy: &SessionPolicy, relay: &Arc<MemoryRelay>, platform: &SimPlatform) -> Link {
    let session = |role| ConnectionSession::new(role, stream_id, policy.clone(), platform.host(), relay.clone());
    let receiver = SessionHandle::spawn(session(Role::Receiver));
    let streamer = SessionHandle::spawn(session(Role::Streamer));

    let (focus, events) = mpsc::channel(8);
    let controller = QualityAdaptationController::new(stream_id, receiver.downgrade());
    let controller = tokio::spawn(controller.run(events));

    Link { stream_id: stream_id.to_owned(), streamer, receiver, focus, controller }
}

/// Wait for a focus controller to wind down. Returns whether it ended cleanly.
async fn join_controller(stream_id: &str, controller: JoinHandle<()>) -> bool {
    match controller.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Stream[{}] focus controller ended abnormally: {}", stream_id, e);
            false
        }
    }
}

async fn cycle_focus(links: &[Link], dwell: Duration) -> Result<()> {
    for link in links {
        for focused in [true, false] {
            link.focus
                .send(FocusEvent::new(link.stream_id.clone(), focused))
                .await
                .with_context(|| format!("Stream[{}] controller stopped", link.stream_id))?;
            tokio::time::sleep(dwell).await;
            let status = link.streamer.status();
            info!("Stream[{}] focus={} → streamer at {}", link.stream_id, focused, status.quality);
        }
    }
    Ok(())
}
