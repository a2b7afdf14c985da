//! teleop-webrtc — peer-to-peer streaming sessions.
//!
//! # Architecture
//!
//! ```text
//! QualityAdaptationController ──weak──► SessionHandle ──► driver task
//!                                                            │
//!                      ┌─────────────────────────────────────┘
//!                      ▼
//!              ConnectionSession ──► RelayClient (teleop-signaling)
//!                      │
//!                      └──► HostPlatform: MediaDevices + PeerConnectionFactory
//!                                          (host runtime, or `sim` in-process)
//! ```
//!
//! A session plays one [`Role`](teleop_core::Role): the streamer captures
//! and offers, the receiver asks for a stream and answers.

pub mod adaptation;
pub mod driver;
pub mod platform;
pub mod quality;
pub mod session;
pub mod sim;

pub use adaptation::{FocusEvent, QualityAdaptationController};
pub use driver::{SessionCommand, SessionHandle, WeakSessionHandle};
pub use platform::{
    CaptureStream, DataChannel, HostPlatform, MediaDevices, PeerConnection, PeerConnectionFactory,
    PeerEvent,
};
pub use quality::{acquire_with_fallback, GateDecision, QualityGate};
pub use session::{ConnectionSession, SessionStatus};
