//! teleop-signaling — signaling envelopes and relay plumbing.
//!
//! # Architecture
//!
//! ```text
//! ConnectionSession ──► RelayClient ──► dyn SignalingRelay ──► (external relay)
//!        ▲                                                         │
//!        └──── EnvelopeFilter ◄── poll() batch ◄───────────────────┘
//! ```
//!
//! The relay is at-least-once and may reorder or echo a sender's own
//! envelopes back; [`EnvelopeFilter`] makes consumption idempotent.

pub mod client;
pub mod envelope;
pub mod filter;
pub mod relay;

pub use client::{new_sender_id, EnvelopeClock, RelayClient};
pub use envelope::{ControlMessage, EnvelopeId, EnvelopeKind, SignalingEnvelope};
pub use filter::{Admission, EnvelopeFilter};
pub use relay::{MemoryRelay, SignalingRelay};
