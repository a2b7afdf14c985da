//! Signaling envelope wire types.
//!
//! One envelope is one row in the relay. The payload is kept as raw JSON and
//! decoded lazily per kind, so a single bad payload can be dropped without
//! failing the rest of a polled batch.

use serde::{Deserialize, Serialize};
use teleop_core::{IceCandidate, QualityLevel, SdpType, SessionDescription, SessionError};

// ── Kind ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    QualityRequest,
    ConnectionRequest,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::QualityRequest => "quality_request",
            Self::ConnectionRequest => "connection_request",
        };
        f.write_str(s)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Identity used for deduplication: `(kind, created_at, sender_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvelopeId {
    pub kind: EnvelopeKind,
    pub created_at: u64,
    pub sender_id: String,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub kind: EnvelopeKind,
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: String,
    #[serde(rename = "senderId", alias = "sender_id")]
    pub sender_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Microseconds since the Unix epoch, strictly increasing per sender.
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: u64,
    /// Relay-side cursor; consumers only ever set it to `true`.
    #[serde(default)]
    pub processed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct QualityPayload {
    level: QualityLevel,
}

impl SignalingEnvelope {
    pub fn new(
        kind: EnvelopeKind,
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
        created_at: u64,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            payload,
            created_at,
            processed: false,
        }
    }

    pub fn id(&self) -> EnvelopeId {
        EnvelopeId { kind: self.kind, created_at: self.created_at, sender_id: self.sender_id.clone() }
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
    }

    /// Decode an `Offer` / `Answer` payload; the SDP type must agree with the kind.
    pub fn description(&self) -> Result<SessionDescription, SessionError> {
        let expected = match self.kind {
            EnvelopeKind::Offer => SdpType::Offer,
            EnvelopeKind::Answer => SdpType::Answer,
            _ => return Err(self.malformed("not a session description")),
        };
        let desc: SessionDescription = self.decode()?;
        if desc.sdp_type != expected {
            return Err(self.malformed(format!("sdp type {:?} in {} envelope", desc.sdp_type, self.kind)));
        }
        if desc.sdp.trim().is_empty() {
            return Err(self.malformed("empty sdp"));
        }
        Ok(desc)
    }

    pub fn candidate(&self) -> Result<IceCandidate, SessionError> {
        if self.kind != EnvelopeKind::IceCandidate {
            return Err(self.malformed("not an ice candidate"));
        }
        self.decode()
    }

    pub fn quality(&self) -> Result<QualityLevel, SessionError> {
        if self.kind != EnvelopeKind::QualityRequest {
            return Err(self.malformed("not a quality request"));
        }
        self.decode::<QualityPayload>().map(|p| p.level)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, SessionError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| self.malformed(e.to_string()))
    }

    fn malformed(&self, reason: impl Into<String>) -> SessionError {
        SessionError::MalformedEnvelope { kind: self.kind.to_string(), reason: reason.into() }
    }
}

// ── Payload encoders ──────────────────────────────────────────────────────────

pub fn description_payload(desc: &SessionDescription) -> serde_json::Value {
    serde_json::json!({ "type": desc.sdp_type, "sdp": desc.sdp })
}

pub fn candidate_payload(candidate: &IceCandidate) -> serde_json::Value {
    let mut value = serde_json::json!({ "candidate": candidate.candidate });
    if let Some(mid) = &candidate.sdp_mid {
        value["sdpMid"] = serde_json::json!(mid);
    }
    if let Some(index) = candidate.sdp_m_line_index {
        value["sdpMLineIndex"] = serde_json::json!(index);
    }
    value
}

pub fn quality_payload(level: QualityLevel) -> serde_json::Value {
    serde_json::json!({ "level": level })
}

// ── Data-channel control messages ─────────────────────────────────────────────

/// Messages carried on the low-latency control data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    QualityRequest { level: QualityLevel },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        // A two-field enum with no maps cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(data).map_err(|e| SessionError::MalformedEnvelope {
            kind: "control".into(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: EnvelopeKind, payload: serde_json::Value) -> SignalingEnvelope {
        SignalingEnvelope::new(kind, "robot-1", "op-1", payload, 10)
    }

    #[test]
    fn offer_payload_decodes() {
        let desc = SessionDescription::offer("v=0\r\n");
        let env = envelope(EnvelopeKind::Offer, description_payload(&desc));
        assert_eq!(env.description().unwrap(), desc);
    }

    #[test]
    fn answer_in_offer_envelope_is_malformed() {
        let env = envelope(EnvelopeKind::Offer, description_payload(&SessionDescription::answer("v=0")));
        assert!(matches!(env.description(), Err(SessionError::MalformedEnvelope { .. })));
    }

    #[test]
    fn garbage_quality_is_malformed() {
        let env = envelope(EnvelopeKind::QualityRequest, serde_json::json!({ "level": "ultra" }));
        assert!(matches!(env.quality(), Err(SessionError::MalformedEnvelope { .. })));
        let ok = envelope(EnvelopeKind::QualityRequest, quality_payload(QualityLevel::High));
        assert_eq!(ok.quality().unwrap(), QualityLevel::High);
    }

    #[test]
    fn deserializes_relay_row() {
        let row = r#"{
            "kind": "ice_candidate",
            "sessionId": "robot-1",
            "senderId": "streamer-a",
            "payload": {"candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
            "createdAt": 1700000000000000,
            "processed": false
        }"#;
        let env: SignalingEnvelope = serde_json::from_str(row).expect("valid relay row");
        assert_eq!(env.kind, EnvelopeKind::IceCandidate);
        assert_eq!(env.candidate().unwrap().sdp_m_line_index, Some(0));
    }

    #[test]
    fn control_message_wire_format() {
        let msg = ControlMessage::QualityRequest { level: QualityLevel::Medium };
        let json = String::from_utf8(msg.to_bytes()).unwrap();
        assert_eq!(json, r#"{"type":"quality_request","level":"medium"}"#);
        assert_eq!(ControlMessage::from_bytes(json.as_bytes()).unwrap(), msg);
        assert!(ControlMessage::from_bytes(b"{}").is_err());
    }
}
