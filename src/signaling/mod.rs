//! Signaling wire protocol — JSON control messages for a training session.
//!
//! Both sides of a call exchange these over the session-scoped WebSocket.
//! Offers, answers and ICE candidates carry a negotiation round number
//! (`nid`) so late or reordered messages can be recognized and dropped.

pub mod transport;

use serde::{Deserialize, Serialize};

/// An ICE candidate as carried on the wire.
///
/// Field names match the browser's `RTCIceCandidateInit`, which is what the
/// web client on the other end of the session serializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A signaling control message.
///
/// `JOIN_SESSION`, `LEAVE_SESSION` and `RESYNC` only flow client→server;
/// the `SESSION_*` notifications only flow server→client. Everything else
/// can originate from either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    JoinSession,
    LeaveSession,
    Ping,
    Pong,
    Resync,
    Offer {
        sdp: String,
        nid: u64,
    },
    Answer {
        sdp: String,
        nid: u64,
    },
    IceCandidate {
        candidate: IceCandidateBlob,
        nid: u64,
    },
    RequestRenegotiation,
    /// Terminal notifications from the server. The session treats all four
    /// as end-of-call.
    SessionCompleted,
    SessionAborted,
    SessionNoShow,
    SessionFinished,
}

impl SignalMessage {
    /// True for the `SESSION_*` notifications that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SignalMessage::SessionCompleted
                | SignalMessage::SessionAborted
                | SignalMessage::SessionNoShow
                | SignalMessage::SessionFinished
        )
    }
}

/// Decode an incoming frame. Malformed payloads are dropped with a warning —
/// the channel carries best-effort control traffic, not state.
pub fn parse_message(text: &str) -> Option<SignalMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!("Dropping malformed signaling frame: {} ({})", text, e);
            None
        }
    }
}

/// Encode a message for the wire.
pub fn encode_message(msg: &SignalMessage) -> String {
    // SignalMessage contains nothing a Serializer can reject.
    serde_json::to_string(msg).expect("signal message serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalMessage::Offer {
            sdp: "v=0".into(),
            nid: 3,
        };
        let json = encode_message(&msg);
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "OFFER");
        assert_eq!(v["sdp"], "v=0");
        assert_eq!(v["nid"], 3);
    }

    #[test]
    fn test_unit_messages_round_trip() {
        for (msg, tag) in [
            (SignalMessage::JoinSession, "JOIN_SESSION"),
            (SignalMessage::LeaveSession, "LEAVE_SESSION"),
            (SignalMessage::Ping, "PING"),
            (SignalMessage::Pong, "PONG"),
            (SignalMessage::Resync, "RESYNC"),
            (SignalMessage::RequestRenegotiation, "REQUEST_RENEGOTIATION"),
            (SignalMessage::SessionNoShow, "SESSION_NO_SHOW"),
        ] {
            let json = encode_message(&msg);
            assert_eq!(json, format!("{{\"type\":\"{}\"}}", tag));
            assert_eq!(parse_message(&json), Some(msg));
        }
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let msg = SignalMessage::IceCandidate {
            candidate: IceCandidateBlob {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            nid: 1,
        };
        let json = encode_message(&msg);
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
        assert!(!json.contains("usernameFragment"));
        assert_eq!(parse_message(&json), Some(msg));
    }

    #[test]
    fn test_ice_candidate_optionals_may_be_absent() {
        let json = r#"{"type":"ICE_CANDIDATE","candidate":{"candidate":"candidate:x"},"nid":2}"#;
        match parse_message(json) {
            Some(SignalMessage::IceCandidate { candidate, nid }) => {
                assert_eq!(candidate.candidate, "candidate:x");
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(nid, 2);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_dropped() {
        assert_eq!(parse_message("not json"), None);
        assert_eq!(parse_message("{}"), None);
        assert_eq!(parse_message(r#"{"type":"SHRUG"}"#), None);
        // OFFER missing its round number is malformed, not nid=0.
        assert_eq!(parse_message(r#"{"type":"OFFER","sdp":"v=0"}"#), None);
    }

    #[test]
    fn test_terminal_notifications() {
        assert!(SignalMessage::SessionCompleted.is_terminal());
        assert!(SignalMessage::SessionAborted.is_terminal());
        assert!(SignalMessage::SessionFinished.is_terminal());
        assert!(!SignalMessage::Offer { sdp: String::new(), nid: 1 }.is_terminal());
        assert!(!SignalMessage::Ping.is_terminal());
    }
}
