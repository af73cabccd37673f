//! Wire schema for call signaling between endpoints and the relay.
//! Kept in its own crate so the relay and the endpoint core agree on
//! frame shapes without pulling in each other's runtime code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, network-wide unique user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer, in the `{type, sdp}` shape browsers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// True when the description carries a video media section.
    pub fn has_video(&self) -> bool {
        self.sdp
            .lines()
            .any(|line| line.trim_start().starts_with("m=video"))
    }
}

/// Network candidate in candidate-init form, plus the resolved address when
/// the local stack reports one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
            address: None,
        }
    }

    /// Connection address: the explicit `address` field, else the fifth
    /// token of the `candidate:` attribute.
    pub fn connection_address(&self) -> Option<&str> {
        if let Some(address) = self.address.as_deref().filter(|a| !a.is_empty()) {
            return Some(address);
        }
        self.candidate
            .trim_start_matches("a=")
            .split_whitespace()
            .nth(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Decline,
    /// The callee is already in a call.
    Busy,
    /// The caller gave up waiting for an answer.
    Timeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EndReason::Hangup => "hangup",
            EndReason::Decline => "decline",
            EndReason::Busy => "busy",
            EndReason::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Routable message kinds. The relay only reads `type` and `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Ring,
    Answer,
    Ice,
    End,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Ring => "ring",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::End => "end",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from an endpoint to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ring {
        to: EndpointId,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        /// Echoed back in the routing acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Answer {
        to: EndpointId,
        answer: SessionDescription,
    },
    Ice {
        to: EndpointId,
        candidate: IceCandidate,
    },
    End {
        to: EndpointId,
        reason: EndReason,
    },
    /// Heartbeat to keep the connection registered
    Ping,
}

/// Messages sent from the relay to an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity the relay registered for this connection
    Welcome {
        endpoint: EndpointId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Ring {
        from: EndpointId,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
    },
    Answer {
        from: EndpointId,
        answer: SessionDescription,
    },
    Ice {
        from: EndpointId,
        candidate: IceCandidate,
    },
    End {
        from: EndpointId,
        reason: EndReason,
    },
    /// Outcome of routing a `ring`, not of the callee's decision
    RingAck {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A non-ring message could not be routed
    Undelivered { kind: SignalKind, to: EndpointId },
    Pong,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn ring_uses_type_tag_and_skips_absent_fields() {
        let msg = ClientMessage::Ring {
            to: EndpointId::new("bob"),
            offer: SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
            from_name: None,
            request_id: Some(7),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ring");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["offer"]["type"], "offer");
        assert_eq!(value["request_id"], 7);
        assert!(value.get("from_name").is_none());
    }

    #[test_timeout::timeout]
    fn parses_browser_candidate_shape() {
        let value = json!({
            "type": "ice",
            "from": "alice",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        });
        let msg: ServerMessage = serde_json::from_value(value).unwrap();
        match msg {
            ServerMessage::Ice { from, candidate } => {
                assert_eq!(from.as_str(), "alice");
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.connection_address(), Some("192.168.1.20"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn explicit_address_wins_over_candidate_attribute() {
        let mut candidate =
            IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host");
        candidate.address = Some("fe80::1".into());
        assert_eq!(candidate.connection_address(), Some("fe80::1"));
        candidate.address = Some(String::new());
        assert_eq!(candidate.connection_address(), Some("10.0.0.5"));
    }

    #[test_timeout::timeout]
    fn detects_video_section() {
        let audio = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        let video = SessionDescription::offer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        assert!(!audio.has_video());
        assert!(video.has_video());
    }

    #[test_timeout::timeout]
    fn end_reasons_are_lowercase_on_the_wire() {
        let msg = ServerMessage::End {
            from: "bob".into(),
            reason: EndReason::Busy,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"type":"end","from":"bob","reason":"busy"}"#);
    }
}
