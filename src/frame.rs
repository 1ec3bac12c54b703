use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `type` tag of a frame. Unrecognised tags are kept so they can be
/// relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FrameKind {
    Connected,
    Message,
    Session,
    Ping,
    Pong,
    Heartbeat,
    Other(String),
}

impl FrameKind {
    pub fn as_str(&self) -> &str {
        match self {
            FrameKind::Connected => "connected",
            FrameKind::Message => "message",
            FrameKind::Session => "session",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Other(other) => other,
        }
    }

    /// Keepalive and handshake frames that application code never sees.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameKind::Connected | FrameKind::Pong | FrameKind::Heartbeat
        )
    }
}

impl From<String> for FrameKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connected" => FrameKind::Connected,
            "message" => FrameKind::Message,
            "session" => FrameKind::Session,
            "ping" => FrameKind::Ping,
            "pong" => FrameKind::Pong,
            "heartbeat" => FrameKind::Heartbeat,
            _ => FrameKind::Other(value),
        }
    }
}

impl From<FrameKind> for String {
    fn from(value: FrameKind) -> Self {
        match value {
            FrameKind::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

/// One JSON frame on a hub channel: `{type, data?, timestamp?, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            data: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    pub fn with_data(kind: FrameKind, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(kind)
        }
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping)
    }

    pub fn connected() -> Self {
        let mut frame = Self::new(FrameKind::Connected).stamped();
        frame.extra.insert(
            "message".into(),
            Value::from("Connected to the broadcast hub"),
        );
        frame
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong).stamped()
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat).stamped()
    }

    /// Replace the timestamp with the current server time.
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(now_iso());
        self
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Identity of the event a frame carries (`data.id`), for dedup.
    pub fn event_id(&self) -> Option<&str> {
        self.data.as_ref()?.get("id")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_and_unknown_kinds() {
        let frame = Frame::parse(r#"{"type":"message","data":{"id":"m1"}}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.event_id(), Some("m1"));

        let frame = Frame::parse(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Other("typing".into()));
        assert_eq!(frame.event_id(), None);
    }

    #[test]
    fn unknown_fields_survive_a_relay() {
        let raw = json!({ "type": "session", "data": { "id": "s1" }, "origin": "webhook" });
        let frame: Frame = serde_json::from_value(raw).unwrap();
        let relayed: Value = serde_json::from_str(&frame.stamped().encode().unwrap()).unwrap();
        assert_eq!(relayed["type"], "session");
        assert_eq!(relayed["data"]["id"], "s1");
        assert_eq!(relayed["origin"], "webhook");
        assert!(relayed["timestamp"].is_string());
    }

    #[test]
    fn ping_has_no_timestamp_pong_does() {
        assert_eq!(Frame::ping().encode().unwrap(), r#"{"type":"ping"}"#);
        assert!(Frame::pong().timestamp.is_some());
    }

    #[test]
    fn protocol_kinds() {
        assert!(FrameKind::Heartbeat.is_protocol());
        assert!(FrameKind::Pong.is_protocol());
        assert!(FrameKind::Connected.is_protocol());
        assert!(!FrameKind::Message.is_protocol());
        assert!(!FrameKind::Ping.is_protocol());
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(Frame::parse(r#"{"data":1}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }
}
