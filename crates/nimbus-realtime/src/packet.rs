//! Engine.IO v4 packet codec and Socket.IO message framing.
//!
//! Engine.IO packets are a single type digit followed by the payload:
//! `0` OPEN (handshake JSON), `1` CLOSE, `2` PING, `3` PONG,
//! `4` MESSAGE. Socket.IO rides inside MESSAGE payloads with its own
//! leading digit: `0` CONNECT, `1` DISCONNECT, `2` EVENT (a JSON array
//! of event name and arguments), `4` CONNECT_ERROR.

use serde::Deserialize;
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine packet type '{0}'")]
    UnknownType(char),

    #[error("malformed handshake: {0}")]
    BadHandshake(String),

    #[error("malformed event: {0}")]
    BadEvent(String),
}

// ============================================================================
// Engine.IO layer
// ============================================================================

/// Handshake payload carried by the OPEN packet.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id assigned by the server.
    pub sid: String,
    /// How often to send pings, in milliseconds.
    pub ping_interval: u64,
    /// How long to wait for a pong, in milliseconds.
    pub ping_timeout: u64,
    /// Available transport upgrades (unused; we are already on
    /// websocket).
    #[serde(default)]
    pub upgrades: Vec<String>,
}

/// One Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Message(String),
}

impl EnginePacket {
    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = &frame[kind.len_utf8()..];

        match kind {
            '0' => {
                let handshake: Handshake = serde_json::from_str(rest)
                    .map_err(|e| PacketError::BadHandshake(e.to_string()))?;
                Ok(EnginePacket::Open(handshake))
            }
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    /// Encode to a text frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            // OPEN is only ever received; encoding it is for tests.
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(payload) => format!("4{payload}"),
        }
    }
}

// ============================================================================
// Socket.IO layer
// ============================================================================

/// A Socket.IO message extracted from an Engine.IO MESSAGE payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    /// Namespace connection acknowledged.
    Connect,
    /// Namespace disconnected.
    Disconnect,
    /// An event: name plus raw JSON arguments.
    Event { name: String, payload: String },
    /// Connection refused by the server.
    ConnectError(String),
}

impl SocketMessage {
    /// Parse the payload of an Engine.IO MESSAGE.
    pub fn parse(payload: &str) -> Result<Self, PacketError> {
        let mut chars = payload.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = &payload[kind.len_utf8()..];

        match kind {
            '0' => Ok(SocketMessage::Connect),
            '1' => Ok(SocketMessage::Disconnect),
            '2' => Self::parse_event(rest),
            '4' => Ok(SocketMessage::ConnectError(rest.to_string())),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    /// The frame sent to join the default namespace.
    #[must_use]
    pub fn connect_frame() -> String {
        // Engine.IO MESSAGE + Socket.IO CONNECT.
        "40".to_string()
    }

    fn parse_event(rest: &str) -> Result<Self, PacketError> {
        // An optional ack id (digits) may precede the JSON array.
        let json_start = rest
            .find('[')
            .ok_or_else(|| PacketError::BadEvent(format!("no array in '{rest}'")))?;
        let array: serde_json::Value = serde_json::from_str(&rest[json_start..])
            .map_err(|e| PacketError::BadEvent(e.to_string()))?;

        let items = array
            .as_array()
            .ok_or_else(|| PacketError::BadEvent("event payload is not an array".to_string()))?;
        let name = items
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| PacketError::BadEvent("event name missing".to_string()))?
            .to_string();
        let payload = serde_json::to_string(&items[1..]).unwrap_or_else(|_| "[]".to_string());

        Ok(SocketMessage::Event { name, payload })
    }
}

// ============================================================================
// Endpoint normalization
// ============================================================================

/// Normalize a notification endpoint for the websocket dial: scheme
/// forced to `wss`, path to `/socket.io/`, query augmented with
/// `EIO=4&transport=websocket` while preserving existing parameters.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, PacketError> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| PacketError::BadHandshake(format!("endpoint '{endpoint}': {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        _ => "wss",
    };
    // set_scheme refuses some cross-scheme changes; rebuild instead.
    let mut normalized = url::Url::parse(&format!(
        "{scheme}://{}{}",
        url.host_str().unwrap_or_default(),
        url.port()
            .map(|p| format!(":{p}"))
            .unwrap_or_default()
    ))
    .map_err(|e| PacketError::BadHandshake(e.to_string()))?;
    normalized.set_path("/socket.io/");

    {
        let mut query = normalized.query_pairs_mut();
        for (key, value) in url.query_pairs() {
            if key != "EIO" && key != "transport" {
                query.append_pair(&key, &value);
            }
        }
        query.append_pair("EIO", "4");
        query.append_pair("transport", "websocket");
    }
    url = normalized;
    Ok(url.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_open_handshake() {
        let frame = r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":20000,"upgrades":[]}"#;
        let packet = EnginePacket::decode(frame).unwrap();
        match packet {
            EnginePacket::Open(h) => {
                assert_eq!(h.sid, "abc");
                assert_eq!(h.ping_interval, 25000);
                assert_eq!(h.ping_timeout, 20000);
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_packets() {
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping);
        assert_eq!(EnginePacket::decode("3").unwrap(), EnginePacket::Pong);
    }

    #[test]
    fn test_decode_message_keeps_payload() {
        assert_eq!(
            EnginePacket::decode("42[\"notification\",{}]").unwrap(),
            EnginePacket::Message("2[\"notification\",{}]".to_string())
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(EnginePacket::decode("").unwrap_err(), PacketError::Empty);
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(PacketError::UnknownType('9'))
        ));
        assert!(matches!(
            EnginePacket::decode("0not-json"),
            Err(PacketError::BadHandshake(_))
        ));
    }

    #[test]
    fn test_encode_roundtrip() {
        assert_eq!(EnginePacket::Ping.encode(), "2");
        assert_eq!(EnginePacket::Pong.encode(), "3");
        assert_eq!(
            EnginePacket::Message("2[\"x\"]".to_string()).encode(),
            "42[\"x\"]"
        );
    }

    #[test]
    fn test_socket_connect_and_event() {
        assert_eq!(SocketMessage::parse("0").unwrap(), SocketMessage::Connect);
        assert_eq!(SocketMessage::connect_frame(), "40");

        let msg = SocketMessage::parse("2[\"notification\",{\"receivedAt\":1}]").unwrap();
        match msg {
            SocketMessage::Event { name, payload } => {
                assert_eq!(name, "notification");
                assert!(payload.contains("receivedAt"));
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn test_socket_event_with_ack_id() {
        let msg = SocketMessage::parse("213[\"notification\",{}]").unwrap();
        assert!(matches!(msg, SocketMessage::Event { name, .. } if name == "notification"));
    }

    #[test]
    fn test_socket_event_errors() {
        assert!(matches!(
            SocketMessage::parse("2notanarray"),
            Err(PacketError::BadEvent(_))
        ));
        assert!(matches!(
            SocketMessage::parse("2[42]"),
            Err(PacketError::BadEvent(_))
        ));
    }

    #[test]
    fn test_normalize_endpoint_forces_wss_and_path() {
        let normalized =
            normalize_endpoint("https://pushchannel.1drv.ms/abc?tag=xyz").unwrap();
        let url = url::Url::parse(&normalized).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/socket.io/");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("tag".to_string(), "xyz".to_string())));
        assert!(pairs.contains(&("EIO".to_string(), "4".to_string())));
        assert!(pairs.contains(&("transport".to_string(), "websocket".to_string())));
    }

    #[test]
    fn test_normalize_endpoint_keeps_plain_ws_for_tests() {
        let normalized = normalize_endpoint("http://127.0.0.1:9001/x").unwrap();
        assert!(normalized.starts_with("ws://127.0.0.1:9001/socket.io/"));
    }

    #[test]
    fn test_normalize_endpoint_rejects_garbage() {
        assert!(normalize_endpoint("not a url").is_err());
    }
}
