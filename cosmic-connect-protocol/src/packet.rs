//! COSMIC Connect Network Packet
//!
//! This module implements the core packet structure for the COSMIC Connect
//! protocol. Packets are JSON-formatted messages with a newline terminator:
//!
//! ```json
//! {"id":1234567890,"type":"kdeconnect.ping","body":{"message":"hello"}}
//! ```
//!
//! A packet may additionally advertise a binary payload through the
//! `payloadSize` and `payloadTransferInfo` fields; the payload bytes
//! themselves travel on a separate encrypted side-channel (see the
//! `payload` module).

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default hard cap on a single frame, in bytes
///
/// Frames longer than this are rejected with `FrameTooLarge`, never
/// silently truncated.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Canonical packet-type prefix emitted on the wire
pub const TYPE_PREFIX: &str = "kdeconnect.";

/// Alternate packet-type prefix accepted for compatibility
pub const ALT_TYPE_PREFIX: &str = "cosmicconnect.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default = "empty_body")]
    pub body: Value,

    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Packet {
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Encode to the wire frame: one JSON object followed by `\n`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode a frame with the default length cap
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(data, DEFAULT_MAX_FRAME_LEN)
    }

    /// Decode a frame, enforcing a caller-supplied length cap
    pub fn from_bytes_with_limit(data: &[u8], max_frame_len: usize) -> Result<Self> {
        if data.len() > max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                actual: data.len(),
                max: max_frame_len,
            });
        }

        let trimmed = trim_frame(data);
        if trimmed.is_empty() {
            return Err(ProtocolError::MalformedFrame("empty frame".to_string()));
        }

        let packet: Packet = serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::MalformedFrame(format!("not a packet object: {}", e)))?;
        packet.validate()?;
        Ok(packet)
    }

    /// Check the structural invariants of a packet
    ///
    /// - `type` is non-empty
    /// - `body` is a JSON object
    /// - `payloadSize`, when present, is positive and accompanied by a
    ///   `payloadTransferInfo` object; absent otherwise
    pub fn validate(&self) -> Result<()> {
        if self.packet_type.trim().is_empty() {
            return Err(ProtocolError::InvalidType("empty type field".to_string()));
        }

        if !self.body.is_object() {
            return Err(ProtocolError::InvalidPacket(
                "body must be a JSON object".to_string(),
            ));
        }

        match (self.payload_size, &self.payload_transfer_info) {
            (Some(size), Some(_)) if size > 0 => Ok(()),
            (Some(size), _) if size <= 0 => Err(ProtocolError::InvalidPacket(format!(
                "payloadSize must be positive, got {}",
                size
            ))),
            (Some(_), None) => Err(ProtocolError::InvalidPacket(
                "payloadSize without payloadTransferInfo".to_string(),
            )),
            (None, Some(_)) => Err(ProtocolError::InvalidPacket(
                "payloadTransferInfo without payloadSize".to_string(),
            )),
            (None, None) => Ok(()),
            (Some(_), Some(_)) => unreachable!("covered by size > 0 / size <= 0 arms above"),
        }
    }

    /// Whether this packet declares a side-channel payload
    pub fn has_payload(&self) -> bool {
        self.payload_size.is_some()
    }

    pub fn with_payload(mut self, size: i64, info: HashMap<String, Value>) -> Self {
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(info);
        self
    }

    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check the packet type, accepting either namespace prefix
    ///
    /// `kdeconnect.*` and `cosmicconnect.*` name the same packet kinds;
    /// the canonical emitted form is `kdeconnect.*`.
    pub fn is_type(&self, packet_type: &str) -> bool {
        if self.packet_type == packet_type {
            return true;
        }

        if let Some(suffix) = packet_type.strip_prefix(TYPE_PREFIX) {
            return self.packet_type.strip_prefix(ALT_TYPE_PREFIX) == Some(suffix);
        }
        if let Some(suffix) = packet_type.strip_prefix(ALT_TYPE_PREFIX) {
            return self.packet_type.strip_prefix(TYPE_PREFIX) == Some(suffix);
        }

        false
    }

    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Port advertised in `payloadTransferInfo`, if any
    pub fn payload_transfer_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
    }
}

/// Strip leading/trailing NULs and whitespace from a raw frame
fn trim_frame(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|&b| b != 0 && !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &data[start..end]
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Packet ids are epoch milliseconds, unique enough within a session
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::with_id(12345, "kdeconnect.ping", json!({"message": "hello"}));
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(*bytes.last().unwrap(), b'\n');

        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);

        // Round-trip is stable: re-encoding and decoding again yields an
        // equal packet.
        let bytes2 = decoded.to_bytes().unwrap();
        let decoded2 = Packet::from_bytes(&bytes2).unwrap();
        assert_eq!(decoded2, packet);
    }

    #[test]
    fn test_empty_type_rejected() {
        let packet = Packet::with_id(1, "", json!({}));
        assert!(matches!(
            packet.to_bytes(),
            Err(ProtocolError::InvalidType(_))
        ));

        let raw = br#"{"id":1,"type":"","body":{}}"#;
        assert!(matches!(
            Packet::from_bytes(raw),
            Err(ProtocolError::InvalidType(_))
        ));
    }

    #[test]
    fn test_missing_body_defaults_to_empty_object() {
        let raw = br#"{"id":5,"type":"kdeconnect.ping"}"#;
        let packet = Packet::from_bytes(raw).unwrap();
        assert!(packet.body.is_object());
        assert_eq!(packet.body.as_object().unwrap().len(), 0);
    }

    #[test]
    fn test_payload_fields_must_agree() {
        let raw = br#"{"id":1,"type":"kdeconnect.share.request","body":{},"payloadSize":10}"#;
        assert!(matches!(
            Packet::from_bytes(raw),
            Err(ProtocolError::InvalidPacket(_))
        ));

        let raw = br#"{"id":1,"type":"kdeconnect.share.request","body":{},"payloadSize":-3,"payloadTransferInfo":{"port":1739}}"#;
        assert!(matches!(
            Packet::from_bytes(raw),
            Err(ProtocolError::InvalidPacket(_))
        ));

        let raw = br#"{"id":1,"type":"kdeconnect.share.request","body":{},"payloadSize":10,"payloadTransferInfo":{"port":1739}}"#;
        let packet = Packet::from_bytes(raw).unwrap();
        assert!(packet.has_payload());
        assert_eq!(packet.payload_transfer_port(), Some(1739));
    }

    #[test]
    fn test_frame_length_cap() {
        let packet = Packet::with_id(1, "kdeconnect.ping", json!({"m": "x".repeat(64)}));
        let bytes = packet.to_bytes().unwrap();

        let err = Packet::from_bytes_with_limit(&bytes, 32).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(
            Packet::from_bytes(b"{not json}\n"),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            Packet::from_bytes(b"\n"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_string_id_accepted() {
        let raw = br#"{"id":"789","type":"kdeconnect.ping","body":{}}"#;
        let packet = Packet::from_bytes(raw).unwrap();
        assert_eq!(packet.id, 789);
    }

    #[test]
    fn test_type_prefix_equivalence() {
        let packet = Packet::new("cosmicconnect.ping", json!({}));
        assert!(packet.is_type("kdeconnect.ping"));
        assert!(packet.is_type("cosmicconnect.ping"));
        assert!(!packet.is_type("kdeconnect.battery"));
    }

    #[test]
    fn test_body_field_access() {
        let packet = Packet::new("kdeconnect.ping", json!({"message": "hello", "count": 3}));
        assert_eq!(
            packet.get_body_field::<String>("message"),
            Some("hello".to_string())
        );
        assert_eq!(packet.get_body_field::<u32>("count"), Some(3));
        assert_eq!(packet.get_body_field::<String>("missing"), None);
    }
}
