//! Wire format for push subscriptions: NDJSON-framed [`StreamEnvelope`]s.

use crate::Resource;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(self) -> bool {
        self.0 <= CURRENT_PROTOCOL_VERSION
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let unsigned = u64::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version cannot be negative: {value}")))?;
                self.visit_u64(unsigned)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .trim_start_matches('v')
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// One event on a resource stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub resource: Resource,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_event_id"
    )]
    pub event_id: Option<String>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl StreamEnvelope {
    pub fn new(resource: Resource, event: StreamEvent) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            resource,
            event_id: None,
            event,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Discriminated event body. Payloads stay untyped here; the collection
/// that owns the resource decides how to read them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Upsert(Value),
    Delete(DeleteTarget),
    Snapshot(Vec<Value>),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Upsert(_) => "upsert",
            StreamEvent::Delete(_) => "delete",
            StreamEvent::Snapshot(_) => "snapshot",
        }
    }
}

/// Delete payload: a bare id (string or number) or an object carrying `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeleteTarget {
    pub id: String,
}

impl DeleteTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl<'de> Deserialize<'de> for DeleteTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let id = match &raw {
            Value::Object(map) => map.get("id").and_then(id_from_value),
            other => id_from_value(other),
        };
        match id {
            Some(id) if !id.is_empty() => Ok(DeleteTarget { id }),
            _ => Err(de::Error::custom("delete payload carries no id")),
        }
    }
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_event_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => id_from_value(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected string or number for eventId")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }

    fn merge(&mut self, other: DecodeReport<T>) {
        self.frames.extend(other.frames);
        self.errors.extend(other.errors);
    }
}

fn trim_line_ending(mut raw: &[u8]) -> &[u8] {
    if let Some(stripped) = raw.strip_suffix(b"\n") {
        raw = stripped;
    }
    if let Some(stripped) = raw.strip_suffix(b"\r") {
        raw = stripped;
    }
    raw
}

/// Incremental newline-delimited JSON decoder. A bad line is reported and
/// skipped; decoding continues with the next line.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_idx).collect();
            self.decode_line(trim_line_ending(&line), &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decode whatever is left without waiting for a trailing newline.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(trim_line_ending(&rest), &mut report);
        report
    }

    /// Decode one self-contained message (a WebSocket text frame, an HTTP
    /// body) that may or may not end with a newline.
    pub fn decode_message(&mut self, message: &[u8]) -> DecodeReport<T> {
        let mut report = self.push_chunk(message);
        report.merge(self.finish());
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_upsert(id: &str) -> StreamEnvelope {
        StreamEnvelope::new(
            Resource::Messages,
            StreamEvent::Upsert(json!({
                "id": id,
                "channelId": "c1",
                "messageType": "chat",
                "sender": "agent-a",
                "content": "hello"
            })),
        )
        .with_event_id(format!("evt-{id}"))
    }

    fn frame(envelope: &StreamEnvelope) -> Vec<u8> {
        let mut line = serde_json::to_vec(envelope).expect("encode");
        line.push(b'\n');
        line
    }

    #[test]
    fn envelope_wire_shape_is_flat() {
        let encoded = serde_json::to_value(message_upsert("m1")).expect("encode");
        assert_eq!(encoded["type"], json!("upsert"));
        assert_eq!(encoded["resource"], json!("messages"));
        assert_eq!(encoded["eventId"], json!("evt-m1"));
        assert_eq!(encoded["version"], json!(1));
        assert_eq!(encoded["payload"]["id"], json!("m1"));
    }

    #[test]
    fn delete_payload_accepts_bare_and_object_ids() {
        let bare: StreamEnvelope = serde_json::from_str(
            r#"{"resource":"channels","type":"delete","payload":"c9","eventId":17}"#,
        )
        .expect("bare id");
        assert_eq!(bare.event, StreamEvent::Delete(DeleteTarget::new("c9")));
        assert_eq!(bare.event_id.as_deref(), Some("17"));

        let object: StreamEnvelope =
            serde_json::from_str(r#"{"resource":"agents","type":"delete","payload":{"id":42}}"#)
                .expect("object id");
        assert_eq!(object.event, StreamEvent::Delete(DeleteTarget::new("42")));

        let empty = serde_json::from_str::<StreamEnvelope>(
            r#"{"resource":"agents","type":"delete","payload":{}}"#,
        );
        assert!(empty.is_err());
    }

    #[test]
    fn decoder_recovers_after_malformed_json_line() {
        let valid_a = frame(&message_upsert("m1"));
        let valid_b = frame(&message_upsert("m2"));

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&valid_a);
        chunk.extend_from_slice(b"{\"resource\":\"messages\",\"type\":\n");
        chunk.extend_from_slice(&valid_b);

        let mut decoder = NdjsonFrameDecoder::<StreamEnvelope>::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_joins_frames_split_across_chunks() {
        let frame = frame(&message_upsert("m1"));
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = NdjsonFrameDecoder::<StreamEnvelope>::default();
        assert!(decoder.push_chunk(head).is_empty());
        assert!(decoder.has_pending());
        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames, vec![message_upsert("m1")]);
        assert!(!decoder.has_pending());
    }

    #[test]
    fn decode_message_accepts_missing_trailing_newline() {
        let text = serde_json::to_string(&message_upsert("m3")).expect("encode");
        let mut decoder = NdjsonFrameDecoder::<StreamEnvelope>::default();
        let report = decoder.decode_message(text.as_bytes());
        assert_eq!(report.frames.len(), 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn decoder_rejects_oversized_line_and_continues() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let valid = frame(&message_upsert("m1"));

        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(&valid);

        let mut decoder = NdjsonFrameDecoder::<StreamEnvelope>::new(1_024);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        let parse = |raw: &str| -> ProtocolVersion {
            serde_json::from_str::<StreamEnvelope>(raw)
                .expect("parse envelope")
                .version
        };
        assert_eq!(
            parse(r#"{"version":"v2","resource":"agents","type":"snapshot","payload":[]}"#),
            ProtocolVersion(2)
        );
        assert_eq!(
            parse(r#"{"version":1,"resource":"agents","type":"snapshot","payload":[]}"#),
            ProtocolVersion(1)
        );
        assert_eq!(
            parse(r#"{"resource":"agents","type":"snapshot","payload":[]}"#),
            ProtocolVersion::CURRENT
        );
        assert!(!ProtocolVersion(2).is_supported());
    }
}
