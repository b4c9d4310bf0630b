use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod stream_protocol;

pub const AGENT_ID_SEPARATOR: &str = "::";

/// One of the three independently synchronized collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Agents,
    Channels,
    Messages,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Agents, Resource::Channels, Resource::Messages];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Agents => "agents",
            Resource::Channels => "channels",
            Resource::Messages => "messages",
        }
    }

    /// Position in [`Resource::ALL`]; used for fixed-size per-resource tables.
    pub fn index(self) -> usize {
        match self {
            Resource::Agents => 0,
            Resource::Channels => 1,
            Resource::Messages => 2,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "agents" | "agent" => Ok(Resource::Agents),
            "channels" | "channel" => Ok(Resource::Channels),
            "messages" | "message" => Ok(Resource::Messages),
            other => Err(format!("Unknown resource: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record decode failed: {0}")]
    Decode(String),
    #[error("record has no id")]
    MissingId,
}

/// A record mirrored in one of the synchronized collections.
pub trait SyncRecord:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const RESOURCE: Resource;

    fn record_id(&self) -> Cow<'_, str>;
}

/// Decode a raw payload row into a typed record, rejecting rows without a key.
pub fn parse_record<T: SyncRecord>(value: Value) -> Result<T, RecordError> {
    let record: T =
        serde_json::from_value(value).map_err(|err| RecordError::Decode(err.to_string()))?;
    if record.record_id().trim().is_empty() {
        return Err(RecordError::MissingId);
    }
    Ok(record)
}

pub fn compose_agent_id(machine: &str, project: &str, session: &str) -> String {
    format!("{machine}{AGENT_ID_SEPARATOR}{project}{AGENT_ID_SEPARATOR}{session}")
}

/// Split a hierarchical agent id into `(machine, project, session)`.
pub fn split_agent_id(id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = id.splitn(3, AGENT_ID_SEPARATOR);
    let machine = parts.next()?;
    let project = parts.next()?;
    let session = parts.next()?;
    Some((machine, project, session))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat age limits for deriving [`AgentStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    pub active_within: Duration,
    pub idle_within: Duration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            active_within: Duration::seconds(60),
            idle_within: Duration::seconds(300),
        }
    }
}

impl StatusThresholds {
    pub fn classify(&self, age: Option<Duration>) -> AgentStatus {
        match age {
            Some(age) if age <= self.active_within => AgentStatus::Active,
            Some(age) if age <= self.idle_within => AgentStatus::Idle,
            _ => AgentStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub session: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl AgentRecord {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat
            .map(|at| now.signed_duration_since(at).max(Duration::zero()))
    }

    pub fn status_at(&self, now: DateTime<Utc>, thresholds: &StatusThresholds) -> AgentStatus {
        thresholds.classify(self.heartbeat_age(now))
    }
}

impl SyncRecord for AgentRecord {
    const RESOURCE: Resource = Resource::Agents;

    fn record_id(&self) -> Cow<'_, str> {
        if !self.id.is_empty() {
            return Cow::Borrowed(&self.id);
        }
        if self.machine.is_empty() && self.project.is_empty() && self.session.is_empty() {
            return Cow::Borrowed("");
        }
        Cow::Owned(compose_agent_id(&self.machine, &self.project, &self.session))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    Project,
    Direct,
    Broadcast,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Project => "project",
            ChannelType::Direct => "direct",
            ChannelType::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl SyncRecord for ChannelRecord {
    const RESOURCE: Resource = Resource::Channels;

    fn record_id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }
}

/// Message kind. Unknown kinds are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    #[default]
    Chat,
    Mail,
    Memo,
    Paste,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Mail => "mail",
            MessageType::Memo => "memo",
            MessageType::Paste => "paste",
            MessageType::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "chat" => MessageType::Chat,
            "mail" => MessageType::Mail,
            "memo" => MessageType::Memo,
            "paste" => MessageType::Paste,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_id")]
    pub channel_id: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl SyncRecord for MessageRecord {
    const RESOURCE: Resource = Resource::Messages;

    fn record_id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Accepts RFC3339 strings or epoch milliseconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|err| serde::de::Error::custom(format!("invalid timestamp '{s}': {err}"))),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {millis}")))
        }
        _ => Err(serde::de::Error::custom(
            "expected RFC3339 string or epoch milliseconds",
        )),
    }
}
