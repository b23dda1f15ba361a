use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod cue;
pub mod queue;
pub mod wire;

pub use cue::Cue;
pub use queue::{reduce, ActionRefused, Queue};
pub use wire::{
    decode_inbound, encode_command, Command, FrameError, InboundFrame, ItemPatch,
    DEFAULT_MAX_FRAME_BYTES,
};

/// One appeal awaiting an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, rename = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageSummary>,
    #[serde(default, rename = "firstMessage", skip_serializing_if = "Option::is_none")]
    pub first_message: Option<MessageSummary>,
    #[serde(
        default,
        rename = "updatedAt",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "createdAt",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatRef>,
    /// Client-side guard against issuing two actions for the same appeal.
    /// Never sent or read over the wire; only a full snapshot clears it.
    #[serde(skip)]
    pub action_in_flight: bool,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl QueueItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_message: None,
            first_message: None,
            updated_at: None,
            created_at: None,
            chat: None,
            action_in_flight: false,
            extra: HashMap::new(),
        }
    }

    /// Timestamp used to rank items that carry a last message.
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.last_message
            .as_ref()
            .and_then(|message| message.created_at)
            .or(self.updated_at)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageSummary {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        rename = "createdAt",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Opaque link to the chat session behind an appeal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    id_from_value(&val).ok_or_else(|| serde::de::Error::custom("expected string or number for id"))
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(id_from_value(&val))
}

pub(crate) fn id_from_value(val: &Value) -> Option<String> {
    match val {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamps arrive as RFC 3339 strings or epoch milliseconds. Anything else
/// is treated as absent rather than failing the whole frame.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    })
}
