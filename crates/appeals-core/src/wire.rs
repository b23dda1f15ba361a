use crate::{id_from_value, ChatRef, MessageSummary, QueueItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Event tags shared with the appeals server.
pub mod tags {
    pub const PING: &str = "Ping";
    pub const PONG: &str = "Pong";
    pub const ALL_APPEALS: &str = "AllAppeals";
    pub const APPEAL_UPDATED: &str = "AppealUpdated";
    pub const APPEAL_REMOVED: &str = "AppealRemoved";
    pub const NEW_APPEAL: &str = "NewAppeal";
    pub const APPEALS_BROADCAST: &str = "AppealsBroadcast";
    pub const TAKE_APPEAL: &str = "TakeAppeal";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// A decoded inbound frame. Tags the client does not know decode to `Unknown`
/// so the server can add events without breaking older clients.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    LivenessReply,
    Snapshot(Vec<QueueItem>),
    ItemUpdated(ItemPatch),
    ItemRemoved { id: String },
    ItemInserted(QueueItem),
    BatchSnapshot,
    Unknown { event: String },
}

impl InboundFrame {
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::LivenessReply => tags::PONG,
            InboundFrame::Snapshot(_) => tags::ALL_APPEALS,
            InboundFrame::ItemUpdated(_) => tags::APPEAL_UPDATED,
            InboundFrame::ItemRemoved { .. } => tags::APPEAL_REMOVED,
            InboundFrame::ItemInserted(_) => tags::NEW_APPEAL,
            InboundFrame::BatchSnapshot => tags::APPEALS_BROADCAST,
            InboundFrame::Unknown { event } => event,
        }
    }
}

/// Partial update for an appeal already in the queue. Only present fields are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemPatch {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    #[serde(default, rename = "lastMessage")]
    pub last_message: Option<MessageSummary>,
    #[serde(default, rename = "firstMessage")]
    pub first_message: Option<MessageSummary>,
    #[serde(default, rename = "updatedAt", deserialize_with = "crate::deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chat: Option<ChatRef>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl ItemPatch {
    pub fn merge_into(self, item: &mut QueueItem) {
        if let Some(message) = self.last_message {
            item.last_message = Some(message);
        }
        if let Some(message) = self.first_message {
            item.first_message = Some(message);
        }
        if let Some(updated_at) = self.updated_at {
            item.updated_at = Some(updated_at);
        }
        if let Some(chat) = self.chat {
            item.chat = Some(chat);
        }
        item.extra.extend(self.extra);
    }
}

/// Outbound message: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Command {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn ping() -> Self {
        Self::new(tags::PING)
    }

    pub fn snapshot_request() -> Self {
        Self::new(tags::ALL_APPEALS)
    }

    /// Attach the target appeal and its chat reference to the payload.
    /// A non-object payload is kept under `value`.
    pub fn targeting(mut self, item: &QueueItem) -> Self {
        let mut data = match self.data.take() {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        data.insert("appealId".to_string(), Value::String(item.id.clone()));
        if let Some(chat) = &item.chat {
            if let Ok(chat) = serde_json::to_value(chat) {
                data.insert("chat".to_string(), chat);
            }
        }
        self.data = Some(Value::Object(data));
        self
    }
}

pub fn encode_command(command: &Command, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(command).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let RawFrame { event, data } = frame;
    let parsed = match event.as_str() {
        tags::PONG => InboundFrame::LivenessReply,
        tags::ALL_APPEALS => InboundFrame::Snapshot(parse_snapshot(&event, data)?),
        tags::APPEAL_UPDATED => InboundFrame::ItemUpdated(parse_payload(&event, data)?),
        tags::APPEAL_REMOVED => InboundFrame::ItemRemoved {
            id: parse_removed_id(&event, &data)?,
        },
        tags::NEW_APPEAL => InboundFrame::ItemInserted(parse_payload(&event, data)?),
        tags::APPEALS_BROADCAST => InboundFrame::BatchSnapshot,
        _ => InboundFrame::Unknown { event },
    };
    Ok(parsed)
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|err| invalid(event, err.to_string()))
}

fn parse_snapshot(event: &str, data: Value) -> Result<Vec<QueueItem>, FrameError> {
    let list = match data {
        Value::Array(_) => data,
        Value::Object(mut map) => map
            .remove("appeals")
            .ok_or_else(|| invalid(event, "missing appeals".to_string()))?,
        Value::Null => Value::Array(Vec::new()),
        _ => return Err(invalid(event, "expected list of appeals".to_string())),
    };
    parse_payload(event, list)
}

fn parse_removed_id(event: &str, data: &Value) -> Result<String, FrameError> {
    let id = match data {
        Value::Object(map) => map.get("id").and_then(id_from_value),
        other => id_from_value(other),
    };
    id.ok_or_else(|| invalid(event, "missing id".to_string()))
}

fn invalid(event: &str, reason: String) -> FrameError {
    FrameError::InvalidPayload {
        event: event.to_string(),
        reason,
    }
}
