use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use tern_agent_core::types::{Message, ThinkingLevel};

pub const CURRENT_SESSION_VERSION: u32 = 1;

fn session_entry_type() -> String {
    "session".to_string()
}

pub fn now_iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn millis_to_iso(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn iso_to_millis(value: &str) -> Option<i64> {
    if let Ok(v) = value.parse::<i64>() {
        return Some(v);
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn deserialize_timestamp_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| serde::de::Error::custom("invalid numeric timestamp"))?;
            Ok(millis_to_iso(ms))
        }
        Value::Null => Ok(now_iso_timestamp()),
        _ => Err(serde::de::Error::custom(
            "timestamp must be string or number",
        )),
    }
}

fn serialize_timestamp_string<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value)
}

/// Session file header — the first line of a .jsonl session file:
/// {"type":"session","version":1,"id":"...","timestamp":"...","cwd":"..."}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(rename = "type", default = "session_entry_type")]
    pub entry_type: String,

    #[serde(default)]
    pub version: Option<u32>,

    pub id: String,

    #[serde(
        default = "now_iso_timestamp",
        deserialize_with = "deserialize_timestamp_string",
        serialize_with = "serialize_timestamp_string"
    )]
    pub timestamp: String,

    #[serde(default)]
    pub cwd: String,

    #[serde(rename = "parentSession", skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    pub fn timestamp_ms(&self) -> i64 {
        iso_to_millis(&self.timestamp).unwrap_or_else(|| Utc::now().timestamp_millis())
    }
}

/// One line of a session file. Every entry carries `id`, `parentId` and a
/// `timestamp`; the `type` tag selects the variant. Entry types this version
/// does not know are preserved verbatim in `Unknown` and written back
/// unchanged on the next save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEntry {
    #[serde(rename = "message")]
    Message {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        message: Message,
    },

    #[serde(rename = "thinking_level_change")]
    ThinkingLevelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        #[serde(rename = "thinkingLevel")]
        thinking_level: ThinkingLevel,
    },

    #[serde(rename = "model_change")]
    ModelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },

    #[serde(rename = "compaction")]
    Compaction {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        summary: String,
        #[serde(rename = "firstKeptEntryId")]
        first_kept_entry_id: String,
        #[serde(rename = "tokensBefore", default)]
        tokens_before: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(rename = "fromHook", skip_serializing_if = "Option::is_none")]
        from_hook: Option<bool>,
    },

    #[serde(rename = "branch_summary")]
    BranchSummary {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        #[serde(rename = "fromId")]
        from_id: String,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(rename = "fromHook", skip_serializing_if = "Option::is_none")]
        from_hook: Option<bool>,
    },

    #[serde(rename = "custom")]
    Custom {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        #[serde(rename = "customType")]
        custom_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "custom_message")]
    CustomMessage {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        #[serde(rename = "customType")]
        custom_type: String,
        content: Value,
        display: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    #[serde(rename = "label")]
    Label {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        #[serde(rename = "targetId")]
        target_id: String,
        label: Option<String>,
    },

    #[serde(rename = "session_info")]
    SessionInfo {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        #[serde(
            default = "now_iso_timestamp",
            deserialize_with = "deserialize_timestamp_string",
            serialize_with = "serialize_timestamp_string"
        )]
        timestamp: String,
        name: Option<String>,
    },

    /// An entry type this version does not understand, preserved verbatim.
    #[serde(untagged)]
    Unknown(Value),
}

impl SessionEntry {
    pub fn id(&self) -> &str {
        match self {
            SessionEntry::Message { id, .. }
            | SessionEntry::ThinkingLevelChange { id, .. }
            | SessionEntry::ModelChange { id, .. }
            | SessionEntry::Compaction { id, .. }
            | SessionEntry::BranchSummary { id, .. }
            | SessionEntry::Custom { id, .. }
            | SessionEntry::CustomMessage { id, .. }
            | SessionEntry::Label { id, .. }
            | SessionEntry::SessionInfo { id, .. } => id,
            SessionEntry::Unknown(raw) => raw.get("id").and_then(|v| v.as_str()).unwrap_or(""),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::ThinkingLevelChange { parent_id, .. }
            | SessionEntry::ModelChange { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::Custom { parent_id, .. }
            | SessionEntry::CustomMessage { parent_id, .. }
            | SessionEntry::Label { parent_id, .. }
            | SessionEntry::SessionInfo { parent_id, .. } => parent_id.as_deref(),
            SessionEntry::Unknown(raw) => raw.get("parentId").and_then(|v| v.as_str()),
        }
    }

    pub(crate) fn set_parent_id(&mut self, new_parent: Option<String>) {
        match self {
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::ThinkingLevelChange { parent_id, .. }
            | SessionEntry::ModelChange { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::Custom { parent_id, .. }
            | SessionEntry::CustomMessage { parent_id, .. }
            | SessionEntry::Label { parent_id, .. }
            | SessionEntry::SessionInfo { parent_id, .. } => *parent_id = new_parent,
            SessionEntry::Unknown(_) => {}
        }
    }

    /// Timestamp in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            SessionEntry::Message { timestamp, .. }
            | SessionEntry::ThinkingLevelChange { timestamp, .. }
            | SessionEntry::ModelChange { timestamp, .. }
            | SessionEntry::Compaction { timestamp, .. }
            | SessionEntry::BranchSummary { timestamp, .. }
            | SessionEntry::Custom { timestamp, .. }
            | SessionEntry::CustomMessage { timestamp, .. }
            | SessionEntry::Label { timestamp, .. }
            | SessionEntry::SessionInfo { timestamp, .. } => {
                iso_to_millis(timestamp).unwrap_or_else(|| Utc::now().timestamp_millis())
            }
            SessionEntry::Unknown(raw) => raw
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(iso_to_millis)
                .unwrap_or(0),
        }
    }

    pub fn entry_type(&self) -> &'static str {
        match self {
            SessionEntry::Message { .. } => "message",
            SessionEntry::ThinkingLevelChange { .. } => "thinking_level_change",
            SessionEntry::ModelChange { .. } => "model_change",
            SessionEntry::Compaction { .. } => "compaction",
            SessionEntry::BranchSummary { .. } => "branch_summary",
            SessionEntry::Custom { .. } => "custom",
            SessionEntry::CustomMessage { .. } => "custom_message",
            SessionEntry::Label { .. } => "label",
            SessionEntry::SessionInfo { .. } => "session_info",
            SessionEntry::Unknown(_) => "unknown",
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            SessionEntry::Message { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the session-level branch operation may target this entry.
    pub fn is_user_message(&self) -> bool {
        matches!(
            self,
            SessionEntry::Message {
                message: Message::User(_),
                ..
            }
        )
    }

    /// New short unique entry id (8 hex chars).
    pub fn new_id() -> String {
        uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect()
    }
}

/// Lightweight session metadata for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub entry_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}
