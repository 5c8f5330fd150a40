use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ---------- ThinkingLevel ----------

/// Reasoning-effort knob. `Off` disables reasoning entirely; `Xhigh` is only
/// valid for models that advertise it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub const ALL: [ThinkingLevel; 6] = [
        ThinkingLevel::Off,
        ThinkingLevel::Minimal,
        ThinkingLevel::Low,
        ThinkingLevel::Medium,
        ThinkingLevel::High,
        ThinkingLevel::Xhigh,
    ];

    /// Clamp to what the model supports: no reasoning forces `Off`,
    /// `Xhigh` falls back to `High` unless advertised.
    pub fn clamp_for(self, model: &Model) -> ThinkingLevel {
        if !model.reasoning {
            return ThinkingLevel::Off;
        }
        if self == ThinkingLevel::Xhigh && !model.xhigh {
            return ThinkingLevel::High;
        }
        self
    }

    pub fn parse(s: &str) -> Option<ThinkingLevel> {
        match s {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::Xhigh),
            _ => None,
        }
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThinkingLevel::Off => write!(f, "off"),
            ThinkingLevel::Minimal => write!(f, "minimal"),
            ThinkingLevel::Low => write!(f, "low"),
            ThinkingLevel::Medium => write!(f, "medium"),
            ThinkingLevel::High => write!(f, "high"),
            ThinkingLevel::Xhigh => write!(f, "xhigh"),
        }
    }
}

// ---------- Content blocks ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    Image(ImageContent),
    ToolCall(ToolCall),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextContent { text: text.into() })
    }

    pub fn as_text(&self) -> Option<&TextContent> {
        match self {
            ContentBlock::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            ContentBlock::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            ContentBlock::Text(t) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", &t.text)?;
                map.end()
            }
            ContentBlock::Thinking(t) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "thinking")?;
                map.serialize_entry("thinking", &t.thinking)?;
                if let Some(sig) = &t.signature {
                    map.serialize_entry("signature", sig)?;
                }
                map.end()
            }
            ContentBlock::Image(i) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "image")?;
                map.serialize_entry("data", &i.data)?;
                map.serialize_entry("mimeType", &i.mime_type)?;
                map.end()
            }
            ContentBlock::ToolCall(tc) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "toolCall")?;
                map.serialize_entry("id", &tc.id)?;
                map.serialize_entry("name", &tc.name)?;
                map.serialize_entry("arguments", &tc.arguments)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("expected object"))?;
        let block_type = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'type' field"))?;

        match block_type {
            "text" => Ok(ContentBlock::Text(TextContent {
                text: obj
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })),
            "thinking" => Ok(ContentBlock::Thinking(ThinkingContent {
                thinking: obj
                    .get("thinking")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                signature: obj
                    .get("signature")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })),
            "image" => Ok(ContentBlock::Image(ImageContent {
                data: obj
                    .get("data")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                mime_type: obj
                    .get("mimeType")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })),
            "toolCall" => Ok(ContentBlock::ToolCall(ToolCall {
                id: obj
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                name: obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                arguments: obj
                    .get("arguments")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default())),
            })),
            other => Err(serde::de::Error::custom(format!(
                "unknown content type: {other}"
            ))),
        }
    }
}

// ---------- Usage ----------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

// ---------- StopReason ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Complete,
    MaxTokens,
    ToolCalls,
    Aborted,
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Complete => write!(f, "complete"),
            StopReason::MaxTokens => write!(f, "max-tokens"),
            StopReason::ToolCalls => write!(f, "tool-calls"),
            StopReason::Aborted => write!(f, "aborted"),
            StopReason::Error => write!(f, "error"),
        }
    }
}

// ---------- UserContent ----------

#[derive(Debug, Clone)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    /// Flatten to plain text (text blocks joined by newlines).
    pub fn as_plain_text(&self) -> String {
        match self {
            UserContent::Text(s) => s.clone(),
            UserContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text().map(|t| t.text.clone()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl Serialize for UserContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UserContent::Text(s) => serializer.serialize_str(s),
            UserContent::Blocks(blocks) => blocks.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for UserContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(UserContent::Text(s)),
            Value::Array(_) => {
                let blocks: Vec<ContentBlock> =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(UserContent::Blocks(blocks))
            }
            _ => Err(serde::de::Error::custom("expected string or array")),
        }
    }
}

// ---------- Messages ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    pub fn empty(model: &Model) -> Self {
        Self {
            content: Vec::new(),
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Complete,
            error_message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content.iter().filter_map(|b| b.as_tool_call()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub is_error: bool,
    pub timestamp: i64,
}

/// An LLM-visible message, tagged by "role" on the wire.
#[derive(Debug, Clone)]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn role(&self) -> &'static str {
        match self {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::ToolResult(_) => "toolResult",
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: UserContent::Text(text.into()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultMessage> {
        match self {
            Message::ToolResult(m) => Some(m),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Message::User(m) => m.timestamp,
            Message::Assistant(m) => m.timestamp,
            Message::ToolResult(m) => m.timestamp,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Message::User(msg) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("role", "user")?;
                map.serialize_entry("content", &msg.content)?;
                map.serialize_entry("timestamp", &msg.timestamp)?;
                map.end()
            }
            Message::Assistant(msg) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("role", "assistant")?;
                map.serialize_entry("content", &msg.content)?;
                map.serialize_entry("provider", &msg.provider)?;
                map.serialize_entry("model", &msg.model)?;
                map.serialize_entry("usage", &msg.usage)?;
                map.serialize_entry("stopReason", &msg.stop_reason)?;
                if let Some(err) = &msg.error_message {
                    map.serialize_entry("errorMessage", err)?;
                }
                map.serialize_entry("timestamp", &msg.timestamp)?;
                map.end()
            }
            Message::ToolResult(msg) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("role", "toolResult")?;
                map.serialize_entry("toolCallId", &msg.tool_call_id)?;
                map.serialize_entry("toolName", &msg.tool_name)?;
                map.serialize_entry("content", &msg.content)?;
                if let Some(details) = &msg.details {
                    map.serialize_entry("details", details)?;
                }
                map.serialize_entry("isError", &msg.is_error)?;
                map.serialize_entry("timestamp", &msg.timestamp)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("expected object"))?;
        let role = obj
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'role' field"))?;
        let timestamp = obj.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0);

        match role {
            "user" => {
                let content: UserContent = serde_json::from_value(
                    obj.get("content")
                        .cloned()
                        .unwrap_or(Value::String(String::new())),
                )
                .map_err(serde::de::Error::custom)?;
                Ok(Message::User(UserMessage { content, timestamp }))
            }
            "assistant" => {
                let content: Vec<ContentBlock> = serde_json::from_value(
                    obj.get("content").cloned().unwrap_or(Value::Array(vec![])),
                )
                .map_err(serde::de::Error::custom)?;
                let usage: Usage =
                    serde_json::from_value(obj.get("usage").cloned().unwrap_or_default())
                        .unwrap_or_default();
                let stop_reason: StopReason = serde_json::from_value(
                    obj.get("stopReason")
                        .cloned()
                        .unwrap_or(Value::String("complete".into())),
                )
                .unwrap_or(StopReason::Complete);
                Ok(Message::Assistant(AssistantMessage {
                    content,
                    provider: obj
                        .get("provider")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    model: obj
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    usage,
                    stop_reason,
                    error_message: obj
                        .get("errorMessage")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    timestamp,
                }))
            }
            "toolResult" => {
                let content: Vec<ContentBlock> = serde_json::from_value(
                    obj.get("content").cloned().unwrap_or(Value::Array(vec![])),
                )
                .map_err(serde::de::Error::custom)?;
                Ok(Message::ToolResult(ToolResultMessage {
                    tool_call_id: obj
                        .get("toolCallId")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    tool_name: obj
                        .get("toolName")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    content,
                    details: obj.get("details").cloned(),
                    is_error: obj.get("isError").and_then(|v| v.as_bool()).unwrap_or(false),
                    timestamp,
                }))
            }
            other => Err(serde::de::Error::custom(format!("unknown role: {other}"))),
        }
    }
}

// ---------- Tool definition ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ---------- Model ----------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub reasoning: bool,
    /// Whether the model accepts the `xhigh` thinking level.
    #[serde(default)]
    pub xhigh: bool,
    pub cost: ModelCost,
    pub context_window: u64,
    pub max_tokens: u64,
}

// ---------- ModelRequest ----------

/// Everything a driver needs to produce one assistant response.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub thinking_level: ThinkingLevel,
    pub api_key: Option<String>,
}

// ---------- AssistantEvent ----------

/// Streaming deltas emitted by a `ModelDriver` while producing one
/// assistant message. Every variant carries the partial message so far.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    Start {
        partial: AssistantMessage,
    },
    TextDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ToolCallDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
        partial: AssistantMessage,
    },
    Done {
        message: AssistantMessage,
    },
    Error {
        error: AssistantMessage,
    },
}

impl AssistantEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssistantEvent::Done { .. } | AssistantEvent::Error { .. })
    }

    pub fn partial(&self) -> &AssistantMessage {
        match self {
            AssistantEvent::Start { partial }
            | AssistantEvent::TextDelta { partial, .. }
            | AssistantEvent::ThinkingDelta { partial, .. }
            | AssistantEvent::ToolCallDelta { partial, .. }
            | AssistantEvent::ToolCallEnd { partial, .. } => partial,
            AssistantEvent::Done { message } => message,
            AssistantEvent::Error { error } => error,
        }
    }
}
