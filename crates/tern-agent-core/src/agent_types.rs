use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::*;

// ---------- CustomMessage ----------

/// A non-LLM message carried in the conversation: an opaque role tag plus an
/// opaque payload. The session layer defines typed payloads for the roles it
/// knows about and projects them to user text before the LLM sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMessage {
    pub role: String,
    pub payload: Value,
    pub timestamp: i64,
}

// ---------- AgentMessage ----------

/// A message in the agent's working transcript: either LLM-visible or custom.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Llm(Message),
    Custom(CustomMessage),
}

impl AgentMessage {
    pub fn role(&self) -> &str {
        match self {
            AgentMessage::Llm(msg) => msg.role(),
            AgentMessage::Custom(c) => &c.role,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            AgentMessage::Llm(msg) => Some(msg),
            AgentMessage::Custom(_) => None,
        }
    }

    pub fn as_custom(&self) -> Option<&CustomMessage> {
        match self {
            AgentMessage::Custom(c) => Some(c),
            AgentMessage::Llm(_) => None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        AgentMessage::Llm(Message::user_text(text))
    }

    /// Plain text of a user message, if this is one.
    pub fn user_text(&self) -> Option<String> {
        match self {
            AgentMessage::Llm(Message::User(m)) => Some(m.content.as_plain_text()),
            _ => None,
        }
    }
}

impl From<Message> for AgentMessage {
    fn from(msg: Message) -> Self {
        AgentMessage::Llm(msg)
    }
}

impl From<AssistantMessage> for AgentMessage {
    fn from(msg: AssistantMessage) -> Self {
        AgentMessage::Llm(Message::Assistant(msg))
    }
}

impl From<ToolResultMessage> for AgentMessage {
    fn from(msg: ToolResultMessage) -> Self {
        AgentMessage::Llm(Message::ToolResult(msg))
    }
}

// ---------- AgentToolResult / AgentTool ----------

#[derive(Debug, Clone)]
pub struct AgentToolResult {
    pub content: Vec<ContentBlock>,
    pub details: Option<Value>,
}

impl AgentToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: None,
        }
    }
}

/// A tool the model can invoke. Implementations are opaque to the core; they
/// receive validated-enough JSON args and a cancellation token they must
/// observe cooperatively.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> &Tool;

    async fn invoke(
        &self,
        tool_call_id: &str,
        args: Value,
        cancel: CancellationToken,
        on_update: Option<Box<dyn Fn(AgentToolResult) + Send + Sync>>,
    ) -> Result<AgentToolResult, Box<dyn std::error::Error + Send + Sync>>;
}

// ---------- Queue modes ----------

/// How queued steering messages drain before the next assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    #[default]
    OneAtATime,
    Concatenate,
}

/// How queued follow-up messages drain after the current run would end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowUpMode {
    #[default]
    OneAtATime,
    Concatenate,
    Skip,
}

/// Join queued items into the drain result for a given mode. Concatenation
/// merges runs of plain-text user messages with blank lines; non-text items
/// (custom messages, block-form user messages) pass through unmerged.
fn drain_concatenated(queue: &mut Vec<AgentMessage>) -> Vec<AgentMessage> {
    let items = std::mem::take(queue);
    let mut result: Vec<AgentMessage> = Vec::new();
    let mut texts: Vec<String> = Vec::new();

    for item in items {
        match item.user_text() {
            Some(text) => texts.push(text),
            None => {
                if !texts.is_empty() {
                    result.push(AgentMessage::user(texts.join("\n\n")));
                    texts.clear();
                }
                result.push(item);
            }
        }
    }
    if !texts.is_empty() {
        result.push(AgentMessage::user(texts.join("\n\n")));
    }
    result
}

/// Shared steering / follow-up queues. The turn loop holds clones of these
/// handles so `steer`/`follow_up` keep working while a run is in flight.
#[derive(Clone, Default)]
pub struct QueueHandles {
    pub steering: Arc<Mutex<Vec<AgentMessage>>>,
    pub follow_up: Arc<Mutex<Vec<AgentMessage>>>,
    pub steering_mode: Arc<Mutex<QueueMode>>,
    pub follow_up_mode: Arc<Mutex<FollowUpMode>>,
}

impl QueueHandles {
    pub fn push_steering(&self, msg: AgentMessage) {
        self.steering.lock().unwrap().push(msg);
    }

    pub fn push_follow_up(&self, msg: AgentMessage) {
        self.follow_up.lock().unwrap().push(msg);
    }

    pub fn clear(&self) {
        self.steering.lock().unwrap().clear();
        self.follow_up.lock().unwrap().clear();
    }

    pub fn dequeue_steering(&self) -> Vec<AgentMessage> {
        let mode = *self.steering_mode.lock().unwrap();
        let mut queue = self.steering.lock().unwrap();
        match mode {
            QueueMode::OneAtATime => {
                if queue.is_empty() {
                    vec![]
                } else {
                    vec![queue.remove(0)]
                }
            }
            QueueMode::Concatenate => drain_concatenated(&mut queue),
        }
    }

    pub fn dequeue_follow_up(&self) -> Vec<AgentMessage> {
        let mode = *self.follow_up_mode.lock().unwrap();
        let mut queue = self.follow_up.lock().unwrap();
        match mode {
            FollowUpMode::OneAtATime => {
                if queue.is_empty() {
                    vec![]
                } else {
                    vec![queue.remove(0)]
                }
            }
            FollowUpMode::Concatenate => drain_concatenated(&mut queue),
            FollowUpMode::Skip => {
                queue.clear();
                vec![]
            }
        }
    }
}

// ---------- AgentEvent ----------

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    MessageUpdate {
        message: AgentMessage,
        delta: AssistantEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial_result: AgentToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: AgentToolResult,
        is_error: bool,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::AgentEnd { .. } => "agent_end",
            AgentEvent::TurnStart => "turn_start",
            AgentEvent::TurnEnd { .. } => "turn_end",
            AgentEvent::MessageStart { .. } => "message_start",
            AgentEvent::MessageUpdate { .. } => "message_update",
            AgentEvent::MessageEnd { .. } => "message_end",
            AgentEvent::ToolExecutionStart { .. } => "tool_execution_start",
            AgentEvent::ToolExecutionUpdate { .. } => "tool_execution_update",
            AgentEvent::ToolExecutionEnd { .. } => "tool_execution_end",
        }
    }
}

// ---------- Turn context & config ----------

/// Snapshot of the conversation state a run works off.
pub struct TurnContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<Arc<dyn AgentTool>>,
}

/// Project the working transcript to LLM-visible messages.
pub type ConvertToLlmFn = dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync;

/// Per-run configuration handed to the turn loop.
pub struct TurnConfig {
    pub model: Model,
    pub thinking_level: ThinkingLevel,
    pub api_key: Option<String>,
    pub convert_to_llm: Arc<ConvertToLlmFn>,
    pub queues: QueueHandles,
}

/// Default projection: drop custom messages.
pub fn default_convert_to_llm(messages: &[AgentMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| m.as_message().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_one_at_a_time_is_fifo() {
        let queues = QueueHandles::default();
        queues.push_steering(AgentMessage::user("first"));
        queues.push_steering(AgentMessage::user("second"));

        let drained = queues.dequeue_steering();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].user_text().unwrap(), "first");

        let drained = queues.dequeue_steering();
        assert_eq!(drained[0].user_text().unwrap(), "second");
        assert!(queues.dequeue_steering().is_empty());
    }

    #[test]
    fn concatenate_joins_with_blank_lines() {
        let queues = QueueHandles::default();
        *queues.steering_mode.lock().unwrap() = QueueMode::Concatenate;
        queues.push_steering(AgentMessage::user("also consider X"));
        queues.push_steering(AgentMessage::user("and Y"));

        let drained = queues.dequeue_steering();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].user_text().unwrap(), "also consider X\n\nand Y");
    }

    #[test]
    fn follow_up_skip_discards() {
        let queues = QueueHandles::default();
        *queues.follow_up_mode.lock().unwrap() = FollowUpMode::Skip;
        queues.push_follow_up(AgentMessage::user("later"));
        assert!(queues.dequeue_follow_up().is_empty());
        assert!(queues.follow_up.lock().unwrap().is_empty());
    }

    #[test]
    fn concatenate_keeps_custom_messages_separate() {
        let queues = QueueHandles::default();
        *queues.steering_mode.lock().unwrap() = QueueMode::Concatenate;
        queues.push_steering(AgentMessage::user("a"));
        queues.push_steering(AgentMessage::Custom(CustomMessage {
            role: "hookMessage".to_string(),
            payload: serde_json::json!({"content": "from hook"}),
            timestamp: 0,
        }));
        queues.push_steering(AgentMessage::user("b"));

        let drained = queues.dequeue_steering();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].user_text().unwrap(), "a");
        assert_eq!(drained[1].role(), "hookMessage");
        assert_eq!(drained[2].user_text().unwrap(), "b");
    }
}
