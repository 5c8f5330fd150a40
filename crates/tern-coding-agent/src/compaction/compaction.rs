use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tern_agent_core::driver::{ModelDriver, assistant_text, complete};
use tern_agent_core::types::{
    ContentBlock, Message, Model, ModelRequest, StopReason, ThinkingLevel, UserContent,
};

use crate::compaction::branch_summary::{
    SUMMARIZATION_SYSTEM_PROMPT, serialize_conversation, summary_prompt,
};
use crate::error::TernError;
use crate::session::types::SessionEntry;

// ---------- Settings ----------

/// Controls when compaction triggers and how much recent context survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Tokens reserved for new output below the context window.
    pub reserve_tokens: u64,
    /// Approximate tokens of recent context kept after compaction.
    pub keep_recent_tokens: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: 16384,
            keep_recent_tokens: 20000,
        }
    }
}

// ---------- Token estimation ----------

/// Per-entry token estimator. The default is a chars/4 heuristic; drivers
/// that can count real tokens may inject their own.
pub type TokenEstimator = Arc<dyn Fn(&SessionEntry) -> u64 + Send + Sync>;

const IMAGE_TOKEN_ESTIMATE: u64 = 1200;

fn estimate_text(text: &str) -> u64 {
    (text.len() as f64 / 4.0).ceil() as u64
}

fn estimate_blocks(blocks: &[ContentBlock]) -> u64 {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text(t) => estimate_text(&t.text),
            ContentBlock::Thinking(t) => estimate_text(&t.thinking),
            ContentBlock::Image(_) => IMAGE_TOKEN_ESTIMATE,
            ContentBlock::ToolCall(tc) => {
                estimate_text(&tc.name) + estimate_text(&tc.arguments.to_string())
            }
        })
        .sum()
}

/// Default estimator over session entries.
pub fn default_estimate_entry_tokens(entry: &SessionEntry) -> u64 {
    match entry {
        SessionEntry::Message { message, .. } => match message {
            Message::User(m) => match &m.content {
                UserContent::Text(t) => estimate_text(t),
                UserContent::Blocks(blocks) => estimate_blocks(blocks),
            },
            Message::Assistant(m) => estimate_blocks(&m.content),
            Message::ToolResult(m) => estimate_blocks(&m.content),
        },
        SessionEntry::CustomMessage { content, .. } => estimate_text(&content.to_string()),
        SessionEntry::Compaction { summary, .. } | SessionEntry::BranchSummary { summary, .. } => {
            estimate_text(summary)
        }
        _ => 0,
    }
}

pub fn default_token_estimator() -> TokenEstimator {
    Arc::new(default_estimate_entry_tokens)
}

pub fn estimate_branch_tokens(branch: &[&SessionEntry], estimator: &TokenEstimator) -> u64 {
    branch.iter().map(|e| estimator(e)).sum()
}

/// Auto-compaction trigger: projected tokens exceed the window minus the
/// reserve.
pub fn should_compact(
    branch: &[&SessionEntry],
    context_window: u64,
    settings: &CompactionSettings,
    estimator: &TokenEstimator,
) -> bool {
    if !settings.enabled {
        return false;
    }
    estimate_branch_tokens(branch, estimator)
        > context_window.saturating_sub(settings.reserve_tokens)
}

// ---------- Cut-point detection ----------

/// Entries the cut may land on. Tool results are excluded so a kept tail
/// never starts with a result whose call was summarized away.
fn is_valid_cut_point(entry: &SessionEntry) -> bool {
    match entry {
        SessionEntry::Message { message, .. } => !matches!(message, Message::ToolResult(_)),
        SessionEntry::CustomMessage { .. } => true,
        _ => false,
    }
}

/// Walk backwards accumulating estimated tokens until `keep_recent_tokens`
/// is reached, then move forward to the nearest valid boundary. Returns the
/// index of the first entry to keep (0 keeps everything).
fn find_cut_point(
    branch: &[&SessionEntry],
    keep_recent_tokens: u64,
    estimator: &TokenEstimator,
) -> usize {
    if branch.is_empty() {
        return 0;
    }

    let mut accumulated: u64 = 0;
    for i in (0..branch.len()).rev() {
        accumulated += estimator(branch[i]);
        if accumulated >= keep_recent_tokens {
            for j in i..branch.len() {
                if is_valid_cut_point(branch[j]) {
                    return j;
                }
            }
            return 0;
        }
    }

    0
}

// ---------- Preparation ----------

/// What a compaction run will summarize, and where the kept tail begins.
#[derive(Debug, Clone)]
pub struct Preparation {
    pub entries_to_compact: Vec<SessionEntry>,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
}

/// Decide what to compact on the current branch. Returns `None` when there
/// is nothing old enough to drop (the whole branch fits inside the
/// keep-recent budget).
pub fn prepare_compaction(
    branch: &[&SessionEntry],
    settings: &CompactionSettings,
    estimator: &TokenEstimator,
) -> Option<Preparation> {
    let cut = find_cut_point(branch, settings.keep_recent_tokens, estimator);
    if cut == 0 {
        return None;
    }

    Some(Preparation {
        entries_to_compact: branch[..cut].iter().map(|e| (*e).clone()).collect(),
        first_kept_entry_id: branch[cut].id().to_string(),
        tokens_before: estimate_branch_tokens(branch, estimator),
    })
}

// ---------- Execution ----------

/// Outcome of a compaction run. The caller appends the compaction entry and
/// re-projects the branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Files touched by tool calls in the compacted prefix, recorded in the
/// compaction details so later turns keep the map of what was explored.
fn extract_file_details(entries: &[SessionEntry]) -> Option<Value> {
    let mut read_files: Vec<String> = Vec::new();
    let mut modified_files: Vec<String> = Vec::new();

    for entry in entries {
        let Some(Message::Assistant(assistant)) = entry.as_message() else {
            continue;
        };
        for call in assistant.tool_calls() {
            let Some(path) = call
                .arguments
                .get("path")
                .or_else(|| call.arguments.get("file_path"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let bucket = match call.name.as_str() {
                "read" | "grep" | "find" | "ls" => &mut read_files,
                "edit" | "write" => &mut modified_files,
                _ => continue,
            };
            if !bucket.iter().any(|p| p == path) {
                bucket.push(path.to_string());
            }
        }
    }

    if read_files.is_empty() && modified_files.is_empty() {
        return None;
    }
    Some(serde_json::json!({
        "readFiles": read_files,
        "modifiedFiles": modified_files,
    }))
}

/// Drive the model once for a summarization prompt. Shared by compaction and
/// branch summaries; cancellation surfaces as `TernError::Cancelled`.
pub(crate) async fn drive_summary(
    driver: &dyn ModelDriver,
    model: &Model,
    api_key: Option<String>,
    prompt: String,
    cancel: CancellationToken,
) -> Result<String, TernError> {
    let request = ModelRequest {
        system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user_text(prompt)],
        tools: Vec::new(),
        thinking_level: ThinkingLevel::Off,
        api_key,
    };

    let message = complete(driver, model, request, cancel.clone()).await;
    match message.stop_reason {
        StopReason::Aborted => Err(TernError::Cancelled),
        StopReason::Error => {
            if cancel.is_cancelled() {
                Err(TernError::Cancelled)
            } else {
                Err(TernError::Provider(
                    message
                        .error_message
                        .unwrap_or_else(|| "summarization failed".to_string()),
                ))
            }
        }
        _ => Ok(assistant_text(&message)),
    }
}

/// Summarize the prepared prefix into a `CompactionResult`.
pub async fn compact(
    preparation: &Preparation,
    driver: &dyn ModelDriver,
    model: &Model,
    api_key: Option<String>,
    custom_instructions: Option<&str>,
    cancel: CancellationToken,
) -> Result<CompactionResult, TernError> {
    let conversation = serialize_conversation(&preparation.entries_to_compact);
    let prompt = summary_prompt(&conversation, None, custom_instructions);

    let summary = drive_summary(driver, model, api_key, prompt, cancel).await?;

    Ok(CompactionResult {
        summary,
        first_kept_entry_id: preparation.first_kept_entry_id.clone(),
        tokens_before: preparation.tokens_before,
        details: extract_file_details(&preparation.entries_to_compact),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::SessionStore;
    use tern_agent_core::types::{AssistantMessage, ToolCall, Usage, UserMessage};

    fn user(text: &str) -> Message {
        Message::User(UserMessage {
            content: UserContent::Text(text.to_string()),
            timestamp: 0,
        })
    }

    fn assistant_with_tool_call(name: &str, path: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::ToolCall(ToolCall {
                id: "tc".into(),
                name: name.into(),
                arguments: serde_json::json!({"path": path}),
            })],
            provider: "stub".into(),
            model: "stub-1".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolCalls,
            error_message: None,
            timestamp: 0,
        })
    }

    fn tool_result(text: &str) -> Message {
        Message::ToolResult(tern_agent_core::types::ToolResultMessage {
            tool_call_id: "tc".into(),
            tool_name: "read".into(),
            content: vec![ContentBlock::text(text)],
            details: None,
            is_error: false,
            timestamp: 0,
        })
    }

    #[test]
    fn estimator_counts_roughly_four_chars_per_token() {
        let mut store = SessionStore::in_memory();
        store.append_message(user(&"a".repeat(400))).unwrap();
        let branch = store.get_branch();
        let estimator = default_token_estimator();
        assert_eq!(estimate_branch_tokens(&branch, &estimator), 100);
    }

    #[test]
    fn should_compact_honors_reserve_and_enabled() {
        let mut store = SessionStore::in_memory();
        store.append_message(user(&"x".repeat(4000))).unwrap(); // ~1000 tokens
        let branch = store.get_branch();
        let estimator = default_token_estimator();

        let settings = CompactionSettings {
            enabled: true,
            reserve_tokens: 500,
            keep_recent_tokens: 100,
        };
        // window 1200, reserve 500 -> threshold 700 < 1000
        assert!(should_compact(&branch, 1200, &settings, &estimator));
        // window 2000 -> threshold 1500 > 1000
        assert!(!should_compact(&branch, 2000, &settings, &estimator));

        let disabled = CompactionSettings {
            enabled: false,
            ..settings
        };
        assert!(!should_compact(&branch, 1200, &disabled, &estimator));
    }

    #[test]
    fn prepare_cuts_old_entries_and_keeps_recent_budget() {
        let mut store = SessionStore::in_memory();
        for i in 0..10 {
            store
                .append_message(user(&format!("message {i} {}", "pad ".repeat(20))))
                .unwrap();
        }
        let branch = store.get_branch();
        let estimator = default_token_estimator();

        let settings = CompactionSettings {
            keep_recent_tokens: 30,
            ..Default::default()
        };
        let prep = prepare_compaction(&branch, &settings, &estimator).expect("preparation");
        assert!(!prep.entries_to_compact.is_empty());

        // The first kept entry is on the branch, after the compacted prefix.
        let kept_index = branch
            .iter()
            .position(|e| e.id() == prep.first_kept_entry_id)
            .unwrap();
        assert_eq!(kept_index, prep.entries_to_compact.len());
    }

    #[test]
    fn prepare_returns_none_when_everything_is_recent() {
        let mut store = SessionStore::in_memory();
        store.append_message(user("short")).unwrap();
        store.append_message(user("also short")).unwrap();
        let branch = store.get_branch();
        let estimator = default_token_estimator();

        let settings = CompactionSettings::default(); // keep 20k tokens
        assert!(prepare_compaction(&branch, &settings, &estimator).is_none());
    }

    #[test]
    fn cut_never_lands_on_a_tool_result() {
        let mut store = SessionStore::in_memory();
        store.append_message(user(&"pad ".repeat(50))).unwrap();
        store
            .append_message(assistant_with_tool_call("read", "a.rs"))
            .unwrap();
        store
            .append_message(tool_result(&"out ".repeat(50)))
            .unwrap();
        store.append_message(user("thanks")).unwrap();
        let branch = store.get_branch();
        let estimator = default_token_estimator();

        let settings = CompactionSettings {
            keep_recent_tokens: 10,
            ..Default::default()
        };
        if let Some(prep) = prepare_compaction(&branch, &settings, &estimator) {
            let kept = store.get_entry(&prep.first_kept_entry_id).unwrap();
            assert!(
                !matches!(kept.as_message(), Some(Message::ToolResult(_))),
                "cut landed on a tool result"
            );
        }
    }

    #[test]
    fn file_details_extracted_from_tool_calls() {
        let mut store = SessionStore::in_memory();
        store
            .append_message(assistant_with_tool_call("read", "src/lib.rs"))
            .unwrap();
        store
            .append_message(assistant_with_tool_call("edit", "src/main.rs"))
            .unwrap();
        let entries: Vec<SessionEntry> = store.get_branch().into_iter().cloned().collect();

        let details = extract_file_details(&entries).unwrap();
        assert_eq!(details["readFiles"], serde_json::json!(["src/lib.rs"]));
        assert_eq!(details["modifiedFiles"], serde_json::json!(["src/main.rs"]));
    }
}
