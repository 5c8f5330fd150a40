use tokio_util::sync::CancellationToken;

use tern_agent_core::driver::ModelDriver;
use tern_agent_core::types::{ContentBlock, Message, Model, UserContent};

use crate::compaction::compaction::drive_summary;
use crate::error::TernError;
use crate::session::store::SessionStore;
use crate::session::types::SessionEntry;

// ---------- Summarization prompts ----------

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. You produce structured summaries of coding conversations that keep every technical detail an AI coding assistant needs to continue the work.";

pub const SUMMARIZATION_PROMPT: &str = r#"Analyze the conversation between a user and an AI coding assistant and produce a structured summary with these sections:

## Goal
What the user is trying to accomplish, stated specifically.

## Progress
What has been done so far:
- Files created, modified, or deleted
- Commands run and their outcomes
- Key code changes
- Tests run and their results

## Key Decisions
Technical decisions made along the way: architecture choices, library selections, trade-offs, constraints.

## Current State
What works, what is broken or incomplete, the next steps, and any blockers or open questions.

## Important Context
Anything else essential for continuing: environment details, configuration, still-relevant error messages, important file paths.

Be concise but thorough, and prefer technical accuracy over brevity. Include concrete file paths, function names, error messages, and command output where they matter."#;

pub const BRANCH_SUMMARIZATION_PROMPT: &str = r#"The conversation below is a side branch the user explored and then abandoned. Summarize it so the main conversation keeps what was learned:

- What was attempted on this branch
- What worked and what did not
- Conclusions or findings worth carrying back

Keep it short; this is background, not the main thread."#;

/// Build the user prompt for a summarization call.
pub fn summary_prompt(
    conversation: &str,
    base_prompt: Option<&str>,
    custom_instructions: Option<&str>,
) -> String {
    let mut prompt = base_prompt.unwrap_or(SUMMARIZATION_PROMPT).to_string();
    if let Some(instructions) = custom_instructions {
        prompt.push_str("\n\nAdditional instructions from the user:\n");
        prompt.push_str(instructions);
    }
    prompt.push_str("\n\n<conversation>\n");
    prompt.push_str(conversation);
    prompt.push_str("\n</conversation>");
    prompt
}

// ---------- Conversation serialization ----------

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{k}={val}")
            })
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|&(i, _)| i <= max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...[truncated]", &text[..end])
}

/// Flatten entries into the text handed to the summarizer:
/// `[User]: ...`, `[Assistant]: ...`, `[Assistant tool calls]: name(args)`,
/// `[Tool result]: ...` (long results truncated).
pub fn serialize_conversation(entries: &[SessionEntry]) -> String {
    let mut parts = Vec::new();

    for entry in entries {
        let Some(message) = entry.as_message() else {
            continue;
        };
        match message {
            Message::User(m) => {
                let text = match &m.content {
                    UserContent::Text(t) => t.clone(),
                    UserContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| b.as_text().map(|t| t.text.clone()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                parts.push(format!("[User]: {text}"));
            }
            Message::Assistant(m) => {
                let mut texts: Vec<String> = Vec::new();
                let mut tool_calls: Vec<String> = Vec::new();
                for block in &m.content {
                    match block {
                        ContentBlock::Text(t) => texts.push(t.text.clone()),
                        ContentBlock::ToolCall(tc) => {
                            tool_calls.push(format!(
                                "{}({})",
                                tc.name,
                                format_tool_args(&tc.arguments)
                            ));
                        }
                        _ => {}
                    }
                }
                if !texts.is_empty() {
                    parts.push(format!("[Assistant]: {}", texts.join("\n")));
                }
                if !tool_calls.is_empty() {
                    parts.push(format!("[Assistant tool calls]: {}", tool_calls.join("; ")));
                }
            }
            Message::ToolResult(m) => {
                let content: String = m
                    .content
                    .iter()
                    .filter_map(|b| b.as_text().map(|t| t.text.clone()))
                    .collect::<Vec<_>>()
                    .join("\n");
                parts.push(format!("[Tool result]: {}", truncate_chars(&content, 500)));
            }
        }
    }

    parts.join("\n\n")
}

// ---------- Branch-summary collection ----------

/// Entries abandoned by navigating from `old_leaf_id` to `new_target_id`:
/// the path below their lowest common ancestor (exclusive) down to the old
/// leaf, in root-to-leaf order. Empty when the old leaf is an ancestor of
/// the target (nothing is being abandoned).
pub fn collect_entries_for_branch_summary(
    store: &SessionStore,
    old_leaf_id: &str,
    new_target_id: &str,
) -> Vec<SessionEntry> {
    let tree = store.get_tree();
    let old_path = tree.path_to(old_leaf_id);
    if old_path.is_empty() {
        return Vec::new();
    }

    let shared = tree
        .lowest_common_ancestor(old_leaf_id, new_target_id)
        .map(|e| e.id().to_string());

    let start = match shared {
        Some(lca_id) => {
            if lca_id == old_leaf_id {
                // Navigating forward or staying put abandons nothing.
                return Vec::new();
            }
            old_path
                .iter()
                .position(|e| e.id() == lca_id)
                .map(|i| i + 1)
        }
        None => Some(0),
    };

    match start {
        Some(start) => old_path[start..].iter().map(|e| (*e).clone()).collect(),
        None => Vec::new(),
    }
}

/// Summarize an abandoned branch with the model. The caller attaches the
/// result via `branch_with_summary`.
pub async fn summarize_branch(
    driver: &dyn ModelDriver,
    model: &Model,
    api_key: Option<String>,
    entries: &[SessionEntry],
    custom_instructions: Option<&str>,
    cancel: CancellationToken,
) -> Result<String, TernError> {
    let conversation = serialize_conversation(entries);
    let prompt = summary_prompt(
        &conversation,
        Some(BRANCH_SUMMARIZATION_PROMPT),
        custom_instructions,
    );
    drive_summary(driver, model, api_key, prompt, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_agent_core::types::{
        AssistantMessage, StopReason, ToolCall, ToolResultMessage, Usage, UserMessage,
    };

    fn entry(message: Message) -> SessionEntry {
        SessionEntry::Message {
            id: SessionEntry::new_id(),
            parent_id: None,
            timestamp: crate::session::types::now_iso_timestamp(),
            message,
        }
    }

    fn user(text: &str) -> Message {
        Message::User(UserMessage {
            content: UserContent::Text(text.to_string()),
            timestamp: 0,
        })
    }

    #[test]
    fn serializes_each_role() {
        let entries = vec![
            entry(user("Fix the bug in main.rs")),
            entry(Message::Assistant(AssistantMessage {
                content: vec![
                    ContentBlock::text("Looking at it."),
                    ContentBlock::ToolCall(ToolCall {
                        id: "tc1".into(),
                        name: "read".into(),
                        arguments: serde_json::json!({"path": "main.rs"}),
                    }),
                ],
                provider: "stub".into(),
                model: "stub-1".into(),
                usage: Usage::default(),
                stop_reason: StopReason::ToolCalls,
                error_message: None,
                timestamp: 0,
            })),
            entry(Message::ToolResult(ToolResultMessage {
                tool_call_id: "tc1".into(),
                tool_name: "read".into(),
                content: vec![ContentBlock::text("fn main() {}")],
                details: None,
                is_error: false,
                timestamp: 0,
            })),
        ];

        let text = serialize_conversation(&entries);
        assert!(text.contains("[User]: Fix the bug in main.rs"));
        assert!(text.contains("[Assistant]: Looking at it."));
        assert!(text.contains("[Assistant tool calls]: read(path=main.rs)"));
        assert!(text.contains("[Tool result]: fn main() {}"));
    }

    #[test]
    fn long_tool_results_are_truncated() {
        let entries = vec![entry(Message::ToolResult(ToolResultMessage {
            tool_call_id: "tc1".into(),
            tool_name: "read".into(),
            content: vec![ContentBlock::text("a".repeat(600))],
            details: None,
            is_error: false,
            timestamp: 0,
        }))];
        let text = serialize_conversation(&entries);
        assert!(text.contains("...[truncated]"));
    }

    #[test]
    fn summary_prompt_includes_custom_instructions() {
        let prompt = summary_prompt("the conversation", None, Some("focus on tests"));
        assert!(prompt.contains("## Goal"));
        assert!(prompt.contains("focus on tests"));
        assert!(prompt.contains("<conversation>\nthe conversation\n</conversation>"));
    }

    #[test]
    fn collects_abandoned_entries_below_the_fork() {
        let mut store = SessionStore::in_memory();
        let shared = store.append_message(user("shared")).unwrap();
        let a1 = store.append_message(user("branch work 1")).unwrap();
        let a2 = store.append_message(user("branch work 2")).unwrap();
        store.branch(&shared).unwrap();
        let b1 = store.append_message(user("other branch")).unwrap();

        let abandoned = collect_entries_for_branch_summary(&store, &a2, &b1);
        assert_eq!(
            abandoned
                .iter()
                .map(|e| e.id().to_string())
                .collect::<Vec<_>>(),
            vec![a1, a2]
        );
    }

    #[test]
    fn navigating_forward_abandons_nothing() {
        let mut store = SessionStore::in_memory();
        let e1 = store.append_message(user("one")).unwrap();
        let e2 = store.append_message(user("two")).unwrap();

        let abandoned = collect_entries_for_branch_summary(&store, &e1, &e2);
        assert!(abandoned.is_empty());
    }

    #[test]
    fn navigating_to_ancestor_collects_the_tail() {
        let mut store = SessionStore::in_memory();
        let e1 = store.append_message(user("one")).unwrap();
        let e2 = store.append_message(user("two")).unwrap();
        let e3 = store.append_message(user("three")).unwrap();

        let abandoned = collect_entries_for_branch_summary(&store, &e3, &e1);
        assert_eq!(
            abandoned
                .iter()
                .map(|e| e.id().to_string())
                .collect::<Vec<_>>(),
            vec![e2, e3]
        );
    }
}
