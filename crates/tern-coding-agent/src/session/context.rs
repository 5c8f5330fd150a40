use tern_agent_core::agent_types::{AgentMessage, CustomMessage};
use tern_agent_core::types::{Message, ThinkingLevel, UserContent, UserMessage};

use crate::messages::types::{branch_summary_text, compaction_summary_text};
use crate::session::types::SessionEntry;

/// Reference to the model selected on a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

/// What replaying a branch recovers: the agent's working transcript plus the
/// last model and thinking-level selections.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub messages: Vec<AgentMessage>,
    pub model: Option<ModelRef>,
    pub thinking_level: ThinkingLevel,
}

/// Project a root-to-leaf branch to the message list the agent feeds the
/// model. Pure: the same branch always yields byte-identical messages
/// (synthetic messages take their timestamps from the entries).
///
/// A `compaction` entry discards everything emitted so far, splices in the
/// summary as a synthetic user message, and re-emits the kept tail starting
/// at `firstKeptEntryId`. A `branch_summary` entry splices its summary in at
/// its own position.
pub fn build_session_context(branch: &[&SessionEntry]) -> SessionContext {
    let mut context = SessionContext::default();

    for (i, entry) in branch.iter().enumerate() {
        match entry {
            SessionEntry::ModelChange {
                provider, model_id, ..
            } => {
                context.model = Some(ModelRef {
                    provider: provider.clone(),
                    model_id: model_id.clone(),
                });
            }
            SessionEntry::ThinkingLevelChange { thinking_level, .. } => {
                context.thinking_level = *thinking_level;
            }
            SessionEntry::Compaction {
                summary,
                first_kept_entry_id,
                ..
            } => {
                context.messages.clear();
                context
                    .messages
                    .push(synthetic_user(compaction_summary_text(summary), entry));

                if let Some(start) = branch[..i]
                    .iter()
                    .position(|e| e.id() == first_kept_entry_id)
                {
                    for kept in &branch[start..i] {
                        emit_message(kept, &mut context.messages);
                    }
                }
            }
            _ => emit_message(entry, &mut context.messages),
        }
    }

    context
}

fn emit_message(entry: &SessionEntry, messages: &mut Vec<AgentMessage>) {
    match entry {
        SessionEntry::Message { message, .. } => {
            messages.push(AgentMessage::Llm(message.clone()));
        }
        SessionEntry::BranchSummary { summary, .. } => {
            messages.push(synthetic_user(branch_summary_text(summary), entry));
        }
        SessionEntry::CustomMessage {
            custom_type,
            content,
            ..
        } => {
            messages.push(AgentMessage::Custom(CustomMessage {
                role: custom_type.clone(),
                payload: content.clone(),
                timestamp: entry.timestamp_ms(),
            }));
        }
        // Config changes are tracked by the caller; labels, session info,
        // plain custom entries and unknown types have no message form.
        _ => {}
    }
}

fn synthetic_user(text: String, entry: &SessionEntry) -> AgentMessage {
    AgentMessage::Llm(Message::User(UserMessage {
        content: UserContent::Text(text),
        timestamp: entry.timestamp_ms(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::COMPACTION_SUMMARY_PREFIX;
    use crate::session::store::SessionStore;
    use tern_agent_core::types::{AssistantMessage, ContentBlock, StopReason, Usage};

    fn user(text: &str) -> Message {
        Message::User(UserMessage {
            content: UserContent::Text(text.to_string()),
            timestamp: 1_700_000_000_000,
        })
    }

    fn assistant(text: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::text(text)],
            provider: "stub".to_string(),
            model: "stub-1".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Complete,
            error_message: None,
            timestamp: 1_700_000_000_001,
        })
    }

    #[test]
    fn plain_branch_projects_in_order() {
        let mut store = SessionStore::in_memory();
        store.append_message(user("one")).unwrap();
        store.append_message(assistant("two")).unwrap();

        let context = store.build_session_context();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].role(), "user");
        assert_eq!(context.messages[1].role(), "assistant");
    }

    #[test]
    fn tracks_last_model_and_thinking_level() {
        let mut store = SessionStore::in_memory();
        store.append_model_change("anthropic", "claude-a").unwrap();
        store
            .append_thinking_level_change(ThinkingLevel::Low)
            .unwrap();
        store.append_model_change("openai", "gpt-b").unwrap();
        store
            .append_thinking_level_change(ThinkingLevel::High)
            .unwrap();

        let context = store.build_session_context();
        assert_eq!(
            context.model,
            Some(ModelRef {
                provider: "openai".to_string(),
                model_id: "gpt-b".to_string()
            })
        );
        assert_eq!(context.thinking_level, ThinkingLevel::High);
        assert!(context.messages.is_empty());
    }

    #[test]
    fn compaction_splices_summary_and_kept_tail() {
        let mut store = SessionStore::in_memory();
        store.append_message(user("old question")).unwrap();
        store.append_message(assistant("old answer")).unwrap();
        let kept = store.append_message(user("recent question")).unwrap();
        store.append_message(assistant("recent answer")).unwrap();

        store
            .append_compaction("SUMMARY".into(), kept, 50_000, None, None)
            .unwrap();

        let context = store.build_session_context();
        // summary + 2 kept messages
        assert_eq!(context.messages.len(), 3);

        let first = context.messages[0].user_text().unwrap();
        assert!(first.starts_with(COMPACTION_SUMMARY_PREFIX));
        assert!(first.contains("SUMMARY"));

        assert_eq!(
            context.messages[1].user_text().as_deref(),
            Some("recent question")
        );
        // Nothing from before the kept entry survives.
        assert!(
            !context
                .messages
                .iter()
                .any(|m| m.user_text().as_deref() == Some("old question"))
        );
    }

    #[test]
    fn messages_after_compaction_entry_are_appended() {
        let mut store = SessionStore::in_memory();
        store.append_message(user("old")).unwrap();
        let kept = store.append_message(user("kept")).unwrap();
        store
            .append_compaction("S".into(), kept, 10_000, None, None)
            .unwrap();
        store.append_message(user("after")).unwrap();

        let context = store.build_session_context();
        assert_eq!(context.messages.len(), 3);
        assert_eq!(context.messages[2].user_text().as_deref(), Some("after"));
    }

    #[test]
    fn branch_summary_splices_at_position() {
        let mut store = SessionStore::in_memory();
        let u1 = store.append_message(user("U1")).unwrap();
        store.append_message(assistant("A1")).unwrap();
        store.append_message(user("dead end")).unwrap();

        store
            .branch_with_summary(Some(&u1), "tried a dead end".into(), None, None)
            .unwrap();

        let context = store.build_session_context();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].user_text().as_deref(), Some("U1"));
        let spliced = context.messages[1].user_text().unwrap();
        assert!(spliced.starts_with(
            "The following is a summary of a branch that this conversation came back from:"
        ));
        assert!(spliced.contains("tried a dead end"));
    }

    #[test]
    fn projection_is_deterministic() {
        let mut store = SessionStore::in_memory();
        store.append_message(user("one")).unwrap();
        let kept = store.append_message(user("two")).unwrap();
        store
            .append_compaction("S".into(), kept, 1_000, None, None)
            .unwrap();

        let a = store.build_session_context();
        let b = store.build_session_context();
        let to_json = |c: &SessionContext| {
            serde_json::to_string(&crate::messages::convert::convert_to_llm(&c.messages)).unwrap()
        };
        assert_eq!(to_json(&a), to_json(&b));
    }
}
