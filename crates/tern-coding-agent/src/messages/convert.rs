use tern_agent_core::agent_types::{AgentMessage, CustomMessage};
use tern_agent_core::types::{Message, UserContent, UserMessage};

use crate::messages::types::{CustomPayload, branch_summary_text, compaction_summary_text};

/// Stable LLM text form of a custom message, or `None` for payloads the
/// model should never see (unknown roles, non-display hook messages).
pub fn custom_message_text(message: &CustomMessage) -> Option<String> {
    match CustomPayload::parse(&message.role, &message.payload) {
        CustomPayload::BashExecution(p) => {
            let mut text = format!(
                "The user ran the following command in their shell:\n$ {}\n",
                p.command
            );
            if !p.output.is_empty() {
                text.push_str(&format!("\nOutput:\n{}", p.output));
            }
            if p.was_cancelled {
                text.push_str("\n(The command was cancelled before it finished.)");
            } else if let Some(code) = p.exit_code {
                if code != 0 {
                    text.push_str(&format!("\n(Exit code: {code})"));
                }
            }
            Some(text)
        }
        CustomPayload::HookMessage(p) => Some(p.content),
        CustomPayload::BranchSummary(p) => Some(branch_summary_text(&p.summary)),
        CustomPayload::CompactionSummary(p) => Some(compaction_summary_text(&p.summary)),
        CustomPayload::Unknown(_) => None,
    }
}

/// Project the working transcript to LLM-visible messages: custom messages
/// with a defined text form become user messages, the rest are dropped.
pub fn convert_to_llm(messages: &[AgentMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            AgentMessage::Llm(m) => Some(m.clone()),
            AgentMessage::Custom(c) => custom_message_text(c).map(|text| {
                Message::User(UserMessage {
                    content: UserContent::Text(text),
                    timestamp: c.timestamp,
                })
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{BashExecutionPayload, custom_message};

    #[test]
    fn bash_execution_projects_to_user_text() {
        let payload = CustomPayload::BashExecution(BashExecutionPayload {
            command: "cargo check".to_string(),
            output: "error[E0308]".to_string(),
            exit_code: Some(101),
            duration_ms: 420,
            was_cancelled: false,
            full_output_path: None,
        });
        let messages = vec![AgentMessage::Custom(custom_message(&payload, 1000))];

        let llm = convert_to_llm(&messages);
        assert_eq!(llm.len(), 1);
        let text = llm[0].as_user().unwrap().content.as_plain_text();
        assert!(text.contains("$ cargo check"));
        assert!(text.contains("error[E0308]"));
        assert!(text.contains("Exit code: 101"));
    }

    #[test]
    fn unknown_custom_messages_are_dropped() {
        let messages = vec![
            AgentMessage::user("Hello"),
            AgentMessage::Custom(CustomMessage {
                role: "somethingElse".to_string(),
                payload: serde_json::json!({"x": 1}),
                timestamp: 0,
            }),
        ];
        let llm = convert_to_llm(&messages);
        assert_eq!(llm.len(), 1);
        assert_eq!(llm[0].role(), "user");
    }

    #[test]
    fn summaries_carry_the_delimiters() {
        let payload = CustomPayload::CompactionSummary(crate::messages::types::SummaryPayload {
            summary: "we fixed the parser".to_string(),
        });
        let messages = vec![AgentMessage::Custom(custom_message(&payload, 0))];
        let llm = convert_to_llm(&messages);
        let text = llm[0].as_user().unwrap().content.as_plain_text();
        assert!(text.starts_with("The conversation history before this point was compacted"));
        assert!(text.contains("we fixed the parser"));
    }
}
