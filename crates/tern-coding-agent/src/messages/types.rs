use serde::{Deserialize, Serialize};
use serde_json::Value;

use tern_agent_core::agent_types::CustomMessage;

// ---------- Summary delimiters ----------
// Exact literals; downstream tooling matches on them.

pub const COMPACTION_SUMMARY_PREFIX: &str = "The conversation history before this point was compacted into the following summary:\n\n<summary>\n";
pub const COMPACTION_SUMMARY_SUFFIX: &str = "\n</summary>";

pub const BRANCH_SUMMARY_PREFIX: &str =
    "The following is a summary of a branch that this conversation came back from:\n\n<summary>\n";
pub const BRANCH_SUMMARY_SUFFIX: &str = "</summary>";

pub fn compaction_summary_text(summary: &str) -> String {
    format!("{COMPACTION_SUMMARY_PREFIX}{summary}{COMPACTION_SUMMARY_SUFFIX}")
}

pub fn branch_summary_text(summary: &str) -> String {
    format!("{BRANCH_SUMMARY_PREFIX}{summary}{BRANCH_SUMMARY_SUFFIX}")
}

// ---------- Custom message roles ----------

pub mod custom_role {
    pub const BASH_EXECUTION: &str = "bashExecution";
    pub const HOOK_MESSAGE: &str = "hookMessage";
    pub const BRANCH_SUMMARY: &str = "branchSummary";
    pub const COMPACTION_SUMMARY: &str = "compactionSummary";
}

// ---------- Typed payloads for the known roles ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashExecutionPayload {
    pub command: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub was_cancelled: bool,
    /// Path of the side file holding the full output when it was truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookMessagePayload {
    pub hook: String,
    pub content: String,
    pub display: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    pub summary: String,
}

/// The known custom-message payloads, plus an opaque bag for everything else.
/// Unknown payloads round-trip untouched and are never introspected.
#[derive(Debug, Clone)]
pub enum CustomPayload {
    BashExecution(BashExecutionPayload),
    HookMessage(HookMessagePayload),
    BranchSummary(SummaryPayload),
    CompactionSummary(SummaryPayload),
    Unknown(Value),
}

impl CustomPayload {
    /// Parse a role-tagged payload. Unrecognized roles and payloads that
    /// fail to parse land in `Unknown`.
    pub fn parse(role: &str, payload: &Value) -> CustomPayload {
        let parsed = match role {
            custom_role::BASH_EXECUTION => serde_json::from_value(payload.clone())
                .map(CustomPayload::BashExecution)
                .ok(),
            custom_role::HOOK_MESSAGE => serde_json::from_value(payload.clone())
                .map(CustomPayload::HookMessage)
                .ok(),
            custom_role::BRANCH_SUMMARY => serde_json::from_value(payload.clone())
                .map(CustomPayload::BranchSummary)
                .ok(),
            custom_role::COMPACTION_SUMMARY => serde_json::from_value(payload.clone())
                .map(CustomPayload::CompactionSummary)
                .ok(),
            _ => None,
        };
        parsed.unwrap_or_else(|| CustomPayload::Unknown(payload.clone()))
    }

    pub fn role(&self) -> &str {
        match self {
            CustomPayload::BashExecution(_) => custom_role::BASH_EXECUTION,
            CustomPayload::HookMessage(_) => custom_role::HOOK_MESSAGE,
            CustomPayload::BranchSummary(_) => custom_role::BRANCH_SUMMARY,
            CustomPayload::CompactionSummary(_) => custom_role::COMPACTION_SUMMARY,
            CustomPayload::Unknown(_) => "unknown",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            CustomPayload::BashExecution(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            CustomPayload::HookMessage(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            CustomPayload::BranchSummary(p) | CustomPayload::CompactionSummary(p) => {
                serde_json::to_value(p).unwrap_or(Value::Null)
            }
            CustomPayload::Unknown(v) => v.clone(),
        }
    }
}

/// Wrap a typed payload into the core's role-tagged custom message.
pub fn custom_message(payload: &CustomPayload, timestamp: i64) -> CustomMessage {
    CustomMessage {
        role: payload.role().to_string(),
        payload: payload.to_value(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters_are_the_published_literals() {
        let text = compaction_summary_text("S");
        assert!(text.starts_with(
            "The conversation history before this point was compacted into the following summary:"
        ));
        assert!(text.ends_with("<summary>\nS\n</summary>"));

        let text = branch_summary_text("S");
        assert!(text.starts_with(
            "The following is a summary of a branch that this conversation came back from:"
        ));
        // The branch form has no newline before the closing tag.
        assert!(text.ends_with("<summary>\nS</summary>"));
    }

    #[test]
    fn parse_known_role() {
        let payload = serde_json::json!({
            "command": "ls",
            "output": "a.txt",
            "exitCode": 0,
            "durationMs": 12,
            "wasCancelled": false,
        });
        match CustomPayload::parse(custom_role::BASH_EXECUTION, &payload) {
            CustomPayload::BashExecution(p) => {
                assert_eq!(p.command, "ls");
                assert_eq!(p.exit_code, Some(0));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_role_round_trips_untouched() {
        let payload = serde_json::json!({"anything": ["goes", 1, null]});
        let parsed = CustomPayload::parse("somethingElse", &payload);
        assert!(matches!(parsed, CustomPayload::Unknown(_)));
        assert_eq!(parsed.to_value(), payload);
    }
}
