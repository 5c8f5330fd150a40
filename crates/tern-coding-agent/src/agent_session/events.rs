use tern_agent_core::agent_types::AgentEvent;

use crate::compaction::compaction::CompactionResult;

/// Why an automatic compaction ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// Projected tokens crossed `context_window - reserve_tokens` before a
    /// turn was sent.
    Threshold,
    /// The provider reported a context overflow mid-turn.
    Overflow,
}

/// Events on the public session channel: every agent event, re-emitted, plus
/// session-level lifecycle.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Agent(AgentEvent),

    AutoCompactionStart {
        reason: CompactionReason,
    },
    AutoCompactionEnd {
        aborted: bool,
        error: Option<String>,
    },
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error_message: String,
    },
    AutoRetryEnd {
        attempt: u32,
        success: bool,
    },

    SessionStart {
        session_id: String,
        is_new: bool,
    },
    SessionSwitch {
        session_id: String,
    },
    SessionBranch {
        entry_id: String,
    },
    SessionTree {
        target_id: String,
    },
    SessionCompact {
        result: CompactionResult,
    },
    ModelChange {
        provider: String,
        model_id: String,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::Agent(e) => e.event_type(),
            SessionEvent::AutoCompactionStart { .. } => "auto_compaction_start",
            SessionEvent::AutoCompactionEnd { .. } => "auto_compaction_end",
            SessionEvent::AutoRetryStart { .. } => "auto_retry_start",
            SessionEvent::AutoRetryEnd { .. } => "auto_retry_end",
            SessionEvent::SessionStart { .. } => "session_start",
            SessionEvent::SessionSwitch { .. } => "session_switch",
            SessionEvent::SessionBranch { .. } => "session_branch",
            SessionEvent::SessionTree { .. } => "session_tree",
            SessionEvent::SessionCompact { .. } => "session_compact",
            SessionEvent::ModelChange { .. } => "model_change",
        }
    }
}
