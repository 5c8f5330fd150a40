use std::sync::Mutex;

use async_trait::async_trait;

use crate::compaction::compaction::CompactionResult;

/// Lifecycle events hooks can intercept. Events whose name starts with
/// `session_before_` (and `before_agent_start`) are gates: the first
/// non-null outcome a handler returns can cancel or override the operation.
#[derive(Debug, Clone)]
pub enum HookEvent {
    SessionStart {
        session_id: String,
    },
    SessionShutdown {
        session_id: String,
    },
    BeforeAgentStart {
        prompt: String,
    },
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    SessionBeforeSwitch {
        /// `None` when a brand-new session is being created.
        target_session_id: Option<String>,
    },
    SessionSwitch {
        session_id: String,
    },
    SessionBeforeBranch {
        entry_id: String,
    },
    SessionBranch {
        entry_id: String,
    },
    SessionBeforeTree {
        target_id: String,
    },
    SessionTree {
        target_id: String,
    },
    SessionBeforeCompact,
    SessionCompact {
        summary: String,
    },
}

impl HookEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            HookEvent::SessionStart { .. } => "session_start",
            HookEvent::SessionShutdown { .. } => "session_shutdown",
            HookEvent::BeforeAgentStart { .. } => "before_agent_start",
            HookEvent::AgentStart => "agent_start",
            HookEvent::AgentEnd => "agent_end",
            HookEvent::TurnStart => "turn_start",
            HookEvent::TurnEnd => "turn_end",
            HookEvent::SessionBeforeSwitch { .. } => "session_before_switch",
            HookEvent::SessionSwitch { .. } => "session_switch",
            HookEvent::SessionBeforeBranch { .. } => "session_before_branch",
            HookEvent::SessionBranch { .. } => "session_branch",
            HookEvent::SessionBeforeTree { .. } => "session_before_tree",
            HookEvent::SessionTree { .. } => "session_tree",
            HookEvent::SessionBeforeCompact => "session_before_compact",
            HookEvent::SessionCompact { .. } => "session_compact",
        }
    }

    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            HookEvent::BeforeAgentStart { .. }
                | HookEvent::SessionBeforeSwitch { .. }
                | HookEvent::SessionBeforeBranch { .. }
                | HookEvent::SessionBeforeTree { .. }
                | HookEvent::SessionBeforeCompact
        )
    }
}

/// What a gate handler may return. Non-gate events ignore outcomes.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// Cancel the gated operation.
    Cancel,
    /// `before_agent_start` only: a message appended after the user message.
    Message(String),
    /// `session_before_compact` only: a ready-made result replacing the
    /// engine's own model call.
    Compaction(CompactionResult),
}

/// How hook-originated messages are delivered while a turn is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDelivery {
    #[default]
    Steer,
    FollowUp,
}

/// Follow-up work a handler schedules. Actions re-enter the session through
/// the same guards as user actions; a busy session rejects them like anyone
/// else.
#[derive(Debug, Clone)]
pub enum HookAction {
    SendMessage {
        hook: String,
        content: String,
        display: bool,
        deliver_as: HookDelivery,
        trigger_turn: bool,
    },
    NewSession,
    Branch {
        entry_id: String,
    },
    NavigateTree {
        target_id: String,
        summarize: bool,
    },
}

/// The API value handed to handlers by parameter. Handlers queue actions on
/// it; the session drains and applies them after the emit returns.
#[derive(Default)]
pub struct HookApi {
    session_id: Option<String>,
    actions: Mutex<Vec<HookAction>>,
}

impl HookApi {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn send_message(
        &self,
        hook: impl Into<String>,
        content: impl Into<String>,
        display: bool,
        deliver_as: HookDelivery,
        trigger_turn: bool,
    ) {
        self.actions.lock().unwrap().push(HookAction::SendMessage {
            hook: hook.into(),
            content: content.into(),
            display,
            deliver_as,
            trigger_turn,
        });
    }

    pub fn request_new_session(&self) {
        self.actions.lock().unwrap().push(HookAction::NewSession);
    }

    pub fn request_branch(&self, entry_id: impl Into<String>) {
        self.actions.lock().unwrap().push(HookAction::Branch {
            entry_id: entry_id.into(),
        });
    }

    pub fn request_navigate_tree(&self, target_id: impl Into<String>, summarize: bool) {
        self.actions.lock().unwrap().push(HookAction::NavigateTree {
            target_id: target_id.into(),
            summarize,
        });
    }

    /// Drain the queued actions (session-side).
    pub fn take_actions(&self) -> Vec<HookAction> {
        std::mem::take(&mut self.actions.lock().unwrap())
    }
}

/// A slash command contributed by a hook. Commands with an `expansion` are
/// expanded into the prompt text; the dispatch table checks hook commands
/// before built-ins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    pub name: String,
    pub description: Option<String>,
    pub expansion: Option<String>,
}

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// An external handler registered against lifecycle events.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Slash commands this hook contributes.
    fn commands(&self) -> Vec<HookCommand> {
        Vec::new()
    }

    /// Handle an event. Gate events honor the returned outcome; errors are
    /// captured per-handler and never abort other handlers or the core.
    async fn on_event(
        &self,
        event: &HookEvent,
        api: &HookApi,
    ) -> Result<Option<HookOutcome>, DynError>;
}
