pub mod agent_session;
pub mod auth;
pub mod compaction;
pub mod config;
pub mod error;
pub mod hooks;
pub mod messages;
pub mod retry;
pub mod session;
pub mod settings;
pub mod slash_commands;

// ========== Public API re-exports ==========

// Error
pub use error::TernError;

// Config
pub use config::paths;

// Session store
pub use session::context::{ModelRef, SessionContext, build_session_context};
pub use session::store::{NewSessionOptions, SessionStore};
pub use session::tree::{SessionTree, TreeNode};
pub use session::types::{CURRENT_SESSION_VERSION, SessionEntry, SessionHeader, SessionInfo};

// Settings
pub use settings::manager::SettingsManager;
pub use settings::types::Settings;

// Auth
pub use auth::storage::{AuthCredential, AuthStorage};

// AgentSession
pub use agent_session::bash::{BashResult, DEFAULT_OUTPUT_LIMIT, run_bash};
pub use agent_session::events::{CompactionReason, SessionEvent};
pub use agent_session::session::{
    AgentSession, AgentSessionOptions, CycleDirection, HookMessageOptions, PromptOptions,
    SessionStats,
};

// Hooks
pub use hooks::runner::{HookError, HookRunner};
pub use hooks::types::{
    Hook, HookAction, HookApi, HookCommand, HookDelivery, HookEvent, HookOutcome,
};

// Compaction
pub use compaction::branch_summary::{
    collect_entries_for_branch_summary, serialize_conversation, summarize_branch,
};
pub use compaction::compaction::{
    CompactionResult, CompactionSettings, Preparation, TokenEstimator, compact,
    default_token_estimator, estimate_branch_tokens, prepare_compaction, should_compact,
};

// Messages
pub use messages::convert::{convert_to_llm, custom_message_text};
pub use messages::types::{
    BRANCH_SUMMARY_PREFIX, BRANCH_SUMMARY_SUFFIX, COMPACTION_SUMMARY_PREFIX,
    COMPACTION_SUMMARY_SUFFIX, CustomPayload, branch_summary_text, compaction_summary_text,
};

// Slash commands
pub use slash_commands::{
    SlashCommandInfo, SlashCommandSource, builtin_slash_commands, command_table,
    expand_slash_command,
};

// Retry
pub use retry::{
    FailureKind, RetrySettings, calculate_delay, classify_provider_error, is_context_overflow,
    is_retryable_error,
};
