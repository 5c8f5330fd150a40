use serde::{Deserialize, Serialize};

use tern_agent_core::agent_types::{FollowUpMode, QueueMode};

use crate::compaction::compaction::CompactionSettings;
use crate::retry::RetrySettings;

/// Persisted settings (`settings.json`). Everything has a default so a
/// missing file means default behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub compaction: CompactionSettings,
    pub retry: RetrySettings,
    pub steering_mode: QueueMode,
    pub follow_up_mode: FollowUpMode,
    /// Default model id selected at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Cap on bash output carried in the conversation, in bytes.
    pub bash_output_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            compaction: CompactionSettings::default(),
            retry: RetrySettings::default(),
            steering_mode: QueueMode::default(),
            follow_up_mode: FollowUpMode::default(),
            default_model: None,
            bash_output_limit: crate::agent_session::bash::DEFAULT_OUTPUT_LIMIT,
        }
    }
}
