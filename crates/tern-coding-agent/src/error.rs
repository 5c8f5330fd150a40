use thiserror::Error;

/// Error kinds of the session layer. Operations return these as tagged
/// results; cancellation and context overflow are ordinary variants, never
/// unwinds.
#[derive(Debug, Error)]
pub enum TernError {
    #[error("operation requires an idle session")]
    Busy,

    #[error("no model configured")]
    NoModel,

    #[error("no API key for provider: {0}")]
    NoApiKey(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("nothing to compact")]
    NothingToCompact,

    #[error("context window exceeded")]
    ProviderOverflow,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session error: {0}")]
    Session(String),
}

impl TernError {
    /// Stable kind tag, used by RPC surfaces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TernError::Busy => "busy",
            TernError::NoModel => "no_model",
            TernError::NoApiKey(_) => "no_api_key",
            TernError::InvalidEntry(_) => "invalid_entry",
            TernError::Cancelled => "cancelled",
            TernError::NothingToCompact => "nothing_to_compact",
            TernError::ProviderOverflow => "provider_overflow",
            TernError::Provider(_) => "provider_error",
            TernError::Io(_) => "io",
            TernError::Json(_) => "io",
            TernError::Session(_) => "session",
        }
    }
}
