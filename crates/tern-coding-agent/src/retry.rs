//! Classification of provider errors surfaced through the driver boundary.
//!
//! Drivers terminate a failed stream with an assistant message whose
//! `error_message` usually leads with the provider's HTTP status
//! ("429: rate limited", "529 overloaded"). Classification trusts that
//! status when present and falls back to a small set of markers; overflow
//! is checked first because it is handled by compaction, never by blind
//! retry.

use serde::{Deserialize, Serialize};

/// Knobs for transient-error retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60000,
        }
    }
}

/// What a provider failure means for the session's retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The context window was exceeded: compact, then retry once.
    ContextOverflow,
    /// Worth retrying with backoff (overload, rate limit, network hiccup).
    Transient,
    /// Retrying will not help (auth, validation, unknown).
    Fatal,
}

/// Markers that identify a context-window overflow regardless of how the
/// provider phrases the status line.
const OVERFLOW_MARKERS: [&str; 6] = [
    "context window",
    "maximum context",
    "context length",
    "prompt is too long",
    "input is too long",
    "too many tokens",
];

/// Fallback markers for transient failures reported without a status code.
const TRANSIENT_MARKERS: [&str; 7] = [
    "overloaded",
    "rate limit",
    "temporarily unavailable",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
];

/// The first plausible HTTP status in the head of the message. Only
/// standalone three-digit tokens count, so token counts like "210000" are
/// never mistaken for a status.
fn leading_status_code(message: &str) -> Option<u16> {
    let head: String = message.chars().take(64).collect();
    head.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (100..=599).contains(code))
}

pub fn classify_provider_error(message: &str) -> FailureKind {
    let lower = message.to_lowercase();

    if OVERFLOW_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::ContextOverflow;
    }

    if let Some(status) = leading_status_code(&lower) {
        return match status {
            408 | 409 | 425 | 429 | 500..=599 => FailureKind::Transient,
            _ => FailureKind::Fatal,
        };
    }

    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::Transient;
    }

    FailureKind::Fatal
}

/// Whether an error message indicates the context window was exceeded.
pub fn is_context_overflow(error_msg: &str) -> bool {
    classify_provider_error(error_msg) == FailureKind::ContextOverflow
}

/// Whether an error message indicates a failure worth retrying with backoff.
pub fn is_retryable_error(error_msg: &str) -> bool {
    classify_provider_error(error_msg) == FailureKind::Transient
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub fn calculate_delay(settings: &RetrySettings, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    settings
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(settings.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_wins_even_with_a_fatal_status() {
        // Anthropic-style 400 on an oversized prompt must route to
        // compaction, not give up.
        assert_eq!(
            classify_provider_error("400: prompt is too long: 210000 tokens > 200000 maximum"),
            FailureKind::ContextOverflow
        );
        assert_eq!(
            classify_provider_error("input exceeds the context window"),
            FailureKind::ContextOverflow
        );
        assert!(is_context_overflow("maximum context length exceeded"));
        assert!(!is_retryable_error("maximum context length exceeded"));
    }

    #[test]
    fn status_codes_drive_classification() {
        assert_eq!(
            classify_provider_error("529 overloaded, try again"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_provider_error("503: service unavailable"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_provider_error("401 unauthorized"),
            FailureKind::Fatal
        );
        assert_eq!(
            classify_provider_error("404: model not found"),
            FailureKind::Fatal
        );
    }

    #[test]
    fn token_counts_are_not_status_codes() {
        assert_eq!(leading_status_code("request used 210000 tokens"), None);
        assert_eq!(leading_status_code("429: too many requests"), Some(429));
    }

    #[test]
    fn marker_fallback_without_a_status() {
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("upstream request timed out"));
        assert!(!is_retryable_error("invalid api key"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = RetrySettings::default();
        assert_eq!(calculate_delay(&settings, 1), 2000);
        assert_eq!(calculate_delay(&settings, 2), 4000);
        assert_eq!(calculate_delay(&settings, 3), 8000);
        assert_eq!(calculate_delay(&settings, 10), 60000);
    }
}
