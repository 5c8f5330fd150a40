use std::sync::Arc;

use tokio::sync::mpsc;

use crate::hooks::types::{Hook, HookApi, HookCommand, HookEvent, HookOutcome};

/// A handler failure, surfaced on the error channel instead of aborting the
/// pipeline.
#[derive(Debug, Clone)]
pub struct HookError {
    pub hook: String,
    pub event: &'static str,
    pub message: String,
}

/// Registry of hooks plus the fan-out that runs them.
///
/// `emit` runs handlers in registration order. For gate events the first
/// non-null outcome wins and later handlers are skipped; errors are captured
/// per-handler onto the error channel.
pub struct HookRunner {
    hooks: Vec<Arc<dyn Hook + Send + Sync>>,
    error_tx: mpsc::UnboundedSender<HookError>,
    error_rx: Option<mpsc::UnboundedReceiver<HookError>>,
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRunner {
    pub fn new() -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            hooks: Vec::new(),
            error_tx,
            error_rx: Some(error_rx),
        }
    }

    pub fn register(&mut self, hook: Arc<dyn Hook + Send + Sync>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Commands contributed by all hooks, in registration order.
    pub fn commands(&self) -> Vec<HookCommand> {
        self.hooks.iter().flat_map(|h| h.commands()).collect()
    }

    /// Receiver for handler errors. Can be taken once.
    pub fn take_error_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<HookError>> {
        self.error_rx.take()
    }

    /// Run all handlers for an event. Returns the first non-null outcome
    /// (meaningful for gate events only).
    pub async fn emit(&self, event: &HookEvent, api: &HookApi) -> Option<HookOutcome> {
        for hook in &self.hooks {
            match hook.on_event(event, api).await {
                Ok(Some(outcome)) => {
                    if event.is_gate() {
                        return Some(outcome);
                    }
                    // Outcomes on non-gate events are ignored by design.
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        hook = hook.name(),
                        event = event.event_name(),
                        "hook handler failed: {e}"
                    );
                    let _ = self.error_tx.send(HookError {
                        hook: hook.name().to_string(),
                        event: event.event_name(),
                        message: e.to_string(),
                    });
                }
            }
        }
        None
    }
}
