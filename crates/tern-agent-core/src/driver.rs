use tokio_util::sync::CancellationToken;

use crate::event_stream::AssistantEventStream;
use crate::types::{AssistantMessage, ContentBlock, Model, ModelRequest, StopReason};

/// The opaque LLM boundary. A driver receives a fully-built request and
/// yields a stream of assistant-message deltas ending in `Done` or `Error`.
///
/// Drivers must observe the cancellation token at every suspension point and
/// terminate the stream with an `aborted` message when it fires.
pub trait ModelDriver: Send + Sync {
    fn stream(
        &self,
        model: &Model,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> AssistantEventStream;
}

/// Await the final assistant message of a driver stream.
///
/// Works without draining the delta events: the terminal event also resolves
/// the stream's one-shot result.
pub async fn final_message(stream: &AssistantEventStream) -> Option<AssistantMessage> {
    stream.result().await
}

/// Concatenated text blocks of an assistant message.
pub fn assistant_text(message: &AssistantMessage) -> String {
    message
        .content
        .iter()
        .filter_map(|b| b.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run a one-shot completion against a driver: stream, await the final
/// message, and map error/abort terminations onto the message itself.
pub async fn complete(
    driver: &dyn ModelDriver,
    model: &Model,
    request: ModelRequest,
    cancel: CancellationToken,
) -> AssistantMessage {
    let stream = driver.stream(model, request, cancel);
    match final_message(&stream).await {
        Some(message) => message,
        None => AssistantMessage {
            content: vec![ContentBlock::text("")],
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Default::default(),
            stop_reason: StopReason::Error,
            error_message: Some("model stream ended without a final message".to_string()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    }
}
