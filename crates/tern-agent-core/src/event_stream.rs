use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::types::{AssistantEvent, AssistantMessage};

/// A push-based event stream with a one-shot final result, backed by an
/// unbounded channel.
///
/// Producers `push` from any task; the consumer polls the stream side. The
/// first event matching `is_terminal` resolves `result()` with the value
/// extracted from it and drops the shared sender slot — closing the channel,
/// so the consumer sees the remaining queued events and then `None`. Events
/// pushed after that point go nowhere.
pub struct EventStream<T, R> {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<T>>>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    result_sender: Arc<Mutex<Option<oneshot::Sender<R>>>>,
    result_receiver: Arc<tokio::sync::Mutex<Option<oneshot::Receiver<R>>>>,
    is_terminal: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    extract_result: Arc<dyn Fn(&T) -> R + Send + Sync>,
}

impl<T, R> std::fmt::Debug for EventStream<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            result_sender: self.result_sender.clone(),
            result_receiver: self.result_receiver.clone(),
            is_terminal: self.is_terminal.clone(),
            extract_result: self.extract_result.clone(),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> EventStream<T, R> {
    pub fn new(
        is_terminal: impl Fn(&T) -> bool + Send + Sync + 'static,
        extract_result: impl Fn(&T) -> R + Send + Sync + 'static,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        Self {
            sender: Arc::new(Mutex::new(Some(event_tx))),
            receiver: Arc::new(Mutex::new(event_rx)),
            result_sender: Arc::new(Mutex::new(Some(result_tx))),
            result_receiver: Arc::new(tokio::sync::Mutex::new(Some(result_rx))),
            is_terminal: Arc::new(is_terminal),
            extract_result: Arc::new(extract_result),
        }
    }

    /// Push an event. The terminal event closes the stream; anything pushed
    /// afterwards is dropped.
    pub fn push(&self, event: T) {
        let mut slot = self.sender.lock().unwrap();
        let Some(sender) = slot.as_ref() else {
            return;
        };

        let terminal = (self.is_terminal)(&event);
        if terminal {
            if let Some(result_sender) = self.result_sender.lock().unwrap().take() {
                let _ = result_sender.send((self.extract_result)(&event));
            }
        }
        let _ = sender.send(event);
        if terminal {
            // Dropping the only sender closes the channel behind the queued
            // events.
            *slot = None;
        }
    }

    pub fn is_done(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    /// Close the stream, optionally delivering a final result. Ending
    /// without one leaves `result()` resolving to `None`.
    pub fn end(&self, result: Option<R>) {
        *self.sender.lock().unwrap() = None;
        let result_sender = self.result_sender.lock().unwrap().take();
        if let (Some(result), Some(result_sender)) = (result, result_sender) {
            let _ = result_sender.send(result);
        }
    }

    /// Await the stream's final result. Resolves as soon as the terminal
    /// event is pushed, independently of event consumption. Returns `None`
    /// if the stream ended without a result or the result was already taken.
    pub async fn result(&self) -> Option<R> {
        let receiver = self.result_receiver.lock().await.take()?;
        receiver.await.ok()
    }
}

impl<T: Send + 'static, R: Send + 'static> Stream for EventStream<T, R> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.lock().unwrap().poll_recv(cx)
    }
}

// ---------- AssistantEventStream ----------

/// The stream a `ModelDriver` produces for one assistant response.
pub type AssistantEventStream = EventStream<AssistantEvent, AssistantMessage>;

pub fn new_assistant_event_stream() -> AssistantEventStream {
    EventStream::new(
        |event: &AssistantEvent| event.is_terminal(),
        |event: &AssistantEvent| match event {
            AssistantEvent::Done { message } => message.clone(),
            AssistantEvent::Error { error } => error.clone(),
            _ => unreachable!("non-terminal event extracted as result"),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use futures::StreamExt;

    fn message() -> AssistantMessage {
        AssistantMessage {
            content: vec![ContentBlock::text("Hello")],
            provider: "test".to_string(),
            model: "test".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Complete,
            error_message: None,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn push_then_consume() {
        let stream = new_assistant_event_stream();
        let msg = message();

        let producer = stream.clone();
        let m = msg.clone();
        tokio::spawn(async move {
            producer.push(AssistantEvent::Start { partial: m.clone() });
            producer.push(AssistantEvent::TextDelta {
                content_index: 0,
                delta: "Hel".to_string(),
                partial: m.clone(),
            });
            producer.push(AssistantEvent::Done { message: m });
        });

        let mut pinned = Box::pin(stream.clone());
        let mut count = 0;
        while pinned.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn result_resolves_on_done() {
        let stream = new_assistant_event_stream();
        stream.push(AssistantEvent::Done { message: message() });
        let result = stream.result().await.expect("result");
        assert_eq!(result.model, "test");
        // Consumed: a second call yields None.
        assert!(stream.result().await.is_none());
    }

    #[tokio::test]
    async fn result_resolves_without_draining_events() {
        let stream = new_assistant_event_stream();
        let msg = message();
        stream.push(AssistantEvent::Start {
            partial: msg.clone(),
        });
        stream.push(AssistantEvent::Done { message: msg });

        // No consumer has polled the stream side yet.
        assert!(stream.result().await.is_some());

        // The queued events are still delivered afterwards.
        let mut pinned = Box::pin(stream.clone());
        let mut count = 0;
        while pinned.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn end_without_result_resolves_none() {
        let stream = new_assistant_event_stream();
        stream.end(None);
        assert!(stream.result().await.is_none());
    }

    #[tokio::test]
    async fn push_after_done_is_dropped() {
        let stream = new_assistant_event_stream();
        let msg = message();
        stream.push(AssistantEvent::Done { message: msg.clone() });
        stream.push(AssistantEvent::Start { partial: msg });
        assert!(stream.is_done());

        let mut pinned = Box::pin(stream.clone());
        let mut count = 0;
        while pinned.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
