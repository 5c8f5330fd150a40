use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent_types::*;
use crate::driver::ModelDriver;
use crate::event_stream::EventStream;
use crate::types::*;

pub type AgentEventStream = EventStream<AgentEvent, Vec<AgentMessage>>;

/// Start a run with new prompt messages. The prompts become the first turn's
/// pending messages; events for them are emitted before the assistant streams.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: TurnContext,
    config: TurnConfig,
    driver: Arc<dyn ModelDriver>,
    cancel: CancellationToken,
) -> AgentEventStream {
    let stream = new_agent_event_stream();

    let stream_clone = stream.clone();
    tokio::spawn(async move {
        let mut context = context;
        stream_clone.push(AgentEvent::AgentStart);
        run_loop(&mut context, prompts, &config, driver, cancel, &stream_clone).await;
    });

    stream
}

/// Continue a run from the current context without a new user message.
/// Fails when the context is empty or already ends with an assistant message.
pub fn agent_loop_continue(
    context: TurnContext,
    config: TurnConfig,
    driver: Arc<dyn ModelDriver>,
    cancel: CancellationToken,
) -> Result<AgentEventStream, String> {
    if context.messages.is_empty() {
        return Err("cannot continue: no messages in context".to_string());
    }
    if let Some(last) = context.messages.last() {
        if last.role() == "assistant" {
            return Err("cannot continue from an assistant message".to_string());
        }
    }

    let stream = new_agent_event_stream();

    let stream_clone = stream.clone();
    tokio::spawn(async move {
        let mut context = context;
        stream_clone.push(AgentEvent::AgentStart);
        run_loop(&mut context, Vec::new(), &config, driver, cancel, &stream_clone).await;
    });

    Ok(stream)
}

fn new_agent_event_stream() -> AgentEventStream {
    EventStream::new(
        |event: &AgentEvent| matches!(event, AgentEvent::AgentEnd { .. }),
        |event: &AgentEvent| match event {
            AgentEvent::AgentEnd { messages } => messages.clone(),
            _ => vec![],
        },
    )
}

/// The run loop: one iteration per turn. A turn emits any pending user
/// messages, streams one assistant response, and executes its tool calls.
/// Steering drains before the next turn, follow-ups only once the run would
/// otherwise stop.
async fn run_loop(
    context: &mut TurnContext,
    prompts: Vec<AgentMessage>,
    config: &TurnConfig,
    driver: Arc<dyn ModelDriver>,
    cancel: CancellationToken,
    stream: &AgentEventStream,
) {
    let mut new_messages: Vec<AgentMessage> = Vec::new();
    let mut pending = prompts;

    loop {
        stream.push(AgentEvent::TurnStart);

        for message in pending.drain(..) {
            stream.push(AgentEvent::MessageStart {
                message: message.clone(),
            });
            stream.push(AgentEvent::MessageEnd {
                message: message.clone(),
            });
            context.messages.push(message.clone());
            new_messages.push(message);
        }

        let assistant = stream_assistant(context, config, driver.as_ref(), &cancel, stream).await;
        new_messages.push(assistant.clone().into());

        if assistant.stop_reason == StopReason::Error || assistant.stop_reason == StopReason::Aborted
        {
            // The message list must stay well-formed: any tool call that never
            // ran still gets a (synthetic, error) result.
            let tool_results =
                synthesize_unran_tool_results(&assistant, context, &mut new_messages, stream);
            stream.push(AgentEvent::TurnEnd {
                message: assistant.into(),
                tool_results,
            });
            break;
        }

        let has_tool_calls = !assistant.tool_calls().is_empty();
        let mut tool_results: Vec<ToolResultMessage> = Vec::new();
        if has_tool_calls {
            tool_results = execute_tool_calls(&context.tools, &assistant, &cancel, stream).await;
            for result in &tool_results {
                context.messages.push(result.clone().into());
                new_messages.push(result.clone().into());
            }
        }

        stream.push(AgentEvent::TurnEnd {
            message: assistant.into(),
            tool_results: tool_results.clone(),
        });

        if cancel.is_cancelled() {
            break;
        }

        // Steering messages go in front of the next assistant turn.
        pending = config.queues.dequeue_steering();
        if !tool_results.is_empty() || !pending.is_empty() {
            continue;
        }

        // The run would stop here; follow-ups start a fresh turn instead.
        pending = config.queues.dequeue_follow_up();
        if pending.is_empty() {
            break;
        }
    }

    stream.push(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
    stream.end(Some(new_messages));
}

/// Stream one assistant response, folding deltas into the context's trailing
/// message. Cancellation finalizes the partial message as `aborted` even if
/// the driver never acknowledges the token.
async fn stream_assistant(
    context: &mut TurnContext,
    config: &TurnConfig,
    driver: &dyn ModelDriver,
    cancel: &CancellationToken,
    stream: &AgentEventStream,
) -> AssistantMessage {
    let request = ModelRequest {
        system_prompt: if context.system_prompt.is_empty() {
            None
        } else {
            Some(context.system_prompt.clone())
        },
        messages: (config.convert_to_llm)(&context.messages),
        tools: context
            .tools
            .iter()
            .map(|t| t.definition().clone())
            .collect(),
        thinking_level: config.thinking_level.clamp_for(&config.model),
        api_key: config.api_key.clone(),
    };

    let response = driver.stream(&config.model, request, cancel.clone());
    let mut pinned = Box::pin(response);

    let mut partial: Option<AssistantMessage> = None;
    let mut added = false;

    let commit = |context: &mut TurnContext, message: &AssistantMessage, added: &mut bool| {
        if *added {
            let last = context.messages.len() - 1;
            context.messages[last] = message.clone().into();
        } else {
            context.messages.push(message.clone().into());
            *added = true;
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let mut message = partial.unwrap_or_else(|| AssistantMessage::empty(&config.model));
                message.stop_reason = StopReason::Aborted;
                let started = added;
                commit(context, &message, &mut added);
                if !started {
                    stream.push(AgentEvent::MessageStart { message: message.clone().into() });
                }
                stream.push(AgentEvent::MessageEnd { message: message.clone().into() });
                return message;
            }
            ev = pinned.next() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        match event {
            AssistantEvent::Start { partial: p } => {
                partial = Some(p.clone());
                commit(context, &p, &mut added);
                stream.push(AgentEvent::MessageStart { message: p.into() });
            }
            AssistantEvent::Done { message } | AssistantEvent::Error { error: message } => {
                let started = added;
                commit(context, &message, &mut added);
                if !started {
                    stream.push(AgentEvent::MessageStart {
                        message: message.clone().into(),
                    });
                }
                stream.push(AgentEvent::MessageEnd {
                    message: message.clone().into(),
                });
                return message;
            }
            delta => {
                let p = delta.partial().clone();
                partial = Some(p.clone());
                commit(context, &p, &mut added);
                stream.push(AgentEvent::MessageUpdate {
                    message: p.into(),
                    delta,
                });
            }
        }
    }

    // Driver stream closed without a terminal event.
    let mut message = partial.unwrap_or_else(|| AssistantMessage::empty(&config.model));
    message.stop_reason = if cancel.is_cancelled() {
        StopReason::Aborted
    } else {
        message.error_message = Some("model stream ended unexpectedly".to_string());
        StopReason::Error
    };
    let started = added;
    commit(context, &message, &mut added);
    if !started {
        stream.push(AgentEvent::MessageStart {
            message: message.clone().into(),
        });
    }
    stream.push(AgentEvent::MessageEnd {
        message: message.clone().into(),
    });
    message
}

/// Execute all tool calls of an assistant message as parallel tasks sharing
/// the turn's cancellation token. Start events are emitted in call order;
/// end events and result messages are committed in call order after every
/// task settles, so the transcript stays deterministic.
async fn execute_tool_calls(
    tools: &[Arc<dyn AgentTool>],
    assistant: &AssistantMessage,
    cancel: &CancellationToken,
    stream: &AgentEventStream,
) -> Vec<ToolResultMessage> {
    let calls: Vec<ToolCall> = assistant.tool_calls().into_iter().cloned().collect();

    for call in &calls {
        stream.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });
    }

    let mut handles = Vec::with_capacity(calls.len());
    for call in &calls {
        let tool = tools.iter().find(|t| t.name() == call.name).cloned();
        let call = call.clone();
        let cancel = cancel.clone();
        let updates = stream.clone();
        handles.push(tokio::spawn(async move {
            run_one_tool(tool, call, cancel, updates).await
        }));
    }

    let settled = futures::future::join_all(handles).await;

    let mut results = Vec::with_capacity(calls.len());
    for (call, joined) in calls.iter().zip(settled) {
        let (result, is_error) = joined.unwrap_or_else(|e| {
            (
                AgentToolResult::text(format!("Tool task failed: {e}")),
                true,
            )
        });

        stream.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error,
        });

        let message = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: result.content,
            details: result.details,
            is_error,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        stream.push(AgentEvent::MessageStart {
            message: message.clone().into(),
        });
        stream.push(AgentEvent::MessageEnd {
            message: message.clone().into(),
        });
        results.push(message);
    }

    results
}

async fn run_one_tool(
    tool: Option<Arc<dyn AgentTool>>,
    call: ToolCall,
    cancel: CancellationToken,
    stream: AgentEventStream,
) -> (AgentToolResult, bool) {
    let Some(tool) = tool else {
        return (
            AgentToolResult::text(format!("Tool {} not found", call.name)),
            true,
        );
    };

    let tc_id = call.id.clone();
    let tc_name = call.name.clone();
    let on_update: Option<Box<dyn Fn(AgentToolResult) + Send + Sync>> =
        Some(Box::new(move |partial_result: AgentToolResult| {
            stream.push(AgentEvent::ToolExecutionUpdate {
                tool_call_id: tc_id.clone(),
                tool_name: tc_name.clone(),
                partial_result,
            });
        }));

    // The select bounds abort latency even when a tool ignores its token.
    tokio::select! {
        result = tool.invoke(&call.id, call.arguments.clone(), cancel.clone(), on_update) => {
            match result {
                Ok(result) => (result, false),
                Err(e) => (AgentToolResult::text(e.to_string()), true),
            }
        }
        _ = cancel.cancelled() => {
            (AgentToolResult::text("Tool execution cancelled."), true)
        }
    }
}

/// Error/abort path: any tool call recorded on the terminal assistant message
/// never ran, but still needs an error result message.
fn synthesize_unran_tool_results(
    assistant: &AssistantMessage,
    context: &mut TurnContext,
    new_messages: &mut Vec<AgentMessage>,
    stream: &AgentEventStream,
) -> Vec<ToolResultMessage> {
    let reason = if assistant.stop_reason == StopReason::Aborted {
        "Tool execution cancelled."
    } else {
        "Tool was not executed because the model response failed."
    };

    let mut results = Vec::new();
    for call in assistant.tool_calls() {
        let message = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: vec![ContentBlock::text(reason)],
            details: None,
            is_error: true,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        stream.push(AgentEvent::MessageStart {
            message: message.clone().into(),
        });
        stream.push(AgentEvent::MessageEnd {
            message: message.clone().into(),
        });
        context.messages.push(message.clone().into());
        new_messages.push(message.clone().into());
        results.push(message);
    }
    results
}
