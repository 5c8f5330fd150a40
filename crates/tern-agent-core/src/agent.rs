use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{AgentEventStream, agent_loop, agent_loop_continue};
use crate::agent_types::*;
use crate::driver::ModelDriver;
use crate::types::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentCoreError {
    #[error("agent is already streaming")]
    Busy,
    #[error("agent is idle")]
    Idle,
    #[error("no model configured")]
    NoModel,
    #[error("{0}")]
    Invalid(String),
}

pub struct AgentOptions {
    pub system_prompt: String,
    pub model: Option<Model>,
    pub thinking_level: ThinkingLevel,
    pub tools: Vec<Arc<dyn AgentTool>>,
    pub messages: Vec<AgentMessage>,
    pub steering_mode: QueueMode,
    pub follow_up_mode: FollowUpMode,
    pub convert_to_llm: Option<Arc<ConvertToLlmFn>>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: None,
            thinking_level: ThinkingLevel::Off,
            tools: Vec::new(),
            messages: Vec::new(),
            steering_mode: QueueMode::OneAtATime,
            follow_up_mode: FollowUpMode::OneAtATime,
            convert_to_llm: None,
        }
    }
}

struct CoreState {
    system_prompt: String,
    model: Option<Model>,
    thinking_level: ThinkingLevel,
    tools: Vec<Arc<dyn AgentTool>>,
    messages: Vec<AgentMessage>,
    is_streaming: bool,
    last_error: Option<String>,
}

/// The turn-loop owner. One agent runs at most one streaming turn at a time;
/// `steer`, `follow_up` and `abort` are safe to call from other tasks while a
/// run is in flight because the queues and the cancel slot live behind shared
/// handles the loop also holds.
pub struct Agent {
    state: Arc<Mutex<CoreState>>,
    queues: QueueHandles,
    driver: Arc<dyn ModelDriver>,
    api_key: Mutex<Option<String>>,
    convert_to_llm: Arc<ConvertToLlmFn>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
    running_watch: tokio::sync::watch::Sender<bool>,
}

impl Agent {
    pub fn new(driver: Arc<dyn ModelDriver>, opts: AgentOptions) -> Self {
        let queues = QueueHandles::default();
        *queues.steering_mode.lock().unwrap() = opts.steering_mode;
        *queues.follow_up_mode.lock().unwrap() = opts.follow_up_mode;

        Agent {
            state: Arc::new(Mutex::new(CoreState {
                system_prompt: opts.system_prompt,
                model: opts.model,
                thinking_level: opts.thinking_level,
                tools: opts.tools,
                messages: opts.messages,
                is_streaming: false,
                last_error: None,
            })),
            queues,
            driver,
            api_key: Mutex::new(None),
            convert_to_llm: opts
                .convert_to_llm
                .unwrap_or_else(|| Arc::new(default_convert_to_llm)),
            cancel: Arc::new(Mutex::new(None)),
            running_watch: tokio::sync::watch::Sender::new(false),
        }
    }

    // ---------- Accessors ----------

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().is_streaming
    }

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn model(&self) -> Option<Model> {
        self.state.lock().unwrap().model.clone()
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.state.lock().unwrap().thinking_level
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    pub fn steering_mode(&self) -> QueueMode {
        *self.queues.steering_mode.lock().unwrap()
    }

    pub fn follow_up_mode(&self) -> FollowUpMode {
        *self.queues.follow_up_mode.lock().unwrap()
    }

    pub fn queued_message_count(&self) -> usize {
        self.queues.steering.lock().unwrap().len() + self.queues.follow_up.lock().unwrap().len()
    }

    // ---------- Mutators ----------

    pub fn set_system_prompt(&self, prompt: String) {
        self.state.lock().unwrap().system_prompt = prompt;
    }

    /// Set the model, clamping the thinking level to its capabilities.
    pub fn set_model(&self, model: Model) {
        let mut state = self.state.lock().unwrap();
        state.thinking_level = state.thinking_level.clamp_for(&model);
        state.model = Some(model);
    }

    /// Set the thinking level, clamped to the current model's capabilities.
    pub fn set_thinking_level(&self, level: ThinkingLevel) -> ThinkingLevel {
        let mut state = self.state.lock().unwrap();
        let effective = match &state.model {
            Some(model) => level.clamp_for(model),
            None => level,
        };
        state.thinking_level = effective;
        effective
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn AgentTool>>) {
        self.state.lock().unwrap().tools = tools;
    }

    pub fn set_api_key(&self, api_key: Option<String>) {
        *self.api_key.lock().unwrap() = api_key;
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        *self.queues.steering_mode.lock().unwrap() = mode;
    }

    pub fn set_follow_up_mode(&self, mode: FollowUpMode) {
        *self.queues.follow_up_mode.lock().unwrap() = mode;
    }

    /// Replace the working transcript. Forbidden while streaming.
    pub fn replace_messages(&self, messages: Vec<AgentMessage>) -> Result<(), AgentCoreError> {
        let mut state = self.state.lock().unwrap();
        if state.is_streaming {
            return Err(AgentCoreError::Busy);
        }
        state.messages = messages;
        Ok(())
    }

    /// Out-of-band insert. Forbidden while streaming.
    pub fn append_message(&self, message: AgentMessage) -> Result<(), AgentCoreError> {
        let mut state = self.state.lock().unwrap();
        if state.is_streaming {
            return Err(AgentCoreError::Busy);
        }
        state.messages.push(message);
        Ok(())
    }

    /// Insert a synthetic custom message regardless of the streaming flag.
    /// Only the session uses this, at points where the turn loop is not
    /// between a tool call and its result.
    pub fn append_custom_at_safe_point(&self, message: CustomMessage) {
        self.state
            .lock()
            .unwrap()
            .messages
            .push(AgentMessage::Custom(message));
    }

    // ---------- Queues ----------

    /// Queue a message to be inserted before the next assistant turn.
    /// Valid only while streaming.
    pub fn steer(&self, message: AgentMessage) -> Result<(), AgentCoreError> {
        if !self.is_streaming() {
            return Err(AgentCoreError::Idle);
        }
        self.queues.push_steering(message);
        Ok(())
    }

    /// Queue a message to run as a fresh turn after the current run finishes.
    /// Valid only while streaming.
    pub fn follow_up(&self, message: AgentMessage) -> Result<(), AgentCoreError> {
        if !self.is_streaming() {
            return Err(AgentCoreError::Idle);
        }
        self.queues.push_follow_up(message);
        Ok(())
    }

    /// Drain both queues, returning (steering, follow-up).
    pub fn clear_queues(&self) -> (Vec<AgentMessage>, Vec<AgentMessage>) {
        let steering = std::mem::take(&mut *self.queues.steering.lock().unwrap());
        let follow_up = std::mem::take(&mut *self.queues.follow_up.lock().unwrap());
        (steering, follow_up)
    }

    /// Cancel the in-flight run and discard queued messages.
    pub fn abort(&self) {
        self.queues.clear();
        if let Some(token) = self.cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Resolve once no run is in flight.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.running_watch.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    // ---------- Runs ----------

    /// Start a run with the given user message(s). Returns the event stream
    /// for this run; the caller is its sole consumer.
    pub fn prompt(&self, messages: Vec<AgentMessage>) -> Result<AgentEventStream, AgentCoreError> {
        if messages.is_empty() {
            return Err(AgentCoreError::Invalid("no prompt messages".to_string()));
        }
        self.start_run(Some(messages))
    }

    pub fn prompt_text(&self, text: impl Into<String>) -> Result<AgentEventStream, AgentCoreError> {
        self.prompt(vec![AgentMessage::user(text)])
    }

    /// Begin a new turn without a user message. If the transcript ends with
    /// an assistant message, queued steering or follow-up messages are used
    /// as the prompt instead.
    pub fn continue_turn(&self) -> Result<AgentEventStream, AgentCoreError> {
        {
            let state = self.state.lock().unwrap();
            if state.is_streaming {
                return Err(AgentCoreError::Busy);
            }
            if state.messages.is_empty() {
                return Err(AgentCoreError::Invalid(
                    "no messages to continue from".to_string(),
                ));
            }
        }

        if self
            .state
            .lock()
            .unwrap()
            .messages
            .last()
            .is_some_and(|m| m.role() == "assistant")
        {
            let steering = self.queues.dequeue_steering();
            if !steering.is_empty() {
                return self.start_run(Some(steering));
            }
            let follow_up = self.queues.dequeue_follow_up();
            if !follow_up.is_empty() {
                return self.start_run(Some(follow_up));
            }
            return Err(AgentCoreError::Invalid(
                "cannot continue from an assistant message".to_string(),
            ));
        }

        self.start_run(None)
    }

    fn start_run(
        &self,
        prompts: Option<Vec<AgentMessage>>,
    ) -> Result<AgentEventStream, AgentCoreError> {
        let (context, config, cancel) = {
            let mut state = self.state.lock().unwrap();
            if state.is_streaming {
                return Err(AgentCoreError::Busy);
            }
            let model = state.model.clone().ok_or(AgentCoreError::NoModel)?;

            state.is_streaming = true;
            state.last_error = None;

            let cancel = CancellationToken::new();
            let context = TurnContext {
                system_prompt: state.system_prompt.clone(),
                messages: state.messages.clone(),
                tools: state.tools.clone(),
            };
            let config = TurnConfig {
                model,
                thinking_level: state.thinking_level,
                api_key: self.api_key.lock().unwrap().clone(),
                convert_to_llm: self.convert_to_llm.clone(),
                queues: self.queues.clone(),
            };
            (context, config, cancel)
        };

        *self.cancel.lock().unwrap() = Some(cancel.clone());
        let _ = self.running_watch.send(true);

        let stream = match prompts {
            Some(p) => agent_loop(p, context, config, self.driver.clone(), cancel),
            None => {
                match agent_loop_continue(context, config, self.driver.clone(), cancel) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let mut state = self.state.lock().unwrap();
                        state.is_streaming = false;
                        *self.cancel.lock().unwrap() = None;
                        let _ = self.running_watch.send(false);
                        return Err(AgentCoreError::Invalid(e));
                    }
                }
            }
        };

        // Supervisor: commit the run's new messages when it settles. The
        // one-shot result resolves independently of event consumption.
        let state = self.state.clone();
        let cancel_slot = self.cancel.clone();
        let watch = self.running_watch.clone();
        let result_stream = stream.clone();
        tokio::spawn(async move {
            let new_messages = result_stream.result().await.unwrap_or_default();
            {
                let mut st = state.lock().unwrap();
                for message in &new_messages {
                    if let AgentMessage::Llm(Message::Assistant(a)) = message {
                        if let Some(err) = &a.error_message {
                            st.last_error = Some(err.clone());
                        }
                    }
                }
                st.messages.extend(new_messages);
                st.is_streaming = false;
            }
            *cancel_slot.lock().unwrap() = None;
            let _ = watch.send(false);
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_stream::{AssistantEventStream, new_assistant_event_stream};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{Value, json};

    fn test_model() -> Model {
        Model {
            id: "stub-1".into(),
            name: "Stub".into(),
            provider: "stub".into(),
            reasoning: true,
            xhigh: false,
            cost: ModelCost::default(),
            context_window: 200_000,
            max_tokens: 8192,
        }
    }

    /// Driver that replays a scripted list of responses, one per call.
    struct ScriptedDriver {
        responses: Mutex<Vec<AssistantMessage>>,
    }

    impl ScriptedDriver {
        fn new(responses: Vec<AssistantMessage>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn text_response(text: &str) -> AssistantMessage {
            AssistantMessage {
                content: vec![ContentBlock::text(text)],
                provider: "stub".into(),
                model: "stub-1".into(),
                usage: Usage::default(),
                stop_reason: StopReason::Complete,
                error_message: None,
                timestamp: 0,
            }
        }

        fn tool_call_response(id: &str, name: &str, args: Value) -> AssistantMessage {
            AssistantMessage {
                content: vec![ContentBlock::ToolCall(ToolCall {
                    id: id.into(),
                    name: name.into(),
                    arguments: args,
                })],
                provider: "stub".into(),
                model: "stub-1".into(),
                usage: Usage::default(),
                stop_reason: StopReason::ToolCalls,
                error_message: None,
                timestamp: 0,
            }
        }
    }

    impl ModelDriver for ScriptedDriver {
        fn stream(
            &self,
            model: &Model,
            _request: ModelRequest,
            _cancel: CancellationToken,
        ) -> AssistantEventStream {
            let stream = new_assistant_event_stream();
            let mut responses = self.responses.lock().unwrap();
            let message = if responses.is_empty() {
                ScriptedDriver::text_response("(script exhausted)")
            } else {
                responses.remove(0)
            };
            let mut start = AssistantMessage::empty(model);
            start.timestamp = 0;
            stream.push(AssistantEvent::Start { partial: start });
            stream.push(AssistantEvent::TextDelta {
                content_index: 0,
                delta: String::new(),
                partial: message.clone(),
            });
            stream.push(AssistantEvent::Done { message });
            stream
        }
    }

    /// Driver that never finishes until cancelled.
    struct HangingDriver;

    impl ModelDriver for HangingDriver {
        fn stream(
            &self,
            model: &Model,
            _request: ModelRequest,
            cancel: CancellationToken,
        ) -> AssistantEventStream {
            let stream = new_assistant_event_stream();
            let out = stream.clone();
            let mut partial = AssistantMessage::empty(model);
            partial.timestamp = 0;
            tokio::spawn(async move {
                out.push(AssistantEvent::Start {
                    partial: partial.clone(),
                });
                cancel.cancelled().await;
                // Leave termination to the loop's own abort handling.
            });
            stream
        }
    }

    struct EchoTool {
        definition: Tool,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                definition: Tool {
                    name: "read".into(),
                    description: "Read a file.".into(),
                    parameters: json!({"type": "object"}),
                },
            }
        }
    }

    #[async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "read"
        }

        fn definition(&self) -> &Tool {
            &self.definition
        }

        async fn invoke(
            &self,
            _tool_call_id: &str,
            _args: Value,
            _cancel: CancellationToken,
            _on_update: Option<Box<dyn Fn(AgentToolResult) + Send + Sync>>,
        ) -> Result<AgentToolResult, Box<dyn std::error::Error + Send + Sync>> {
            Ok(AgentToolResult::text("contents"))
        }
    }

    async fn drain(stream: AgentEventStream) -> Vec<&'static str> {
        let mut pinned = Box::pin(stream);
        let mut types = Vec::new();
        while let Some(event) = pinned.next().await {
            types.push(event.event_type());
        }
        types
    }

    #[tokio::test]
    async fn simple_turn_event_order() {
        let driver = Arc::new(ScriptedDriver::new(vec![ScriptedDriver::text_response(
            "hello",
        )]));
        let agent = Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                ..Default::default()
            },
        );

        let stream = agent.prompt_text("hi").unwrap();
        let types = drain(stream).await;
        agent.wait_for_idle().await;

        assert_eq!(
            types,
            vec![
                "agent_start",
                "turn_start",
                "message_start", // user
                "message_end",
                "message_start", // assistant
                "message_update",
                "message_end",
                "turn_end",
                "agent_end",
            ]
        );
        assert!(!agent.is_streaming());
        assert_eq!(agent.messages().len(), 2);
    }

    #[tokio::test]
    async fn tool_call_runs_second_turn() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            ScriptedDriver::tool_call_response("call_1", "read", json!({"path": "a.txt"})),
            ScriptedDriver::text_response("done"),
        ]));
        let agent = Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                tools: vec![Arc::new(EchoTool::new())],
                ..Default::default()
            },
        );

        let stream = agent.prompt_text("read it").unwrap();
        let types = drain(stream).await;
        agent.wait_for_idle().await;

        assert_eq!(types.iter().filter(|t| **t == "turn_start").count(), 2);
        assert!(types.contains(&"tool_execution_start"));
        assert!(types.contains(&"tool_execution_end"));

        // user, assistant(tool call), tool result, assistant(final)
        let messages = agent.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role(), "toolResult");
        let final_msg = messages[3].as_message().unwrap().as_assistant().unwrap();
        assert_eq!(final_msg.stop_reason, StopReason::Complete);
    }

    #[tokio::test]
    async fn busy_guard_rejects_second_prompt() {
        let driver = Arc::new(HangingDriver);
        let agent = Arc::new(Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                ..Default::default()
            },
        ));

        let stream = agent.prompt_text("hi").unwrap();
        assert_eq!(agent.prompt_text("again").unwrap_err(), AgentCoreError::Busy);

        agent.abort();
        drain(stream).await;
        agent.wait_for_idle().await;
        assert!(!agent.is_streaming());
    }

    #[tokio::test]
    async fn abort_finalizes_assistant_as_aborted_and_clears_queues() {
        let driver = Arc::new(HangingDriver);
        let agent = Arc::new(Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                ..Default::default()
            },
        ));

        let stream = agent.prompt_text("hi").unwrap();
        tokio::task::yield_now().await;
        agent.steer(AgentMessage::user("queued")).unwrap();
        agent.abort();

        drain(stream).await;
        agent.wait_for_idle().await;

        let messages = agent.messages();
        let assistant = messages
            .iter()
            .filter_map(|m| m.as_message().and_then(|m| m.as_assistant()))
            .next_back()
            .expect("assistant message");
        assert_eq!(assistant.stop_reason, StopReason::Aborted);
        assert_eq!(agent.queued_message_count(), 0);
    }

    #[tokio::test]
    async fn steer_inserts_before_next_turn() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            ScriptedDriver::tool_call_response("call_1", "read", json!({"path": "a.txt"})),
            ScriptedDriver::text_response("considering X"),
        ]));
        let agent = Arc::new(Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                tools: vec![Arc::new(EchoTool::new())],
                ..Default::default()
            },
        ));

        let stream = agent.prompt_text("go").unwrap();
        // The streaming flag is set synchronously by prompt(); queue the
        // steering message before the loop task gets to run.
        agent.steer(AgentMessage::user("also consider X")).unwrap();

        drain(stream).await;
        agent.wait_for_idle().await;

        let messages = agent.messages();
        let steer_idx = messages
            .iter()
            .position(|m| m.user_text().as_deref() == Some("also consider X"))
            .expect("steering message present");
        let final_assistant_idx = messages.len() - 1;
        assert!(steer_idx < final_assistant_idx);
    }

    #[tokio::test]
    async fn steer_rejected_when_idle() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let agent = Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                ..Default::default()
            },
        );
        assert_eq!(
            agent.steer(AgentMessage::user("x")).unwrap_err(),
            AgentCoreError::Idle
        );
    }

    #[tokio::test]
    async fn replace_messages_guarded_while_streaming() {
        let driver = Arc::new(HangingDriver);
        let agent = Arc::new(Agent::new(
            driver,
            AgentOptions {
                model: Some(test_model()),
                ..Default::default()
            },
        ));

        let stream = agent.prompt_text("hi").unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            agent.replace_messages(vec![]).unwrap_err(),
            AgentCoreError::Busy
        );

        agent.abort();
        drain(stream).await;
        agent.wait_for_idle().await;
        assert!(agent.replace_messages(vec![]).is_ok());
    }

    #[tokio::test]
    async fn no_model_is_an_error() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let agent = Agent::new(driver, AgentOptions::default());
        assert_eq!(
            agent.prompt_text("hi").unwrap_err(),
            AgentCoreError::NoModel
        );
    }
}
