use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use tern_agent_core::agent::{Agent, AgentCoreError, AgentOptions};
use tern_agent_core::agent_loop::AgentEventStream;
use tern_agent_core::agent_types::{
    AgentEvent, AgentMessage, AgentTool, CustomMessage, FollowUpMode, QueueMode,
};
use tern_agent_core::driver::ModelDriver;
use tern_agent_core::types::{
    ContentBlock, ImageContent, Message, Model, StopReason, ThinkingLevel, UserContent, UserMessage,
};

use crate::agent_session::bash::{BashResult, OnChunk, run_bash};
use crate::agent_session::events::{CompactionReason, SessionEvent};
use crate::auth::storage::AuthStorage;
use crate::compaction::branch_summary::{collect_entries_for_branch_summary, summarize_branch};
use crate::compaction::compaction::{
    CompactionResult, TokenEstimator, compact, default_token_estimator, prepare_compaction,
    should_compact,
};
use crate::config::paths;
use crate::error::TernError;
use crate::hooks::runner::{HookError, HookRunner};
use crate::hooks::types::{Hook, HookAction, HookApi, HookDelivery, HookEvent, HookOutcome};
use crate::messages::convert::convert_to_llm;
use crate::messages::types::{
    BashExecutionPayload, CustomPayload, HookMessagePayload, custom_message,
};
use crate::retry;
use crate::session::store::{NewSessionOptions, SessionStore};
use crate::session::types::SessionEntry;
use crate::settings::types::Settings;
use crate::slash_commands::{command_table, expand_slash_command};

const SESSION_EVENT_CAPACITY: usize = 256;

fn map_core(err: AgentCoreError) -> TernError {
    match err {
        AgentCoreError::Busy => TernError::Busy,
        AgentCoreError::NoModel => TernError::NoModel,
        AgentCoreError::Idle => {
            TernError::Session("operation requires an active stream".to_string())
        }
        AgentCoreError::Invalid(m) => TernError::Session(m),
    }
}

/// Options for constructing an `AgentSession`.
pub struct AgentSessionOptions {
    pub base_dir: PathBuf,
    pub cwd: PathBuf,
    /// Persist the session to `sessions/<id>.jsonl`; otherwise in-memory.
    pub persist: bool,
    pub system_prompt: String,
    pub tools: Vec<Arc<dyn AgentTool>>,
    /// The model catalogue `cycle_model` walks.
    pub models: Vec<Model>,
    pub model: Option<Model>,
    pub thinking_level: ThinkingLevel,
    pub settings: Settings,
    pub hooks: Vec<Arc<dyn Hook + Send + Sync>>,
    pub token_estimator: Option<TokenEstimator>,
}

impl Default for AgentSessionOptions {
    fn default() -> Self {
        Self {
            base_dir: paths::DEFAULT_BASE_DIR.clone(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            persist: true,
            system_prompt: String::new(),
            tools: Vec::new(),
            models: Vec::new(),
            model: None,
            thinking_level: ThinkingLevel::Off,
            settings: Settings::default(),
            hooks: Vec::new(),
            token_estimator: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub expand_slash_commands: bool,
    pub images: Vec<ImageContent>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            expand_slash_commands: true,
            images: Vec::new(),
        }
    }
}

/// Options for `send_hook_message`.
#[derive(Debug, Clone, Default)]
pub struct HookMessageOptions {
    pub display: bool,
    pub deliver_as: HookDelivery,
    /// When idle, start a turn with the hook message as the user message.
    pub trigger_turn: bool,
}

/// Aggregates over the active branch.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub message_count: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_results: usize,
    pub compactions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_cost: f64,
}

/// Direction for `cycle_model` / `cycle_thinking_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Next,
    Previous,
}

/// The top-level orchestrator: one agent, one store, one hook runner, one
/// compaction engine, glued together under the session's concurrency guards.
///
/// All state-changing operations observe the streaming flag; `steer`,
/// `follow_up` and the abort family are the only mutations legal mid-turn.
/// Compaction, branch summaries and bash runs each own an independent
/// cancellation token.
pub struct AgentSession {
    agent: Agent,
    driver: Arc<dyn ModelDriver>,
    store: Mutex<SessionStore>,
    hooks: HookRunner,
    hook_errors: Mutex<Option<mpsc::UnboundedReceiver<HookError>>>,
    auth: Arc<AuthStorage>,
    settings: Mutex<Settings>,
    models: Vec<Model>,
    estimator: TokenEstimator,
    events: broadcast::Sender<SessionEvent>,
    base_dir: PathBuf,
    cwd: PathBuf,
    persist: bool,

    compaction_cancel: Mutex<Option<CancellationToken>>,
    branch_summary_cancel: Mutex<Option<CancellationToken>>,
    bash_cancel: Mutex<Option<CancellationToken>>,

    /// User-visible queued texts, parallel to the agent's internal queues.
    pending_steering: Mutex<Vec<String>>,
    pending_follow_up: Mutex<Vec<String>>,

    /// Bash-execution messages produced while a turn was streaming, held
    /// until `agent_end`.
    buffered_custom: Mutex<Vec<CustomMessage>>,
}

impl AgentSession {
    pub fn new(
        driver: Arc<dyn ModelDriver>,
        options: AgentSessionOptions,
    ) -> Result<Self, TernError> {
        let store = if options.persist {
            SessionStore::create(
                &paths::sessions_dir(&options.base_dir),
                NewSessionOptions {
                    cwd: Some(options.cwd.display().to_string()),
                    parent_session: None,
                },
            )?
        } else {
            SessionStore::in_memory()
        };

        let model = options.model.clone().or_else(|| {
            options
                .settings
                .default_model
                .as_ref()
                .and_then(|id| options.models.iter().find(|m| &m.id == id).cloned())
        });

        let agent = Agent::new(
            driver.clone(),
            AgentOptions {
                system_prompt: options.system_prompt,
                model,
                thinking_level: options.thinking_level,
                tools: options.tools,
                steering_mode: options.settings.steering_mode,
                follow_up_mode: options.settings.follow_up_mode,
                convert_to_llm: Some(Arc::new(|msgs| convert_to_llm(msgs))),
                ..Default::default()
            },
        );

        let mut hooks = HookRunner::new();
        for hook in options.hooks {
            hooks.register(hook);
        }
        let hook_errors = hooks.take_error_receiver();

        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Ok(Self {
            agent,
            driver,
            store: Mutex::new(store),
            hooks,
            hook_errors: Mutex::new(hook_errors),
            auth: Arc::new(AuthStorage::new(&options.base_dir)),
            settings: Mutex::new(options.settings),
            models: options.models,
            estimator: options
                .token_estimator
                .unwrap_or_else(default_token_estimator),
            events,
            base_dir: options.base_dir,
            cwd: options.cwd,
            persist: options.persist,
            compaction_cancel: Mutex::new(None),
            branch_summary_cancel: Mutex::new(None),
            bash_cancel: Mutex::new(None),
            pending_steering: Mutex::new(Vec::new()),
            pending_follow_up: Mutex::new(Vec::new()),
            buffered_custom: Mutex::new(Vec::new()),
        })
    }

    // ---------- Accessors ----------

    pub fn session_id(&self) -> String {
        self.store.lock().unwrap().session_id().to_string()
    }

    pub fn is_streaming(&self) -> bool {
        self.agent.is_streaming()
    }

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.agent.messages()
    }

    pub fn model(&self) -> Option<Model> {
        self.agent.model()
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.agent.thinking_level()
    }

    pub fn store(&self) -> MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap()
    }

    pub fn auth(&self) -> &AuthStorage {
        &self.auth
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn steering_messages(&self) -> Vec<String> {
        self.pending_steering.lock().unwrap().clone()
    }

    pub fn follow_up_messages(&self) -> Vec<String> {
        self.pending_follow_up.lock().unwrap().clone()
    }

    pub fn pending_message_count(&self) -> usize {
        self.pending_steering.lock().unwrap().len() + self.pending_follow_up.lock().unwrap().len()
    }

    /// Subscribe to the session event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Receiver for hook handler errors. Can be taken once.
    pub fn take_hook_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<HookError>> {
        self.hook_errors.lock().unwrap().take()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ---------- Lifecycle ----------

    /// Announce session start to hooks and the event channel.
    pub async fn start(&self) {
        let session_id = self.session_id();
        self.emit(SessionEvent::SessionStart {
            session_id: session_id.clone(),
            is_new: true,
        });
        self.emit_hook(HookEvent::SessionStart { session_id }).await;
    }

    /// Announce shutdown to hooks.
    pub async fn shutdown(&self) {
        let session_id = self.session_id();
        self.emit_hook(HookEvent::SessionShutdown { session_id })
            .await;
    }

    // ---------- Hook plumbing ----------

    async fn emit_hook(&self, event: HookEvent) -> Option<HookOutcome> {
        if self.hooks.is_empty() {
            return None;
        }
        let api = HookApi::new(Some(self.session_id()));
        let outcome = self.hooks.emit(&event, &api).await;
        self.apply_hook_actions(api).await;
        outcome
    }

    /// Apply actions hooks queued on their API. Each re-enters through the
    /// public guards; a busy session rejects them like any caller. The
    /// futures are boxed because these operations emit hooks themselves.
    ///
    /// Declared with an explicit `BoxFuture` return (rather than `async fn`)
    /// so the recursive call through `HookAction::NewSession` doesn't force
    /// the compiler into an unresolvable cycle while proving `Send`.
    fn apply_hook_actions<'a>(&'a self, api: HookApi) -> BoxFuture<'a, ()> {
        async move {
            for action in api.take_actions() {
                let fut: BoxFuture<'_, Result<(), TernError>> = match action {
                    HookAction::SendMessage {
                        hook,
                        content,
                        display,
                        deliver_as,
                        trigger_turn,
                    } => async move {
                        self.send_hook_message(
                            &hook,
                            &content,
                            HookMessageOptions {
                                display,
                                deliver_as,
                                trigger_turn,
                            },
                        )
                        .await
                    }
                    .boxed(),
                    HookAction::NewSession => async move {
                        self.new_session(NewSessionOptions::default())
                            .await
                            .map(|_| ())
                    }
                    .boxed(),
                    HookAction::Branch { entry_id } => {
                        async move { self.branch(&entry_id).await }.boxed()
                    }
                    HookAction::NavigateTree {
                        target_id,
                        summarize,
                    } => {
                        async move { self.navigate_tree(&target_id, summarize, None).await }.boxed()
                    }
                };
                if let Err(e) = fut.await {
                    tracing::warn!("hook-requested action failed: {e}");
                }
            }
        }
        .boxed()
    }

    // ---------- Prompting ----------

    /// Send a user prompt: expand slash commands (unless disabled), attach
    /// image blocks, run the `before_agent_start` gate, then drive the turn
    /// loop with auto-compaction and auto-retry around it.
    pub async fn prompt(&self, text: &str, options: PromptOptions) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }

        let expanded = if options.expand_slash_commands {
            let table = command_table(&self.hooks.commands());
            expand_slash_command(text, &table).unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        };

        let content = if options.images.is_empty() {
            UserContent::Text(expanded.clone())
        } else {
            let mut blocks = vec![ContentBlock::text(expanded.clone())];
            blocks.extend(options.images.into_iter().map(ContentBlock::Image));
            UserContent::Blocks(blocks)
        };
        let user_message = Message::User(UserMessage {
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        let mut prompts: Vec<AgentMessage> = vec![user_message.into()];

        match self
            .emit_hook(HookEvent::BeforeAgentStart { prompt: expanded })
            .await
        {
            Some(HookOutcome::Cancel) => return Err(TernError::Cancelled),
            Some(HookOutcome::Message(text)) => {
                let payload = CustomPayload::HookMessage(HookMessagePayload {
                    hook: "before_agent_start".to_string(),
                    content: text,
                    display: true,
                });
                prompts.push(AgentMessage::Custom(custom_message(
                    &payload,
                    chrono::Utc::now().timestamp_millis(),
                )));
            }
            _ => {}
        }

        self.run_prompts(Some(prompts)).await
    }

    /// Begin a new turn without a user message.
    pub async fn continue_turn(&self) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        self.run_prompts(None).await
    }

    /// The run driver: threshold compaction up front, then the turn loop,
    /// then the explicit retry state machine — one compact-and-continue for
    /// overflow, backoff retries for transient provider failures.
    async fn run_prompts(&self, prompts: Option<Vec<AgentMessage>>) -> Result<(), TernError> {
        self.maybe_auto_compact(CompactionReason::Threshold).await;

        let mut prompts = prompts;
        let mut transient_attempt: u32 = 0;
        let mut overflow_retried = false;

        loop {
            if let Some(model) = self.agent.model() {
                self.agent
                    .set_api_key(self.auth.get_api_key(&model.provider));
            }

            let stream = match prompts.take() {
                Some(p) => self.agent.prompt(p).map_err(map_core)?,
                None => self.agent.continue_turn().map_err(map_core)?,
            };

            self.consume_run(stream).await;
            self.agent.wait_for_idle().await;

            let Some(error) = self.agent.last_error() else {
                if transient_attempt > 0 || overflow_retried {
                    self.emit(SessionEvent::AutoRetryEnd {
                        attempt: transient_attempt.max(1),
                        success: true,
                    });
                }
                return Ok(());
            };

            let settings = self.settings();

            if retry::is_context_overflow(&error) && !overflow_retried {
                overflow_retried = true;
                self.emit(SessionEvent::AutoRetryStart {
                    attempt: 1,
                    max_attempts: 1,
                    delay_ms: 0,
                    error_message: error.clone(),
                });
                self.maybe_auto_compact(CompactionReason::Overflow).await;
                self.sync_agent_from_store()?;
                continue;
            }

            if settings.retry.enabled
                && transient_attempt < settings.retry.max_retries
                && retry::is_retryable_error(&error)
            {
                transient_attempt += 1;
                let delay_ms = retry::calculate_delay(&settings.retry, transient_attempt);
                self.emit(SessionEvent::AutoRetryStart {
                    attempt: transient_attempt,
                    max_attempts: settings.retry.max_retries,
                    delay_ms,
                    error_message: error.clone(),
                });
                tracing::warn!(
                    attempt = transient_attempt,
                    delay_ms,
                    error = %error,
                    "retrying after transient provider error"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                self.sync_agent_from_store()?;
                continue;
            }

            if transient_attempt > 0 || overflow_retried {
                self.emit(SessionEvent::AutoRetryEnd {
                    attempt: transient_attempt.max(1),
                    success: false,
                });
            }
            return Err(TernError::Provider(error));
        }
    }

    /// Consume one run's events: persist at message boundaries, maintain the
    /// visible queues, fan out to hooks and the session channel. Store
    /// appends happen before the event is re-emitted, so subscribers observe
    /// committed state.
    async fn consume_run(&self, stream: AgentEventStream) {
        let mut pinned = Box::pin(stream);
        while let Some(event) = pinned.next().await {
            match &event {
                AgentEvent::AgentStart => {
                    self.emit_hook(HookEvent::AgentStart).await;
                }
                AgentEvent::TurnStart => {
                    self.emit_hook(HookEvent::TurnStart).await;
                }
                AgentEvent::TurnEnd { .. } => {
                    self.emit_hook(HookEvent::TurnEnd).await;
                }
                AgentEvent::MessageStart { message } => {
                    if let Some(text) = message.user_text() {
                        self.remove_pending(&text);
                    }
                }
                AgentEvent::MessageEnd { message } => {
                    if let Err(e) = self.persist_message(message) {
                        tracing::warn!("failed to persist message: {e}");
                    }
                }
                AgentEvent::AgentEnd { .. } => {
                    self.flush_buffered_custom();
                    self.emit_hook(HookEvent::AgentEnd).await;
                }
                _ => {}
            }
            self.emit(SessionEvent::Agent(event));
        }
    }

    fn remove_pending(&self, text: &str) {
        let mut steering = self.pending_steering.lock().unwrap();
        if let Some(pos) = steering.iter().position(|t| t == text) {
            steering.remove(pos);
            return;
        }
        drop(steering);
        let mut follow_up = self.pending_follow_up.lock().unwrap();
        if let Some(pos) = follow_up.iter().position(|t| t == text) {
            follow_up.remove(pos);
        }
    }

    /// Terminal messages land in the store. Aborted and errored assistant
    /// messages stay in the in-memory transcript only.
    fn persist_message(&self, message: &AgentMessage) -> Result<(), TernError> {
        let mut store = self.store.lock().unwrap();
        match message {
            AgentMessage::Llm(Message::Assistant(a)) => {
                if a.stop_reason == StopReason::Aborted || a.stop_reason == StopReason::Error {
                    return Ok(());
                }
                store.append_message(Message::Assistant(a.clone()))?;
            }
            AgentMessage::Llm(m) => {
                store.append_message(m.clone())?;
            }
            AgentMessage::Custom(c) => {
                let display = match CustomPayload::parse(&c.role, &c.payload) {
                    CustomPayload::HookMessage(p) => p.display,
                    _ => true,
                };
                store.append_custom_message(&c.role, c.payload.clone(), display, None)?;
            }
        }
        Ok(())
    }

    fn flush_buffered_custom(&self) {
        let buffered: Vec<CustomMessage> =
            std::mem::take(&mut *self.buffered_custom.lock().unwrap());
        for message in buffered {
            if let Err(e) = self.persist_message(&AgentMessage::Custom(message.clone())) {
                tracing::warn!("failed to persist buffered message: {e}");
            }
            self.agent.append_custom_at_safe_point(message);
        }
    }

    // ---------- Queues ----------

    /// Queue a steering message; it is inserted before the next assistant
    /// turn. Valid only while streaming.
    pub fn steer(&self, text: &str) -> Result<(), TernError> {
        self.agent
            .steer(AgentMessage::user(text))
            .map_err(map_core)?;
        self.pending_steering.lock().unwrap().push(text.to_string());
        Ok(())
    }

    /// Queue a follow-up message; it starts a fresh turn once the current
    /// run finishes. Valid only while streaming.
    pub fn follow_up(&self, text: &str) -> Result<(), TernError> {
        self.agent
            .follow_up(AgentMessage::user(text))
            .map_err(map_core)?;
        self.pending_follow_up
            .lock()
            .unwrap()
            .push(text.to_string());
        Ok(())
    }

    /// Drop all queued messages, returning (steering, follow-up) texts.
    pub fn clear_queue(&self) -> (Vec<String>, Vec<String>) {
        self.agent.clear_queues();
        let steering = std::mem::take(&mut *self.pending_steering.lock().unwrap());
        let follow_up = std::mem::take(&mut *self.pending_follow_up.lock().unwrap());
        (steering, follow_up)
    }

    /// Cancel the in-flight turn. Queued messages are discarded.
    pub fn abort(&self) {
        self.agent.abort();
        self.pending_steering.lock().unwrap().clear();
        self.pending_follow_up.lock().unwrap().clear();
    }

    pub fn abort_compaction(&self) {
        if let Some(token) = self.compaction_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn abort_branch_summary(&self) {
        if let Some(token) = self.branch_summary_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn abort_bash(&self) {
        if let Some(token) = self.bash_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    // ---------- Hook messages ----------

    /// Route hook-originated content. While streaming it goes through the
    /// agent's queues; when idle it lands in the store (and optionally
    /// triggers a turn).
    pub async fn send_hook_message(
        &self,
        hook: &str,
        content: &str,
        options: HookMessageOptions,
    ) -> Result<(), TernError> {
        let payload = CustomPayload::HookMessage(HookMessagePayload {
            hook: hook.to_string(),
            content: content.to_string(),
            display: options.display,
        });
        let message = custom_message(&payload, chrono::Utc::now().timestamp_millis());

        if self.agent.is_streaming() {
            match options.deliver_as {
                HookDelivery::Steer => {
                    self.agent
                        .steer(AgentMessage::Custom(message))
                        .map_err(map_core)?;
                    self.pending_steering
                        .lock()
                        .unwrap()
                        .push(content.to_string());
                }
                HookDelivery::FollowUp => {
                    self.agent
                        .follow_up(AgentMessage::Custom(message))
                        .map_err(map_core)?;
                    self.pending_follow_up
                        .lock()
                        .unwrap()
                        .push(content.to_string());
                }
            }
            return Ok(());
        }

        if options.trigger_turn {
            return self
                .run_prompts(Some(vec![AgentMessage::Custom(message)]))
                .await;
        }

        self.persist_message(&AgentMessage::Custom(message.clone()))?;
        self.agent.append_custom_at_safe_point(message);
        Ok(())
    }

    // ---------- Bash ----------

    /// Run a shell command outside the turn, under the session's bash
    /// cancellation token. The resulting `bashExecution` message is buffered
    /// while a turn is streaming and committed at `agent_end`.
    pub async fn execute_bash(
        &self,
        command: &str,
        on_chunk: Option<OnChunk>,
    ) -> Result<BashResult, TernError> {
        let cancel = CancellationToken::new();
        *self.bash_cancel.lock().unwrap() = Some(cancel.clone());

        let limit = self.settings().bash_output_limit;
        let side_dir = paths::bash_output_dir(&self.base_dir);
        let result = run_bash(command, &self.cwd, cancel, limit, Some(&side_dir), on_chunk).await;

        *self.bash_cancel.lock().unwrap() = None;
        let result = result?;

        let payload = CustomPayload::BashExecution(BashExecutionPayload {
            command: command.to_string(),
            output: result.output.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            was_cancelled: result.was_cancelled,
            full_output_path: result
                .full_output_path
                .as_ref()
                .map(|p| p.display().to_string()),
        });
        let message = custom_message(&payload, chrono::Utc::now().timestamp_millis());

        if self.agent.is_streaming() {
            self.buffered_custom.lock().unwrap().push(message);
        } else {
            self.persist_message(&AgentMessage::Custom(message.clone()))?;
            self.agent.append_custom_at_safe_point(message);
        }

        Ok(result)
    }

    // ---------- Compaction ----------

    async fn maybe_auto_compact(&self, reason: CompactionReason) {
        let settings = self.settings();
        if !settings.compaction.enabled {
            return;
        }

        if reason == CompactionReason::Threshold {
            let Some(model) = self.agent.model() else {
                return;
            };
            let over_budget = {
                let store = self.store.lock().unwrap();
                let branch = store.get_branch();
                should_compact(
                    &branch,
                    model.context_window,
                    &settings.compaction,
                    &self.estimator,
                )
            };
            if !over_budget {
                return;
            }
        }

        self.emit(SessionEvent::AutoCompactionStart { reason });
        match self.compact_inner(None).await {
            Ok(_) => self.emit(SessionEvent::AutoCompactionEnd {
                aborted: false,
                error: None,
            }),
            Err(TernError::Cancelled) => self.emit(SessionEvent::AutoCompactionEnd {
                aborted: true,
                error: None,
            }),
            Err(e) => {
                tracing::warn!("auto-compaction failed: {e}");
                self.emit(SessionEvent::AutoCompactionEnd {
                    aborted: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    /// Manually compact the conversation.
    pub async fn compact(
        &self,
        custom_instructions: Option<&str>,
    ) -> Result<CompactionResult, TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        let result = self.compact_inner(custom_instructions).await?;
        Ok(result)
    }

    async fn compact_inner(
        &self,
        custom_instructions: Option<&str>,
    ) -> Result<CompactionResult, TernError> {
        // The gate may cancel the run or supply its own result.
        match self.emit_hook(HookEvent::SessionBeforeCompact).await {
            Some(HookOutcome::Cancel) => return Err(TernError::Cancelled),
            Some(HookOutcome::Compaction(result)) => {
                self.apply_compaction(&result, Some(true))?;
                self.emit_hook(HookEvent::SessionCompact {
                    summary: result.summary.clone(),
                })
                .await;
                self.emit(SessionEvent::SessionCompact {
                    result: result.clone(),
                });
                return Ok(result);
            }
            _ => {}
        }

        let model = self.agent.model().ok_or(TernError::NoModel)?;
        let settings = self.settings();

        let preparation = {
            let store = self.store.lock().unwrap();
            let branch = store.get_branch();
            prepare_compaction(&branch, &settings.compaction, &self.estimator)
        }
        .ok_or(TernError::NothingToCompact)?;

        let cancel = CancellationToken::new();
        *self.compaction_cancel.lock().unwrap() = Some(cancel.clone());
        let api_key = self.auth.get_api_key(&model.provider);

        let result = compact(
            &preparation,
            self.driver.as_ref(),
            &model,
            api_key,
            custom_instructions,
            cancel,
        )
        .await;

        *self.compaction_cancel.lock().unwrap() = None;
        let result = result?;

        self.apply_compaction(&result, None)?;
        self.emit_hook(HookEvent::SessionCompact {
            summary: result.summary.clone(),
        })
        .await;
        self.emit(SessionEvent::SessionCompact {
            result: result.clone(),
        });
        Ok(result)
    }

    fn apply_compaction(
        &self,
        result: &CompactionResult,
        from_hook: Option<bool>,
    ) -> Result<(), TernError> {
        {
            let mut store = self.store.lock().unwrap();
            store.append_compaction(
                result.summary.clone(),
                result.first_kept_entry_id.clone(),
                result.tokens_before,
                result.details.clone(),
                from_hook,
            )?;
        }
        self.sync_agent_from_store()
    }

    // ---------- Session operations ----------

    /// Rebuild the agent's transcript, model and thinking level from the
    /// store's active branch.
    fn sync_agent_from_store(&self) -> Result<(), TernError> {
        let context = self.store.lock().unwrap().build_session_context();
        self.agent
            .replace_messages(context.messages)
            .map_err(map_core)?;
        if let Some(model_ref) = context.model {
            if let Some(model) = self
                .models
                .iter()
                .find(|m| m.id == model_ref.model_id && m.provider == model_ref.provider)
            {
                self.agent.set_model(model.clone());
            }
        }
        self.agent.set_thinking_level(context.thinking_level);
        Ok(())
    }

    /// Start a fresh session. The current model and thinking level are
    /// re-recorded on the new branch so the file is self-describing.
    pub async fn new_session(&self, options: NewSessionOptions) -> Result<String, TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        if let Some(HookOutcome::Cancel) = self
            .emit_hook(HookEvent::SessionBeforeSwitch {
                target_session_id: None,
            })
            .await
        {
            return Err(TernError::Cancelled);
        }

        let new_store = if self.persist {
            SessionStore::create(
                &paths::sessions_dir(&self.base_dir),
                NewSessionOptions {
                    cwd: Some(self.cwd.display().to_string()),
                    ..options
                },
            )?
        } else {
            SessionStore::in_memory()
        };
        let session_id = new_store.session_id().to_string();

        {
            let mut store = self.store.lock().unwrap();
            *store = new_store;
            if let Some(model) = self.agent.model() {
                store.append_model_change(&model.provider, &model.id)?;
            }
            store.append_thinking_level_change(self.agent.thinking_level())?;
        }
        self.agent.replace_messages(Vec::new()).map_err(map_core)?;

        self.emit(SessionEvent::SessionStart {
            session_id: session_id.clone(),
            is_new: true,
        });
        self.emit_hook(HookEvent::SessionStart {
            session_id: session_id.clone(),
        })
        .await;
        Ok(session_id)
    }

    /// Switch to a previously persisted session and resync the agent from
    /// its branch.
    pub async fn switch_session(&self, session_id: &str) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        if let Some(HookOutcome::Cancel) = self
            .emit_hook(HookEvent::SessionBeforeSwitch {
                target_session_id: Some(session_id.to_string()),
            })
            .await
        {
            return Err(TernError::Cancelled);
        }

        let new_store = SessionStore::open(&paths::sessions_dir(&self.base_dir), session_id)?;
        *self.store.lock().unwrap() = new_store;
        self.sync_agent_from_store()?;

        self.emit(SessionEvent::SessionSwitch {
            session_id: session_id.to_string(),
        });
        self.emit_hook(HookEvent::SessionSwitch {
            session_id: session_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Rewind the active branch to just before a user message. The entry's
    /// subtree is preserved; the next prompt becomes its sibling.
    pub async fn branch(&self, entry_id: &str) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        if let Some(HookOutcome::Cancel) = self
            .emit_hook(HookEvent::SessionBeforeBranch {
                entry_id: entry_id.to_string(),
            })
            .await
        {
            return Err(TernError::Cancelled);
        }

        {
            let mut store = self.store.lock().unwrap();
            let entry = store
                .get_entry(entry_id)
                .ok_or_else(|| TernError::InvalidEntry(entry_id.to_string()))?;
            if !entry.is_user_message() {
                return Err(TernError::InvalidEntry(format!(
                    "{entry_id}: branching requires a user message entry"
                )));
            }
            match entry.parent_id().map(str::to_string) {
                Some(parent) => store.branch(&parent)?,
                None => store.reset_leaf(),
            }
        }
        self.sync_agent_from_store()?;

        self.emit(SessionEvent::SessionBranch {
            entry_id: entry_id.to_string(),
        });
        self.emit_hook(HookEvent::SessionBranch {
            entry_id: entry_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Move the leaf to an arbitrary tree node, optionally summarizing the
    /// branch being abandoned into a synthetic entry at the new location.
    pub async fn navigate_tree(
        &self,
        target_id: &str,
        summarize: bool,
        custom_instructions: Option<&str>,
    ) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        if let Some(HookOutcome::Cancel) = self
            .emit_hook(HookEvent::SessionBeforeTree {
                target_id: target_id.to_string(),
            })
            .await
        {
            return Err(TernError::Cancelled);
        }

        let old_leaf = {
            let store = self.store.lock().unwrap();
            if store.get_entry(target_id).is_none() {
                return Err(TernError::InvalidEntry(target_id.to_string()));
            }
            store.leaf_id().map(str::to_string)
        };

        if old_leaf.as_deref() == Some(target_id) {
            return Ok(());
        }

        let abandoned = match (&old_leaf, summarize) {
            (Some(old), true) => {
                let store = self.store.lock().unwrap();
                collect_entries_for_branch_summary(&store, old, target_id)
            }
            _ => Vec::new(),
        };

        if !abandoned.is_empty() {
            let model = self.agent.model().ok_or(TernError::NoModel)?;
            let cancel = CancellationToken::new();
            *self.branch_summary_cancel.lock().unwrap() = Some(cancel.clone());
            let api_key = self.auth.get_api_key(&model.provider);

            let summary = summarize_branch(
                self.driver.as_ref(),
                &model,
                api_key,
                &abandoned,
                custom_instructions,
                cancel,
            )
            .await;
            *self.branch_summary_cancel.lock().unwrap() = None;

            let summary = summary?;
            self.store
                .lock()
                .unwrap()
                .branch_with_summary(Some(target_id), summary, None, None)?;
        } else {
            self.store.lock().unwrap().branch(target_id)?;
        }

        self.sync_agent_from_store()?;

        self.emit(SessionEvent::SessionTree {
            target_id: target_id.to_string(),
        });
        self.emit_hook(HookEvent::SessionTree {
            target_id: target_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Split a new session file off at an entry, copying its ancestors, and
    /// switch to it.
    pub async fn branch_to_new_session(&self, entry_id: &str) -> Result<String, TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        if let Some(HookOutcome::Cancel) = self
            .emit_hook(HookEvent::SessionBeforeSwitch {
                target_session_id: None,
            })
            .await
        {
            return Err(TernError::Cancelled);
        }

        let new_store = self
            .store
            .lock()
            .unwrap()
            .create_branched_session(entry_id)?;
        let session_id = new_store.session_id().to_string();
        *self.store.lock().unwrap() = new_store;
        self.sync_agent_from_store()?;

        self.emit(SessionEvent::SessionStart {
            session_id: session_id.clone(),
            is_new: true,
        });
        self.emit_hook(HookEvent::SessionStart {
            session_id: session_id.clone(),
        })
        .await;
        Ok(session_id)
    }

    // ---------- Model & thinking level ----------

    /// Select a model. Recorded on the branch; the thinking level is clamped
    /// to the new model's capabilities.
    pub fn set_model(&self, model: Model) -> Result<(), TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        self.store
            .lock()
            .unwrap()
            .append_model_change(&model.provider, &model.id)?;
        self.emit(SessionEvent::ModelChange {
            provider: model.provider.clone(),
            model_id: model.id.clone(),
        });
        self.agent.set_model(model);
        Ok(())
    }

    /// Step through the configured model catalogue.
    pub fn cycle_model(&self, direction: CycleDirection) -> Result<Model, TernError> {
        if self.models.is_empty() {
            return Err(TernError::NoModel);
        }
        let current = self.agent.model();
        let index = current
            .as_ref()
            .and_then(|m| self.models.iter().position(|c| c.id == m.id))
            .unwrap_or(0);
        let next = match direction {
            CycleDirection::Next => (index + 1) % self.models.len(),
            CycleDirection::Previous => (index + self.models.len() - 1) % self.models.len(),
        };
        let model = self.models[next].clone();
        self.set_model(model.clone())?;
        Ok(model)
    }

    /// Set the thinking level (clamped to the model). Returns the effective
    /// level recorded on the branch.
    pub fn set_thinking_level(&self, level: ThinkingLevel) -> Result<ThinkingLevel, TernError> {
        if self.agent.is_streaming() {
            return Err(TernError::Busy);
        }
        let effective = self.agent.set_thinking_level(level);
        self.store
            .lock()
            .unwrap()
            .append_thinking_level_change(effective)?;
        Ok(effective)
    }

    /// Step to the next level the current model supports.
    pub fn cycle_thinking_level(&self) -> Result<ThinkingLevel, TernError> {
        let levels: Vec<ThinkingLevel> = match self.agent.model() {
            Some(model) if model.reasoning => ThinkingLevel::ALL
                .into_iter()
                .filter(|l| *l != ThinkingLevel::Xhigh || model.xhigh)
                .collect(),
            _ => vec![ThinkingLevel::Off],
        };
        let current = self.agent.thinking_level();
        let index = levels.iter().position(|l| *l == current).unwrap_or(0);
        self.set_thinking_level(levels[(index + 1) % levels.len()])
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        self.agent.set_steering_mode(mode);
        self.settings.lock().unwrap().steering_mode = mode;
    }

    pub fn set_follow_up_mode(&self, mode: FollowUpMode) {
        self.agent.set_follow_up_mode(mode);
        self.settings.lock().unwrap().follow_up_mode = mode;
    }

    /// Set (or clear) the session's display name.
    pub fn set_session_name(&self, name: Option<String>) -> Result<(), TernError> {
        self.store.lock().unwrap().append_session_info(name)?;
        Ok(())
    }

    pub fn session_name(&self) -> Option<String> {
        self.store.lock().unwrap().session_name()
    }

    // ---------- Stats ----------

    /// Aggregates over the active branch.
    pub fn get_session_stats(&self) -> SessionStats {
        let store = self.store.lock().unwrap();
        let mut stats = SessionStats::default();

        for entry in store.get_branch() {
            match entry {
                SessionEntry::Message { message, .. } => {
                    stats.message_count += 1;
                    match message {
                        Message::User(_) => stats.user_messages += 1,
                        Message::Assistant(a) => {
                            stats.assistant_messages += 1;
                            stats.input_tokens += a.usage.input;
                            stats.output_tokens += a.usage.output;
                            stats.cache_read_tokens += a.usage.cache_read;
                            stats.cache_write_tokens += a.usage.cache_write;
                            stats.total_cost += a.usage.cost;
                        }
                        Message::ToolResult(_) => stats.tool_results += 1,
                    }
                }
                SessionEntry::CustomMessage { .. } => stats.message_count += 1,
                SessionEntry::Compaction { .. } => stats.compactions += 1,
                _ => {}
            }
        }

        stats
    }
}
