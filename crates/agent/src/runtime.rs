//! The streaming turn loop.
//!
//! Entry point: [`AgentRuntime::run_turn`]. One turn walks
//! `START → CHECK_CONTEXT → CALL_PROVIDER → STREAM → (TOOL_DISPATCH →
//! POST_TOOL_CALL)` and finishes with exactly one `agent.turn_complete`.
//! Stream errors route through the fallback chain, retry backoff, and auth
//! rotation before surfacing as `agent.error`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use valet_domain::error::{Error, Result};
use valet_domain::message::{Message, ToolCall};
use valet_domain::stream::ProviderChunk;
use valet_events::{Event, EventBus, EventKind};
use valet_providers::auth::RotationManager;
use valet_providers::classifier::{classify, is_retryable, ErrorCategory};
use valet_providers::fallback::FallbackChain;
use valet_providers::registry::{build_provider, parse_model_id, ProviderOptions};
use valet_providers::{ChatRequest, LlmProvider};
use valet_sessions::{Session, SessionStore};
use valet_tools::ToolRegistry;

use crate::cancel::{CancelToken, RunRegistry};
use crate::compact::{
    check_context, compact, default_target_tokens, estimate_messages_tokens, CompactionStrategy,
};
use crate::queue::QueueManager;
use crate::thinking::{ThinkingExtractor, ThinkingMode};

/// Source string carried on every runtime event.
const SOURCE: &str = "agent-runtime";

/// Retry backoff cap in seconds.
const MAX_BACKOFF_SECS: u64 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration and request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Primary model as "provider/model".
    pub model: String,
    /// Fallback models tried in order on failover-eligible errors.
    pub fallback_models: Vec<String>,
    pub thinking_mode: ThinkingMode,
    pub compaction_strategy: CompactionStrategy,
    pub max_retries: u32,
    pub max_tokens: Option<u32>,
    /// Explicit API key; overrides env lookup and auth rotation.
    pub api_key: Option<String>,
    /// Base URL override (required for unknown vendors).
    pub base_url: Option<String>,
    pub enable_compaction: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4".into(),
            fallback_models: Vec::new(),
            thinking_mode: ThinkingMode::Off,
            compaction_strategy: CompactionStrategy::default(),
            max_retries: 3,
            max_tokens: None,
            api_key: None,
            base_url: None,
            enable_compaction: true,
        }
    }
}

/// Input to a single turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub images: Vec<String>,
    /// Injected as the session's first message when the session is empty.
    pub system_prompt: Option<String>,
    /// Caller-assigned run id; generated when absent.
    pub run_id: Option<String>,
    /// Queue-level bound; expiry cancels the turn.
    pub timeout: Option<Duration>,
}

/// What a finished turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub run_id: String,
    pub text: String,
    pub cancelled: bool,
}

enum StreamOutcome {
    Complete(String),
    Cancelled(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Seam for provider construction; tests swap in scripted stubs.
pub type ProviderFactory =
    Arc<dyn Fn(&str, &ProviderOptions) -> Result<Arc<dyn LlmProvider>> + Send + Sync>;

pub struct AgentRuntime {
    config: RuntimeConfig,
    bus: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    queue: Arc<QueueManager>,
    runs: Arc<RunRegistry>,
    rotation: Option<Arc<RotationManager>>,
    provider_factory: ProviderFactory,
    /// Persists across turns; resets to the primary model on success only.
    chain: Mutex<FallbackChain>,
    /// Messages injected between provider rounds, per session.
    steering: Mutex<HashMap<String, VecDeque<String>>>,
}

impl AgentRuntime {
    pub fn new(
        config: RuntimeConfig,
        bus: Arc<EventBus>,
        sessions: Arc<SessionStore>,
        tools: Arc<ToolRegistry>,
        queue: Arc<QueueManager>,
    ) -> Self {
        let chain = FallbackChain::new(config.model.clone(), config.fallback_models.clone());
        Self {
            config,
            bus,
            sessions,
            tools,
            queue,
            runs: Arc::new(RunRegistry::new()),
            rotation: None,
            provider_factory: Arc::new(|model: &str, opts: &ProviderOptions| {
                build_provider(model, opts)
            }),
            chain: Mutex::new(chain),
            steering: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rotation(mut self, rotation: Arc<RotationManager>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Override how providers are built (used by tests and embedders).
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Queue a message to be injected before the next provider round of the
    /// session's running turn.
    pub fn steer(&self, session_id: &str, message: impl Into<String>) {
        self.steering
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .push_back(message.into());
    }

    fn drain_steering(&self, session_id: &str) -> Vec<String> {
        self.steering
            .lock()
            .get_mut(session_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    async fn publish(&self, kind: EventKind, session_id: &str, data: serde_json::Value) {
        self.bus
            .publish(
                Event::new(kind, SOURCE)
                    .with_session(session_id)
                    .with_data(data),
            )
            .await;
    }

    // ── Turn entry point ───────────────────────────────────────────

    /// Execute one turn under the session and global queue lanes.
    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnOutcome> {
        let run_id = req
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cancel = self.runs.register(&run_id);

        tracing::debug!(run_id = %run_id, session_id = %req.session_id, "turn queued");

        let result = self
            .queue
            .enqueue_both(
                &req.session_id,
                req.timeout,
                &cancel,
                self.run_turn_inner(&req, &run_id, &cancel),
            )
            .await;
        self.runs.remove(&run_id);

        match result {
            Ok(inner) => inner,
            // Queue-level timeout or shutdown.
            Err(e) => Err(e),
        }
    }

    // ── The turn state machine ─────────────────────────────────────

    async fn run_turn_inner(
        &self,
        req: &TurnRequest,
        run_id: &str,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let session_id = &req.session_id;

        // Aborted while queued: exit with the single completion event.
        if cancel.is_cancelled() {
            self.publish(
                EventKind::AgentTurnComplete,
                session_id,
                json!({"run_id": run_id, "cancelled": true}),
            )
            .await;
            return Ok(TurnOutcome {
                run_id: run_id.to_owned(),
                text: String::new(),
                cancelled: true,
            });
        }

        // ── START ──────────────────────────────────────────────────
        let (session, is_new) = self.sessions.get_or_create(session_id)?;
        if is_new {
            self.bus
                .publish(
                    Event::new(EventKind::SessionCreated, SOURCE)
                        .with_session(session_id)
                        .with_data(json!({"session_id": session_id})),
                )
                .await;
        }

        if session.lock().messages.is_empty() {
            if let Some(system_prompt) = &req.system_prompt {
                self.sessions
                    .append(&session, Message::system(system_prompt))?;
            }
        }
        let user_message = if req.images.is_empty() {
            Message::user(&req.message)
        } else {
            Message::user_with_images(&req.message, req.images.clone())
        };
        self.sessions.append(&session, user_message)?;

        self.publish(
            EventKind::AgentStarted,
            session_id,
            json!({"run_id": run_id, "phase": "start"}),
        )
        .await;

        // ── CHECK_CONTEXT ──────────────────────────────────────────
        if self.config.enable_compaction {
            self.maybe_compact(session_id, &session).await?;
        }

        // ── CALL_PROVIDER / STREAM, with retry + failover ──────────
        let mut retry_count: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                self.publish(
                    EventKind::AgentTurnComplete,
                    session_id,
                    json!({"run_id": run_id, "cancelled": true}),
                )
                .await;
                return Ok(TurnOutcome {
                    run_id: run_id.to_owned(),
                    text: String::new(),
                    cancelled: true,
                });
            }

            // Steering messages land before the provider round.
            for text in self.drain_steering(session_id) {
                self.sessions.append(&session, Message::user(text))?;
            }

            let current_model = self.chain.lock().current_model().to_owned();
            let (provider_name, _) = parse_model_id(&current_model);

            // Auth rotation is orthogonal to the chain: pull a profile per
            // attempt and report the outcome after.
            let profile = match &self.rotation {
                Some(rotation) if self.config.api_key.is_none() => {
                    rotation.next_available(&provider_name, None)
                }
                _ => None,
            };
            let api_key = profile
                .as_ref()
                .and_then(|p| p.credential.resolve())
                .or_else(|| self.config.api_key.clone());

            let attempt = async {
                let provider = (self.provider_factory)(
                    &current_model,
                    &ProviderOptions {
                        api_key,
                        base_url: self.config.base_url.clone(),
                    },
                )?;
                self.stream_turn(req, &session, run_id, cancel, provider)
                    .await
            };

            match attempt.await {
                Ok(StreamOutcome::Complete(text)) => {
                    if let (Some(rotation), Some(profile)) = (&self.rotation, &profile) {
                        rotation.record_success(&profile.id);
                    }
                    {
                        let mut chain = self.chain.lock();
                        chain.record_success(&current_model);
                        chain.reset();
                    }
                    self.publish(
                        EventKind::AgentTurnComplete,
                        session_id,
                        json!({"run_id": run_id, "cancelled": false}),
                    )
                    .await;
                    return Ok(TurnOutcome {
                        run_id: run_id.to_owned(),
                        text,
                        cancelled: false,
                    });
                }
                Ok(StreamOutcome::Cancelled(text)) => {
                    self.publish(
                        EventKind::AgentTurnComplete,
                        session_id,
                        json!({"run_id": run_id, "cancelled": true}),
                    )
                    .await;
                    return Ok(TurnOutcome {
                        run_id: run_id.to_owned(),
                        text,
                        cancelled: true,
                    });
                }
                Err(error) => {
                    let category = classify(&error);
                    tracing::warn!(
                        run_id = %run_id,
                        model = %current_model,
                        category = category.as_str(),
                        error = %error,
                        "provider attempt failed"
                    );

                    // Auth and rate-limit failures cool the profile down
                    // immediately; other failures count toward the threshold.
                    if let (Some(rotation), Some(profile)) = (&self.rotation, &profile) {
                        let immediate = matches!(
                            category,
                            ErrorCategory::Auth | ErrorCategory::RateLimit
                        );
                        rotation.record_failure(&profile.id, category.as_str(), immediate);
                    }

                    let (should_failover, reason) = self.chain.lock().should_failover(&error);
                    if should_failover {
                        let next_model = {
                            let mut chain = self.chain.lock();
                            chain.next_model().map(str::to_owned)
                        };
                        if let Some(next_model) = next_model {
                            self.publish(
                                EventKind::AgentFailover,
                                session_id,
                                json!({
                                    "run_id": run_id,
                                    "from": current_model,
                                    "to": next_model,
                                    "reason": reason.as_str(),
                                    "error": error.to_string(),
                                }),
                            )
                            .await;
                            continue;
                        }
                    }

                    if is_retryable(category) && retry_count < self.config.max_retries {
                        retry_count += 1;
                        let delay_s = (1u64 << (retry_count - 1)).min(MAX_BACKOFF_SECS);
                        self.publish(
                            EventKind::AgentRetry,
                            session_id,
                            json!({
                                "run_id": run_id,
                                "attempt": retry_count,
                                "max_retries": self.config.max_retries,
                                "delay_s": delay_s,
                                "error": error.to_string(),
                            }),
                        )
                        .await;
                        tokio::time::sleep(Duration::from_secs(delay_s)).await;
                        continue;
                    }

                    self.publish(
                        EventKind::AgentError,
                        session_id,
                        json!({
                            "run_id": run_id,
                            "message": error.to_string(),
                            "category": category.as_str(),
                        }),
                    )
                    .await;
                    self.publish(
                        EventKind::AgentTurnComplete,
                        session_id,
                        json!({"run_id": run_id, "cancelled": false}),
                    )
                    .await;
                    return Err(error);
                }
            }
        }
    }

    // ── CHECK_CONTEXT helper ───────────────────────────────────────

    async fn maybe_compact(
        &self,
        session_id: &str,
        session: &Arc<Mutex<Session>>,
    ) -> Result<()> {
        let (_, model_name) = parse_model_id(&self.chain.lock().current_model().to_owned());
        let messages = session.lock().messages.clone();
        let current_tokens = estimate_messages_tokens(&messages);
        let window = check_context(&model_name, current_tokens);

        if !window.should_compress {
            return Ok(());
        }

        let target = default_target_tokens(&model_name);
        let compacted = compact(&messages, target, self.config.compaction_strategy);
        let compacted_tokens = estimate_messages_tokens(&compacted);
        self.sessions.replace_messages(session, compacted)?;

        tracing::info!(
            session_id,
            original_tokens = current_tokens,
            compacted_tokens,
            strategy = self.config.compaction_strategy.as_str(),
            "session history compacted"
        );
        self.publish(
            EventKind::AgentCompaction,
            session_id,
            json!({
                "original_tokens": current_tokens,
                "compacted_tokens": compacted_tokens,
                "strategy": self.config.compaction_strategy.as_str(),
            }),
        )
        .await;
        Ok(())
    }

    // ── STREAM phase ───────────────────────────────────────────────

    async fn stream_turn(
        &self,
        req: &TurnRequest,
        session: &Arc<Mutex<Session>>,
        run_id: &str,
        cancel: &CancelToken,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<StreamOutcome> {
        let session_id = &req.session_id;

        let chat_req = ChatRequest {
            messages: session.lock().messages.clone(),
            tools: self.tools.definitions(),
            max_tokens: self.config.max_tokens,
            temperature: None,
        };
        let mut stream = provider.stream(&chat_req).await?;

        let mut extractor = ThinkingExtractor::new();
        let mut content_buf = String::new();
        let mut thinking_buf = String::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        while let Some(chunk) = stream.next().await {
            // Dropping the stream here releases the provider transport.
            if cancel.is_cancelled() {
                drop(stream);
                return Ok(StreamOutcome::Cancelled(content_buf));
            }

            match chunk? {
                ProviderChunk::TextDelta { text } => {
                    self.handle_text_delta(
                        session_id,
                        &text,
                        &mut extractor,
                        &mut content_buf,
                        &mut thinking_buf,
                    )
                    .await;
                }
                ProviderChunk::ToolCall { calls } => {
                    // Thinking/text deltas already emitted stay emitted.
                    pending_calls.extend(calls);
                }
                ProviderChunk::Done => break,
                ProviderChunk::Error { message } => {
                    return Err(Error::Provider {
                        provider: provider.provider_id().to_owned(),
                        message,
                    });
                }
            }
        }
        drop(stream);

        self.finish_thinking(session_id, &mut extractor, &mut content_buf, &mut thinking_buf)
            .await;

        // ── No tools: the stream was the final answer ──────────────
        if pending_calls.is_empty() {
            self.sessions
                .append(session, Message::assistant(&content_buf))?;
            return Ok(StreamOutcome::Complete(content_buf));
        }

        // ── TOOL_DISPATCH ──────────────────────────────────────────
        self.sessions.append(
            session,
            Message::assistant_with_tool_calls(&content_buf, pending_calls.clone()),
        )?;

        for call in &pending_calls {
            // An aborted run starts no further tools.
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled(content_buf));
            }

            self.publish(
                EventKind::AgentToolUse,
                session_id,
                json!({
                    "run_id": run_id,
                    "id": call.id,
                    "tool": call.name,
                    "input": call.arguments,
                }),
            )
            .await;

            let result = self.tools.execute(&call.name, call.arguments.clone()).await;

            self.publish(
                EventKind::AgentToolResult,
                session_id,
                json!({
                    "run_id": run_id,
                    "id": call.id,
                    "tool": call.name,
                    "result": result.content,
                    "success": result.success,
                }),
            )
            .await;

            // File-generation side channel: a structured result carrying a
            // file descriptor also announces the file.
            if result.success {
                if let Some(descriptor) = result.metadata.as_ref().filter(|m| {
                    m.get("file_path").is_some() && m.get("file_type").is_some()
                }) {
                    let mut data = descriptor.clone();
                    data["tool"] = json!(call.name);
                    data["run_id"] = json!(run_id);
                    self.publish(EventKind::AgentFileGenerated, session_id, data)
                        .await;
                }
            }

            self.sessions
                .append_tool_result(session, call, &result.content)?;
        }

        // ── POST_TOOL_CALL: follow-up round without tools ──────────
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled(content_buf));
        }

        let followup_req = ChatRequest {
            messages: session.lock().messages.clone(),
            tools: Vec::new(),
            max_tokens: self.config.max_tokens,
            temperature: None,
        };
        let mut stream = provider.stream(&followup_req).await?;

        let mut extractor = ThinkingExtractor::new();
        let mut followup_buf = String::new();
        let mut followup_thinking = String::new();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(stream);
                return Ok(StreamOutcome::Cancelled(followup_buf));
            }
            match chunk? {
                ProviderChunk::TextDelta { text } => {
                    self.handle_text_delta(
                        session_id,
                        &text,
                        &mut extractor,
                        &mut followup_buf,
                        &mut followup_thinking,
                    )
                    .await;
                }
                // Tools are disabled on the follow-up round; a model that
                // emits one anyway gets it dropped.
                ProviderChunk::ToolCall { .. } => {}
                ProviderChunk::Done => break,
                ProviderChunk::Error { message } => {
                    return Err(Error::Provider {
                        provider: provider.provider_id().to_owned(),
                        message,
                    });
                }
            }
        }
        drop(stream);

        self.finish_thinking(
            session_id,
            &mut extractor,
            &mut followup_buf,
            &mut followup_thinking,
        )
        .await;

        self.sessions
            .append(session, Message::assistant(&followup_buf))?;
        Ok(StreamOutcome::Complete(followup_buf))
    }

    // ── Thinking extraction plumbing ───────────────────────────────

    async fn handle_text_delta(
        &self,
        session_id: &str,
        text: &str,
        extractor: &mut ThinkingExtractor,
        content_buf: &mut String,
        thinking_buf: &mut String,
    ) {
        match self.config.thinking_mode {
            ThinkingMode::Off => {
                content_buf.push_str(text);
                self.publish(EventKind::AgentText, session_id, json!({"text": text}))
                    .await;
            }
            ThinkingMode::Stream => {
                let (thinking, content) = extractor.extract_chunk(text);
                if !thinking.is_empty() {
                    thinking_buf.push_str(&thinking);
                    self.publish(
                        EventKind::AgentThinking,
                        session_id,
                        json!({"text": thinking, "mode": "stream"}),
                    )
                    .await;
                }
                if !content.is_empty() {
                    content_buf.push_str(&content);
                    self.publish(EventKind::AgentText, session_id, json!({"text": content}))
                        .await;
                }
            }
            ThinkingMode::On => {
                let (thinking, content) = extractor.extract_chunk(text);
                thinking_buf.push_str(&thinking);
                if !content.is_empty() {
                    content_buf.push_str(&content);
                    self.publish(EventKind::AgentText, session_id, json!({"text": content}))
                        .await;
                }
            }
        }
    }

    /// Flush the extractor at end of stream; in `On` mode the accumulated
    /// thinking goes out as a single event.
    async fn finish_thinking(
        &self,
        session_id: &str,
        extractor: &mut ThinkingExtractor,
        content_buf: &mut String,
        thinking_buf: &mut String,
    ) {
        if self.config.thinking_mode == ThinkingMode::Off {
            return;
        }
        let (thinking, content) = extractor.finish();
        if !thinking.is_empty() {
            thinking_buf.push_str(&thinking);
            if self.config.thinking_mode == ThinkingMode::Stream {
                self.publish(
                    EventKind::AgentThinking,
                    session_id,
                    json!({"text": thinking, "mode": "stream"}),
                )
                .await;
            }
        }
        if !content.is_empty() {
            content_buf.push_str(&content);
            self.publish(EventKind::AgentText, session_id, json!({"text": content}))
                .await;
        }
        if self.config.thinking_mode == ThinkingMode::On && !thinking_buf.is_empty() {
            self.publish(
                EventKind::AgentThinking,
                session_id,
                json!({"text": thinking_buf, "mode": "on"}),
            )
            .await;
        }
    }
}
