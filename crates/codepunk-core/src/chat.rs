// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use codepunk_config::Config;
use codepunk_model::{
    CachingProvider, LlmProvider, LlmRequest, Message, MessagePart, PromptCache,
    ProviderRegistry, ToolCallPart, ToolDefinition, Usage,
};
use codepunk_tools::ToolResult;

use crate::events::{ChatEvent, ChatEventKind, EventBus};
use crate::interceptor::{InterceptError, ToolInterceptor};
use crate::prompts::system_prompt;
use crate::signature::stable_signature;
use crate::status::tool_status_chunk;
use crate::store::{MessageRepository, SessionRepository};

/// Ephemeral guidance injected on an intentful first turn. The leading
/// phrase doubles as the dedupe marker.
const MODE_GUIDANCE: &str = "\
Decide how to approach this request before answering: for multi-step \
changes, outline a short plan and work through it with tools; for quick \
questions or small fixes, answer directly without planning overhead.";
const MODE_GUIDANCE_MARKER: &str = "Decide how to approach this request";

/// Ephemeral guidance injected when the iteration budget is nearly spent.
const CONSOLIDATION: &str = "\
You are close to the tool-call limit for this request. Avoid redundant \
tool calls, consolidate what you have already learned, and produce your \
final answer.";
const CONSOLIDATION_MARKER: &str = "close to the tool-call limit";

/// Action verbs that mark a first message as intentful enough to warrant
/// the mode-guidance injection.
const INTENT_VERBS: &[&str] = &[
    "add", "build", "change", "create", "debug", "fix", "implement", "migrate", "refactor",
    "remove", "rename", "update", "write",
];

/// Tunables for the tool-calling loop. A value of 0 disables the
/// corresponding guardrail; the iteration cap is always active.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tool_call_iterations: u32,
    pub max_tool_calls_per_iteration: u32,
    pub max_repeated_tool_calls: u32,
    pub max_consecutive_tool_errors: u32,
    pub default_provider: String,
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub use_ephemeral_cache: bool,
    pub system_prompt_override: Option<String>,
    pub prompt: codepunk_config::PromptConfig,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tool_call_iterations: 5,
            max_tool_calls_per_iteration: 0,
            max_repeated_tool_calls: 0,
            max_consecutive_tool_errors: 0,
            default_provider: "anthropic".into(),
            default_model: "claude-sonnet-4-5".into(),
            max_tokens: 4096,
            temperature: 0.2,
            use_ephemeral_cache: false,
            system_prompt_override: None,
            prompt: codepunk_config::PromptConfig::default(),
        }
    }
}

impl ChatOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tool_call_iterations: config.chat.max_tool_call_iterations,
            max_tool_calls_per_iteration: config.chat.max_tool_calls_per_iteration,
            max_repeated_tool_calls: config.chat.max_repeated_tool_calls,
            max_consecutive_tool_errors: config.chat.max_consecutive_tool_errors,
            default_provider: config.model.provider.clone(),
            default_model: config.model.name.clone(),
            max_tokens: config.model.max_tokens.unwrap_or(4096),
            temperature: config.model.temperature.unwrap_or(0.2),
            use_ephemeral_cache: config.model.use_ephemeral_cache,
            system_prompt_override: None,
            prompt: config.prompt.clone(),
        }
    }
}

/// One streamed unit delivered to `send_message_stream` consumers.
#[derive(Debug, Clone, Default)]
pub struct ChatStreamChunk {
    pub content_delta: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub is_complete: bool,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub estimated_cost: Option<f64>,
}

/// The conversational scheduler: drives the bounded model↔tool loop for
/// one session.
///
/// Concurrent calls on the same session are not supported — the git
/// shadow session mutates the shared working tree — but state accessors
/// are safe to read from any task while a call runs.
pub struct ChatSession {
    session_id: String,
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<dyn PromptCache>>,
    interceptor: ToolInterceptor,
    options: Mutex<ChatOptions>,
    events: EventBus,

    is_processing: AtomicBool,
    tool_iteration: AtomicU32,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    cost: Mutex<f64>,
}

impl ChatSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        registry: Arc<ProviderRegistry>,
        cache: Option<Arc<dyn PromptCache>>,
        interceptor: ToolInterceptor,
        options: ChatOptions,
    ) -> Self {
        registry.set_session_defaults(
            Some(&options.default_provider),
            Some(&options.default_model),
        );
        Self {
            session_id: session_id.into(),
            sessions,
            messages,
            registry,
            cache,
            interceptor,
            options: Mutex::new(options),
            events: EventBus::default(),
            is_processing: AtomicBool::new(false),
            tool_iteration: AtomicU32::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            cost: Mutex::new(0.0),
        }
    }

    // ── Observability ─────────────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a session is attached to this orchestrator.
    pub fn is_active(&self) -> bool {
        !self.session_id.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    /// Current loop iteration; 0 when idle.
    pub fn tool_iteration(&self) -> u32 {
        self.tool_iteration.load(Ordering::Acquire)
    }

    pub fn is_tool_loop_active(&self) -> bool {
        self.tool_iteration() > 0
    }

    pub fn accumulated_prompt_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::Acquire)
    }

    pub fn accumulated_completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Acquire)
    }

    pub fn accumulated_cost(&self) -> f64 {
        *self.cost.lock().unwrap()
    }

    /// Attach an event consumer (bounded; slow consumers drop events).
    pub fn subscribe_events(&self, capacity: usize) -> mpsc::Receiver<ChatEvent> {
        self.events.subscribe(capacity)
    }

    /// Replace the default provider/model for subsequent requests.
    pub fn update_defaults(&self, provider: Option<&str>, model: Option<&str>) {
        {
            let mut opts = self.options.lock().unwrap();
            if let Some(p) = provider {
                opts.default_provider = p.to_string();
            }
            if let Some(m) = model {
                opts.default_model = m.to_string();
            }
        }
        self.registry.set_session_defaults(provider, model);
    }

    /// Delete the conversation history for this session.
    pub async fn clear_conversation(&self) -> anyhow::Result<()> {
        self.messages.delete_by_session(&self.session_id).await?;
        self.emit(ChatEventKind::SessionCleared, None, None, false);
        Ok(())
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Run the tool-calling loop to completion and return the terminal
    /// assistant message.
    pub async fn send_message(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Message> {
        self.run(text, cancel, None).await
    }

    /// Streaming variant: the same loop, interleaving chunk emission.
    /// Errors surface as a final chunk with the error text.
    pub fn send_message_stream(
        self: Arc<Self>,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> ReceiverStream<ChatStreamChunk> {
        let (tx, rx) = mpsc::channel(64);
        let this = self;
        let text = text.into();
        tokio::spawn(async move {
            if let Err(e) = this.run(&text, &cancel, Some(&tx)).await {
                warn!(error = %e, "streaming chat run failed");
                let _ = tx
                    .send(ChatStreamChunk {
                        content_delta: Some(format!("Error: {e}")),
                        is_complete: true,
                        ..Default::default()
                    })
                    .await;
            }
        });
        ReceiverStream::new(rx)
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    async fn run(
        &self,
        text: &str,
        cancel: &CancellationToken,
        stream: Option<&mpsc::Sender<ChatStreamChunk>>,
    ) -> anyhow::Result<Message> {
        let _guard = LoopGuard::arm(self);
        let opts = self.options.lock().unwrap().clone();

        // Persist the user message first, then load the full conversation.
        let user = Message::user(&self.session_id, text);
        self.messages.create(&user).await.context("persisting user message")?;
        let mut conversation = self
            .messages
            .list_by_session(&self.session_id)
            .await
            .context("loading conversation")?;

        let defaults = self.registry.session_defaults();
        let provider = self
            .registry
            .get(&defaults.provider)
            .with_context(|| format!("provider {:?} not registered", defaults.provider))?;
        let provider_name = provider.name().to_string();
        let provider: Arc<dyn LlmProvider> =
            Arc::new(CachingProvider::new(provider, self.cache.clone()));
        let model_id = defaults.model;

        let tools: Vec<ToolDefinition> = self
            .interceptor
            .tools()
            .specs()
            .into_iter()
            .map(|s| ToolDefinition {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        self.emit(ChatEventKind::MessageStart, None, None, false);

        let mut iteration: u32 = 0;
        let mut repeated_streak: u32 = 0;
        let mut error_streak: u32 = 0;
        let mut seen_signatures: HashSet<String> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                bail!("operation cancelled");
            }
            iteration += 1;
            self.tool_iteration.store(iteration, Ordering::Release);
            self.emit(ChatEventKind::ToolIterationStart, Some(iteration), None, false);

            // Ephemeral guidance lives only in the outbound request; it is
            // never written to the message repository.
            let outbound = self.with_ephemeral_guidance(&conversation, iteration, &opts);

            let request = LlmRequest {
                model_id: model_id.clone(),
                messages: outbound,
                system_prompt: Some(system_prompt(
                    &opts.prompt,
                    &provider_name,
                    opts.system_prompt_override.as_deref(),
                )),
                tools: tools.clone(),
                max_tokens: opts.max_tokens,
                temperature: opts.temperature,
                response_format: None,
                use_ephemeral_cache: opts.use_ephemeral_cache,
                system_prompt_cache_id: Some(self.session_id.clone()),
            };

            let (text_buf, tool_calls) = self
                .stream_one_turn(&provider, &provider_name, &model_id, &request, cancel, stream)
                .await?;

            // Persist the assistant turn exactly as accumulated.
            let mut parts: Vec<MessagePart> = Vec::new();
            if !text_buf.is_empty() {
                parts.push(MessagePart::Text {
                    content: text_buf.clone(),
                });
            }
            for tc in &tool_calls {
                parts.push(MessagePart::ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                });
            }
            let assistant = Message::assistant(&self.session_id, parts)
                .with_model(&provider_name, &model_id);
            self.messages
                .create(&assistant)
                .await
                .context("persisting assistant message")?;
            conversation.push(assistant.clone());

            if tool_calls.is_empty() {
                self.emit(ChatEventKind::MessageComplete, Some(iteration), None, true);
                return Ok(assistant);
            }

            // Guardrail: per-iteration batch cap.
            if opts.max_tool_calls_per_iteration > 0
                && tool_calls.len() as u32 > opts.max_tool_calls_per_iteration
            {
                let content = format!(
                    "I attempted {} tool calls in one step, which exceeds the limit of {}. \
                     Please retry with the work split into smaller batches.",
                    tool_calls.len(),
                    opts.max_tool_calls_per_iteration
                );
                return self
                    .finish_with_guardrail(content, iteration, ChatEventKind::ToolLoopAborted, stream)
                    .await;
            }

            // Guardrail: cross-iteration repetition on stable signatures.
            let mut any_repeat = false;
            for tc in &tool_calls {
                if !seen_signatures.insert(stable_signature(&tc.name, &tc.arguments)) {
                    any_repeat = true;
                }
            }
            if any_repeat {
                // The streak spans the whole repeated run, first occurrence
                // included, so a cap of 2 fires on the first repetition.
                repeated_streak = if repeated_streak == 0 { 2 } else { repeated_streak + 1 };
            } else {
                repeated_streak = 0;
            }
            if opts.max_repeated_tool_calls > 0 && repeated_streak >= opts.max_repeated_tool_calls {
                let content = "Stopping due to repetition: the same tool call was issued \
                               again with identical arguments. Rephrase the request or \
                               provide more direction to continue."
                    .to_string();
                return self
                    .finish_with_guardrail(content, iteration, ChatEventKind::ToolLoopAborted, stream)
                    .await;
            }

            // Execute sequentially; approval UX and git commit ordering
            // depend on one-at-a-time execution.
            let mut result_parts: Vec<MessagePart> = Vec::new();
            let mut user_cancelled = false;
            let mut all_errors = true;
            for tc in &tool_calls {
                let result = match self.interceptor.execute(&tc.name, &tc.arguments, cancel).await {
                    Ok(r) => r,
                    Err(InterceptError::Cancelled) => bail!("operation cancelled"),
                    Err(InterceptError::Git(e)) => {
                        return Err(e).context("recording tool call in git session")
                    }
                };
                if !result.is_error {
                    all_errors = false;
                }
                if result.user_cancelled {
                    user_cancelled = true;
                }
                self.emit_tool_status(tc, &result, stream).await;
                result_parts.push(MessagePart::ToolResult {
                    tool_call_id: tc.id.clone(),
                    content: result.content,
                    is_error: result.is_error,
                });
                if user_cancelled {
                    break;
                }
            }

            let results = Message::tool_results(&self.session_id, result_parts);
            self.messages
                .create(&results)
                .await
                .context("persisting tool results")?;
            conversation.push(results);

            if user_cancelled {
                let content = "Operation cancelled by user.".to_string();
                return self
                    .finish_with_guardrail(content, iteration, ChatEventKind::ToolLoopAborted, stream)
                    .await;
            }

            if all_errors {
                error_streak += 1;
            } else {
                error_streak = 0;
            }
            if opts.max_consecutive_tool_errors > 0
                && error_streak >= opts.max_consecutive_tool_errors
            {
                let content = format!(
                    "Stopping after {error_streak} consecutive iterations of failing tool \
                     calls. The last errors are recorded above; please adjust the request."
                );
                return self
                    .finish_with_guardrail(content, iteration, ChatEventKind::ToolLoopAborted, stream)
                    .await;
            }

            self.emit(ChatEventKind::ToolIterationEnd, Some(iteration), None, false);

            if iteration == opts.max_tool_call_iterations {
                let content = format!(
                    "Stopping: too many tool calls without a final answer \
                     ({iteration} iterations). Aborting to avoid an infinite loop; \
                     ask again to continue from here."
                );
                return self
                    .finish_with_guardrail(content, iteration, ChatEventKind::ToolLoopExceeded, stream)
                    .await;
            }
        }
    }

    /// Stream one provider turn, forwarding chunks and accumulating the
    /// text and fully assembled tool calls.
    async fn stream_one_turn(
        &self,
        provider: &Arc<dyn LlmProvider>,
        provider_name: &str,
        model_id: &str,
        request: &LlmRequest,
        cancel: &CancellationToken,
        stream: Option<&mpsc::Sender<ChatStreamChunk>>,
    ) -> anyhow::Result<(String, Vec<ToolCallPart>)> {
        let mut chunks = provider
            .stream(request, cancel)
            .await
            .context("provider call failed")?;

        let mut text_buf = String::new();
        let mut tool_calls: Vec<ToolCallPart> = Vec::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("operation cancelled"),
                item = chunks.next() => item,
            };
            let Some(chunk) = item else { break };
            let chunk = chunk.context("provider call failed")?;

            if let Some(delta) = &chunk.content_delta {
                text_buf.push_str(delta);
                self.events.emit(ChatEvent {
                    kind: ChatEventKind::StreamDelta,
                    session_id: Some(self.session_id.clone()),
                    iteration: Some(self.tool_iteration()),
                    content_delta: Some(delta.clone()),
                    is_final: false,
                });
            }
            if let Some(tc) = &chunk.tool_call {
                debug!(tool = %tc.name, id = %tc.id, "tool call assembled");
                tool_calls.push(tc.clone());
            }
            if chunk.is_complete {
                if let Some(usage) = &chunk.usage {
                    self.accumulate_usage(usage).await;
                }
            }

            if let Some(tx) = stream {
                let forwarded = ChatStreamChunk {
                    content_delta: chunk.content_delta.clone(),
                    model: Some(model_id.to_string()),
                    provider: Some(provider_name.to_string()),
                    is_complete: chunk.is_complete,
                    input_tokens: chunk.usage.as_ref().map(|u| u.input_tokens),
                    output_tokens: chunk.usage.as_ref().map(|u| u.output_tokens),
                    estimated_cost: chunk.usage.as_ref().and_then(|u| u.estimated_cost),
                };
                // Only forward chunks that carry something observable.
                if forwarded.content_delta.is_some()
                    || forwarded.is_complete
                    || forwarded.input_tokens.is_some()
                {
                    let _ = tx.send(forwarded).await;
                }
            }
        }

        Ok((text_buf, tool_calls))
    }

    /// Update in-memory counters and persist the session totals
    /// best-effort; a persistence failure is logged, never fatal.
    async fn accumulate_usage(&self, usage: &Usage) {
        self.prompt_tokens
            .fetch_add(usage.input_tokens, Ordering::AcqRel);
        self.completion_tokens
            .fetch_add(usage.output_tokens, Ordering::AcqRel);
        if let Some(cost) = usage.estimated_cost {
            *self.cost.lock().unwrap() += cost;
        }

        match self.sessions.get(&self.session_id).await {
            Ok(Some(mut session)) => {
                session.prompt_tokens = self.accumulated_prompt_tokens();
                session.completion_tokens = self.accumulated_completion_tokens();
                session.cost = self.accumulated_cost();
                session.touch();
                if let Err(e) = self.sessions.update(&session).await {
                    warn!(error = %e, "failed to persist session usage");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load session for usage update"),
        }
    }

    /// Persist and emit a synthetic terminal assistant message (guardrail,
    /// cancellation, or iteration-cap fallback).
    async fn finish_with_guardrail(
        &self,
        content: String,
        iteration: u32,
        kind: ChatEventKind,
        stream: Option<&mpsc::Sender<ChatStreamChunk>>,
    ) -> anyhow::Result<Message> {
        let message = Message::assistant_text(&self.session_id, &content);
        self.messages
            .create(&message)
            .await
            .context("persisting guardrail message")?;

        if let Some(tx) = stream {
            let _ = tx
                .send(ChatStreamChunk {
                    content_delta: Some(content.clone()),
                    is_complete: true,
                    ..Default::default()
                })
                .await;
        }
        self.emit(kind, Some(iteration), Some(content), true);
        self.emit(ChatEventKind::MessageComplete, Some(iteration), None, true);
        Ok(message)
    }

    async fn emit_tool_status(
        &self,
        call: &ToolCallPart,
        result: &ToolResult,
        stream: Option<&mpsc::Sender<ChatStreamChunk>>,
    ) {
        let Some(tx) = stream else { return };
        let payload = tool_status_chunk(&call.id, &call.name, &call.arguments, result);
        let _ = tx
            .send(ChatStreamChunk {
                content_delta: Some(payload),
                ..Default::default()
            })
            .await;
    }

    /// Prepend ephemeral system guidance to the outbound message list.
    ///
    /// Idempotent by textual marker, constructed per request, and never
    /// persisted.
    fn with_ephemeral_guidance(
        &self,
        conversation: &[Message],
        iteration: u32,
        opts: &ChatOptions,
    ) -> Vec<Message> {
        let mut guidance: Vec<Message> = Vec::new();

        let contains_marker = |msgs: &[Message], marker: &str| {
            msgs.iter().any(|m| m.text().contains(marker))
        };

        let first_assistant_turn = !conversation
            .iter()
            .any(|m| matches!(m.role, codepunk_model::Role::Assistant | codepunk_model::Role::Tool));
        if first_assistant_turn
            && !contains_marker(conversation, MODE_GUIDANCE_MARKER)
            && conversation
                .iter()
                .rev()
                .find(|m| m.role == codepunk_model::Role::User)
                .map(|m| is_intentful(&m.text()))
                .unwrap_or(false)
        {
            guidance.push(Message::system(&self.session_id, MODE_GUIDANCE));
        }

        let remaining = opts.max_tool_call_iterations + 1 - iteration.min(opts.max_tool_call_iterations);
        if remaining <= 2
            && !contains_marker(conversation, CONSOLIDATION_MARKER)
            && !contains_marker(&guidance, CONSOLIDATION_MARKER)
        {
            guidance.push(Message::system(&self.session_id, CONSOLIDATION));
        }

        guidance.extend(conversation.iter().cloned());
        guidance
    }

    fn emit(
        &self,
        kind: ChatEventKind,
        iteration: Option<u32>,
        content: Option<String>,
        is_final: bool,
    ) {
        self.events.emit(ChatEvent {
            kind,
            session_id: Some(self.session_id.clone()),
            iteration,
            content_delta: content,
            is_final,
        });
    }
}

/// A first message is "intentful" when it is long enough to be a real task
/// and contains an action verb. Deliberately simple; injection only tunes
/// behaviour and must never gate correctness.
fn is_intentful(text: &str) -> bool {
    if text.chars().count() < 20 {
        return false;
    }
    let lower = text.to_lowercase();
    INTENT_VERBS
        .iter()
        .any(|v| lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *v))
}

/// Resets the processing flags when a run ends, on every exit path.
struct LoopGuard<'a> {
    chat: &'a ChatSession,
}

impl<'a> LoopGuard<'a> {
    fn arm(chat: &'a ChatSession) -> Self {
        chat.is_processing.store(true, Ordering::Release);
        Self { chat }
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.chat.is_processing.store(false, Ordering::Release);
        self.chat.tool_iteration.store(0, Ordering::Release);
    }
}

// ─── Unit tests (pure helpers; loop scenarios live in tests.rs) ──────────────
