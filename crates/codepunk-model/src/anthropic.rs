// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    catalog,
    error::{truncate_body, ProviderError},
    provider::{ChunkStream, LlmProvider},
    FinishReason, LlmRequest, LlmResponse, LlmStreamChunk, Message, MessagePart, PromptCacheInfo,
    ResponseFormat, ResponseFormatKind, Role, ToolCallPart, Usage,
};

const API_VERSION: &str = "2023-06-01";

/// Backoff schedule for throttled / transient failures. Each delay gets
/// 50–250 ms of jitter on top so concurrent clients do not retry in step.
const BACKOFF_SCHEDULE: [f64; 4] = [0.5, 1.0, 2.0, 4.0];
const MAX_ATTEMPTS: u32 = 4;

pub struct AnthropicProvider {
    api_key: String,
    version: String,
    /// Normalized to exactly one trailing slash.
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            api_key: sanitize_header_value(&api_key.into()),
            version: sanitize_header_value(API_VERSION),
            base_url: normalize_base_url(
                base_url.as_deref().unwrap_or("https://api.anthropic.com"),
            ),
            client: reqwest::Client::new(),
        }
    }

    /// POST `body` to `path`, retrying 429/503/5xx and transport errors over
    /// the backoff schedule. `Retry-After` (seconds or HTTP-date) takes
    /// precedence over the schedule when the server provides it.
    async fn request_with_retry(
        &self,
        path: &str,
        body: &Value,
        sse: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut builder = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", &self.version)
                .json(body);
            if sse {
                builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
            }

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                r = builder.send() => r,
            };

            match sent {
                Ok(resp) => {
                    log_rate_limit_headers(&resp);
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        return Ok(resp);
                    }
                    if status == 401 {
                        return Err(ProviderError::Unauthorized);
                    }
                    if status == 429 || status == 503 {
                        if attempt >= MAX_ATTEMPTS {
                            return Err(ProviderError::RateLimited { attempts: attempt });
                        }
                        let delay =
                            retry_after(resp.headers()).unwrap_or_else(|| backoff_delay(attempt));
                        warn!(
                            status,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "provider throttled; backing off"
                        );
                        if sleep_cancellable(delay, cancel).await {
                            return Err(ProviderError::Cancelled);
                        }
                        continue;
                    }
                    if status >= 500 {
                        if attempt >= MAX_ATTEMPTS {
                            return Err(ProviderError::Server {
                                status,
                                attempts: attempt,
                            });
                        }
                        let delay = backoff_delay(attempt);
                        warn!(status, attempt, "provider server error; retrying");
                        if sleep_cancellable(delay, cancel).await {
                            return Err(ProviderError::Cancelled);
                        }
                        continue;
                    }
                    let text = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::Rejected {
                        status,
                        body: truncate_body(&text),
                    });
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ProviderError::Transport(e));
                    }
                    debug!(error = %e, attempt, "transport error; retrying");
                    if sleep_cancellable(backoff_delay(attempt), cancel).await {
                        return Err(ProviderError::Cancelled);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let body = build_request_body(req, false);
        let resp = self
            .request_with_retry("v1/messages", &body, false, cancel)
            .await?;
        let v: Value = resp.json().await.map_err(ProviderError::Transport)?;
        parse_complete_response(&v, &req.model_id)
    }

    async fn stream(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let body = build_request_body(req, true);
        let resp = self
            .request_with_retry("v1/messages", &body, true, cancel)
            .await?;

        // SSE lines can be split across TCP chunks, so the parser carries a
        // remainder buffer forward; only complete lines are handled.
        let state = StreamState::new(&req.model_id);
        let stream = resp
            .bytes_stream()
            .scan(state, |state, chunk| {
                let items: Vec<Result<LlmStreamChunk, ProviderError>> = match chunk {
                    Ok(bytes) => state
                        .push_text(&String::from_utf8_lossy(&bytes))
                        .into_iter()
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(ProviderError::Transport(e))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    async fn count_tokens(&self, req: &LlmRequest) -> Result<u64, ProviderError> {
        let mut body = build_request_body(req, false);
        // The count endpoint takes the same shape minus generation knobs.
        if let Some(obj) = body.as_object_mut() {
            obj.remove("max_tokens");
            obj.remove("temperature");
            obj.remove("stream");
        }
        let resp = self
            .request_with_retry("v1/messages/count_tokens", &body, false, &CancellationToken::new())
            .await?;
        let v: Value = resp.json().await.map_err(ProviderError::Transport)?;
        v["input_tokens"]
            .as_u64()
            .ok_or_else(|| ProviderError::Protocol("count_tokens response missing input_tokens".into()))
    }
}

// ─── Request shaping ──────────────────────────────────────────────────────────

/// Convert an [`LlmRequest`] into the Anthropic messages-API body.
///
/// System messages are hoisted out of the ordered list into the top-level
/// `system` array; tool-role messages are transmitted as user messages whose
/// content blocks are `tool_result` entries; assistant messages carry text
/// and `tool_use` blocks. When ephemeral caching is on, a cache-control
/// marker is attached to every system block and to the last tool entry.
pub(crate) fn build_request_body(req: &LlmRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": req.model_id,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": wire_messages(&req.messages),
    });
    if stream {
        body["stream"] = json!(true);
    }

    let system = system_blocks(req);
    if !system.is_empty() {
        body["system"] = json!(system);
    }

    if !req.tools.is_empty() {
        let last = req.tools.len() - 1;
        let tools: Vec<Value> = req
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut tool = json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                });
                if req.use_ephemeral_cache && i == last {
                    tool["cache_control"] = json!({ "type": "ephemeral" });
                }
                tool
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn system_blocks(req: &LlmRequest) -> Vec<Value> {
    let mut texts: Vec<String> = Vec::new();
    if let Some(sp) = &req.system_prompt {
        if !sp.is_empty() {
            texts.push(sp.clone());
        }
    }
    for m in req.messages.iter().filter(|m| m.role == Role::System) {
        let t = m.text();
        if !t.is_empty() {
            texts.push(t);
        }
    }
    if let Some(rf) = &req.response_format {
        texts.push(response_format_instruction(rf));
    }

    texts
        .into_iter()
        .map(|text| {
            let mut block = json!({ "type": "text", "text": text });
            if req.use_ephemeral_cache {
                block["cache_control"] = json!({ "type": "ephemeral" });
            }
            block
        })
        .collect()
}

fn response_format_instruction(rf: &ResponseFormat) -> String {
    match rf.kind {
        ResponseFormatKind::JsonSchema => {
            let name = rf
                .schema_name
                .as_deref()
                .map(|n| format!(" named \"{n}\""))
                .unwrap_or_default();
            let schema = rf
                .json_schema
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "{}".into());
            format!(
                "Respond ONLY with a JSON document that conforms to the JSON schema{name} below. \
                 Do not include prose, markdown fences, or any text outside the JSON.\n\n{schema}"
            )
        }
        ResponseFormatKind::JsonObject => {
            "Respond ONLY with a valid JSON object. \
             Do not include prose, markdown fences, or any text outside the JSON."
                .into()
        }
    }
}

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        if m.role == Role::System {
            continue;
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            // Tool results ride on user-role messages per the wire contract.
            Role::User | Role::Tool => "user",
            Role::System => unreachable!(),
        };

        let blocks: Vec<Value> = m
            .parts
            .iter()
            .map(|p| match p {
                MessagePart::Text { content } => json!({ "type": "text", "text": content }),
                MessagePart::ToolCall {
                    id,
                    name,
                    arguments,
                } => json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": arguments,
                }),
                MessagePart::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                } => {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                    });
                    if *is_error {
                        block["is_error"] = json!(true);
                    }
                    block
                }
                MessagePart::Image { url, .. } => image_block(url),
            })
            .collect();

        if blocks.is_empty() {
            out.push(json!({ "role": role, "content": "" }));
        } else {
            out.push(json!({ "role": role, "content": blocks }));
        }
    }
    out
}

/// Images arrive as data URLs (`data:<mime>;base64,<b64>`) or plain HTTPS
/// URLs; Anthropic wants an explicit source object either way.
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, b64)) = rest.split_once(',') {
            let mime = meta.strip_suffix(";base64").unwrap_or(meta);
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": b64 },
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

// ─── Non-streaming response parsing ───────────────────────────────────────────

fn parse_complete_response(v: &Value, model_id: &str) -> Result<LlmResponse, ProviderError> {
    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Protocol("response missing content array".into()))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => content.push_str(block["text"].as_str().unwrap_or("")),
            "tool_use" => tool_calls.push(ToolCallPart {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    let usage = v.get("usage").map(|u| {
        let input = u["input_tokens"].as_u64().unwrap_or(0);
        let output = u["output_tokens"].as_u64().unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: output,
            estimated_cost: catalog::estimate_cost(model_id, input, output),
        }
    });

    Ok(LlmResponse {
        content,
        tool_calls,
        usage,
        finish_reason: map_stop_reason(v["stop_reason"].as_str().unwrap_or("")),
        model_id: model_id.to_string(),
        provider: "anthropic".to_string(),
    })
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::MaxTokens,
        "tool_use" => FinishReason::ToolCall,
        _ => FinishReason::Stop,
    }
}

// ─── Streaming state machine ──────────────────────────────────────────────────

struct ToolUseBuilder {
    id: String,
    name: String,
    json: String,
    /// Server-executed tool variants fall back to a null argument payload on
    /// parse failure instead of being dropped.
    server_tool: bool,
}

/// Incremental SSE parser for the messages stream.
///
/// Tool arguments arrive as `input_json_delta` fragments keyed by block
/// index; they are buffered per index and surfaced as a single `ToolCall`
/// only at the matching `content_block_stop`.
pub(crate) struct StreamState {
    line_buf: String,
    builders: HashMap<u64, ToolUseBuilder>,
    model_id: String,
    /// Input tokens captured at `message_start`, used as the fallback when
    /// no later usage report arrives.
    start_input_tokens: u64,
    latest_input_tokens: Option<u64>,
    latest_output_tokens: u64,
    cache_info: Option<PromptCacheInfo>,
    finish: Option<FinishReason>,
    finished: bool,
}

impl StreamState {
    pub(crate) fn new(model_id: &str) -> Self {
        Self {
            line_buf: String::new(),
            builders: HashMap::new(),
            model_id: model_id.to_string(),
            start_input_tokens: 0,
            latest_input_tokens: None,
            latest_output_tokens: 0,
            cache_info: None,
            finish: None,
            finished: false,
        }
    }

    /// Feed raw transport text; returns the chunks produced by every
    /// complete line it contained.
    pub(crate) fn push_text(&mut self, text: &str) -> Vec<LlmStreamChunk> {
        self.line_buf.push_str(text);
        let mut out = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line = self.line_buf[..pos].trim_end_matches('\r').to_string();
            self.line_buf.drain(..=pos);
            self.handle_line(&line, &mut out);
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<LlmStreamChunk>) {
        let line = line.trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with("event:") {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim().trim_start_matches('\u{feff}');
        if data == "[DONE]" {
            if !self.finished {
                out.push(self.terminal_chunk());
            }
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => self.handle_event(&v, out),
            // Malformed payloads are a per-chunk problem; skip and continue.
            Err(e) => debug!(error = %e, "skipping unparseable stream payload"),
        }
    }

    fn handle_event(&mut self, v: &Value, out: &mut Vec<LlmStreamChunk>) {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.start_input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                    let read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                    let write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                    if read > 0 || write > 0 {
                        self.cache_info = Some(PromptCacheInfo {
                            cache_read_tokens: read,
                            cache_creation_tokens: write,
                        });
                    }
                }
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" | "server_tool_use" => {
                        self.builders.insert(
                            index,
                            ToolUseBuilder {
                                id: block["id"].as_str().unwrap_or("").to_string(),
                                name: block["name"].as_str().unwrap_or("").to_string(),
                                json: String::new(),
                                server_tool: block["type"] == "server_tool_use",
                            },
                        );
                    }
                    "web_search_tool_result" => {
                        out.push(LlmStreamChunk {
                            event_type: Some("web_search_tool_result".into()),
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if !text.is_empty() {
                            out.push(LlmStreamChunk::content(text));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(b) = self.builders.get_mut(&index) {
                            b.json.push_str(delta["partial_json"].as_str().unwrap_or(""));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                if let Some(builder) = self.builders.remove(&index) {
                    out.push(finish_builder(builder));
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.finish = Some(map_stop_reason(reason));
                }
                if let Some(usage) = v.get("usage") {
                    if let Some(n) = usage["output_tokens"].as_u64() {
                        self.latest_output_tokens = n;
                    }
                    if let Some(n) = usage["input_tokens"].as_u64() {
                        self.latest_input_tokens = Some(n);
                    }
                }
            }
            "message_stop" => {
                if !self.finished {
                    out.push(self.terminal_chunk());
                }
            }
            // ping and future event types
            _ => {}
        }
    }

    fn terminal_chunk(&mut self) -> LlmStreamChunk {
        self.finished = true;
        let input = self.latest_input_tokens.unwrap_or(self.start_input_tokens);
        let output = self.latest_output_tokens;
        LlmStreamChunk {
            usage: Some(Usage {
                input_tokens: input,
                output_tokens: output,
                estimated_cost: catalog::estimate_cost(&self.model_id, input, output),
            }),
            finish_reason: Some(self.finish.unwrap_or(FinishReason::Stop)),
            is_complete: true,
            prompt_cache_info: self.cache_info.take(),
            ..Default::default()
        }
    }
}

fn finish_builder(builder: ToolUseBuilder) -> LlmStreamChunk {
    let parsed: Result<Value, _> = if builder.json.is_empty() {
        Ok(Value::Object(Default::default()))
    } else {
        serde_json::from_str(&builder.json)
    };
    match parsed {
        Ok(arguments) => {
            let mut chunk = LlmStreamChunk::tool(ToolCallPart {
                id: builder.id,
                name: builder.name,
                arguments,
            });
            if builder.server_tool {
                chunk.event_type = Some("server_tool_use".into());
            }
            chunk
        }
        Err(e) if builder.server_tool => {
            // Server-tool events must not be dropped; surface with a null
            // payload so the consumer still sees the call.
            warn!(tool = %builder.name, error = %e, "server tool arguments unparseable");
            let mut chunk = LlmStreamChunk::tool(ToolCallPart {
                id: builder.id,
                name: builder.name,
                arguments: Value::Null,
            });
            chunk.event_type = Some("server_tool_use".into());
            chunk
        }
        Err(e) => {
            warn!(
                tool = %builder.name,
                tool_call_id = %builder.id,
                error = %e,
                "tool call arguments were not valid JSON; substituting {{}}"
            );
            LlmStreamChunk::tool(ToolCallPart {
                id: builder.id,
                name: builder.name,
                arguments: Value::Object(Default::default()),
            })
        }
    }
}

// ─── Transport helpers ────────────────────────────────────────────────────────

fn normalize_base_url(url: &str) -> String {
    format!("{}/", url.trim().trim_end_matches('/'))
}

/// Header values must not contain CR/LF (header injection) and stray
/// whitespace from copy-pasted keys breaks authentication silently.
fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize - 1).min(BACKOFF_SCHEDULE.len() - 1);
    let jitter_ms = rand::thread_rng().gen_range(50..=250);
    Duration::from_secs_f64(BACKOFF_SCHEDULE[idx]) + Duration::from_millis(jitter_ms)
}

/// Parse a `Retry-After` header: either delta-seconds or an HTTP-date.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Returns `true` when the sleep was interrupted by cancellation.
async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn log_rate_limit_headers(resp: &reqwest::Response) {
    for (name, value) in resp.headers() {
        if name.as_str().starts_with("x-ratelimit-") {
            debug!(header = %name, value = ?value, "rate limit header");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
