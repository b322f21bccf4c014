// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProviderError,
    provider::{collect_response, ChunkStream, LlmProvider},
    FinishReason, LlmRequest, LlmResponse, LlmStreamChunk, Role, ToolCallPart, Usage,
};

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let stream = self.stream(req, cancel).await?;
        collect_response(stream, "mock", "mock-model").await
    }

    async fn stream(
        &self,
        req: &LlmRequest,
        _cancel: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let chunks = vec![
            LlmStreamChunk::content(format!("MOCK: {reply}")),
            LlmStreamChunk {
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    estimated_cost: None,
                }),
                finish_reason: Some(FinishReason::Stop),
                is_complete: true,
                ..Default::default()
            },
        ];
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

/// A pre-scripted mock provider. Each `stream`/`send` call pops the next
/// chunk script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Mutex<Vec<Vec<LlmStreamChunk>>>,
    /// Number of completion calls made against this provider.
    pub call_count: Arc<Mutex<u32>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<LlmRequest>>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Vec<LlmStreamChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            call_count: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    fn terminal(finish: FinishReason) -> LlmStreamChunk {
        LlmStreamChunk {
            usage: Some(Usage {
                input_tokens: 5,
                output_tokens: 5,
                estimated_cost: Some(0.001),
            }),
            finish_reason: Some(finish),
            is_complete: true,
            ..Default::default()
        }
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            LlmStreamChunk::content(reply.into()),
            Self::terminal(FinishReason::Stop),
        ]])
    }

    /// Provider that returns one tool call, then a text reply on the next call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                LlmStreamChunk::tool(ToolCallPart {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments,
                }),
                Self::terminal(FinishReason::ToolCall),
            ],
            vec![
                LlmStreamChunk::content(final_text.into()),
                Self::terminal(FinishReason::Stop),
            ],
        ])
    }

    /// Provider that emits the same tool call on every iteration — used to
    /// exercise iteration-cap and repetition guardrails.
    pub fn always_tool(tool_name: impl Into<String>, arguments: Value) -> Self {
        let name = tool_name.into();
        // Enough scripts for any configured iteration cap in the tests.
        let scripts = (0..32)
            .map(|i| {
                vec![
                    LlmStreamChunk::tool(ToolCallPart {
                        id: format!("tc-{i}"),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                    Self::terminal(FinishReason::ToolCall),
                ]
            })
            .collect();
        Self::new(scripts)
    }

    fn next_script(&self) -> Vec<LlmStreamChunk> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            vec![
                LlmStreamChunk::content("[no more scripts]"),
                Self::terminal(FinishReason::Stop),
            ]
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn send(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let stream = self.stream(req, cancel).await?;
        collect_response(stream, "scripted-mock", &req.model_id).await
    }

    async fn stream(
        &self,
        req: &LlmRequest,
        _cancel: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        *self.last_request.lock().unwrap() = Some(req.clone());
        let chunks = self.next_script();
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use futures::StreamExt;
    use serde_json::json;

    fn request(text: &str) -> LlmRequest {
        LlmRequest {
            model_id: "mock-model".into(),
            messages: vec![Message::user("s", text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let resp = p.send(&request("hi"), &CancellationToken::new()).await.unwrap();
        assert!(resp.content.contains("MOCK: hi"));
    }

    #[tokio::test]
    async fn mock_stream_ends_with_complete_chunk() {
        let p = MockProvider;
        let mut stream = p.stream(&request("x"), &CancellationToken::new()).await.unwrap();
        let mut last = None;
        while let Some(c) = stream.next().await {
            last = Some(c.unwrap());
        }
        assert!(last.unwrap().is_complete);
    }

    #[tokio::test]
    async fn scripted_tool_then_text_pops_scripts_in_order() {
        let p = ScriptedMockProvider::tool_then_text("tc", "shell", json!({"cmd": "ls"}), "done");
        let cancel = CancellationToken::new();

        let first = p.send(&request("go"), &cancel).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.finish_reason, FinishReason::ToolCall);

        let second = p.send(&request("go"), &cancel).await.unwrap();
        assert_eq!(second.content, "done");
        assert_eq!(second.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn scripted_records_last_request_and_call_count() {
        let p = ScriptedMockProvider::always_text("y");
        let _ = p.send(&request("inspect me"), &CancellationToken::new()).await;
        assert_eq!(*p.call_count.lock().unwrap(), 1);
        let last = p.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().messages[0].text(), "inspect me");
    }

    #[tokio::test]
    async fn scripted_fallback_when_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let resp = p.send(&request("x"), &CancellationToken::new()).await.unwrap();
        assert!(resp.content.contains("no more scripts"));
    }
}
