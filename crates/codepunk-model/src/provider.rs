// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProviderError, FinishReason, LlmRequest, LlmResponse, LlmStreamChunk, Usage,
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<LlmStreamChunk, ProviderError>> + Send>>;

/// A language-model provider.
///
/// `send` and `stream` must be behaviourally equivalent: collecting a
/// stream with [`collect_response`] yields the response `send` would have
/// returned for the same request.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider identifier ("anthropic", "mock", …).
    fn name(&self) -> &str;

    /// One-shot completion.
    async fn send(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError>;

    /// Streaming completion. The final chunk has `is_complete = true`.
    async fn stream(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError>;

    /// Count the prompt tokens this request would consume.
    ///
    /// Default: unsupported. The Anthropic driver overrides this with the
    /// count-tokens endpoint.
    async fn count_tokens(&self, _req: &LlmRequest) -> Result<u64, ProviderError> {
        Err(ProviderError::Protocol(
            "token counting not supported by this provider".into(),
        ))
    }
}

/// Fold a chunk stream into a single [`LlmResponse`].
///
/// Content deltas are concatenated, tool calls collected in emission order,
/// and the latest usage / finish reason win. A stream that ends without a
/// terminal chunk still produces a response; the finish reason defaults to
/// `Stop` only when the provider reported one was never received.
pub async fn collect_response(
    mut stream: ChunkStream,
    provider: &str,
    model_id: &str,
) -> Result<LlmResponse, ProviderError> {
    use futures::StreamExt;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<FinishReason> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(delta) = chunk.content_delta {
            content.push_str(&delta);
        }
        if let Some(tc) = chunk.tool_call {
            tool_calls.push(tc);
        }
        if let Some(u) = chunk.usage {
            usage = Some(u);
        }
        if let Some(f) = chunk.finish_reason {
            finish_reason = Some(f);
        }
    }

    Ok(LlmResponse {
        content,
        tool_calls,
        usage,
        finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
        model_id: model_id.to_string(),
        provider: provider.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallPart;
    use serde_json::json;

    fn chunks(v: Vec<LlmStreamChunk>) -> ChunkStream {
        Box::pin(futures::stream::iter(v.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn collect_concatenates_deltas() {
        let s = chunks(vec![
            LlmStreamChunk::content("Hel"),
            LlmStreamChunk::content("lo"),
        ]);
        let resp = collect_response(s, "mock", "m").await.unwrap();
        assert_eq!(resp.content, "Hello");
    }

    #[tokio::test]
    async fn collect_gathers_tool_calls_in_order() {
        let s = chunks(vec![
            LlmStreamChunk::tool(ToolCallPart {
                id: "a".into(),
                name: "one".into(),
                arguments: json!({}),
            }),
            LlmStreamChunk::tool(ToolCallPart {
                id: "b".into(),
                name: "two".into(),
                arguments: json!({}),
            }),
        ]);
        let resp = collect_response(s, "mock", "m").await.unwrap();
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "a");
    }

    #[tokio::test]
    async fn collect_defaults_finish_reason_to_stop() {
        let s = chunks(vec![LlmStreamChunk::content("x")]);
        let resp = collect_response(s, "mock", "m").await.unwrap();
        assert_eq!(resp.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn collect_keeps_latest_usage() {
        let s = chunks(vec![
            LlmStreamChunk {
                usage: Some(Usage {
                    input_tokens: 1,
                    output_tokens: 0,
                    estimated_cost: None,
                }),
                ..Default::default()
            },
            LlmStreamChunk {
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 20,
                    estimated_cost: None,
                }),
                is_complete: true,
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            },
        ]);
        let resp = collect_response(s, "mock", "m").await.unwrap();
        assert_eq!(resp.usage.unwrap().output_tokens, 20);
    }
}
