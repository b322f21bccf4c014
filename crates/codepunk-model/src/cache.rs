// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::ProviderError,
    provider::{ChunkStream, LlmProvider},
    FinishReason, LlmRequest, LlmResponse, LlmStreamChunk,
};

/// Identity of a cacheable completion: the provider plus the full request.
pub struct CacheContext<'a> {
    pub provider: &'a str,
    pub request: &'a LlmRequest,
}

impl CacheContext<'_> {
    /// SHA-256 over the provider name and the serialized request. Every
    /// field of the request participates, so any change in messages, tools,
    /// or sampling knobs produces a distinct key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update(b"\0");
        // Serialization of LlmRequest is infallible (no maps with non-string
        // keys); fall back to an empty body rather than panic.
        let body = serde_json::to_vec(self.request).unwrap_or_default();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// Optional response cache consulted before a provider call.
#[async_trait]
pub trait PromptCache: Send + Sync {
    async fn try_get(&self, ctx: &CacheContext<'_>) -> Option<LlmResponse>;
    async fn store(&self, ctx: &CacheContext<'_>, response: &LlmResponse);
}

/// Process-local LRU cache.
pub struct MemoryPromptCache {
    entries: Mutex<LruCache<String, LlmResponse>>,
}

impl MemoryPromptCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }
}

#[async_trait]
impl PromptCache for MemoryPromptCache {
    async fn try_get(&self, ctx: &CacheContext<'_>) -> Option<LlmResponse> {
        self.entries
            .lock()
            .expect("prompt cache lock poisoned")
            .get(&ctx.fingerprint())
            .cloned()
    }

    async fn store(&self, ctx: &CacheContext<'_>, response: &LlmResponse) {
        self.entries
            .lock()
            .expect("prompt cache lock poisoned")
            .put(ctx.fingerprint(), response.clone());
    }
}

/// Provider wrapper that consults a [`PromptCache`] around the inner driver.
///
/// On a streaming hit the cached response is replayed as a synthetic chunk
/// sequence — one chunk per tool call, then a terminal chunk with the
/// content, usage, and finish reason — so consumers cannot tell a replay
/// from a live stream. On a miss the live stream is forwarded unchanged
/// while a copy is accumulated and stored once the stream ends.
pub struct CachingProvider {
    inner: Arc<dyn LlmProvider>,
    cache: Option<Arc<dyn PromptCache>>,
}

impl CachingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, cache: Option<Arc<dyn PromptCache>>) -> Self {
        Self { inner, cache }
    }

    fn replay_chunks(response: &LlmResponse) -> Vec<LlmStreamChunk> {
        let mut chunks: Vec<LlmStreamChunk> = response
            .tool_calls
            .iter()
            .cloned()
            .map(LlmStreamChunk::tool)
            .collect();
        chunks.push(LlmStreamChunk {
            content_delta: if response.content.is_empty() {
                None
            } else {
                Some(response.content.clone())
            },
            usage: response.usage.clone(),
            finish_reason: Some(response.finish_reason),
            is_complete: true,
            ..Default::default()
        });
        chunks
    }
}

#[async_trait]
impl LlmProvider for CachingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        if let Some(cache) = &self.cache {
            let ctx = CacheContext {
                provider: self.inner.name(),
                request: req,
            };
            if let Some(hit) = cache.try_get(&ctx).await {
                debug!(fingerprint = %ctx.fingerprint(), "prompt cache hit");
                return Ok(hit);
            }
            let response = self.inner.send(req, cancel).await?;
            cache.store(&ctx, &response).await;
            return Ok(response);
        }
        self.inner.send(req, cancel).await
    }

    async fn stream(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let Some(cache) = self.cache.clone() else {
            return self.inner.stream(req, cancel).await;
        };

        let ctx = CacheContext {
            provider: self.inner.name(),
            request: req,
        };
        if let Some(hit) = cache.try_get(&ctx).await {
            debug!(fingerprint = %ctx.fingerprint(), "prompt cache hit (stream replay)");
            let chunks = Self::replay_chunks(&hit);
            return Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok),
            )));
        }

        let mut inner = self.inner.stream(req, cancel).await?;

        // Forward the live stream through a channel while accumulating a
        // response to store when it finishes. Storing happens in the
        // forwarding task so the consumer never waits on the cache write.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<LlmStreamChunk, ProviderError>>(64);
        let provider = self.inner.name().to_string();
        let model_id = req.model_id.clone();
        let req_owned = req.clone();
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut content = String::new();
            let mut tool_calls = Vec::new();
            let mut usage = None;
            let mut finish_reason = None;
            let mut failed = false;

            while let Some(item) = inner.next().await {
                if let Ok(chunk) = &item {
                    if let Some(delta) = &chunk.content_delta {
                        content.push_str(delta);
                    }
                    if let Some(tc) = &chunk.tool_call {
                        tool_calls.push(tc.clone());
                    }
                    if let Some(u) = &chunk.usage {
                        usage = Some(u.clone());
                    }
                    if let Some(f) = chunk.finish_reason {
                        finish_reason = Some(f);
                    }
                } else {
                    failed = true;
                }
                if tx.send(item).await.is_err() {
                    // Consumer dropped the stream; nothing left to forward
                    // and a partial response must not be cached.
                    return;
                }
            }

            if failed {
                warn!("stream ended with an error; not caching the partial response");
                return;
            }
            let response = LlmResponse {
                content,
                tool_calls,
                usage,
                finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
                model_id,
                provider: provider.clone(),
            };
            let ctx = CacheContext {
                provider: &provider,
                request: &req_owned,
            };
            cache.store(&ctx, &response).await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn count_tokens(&self, req: &LlmRequest) -> Result<u64, ProviderError> {
        self.inner.count_tokens(req).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
