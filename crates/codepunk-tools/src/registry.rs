// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tool::{Tool, ToolResult, ToolSpec};

/// Dispatcher failure that must stop the loop rather than feed back into it.
///
/// Everything else — unknown names, timeouts, panics — is returned to the
/// model as an error [`ToolResult`].
#[derive(Debug, Error)]
pub enum ToolDispatchError {
    #[error("tool execution cancelled")]
    Cancelled,
}

/// When compact descriptions are on, advertised text is cut at the first
/// sentence or this many chars, whichever comes first.
const COMPACT_DESCRIPTION_CHARS: usize = 140;

/// Central registry and dispatcher for all available tools.
///
/// Lookup is case-insensitive (names are stored lowercased). Execution is
/// wrapped in a per-tool deadline; a tripped deadline produces an error
/// result while cancellation of the caller's token propagates upward so it
/// stays distinguishable from the internal timeout.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
    compact_descriptions: bool,
}

impl ToolRegistry {
    pub fn new(timeout: Duration, compact_descriptions: bool) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
            compact_descriptions,
        }
    }

    pub fn from_config(
        chat: &codepunk_config::ChatConfig,
        tools: &codepunk_config::ToolsConfig,
    ) -> Self {
        Self::new(
            Duration::from_secs(chat.tool_execution_timeout_secs),
            tools.compact_descriptions,
        )
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools
            .insert(tool.name().to_lowercase(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_lowercase()).cloned()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `name` refers to a registered write-side tool.
    pub fn is_write_tool(&self, name: &str) -> bool {
        self.get(name).map(|t| t.is_write_tool()).unwrap_or(false)
    }

    /// Snapshot of all registered tools, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: self.advertised_description(t.description()),
                parameters: t.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.name().to_string()).collect();
        names.sort();
        names
    }

    /// Execute `name` with `args` under the per-tool deadline.
    ///
    /// Returns `Err` only for caller cancellation; every tool-domain
    /// failure comes back as an error [`ToolResult`].
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolDispatchError> {
        let Some(tool) = self.get(name) else {
            return Ok(ToolResult::error(format!("Tool '{name}' not found")));
        };

        debug!(tool = name, "executing tool");
        let args = args.clone();
        let tool_cancel = cancel.child_token();
        // Spawned so a panicking tool is isolated from the loop.
        let mut handle =
            tokio::spawn(async move { tool.execute(&args, &tool_cancel).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                Err(ToolDispatchError::Cancelled)
            }
            joined = tokio::time::timeout(self.timeout, &mut handle) => match joined {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(join_err)) => {
                    warn!(tool = name, error = %join_err, "tool task failed");
                    Ok(ToolResult::error(format!("Error executing tool: {join_err}")))
                }
                Err(_elapsed) => {
                    handle.abort();
                    Ok(ToolResult::error(format!(
                        "Tool execution timed out after {}s",
                        self.timeout.as_secs()
                    )))
                }
            },
        }
    }

    fn advertised_description(&self, full: &str) -> String {
        if !self.compact_descriptions {
            return full.to_string();
        }
        compact_description(full)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(120), false)
    }
}

/// First sentence, or the first 140 chars with an ellipsis.
fn compact_description(full: &str) -> String {
    let first_sentence = full
        .split_inclusive(". ")
        .next()
        .unwrap_or(full)
        .trim_end();
    if first_sentence.chars().count() <= COMPACT_DESCRIPTION_CHARS
        && first_sentence.len() < full.len()
    {
        return first_sentence.to_string();
    }
    if full.chars().count() <= COMPACT_DESCRIPTION_CHARS {
        return full.to_string();
    }
    let mut out: String = full.chars().take(COMPACT_DESCRIPTION_CHARS).collect();
    out.push('…');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
