// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// The result of executing a tool.
///
/// Tool-domain failures are data, not errors: a failed execution sets
/// `is_error` and the loop keeps running. `user_cancelled` is a
/// tool-reported signal (e.g. the approval prompt was dismissed) that the
/// dispatcher forwards verbatim; the orchestrator ends the loop on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    pub user_cancelled: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            user_cancelled: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            user_cancelled: false,
        }
    }

    pub fn cancelled(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            user_cancelled: true,
        }
    }
}

/// A local capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn parameters_schema(&self) -> Value;
    /// Write-side tools mutate the working tree; their successful results
    /// are committed into the active git shadow session.
    fn is_write_tool(&self) -> bool {
        false
    }
    async fn execute(&self, args: &Value, cancel: &CancellationToken) -> ToolResult;
}

/// A tool schema snapshot — mirrors `codepunk_model::ToolDefinition` while
/// keeping this crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_flags_set() {
        let r = ToolResult::ok("fine");
        assert!(!r.is_error);
        assert!(!r.user_cancelled);
    }

    #[test]
    fn error_result_sets_is_error_only() {
        let r = ToolResult::error("bad");
        assert!(r.is_error);
        assert!(!r.user_cancelled);
    }

    #[test]
    fn cancelled_result_is_not_an_error() {
        let r = ToolResult::cancelled("stopped");
        assert!(!r.is_error);
        assert!(r.user_cancelled);
    }
}
