// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::edit::{FileEditError, FileEditService, ReplaceInFileRequest};
use crate::tool::{Tool, ToolResult};

pub struct ReplaceInFileTool {
    edit: Arc<FileEditService>,
    require_approval: bool,
}

impl ReplaceInFileTool {
    pub fn new(edit: Arc<FileEditService>, require_approval: bool) -> Self {
        Self {
            edit,
            require_approval,
        }
    }
}

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &str {
        "replace_in_file"
    }

    fn description(&self) -> &str {
        "Replace every literal occurrence of 'old_string' in a file with \
         'new_string'. Fails when the string is absent, when \
         'expected_occurrences' is given and the count differs, or when the \
         replacement would change nothing. Much cheaper than rewriting the \
         whole file for a small edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to find (literal, not regex)"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "expected_occurrences": {
                    "type": "integer",
                    "description": "Fail unless the file contains exactly this many occurrences"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn is_write_tool(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Value, _cancel: &CancellationToken) -> ToolResult {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'path' argument");
        };
        let Some(old_string) = args.get("old_string").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'old_string' argument");
        };
        let Some(new_string) = args.get("new_string").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'new_string' argument");
        };
        let expected = args
            .get("expected_occurrences")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        let result = self
            .edit
            .replace_in_file(ReplaceInFileRequest {
                file_path: path.to_string(),
                old_string: old_string.to_string(),
                new_string: new_string.to_string(),
                expected_occurrences: expected,
                require_approval: self.require_approval,
            })
            .await;

        match result {
            Ok(out) => ToolResult::ok(format!(
                "Replaced in {} (+{} -{} lines, ~{} tokens saved)",
                path, out.stats.lines_added, out.stats.lines_removed, out.tokens_saved
            )),
            Err(FileEditError::UserCancelled) => {
                ToolResult::cancelled("Edit cancelled by user")
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
