// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::edit::{FileEditError, FileEditService, WriteFileRequest};
use crate::tool::{Tool, ToolResult};

pub struct WriteFileTool {
    edit: Arc<FileEditService>,
    require_approval: bool,
}

impl WriteFileTool {
    pub fn new(edit: Arc<FileEditService>, require_approval: bool) -> Self {
        Self {
            edit,
            require_approval,
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a complete file to the workspace, creating it if it does not \
         exist. The change is presented to the user for approval before it \
         lands; writes are atomic."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "The full new file content"
                }
            },
            "required": ["path", "content"],
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
        let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'content' argument");
        };

        let result = self
            .edit
            .write_file(WriteFileRequest {
                file_path: path.to_string(),
                content: content.to_string(),
                require_approval: self.require_approval,
            })
            .await;

        match result {
            Ok(out) => ToolResult::ok(format!(
                "Wrote {} (+{} -{} lines, ~{} tokens saved)",
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
