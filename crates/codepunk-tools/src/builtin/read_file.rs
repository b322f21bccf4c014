// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::edit::FileEditService;
use crate::tool::{Tool, ToolResult};

/// Byte ceiling for content returned to the model in one read.
const OUTPUT_LIMIT_BYTES: usize = 48_000;

pub struct ReadFileTool {
    edit: Arc<FileEditService>,
}

impl ReadFileTool {
    pub fn new(edit: Arc<FileEditService>) -> Self {
        Self { edit }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace and return its contents. \
         'path' is resolved relative to the workspace root; paths outside \
         the root, binary files, and files over the size limit are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _cancel: &CancellationToken) -> ToolResult {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'path' argument");
        };
        match self.edit.read_validated(path) {
            Ok(content) if content.len() > OUTPUT_LIMIT_BYTES => {
                let mut cut = OUTPUT_LIMIT_BYTES;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                ToolResult::ok(format!(
                    "{}\n...[truncated at {} bytes]",
                    &content[..cut],
                    OUTPUT_LIMIT_BYTES
                ))
            }
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::AutoApprovalService;

    fn tool(root: &std::path::Path) -> ReadFileTool {
        let svc = Arc::new(FileEditService::new(
            root,
            Arc::new(AutoApprovalService),
            5 * 1024 * 1024,
        ));
        ReadFileTool::new(svc)
    }

    #[tokio::test]
    async fn reads_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "file contents").unwrap();
        let out = tool(dir.path())
            .execute(&json!({"path": "f.txt"}), &CancellationToken::new())
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "file contents");
    }

    #[tokio::test]
    async fn missing_path_argument_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(&json!({}), &CancellationToken::new())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("path"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(&json!({"path": "gone.txt"}), &CancellationToken::new())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(60_000)).unwrap();
        let out = tool(dir.path())
            .execute(&json!({"path": "big.txt"}), &CancellationToken::new())
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("truncated"));
    }

    #[test]
    fn read_file_is_not_a_write_tool() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!tool(dir.path()).is_write_tool());
    }
}
