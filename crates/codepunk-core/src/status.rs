// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

use codepunk_tools::ToolResult;

/// Prefix marking a structured tool-status payload inside the content
/// stream. Consumers that do not recognize it treat the chunk as text.
pub const TOOL_STATUS_PREFIX: &str = "tool-status::";

/// Preview lines included in a status payload.
const MAX_PREVIEW_LINES: usize = 20;

/// Build the `tool-status::{json}` chunk emitted after each tool result.
pub fn tool_status_chunk(
    tool_call_id: &str,
    tool_name: &str,
    arguments: &Value,
    result: &ToolResult,
) -> String {
    let file_path = arguments
        .get("path")
        .or_else(|| arguments.get("file_path"))
        .and_then(|v| v.as_str());

    let lines: Vec<&str> = result.content.lines().collect();
    let original_line_count = lines.len();
    let is_truncated = original_line_count > MAX_PREVIEW_LINES;
    let preview = lines
        .iter()
        .take(MAX_PREVIEW_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    let mut payload = json!({
        "toolCallId": tool_call_id,
        "toolName": tool_name,
        "preview": preview,
        "isTruncated": is_truncated,
        "originalLineCount": original_line_count,
        "maxLines": MAX_PREVIEW_LINES,
        "isError": result.is_error,
    });
    if let Some(path) = file_path {
        payload["filePath"] = json!(path);
        if let Some(lang) = language_id(path) {
            payload["languageId"] = json!(lang);
        }
    }

    format!("{TOOL_STATUS_PREFIX}{payload}")
}

/// Editor language id from the file extension, for preview highlighting.
fn language_id(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    Some(match ext {
        "rs" => "rust",
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "json" => "json",
        "md" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "sh" | "bash" => "shellscript",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "go" => "go",
        "cs" => "csharp",
        "html" => "html",
        "css" => "css",
        _ => return None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
