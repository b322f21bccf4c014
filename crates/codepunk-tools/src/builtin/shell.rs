// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{Tool, ToolResult};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head / tail of oversized output. Errors and
/// summaries almost always appear at the end of build output, so the tail
/// matters as much as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Runs a shell command in the workspace.
///
/// Counted as a write-side tool: a shell command may mutate the working
/// tree, so its successful results are committed into the git shadow
/// session like file edits.
pub struct ShellTool {
    pub workdir: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            workdir: None,
            timeout_secs: 60,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr. \
         'command' is run with bash -c in the workspace directory. \
         Output is capped at ~20 KB; when larger, the first and last 100 \
         lines are preserved with an omission marker in the middle. \
         Prefer non-interactive commands; avoid anything that needs a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash one-liner to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn is_write_tool(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Value, cancel: &CancellationToken) -> ToolResult {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required 'command' argument");
        };
        let timeout = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        // Detach from any controlling terminal: stdin from /dev/null stops
        // isatty(0) probes, kill_on_drop reaps the child when the timeout
        // future is dropped, and setsid() prevents the child from opening
        // /dev/tty directly.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &self.workdir {
            cmd.current_dir(wd);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolResult::error("shell command aborted");
            }
            r = tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()) => r,
        };

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }

                let code = output.status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                if code == 0 {
                    ToolResult::ok(content)
                } else {
                    ToolResult::error(format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolResult::error(format!("spawn error: {e}")),
            Err(_) => ToolResult::error(format!("timeout after {timeout}s")),
        }
    }
}

/// Truncate `s` to fit `OUTPUT_LIMIT_BYTES`, preserving the head and tail
/// with an omission marker between them.
fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();
    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines; hard cut around the middle.
        let half = OUTPUT_LIMIT_BYTES / 2;
        let mut head_end = half.min(s.len());
        while !s.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = s.len().saturating_sub(half);
        while !s.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        let omitted = s.len() - head_end - (s.len() - tail_start);
        return format!(
            "{}\n...[{} bytes omitted]...\n{}",
            &s[..head_end],
            omitted,
            &s[tail_start..]
        );
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    format!("{head}\n...[{omitted_lines} lines omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
