// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use codepunk_git::GitShadowSession;
use codepunk_tools::{ToolDispatchError, ToolRegistry, ToolResult};

/// Errors that abort the tool loop. Tool-domain failures stay inside the
/// returned [`ToolResult`] and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("tool execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Git(#[from] codepunk_git::GitError),
}

/// Wraps tool dispatch to record write-tool results into the active git
/// shadow session.
///
/// Successful results from write-side tools become shadow-branch commits;
/// every call updates the session's activity clock. A git failure marks
/// the session failed (so startup cleanup reverts it) and propagates.
pub struct ToolInterceptor {
    tools: Arc<ToolRegistry>,
    git: Option<Arc<Mutex<GitShadowSession>>>,
}

impl ToolInterceptor {
    pub fn new(tools: Arc<ToolRegistry>, git: Option<Arc<Mutex<GitShadowSession>>>) -> Self {
        Self { tools, git }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub async fn execute(
        &self,
        name: &str,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, InterceptError> {
        let result = match self.tools.execute(name, arguments, cancel).await {
            Ok(r) => r,
            Err(ToolDispatchError::Cancelled) => return Err(InterceptError::Cancelled),
        };

        if let Some(git) = &self.git {
            let mut git = git.lock().await;
            if git.is_active() {
                let commits = self.tools.is_write_tool(name)
                    && !result.is_error
                    && !result.user_cancelled;
                if commits {
                    let summary = summarize_arguments(arguments);
                    if let Err(e) = git.commit_tool_call(name, &summary).await {
                        git.mark_failed(&e.to_string());
                        return Err(InterceptError::Git(e));
                    }
                } else if let Err(e) = git.touch() {
                    // Activity tracking is best-effort; a failed persist must
                    // not turn a read-only tool call into a loop abort.
                    warn!(error = %e, "failed to update git session activity");
                }
            }
        }

        Ok(result)
    }
}

/// Short human-readable argument summary for the commit subject line.
fn summarize_arguments(arguments: &Value) -> String {
    if let Some(path) = arguments
        .get("path")
        .or_else(|| arguments.get("file_path"))
        .and_then(|v| v.as_str())
    {
        return path.to_string();
    }
    if let Some(cmd) = arguments.get("command").and_then(|v| v.as_str()) {
        return truncate(cmd, 60);
    }
    truncate(&arguments.to_string(), 60)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codepunk_git::{GitCli, GitSessionOptions};
    use codepunk_tools::Tool;
    use serde_json::json;
    use std::path::Path;

    struct TouchTool {
        root: std::path::PathBuf,
        write_side: bool,
        fail: bool,
    }

    #[async_trait]
    impl Tool for TouchTool {
        fn name(&self) -> &str {
            "touch"
        }
        fn description(&self) -> &str {
            "creates a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn is_write_tool(&self) -> bool {
            self.write_side
        }
        async fn execute(&self, args: &Value, _cancel: &CancellationToken) -> ToolResult {
            if self.fail {
                return ToolResult::error("tool failed");
            }
            let name = args.get("path").and_then(|v| v.as_str()).unwrap_or("f.txt");
            std::fs::write(self.root.join(name), "content\n").unwrap();
            ToolResult::ok(format!("created {name}"))
        }
    }

    async fn init_repo(dir: &Path) -> GitCli {
        let cli = GitCli::new(dir);
        cli.run_checked(&["init"]).await.unwrap();
        cli.run_checked(&["config", "user.email", "t@example.com"])
            .await
            .unwrap();
        cli.run_checked(&["config", "user.name", "T"]).await.unwrap();
        std::fs::write(dir.join("README.md"), "r\n").unwrap();
        cli.run_checked(&["add", "-A"]).await.unwrap();
        cli.run_checked(&["commit", "-m", "initial"]).await.unwrap();
        cli.run_checked(&["branch", "-M", "main"]).await.unwrap();
        cli
    }

    async fn interceptor_with(
        repo: &Path,
        state: &Path,
        tool: TouchTool,
    ) -> (ToolInterceptor, Arc<Mutex<GitShadowSession>>) {
        let mut registry = ToolRegistry::default();
        registry.register(tool);
        let mut session = GitShadowSession::new(repo, state, GitSessionOptions::default());
        session.begin("sess").await.unwrap();
        let git = Arc::new(Mutex::new(session));
        (
            ToolInterceptor::new(Arc::new(registry), Some(git.clone())),
            git,
        )
    }

    #[tokio::test]
    async fn write_tool_result_is_committed() {
        let repo = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;
        let (icpt, git) = interceptor_with(
            repo.path(),
            state.path(),
            TouchTool {
                root: repo.path().into(),
                write_side: true,
                fail: false,
            },
        )
        .await;

        let out = icpt
            .execute("touch", &json!({"path": "a.txt"}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.is_error);

        let git = git.lock().await;
        let commits = &git.state().unwrap().tool_call_commits;
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].tool_name, "touch");
        assert_eq!(commits[0].files_changed, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn read_only_tool_does_not_commit() {
        let repo = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;
        let (icpt, git) = interceptor_with(
            repo.path(),
            state.path(),
            TouchTool {
                root: repo.path().into(),
                write_side: false,
                fail: false,
            },
        )
        .await;

        icpt.execute("touch", &json!({"path": "a.txt"}), &CancellationToken::new())
            .await
            .unwrap();

        let git = git.lock().await;
        assert!(git.state().unwrap().tool_call_commits.is_empty());
    }

    #[tokio::test]
    async fn failed_tool_result_does_not_commit() {
        let repo = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;
        let (icpt, git) = interceptor_with(
            repo.path(),
            state.path(),
            TouchTool {
                root: repo.path().into(),
                write_side: true,
                fail: true,
            },
        )
        .await;

        let out = icpt
            .execute("touch", &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_error);

        let git = git.lock().await;
        assert!(git.state().unwrap().tool_call_commits.is_empty());
    }

    #[tokio::test]
    async fn works_without_a_git_session() {
        let mut registry = ToolRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        registry.register(TouchTool {
            root: dir.path().into(),
            write_side: true,
            fail: false,
        });
        let icpt = ToolInterceptor::new(Arc::new(registry), None);
        let out = icpt
            .execute("touch", &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.is_error);
    }

    #[test]
    fn argument_summary_prefers_path() {
        assert_eq!(summarize_arguments(&json!({"path": "src/a.rs"})), "src/a.rs");
        assert_eq!(
            summarize_arguments(&json!({"command": "cargo test"})),
            "cargo test"
        );
        let long = "x".repeat(100);
        assert!(summarize_arguments(&json!({"command": long})).ends_with('…'));
    }
}
