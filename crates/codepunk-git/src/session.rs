// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::exec::{GitCli, GitError};
use crate::state::{GitSessionState, SessionStateStore, ToolCallCommit};

/// Behaviour knobs for the shadow-session subsystem.
#[derive(Debug, Clone)]
pub struct GitSessionOptions {
    pub branch_prefix: String,
    pub stash_enabled: bool,
    pub auto_revert_timeout: Duration,
    pub keep_failed_sessions: bool,
    pub disabled: bool,
}

impl Default for GitSessionOptions {
    fn default() -> Self {
        Self {
            branch_prefix: "ai/session".into(),
            stash_enabled: true,
            auto_revert_timeout: Duration::from_secs(30 * 60),
            keep_failed_sessions: false,
            disabled: false,
        }
    }
}

impl From<&codepunk_config::GitConfig> for GitSessionOptions {
    fn from(cfg: &codepunk_config::GitConfig) -> Self {
        Self {
            branch_prefix: cfg.branch_prefix.clone(),
            stash_enabled: cfg.stash_enabled,
            auto_revert_timeout: Duration::from_secs(cfg.auto_revert_minutes * 60),
            keep_failed_sessions: cfg.keep_failed_sessions,
            disabled: cfg.disabled,
        }
    }
}

/// One conversation's git shadow session.
///
/// Every write-tool result becomes a commit on a dedicated shadow branch;
/// `accept` squash-merges the branch back onto the original branch and
/// `reject` discards it. State is persisted after every mutation so a
/// crashed process can be cleaned up by [`crate::startup_cleanup`].
pub struct GitShadowSession {
    cli: GitCli,
    store: SessionStateStore,
    options: GitSessionOptions,
    state: Option<GitSessionState>,
    enabled: bool,
}

impl GitShadowSession {
    pub fn new(
        repo_root: impl AsRef<Path>,
        state_dir: impl AsRef<Path>,
        options: GitSessionOptions,
    ) -> Self {
        Self {
            cli: GitCli::new(repo_root.as_ref()),
            store: SessionStateStore::new(state_dir.as_ref()),
            options,
            state: None,
            enabled: true,
        }
    }

    /// Whether a shadow session is currently recording tool commits.
    pub fn is_active(&self) -> bool {
        self.enabled && self.state.as_ref().map(|s| !s.is_terminal()).unwrap_or(false)
    }

    pub fn state(&self) -> Option<&GitSessionState> {
        self.state.as_ref()
    }

    /// Start a shadow session for `session_id`.
    ///
    /// Returns `Ok(false)` when the subsystem is disabled or the workspace
    /// is not a git repository — every later call is then a no-op. Detached
    /// HEAD is an error: there is no branch to return to on accept/reject.
    pub async fn begin(&mut self, session_id: &str) -> Result<bool, GitError> {
        if self.options.disabled {
            self.enabled = false;
            debug!("git shadow sessions disabled by configuration");
            return Ok(false);
        }
        if !self.cli.is_repository().await {
            self.enabled = false;
            warn!(root = %self.cli.repo_root().display(),
                  "not a git repository; shadow session disabled for this conversation");
            return Ok(false);
        }

        let original_branch = self
            .cli
            .current_branch()
            .await?
            .ok_or(GitError::DetachedHead)?;

        let stash_id = if self.options.stash_enabled
            && self.cli.has_uncommitted_changes().await?
        {
            let message = format!("codepunk-{session_id}");
            self.cli
                .run_checked(&["stash", "push", "-u", "-m", &message])
                .await?;
            info!(stash = %message, "stashed uncommitted work");
            Some(message)
        } else {
            None
        };

        let shadow_branch = format!("{}/{}", self.options.branch_prefix, session_id);
        self.cli
            .run_checked(&["checkout", "-b", &shadow_branch])
            .await?;

        let state = GitSessionState::new(session_id, &shadow_branch, &original_branch, stash_id);
        self.store.save(&state)?;
        info!(branch = %shadow_branch, original = %original_branch, "shadow session started");
        self.state = Some(state);
        Ok(true)
    }

    /// Commit the working tree as the result of one tool call.
    ///
    /// Returns `Ok(None)` when the session is inactive or the tool changed
    /// nothing (nothing staged after `git add -A`).
    pub async fn commit_tool_call(
        &mut self,
        tool_name: &str,
        summary: &str,
    ) -> Result<Option<ToolCallCommit>, GitError> {
        if !self.is_active() {
            return Ok(None);
        }

        self.cli.run_checked(&["add", "-A"]).await?;
        let staged = self.cli.run(&["diff", "--cached", "--quiet"]).await?;
        if staged.success() {
            self.touch()?;
            return Ok(None);
        }

        let message = format!("AI Tool: {tool_name} - {summary}");
        self.cli.run_checked(&["commit", "-m", &message]).await?;
        let hash = self
            .cli
            .run_checked(&["rev-parse", "HEAD"])
            .await?
            .stdout
            .trim()
            .to_string();
        let files = self
            .cli
            .run_checked(&["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"])
            .await?
            .stdout
            .lines()
            .map(str::to_string)
            .collect();

        let commit = ToolCallCommit {
            tool_name: tool_name.to_string(),
            commit_hash: hash,
            committed_at: Utc::now(),
            files_changed: files,
        };
        let state = self.state.as_mut().expect("active session has state");
        state.tool_call_commits.push(commit.clone());
        state.touch();
        self.store.save(state)?;
        debug!(tool = tool_name, hash = %commit.commit_hash, "tool call committed");
        Ok(Some(commit))
    }

    /// Squash-merge the shadow branch onto the original branch as a single
    /// commit and delete the shadow branch.
    ///
    /// On merge conflicts the repository is left in the conflicted state
    /// for manual resolution and the session stays unresolved.
    pub async fn accept(&mut self, commit_message: &str) -> Result<(), GitError> {
        let Some(state) = self.state.clone() else {
            return Ok(());
        };
        if state.is_terminal() || !self.enabled {
            return Ok(());
        }

        self.cli
            .run_checked(&["checkout", &state.original_branch])
            .await?;

        let merge = self
            .cli
            .run(&["merge", "--squash", &state.shadow_branch])
            .await?;
        if !merge.success() {
            warn!(branch = %state.shadow_branch, "squash merge conflicted");
            return Err(GitError::MergeConflict {
                branch: state.shadow_branch.clone(),
            });
        }

        // An empty squash (e.g. all tool commits cancelled each other out)
        // leaves nothing staged; committing would fail.
        let staged = self.cli.run(&["diff", "--cached", "--quiet"]).await?;
        if !staged.success() {
            self.cli
                .run_checked(&["commit", "-m", commit_message])
                .await?;
        }

        self.cli
            .run_checked(&["branch", "-D", &state.shadow_branch])
            .await?;
        self.restore_stash(&state).await;

        let state = self.state.as_mut().expect("checked above");
        state.accepted_at = Some(Utc::now());
        state.touch();
        self.store.save(state)?;
        info!(branch = %state.shadow_branch, "shadow session accepted");
        Ok(())
    }

    /// Discard the shadow branch and return to the original branch.
    pub async fn reject(&mut self) -> Result<(), GitError> {
        let Some(state) = self.state.clone() else {
            return Ok(());
        };
        if state.is_terminal() || !self.enabled {
            return Ok(());
        }

        revert_to_original(&self.cli, &state, &self.options).await?;

        let state = self.state.as_mut().expect("checked above");
        state.rejected_at = Some(Utc::now());
        state.touch();
        self.store.save(state)?;
        info!(branch = %state.shadow_branch, "shadow session rejected");
        Ok(())
    }

    /// Record activity so the inactivity auto-revert window restarts.
    pub fn touch(&mut self) -> Result<(), GitError> {
        if let Some(state) = self.state.as_mut() {
            state.touch();
            self.store.save(state)?;
        }
        Ok(())
    }

    /// Mark the session failed (best-effort persist) so startup cleanup
    /// reverts it even if this process dies immediately after.
    pub fn mark_failed(&mut self, reason: &str) {
        if let Some(state) = self.state.as_mut() {
            state.is_failed = true;
            state.failure_reason = Some(reason.to_string());
            state.touch();
            if let Err(e) = self.store.save(state) {
                warn!(error = %e, "failed to persist failure marker");
            }
        }
    }

    async fn restore_stash(&self, state: &GitSessionState) {
        if let Err(e) = restore_stash(&self.cli, state).await {
            warn!(error = %e, "stash restore failed; stash entry left in place");
        }
    }
}

/// Shared revert path used by `reject` and startup cleanup.
///
/// Tolerates a partially reverted repository (branch already gone, already
/// on the original branch) so a crash mid-revert can be finished later.
pub(crate) async fn revert_to_original(
    cli: &GitCli,
    state: &GitSessionState,
    options: &GitSessionOptions,
) -> Result<(), GitError> {
    cli.run_checked(&["checkout", "-f", &state.original_branch])
        .await?;

    let keep_branch = options.keep_failed_sessions && state.is_failed;
    if keep_branch {
        info!(branch = %state.shadow_branch, "keeping failed shadow branch for inspection");
    } else if cli.branch_exists(&state.shadow_branch).await {
        cli.run_checked(&["branch", "-D", &state.shadow_branch])
            .await?;
    }

    if let Err(e) = restore_stash(cli, state).await {
        warn!(error = %e, "stash restore failed during revert");
    }
    Ok(())
}

/// Pop the stash entry recorded for this session, located by its message.
/// A pop conflict is reported but does not fail the surrounding operation.
async fn restore_stash(cli: &GitCli, state: &GitSessionState) -> Result<(), GitError> {
    let Some(message) = &state.stash_id else {
        return Ok(());
    };
    let list = cli
        .run_checked(&["stash", "list", "--format=%gd %gs"])
        .await?;
    let Some(line) = list.stdout.lines().find(|l| l.contains(message.as_str())) else {
        debug!(stash = %message, "no matching stash entry; nothing to restore");
        return Ok(());
    };
    let Some(stash_ref) = line.split_whitespace().next() else {
        return Ok(());
    };
    cli.run_checked(&["stash", "pop", stash_ref]).await?;
    info!(stash = %message, "restored stashed work");
    Ok(())
}

// ─── Integration tests (real git in a temp repo) ─────────────────────────────
