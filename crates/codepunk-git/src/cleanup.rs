// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::exec::GitCli;
use crate::session::{revert_to_original, GitSessionOptions};
use crate::state::{should_auto_revert, SessionStateStore};

/// What startup cleanup did, for the operator log.
#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub examined: usize,
    /// Session ids whose shadow branches were reverted.
    pub reverted: Vec<String>,
    /// Terminal session records pruned without any git work.
    pub pruned: Vec<String>,
    /// Sessions left untouched (live and healthy).
    pub kept: Vec<String>,
}

/// Scan the persisted session directory and revert every session that
/// should no longer be running: rejected or failed records from a crashed
/// process, sessions idle past the timeout, and sessions whose owning
/// process is gone.
///
/// Accepted records are pruned (their work already landed). Reverted
/// sessions have their record removed once the repository is back on the
/// original branch, so a revert that crashes halfway is retried on the
/// next startup.
pub async fn startup_cleanup(
    repo_root: impl AsRef<Path>,
    state_dir: impl AsRef<Path>,
    options: &GitSessionOptions,
) -> CleanupSummary {
    let store = SessionStateStore::new(state_dir.as_ref());
    let cli = GitCli::new(repo_root.as_ref());
    let mut summary = CleanupSummary::default();

    for mut state in store.list() {
        summary.examined += 1;

        if state.accepted_at.is_some() {
            if let Err(e) = store.remove(&state.session_id) {
                warn!(session = %state.session_id, error = %e, "failed to prune accepted session record");
            } else {
                summary.pruned.push(state.session_id.clone());
            }
            continue;
        }

        if !should_auto_revert(&state, options.auto_revert_timeout) {
            summary.kept.push(state.session_id.clone());
            continue;
        }

        info!(
            session = %state.session_id,
            branch = %state.shadow_branch,
            "auto-reverting stale shadow session"
        );
        match revert_to_original(&cli, &state, options).await {
            Ok(()) => {
                state.is_failed = true;
                state
                    .failure_reason
                    .get_or_insert_with(|| "auto-reverted by startup cleanup".into());
                state.rejected_at.get_or_insert_with(Utc::now);
                // Persist the terminal marker before pruning: a crash between
                // the two leaves an idempotent record that the next startup
                // re-reverts (a no-op) and then removes.
                if let Err(e) = store.save(&state) {
                    warn!(session = %state.session_id, error = %e, "failed to persist reverted session record");
                }
                if let Err(e) = store.remove(&state.session_id) {
                    warn!(session = %state.session_id, error = %e, "failed to remove reverted session record");
                }
                summary.reverted.push(state.session_id.clone());
            }
            Err(e) => {
                warn!(
                    session = %state.session_id,
                    error = %e,
                    "auto-revert failed; leaving record for the next startup"
                );
                summary.kept.push(state.session_id.clone());
            }
        }
    }

    if !summary.reverted.is_empty() || !summary.pruned.is_empty() {
        info!(
            examined = summary.examined,
            reverted = summary.reverted.len(),
            pruned = summary.pruned.len(),
            "git session cleanup complete"
        );
    }
    summary
}

// ─── Integration tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GitShadowSession;
    use crate::state::SessionStateStore;
    use std::path::Path;

    async fn init_repo(dir: &Path) -> GitCli {
        let cli = GitCli::new(dir);
        cli.run_checked(&["init"]).await.unwrap();
        cli.run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        cli.run_checked(&["config", "user.name", "Test"]).await.unwrap();
        std::fs::write(dir.join("README.md"), "readme\n").unwrap();
        cli.run_checked(&["add", "-A"]).await.unwrap();
        cli.run_checked(&["commit", "-m", "initial"]).await.unwrap();
        cli.run_checked(&["branch", "-M", "main"]).await.unwrap();
        cli
    }

    /// Simulates a crash: a session is begun, tool work committed, and the
    /// process "dies" (the state file goes stale) without accept/reject.
    #[tokio::test]
    async fn stale_session_is_reverted_on_startup() {
        let repo = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let cli = init_repo(repo.path()).await;

        let mut s = GitShadowSession::new(
            repo.path(),
            state_dir.path(),
            GitSessionOptions::default(),
        );
        s.begin("crashed").await.unwrap();
        std::fs::write(repo.path().join("a.txt"), "a\n").unwrap();
        s.commit_tool_call("write_file", "a").await.unwrap();
        drop(s);

        // Age the record past the auto-revert window.
        let store = SessionStateStore::new(state_dir.path());
        let mut state = store.load("crashed").unwrap().unwrap();
        state.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&state).unwrap();

        let summary = startup_cleanup(
            repo.path(),
            state_dir.path(),
            &GitSessionOptions::default(),
        )
        .await;

        assert_eq!(summary.reverted, vec!["crashed"]);
        assert_eq!(cli.current_branch().await.unwrap().as_deref(), Some("main"));
        assert!(!cli.branch_exists("ai/session/crashed").await);
        assert!(!repo.path().join("a.txt").exists());
        assert!(store.load("crashed").unwrap().is_none(), "record removed");
    }

    #[tokio::test]
    async fn fresh_session_is_kept() {
        let repo = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;

        let mut s = GitShadowSession::new(
            repo.path(),
            state_dir.path(),
            GitSessionOptions::default(),
        );
        s.begin("live").await.unwrap();

        let summary = startup_cleanup(
            repo.path(),
            state_dir.path(),
            &GitSessionOptions::default(),
        )
        .await;

        assert_eq!(summary.kept, vec!["live"]);
        assert!(summary.reverted.is_empty());
        let store = SessionStateStore::new(state_dir.path());
        assert!(store.load("live").unwrap().is_some());
    }

    #[tokio::test]
    async fn accepted_record_is_pruned_without_git_work() {
        let repo = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let cli = init_repo(repo.path()).await;

        let mut s = GitShadowSession::new(
            repo.path(),
            state_dir.path(),
            GitSessionOptions::default(),
        );
        s.begin("done").await.unwrap();
        std::fs::write(repo.path().join("a.txt"), "a\n").unwrap();
        s.commit_tool_call("write_file", "a").await.unwrap();
        s.accept("landed").await.unwrap();

        let summary = startup_cleanup(
            repo.path(),
            state_dir.path(),
            &GitSessionOptions::default(),
        )
        .await;

        assert_eq!(summary.pruned, vec!["done"]);
        // The accepted work is untouched.
        assert!(repo.path().join("a.txt").exists());
        assert_eq!(cli.current_branch().await.unwrap().as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn empty_state_dir_is_a_quiet_noop() {
        let repo = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;
        let summary = startup_cleanup(
            repo.path(),
            state_dir.path(),
            &GitSessionOptions::default(),
        )
        .await;
        assert_eq!(summary.examined, 0);
    }
}
