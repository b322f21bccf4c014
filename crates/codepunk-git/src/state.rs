// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::GitError;

/// One recorded shadow-branch commit made on behalf of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCommit {
    pub tool_name: String,
    pub commit_hash: String,
    pub committed_at: DateTime<Utc>,
    pub files_changed: Vec<String>,
}

/// Persisted state of one git shadow session.
///
/// Invariant: at most one of `accepted_at` / `rejected_at` is set; both
/// unset means the session is unresolved and eligible for auto-revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSessionState {
    pub session_id: String,
    pub shadow_branch: String,
    pub original_branch: String,
    /// Stash message recorded at `begin`, used to find the stash entry
    /// again at restore time (stash positions shift as entries are added).
    pub stash_id: Option<String>,
    pub tool_call_commits: Vec<ToolCallCommit>,
    pub started_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub is_failed: bool,
    pub failure_reason: Option<String>,
    /// Process that owns the session; a dead pid marks it orphaned.
    pub pid: u32,
}

impl GitSessionState {
    pub fn new(
        session_id: impl Into<String>,
        shadow_branch: impl Into<String>,
        original_branch: impl Into<String>,
        stash_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            shadow_branch: shadow_branch.into(),
            original_branch: original_branch.into(),
            stash_id,
            tool_call_commits: Vec::new(),
            started_at: now,
            accepted_at: None,
            rejected_at: None,
            last_activity_at: now,
            is_failed: false,
            failure_reason: None,
            pid: std::process::id(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.accepted_at.is_some() || self.rejected_at.is_some()
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Whether startup cleanup should revert this session.
///
/// Unaccepted sessions are reverted when they were rejected or failed
/// (crash mid-revert), when they have been inactive past the timeout, or
/// when the owning process is gone.
pub fn should_auto_revert(state: &GitSessionState, timeout: Duration) -> bool {
    if state.accepted_at.is_some() {
        return false;
    }
    if state.rejected_at.is_some() || state.is_failed {
        return true;
    }
    let idle = Utc::now() - state.last_activity_at;
    if idle > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX) {
        return true;
    }
    is_orphaned(state.pid)
}

/// A session is orphaned when its recorded process no longer exists.
/// Only determinable on unix; elsewhere the inactivity timeout governs.
fn is_orphaned(pid: u32) -> bool {
    if pid == std::process::id() {
        return false;
    }
    #[cfg(unix)]
    {
        // kill(pid, 0) probes existence without sending a signal.
        unsafe { libc::kill(pid as libc::pid_t, 0) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// JSON-per-session persistence under `<state-dir>/git-sessions/`.
///
/// Writes go through a sibling temp file + rename so a crash mid-write
/// never leaves a torn document for startup cleanup to trip over.
pub struct SessionStateStore {
    dir: PathBuf,
}

impl SessionStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into().join("git-sessions"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    pub fn save(&self, state: &GitSessionState) -> Result<(), GitError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| GitError::State(e.to_string()))?;
        let path = self.path(&state.session_id);
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GitError::State(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| GitError::State(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| GitError::State(e.to_string()))
    }

    pub fn load(&self, session_id: &str) -> Result<Option<GitSessionState>, GitError> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&path).map_err(|e| GitError::State(e.to_string()))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| GitError::State(e.to_string()))
    }

    pub fn remove(&self, session_id: &str) -> Result<(), GitError> {
        let path = self.path(session_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| GitError::State(e.to_string()))?;
        }
        Ok(())
    }

    /// All persisted sessions. Unreadable documents are skipped with a
    /// warning rather than aborting cleanup for every other session.
    pub fn list(&self) -> Vec<GitSessionState> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut states = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|t| serde_json::from_str(&t).map_err(|e| e.to_string()))
            {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session state")
                }
            }
        }
        states.sort_by(|a: &GitSessionState, b: &GitSessionState| {
            a.started_at.cmp(&b.started_at)
        });
        states
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str) -> GitSessionState {
        GitSessionState::new(id, format!("ai/session/{id}"), "main", None)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        let s = state("s1");
        store.save(&s).unwrap();
        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.shadow_branch, "ai/session/s1");
        assert_eq!(loaded.original_branch, "main");
    }

    #[test]
    fn load_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn persisted_document_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        store.save(&state("s1")).unwrap();
        let text =
            std::fs::read_to_string(dir.path().join("git-sessions").join("s1.json")).unwrap();
        assert!(text.contains("\"sessionId\""), "{text}");
        assert!(text.contains("\"shadowBranch\""), "{text}");
        assert!(text.contains("\"lastActivityAt\""), "{text}");
    }

    #[test]
    fn remove_deletes_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        store.save(&state("s1")).unwrap();
        store.remove("s1").unwrap();
        assert!(store.load("s1").unwrap().is_none());
    }

    #[test]
    fn list_skips_unreadable_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        store.save(&state("good")).unwrap();
        std::fs::write(store.dir().join("bad.json"), "{torn").unwrap();
        let states = store.list();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].session_id, "good");
    }

    #[test]
    fn no_temp_files_remain_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::new(dir.path());
        store.save(&state("s1")).unwrap();
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["s1.json"]);
    }

    // ── Auto-revert predicate ─────────────────────────────────────────────────

    #[test]
    fn accepted_sessions_never_revert() {
        let mut s = state("s");
        s.accepted_at = Some(Utc::now());
        s.is_failed = true; // even when marked failed
        assert!(!should_auto_revert(&s, Duration::from_secs(1800)));
    }

    #[test]
    fn failed_sessions_revert() {
        let mut s = state("s");
        s.is_failed = true;
        assert!(should_auto_revert(&s, Duration::from_secs(1800)));
    }

    #[test]
    fn rejected_but_persisted_sessions_revert() {
        // Crash between marking rejected and finishing cleanup.
        let mut s = state("s");
        s.rejected_at = Some(Utc::now());
        assert!(should_auto_revert(&s, Duration::from_secs(1800)));
    }

    #[test]
    fn stale_sessions_revert_after_timeout() {
        let mut s = state("s");
        s.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        assert!(should_auto_revert(&s, Duration::from_secs(1800)));
    }

    #[test]
    fn fresh_live_sessions_do_not_revert() {
        // pid is this test process, so the session is not orphaned.
        let s = state("s");
        assert!(!should_auto_revert(&s, Duration::from_secs(1800)));
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_marks_session_orphaned() {
        let mut s = state("s");
        // pid_max on Linux defaults to 4194304; this pid cannot exist.
        s.pid = 4_194_000;
        // An existing-but-foreign pid would also be a valid outcome here if
        // the host reuses it, so only assert when the probe says "gone".
        if is_orphaned(s.pid) {
            assert!(should_auto_revert(&s, Duration::from_secs(1800)));
        }
    }
}
