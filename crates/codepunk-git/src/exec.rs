// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Stderr kept in a [`GitError::Operation`] is truncated to this many chars.
const STDERR_TRUNCATE_CHARS: usize = 400;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotARepository(String),
    #[error("detached HEAD; refusing to start a shadow session")]
    DetachedHead,
    #[error("squash merge of {branch} produced conflicts; resolve them manually and commit")]
    MergeConflict { branch: String },
    #[error("`git {command}` failed with exit code {exit_code}: {stderr}")]
    Operation {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("session state persistence failed: {0}")]
    State(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Subprocess git driver. All repository mutation in the shadow-session
/// subsystem goes through here; no git library is linked.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run git and capture the outcome regardless of exit code.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(GitOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git and turn a non-zero exit into a structured error.
    pub async fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.run(args).await?;
        if out.success() {
            return Ok(out);
        }
        Err(GitError::Operation {
            command: args.join(" "),
            exit_code: out.exit_code,
            stderr: truncate_chars(out.stderr.trim(), STDERR_TRUNCATE_CHARS),
        })
    }

    pub async fn is_repository(&self) -> bool {
        matches!(
            self.run(&["rev-parse", "--is-inside-work-tree"]).await,
            Ok(out) if out.success() && out.stdout.trim() == "true"
        )
    }

    /// The checked-out branch name, or `None` on a detached HEAD.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self.run_checked(&["branch", "--show-current"]).await?;
        let name = out.stdout.trim();
        Ok(if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        })
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool, GitError> {
        let out = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(!out.stdout.trim().is_empty())
    }

    pub async fn branch_exists(&self, name: &str) -> bool {
        matches!(
            self.run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")]).await,
            Ok(out) if out.success()
        )
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
