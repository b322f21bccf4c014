// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::approval::{ApprovalDecision, ApprovalService, FileEditRequest};
use crate::diff::{compute_stats, create_unified_diff, normalize_eol, DiffStats};

/// Binary detection scans this many leading bytes for a NUL.
const BINARY_SCAN_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum FileEditError {
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("path escapes the workspace root: {0}")]
    PathOutOfRoot(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file too large: {path} is {size} bytes (limit {max})")]
    FileTooLarge { path: String, size: u64, max: u64 },
    #[error("binary file: {0}")]
    BinaryFile(String),
    #[error("old_string not found in {0}")]
    NoOccurrence(String),
    #[error("expected {expected} occurrences of old_string but found {actual}")]
    OccurrenceMismatch { expected: usize, actual: usize },
    #[error("replacement produces identical content")]
    NoChange,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("edit cancelled by user")]
    UserCancelled,
}

#[derive(Debug, Clone)]
pub struct WriteFileRequest {
    pub file_path: String,
    pub content: String,
    pub require_approval: bool,
}

#[derive(Debug, Clone)]
pub struct ReplaceInFileRequest {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
    pub expected_occurrences: Option<usize>,
    pub require_approval: bool,
}

#[derive(Debug, Clone)]
pub struct FileEditOutcome {
    pub path: PathBuf,
    pub diff: String,
    pub stats: DiffStats,
    /// Rough prompt-token savings of sending the edit operation instead of
    /// the whole file back through the model.
    pub tokens_saved: u64,
}

/// Validated, approval-gated, atomic file editing rooted in one directory.
///
/// The session auto-approve flag latched by
/// [`ApprovalDecision::ApproveSession`] is sticky for the lifetime of this
/// service.
pub struct FileEditService {
    root: PathBuf,
    approval: Arc<dyn ApprovalService>,
    max_file_size: u64,
    session_approved: AtomicBool,
}

impl FileEditService {
    pub fn new(
        root: impl Into<PathBuf>,
        approval: Arc<dyn ApprovalService>,
        max_file_size: u64,
    ) -> Self {
        Self {
            root: normalize_lexically(&root.into()),
            approval,
            max_file_size,
            session_approved: AtomicBool::new(false),
        }
    }

    /// Write `content` to `file_path`, creating it if needed.
    pub async fn write_file(
        &self,
        req: WriteFileRequest,
    ) -> Result<FileEditOutcome, FileEditError> {
        let path = self.resolve_in_root(&req.file_path)?;
        let exists = path.exists();
        let original = if exists {
            self.read_for_edit(&path)?
        } else {
            String::new()
        };

        let proposed = normalize_eol(&req.content);
        let rel = self.rel_name(&path);
        let diff = create_unified_diff(&original, &proposed, &rel);

        if diff.is_empty() && exists {
            // Nothing to change and nothing to create.
            return Ok(FileEditOutcome {
                path,
                diff,
                stats: DiffStats::default(),
                tokens_saved: 0,
            });
        }

        let stats = compute_stats(&original, &proposed, &proposed);
        let (final_content, diff, stats) = self
            .approve(&path, &original, proposed, diff, stats, req.require_approval)
            .await?;

        atomic_write(&path, &final_content)?;
        let tokens_saved = token_savings(original.len(), final_content.len(), diff.len());
        Ok(FileEditOutcome {
            path,
            diff,
            stats,
            tokens_saved,
        })
    }

    /// Replace literal occurrences of `old_string` in an existing file.
    pub async fn replace_in_file(
        &self,
        req: ReplaceInFileRequest,
    ) -> Result<FileEditOutcome, FileEditError> {
        let path = self.resolve_in_root(&req.file_path)?;
        if !path.exists() {
            return Err(FileEditError::FileNotFound(req.file_path.clone()));
        }
        let original = self.read_for_edit(&path)?;

        let old_string = normalize_eol(&req.old_string);
        let new_string = normalize_eol(&req.new_string);

        let occurrences = original.matches(&old_string).count();
        if occurrences == 0 {
            return Err(FileEditError::NoOccurrence(req.file_path.clone()));
        }
        if let Some(expected) = req.expected_occurrences {
            if expected != occurrences {
                return Err(FileEditError::OccurrenceMismatch {
                    expected,
                    actual: occurrences,
                });
            }
        }

        let proposed = original.replace(&old_string, &new_string);
        if proposed == original {
            return Err(FileEditError::NoChange);
        }

        let rel = self.rel_name(&path);
        let diff = create_unified_diff(&original, &proposed, &rel);
        let stats = compute_stats(&original, &proposed, &proposed);
        let (final_content, diff, stats) = self
            .approve(&path, &original, proposed, diff, stats, req.require_approval)
            .await?;

        atomic_write(&path, &final_content)?;
        let op_cost = old_string.len() + new_string.len();
        let tokens_saved = token_savings(original.len(), final_content.len(), op_cost);
        Ok(FileEditOutcome {
            path,
            diff,
            stats,
            tokens_saved,
        })
    }

    /// Validate and read a file for a read-only consumer (the read tool).
    pub fn read_validated(&self, file_path: &str) -> Result<String, FileEditError> {
        let path = self.resolve_in_root(file_path)?;
        if !path.exists() {
            return Err(FileEditError::FileNotFound(file_path.to_string()));
        }
        self.read_for_edit(&path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn approve(
        &self,
        path: &Path,
        original: &str,
        proposed: String,
        diff: String,
        stats: DiffStats,
        require: bool,
    ) -> Result<(String, String, DiffStats), FileEditError> {
        if !require || diff.is_empty() || self.session_approved.load(Ordering::Relaxed) {
            return Ok((proposed, diff, stats));
        }

        let request = FileEditRequest {
            file_path: path.display().to_string(),
            original_content: original.to_string(),
            proposed_content: proposed.clone(),
        };
        let decision = self.approval.request_approval(&request, &diff, &stats).await;
        let modified = match decision {
            ApprovalDecision::Approve { modified_content } => modified_content,
            ApprovalDecision::ApproveSession { modified_content } => {
                self.session_approved.store(true, Ordering::Relaxed);
                modified_content
            }
            ApprovalDecision::Deny => return Err(FileEditError::UserCancelled),
        };

        match modified {
            None => Ok((proposed, diff, stats)),
            Some(user_content) => {
                // The user amended the proposal; recompute against what will
                // actually land so the recorded diff matches the file.
                let user_content = normalize_eol(&user_content);
                let rel = self.rel_name(path);
                let diff = create_unified_diff(original, &user_content, &rel);
                let stats = compute_stats(original, &proposed, &user_content);
                Ok((user_content, diff, stats))
            }
        }
    }

    fn resolve_in_root(&self, raw: &str) -> Result<PathBuf, FileEditError> {
        if raw.trim().is_empty() {
            return Err(FileEditError::InvalidPath(raw.to_string()));
        }
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.root.join(raw)
        };
        let normalized = normalize_lexically(&candidate);
        if !path_within(&normalized, &self.root) {
            return Err(FileEditError::PathOutOfRoot(raw.to_string()));
        }
        Ok(normalized)
    }

    fn read_for_edit(&self, path: &Path) -> Result<String, FileEditError> {
        let display = path.display().to_string();
        let meta = std::fs::metadata(path)
            .map_err(|_| FileEditError::FileNotFound(display.clone()))?;
        if meta.len() > self.max_file_size {
            return Err(FileEditError::FileTooLarge {
                path: display,
                size: meta.len(),
                max: self.max_file_size,
            });
        }
        let bytes =
            std::fs::read(path).map_err(|e| FileEditError::WriteFailed(e.to_string()))?;
        if bytes
            .iter()
            .take(BINARY_SCAN_BYTES)
            .any(|b| *b == 0)
        {
            return Err(FileEditError::BinaryFile(display));
        }
        let text =
            String::from_utf8(bytes).map_err(|_| FileEditError::BinaryFile(display))?;
        Ok(normalize_eol(&text))
    }

    fn rel_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Resolve `.` and `..` components without touching the filesystem, so
/// containment can be checked for paths that do not exist yet.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Case-insensitive containment on Windows/macOS, case-sensitive elsewhere.
fn path_within(path: &Path, root: &Path) -> bool {
    if cfg!(any(windows, target_os = "macos")) {
        let p = path.to_string_lossy().to_lowercase();
        let r = root.to_string_lossy().to_lowercase();
        Path::new(&p).starts_with(Path::new(&r))
    } else {
        path.starts_with(root)
    }
}

/// Write to a sibling temp file, then rename over the destination. Readers
/// observe either the old content or the new content, never a partial file.
fn atomic_write(path: &Path, content: &str) -> Result<(), FileEditError> {
    let parent = path
        .parent()
        .ok_or_else(|| FileEditError::InvalidPath(path.display().to_string()))?;
    std::fs::create_dir_all(parent).map_err(|e| FileEditError::WriteFailed(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FileEditError::WriteFailed(e.to_string()))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| FileEditError::WriteFailed(e.to_string()))?;
    tmp.flush()
        .map_err(|e| FileEditError::WriteFailed(e.to_string()))?;
    // On failure persist() hands the temp file back and dropping it removes
    // it from disk.
    tmp.persist(path)
        .map_err(|e| FileEditError::WriteFailed(e.to_string()))?;
    debug!(path = %path.display(), bytes = content.len(), "atomic write complete");
    Ok(())
}

/// `max(0, (original + new)/4 − operation/4)` — the classic 4-chars-per-token
/// approximation of what the edit operation saved over resending the file.
fn token_savings(original_len: usize, new_len: usize, operation_cost: usize) -> u64 {
    ((original_len + new_len) / 4).saturating_sub(operation_cost / 4) as u64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{AutoApprovalService, ScriptedApprovalService};

    fn service(root: &Path) -> FileEditService {
        FileEditService::new(root, Arc::new(AutoApprovalService), 5 * 1024 * 1024)
    }

    fn write_req(path: &str, content: &str) -> WriteFileRequest {
        WriteFileRequest {
            file_path: path.into(),
            content: content.into(),
            require_approval: false,
        }
    }

    // ── write_file ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn write_creates_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let out = svc.write_file(write_req("new.txt", "hello\n")).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.path).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn write_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.write_file(write_req("a/b/c.txt", "x\n")).await.unwrap();
        assert!(dir.path().join("a/b/c.txt").exists());
    }

    #[tokio::test]
    async fn write_overwrites_and_reports_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "old line\n").unwrap();
        let svc = service(dir.path());
        let out = svc.write_file(write_req("f.txt", "new line\n")).await.unwrap();
        assert!(out.diff.contains("-old line"));
        assert!(out.diff.contains("+new line"));
        assert_eq!(out.stats.lines_added, 1);
        assert_eq!(out.stats.lines_removed, 1);
    }

    #[tokio::test]
    async fn write_identical_content_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "same\n").unwrap();
        let svc = service(dir.path());
        let out = svc.write_file(write_req("f.txt", "same\n")).await.unwrap();
        assert!(out.diff.is_empty());
        assert_eq!(out.tokens_saved, 0);
    }

    #[tokio::test]
    async fn write_normalizes_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let out = svc.write_file(write_req("f.txt", "a\r\nb\r\n")).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.path).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn no_temp_files_left_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.write_file(write_req("f.txt", "x\n")).await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["f.txt"], "stray files: {entries:?}");
    }

    // ── Path validation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_path_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.write_file(write_req("  ", "x")).await.unwrap_err();
        assert!(matches!(err, FileEditError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn dotdot_escape_is_out_of_root() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc
            .write_file(write_req("../outside.txt", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::PathOutOfRoot(_)));
    }

    #[tokio::test]
    async fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc
            .write_file(write_req("/etc/codepunk-test.txt", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::PathOutOfRoot(_)));
    }

    #[tokio::test]
    async fn absolute_path_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let abs = dir.path().join("inner.txt");
        svc.write_file(write_req(abs.to_str().unwrap(), "x\n"))
            .await
            .unwrap();
        assert!(abs.exists());
    }

    #[tokio::test]
    async fn dotdot_that_stays_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let svc = service(dir.path());
        svc.write_file(write_req("sub/../ok.txt", "x\n")).await.unwrap();
        assert!(dir.path().join("ok.txt").exists());
    }

    // ── File validation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(200)).unwrap();
        let svc = FileEditService::new(dir.path(), Arc::new(AutoApprovalService), 100);
        let err = svc
            .write_file(write_req("big.txt", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn binary_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bin.dat"), b"ab\x00cd").unwrap();
        let svc = service(dir.path());
        let err = svc
            .write_file(write_req("bin.dat", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::BinaryFile(_)));
    }

    // ── Approval ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn deny_maps_to_user_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let approval = Arc::new(ScriptedApprovalService::new(vec![ApprovalDecision::Deny]));
        let svc = FileEditService::new(dir.path(), approval, 5 * 1024 * 1024);
        let err = svc
            .write_file(WriteFileRequest {
                file_path: "f.txt".into(),
                content: "x\n".into(),
                require_approval: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::UserCancelled));
        assert!(!dir.path().join("f.txt").exists(), "denied edit must not land");
    }

    #[tokio::test]
    async fn modified_content_from_approval_wins() {
        let dir = tempfile::tempdir().unwrap();
        let approval = Arc::new(ScriptedApprovalService::new(vec![
            ApprovalDecision::Approve {
                modified_content: Some("user version\n".into()),
            },
        ]));
        let svc = FileEditService::new(dir.path(), approval, 5 * 1024 * 1024);
        let out = svc
            .write_file(WriteFileRequest {
                file_path: "f.txt".into(),
                content: "model version\n".into(),
                require_approval: true,
            })
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&out.path).unwrap(),
            "user version\n"
        );
        assert!(out.diff.contains("+user version"), "{}", out.diff);
    }

    #[tokio::test]
    async fn session_approval_short_circuits_later_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let approval = Arc::new(ScriptedApprovalService::new(vec![
            ApprovalDecision::ApproveSession {
                modified_content: None,
            },
        ]));
        let svc = FileEditService::new(dir.path(), approval.clone(), 5 * 1024 * 1024);

        for i in 0..3 {
            svc.write_file(WriteFileRequest {
                file_path: format!("f{i}.txt"),
                content: "x\n".into(),
                require_approval: true,
            })
            .await
            .unwrap();
        }
        assert_eq!(*approval.prompts.lock().unwrap(), 1, "only the first edit prompts");
    }

    // ── replace_in_file ───────────────────────────────────────────────────────

    fn replace_req(path: &str, old: &str, new: &str) -> ReplaceInFileRequest {
        ReplaceInFileRequest {
            file_path: path.into(),
            old_string: old.into(),
            new_string: new.into(),
            expected_occurrences: None,
            require_approval: false,
        }
    }

    #[tokio::test]
    async fn replace_swaps_all_occurrences() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "foo bar foo\n").unwrap();
        let svc = service(dir.path());
        let out = svc.replace_in_file(replace_req("f.txt", "foo", "qux")).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.path).unwrap(), "qux bar qux\n");
    }

    #[tokio::test]
    async fn replace_missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc
            .replace_in_file(replace_req("missing.txt", "a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn replace_zero_occurrences_is_no_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "nothing here\n").unwrap();
        let svc = service(dir.path());
        let err = svc
            .replace_in_file(replace_req("f.txt", "absent", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::NoOccurrence(_)));
    }

    #[tokio::test]
    async fn replace_occurrence_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a a a\n").unwrap();
        let svc = service(dir.path());
        let err = svc
            .replace_in_file(ReplaceInFileRequest {
                expected_occurrences: Some(2),
                ..replace_req("f.txt", "a", "b")
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, FileEditError::OccurrenceMismatch { expected: 2, actual: 3 }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn replace_matching_expected_count_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a a a\n").unwrap();
        let svc = service(dir.path());
        svc.replace_in_file(ReplaceInFileRequest {
            expected_occurrences: Some(3),
            ..replace_req("f.txt", "a", "b")
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn replace_identical_strings_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "same same\n").unwrap();
        let svc = service(dir.path());
        let err = svc
            .replace_in_file(replace_req("f.txt", "same", "same"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileEditError::NoChange));
    }

    #[tokio::test]
    async fn replace_reports_token_savings_for_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{}\nTARGET\n{}\n", "x".repeat(4000), "y".repeat(4000));
        std::fs::write(dir.path().join("f.txt"), &body).unwrap();
        let svc = service(dir.path());
        let out = svc
            .replace_in_file(replace_req("f.txt", "TARGET", "REPLACED"))
            .await
            .unwrap();
        assert!(out.tokens_saved > 1000, "savings: {}", out.tokens_saved);
    }

    // ── read_validated ────────────────────────────────────────────────────────

    #[test]
    fn read_validated_returns_normalized_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\r\nb\n").unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.read_validated("f.txt").unwrap(), "a\nb\n");
    }

    #[test]
    fn read_validated_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(matches!(
            svc.read_validated("gone.txt").unwrap_err(),
            FileEditError::FileNotFound(_)
        ));
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn token_savings_never_negative() {
        assert_eq!(token_savings(4, 4, 4000), 0);
    }

    #[test]
    fn token_savings_scales_with_file_size() {
        // 8000 chars of file vs a 40-char operation.
        assert_eq!(token_savings(4000, 4000, 40), 2000 - 10);
    }

    #[test]
    fn normalize_lexically_resolves_dots() {
        let p = normalize_lexically(Path::new("/a/b/../c/./d"));
        assert_eq!(p, Path::new("/a/c/d"));
    }
}
