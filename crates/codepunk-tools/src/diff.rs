// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use similar::{ChangeTag, TextDiff};

/// Aggregate change counts for an edit, covering both the model's proposal
/// and any user amendments made in the approval dialog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub lines_added: usize,
    pub lines_removed: usize,
    pub chars_added: usize,
    pub chars_removed: usize,
}

/// Normalize line endings to `\n` for comparison and storage.
pub fn normalize_eol(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Produce a unified diff between `old` and `new` with `--- a/<name>` /
/// `+++ b/<name>` headers and 3 lines of context. Inputs are EOL-normalized
/// before comparison; identical texts yield an empty string.
pub fn create_unified_diff(old: &str, new: &str, name: &str) -> String {
    let old = normalize_eol(old);
    let new = normalize_eol(new);
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let diff = TextDiff::from_slices(&old_lines, &new_lines);

    let mut out = format!("--- a/{name}\n+++ b/{name}\n");
    for group in diff.grouped_ops(3) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_start = first.old_range().start;
        let old_count = last.old_range().end - old_start;
        let new_start = first.new_range().start;
        let new_count = last.new_range().end - new_start;
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk_position(old_start, old_count),
            old_count,
            hunk_position(new_start, new_count),
            new_count,
        ));
        for op in &group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Equal => ' ',
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                };
                out.push(sign);
                out.push_str(change.value());
                out.push('\n');
            }
        }
    }
    out
}

/// Unified-diff position convention: 1-based start line, except that an
/// empty range reports the line *before* the hunk (0 at file start).
fn hunk_position(start: usize, count: usize) -> usize {
    if count == 0 {
        start
    } else {
        start + 1
    }
}

/// Apply a diff produced by [`create_unified_diff`] to `old`.
///
/// Context and deletion lines are verified against the file; a mismatch is
/// an error rather than a silent mis-application.
pub fn apply_unified_diff(diff: &str, old: &str) -> Result<String, String> {
    let old = normalize_eol(old);
    let old_lines: Vec<&str> = old.split('\n').collect();

    let mut out: Vec<String> = Vec::new();
    let mut cursor = 0usize;
    let mut in_hunk = false;

    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@") {
            let (start, count) = parse_old_range(header)
                .ok_or_else(|| format!("malformed hunk header: {line}"))?;
            let anchor = if count == 0 { start } else { start - 1 };
            if anchor < cursor || anchor > old_lines.len() {
                return Err(format!("hunk anchor {anchor} out of range"));
            }
            out.extend(old_lines[cursor..anchor].iter().map(|s| s.to_string()));
            cursor = anchor;
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        if let Some(ctx) = line.strip_prefix(' ') {
            if old_lines.get(cursor).copied() != Some(ctx) {
                return Err(format!(
                    "context mismatch at line {}: expected {:?}",
                    cursor + 1,
                    ctx
                ));
            }
            out.push(ctx.to_string());
            cursor += 1;
        } else if let Some(del) = line.strip_prefix('-') {
            if old_lines.get(cursor).copied() != Some(del) {
                return Err(format!(
                    "deletion mismatch at line {}: expected {:?}",
                    cursor + 1,
                    del
                ));
            }
            cursor += 1;
        } else if let Some(add) = line.strip_prefix('+') {
            out.push(add.to_string());
        } else if line.is_empty() {
            // Blank context line whose leading space was stripped in transit.
            if old_lines.get(cursor).copied() == Some("") {
                out.push(String::new());
                cursor += 1;
            }
        }
    }

    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));
    Ok(out.join("\n"))
}

/// Extract `(start, count)` from the `-N,M` side of a hunk header.
fn parse_old_range(header: &str) -> Option<(usize, usize)> {
    let inner = header.trim().split("@@").next()?.trim();
    let old_part = inner.split_whitespace().find(|p| p.starts_with('-'))?;
    let old_part = &old_part[1..];
    match old_part.split_once(',') {
        Some((s, c)) => Some((s.parse().ok()?, c.parse().ok()?)),
        None => Some((old_part.parse().ok()?, 1)),
    }
}

/// Change counts for original → proposal → final, summed.
///
/// Accounts for the user editing the AI proposal before it lands: the
/// first diff measures the model's change, the second the user's.
pub fn compute_stats(original: &str, ai_proposal: &str, user_final: &str) -> DiffStats {
    let a = diff_counts(original, ai_proposal);
    let b = diff_counts(ai_proposal, user_final);
    DiffStats {
        lines_added: a.lines_added + b.lines_added,
        lines_removed: a.lines_removed + b.lines_removed,
        chars_added: a.chars_added + b.chars_added,
        chars_removed: a.chars_removed + b.chars_removed,
    }
}

fn diff_counts(old: &str, new: &str) -> DiffStats {
    let old = normalize_eol(old);
    let new = normalize_eol(new);
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let diff = TextDiff::from_slices(&old_lines, &new_lines);

    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => {
                stats.lines_added += 1;
                stats.chars_added += change.value().len();
            }
            ChangeTag::Delete => {
                stats.lines_removed += 1;
                stats.chars_removed += change.value().len();
            }
            ChangeTag::Equal => {}
        }
    }
    stats
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
