//! Patch engine: materializes model-emitted file changes into a scratch
//! workspace.
//!
//! `create` writes content verbatim. `modify` applies `search -> replace`
//! edits against the existing file, first by exact substring match, then
//! by a whitespace-fuzzy match where every whitespace run in the search
//! text matches `\s+`. Application is atomic per file: if any patch in a
//! file fails, that file's on-disk state is left untouched so a retry
//! prompt sees the same preconditions as the failed attempt.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One `search -> replace` edit against an existing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchOp {
    pub search: String,
    pub replace: String,
}

/// A validated file change from the generation output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Create { path: String, content: String },
    Modify { path: String, patches: Vec<PatchOp> },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. } | Self::Modify { path, .. } => path,
        }
    }
}

/// A file the engine could not materialize, with a diagnostic reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// Result of materializing one batch of file changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub written: Vec<String>,
    pub failed: Vec<FileFailure>,
}

impl MaterializeReport {
    pub fn all_written(&self) -> bool {
        self.failed.is_empty()
    }
}

fn safe_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._@+-][A-Za-z0-9._/@+-]*$").expect("valid regex"))
}

/// Whether a model-emitted path is safe to touch inside the workspace:
/// relative, no `..` components, and limited to a conservative character
/// set.
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    if path
        .split('/')
        .any(|component| component.is_empty() || component == "." || component == "..")
    {
        return false;
    }
    safe_path_re().is_match(path)
}

/// Materialize a batch of file changes under `workspace`.
///
/// Per-file failures are collected, not propagated: a failed `modify`
/// leaves its file untouched and the caller turns the failure into a
/// synthetic validation error for the retry prompt.
pub fn apply_changes(workspace: &Path, changes: &[FileChange]) -> MaterializeReport {
    let mut report = MaterializeReport::default();

    for change in changes {
        let path = change.path();
        if !is_safe_path(path) {
            report.failed.push(FileFailure {
                path: path.to_owned(),
                reason: "unsafe path (absolute or traversal)".to_owned(),
            });
            continue;
        }

        match change {
            FileChange::Create { path, content } => {
                match write_file(workspace, path, content) {
                    Ok(()) => report.written.push(path.clone()),
                    Err(reason) => report.failed.push(FileFailure {
                        path: path.clone(),
                        reason,
                    }),
                }
            }
            FileChange::Modify { path, patches } => {
                match apply_patches(workspace, path, patches) {
                    Ok(()) => report.written.push(path.clone()),
                    Err(reason) => report.failed.push(FileFailure {
                        path: path.clone(),
                        reason,
                    }),
                }
            }
        }
    }

    report
}

fn write_file(workspace: &Path, rel: &str, content: &str) -> Result<(), String> {
    let target = workspace.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create parent dirs: {e}"))?;
    }
    fs::write(&target, content).map_err(|e| format!("failed to write file: {e}"))
}

fn apply_patches(workspace: &Path, rel: &str, patches: &[PatchOp]) -> Result<(), String> {
    let target = workspace.join(rel);
    let original =
        fs::read_to_string(&target).map_err(|_| "file to modify does not exist".to_owned())?;

    if patches.is_empty() {
        return Err("modify with no patches".to_owned());
    }

    // All patches are applied in memory; the file is only rewritten when
    // every patch matched.
    let mut text = original;
    for patch in patches {
        text = apply_one_patch(&text, patch)?;
    }

    fs::write(&target, text).map_err(|e| format!("failed to write patched file: {e}"))
}

fn apply_one_patch(text: &str, patch: &PatchOp) -> Result<String, String> {
    if patch.search.is_empty() {
        return Err("empty search text".to_owned());
    }

    // 1. Exact substring match: replace the first occurrence.
    if let Some(idx) = text.find(&patch.search) {
        let mut out = String::with_capacity(text.len() + patch.replace.len());
        out.push_str(&text[..idx]);
        out.push_str(&patch.replace);
        out.push_str(&text[idx + patch.search.len()..]);
        return Ok(out);
    }

    // 2. Whitespace-fuzzy match: collapse whitespace runs on both sides;
    //    if the normalized search occurs in the normalized text, rebuild
    //    the search as a regex with `\s+` for each whitespace run and
    //    replace one occurrence in the real text.
    let norm_search = normalize_ws(&patch.search);
    let norm_text = normalize_ws(text);
    if !norm_search.is_empty() && norm_text.contains(&norm_search) {
        let pattern = patch
            .search
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        let re = Regex::new(&pattern).map_err(|e| format!("fuzzy pattern error: {e}"))?;
        if re.is_match(text) {
            return Ok(re
                .replace(text, regex::NoExpand(&patch.replace))
                .into_owned());
        }
    }

    let snippet: String = patch.search.chars().take(50).collect();
    Err(format!("no match for search text {snippet:?}"))
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
