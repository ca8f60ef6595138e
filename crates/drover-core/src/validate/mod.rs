//! Validator dispatch: runs a configured ladder of syntax, lint, and type
//! checks over produced files and reports structured errors.
//!
//! Syntax is checked in-process with tolerant parsers. Lint and typecheck
//! invoke the project's own binaries when present; a repository without a
//! lint configuration simply contributes no errors. The whole ladder runs
//! under one timeout and reports a synthetic error when it expires.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use drover_db::models::ValidationLevel;

/// One structured validator finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl ValidationError {
    pub fn syntax(file: &str, line: Option<u32>, column: Option<u32>, message: String) -> Self {
        Self {
            kind: "syntax".to_owned(),
            file: file.to_owned(),
            line,
            column,
            message,
        }
    }

    /// Synthetic error injected when a modify patch could not be applied.
    /// The retry directive tells the model to fall back to a full rewrite.
    pub fn patch_failed(file: &str, reason: &str) -> Self {
        Self {
            kind: "patch".to_owned(),
            file: file.to_owned(),
            line: None,
            column: None,
            message: format!(
                "PATCH FAILED for {file}: {reason}; you must rewrite the full file with action=create"
            ),
        }
    }

    fn timeout(secs: u64) -> Self {
        Self {
            kind: "timeout".to_owned(),
            file: String::new(),
            line: None,
            column: None,
            message: format!("validation timed out after {secs}s"),
        }
    }
}

/// One rung of the validation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    Syntax,
    Lint,
    Typecheck,
}

/// The rungs run at each validation level.
pub fn ladder(level: ValidationLevel) -> &'static [ValidatorKind] {
    match level {
        ValidationLevel::Minimal => &[ValidatorKind::Syntax],
        ValidationLevel::Standard => &[ValidatorKind::Syntax, ValidatorKind::Lint],
        ValidationLevel::Strict => &[
            ValidatorKind::Syntax,
            ValidatorKind::Lint,
            ValidatorKind::Typecheck,
        ],
    }
}

/// Run the full ladder for `level` over `files` (paths relative to
/// `workspace`). Returns the collected errors; an empty vec means the
/// attempt validated clean.
pub async fn run_validation(
    workspace: &Path,
    files: &[String],
    level: ValidationLevel,
    timeout: Duration,
) -> Result<Vec<ValidationError>> {
    let run = async {
        let mut errors = Vec::new();
        for kind in ladder(level) {
            match kind {
                ValidatorKind::Syntax => {
                    for file in files {
                        errors.extend(check_syntax(workspace, file));
                    }
                }
                ValidatorKind::Lint => {
                    errors.extend(run_eslint(workspace, files).await?);
                }
                ValidatorKind::Typecheck => {
                    errors.extend(run_tsc(workspace).await?);
                }
            }
        }
        Ok::<_, anyhow::Error>(errors)
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_elapsed) => Ok(vec![ValidationError::timeout(timeout.as_secs())]),
    }
}

// ---------------------------------------------------------------------------
// Syntax (in-process)
// ---------------------------------------------------------------------------

/// Check one file's syntax in-process. Missing files are skipped (a
/// failed patch already produced its own error).
pub fn check_syntax(workspace: &Path, rel: &str) -> Vec<ValidationError> {
    let Ok(content) = std::fs::read_to_string(workspace.join(rel)) else {
        return Vec::new();
    };

    let ext = rel.rsplit('.').next().unwrap_or("");
    match ext {
        "json" => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(_) => Vec::new(),
            Err(e) => vec![ValidationError::syntax(
                rel,
                Some(e.line() as u32),
                Some(e.column() as u32),
                format!("invalid JSON: {e}"),
            )],
        },
        "toml" => match content.parse::<toml::Value>() {
            Ok(_) => Vec::new(),
            Err(e) => vec![ValidationError::syntax(
                rel,
                None,
                None,
                format!("invalid TOML: {e}"),
            )],
        },
        // Everything else gets the tolerant bracket scanner. It knows
        // strings, comments, and escapes; it does not know the grammar.
        _ => scan_brackets(rel, &content),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

/// Tolerant bracket-balance scanner for code files: tracks `()`, `{}`,
/// and `[]` outside strings and comments, reporting the first unmatched
/// bracket with its line number.
fn scan_brackets(rel: &str, content: &str) -> Vec<ValidationError> {
    let mut stack: Vec<(char, u32)> = Vec::new();
    let mut state = ScanState::Code;
    let mut line: u32 = 1;
    let mut chars = content.chars().peekable();
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            if state == ScanState::LineComment {
                state = ScanState::Code;
            }
            escaped = false;
            continue;
        }

        match state {
            ScanState::LineComment => {}
            ScanState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = ScanState::Code;
                }
            }
            ScanState::Str(quote) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    state = ScanState::Code;
                }
            }
            ScanState::Code => match c {
                '/' => match chars.peek() {
                    Some('/') => {
                        chars.next();
                        state = ScanState::LineComment;
                    }
                    Some('*') => {
                        chars.next();
                        state = ScanState::BlockComment;
                    }
                    _ => {}
                },
                '"' | '\'' | '`' => state = ScanState::Str(c),
                '(' | '{' | '[' => stack.push((c, line)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            return vec![ValidationError::syntax(
                                rel,
                                Some(line),
                                None,
                                format!(
                                    "mismatched {c:?}: expected closer for {open:?} opened on line {open_line}"
                                ),
                            )];
                        }
                        None => {
                            return vec![ValidationError::syntax(
                                rel,
                                Some(line),
                                None,
                                format!("unmatched closing {c:?}"),
                            )];
                        }
                    }
                }
                _ => {}
            },
        }
    }

    if let Some((open, open_line)) = stack.pop() {
        return vec![ValidationError::syntax(
            rel,
            Some(open_line),
            None,
            format!("unclosed {open:?} opened on line {open_line}"),
        )];
    }

    Vec::new()
}

// ---------------------------------------------------------------------------
// Lint (eslint) and typecheck (tsc) via project binaries
// ---------------------------------------------------------------------------

fn eslint_binary(workspace: &Path) -> Option<std::path::PathBuf> {
    let local = workspace.join("node_modules/.bin/eslint");
    local.is_file().then_some(local)
}

fn has_eslint_config(workspace: &Path) -> bool {
    [
        ".eslintrc",
        ".eslintrc.json",
        ".eslintrc.js",
        ".eslintrc.cjs",
        ".eslintrc.yml",
        "eslint.config.js",
        "eslint.config.mjs",
    ]
    .iter()
    .any(|name| workspace.join(name).exists())
}

/// Run the repository's eslint over the produced files, if both the
/// binary and a configuration are present; otherwise contribute nothing.
async fn run_eslint(workspace: &Path, files: &[String]) -> Result<Vec<ValidationError>> {
    let Some(binary) = eslint_binary(workspace) else {
        debug!("eslint not installed in repository, skipping lint rung");
        return Ok(Vec::new());
    };
    if !has_eslint_config(workspace) {
        debug!("no eslint configuration in repository, skipping lint rung");
        return Ok(Vec::new());
    }

    let lintable: Vec<&String> = files
        .iter()
        .filter(|f| {
            matches!(
                f.rsplit('.').next().unwrap_or(""),
                "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs"
            )
        })
        .collect();
    if lintable.is_empty() {
        return Ok(Vec::new());
    }

    let output = tokio::process::Command::new(&binary)
        .arg("--format")
        .arg("json")
        .args(lintable.iter().map(|f| f.as_str()))
        .current_dir(workspace)
        .output()
        .await
        .context("failed to execute eslint")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_eslint_json(&stdout))
}

/// Parse eslint's `--format json` output into structured errors.
/// Warnings (severity 1) are ignored; only errors fail an attempt.
fn parse_eslint_json(stdout: &str) -> Vec<ValidationError> {
    let Ok(reports) = serde_json::from_str::<Vec<serde_json::Value>>(stdout) else {
        return Vec::new();
    };

    let mut errors = Vec::new();
    for report in &reports {
        let file = report
            .get("filePath")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_owned();
        let Some(messages) = report.get("messages").and_then(|v| v.as_array()) else {
            continue;
        };
        for msg in messages {
            if msg.get("severity").and_then(|v| v.as_u64()) != Some(2) {
                continue;
            }
            errors.push(ValidationError {
                kind: "lint".to_owned(),
                file: file.clone(),
                line: msg.get("line").and_then(|v| v.as_u64()).map(|v| v as u32),
                column: msg.get("column").and_then(|v| v.as_u64()).map(|v| v as u32),
                message: msg
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("lint error")
                    .to_owned(),
            });
        }
    }
    errors
}

fn tsc_binary(workspace: &Path) -> Option<std::path::PathBuf> {
    let local = workspace.join("node_modules/.bin/tsc");
    local.is_file().then_some(local)
}

/// Run the repository's `tsc --noEmit`, if both the binary and a
/// tsconfig are present; otherwise contribute nothing.
async fn run_tsc(workspace: &Path) -> Result<Vec<ValidationError>> {
    let Some(binary) = tsc_binary(workspace) else {
        debug!("tsc not installed in repository, skipping typecheck rung");
        return Ok(Vec::new());
    };
    if !workspace.join("tsconfig.json").exists() {
        debug!("no tsconfig.json in repository, skipping typecheck rung");
        return Ok(Vec::new());
    }

    let output = tokio::process::Command::new(&binary)
        .arg("--noEmit")
        .arg("--pretty")
        .arg("false")
        .current_dir(workspace)
        .output()
        .await
        .context("failed to execute tsc")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tsc_output(&stdout))
}

/// Parse `tsc --pretty false` diagnostics of the form
/// `src/a.ts(3,7): error TS2322: message`.
fn parse_tsc_output(stdout: &str) -> Vec<ValidationError> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"^(.+)\((\d+),(\d+)\): error (TS\d+): (.+)$").expect("valid regex")
    });
    stdout
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(ValidationError {
                kind: "typecheck".to_owned(),
                file: caps[1].to_owned(),
                line: caps[2].parse().ok(),
                column: caps[3].parse().ok(),
                message: format!("{}: {}", &caps[4], &caps[5]),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
