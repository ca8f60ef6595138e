//! Parsing of the model's generation output.
//!
//! The contract is a single JSON object, optionally wrapped in a fenced
//! code block. The schema is strict: `action` selects `create` (requires
//! `content`) or `modify` (requires `patches`), and unknown fields are
//! rejected rather than silently ignored. When JSON parsing fails
//! entirely, a delimiter-based extractor (`===FILE: <path>===` ...
//! `===END FILE===`) salvages full-file creates.

use serde::Deserialize;

use drover_db::models::{CriterionReport, CriterionStatus};

use crate::patch::{FileChange, PatchOp};

/// A test file emitted alongside the implementation files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestFile {
    pub path: String,
    pub content: String,
}

/// A validated generation output.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub files: Vec<FileChange>,
    pub tests: Vec<TestFile>,
    pub summary: String,
    pub acceptance_criteria_status: Vec<CriterionReport>,
    pub root_cause_analysis: Option<String>,
    /// True when the delimiter fallback produced this output.
    pub via_fallback: bool,
}

impl GenerationOutput {
    /// Criteria the model reported as BLOCKED. Any entry here makes the
    /// ticket a non-retryable failure.
    pub fn blocked_criteria(&self) -> Vec<&CriterionReport> {
        self.acceptance_criteria_status
            .iter()
            .filter(|c| c.status == CriterionStatus::Blocked)
            .collect()
    }
}

/// Errors from output parsing.
#[derive(Debug, thiserror::Error)]
pub enum OutputParseError {
    #[error("generation output is not parseable: {0}")]
    Unparseable(String),

    #[error("generation output is invalid: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Raw wire schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutput {
    files: Vec<RawFile>,
    #[serde(default)]
    tests: Vec<TestFile>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    acceptance_criteria_status: Vec<CriterionReport>,
    #[serde(default)]
    root_cause_analysis: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    path: String,
    action: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    patches: Option<Vec<PatchOp>>,
}

fn validate_file(raw: RawFile) -> Result<FileChange, OutputParseError> {
    match raw.action.as_str() {
        "create" => {
            let content = raw.content.ok_or_else(|| {
                OutputParseError::Invalid(format!("create for {} is missing content", raw.path))
            })?;
            Ok(FileChange::Create {
                path: raw.path,
                content,
            })
        }
        "modify" => {
            let patches = raw.patches.ok_or_else(|| {
                OutputParseError::Invalid(format!("modify for {} is missing patches", raw.path))
            })?;
            Ok(FileChange::Modify {
                path: raw.path,
                patches,
            })
        }
        other => Err(OutputParseError::Invalid(format!(
            "unknown action {other:?} for {}",
            raw.path
        ))),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Parse a model response into a [`GenerationOutput`].
///
/// Accepts bare JSON or JSON inside a fenced code block. When no JSON
/// object parses, falls back to the `===FILE:` delimiter extractor and
/// treats every extracted file as a full create.
pub fn parse_generation_output(text: &str) -> Result<GenerationOutput, OutputParseError> {
    let candidate = strip_fence(text);

    match serde_json::from_str::<RawOutput>(candidate) {
        Ok(raw) => {
            let files = raw
                .files
                .into_iter()
                .map(validate_file)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(GenerationOutput {
                files,
                tests: raw.tests,
                summary: raw.summary,
                acceptance_criteria_status: raw.acceptance_criteria_status,
                root_cause_analysis: raw.root_cause_analysis,
                via_fallback: false,
            })
        }
        Err(json_err) => {
            let files = extract_delimited_files(text);
            if files.is_empty() {
                return Err(OutputParseError::Unparseable(json_err.to_string()));
            }
            Ok(GenerationOutput {
                files,
                tests: Vec::new(),
                summary: String::new(),
                acceptance_criteria_status: Vec::new(),
                root_cause_analysis: None,
                via_fallback: true,
            })
        }
    }
}

/// Strip a surrounding fenced code block (with or without a language
/// tag), returning the inner text. Leaves bare text untouched.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag line, if any.
    match rest.split_once('\n') {
        Some((first_line, body)) if !first_line.trim_start().starts_with('{') => body.trim(),
        _ => rest.trim(),
    }
}

/// Extract files delimited by `===FILE: <path>===` ... `===END FILE===`.
fn extract_delimited_files(text: &str) -> Vec<FileChange> {
    let mut files = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("===FILE:") {
        let after_marker = &rest[start + "===FILE:".len()..];
        let Some(header_end) = after_marker.find("===") else {
            break;
        };
        let path = after_marker[..header_end].trim().to_owned();
        let body_start = &after_marker[header_end + 3..];
        let Some(end) = body_start.find("===END FILE===") else {
            break;
        };
        let content = body_start[..end]
            .trim_start_matches('\n')
            .trim_end()
            .to_owned();
        if !path.is_empty() {
            files.push(FileChange::Create {
                path,
                content: format!("{content}\n"),
            });
        }
        rest = &body_start[end + "===END FILE===".len()..];
    }

    files
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_JSON: &str = r#"{
        "files": [
            {"path": "src/a.js", "action": "create", "content": "export function foo(){}\n"},
            {"path": "src/b.js", "action": "modify", "patches": [
                {"search": "old", "replace": "new"}
            ]}
        ],
        "tests": [{"path": "test/a.test.js", "content": "test('foo', () => {});\n"}],
        "summary": "Adds foo and updates b.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "SATISFIED", "evidence": "src/a.js exports foo"}
        ]
    }"#;

    #[test]
    fn parses_bare_json() {
        let output = parse_generation_output(GOOD_JSON).expect("should parse");
        assert!(!output.via_fallback);
        assert_eq!(output.files.len(), 2);
        assert_eq!(output.tests.len(), 1);
        assert_eq!(output.summary, "Adds foo and updates b.");
        assert!(matches!(&output.files[0], FileChange::Create { path, .. } if path == "src/a.js"));
        assert!(matches!(&output.files[1], FileChange::Modify { patches, .. } if patches.len() == 1));
    }

    #[test]
    fn parses_fenced_json_with_language_tag() {
        let fenced = format!("```json\n{GOOD_JSON}\n```");
        let output = parse_generation_output(&fenced).expect("should parse");
        assert_eq!(output.files.len(), 2);
    }

    #[test]
    fn parses_fenced_json_without_language_tag() {
        let fenced = format!("```\n{GOOD_JSON}\n```");
        let output = parse_generation_output(&fenced).expect("should parse");
        assert_eq!(output.files.len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{"files": [], "summary": "x", "surprise": true}"#;
        let result = parse_generation_output(json);
        assert!(result.is_err(), "unknown top-level field must not be ignored");
    }

    #[test]
    fn create_without_content_is_invalid() {
        let json = r#"{"files": [{"path": "a.js", "action": "create"}], "summary": ""}"#;
        let err = parse_generation_output(json).unwrap_err();
        assert!(matches!(err, OutputParseError::Invalid(_)));
    }

    #[test]
    fn modify_without_patches_is_invalid() {
        let json =
            r#"{"files": [{"path": "a.js", "action": "modify", "content": "x"}], "summary": ""}"#;
        let err = parse_generation_output(json).unwrap_err();
        assert!(matches!(err, OutputParseError::Invalid(_)));
    }

    #[test]
    fn unknown_action_is_invalid() {
        let json = r#"{"files": [{"path": "a.js", "action": "delete"}], "summary": ""}"#;
        assert!(parse_generation_output(json).is_err());
    }

    #[test]
    fn delimiter_fallback_extracts_creates() {
        let text = "Here are the files.\n\
                    ===FILE: src/a.js===\n\
                    export function foo() {}\n\
                    ===END FILE===\n\
                    ===FILE: src/b.js===\n\
                    export function bar() {}\n\
                    ===END FILE===\n";
        let output = parse_generation_output(text).expect("fallback should extract");
        assert!(output.via_fallback);
        assert_eq!(output.files.len(), 2);
        assert!(matches!(
            &output.files[0],
            FileChange::Create { path, content }
                if path == "src/a.js" && content.contains("foo")
        ));
    }

    #[test]
    fn garbage_without_delimiters_is_unparseable() {
        let err = parse_generation_output("I could not produce any files, sorry.").unwrap_err();
        assert!(matches!(err, OutputParseError::Unparseable(_)));
    }

    #[test]
    fn blocked_criteria_are_surfaced() {
        let json = r#"{
            "files": [],
            "summary": "",
            "acceptance_criteria_status": [
                {"id": "AC-1", "criterion": "works", "status": "BLOCKED", "evidence": "missing schema docs"},
                {"id": "AC-2", "criterion": "tested", "status": "SATISFIED", "evidence": "tests added"}
            ]
        }"#;
        let output = parse_generation_output(json).unwrap();
        let blocked = output.blocked_criteria();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].id, "AC-1");
    }
}
