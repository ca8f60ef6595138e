//! Generation prompt assembly.
//!
//! The prompt carries the task description, the enumerated acceptance
//! criteria with their stable ids, the explicit target file lists, the
//! fetched snippets of files to modify, any sentinel reviewer feedback,
//! and (on retries) the structured errors of the failed attempt.

use drover_db::models::Ticket;

use crate::validate::ValidationError;

/// System persona sent with every generation call. States the output
/// contract the parser enforces.
pub const SYSTEM_PERSONA: &str = "\
You are an autonomous software engineer working on one ticket in an \
existing repository. You produce complete, working code changes.\n\
\n\
Respond with a single JSON object of this exact shape and nothing else:\n\
{\n\
  \"files\": [{\"path\": \"...\", \"action\": \"create\"|\"modify\", \
\"content\"?: \"...\", \"patches\"?: [{\"search\": \"...\", \"replace\": \"...\"}]}],\n\
  \"tests\": [{\"path\": \"...\", \"content\": \"...\"}],\n\
  \"summary\": \"...\",\n\
  \"acceptance_criteria_status\": [{\"id\": \"...\", \"criterion\": \"...\", \
\"status\": \"SATISFIED\"|\"PARTIALLY_SATISFIED\"|\"BLOCKED\", \"evidence\": \"...\"}],\n\
  \"root_cause_analysis\"?: \"...\"\n\
}\n\
\n\
Use action=create with full content for new files. Use action=modify with \
search/replace patches for existing files; each search must quote the \
existing text exactly. Mark a criterion BLOCKED only when it cannot be \
satisfied without information you do not have, and say why in evidence.";

/// An existing file fetched for the prompt, possibly truncated.
#[derive(Debug, Clone)]
pub struct ExistingFile {
    pub path: String,
    pub snippet: String,
    pub truncated: bool,
}

/// Bound a large file for the prompt: head half, ellipsis marker, tail
/// half. Files within `max_lines` pass through untouched.
pub fn snippet_for_prompt(content: &str, max_lines: usize) -> (String, bool) {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= max_lines {
        return (content.to_owned(), false);
    }

    let half = max_lines / 2;
    let mut out = String::new();
    for line in &lines[..half] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("\n... (");
    out.push_str(&(lines.len() - 2 * half).to_string());
    out.push_str(" lines elided) ...\n\n");
    for line in &lines[lines.len() - half..] {
        out.push_str(line);
        out.push('\n');
    }
    (out, true)
}

/// Assemble the base generation prompt for a ticket.
pub fn build_prompt(ticket: &Ticket, existing: &[ExistingFile]) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Ticket {}: {}\n\n", ticket.id, ticket.title));
    prompt.push_str(&ticket.description);
    prompt.push_str("\n\n## Acceptance criteria\n\n");
    for criterion in &ticket.acceptance_criteria.0 {
        prompt.push_str(&format!("- {}: {}\n", criterion.id, criterion.description));
    }

    prompt.push_str("\n## Files to create\n\n");
    if ticket.files_to_create.is_empty() {
        prompt.push_str("(none)\n");
    } else {
        for path in &ticket.files_to_create {
            prompt.push_str(&format!("- {path}\n"));
        }
    }

    prompt.push_str("\n## Files to modify\n\n");
    if ticket.files_to_modify.is_empty() {
        prompt.push_str("(none)\n");
    } else {
        for path in &ticket.files_to_modify {
            prompt.push_str(&format!("- {path}\n"));
        }
    }

    if !existing.is_empty() {
        prompt.push_str("\n## Current file contents\n");
        for file in existing {
            prompt.push_str(&format!("\n### {}\n", file.path));
            if file.truncated {
                prompt.push_str("(truncated: middle elided)\n");
            }
            prompt.push_str("```\n");
            prompt.push_str(&file.snippet);
            if !file.snippet.ends_with('\n') {
                prompt.push('\n');
            }
            prompt.push_str("```\n");
        }
    }

    if let Some(feedback) = &ticket.review_feedback {
        prompt.push_str("\n## Reviewer feedback on the previous pull request\n\n");
        if let Some(notes) = feedback.get("notes").and_then(|n| n.as_str()) {
            prompt.push_str(notes);
            prompt.push('\n');
        } else {
            prompt.push_str(&feedback.to_string());
            prompt.push('\n');
        }
        prompt.push_str("\nAddress this feedback in your changes.\n");
    }

    prompt
}

/// Prefix a base prompt with the structured errors of the previous
/// attempt and a directive to fix exactly those errors.
pub fn build_retry_prompt(base_prompt: &str, errors: &[ValidationError]) -> String {
    let mut prompt = String::new();
    prompt.push_str("## Your previous attempt failed validation\n\n");
    prompt.push_str("Fix these specific errors. Do not introduce unrelated changes.\n\n");
    for err in errors {
        match (err.line, err.column) {
            (Some(line), Some(col)) => prompt.push_str(&format!(
                "- [{}] {}:{}:{}: {}\n",
                err.kind, err.file, line, col, err.message
            )),
            (Some(line), None) => prompt.push_str(&format!(
                "- [{}] {}:{}: {}\n",
                err.kind, err.file, line, err.message
            )),
            _ => prompt.push_str(&format!("- [{}] {}: {}\n", err.kind, err.file, err.message)),
        }
    }
    prompt.push_str("\n---\n\n");
    prompt.push_str(base_prompt);
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_db::models::{
        AcceptanceCriterion, EstimatedScope, TicketStatus,
    };
    use sqlx::types::Json;

    fn ticket() -> Ticket {
        Ticket {
            id: "TKT-0000feed".to_owned(),
            project: "demo".to_owned(),
            title: "Add greeting helper".to_owned(),
            description: "Implement a greeting helper used by the CLI.".to_owned(),
            acceptance_criteria: Json(vec![AcceptanceCriterion {
                id: "AC-1".to_owned(),
                description: "exports greet".to_owned(),
            }]),
            estimated_scope: EstimatedScope::Small,
            repo_url: "https://example.com/r.git".to_owned(),
            branch_name: "drover/TKT-0000feed".to_owned(),
            epic: None,
            model_override: None,
            files_to_create: vec!["src/greet.js".to_owned()],
            files_to_modify: vec!["src/index.js".to_owned()],
            attempts: 0,
            max_attempts: 3,
            last_error_class: None,
            status: TicketStatus::InProgress,
            assignee_id: Some("w1".to_owned()),
            claim_token: Some("tok".to_owned()),
            claim_expires_at: None,
            last_heartbeat: None,
            review_feedback: None,
            criteria_status: None,
            pr_url: None,
            commit_sha: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_carries_criteria_and_file_lists() {
        let prompt = build_prompt(&ticket(), &[]);
        assert!(prompt.contains("TKT-0000feed"));
        assert!(prompt.contains("AC-1: exports greet"));
        assert!(prompt.contains("- src/greet.js"));
        assert!(prompt.contains("- src/index.js"));
    }

    #[test]
    fn prompt_embeds_existing_file_snippets() {
        let existing = vec![ExistingFile {
            path: "src/index.js".to_owned(),
            snippet: "module.exports = {};\n".to_owned(),
            truncated: false,
        }];
        let prompt = build_prompt(&ticket(), &existing);
        assert!(prompt.contains("### src/index.js"));
        assert!(prompt.contains("module.exports = {};"));
    }

    #[test]
    fn prompt_carries_reviewer_feedback_when_present() {
        let mut t = ticket();
        t.review_feedback = Some(serde_json::json!({"reviewer": "r1", "notes": "rename foo"}));
        let prompt = build_prompt(&t, &[]);
        assert!(prompt.contains("Reviewer feedback"));
        assert!(prompt.contains("rename foo"));
    }

    #[test]
    fn small_files_pass_through_untruncated() {
        let content = "a\nb\nc\n";
        let (snippet, truncated) = snippet_for_prompt(content, 10);
        assert_eq!(snippet, content);
        assert!(!truncated);
    }

    #[test]
    fn large_files_keep_head_and_tail_halves() {
        let content: String = (1..=100).map(|i| format!("line {i}\n")).collect();
        let (snippet, truncated) = snippet_for_prompt(&content, 10);
        assert!(truncated);
        assert!(snippet.contains("line 1\n"));
        assert!(snippet.contains("line 5\n"));
        assert!(!snippet.contains("line 50\n"));
        assert!(snippet.contains("line 96\n"));
        assert!(snippet.contains("line 100\n"));
        assert!(snippet.contains("lines elided"));
    }

    #[test]
    fn retry_prompt_prefixes_errors_before_base() {
        let base = build_prompt(&ticket(), &[]);
        let errors = vec![
            ValidationError::syntax("src/greet.js", Some(3), Some(7), "unexpected token".into()),
            ValidationError::patch_failed("src/index.js", "no match for search text"),
        ];
        let retry = build_retry_prompt(&base, &errors);

        assert!(retry.starts_with("## Your previous attempt failed validation"));
        assert!(retry.contains("src/greet.js:3:7: unexpected token"));
        assert!(retry.contains("PATCH FAILED for src/index.js"));
        let errors_idx = retry.find("unexpected token").unwrap();
        let base_idx = retry.find("Add greeting helper").unwrap();
        assert!(errors_idx < base_idx, "errors come before the base prompt");
    }
}
