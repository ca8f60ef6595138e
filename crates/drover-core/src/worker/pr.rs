//! Pull-request creation against a GitHub-style API.
//!
//! The head reference is tried in same-repo form (`branch`) first, then
//! cross-owner form (`owner:branch`). Only an HTTP 422 validation error
//! advances to the next form; any other failure status aborts.

use anyhow::{Context, Result, bail};
use serde::Serialize;

use drover_db::models::CriterionReport;

/// Configuration for the PR upstream.
#[derive(Debug, Clone)]
pub struct PrConfig {
    /// API base, e.g. `https://api.github.com`.
    pub api_base: String,
    /// Access token for the `Authorization` header.
    pub token: String,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

/// Extract `(owner, repo)` from a clone URL: the path components after
/// the host for HTTPS, or the last two components of a filesystem path.
pub fn parse_repo_slug(repo_url: &str) -> Option<(String, String)> {
    if let Some(rest) = repo_url.strip_prefix("https://") {
        let mut parts = rest.split('/');
        let _host = parts.next()?;
        let owner = parts.next()?.to_owned();
        let repo = parts.next()?.trim_end_matches(".git").to_owned();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        return Some((owner, repo));
    }

    let mut parts = repo_url.rsplit('/').filter(|p| !p.is_empty());
    let repo = parts.next()?.trim_end_matches(".git").to_owned();
    let owner = parts.next()?.to_owned();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

/// Render the PR body: the summary followed by a table of acceptance
/// criteria verdicts.
pub fn pr_body(summary: &str, criteria: &[CriterionReport]) -> String {
    let mut body = String::new();
    body.push_str(summary);
    body.push_str("\n\n## Acceptance criteria\n\n");
    body.push_str("| id | status | evidence |\n|---|---|---|\n");
    for report in criteria {
        body.push_str(&format!(
            "| {} | {} | {} |\n",
            report.id,
            report.status,
            report.evidence.replace('|', "\\|")
        ));
    }
    body
}

/// PR client; a process-wide handle like the LLM client.
#[derive(Debug, Clone)]
pub struct PrClient {
    http: reqwest::Client,
    config: PrConfig,
}

impl PrClient {
    pub fn new(config: PrConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Open a pull request and return its HTML URL.
    pub async fn open_pull_request(
        &self,
        repo_url: &str,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<String> {
        let (owner, repo) = parse_repo_slug(repo_url)
            .with_context(|| format!("cannot derive owner/repo from {repo_url}"))?;
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.config.api_base);

        let cross_owner = format!("{owner}:{head_branch}");
        let head_candidates = [head_branch, cross_owner.as_str()];

        for (i, head) in head_candidates.iter().enumerate() {
            let request = CreatePullRequest {
                title,
                body,
                head,
                base: base_branch,
            };
            let response = self
                .http
                .post(&url)
                .header("authorization", format!("Bearer {}", self.config.token))
                .header("user-agent", "drover-worker")
                .header("accept", "application/vnd.github+json")
                .json(&request)
                .send()
                .await
                .context("pull request call failed")?;

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let payload: serde_json::Value = response
                    .json()
                    .await
                    .context("malformed pull request response")?;
                return payload
                    .get("html_url")
                    .and_then(|u| u.as_str())
                    .map(str::to_owned)
                    .context("pull request response missing html_url");
            }

            // 422 means the head reference format was not accepted; try
            // the next form. Anything else is a hard failure.
            let is_last = i == head_candidates.len() - 1;
            if status != 422 || is_last {
                let body = response.text().await.unwrap_or_default();
                bail!("pull request creation failed with status {status}: {body}");
            }
        }

        unreachable!("head candidate loop always returns or bails");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
