//! The per-ticket pipeline: clone, generate, materialize, validate,
//! retry, commit, push, open a PR, and report completion.
//!
//! The pipeline is linear between suspension points (HTTP, LLM, git,
//! validators). A scoped heartbeat task runs alongside and flips a stale
//! flag the moment the orchestrator rejects the claim; the pipeline
//! checks the flag after every suspension point and aborts without
//! committing or pushing once it is set. The heartbeat task is aborted on
//! every exit path by its drop guard.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use drover_db::models::{EventCategory, TicketStatus};

use crate::claim::error_class;
use crate::llm::{LlmClient, TokenUsage, select_model};
use crate::patch::{self, FileChange};
use crate::validate::{self, ValidationError};
use crate::worker::WorkerConfig;
use crate::worker::api::{ApiError, ClaimResponse, CompleteRequest, OrchestratorClient};
use crate::worker::git::GitWorkspace;
use crate::worker::output::{self, GenerationOutput};
use crate::worker::pr::{PrClient, pr_body};
use crate::worker::prompt::{self, ExistingFile};

/// How one ticket execution ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Success was reported to the orchestrator; the ticket is in review.
    Completed,
    /// The worker gives up on this ticket; the caller reports the failure.
    Failed {
        class: String,
        message: String,
        should_retry: bool,
    },
    /// The claim went stale mid-flight. Nothing is reported; the
    /// orchestrator has already moved on.
    Aborted,
}

impl PipelineOutcome {
    fn failed(class: &str, message: impl Into<String>, should_retry: bool) -> Self {
        Self::Failed {
            class: class.to_owned(),
            message: message.into(),
            should_retry,
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat guard
// ---------------------------------------------------------------------------

/// Background heartbeat scoped to one ticket execution. Aborted on drop,
/// so no exit path from the pipeline can leak the task.
struct HeartbeatGuard {
    handle: JoinHandle<()>,
    stale: Arc<AtomicBool>,
}

impl HeartbeatGuard {
    fn spawn(api: OrchestratorClient, ticket_id: String, claim_token: String, period: std::time::Duration) -> Self {
        let stale = Arc::new(AtomicBool::new(false));
        let stale_flag = Arc::clone(&stale);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the claim's
            // initial heartbeat timestamp stands.
            interval.tick().await;
            loop {
                interval.tick().await;
                match api.heartbeat(&ticket_id, &claim_token).await {
                    Ok(()) => {}
                    Err(ApiError::StaleClaim) => {
                        warn!(ticket_id = %ticket_id, "heartbeat rejected: claim is stale");
                        stale_flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        // Transient orchestrator trouble: keep beating.
                        warn!(ticket_id = %ticket_id, error = %e, "heartbeat failed");
                    }
                }
            }
        });

        Self { handle, stale }
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Scratch workspace guard
// ---------------------------------------------------------------------------

/// Deletes the scratch clone when the execution ends, success or crash.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct AttemptRecord {
    attempt: u32,
    duration_ms: u128,
    error_count: usize,
    usage: TokenUsage,
}

/// Run one claimed ticket through the full pipeline.
pub async fn run_ticket(
    config: &WorkerConfig,
    api: &OrchestratorClient,
    llm: &LlmClient,
    pr_client: &PrClient,
    grant: &ClaimResponse,
) -> PipelineOutcome {
    let ticket = &grant.ticket;
    let settings = &grant.project_settings;
    let Some(claim_token) = ticket.claim_token.clone() else {
        warn!(ticket_id = %ticket.id, "claim grant carried no token, dropping ticket");
        return PipelineOutcome::Aborted;
    };

    // assigned -> in_progress.
    match api.advance_status(&ticket.id, &claim_token, TicketStatus::InProgress).await {
        Ok(()) => {}
        Err(ApiError::StaleClaim) => return PipelineOutcome::Aborted,
        Err(e) => return PipelineOutcome::failed(error_class::NETWORK_ERROR, e.to_string(), true),
    }

    // 1. Setup: clone and check out the ticket branch.
    let scratch = config.workspace_root.join(&ticket.id);
    let _ = std::fs::remove_dir_all(&scratch);
    let _scratch_guard = ScratchDir(scratch.clone());

    let workspace =
        match GitWorkspace::clone(&ticket.repo_url, config.repo_token.as_deref(), &scratch).await {
            Ok(ws) => ws,
            Err(e) => {
                return PipelineOutcome::failed(
                    error_class::GIT_ERROR,
                    format!("clone failed: {e:#}"),
                    true,
                );
            }
        };
    if let Err(e) = workspace
        .checkout_branch(&ticket.branch_name, &settings.base_branch)
        .await
    {
        return PipelineOutcome::failed(
            error_class::GIT_ERROR,
            format!("branch checkout failed: {e:#}"),
            true,
        );
    }
    let _ = api
        .post_activity(
            &ticket.id,
            &EventCategory::GitOperation.to_string(),
            "cloned repository and checked out branch",
            serde_json::json!({"branch": ticket.branch_name}),
        )
        .await;

    // 2. Existing-file fetch with head/tail bounding. Missing paths are
    // logged but not fatal; a later create may cover them.
    let mut existing = Vec::new();
    for path in &ticket.files_to_modify {
        match workspace.read_file(path) {
            Some(content) => {
                let (snippet, truncated) =
                    prompt::snippet_for_prompt(&content, config.max_prompt_lines);
                existing.push(ExistingFile {
                    path: path.clone(),
                    snippet,
                    truncated,
                });
            }
            None => {
                warn!(ticket_id = %ticket.id, path = %path, "file to modify not found in repository");
            }
        }
    }

    let base_prompt = prompt::build_prompt(ticket, &existing);

    // Scoped heartbeat for the duration of the generation loop and
    // everything after it.
    let heartbeat = HeartbeatGuard::spawn(
        api.clone(),
        ticket.id.clone(),
        claim_token.clone(),
        config.heartbeat_period,
    );

    // 3-8. The inner generation / materialization / validation loop.
    let generated = match generation_loop(
        config, api, llm, &heartbeat, &workspace, grant, &claim_token, &base_prompt,
    )
    .await
    {
        GenerationLoopResult::Success(output) => output,
        GenerationLoopResult::Abort => return PipelineOutcome::Aborted,
        GenerationLoopResult::Fail(outcome) => return outcome,
    };

    if heartbeat.is_stale() {
        return PipelineOutcome::Aborted;
    }

    // 9. Commit and push.
    if let Err(e) = workspace.stage_all().await {
        return PipelineOutcome::failed(error_class::GIT_ERROR, format!("{e:#}"), true);
    }
    match workspace.has_changes().await {
        Ok(true) => {}
        Ok(false) => {
            return PipelineOutcome::failed(
                error_class::EMPTY_COMMIT,
                "no changes produced by generation",
                false,
            );
        }
        Err(e) => return PipelineOutcome::failed(error_class::GIT_ERROR, format!("{e:#}"), true),
    }
    let files_changed = workspace.staged_files().await.unwrap_or_default();

    let commit_message = format!(
        "{}: {}\n\n{}",
        ticket.id,
        ticket.title,
        generated.summary.trim()
    );
    let commit_sha = match workspace.commit(&commit_message).await {
        Ok(sha) => sha,
        Err(e) => {
            return PipelineOutcome::failed(
                error_class::GIT_ERROR,
                format!("commit failed: {e:#}"),
                true,
            );
        }
    };
    let _ = api
        .post_activity(
            &ticket.id,
            &EventCategory::GitOperation.to_string(),
            "committed changes",
            serde_json::json!({"commit_sha": commit_sha, "files": files_changed}),
        )
        .await;

    if heartbeat.is_stale() {
        // Forbidden from pushing once the claim is stale.
        return PipelineOutcome::Aborted;
    }
    if let Err(e) = workspace.push(&ticket.branch_name).await {
        return PipelineOutcome::failed(
            error_class::GIT_ERROR,
            format!("push failed: {e:#}"),
            true,
        );
    }

    // 10. Pull request.
    let title = format!("{}: {}", ticket.id, ticket.title);
    let body = pr_body(&generated.summary, &generated.acceptance_criteria_status);
    let pr_url = match pr_client
        .open_pull_request(
            &ticket.repo_url,
            &title,
            &body,
            &ticket.branch_name,
            &settings.base_branch,
        )
        .await
    {
        Ok(url) => url,
        Err(e) => {
            return PipelineOutcome::failed(
                error_class::GIT_ERROR,
                format!("pull request creation failed: {e:#}"),
                true,
            );
        }
    };

    // 11. Report success.
    let request = CompleteRequest {
        ticket_id: ticket.id.clone(),
        agent_id: api.agent_id.clone(),
        claim_token: claim_token.clone(),
        success: true,
        pr_url: Some(pr_url),
        branch_name: Some(ticket.branch_name.clone()),
        commit_sha: Some(commit_sha),
        error: None,
        criteria_status: Some(generated.acceptance_criteria_status.clone()),
        files_changed: Some(files_changed),
    };
    match api.complete(&request).await {
        Ok(()) => {
            info!(ticket_id = %ticket.id, "ticket completed");
            PipelineOutcome::Completed
        }
        Err(ApiError::StaleClaim) => PipelineOutcome::Aborted,
        Err(e) => PipelineOutcome::failed(error_class::NETWORK_ERROR, e.to_string(), true),
    }
}

enum GenerationLoopResult {
    Success(GenerationOutput),
    Fail(PipelineOutcome),
    Abort,
}

/// Steps 3-8: call the model, materialize files, validate, and retry with
/// structured errors until clean or the internal budget is spent.
#[allow(clippy::too_many_arguments)]
async fn generation_loop(
    config: &WorkerConfig,
    api: &OrchestratorClient,
    llm: &LlmClient,
    heartbeat: &HeartbeatGuard,
    workspace: &GitWorkspace,
    grant: &ClaimResponse,
    claim_token: &str,
    base_prompt: &str,
) -> GenerationLoopResult {
    let ticket = &grant.ticket;
    let settings = &grant.project_settings;
    let model = select_model(settings, ticket, &config.allowed_models, &config.scope_models);

    let mut previous_errors: Vec<ValidationError> = Vec::new();
    let mut in_verifying = false;

    for attempt in 1..=config.max_internal_attempts {
        let started = Instant::now();

        let prompt = if previous_errors.is_empty() {
            base_prompt.to_owned()
        } else {
            prompt::build_retry_prompt(base_prompt, &previous_errors)
        };

        // 3. Generation call. API and network errors abort the internal
        // loop; the orchestrator re-queues the ticket.
        let response = match llm.generate(&model, prompt::SYSTEM_PERSONA, &prompt).await {
            Ok(response) => response,
            Err(crate::llm::LlmError::Api { status, .. }) => {
                return GenerationLoopResult::Fail(PipelineOutcome::failed(
                    error_class::API_ERROR,
                    format!("LLM call returned status {status}"),
                    true,
                ));
            }
            Err(e) => {
                return GenerationLoopResult::Fail(PipelineOutcome::failed(
                    error_class::NETWORK_ERROR,
                    e.to_string(),
                    true,
                ));
            }
        };
        if heartbeat.is_stale() {
            return GenerationLoopResult::Abort;
        }

        // Parse, tolerating fences and falling back to delimiters.
        let parsed = output::parse_generation_output(&response.text);
        let mut errors: Vec<ValidationError> = Vec::new();

        let output = match parsed {
            Ok(output) => {
                if output.via_fallback {
                    warn!(ticket_id = %ticket.id, attempt, "JSON parse failed, used delimiter fallback");
                }
                Some(output)
            }
            Err(e) => {
                errors.push(ValidationError {
                    kind: "output".to_owned(),
                    file: String::new(),
                    line: None,
                    column: None,
                    message: format!("response was not a valid generation output: {e}"),
                });
                None
            }
        };

        if let Some(output) = &output {
            // 4. BLOCKED check: non-retryable, reported with evidence.
            let blocked = output.blocked_criteria();
            if !blocked.is_empty() {
                let evidence = blocked
                    .iter()
                    .map(|c| format!("{}: {}", c.id, c.evidence))
                    .collect::<Vec<_>>()
                    .join("; ");
                return GenerationLoopResult::Fail(PipelineOutcome::failed(
                    error_class::BLOCKED,
                    format!("blocked acceptance criteria: {evidence}"),
                    false,
                ));
            }

            // 5. Workspace reset on retries: the clone returns to the
            // branch tip so patches see the same preconditions.
            if attempt >= 2 {
                if let Err(e) = workspace.reset_workspace().await {
                    return GenerationLoopResult::Fail(PipelineOutcome::failed(
                        error_class::GIT_ERROR,
                        format!("workspace reset failed: {e:#}"),
                        true,
                    ));
                }
            }

            // 6. Materialization through the patch engine. Tests are
            // plain creates.
            let mut changes = output.files.clone();
            changes.extend(output.tests.iter().map(|t| FileChange::Create {
                path: t.path.clone(),
                content: t.content.clone(),
            }));
            let report = patch::apply_changes(workspace.root(), &changes);
            for failure in &report.failed {
                errors.push(ValidationError::patch_failed(&failure.path, &failure.reason));
            }

            // in_progress -> verifying (first entry only; later retries
            // re-enter from verifying).
            if !in_verifying {
                match api
                    .advance_status(&ticket.id, claim_token, TicketStatus::Verifying)
                    .await
                {
                    Ok(()) => in_verifying = true,
                    Err(ApiError::StaleClaim) => return GenerationLoopResult::Abort,
                    Err(e) => {
                        return GenerationLoopResult::Fail(PipelineOutcome::failed(
                            error_class::NETWORK_ERROR,
                            e.to_string(),
                            true,
                        ));
                    }
                }
            }

            // 7. Validation ladder over everything materialized.
            let written: Vec<String> = report.written.clone();
            match validate::run_validation(
                workspace.root(),
                &written,
                settings.validation_level,
                config.validation_timeout,
            )
            .await
            {
                Ok(validation_errors) => errors.extend(validation_errors),
                Err(e) => errors.push(ValidationError {
                    kind: "validation".to_owned(),
                    file: String::new(),
                    line: None,
                    column: None,
                    message: format!("validator dispatch failed: {e:#}"),
                }),
            }
            let _ = api
                .post_activity(
                    &ticket.id,
                    &EventCategory::Validation.to_string(),
                    &format!("attempt {attempt}: {} validation errors", errors.len()),
                    serde_json::json!({
                        "attempt": attempt,
                        "errors": &errors,
                    }),
                )
                .await;
        }

        // Attempt history entry, success or not.
        let record = AttemptRecord {
            attempt,
            duration_ms: started.elapsed().as_millis(),
            error_count: errors.len(),
            usage: response.usage,
        };
        let _ = api
            .post_activity(
                &ticket.id,
                &EventCategory::CodeGeneration.to_string(),
                &format!("generation attempt {attempt} finished"),
                serde_json::json!({
                    "attempt": record.attempt,
                    "duration_ms": record.duration_ms,
                    "error_count": record.error_count,
                    "input_tokens": record.usage.input_tokens,
                    "output_tokens": record.usage.output_tokens,
                    "model": model,
                }),
            )
            .await;

        if heartbeat.is_stale() {
            return GenerationLoopResult::Abort;
        }

        if errors.is_empty() {
            if let Some(output) = output {
                return GenerationLoopResult::Success(output);
            }
        }

        // 8. Retry branch: loop with a retry prompt while budget remains.
        if attempt < config.max_internal_attempts {
            // verifying -> in_progress for the re-entry.
            if in_verifying {
                match api
                    .advance_status(&ticket.id, claim_token, TicketStatus::InProgress)
                    .await
                {
                    Ok(()) => in_verifying = false,
                    Err(ApiError::StaleClaim) => return GenerationLoopResult::Abort,
                    Err(e) => {
                        return GenerationLoopResult::Fail(PipelineOutcome::failed(
                            error_class::NETWORK_ERROR,
                            e.to_string(),
                            true,
                        ));
                    }
                }
            }
            previous_errors = errors;
            continue;
        }

        // Budget exhausted: classify by what kept failing.
        let all_patch = !errors.is_empty() && errors.iter().all(|e| e.kind == "patch");
        let class = if all_patch {
            error_class::PATCH_EXHAUSTED
        } else {
            error_class::VALIDATION_EXHAUSTED
        };
        let summary = errors
            .iter()
            .take(5)
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return GenerationLoopResult::Fail(PipelineOutcome::failed(
            class,
            format!(
                "{} internal attempts exhausted: {summary}",
                config.max_internal_attempts
            ),
            true,
        ));
    }

    // max_internal_attempts >= 1 always enters the loop.
    GenerationLoopResult::Fail(PipelineOutcome::failed(
        error_class::VALIDATION_EXHAUSTED,
        "no generation attempts were configured",
        true,
    ))
}
