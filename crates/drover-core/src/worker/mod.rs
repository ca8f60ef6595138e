//! Worker runtime: a single-threaded cooperative loop that claims one
//! ticket at a time, runs it through the pipeline, and reports the
//! outcome. Multiple workers run as independent processes; nothing is
//! shared between tickets inside a worker.

pub mod api;
pub mod git;
pub mod output;
pub mod pipeline;
pub mod pr;
pub mod prompt;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::llm::{LlmClient, LlmConfig, ScopeModelMap};
use crate::worker::api::OrchestratorClient;
use crate::worker::pipeline::{PipelineOutcome, run_ticket};
use crate::worker::pr::{PrClient, PrConfig};

/// Full configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the orchestrator API.
    pub orchestrator_url: String,
    /// Shared service key for the `X-Agent-Key` header.
    pub agent_key: String,
    /// This worker's identity, recorded on claims and events.
    pub agent_id: String,
    /// Project whose tickets this worker takes.
    pub project: String,
    /// Optional epic restriction.
    pub epic_filter: Option<String>,
    /// Sleep between empty claim polls.
    pub poll_interval: Duration,
    /// Generation/validation retries inside one claim.
    pub max_internal_attempts: u32,
    /// Heartbeat period; TTL/4 is the recommended value.
    pub heartbeat_period: Duration,
    /// Ladder timeout per validation pass.
    pub validation_timeout: Duration,
    /// Wall-clock ceiling for one ticket execution.
    pub ticket_timeout: Duration,
    /// Line bound before existing files are shown head/tail-truncated.
    pub max_prompt_lines: usize,
    /// Directory under which per-ticket scratch clones live.
    pub workspace_root: PathBuf,
    /// Token spliced into HTTPS clone URLs, when the repository needs it.
    pub repo_token: Option<String>,
    /// Models the project setting may choose from; empty allows all.
    pub allowed_models: Vec<String>,
    /// Scope-keyed fallback model table.
    pub scope_models: ScopeModelMap,
    /// LLM upstream.
    pub llm: LlmConfig,
    /// Pull-request upstream.
    pub pr: PrConfig,
}

/// One worker process.
pub struct Worker {
    config: WorkerConfig,
    api: OrchestratorClient,
    llm: LlmClient,
    pr: PrClient,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let api = OrchestratorClient::new(
            config.orchestrator_url.clone(),
            config.agent_key.clone(),
            config.agent_id.clone(),
        );
        let llm = LlmClient::new(config.llm.clone());
        let pr = PrClient::new(config.pr.clone());
        Self {
            config,
            api,
            llm,
            pr,
        }
    }

    /// Outer loop: claim, execute, sleep on empty, repeat.
    ///
    /// Shutdown is graceful: the cancellation token is only consulted
    /// between tickets, so an in-flight ticket is finished, never
    /// abandoned mid-pipeline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(agent_id = %self.config.agent_id, project = %self.config.project, "worker started");

        loop {
            if cancel.is_cancelled() {
                info!(agent_id = %self.config.agent_id, "worker shutting down");
                return Ok(());
            }

            match self
                .api
                .claim(
                    Some(&self.config.project),
                    self.config.epic_filter.as_deref(),
                )
                .await
            {
                Ok(Some(grant)) => {
                    self.execute(&grant).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "claim poll failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Execute one claimed ticket and report the outcome.
    ///
    /// The wall-clock ceiling is enforced by dropping the pipeline
    /// future; its guards abort the heartbeat and dispose the scratch
    /// clone, and the reclaim sweep recovers the ticket once the claim
    /// expires.
    pub async fn execute(&self, grant: &api::ClaimResponse) {
        let ticket_id = grant.ticket.id.clone();
        let outcome = match tokio::time::timeout(
            self.config.ticket_timeout,
            run_ticket(&self.config, &self.api, &self.llm, &self.pr, grant),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                warn!(
                    ticket_id = %ticket_id,
                    "ticket hit the wall-clock ceiling; leaving recovery to the reclaim sweep"
                );
                return;
            }
        };

        match outcome {
            PipelineOutcome::Completed => {
                info!(ticket_id = %ticket_id, "ticket finished successfully");
            }
            PipelineOutcome::Aborted => {
                warn!(ticket_id = %ticket_id, "ticket aborted on stale claim");
            }
            PipelineOutcome::Failed {
                class,
                message,
                should_retry,
            } => {
                warn!(ticket_id = %ticket_id, class = %class, "ticket failed: {message}");
                let Some(token) = grant.ticket.claim_token.as_deref() else {
                    return;
                };
                if let Err(e) = self
                    .api
                    .fail(&ticket_id, token, &class, &message, should_retry)
                    .await
                {
                    error!(ticket_id = %ticket_id, error = %e, "failed to report ticket failure");
                }
            }
        }
    }
}
