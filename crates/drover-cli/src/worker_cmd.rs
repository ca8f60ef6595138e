//! `drover worker`: run one worker process against an orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drover_core::llm::{LlmConfig, ScopeModelMap};
use drover_core::worker::pr::PrConfig;
use drover_core::worker::{Worker, WorkerConfig};

#[derive(Debug, clap::Args)]
pub struct WorkerArgs {
    /// Orchestrator base URL
    #[arg(long, default_value = "http://127.0.0.1:7878")]
    pub orchestrator_url: String,
    /// Project whose tickets this worker executes
    #[arg(long)]
    pub project: String,
    /// Restrict claims to one epic
    #[arg(long)]
    pub epic: Option<String>,
    /// Worker identity (defaults to a random id)
    #[arg(long)]
    pub agent_id: Option<String>,
    /// Seconds to sleep between empty claim polls
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,
    /// Generation/validation retries within one claim
    #[arg(long, default_value_t = 3)]
    pub max_internal_attempts: u32,
    /// Seconds between heartbeats (claim TTL / 4 is recommended)
    #[arg(long, default_value_t = 75)]
    pub heartbeat_period: u64,
    /// Seconds allowed per validation ladder pass
    #[arg(long, default_value_t = 120)]
    pub validation_timeout: u64,
    /// Seconds allowed per LLM generation call
    #[arg(long, default_value_t = 300)]
    pub generation_timeout: u64,
    /// Wall-clock ceiling per ticket in seconds
    #[arg(long, default_value_t = 3600)]
    pub ticket_timeout: u64,
    /// Line bound before existing files are truncated in the prompt
    #[arg(long, default_value_t = 400)]
    pub max_prompt_lines: usize,
    /// Directory for per-ticket scratch clones
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,
    /// LLM messages endpoint
    #[arg(long, default_value = "https://api.anthropic.com/v1/messages")]
    pub llm_url: String,
    /// Max tokens per generation call
    #[arg(long, default_value_t = 8192)]
    pub llm_max_tokens: u32,
    /// GitHub-style API base for pull requests
    #[arg(long, default_value = "https://api.github.com")]
    pub github_api: String,
    /// Models the project setting may select (repeatable; empty = all)
    #[arg(long = "allow-model")]
    pub allowed_models: Vec<String>,
    /// Model for small-scope tickets
    #[arg(long)]
    pub model_small: Option<String>,
    /// Model for medium-scope tickets
    #[arg(long)]
    pub model_medium: Option<String>,
    /// Model for large-scope tickets
    #[arg(long)]
    pub model_large: Option<String>,
}

pub async fn run_worker(args: WorkerArgs, agent_key: String) -> Result<()> {
    let llm_api_key =
        std::env::var("DROVER_LLM_API_KEY").context("DROVER_LLM_API_KEY must be set")?;
    let github_token = std::env::var("DROVER_GITHUB_TOKEN")
        .or_else(|_| std::env::var("DROVER_REPO_TOKEN"))
        .context("DROVER_GITHUB_TOKEN or DROVER_REPO_TOKEN must be set")?;
    let repo_token = std::env::var("DROVER_REPO_TOKEN").ok();

    let agent_id = args
        .agent_id
        .unwrap_or_else(|| format!("worker-{:08x}", rand::random::<u32>()));
    let workspace_root = args
        .workspace_root
        .unwrap_or_else(|| std::env::temp_dir().join("drover-workspaces"));

    let mut scope_models = ScopeModelMap::default();
    if let Some(model) = args.model_small {
        scope_models.small = model;
    }
    if let Some(model) = args.model_medium {
        scope_models.medium = model;
    }
    if let Some(model) = args.model_large {
        scope_models.large = model;
    }

    let config = WorkerConfig {
        orchestrator_url: args.orchestrator_url,
        agent_key,
        agent_id,
        project: args.project,
        epic_filter: args.epic,
        poll_interval: Duration::from_secs(args.poll_interval),
        max_internal_attempts: args.max_internal_attempts.max(1),
        heartbeat_period: Duration::from_secs(args.heartbeat_period),
        validation_timeout: Duration::from_secs(args.validation_timeout),
        ticket_timeout: Duration::from_secs(args.ticket_timeout),
        max_prompt_lines: args.max_prompt_lines,
        workspace_root,
        repo_token,
        allowed_models: args.allowed_models,
        scope_models,
        llm: LlmConfig {
            api_url: args.llm_url,
            api_key: llm_api_key,
            request_timeout: Duration::from_secs(args.generation_timeout),
            max_tokens: args.llm_max_tokens,
        },
        pr: PrConfig {
            api_base: args.github_api,
            token: github_token,
        },
    };

    let worker = Worker::new(config);

    // Graceful shutdown: Ctrl+C cancels the token; the worker finishes
    // its in-flight ticket before exiting.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, finishing current ticket");
            signal_cancel.cancel();
        }
    });

    worker.run(cancel).await
}
