mod config;
mod log_cmd;
mod serve_cmd;
mod ticket_cmds;
mod worker_cmd;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use drover_core::claim;
use drover_core::state::dispatch;
use drover_db::models::ValidationLevel;
use drover_db::pool;
use drover_db::queries::settings as settings_db;

use config::DroverConfig;

#[derive(Parser)]
#[command(name = "drover", about = "Autonomous coding-agent orchestrator")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the drover database (requires config file or env vars)
    DbInit,
    /// Run the worker-facing orchestrator API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 7878)]
        port: u16,
        /// Seconds between reclaim sweep passes (claim TTL / 4)
        #[arg(long, default_value_t = 75)]
        sweep_interval: u64,
    },
    /// Run one worker process
    Worker(worker_cmd::WorkerArgs),
    /// Ticket management
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },
    /// Reviewer verdicts on tickets in review
    Review {
        #[command(subcommand)]
        command: ReviewCommands,
    },
    /// Per-project settings
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Show the activity log for a ticket
    Log {
        /// Ticket ID
        ticket_id: String,
    },
    /// Run one reclaim sweep pass by hand
    Sweep,
}

#[derive(Subcommand)]
pub enum TicketCommands {
    /// Import tickets from a TOML file
    Create {
        /// Path to the ticket TOML file
        file: String,
    },
    /// Show one ticket
    Show {
        /// Ticket ID
        ticket_id: String,
    },
    /// List tickets
    List {
        /// Filter by project
        #[arg(long)]
        project: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Approve a draft ticket (draft -> ready)
    Approve {
        /// Ticket ID
        ticket_id: String,
    },
    /// Cancel a ticket from any non-terminal state
    Cancel {
        /// Ticket ID
        ticket_id: String,
    },
    /// Return a needs_review or quarantined ticket to ready
    Retry {
        /// Ticket ID
        ticket_id: String,
    },
    /// Record a dependency edge between two tickets
    DepAdd {
        /// Dependent ticket ID
        ticket_id: String,
        /// Prerequisite ticket ID
        depends_on: String,
    },
}

#[derive(Subcommand)]
pub enum ReviewCommands {
    /// Approve the pull request (in_review -> done)
    Approve {
        /// Ticket ID
        ticket_id: String,
    },
    /// Request changes (in_review -> ready, attempts reset)
    Reject {
        /// Ticket ID
        ticket_id: String,
        /// Feedback for the next generation attempt
        #[arg(long)]
        notes: String,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Show effective settings for a project
    Show {
        /// Project name
        project: String,
    },
    /// Set per-project overrides
    Set {
        /// Project name
        project: String,
        /// Preferred worker model
        #[arg(long)]
        model: Option<String>,
        /// Validation level: minimal, standard, strict
        #[arg(long)]
        validation_level: Option<String>,
        /// Retry budget before escalation
        #[arg(long)]
        max_attempts: Option<i32>,
        /// Claim TTL in seconds
        #[arg(long)]
        claim_ttl: Option<i32>,
        /// Base branch pull requests target
        #[arg(long)]
        base_branch: Option<String>,
    },
}

/// Execute the `drover init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let agent_key = config::generate_agent_key();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            agent_key: agent_key.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.agent_key = {}...{}", &agent_key[..8], &agent_key[56..]);
    println!();
    println!("Next: run `drover db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `drover db-init` command: create database and migrate.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(cli_db_url)?;

    println!("Initializing drover database...");

    pool::ensure_database_exists(&resolved.database_url).await?;
    let db_pool = pool::connect(&resolved.database_url).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("drover db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            sweep_interval,
        } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let result = serve_cmd::run_serve(
                db_pool.clone(),
                resolved.agent_key,
                &bind,
                port,
                Duration::from_secs(sweep_interval),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker(args) => {
            // The worker only needs the agent key; the DB stays behind
            // the orchestrator API.
            let agent_key = std::env::var("DROVER_AGENT_KEY")
                .ok()
                .or_else(|| config::load_config().ok().map(|c| c.auth.agent_key))
                .context("agent key not found; set DROVER_AGENT_KEY or run `drover init`")?;
            worker_cmd::run_worker(args, agent_key).await?;
        }
        Commands::Ticket { command } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let result = ticket_cmds::run_ticket_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Review { command } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let result = match command {
                ReviewCommands::Approve { ticket_id } => {
                    dispatch::reviewer_approve(&db_pool, &ticket_id, "reviewer")
                        .await
                        .map(|()| println!("Ticket {ticket_id} is done."))
                }
                ReviewCommands::Reject { ticket_id, notes } => {
                    dispatch::reviewer_reject(&db_pool, &ticket_id, &notes, "reviewer")
                        .await
                        .map(|()| println!("Ticket {ticket_id} returned to ready with feedback."))
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Project { command } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let result = run_project_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Log { ticket_id } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let result = log_cmd::run_log(&db_pool, &ticket_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Sweep => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.database_url).await?;
            let report = claim::run_reclaim_sweep(&db_pool).await;
            db_pool.close().await;
            let report = report?;
            println!(
                "Sweep finished: {} reclaimed, {} quarantined.",
                report.reclaimed.len(),
                report.quarantined.len()
            );
            for id in &report.reclaimed {
                println!("  reclaimed: {id}");
            }
            for id in &report.quarantined {
                println!("  quarantined: {id}");
            }
        }
    }

    Ok(())
}

async fn run_project_command(
    command: ProjectCommands,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    match command {
        ProjectCommands::Show { project } => {
            let settings = settings_db::get_settings(pool, &project).await?;
            println!("Settings for {project}:");
            println!(
                "  worker_model:     {}",
                settings.worker_model.as_deref().unwrap_or("(scope table)")
            );
            println!("  validation_level: {}", settings.validation_level);
            println!("  max_attempts:     {}", settings.max_attempts);
            println!("  claim_ttl_secs:   {}", settings.claim_ttl_secs);
            println!("  base_branch:      {}", settings.base_branch);
        }
        ProjectCommands::Set {
            project,
            model,
            validation_level,
            max_attempts,
            claim_ttl,
            base_branch,
        } => {
            let mut settings = settings_db::get_settings(pool, &project).await?;
            if let Some(model) = model {
                settings.worker_model = Some(model);
            }
            if let Some(level) = validation_level {
                settings.validation_level = level
                    .parse::<ValidationLevel>()
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
            }
            if let Some(max_attempts) = max_attempts {
                settings.max_attempts = max_attempts;
            }
            if let Some(claim_ttl) = claim_ttl {
                settings.claim_ttl_secs = claim_ttl;
            }
            if let Some(base_branch) = base_branch {
                settings.base_branch = base_branch;
            }
            settings_db::upsert_settings(pool, &settings).await?;
            println!("Settings updated for {project}.");
        }
    }
    Ok(())
}

#[cfg(test)]
pub mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
