//! Claim / heartbeat / completion protocol between the orchestrator and
//! its workers.
//!
//! A claim is the exclusive assignment of a ticket to one worker, carried
//! by a random 128-bit token and a TTL. Claims are won through a
//! compare-and-swap on `(id, status = ready)`; losers retry against the
//! next candidate with the lost id excluded, bounded by
//! [`CLAIM_RETRY_LIMIT`]. Liveness is tracked by heartbeats; the reclaim
//! sweep returns expired claims to the queue without worker cooperation.

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use drover_db::models::{ProjectSettings, Ticket, TicketStatus};
use drover_db::queries::settings as settings_db;
use drover_db::queries::tickets as ticket_db;

/// How many times a claim attempt retries after losing a CAS race before
/// reporting "no work".
pub const CLAIM_RETRY_LIMIT: usize = 8;

/// Actor id recorded on events written by the reclaim sweep.
pub const SWEEP_ACTOR: &str = "orchestrator";

/// Worker failure classes reported through the completion protocol.
pub mod error_class {
    pub const API_ERROR: &str = "api_error";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const BLOCKED: &str = "blocked";
    pub const VALIDATION_EXHAUSTED: &str = "validation_exhausted";
    pub const PATCH_EXHAUSTED: &str = "patch_exhausted";
    pub const GIT_ERROR: &str = "git_error";
    pub const EMPTY_COMMIT: &str = "empty_commit";
    pub const HEARTBEAT_LOST: &str = "heartbeat_lost";

    /// Classes that never re-enter the retry queue regardless of the
    /// worker's `should_retry` hint.
    pub fn is_non_retryable(class: &str) -> bool {
        matches!(class, BLOCKED | EMPTY_COMMIT)
    }
}

/// Errors surfaced by the claim protocol.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// The claim token no longer matches the ticket (expired and
    /// reclaimed, cancelled, or completed by someone else). The worker
    /// must abort its in-memory work immediately.
    #[error("stale claim: token no longer holds the ticket")]
    StaleClaim,

    /// The ticket's status changed underneath a compare-and-swap.
    #[error("stale state: ticket status changed concurrently")]
    StaleState,

    /// Storage-level failure; details stay server-side, workers see a
    /// stable code.
    #[error("store error")]
    Store(#[from] anyhow::Error),
}

/// A won claim: the ticket and the project settings the worker executes
/// under.
#[derive(Debug, Clone)]
pub struct ClaimGrant {
    pub ticket: Ticket,
    pub settings: ProjectSettings,
}

/// Outcome a worker reports through `complete`.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Success {
        pr_url: String,
        branch_name: String,
        commit_sha: String,
        criteria_status: serde_json::Value,
        files_changed: Vec<String>,
    },
    Failure {
        error_class: String,
        message: String,
        should_retry: bool,
    },
}

/// Generate a fresh 128-bit claim token, hex-encoded.
///
/// The token is never logged; it is the worker's proof of ownership for
/// every subsequent protocol call.
pub fn new_claim_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Attempt to claim the next ready ticket in a project for a worker.
///
/// Returns `Ok(None)` when no ticket is eligible, without mutating any
/// state. On a lost CAS race the loser excludes the contested id and
/// retries, up to [`CLAIM_RETRY_LIMIT`] times.
pub async fn claim(
    pool: &PgPool,
    worker_id: &str,
    project: &str,
    epic: Option<&str>,
) -> Result<Option<ClaimGrant>, ClaimError> {
    let settings = settings_db::get_settings(pool, project).await?;
    let mut exclusions: Vec<String> = Vec::new();

    for _ in 0..CLAIM_RETRY_LIMIT {
        let Some(candidate) =
            ticket_db::next_ready_ticket(pool, project, epic, &exclusions).await?
        else {
            return Ok(None);
        };

        let token = new_claim_token();
        let rows = ticket_db::claim_ready_ticket(
            pool,
            &candidate.id,
            worker_id,
            &token,
            settings.claim_ttl_secs,
        )
        .await?;

        if rows == 1 {
            let ticket = ticket_db::get_ticket(pool, &candidate.id)
                .await?
                .context("claimed ticket vanished")?;
            info!(ticket_id = %ticket.id, worker_id, "ticket claimed");
            return Ok(Some(ClaimGrant { ticket, settings }));
        }

        // Another worker won this id; skip it and look again.
        warn!(ticket_id = %candidate.id, worker_id, "lost claim race, retrying");
        exclusions.push(candidate.id);
    }

    Ok(None)
}

/// Record a worker heartbeat, extending the claim expiry.
///
/// Fails with [`ClaimError::StaleClaim`] when the token no longer holds
/// the ticket; the worker must abort without committing or pushing.
pub async fn heartbeat(
    pool: &PgPool,
    ticket_id: &str,
    worker_id: &str,
    claim_token: &str,
) -> Result<(), ClaimError> {
    let settings = settings_for_ticket(pool, ticket_id).await?;
    let rows = ticket_db::heartbeat_ticket(
        pool,
        ticket_id,
        claim_token,
        settings.claim_ttl_secs,
        worker_id,
    )
    .await?;

    if rows == 0 {
        return Err(ClaimError::StaleClaim);
    }
    Ok(())
}

/// Advance a claimed ticket to `to` on the worker's behalf.
///
/// Valid targets form the worker-side progression `assigned ->
/// in_progress -> verifying`, plus the retry re-entry `verifying ->
/// in_progress`. Any other request, or a token mismatch, is rejected.
pub async fn advance(
    pool: &PgPool,
    ticket_id: &str,
    worker_id: &str,
    claim_token: &str,
    to: TicketStatus,
) -> Result<(), ClaimError> {
    let ticket = ticket_db::get_ticket(pool, ticket_id)
        .await?
        .ok_or(ClaimError::StaleClaim)?;

    if ticket.claim_token.as_deref() != Some(claim_token) {
        return Err(ClaimError::StaleClaim);
    }

    let from = ticket.status;
    let valid = matches!(
        (from, to),
        (TicketStatus::Assigned, TicketStatus::InProgress)
            | (TicketStatus::InProgress, TicketStatus::Verifying)
            | (TicketStatus::Verifying, TicketStatus::InProgress)
    );
    if !valid {
        return Err(ClaimError::StaleState);
    }

    let rows =
        ticket_db::advance_claimed_status(pool, ticket_id, claim_token, from, to, worker_id)
            .await?;
    if rows == 0 {
        return Err(ClaimError::StaleClaim);
    }
    Ok(())
}

/// Record a worker's completion report.
///
/// Success requires the ticket to be in `verifying` and transitions it to
/// `in_review`. Failure routes by the attempts cap: non-retryable classes
/// and exhausted budgets escalate to `needs_review`, everything else
/// returns to `ready` for another worker. All paths demand the original
/// claim token, so a zombie worker cannot corrupt state.
///
/// Returns the status the ticket landed in.
pub async fn complete(
    pool: &PgPool,
    ticket_id: &str,
    worker_id: &str,
    claim_token: &str,
    outcome: CompletionOutcome,
) -> Result<TicketStatus, ClaimError> {
    match outcome {
        CompletionOutcome::Success {
            pr_url,
            branch_name,
            commit_sha,
            criteria_status,
            files_changed,
        } => {
            let rows = ticket_db::complete_success(
                pool,
                ticket_id,
                claim_token,
                worker_id,
                &pr_url,
                &branch_name,
                &commit_sha,
                &criteria_status,
                &files_changed,
            )
            .await?;
            if rows == 0 {
                return Err(ClaimError::StaleClaim);
            }
            info!(ticket_id, worker_id, "ticket completed, awaiting review");
            Ok(TicketStatus::InReview)
        }
        CompletionOutcome::Failure {
            error_class,
            message,
            should_retry,
        } => {
            let ticket = ticket_db::get_ticket(pool, ticket_id)
                .await?
                .ok_or(ClaimError::StaleClaim)?;
            if ticket.claim_token.as_deref() != Some(claim_token) {
                return Err(ClaimError::StaleClaim);
            }

            let exhausted = ticket.attempts >= ticket.max_attempts;
            let non_retryable =
                error_class::is_non_retryable(&error_class) || !should_retry;
            let to = if exhausted || non_retryable {
                TicketStatus::NeedsReview
            } else {
                TicketStatus::Ready
            };

            let rows = ticket_db::complete_failure(
                pool,
                ticket_id,
                claim_token,
                worker_id,
                to,
                &error_class,
                &message,
            )
            .await?;
            if rows == 0 {
                return Err(ClaimError::StaleClaim);
            }
            warn!(ticket_id, worker_id, error_class = %error_class, "ticket failed, routed to {to}");
            Ok(to)
        }
    }
}

/// Outcome of one reclaim sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub reclaimed: Vec<String>,
    pub quarantined: Vec<String>,
}

/// Run one reclaim sweep pass: return expired claims to `ready`, then
/// quarantine `ready` tickets whose attempt budget is gone.
///
/// Idempotent: a second pass with no intervening heartbeat changes
/// nothing. Callers schedule this no faster than once per TTL/4.
pub async fn run_reclaim_sweep(pool: &PgPool) -> Result<SweepReport, ClaimError> {
    let reclaimed = ticket_db::reclaim_expired(pool, SWEEP_ACTOR).await?;
    for ticket in &reclaimed {
        warn!(ticket_id = %ticket.id, attempts = ticket.attempts, "reclaimed expired claim");
    }

    let quarantined = ticket_db::quarantine_exhausted(pool, SWEEP_ACTOR).await?;
    for ticket in &quarantined {
        warn!(ticket_id = %ticket.id, attempts = ticket.attempts, "quarantined exhausted ticket");
    }

    Ok(SweepReport {
        reclaimed: reclaimed.into_iter().map(|t| t.id).collect(),
        quarantined: quarantined.into_iter().map(|t| t.id).collect(),
    })
}

async fn settings_for_ticket(
    pool: &PgPool,
    ticket_id: &str,
) -> Result<ProjectSettings, ClaimError> {
    let ticket = ticket_db::get_ticket(pool, ticket_id)
        .await?
        .ok_or(ClaimError::StaleClaim)?;
    Ok(settings_db::get_settings(pool, &ticket.project).await?)
}
