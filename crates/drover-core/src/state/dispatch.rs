//! Convenience dispatch helpers that wrap [`super::TicketStateMachine`]
//! transitions and the dedicated query operations with semantic names.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use drover_db::models::TicketStatus;
use drover_db::queries::tickets as db;

use super::TicketStateMachine;

/// Promote a ticket from `draft` to `ready` after external approval.
///
/// A ticket must be well-formed to become claimable: a non-empty union of
/// `files_to_create` and `files_to_modify`, and a non-empty criteria list.
pub async fn approve_ticket(pool: &PgPool, ticket_id: &str, actor_id: &str) -> Result<()> {
    let ticket = db::get_ticket(pool, ticket_id)
        .await?
        .with_context(|| format!("ticket {ticket_id} not found"))?;

    if ticket.files_to_create.is_empty() && ticket.files_to_modify.is_empty() {
        bail!("cannot approve ticket {ticket_id}: no target files listed");
    }
    if ticket.acceptance_criteria.0.is_empty() {
        bail!("cannot approve ticket {ticket_id}: acceptance criteria list is empty");
    }

    TicketStateMachine::transition(pool, ticket_id, TicketStatus::Draft, TicketStatus::Ready, actor_id)
        .await
}

/// Cancel a ticket from any non-terminal state.
///
/// Clears any live claim; the worker holding it observes `StaleClaim` on
/// its next heartbeat or completion call.
pub async fn cancel_ticket(pool: &PgPool, ticket_id: &str, actor_id: &str) -> Result<()> {
    let rows = db::cancel_ticket(pool, ticket_id, actor_id).await?;
    if rows == 0 {
        let ticket = db::get_ticket(pool, ticket_id).await?;
        match ticket {
            None => bail!("ticket {ticket_id} not found"),
            Some(t) => bail!("cannot cancel ticket {ticket_id}: status is {}", t.status),
        }
    }
    Ok(())
}

/// Reviewer approved the pull request: `in_review -> done`.
pub async fn reviewer_approve(pool: &PgPool, ticket_id: &str, actor_id: &str) -> Result<()> {
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketStatus::InReview,
        TicketStatus::Done,
        actor_id,
    )
    .await
}

/// Reviewer requested changes: `in_review -> ready` with the attempt
/// budget reset and the notes attached as sentinel feedback.
pub async fn reviewer_reject(
    pool: &PgPool,
    ticket_id: &str,
    notes: &str,
    actor_id: &str,
) -> Result<()> {
    let feedback = serde_json::json!({"reviewer": actor_id, "notes": notes});
    let rows = db::reviewer_reject(pool, ticket_id, &feedback, actor_id).await?;
    if rows == 0 {
        let ticket = db::get_ticket(pool, ticket_id).await?;
        match ticket {
            None => bail!("ticket {ticket_id} not found"),
            Some(t) => bail!(
                "cannot reject ticket {ticket_id}: status is {}, expected in_review",
                t.status
            ),
        }
    }
    Ok(())
}

/// Operator override: return a `needs_review` or `quarantined` ticket to
/// `ready` with a fresh attempt budget.
pub async fn operator_retry(pool: &PgPool, ticket_id: &str, actor_id: &str) -> Result<()> {
    let rows = db::operator_reset(pool, ticket_id, actor_id).await?;
    if rows == 0 {
        let ticket = db::get_ticket(pool, ticket_id).await?;
        match ticket {
            None => bail!("ticket {ticket_id} not found"),
            Some(t) => bail!(
                "cannot retry ticket {ticket_id}: status is {}, expected needs_review or quarantined",
                t.status
            ),
        }
    }
    Ok(())
}
