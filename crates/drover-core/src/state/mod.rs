//! Ticket state machine transitions.
//!
//! Validates and executes state transitions for tickets, enforcing the
//! allowed transition graph, optimistic locking, and the rule that every
//! status change appends exactly one `status_change` event in the same
//! atomic unit as the row update.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use drover_db::models::TicketStatus;
use drover_db::queries::tickets as db;

/// The ticket state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// draft       -> ready         (external approval, well-formed ticket)
/// ready       -> assigned      (atomic claim)
/// assigned    -> in_progress   (first heartbeat / worker start)
/// in_progress -> verifying     (candidate files produced)
/// verifying   -> in_progress   (validation failed, retries remain)
/// verifying   -> in_review     (PR opened, success reported)
/// assigned/in_progress/verifying -> ready   (claim expired or retryable failure)
/// assigned/in_progress/verifying -> needs_review (non-retryable failure)
/// ready       -> quarantined   (attempt budget exhausted)
/// in_review   -> done          (reviewer approves)
/// in_review   -> ready         (reviewer requests changes; attempts reset)
/// needs_review/quarantined -> ready (operator override)
/// any non-terminal -> cancelled
/// ```
pub struct TicketStateMachine;

impl TicketStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TicketStatus, to: TicketStatus) -> bool {
        use TicketStatus::*;
        if to == Cancelled {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Draft, Ready)
                | (Ready, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Verifying)
                | (Verifying, InProgress)
                | (Verifying, InReview)
                | (Assigned, Ready)
                | (InProgress, Ready)
                | (Verifying, Ready)
                | (Assigned, NeedsReview)
                | (InProgress, NeedsReview)
                | (Verifying, NeedsReview)
                | (Ready, Quarantined)
                | (InReview, Done)
                | (InReview, Ready)
                | (NeedsReview, Ready)
                | (Quarantined, Ready)
        )
    }

    /// Execute a plain state transition with optimistic locking.
    ///
    /// Transitions that carry extra field changes (claims, completions,
    /// cancellation, review verdicts) go through their dedicated query
    /// operations instead; this path covers the approval and reviewer
    /// edges that change only the status.
    ///
    /// Returns an error if:
    /// - The transition is not a valid edge.
    /// - The current status in the database does not match `from`
    ///   (optimistic lock failure).
    /// - The ticket does not exist.
    pub async fn transition(
        pool: &PgPool,
        ticket_id: &str,
        from: TicketStatus,
        to: TicketStatus,
        actor_id: &str,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for ticket {ticket_id}");
        }

        let rows = db::transition_ticket(pool, ticket_id, from, to, actor_id)
            .await
            .with_context(|| {
                format!("failed to transition ticket {ticket_id} from {from} to {to}")
            })?;

        if rows == 0 {
            // Either the ticket does not exist or the status did not match.
            let ticket = db::get_ticket(pool, ticket_id).await?;
            match ticket {
                None => bail!("ticket {ticket_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: ticket {ticket_id} has status {}, expected {from}",
                    t.status
                ),
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
