//! Database query functions for the `tickets` and `ticket_dependencies`
//! tables.
//!
//! Every mutation that changes a ticket's status runs a compare-and-swap
//! UPDATE and appends its `status_change` event inside the same
//! transaction, so the event log never disagrees with the row.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{EventCategory, Ticket, TicketStatus};
use crate::queries::events::append_event_tx;

/// Parameters for inserting a new ticket row.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub id: String,
    pub project: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: serde_json::Value,
    pub estimated_scope: String,
    pub repo_url: String,
    pub branch_name: String,
    pub epic: Option<String>,
    pub model_override: Option<String>,
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub max_attempts: i32,
}

/// Insert a new ticket row in `draft` status.
///
/// Fails if the id collides with an existing ticket (unique primary key).
pub async fn insert_ticket(pool: &PgPool, new: &NewTicket) -> Result<Ticket> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (id, project, title, description, acceptance_criteria, \
                              estimated_scope, repo_url, branch_name, epic, model_override, \
                              files_to_create, files_to_modify, max_attempts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.project)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.acceptance_criteria)
    .bind(&new.estimated_scope)
    .bind(&new.repo_url)
    .bind(&new.branch_name)
    .bind(&new.epic)
    .bind(&new.model_override)
    .bind(&new.files_to_create)
    .bind(&new.files_to_modify)
    .bind(new.max_attempts)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert ticket {}", new.id))?;

    Ok(ticket)
}

/// Fetch a single ticket by id.
pub async fn get_ticket(pool: &PgPool, id: &str) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// Selection filter for [`list_tickets`].
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub project: Option<String>,
    pub status: Option<TicketStatus>,
    pub epic: Option<String>,
    pub assignee_id: Option<String>,
}

/// List tickets matching the filter, ordered by creation time then id.
pub async fn list_tickets(pool: &PgPool, filter: &TicketFilter) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets \
         WHERE ($1::text IS NULL OR project = $1) \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3::text IS NULL OR epic = $3) \
           AND ($4::text IS NULL OR assignee_id = $4) \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(&filter.project)
    .bind(filter.status.map(|s| s.to_string()))
    .bind(&filter.epic)
    .bind(&filter.assignee_id)
    .fetch_all(pool)
    .await
    .context("failed to list tickets")?;

    Ok(tickets)
}

// -----------------------------------------------------------------------
// Dependency DAG
// -----------------------------------------------------------------------

/// Insert a dependency edge: `ticket_id` depends on `depends_on`.
///
/// Rejected when the edge would create a cycle, when either endpoint is
/// unknown (foreign key), or when the edge is a self-loop.
pub async fn insert_dependency(pool: &PgPool, ticket_id: &str, depends_on: &str) -> Result<()> {
    if would_create_cycle(pool, ticket_id, depends_on).await? {
        anyhow::bail!(
            "dependency {} -> {} would create a cycle",
            ticket_id,
            depends_on
        );
    }

    sqlx::query(
        "INSERT INTO ticket_dependencies (ticket_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(ticket_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert dependency {ticket_id} -> {depends_on}"))?;

    Ok(())
}

/// Ids of all tickets that `ticket_id` depends on.
pub async fn dependencies_of(pool: &PgPool, ticket_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT depends_on FROM ticket_dependencies WHERE ticket_id = $1 ORDER BY depends_on",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to get ticket dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Whether adding the edge `ticket_id -> depends_on` would close a cycle,
/// i.e. whether `ticket_id` is already reachable from `depends_on` through
/// existing `depends_on` edges.
async fn would_create_cycle(pool: &PgPool, ticket_id: &str, depends_on: &str) -> Result<bool> {
    if ticket_id == depends_on {
        return Ok(true);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(depends_on.to_owned());

    while let Some(current) = queue.pop_front() {
        if current == ticket_id {
            return Ok(true);
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        for dep in dependencies_of(pool, &current).await? {
            queue.push_back(dep);
        }
    }

    Ok(false)
}

// -----------------------------------------------------------------------
// Readiness
// -----------------------------------------------------------------------

/// Return the single best claim candidate for a project, or `None`.
///
/// A ticket is eligible when its status is `ready`, every dependency is
/// `done`, its attempt budget is not exhausted, and it is not in the
/// caller's exclusion set. Tie-break: FIFO by `created_at`, then id.
pub async fn next_ready_ticket(
    pool: &PgPool,
    project: &str,
    epic: Option<&str>,
    exclusions: &[String],
) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "SELECT t.* FROM tickets t \
         WHERE t.project = $1 \
           AND t.status = 'ready' \
           AND t.attempts < t.max_attempts \
           AND ($2::text IS NULL OR t.epic = $2) \
           AND NOT (t.id = ANY($3)) \
           AND NOT EXISTS ( \
               SELECT 1 FROM ticket_dependencies d \
               JOIN tickets dep ON dep.id = d.depends_on \
               WHERE d.ticket_id = t.id AND dep.status != 'done' \
           ) \
         ORDER BY t.created_at ASC, t.id ASC \
         LIMIT 1",
    )
    .bind(project)
    .bind(epic)
    .bind(exclusions)
    .fetch_optional(pool)
    .await
    .context("failed to query next ready ticket")?;

    Ok(ticket)
}

// -----------------------------------------------------------------------
// Claim / heartbeat / completion CAS operations
// -----------------------------------------------------------------------

/// Atomically claim a `ready` ticket for a worker.
///
/// The UPDATE's WHERE clause includes `status = 'ready'`, so exactly one
/// caller can win a race for the same ticket. The attempt counter is
/// incremented here: `attempts` counts executions consumed. Returns the
/// number of rows affected (0 means another worker won).
pub async fn claim_ready_ticket(
    pool: &PgPool,
    id: &str,
    worker_id: &str,
    claim_token: &str,
    ttl_secs: i32,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = sqlx::query(
        "UPDATE tickets \
         SET status = 'assigned', \
             claim_token = $1, \
             claim_expires_at = NOW() + make_interval(secs => $2), \
             assignee_id = $3, \
             last_heartbeat = NOW(), \
             attempts = attempts + 1 \
         WHERE id = $4 AND status = 'ready'",
    )
    .bind(claim_token)
    .bind(f64::from(ttl_secs))
    .bind(worker_id)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to claim ticket")?
    .rows_affected();

    if rows == 1 {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            worker_id,
            "ready -> assigned",
            serde_json::json!({"from": "ready", "to": "assigned"}),
        )
        .await?;
        append_event_tx(
            &mut tx,
            id,
            EventCategory::TicketClaimed,
            worker_id,
            &format!("claimed by {worker_id}"),
            serde_json::json!({"worker_id": worker_id}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit claim")?;
    Ok(rows)
}

/// Advance a claimed ticket between active statuses, guarded by the claim
/// token. Used for `assigned -> in_progress` and `in_progress -> verifying`.
pub async fn advance_claimed_status(
    pool: &PgPool,
    id: &str,
    claim_token: &str,
    from: TicketStatus,
    to: TicketStatus,
    actor_id: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = sqlx::query(
        "UPDATE tickets SET status = $1 \
         WHERE id = $2 AND status = $3 AND claim_token = $4",
    )
    .bind(to.to_string())
    .bind(id)
    .bind(from.to_string())
    .bind(claim_token)
    .execute(&mut *tx)
    .await
    .context("failed to advance claimed ticket status")?
    .rows_affected();

    if rows == 1 {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            &format!("{from} -> {to}"),
            serde_json::json!({"from": from.to_string(), "to": to.to_string()}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit status advance")?;
    Ok(rows)
}

/// Bump the heartbeat and extend the claim expiry, guarded by the claim
/// token. Returns 0 when the claim is stale (token mismatch, expired and
/// reclaimed, or ticket no longer active).
pub async fn heartbeat_ticket(
    pool: &PgPool,
    id: &str,
    claim_token: &str,
    ttl_secs: i32,
    actor_id: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = sqlx::query(
        "UPDATE tickets \
         SET last_heartbeat = NOW(), \
             claim_expires_at = NOW() + make_interval(secs => $1) \
         WHERE id = $2 AND claim_token = $3 \
           AND status IN ('assigned', 'in_progress', 'verifying')",
    )
    .bind(f64::from(ttl_secs))
    .bind(id)
    .bind(claim_token)
    .execute(&mut *tx)
    .await
    .context("failed to record heartbeat")?
    .rows_affected();

    if rows == 1 {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::Heartbeat,
            actor_id,
            "heartbeat",
            serde_json::json!({}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit heartbeat")?;
    Ok(rows)
}

/// Record a successful completion: `verifying -> in_review`, claim fields
/// cleared, PR/commit/criteria recorded, `completed` and `pr_created`
/// events appended. Guarded by the claim token.
#[allow(clippy::too_many_arguments)]
pub async fn complete_success(
    pool: &PgPool,
    id: &str,
    claim_token: &str,
    actor_id: &str,
    pr_url: &str,
    branch_name: &str,
    commit_sha: &str,
    criteria_status: &serde_json::Value,
    files_changed: &[String],
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = sqlx::query(
        "UPDATE tickets \
         SET status = 'in_review', \
             claim_token = NULL, \
             claim_expires_at = NULL, \
             last_error_class = NULL, \
             pr_url = $1, \
             commit_sha = $2, \
             criteria_status = $3 \
         WHERE id = $4 AND status = 'verifying' AND claim_token = $5",
    )
    .bind(pr_url)
    .bind(commit_sha)
    .bind(criteria_status)
    .bind(id)
    .bind(claim_token)
    .execute(&mut *tx)
    .await
    .context("failed to complete ticket")?
    .rows_affected();

    if rows == 1 {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            "verifying -> in_review",
            serde_json::json!({"from": "verifying", "to": "in_review"}),
        )
        .await?;
        append_event_tx(
            &mut tx,
            id,
            EventCategory::PrCreated,
            actor_id,
            &format!("pull request opened: {pr_url}"),
            serde_json::json!({"pr_url": pr_url, "branch": branch_name}),
        )
        .await?;
        append_event_tx(
            &mut tx,
            id,
            EventCategory::Completed,
            actor_id,
            "worker reported success",
            serde_json::json!({
                "commit_sha": commit_sha,
                "files_changed": files_changed,
            }),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit completion")?;
    Ok(rows)
}

/// Record a failed completion: the ticket leaves its active status for
/// `to` (either `ready` or `needs_review`), claim fields cleared, the
/// error class recorded, and a `failure` event appended. Guarded by the
/// claim token; accepted from any active status.
pub async fn complete_failure(
    pool: &PgPool,
    id: &str,
    claim_token: &str,
    actor_id: &str,
    to: TicketStatus,
    error_class: &str,
    message: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    // RETURNING the prior status so the status_change event is accurate.
    let prior: Option<(String,)> = sqlx::query_as(
        "UPDATE tickets \
         SET status = $1, \
             claim_token = NULL, \
             claim_expires_at = NULL, \
             assignee_id = NULL, \
             last_error_class = $2 \
         WHERE id = $3 AND claim_token = $4 \
           AND status IN ('assigned', 'in_progress', 'verifying') \
         RETURNING (SELECT status FROM tickets WHERE id = $3)",
    )
    .bind(to.to_string())
    .bind(error_class)
    .bind(id)
    .bind(claim_token)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to record failed completion")?;

    let rows = if let Some((from,)) = prior {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            &format!("{from} -> {to}"),
            serde_json::json!({"from": from, "to": to.to_string()}),
        )
        .await?;
        append_event_tx(
            &mut tx,
            id,
            EventCategory::Failure,
            actor_id,
            message,
            serde_json::json!({"error_class": error_class}),
        )
        .await?;
        1
    } else {
        0
    };

    tx.commit().await.context("failed to commit failed completion")?;
    Ok(rows)
}

// -----------------------------------------------------------------------
// Reclaim sweep
// -----------------------------------------------------------------------

/// Return every ticket whose claim expired to `ready`, clearing the claim
/// fields and appending `failure{heartbeat_lost}` events.
///
/// Idempotent: reclaimed tickets no longer match the WHERE clause, so a
/// second pass with no intervening heartbeat is a no-op.
pub async fn reclaim_expired(pool: &PgPool, actor_id: &str) -> Result<Vec<Ticket>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let reclaimed = sqlx::query_as::<_, Ticket>(
        "UPDATE tickets \
         SET status = 'ready', \
             claim_token = NULL, \
             claim_expires_at = NULL, \
             assignee_id = NULL, \
             last_error_class = 'heartbeat_lost' \
         WHERE status IN ('assigned', 'in_progress', 'verifying') \
           AND claim_expires_at < NOW() \
         RETURNING *",
    )
    .fetch_all(&mut *tx)
    .await
    .context("failed to reclaim expired claims")?;

    for ticket in &reclaimed {
        append_event_tx(
            &mut tx,
            &ticket.id,
            EventCategory::StatusChange,
            actor_id,
            "claim expired, returned to ready",
            serde_json::json!({"to": "ready"}),
        )
        .await?;
        append_event_tx(
            &mut tx,
            &ticket.id,
            EventCategory::Failure,
            actor_id,
            "heartbeat lost, claim reclaimed",
            serde_json::json!({"reason": "heartbeat_lost"}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit reclaim sweep")?;
    Ok(reclaimed)
}

/// Move `ready` tickets that have exhausted their attempt budget to
/// `quarantined`. Run after the reclaim sweep.
pub async fn quarantine_exhausted(pool: &PgPool, actor_id: &str) -> Result<Vec<Ticket>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let quarantined = sqlx::query_as::<_, Ticket>(
        "UPDATE tickets SET status = 'quarantined' \
         WHERE status = 'ready' AND attempts >= max_attempts \
         RETURNING *",
    )
    .fetch_all(&mut *tx)
    .await
    .context("failed to quarantine exhausted tickets")?;

    for ticket in &quarantined {
        append_event_tx(
            &mut tx,
            &ticket.id,
            EventCategory::StatusChange,
            actor_id,
            "attempt budget exhausted, quarantined",
            serde_json::json!({"from": "ready", "to": "quarantined", "attempts": ticket.attempts}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit quarantine pass")?;
    Ok(quarantined)
}

// -----------------------------------------------------------------------
// Operator / reviewer transitions
// -----------------------------------------------------------------------

/// Plain CAS transition between two statuses, with its `status_change`
/// event. Callers validate that the edge is legal before calling.
pub async fn transition_ticket(
    pool: &PgPool,
    id: &str,
    from: TicketStatus,
    to: TicketStatus,
    actor_id: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let rows = transition_ticket_tx(&mut tx, id, from, to, actor_id).await?;
    tx.commit().await.context("failed to commit transition")?;
    Ok(rows)
}

async fn transition_ticket_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &str,
    from: TicketStatus,
    to: TicketStatus,
    actor_id: &str,
) -> Result<u64> {
    let rows = sqlx::query("UPDATE tickets SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to.to_string())
        .bind(id)
        .bind(from.to_string())
        .execute(&mut **tx)
        .await
        .context("failed to transition ticket status")?
        .rows_affected();

    if rows == 1 {
        append_event_tx(
            tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            &format!("{from} -> {to}"),
            serde_json::json!({"from": from.to_string(), "to": to.to_string()}),
        )
        .await?;
    }

    Ok(rows)
}

/// Cancel a ticket from any non-terminal status in one transition,
/// clearing any live claim. A worker holding the claim observes
/// `StaleClaim` on its next heartbeat or completion call.
pub async fn cancel_ticket(pool: &PgPool, id: &str, actor_id: &str) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let prior: Option<(String,)> = sqlx::query_as(
        "UPDATE tickets \
         SET status = 'cancelled', \
             claim_token = NULL, \
             claim_expires_at = NULL, \
             assignee_id = NULL \
         WHERE id = $1 AND status NOT IN ('done', 'cancelled') \
         RETURNING (SELECT status FROM tickets WHERE id = $1)",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to cancel ticket")?;

    let rows = if let Some((from,)) = prior {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            &format!("{from} -> cancelled"),
            serde_json::json!({"from": from, "to": "cancelled"}),
        )
        .await?;
        1
    } else {
        0
    };

    tx.commit().await.context("failed to commit cancellation")?;
    Ok(rows)
}

/// Reviewer requested changes: `in_review -> ready` with the attempt
/// counter reset and the reviewer's notes attached as sentinel feedback
/// for the next generation prompt.
pub async fn reviewer_reject(
    pool: &PgPool,
    id: &str,
    feedback: &serde_json::Value,
    actor_id: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = sqlx::query(
        "UPDATE tickets \
         SET status = 'ready', attempts = 0, review_feedback = $1 \
         WHERE id = $2 AND status = 'in_review'",
    )
    .bind(feedback)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to reject ticket in review")?
    .rows_affected();

    if rows == 1 {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            "in_review -> ready (changes requested)",
            serde_json::json!({"from": "in_review", "to": "ready"}),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit review rejection")?;
    Ok(rows)
}

/// Operator override: reset a `needs_review` or `quarantined` ticket back
/// to `ready` with a fresh attempt budget.
pub async fn operator_reset(pool: &PgPool, id: &str, actor_id: &str) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let prior: Option<(String,)> = sqlx::query_as(
        "UPDATE tickets \
         SET status = 'ready', attempts = 0, last_error_class = NULL \
         WHERE id = $1 AND status IN ('needs_review', 'quarantined') \
         RETURNING (SELECT status FROM tickets WHERE id = $1)",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to reset ticket")?;

    let rows = if let Some((from,)) = prior {
        append_event_tx(
            &mut tx,
            id,
            EventCategory::StatusChange,
            actor_id,
            &format!("{from} -> ready (operator reset)"),
            serde_json::json!({"from": from, "to": "ready"}),
        )
        .await?;
        1
    } else {
        0
    };

    tx.commit().await.context("failed to commit operator reset")?;
    Ok(rows)
}
