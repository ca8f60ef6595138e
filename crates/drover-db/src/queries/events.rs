//! Database query functions for the append-only `ticket_events` table.
//!
//! Events are the only authoritative history; the activity log served to
//! subscribers is a projection over this table. Only the store appends.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{EventCategory, TicketEvent};

/// Append an event to a ticket's history.
pub async fn append_event(
    pool: &PgPool,
    ticket_id: &str,
    category: EventCategory,
    actor_id: &str,
    message: &str,
    metadata: Value,
) -> Result<TicketEvent> {
    let event = sqlx::query_as::<_, TicketEvent>(
        "INSERT INTO ticket_events (ticket_id, category, actor_id, message, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(category.to_string())
    .bind(actor_id)
    .bind(message)
    .bind(&metadata)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to append {category} event for ticket {ticket_id}"))?;

    Ok(event)
}

/// Append an event inside a caller-owned transaction. Used by the ticket
/// CAS operations so the event lands in the same atomic unit as the
/// status change.
pub async fn append_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    ticket_id: &str,
    category: EventCategory,
    actor_id: &str,
    message: &str,
    metadata: Value,
) -> Result<TicketEvent> {
    let event = sqlx::query_as::<_, TicketEvent>(
        "INSERT INTO ticket_events (ticket_id, category, actor_id, message, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(category.to_string())
    .bind(actor_id)
    .bind(message)
    .bind(&metadata)
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("failed to append {category} event for ticket {ticket_id}"))?;

    Ok(event)
}

/// All events for a ticket, in append order.
pub async fn list_events_for_ticket(pool: &PgPool, ticket_id: &str) -> Result<Vec<TicketEvent>> {
    let events = sqlx::query_as::<_, TicketEvent>(
        "SELECT * FROM ticket_events WHERE ticket_id = $1 ORDER BY id ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for ticket {ticket_id}"))?;

    Ok(events)
}

/// Events for a ticket with id strictly greater than `after_id`, in append
/// order. Drives the at-least-once subscription stream; subscribers
/// deduplicate by event id.
pub async fn list_events_after(
    pool: &PgPool,
    ticket_id: &str,
    after_id: i64,
) -> Result<Vec<TicketEvent>> {
    let events = sqlx::query_as::<_, TicketEvent>(
        "SELECT * FROM ticket_events WHERE ticket_id = $1 AND id > $2 ORDER BY id ASC",
    )
    .bind(ticket_id)
    .bind(after_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events after {after_id} for ticket {ticket_id}"))?;

    Ok(events)
}

/// Count events of one category for a ticket.
pub async fn count_events(
    pool: &PgPool,
    ticket_id: &str,
    category: EventCategory,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM ticket_events WHERE ticket_id = $1 AND category = $2",
    )
    .bind(ticket_id)
    .bind(category.to_string())
    .fetch_one(pool)
    .await
    .context("failed to count ticket events")?;

    Ok(row.0)
}
