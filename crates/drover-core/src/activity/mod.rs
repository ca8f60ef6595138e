//! Activity log: the per-ticket projection of the append-only event
//! stream, rendered for subscribers with display names and actors.
//!
//! Only the store appends events; this module only reads. Delivery to
//! subscribers is at-least-once (the polling stream may re-deliver after
//! a reconnect), so clients deduplicate by event id.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use sqlx::PgPool;

use drover_db::models::{EventCategory, TicketEvent};
use drover_db::queries::events as event_db;

/// Human-facing name for an event category.
pub fn display_name(category: EventCategory) -> &'static str {
    match category {
        EventCategory::TicketClaimed => "Ticket claimed",
        EventCategory::StatusChange => "Status changed",
        EventCategory::CodeGeneration => "Code generation",
        EventCategory::GitOperation => "Git operation",
        EventCategory::PrCreated => "Pull request opened",
        EventCategory::Validation => "Validation",
        EventCategory::Heartbeat => "Heartbeat",
        EventCategory::Failure => "Failure",
        EventCategory::Completed => "Completed",
    }
}

/// One rendered activity entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub event_id: i64,
    pub category: EventCategory,
    pub display: &'static str,
    pub actor_id: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl From<TicketEvent> for ActivityEntry {
    fn from(event: TicketEvent) -> Self {
        Self {
            event_id: event.id,
            category: event.category,
            display: display_name(event.category),
            actor_id: event.actor_id,
            message: event.message,
            metadata: event.metadata,
            recorded_at: event.recorded_at,
        }
    }
}

/// The full activity projection for a ticket, in append order.
pub async fn project_activity(pool: &PgPool, ticket_id: &str) -> Result<Vec<ActivityEntry>> {
    let events = event_db::list_events_for_ticket(pool, ticket_id).await?;
    Ok(events.into_iter().map(ActivityEntry::from).collect())
}

/// An ordered, at-least-once stream of activity entries for one ticket.
///
/// Polls the store every `poll` starting after `after_id`, yielding new
/// entries as they land. The stream never ends on its own; drop it to
/// unsubscribe.
pub fn subscribe(
    pool: PgPool,
    ticket_id: String,
    after_id: i64,
    poll: Duration,
) -> impl Stream<Item = ActivityEntry> {
    async_stream::stream! {
        let mut cursor = after_id;
        loop {
            match event_db::list_events_after(&pool, &ticket_id, cursor).await {
                Ok(events) => {
                    for event in events {
                        cursor = cursor.max(event.id);
                        yield ActivityEntry::from(event);
                    }
                }
                Err(e) => {
                    tracing::warn!(ticket_id = %ticket_id, error = %e, "activity poll failed");
                }
            }
            tokio::time::sleep(poll).await;
        }
    }
}
