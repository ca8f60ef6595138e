//! `drover log`: print the activity projection for a ticket.

use anyhow::{Context, Result};
use sqlx::PgPool;

use drover_core::activity;
use drover_db::queries::tickets;

pub async fn run_log(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let ticket = tickets::get_ticket(pool, ticket_id)
        .await?
        .with_context(|| format!("ticket {ticket_id} not found"))?;

    println!("Activity for {} ({}) -- status {}", ticket.id, ticket.title, ticket.status);
    println!();

    let entries = activity::project_activity(pool, ticket_id).await?;
    if entries.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }

    for entry in &entries {
        println!(
            "#{:<6} {}  [{}] {}  {}",
            entry.event_id,
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.actor_id,
            entry.display,
            entry.message
        );
        // Attempt history entries carry their numbers in metadata.
        if let Some(attempt) = entry.metadata.get("attempt").and_then(|v| v.as_u64()) {
            let duration = entry
                .metadata
                .get("duration_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let errors = entry
                .metadata
                .get("error_count")
                .and_then(|v| v.as_u64());
            match errors {
                Some(errors) => println!(
                    "        attempt {attempt}: {duration}ms, {errors} errors"
                ),
                None => println!("        attempt {attempt}: {duration}ms"),
            }
        }
    }

    Ok(())
}
