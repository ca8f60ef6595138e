//! Database query functions for the `project_settings` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ProjectSettings;

/// Fetch the settings for a project, falling back to defaults when the
/// project has no stored overrides.
pub async fn get_settings(pool: &PgPool, project: &str) -> Result<ProjectSettings> {
    let settings = sqlx::query_as::<_, ProjectSettings>(
        "SELECT * FROM project_settings WHERE project = $1",
    )
    .bind(project)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch settings for project {project}"))?;

    Ok(settings.unwrap_or_else(|| ProjectSettings::defaults_for(project)))
}

/// Insert or replace the settings row for a project.
pub async fn upsert_settings(pool: &PgPool, settings: &ProjectSettings) -> Result<()> {
    sqlx::query(
        "INSERT INTO project_settings \
             (project, worker_model, validation_level, max_attempts, claim_ttl_secs, base_branch) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (project) DO UPDATE SET \
             worker_model = EXCLUDED.worker_model, \
             validation_level = EXCLUDED.validation_level, \
             max_attempts = EXCLUDED.max_attempts, \
             claim_ttl_secs = EXCLUDED.claim_ttl_secs, \
             base_branch = EXCLUDED.base_branch",
    )
    .bind(&settings.project)
    .bind(&settings.worker_model)
    .bind(settings.validation_level.to_string())
    .bind(settings.max_attempts)
    .bind(settings.claim_ttl_secs)
    .bind(&settings.base_branch)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert settings for project {}", settings.project))?;

    Ok(())
}
