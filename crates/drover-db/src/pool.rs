//! Connection pool and schema management for the ticket store.
//!
//! URLs are handled through sqlx's typed [`PgConnectOptions`] rather than
//! string surgery, and the migrations are embedded at compile time, so an
//! installed `drover` binary carries its schema with it.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};
use tracing::info;

/// Fallback connection URL when `DROVER_DATABASE_URL` is unset.
pub const DEFAULT_URL: &str = "postgresql://localhost:5432/drover";

/// All migrations, embedded from `crates/drover-db/migrations` at compile
/// time.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Connect a pool for the orchestrator.
///
/// The store serializes ticket writes through short compare-and-swap
/// transactions, so a modest pool is enough: a worker fleet contends on
/// rows, not on connections.
pub async fn connect(url: &str) -> Result<PgPool> {
    let options: PgConnectOptions = url
        .parse()
        .with_context(|| format!("invalid database URL {url:?}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to database at {url}"))?;
    Ok(pool)
}

/// Apply every pending embedded migration.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied");
    Ok(())
}

/// Create the database named by `url` when it does not exist yet.
///
/// `CREATE DATABASE` cannot run against the target itself, so this
/// connects to the `postgres` maintenance database on the same server,
/// derived by swapping the database on the parsed options.
pub async fn ensure_database_exists(url: &str) -> Result<()> {
    let options: PgConnectOptions = url
        .parse()
        .with_context(|| format!("invalid database URL {url:?}"))?;
    let Some(db_name) = options.get_database().map(str::to_owned) else {
        bail!("database URL {url:?} names no database");
    };
    // Database names cannot be bound as parameters in CREATE DATABASE.
    if !is_safe_identifier(&db_name) {
        bail!("database name {db_name:?} contains invalid characters");
    }

    let maint = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options.database("postgres"))
        .await
        .context("failed to connect to the postgres maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&maint)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = %db_name, "database already exists");
    } else {
        maint
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = %db_name, "database created");
    }

    maint.close().await;
    Ok(())
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
