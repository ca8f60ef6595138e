//! Postgres harness for the drover integration suites.
//!
//! One server backs the whole test binary: an external one named by
//! `DROVER_TEST_PG_URL`, or a testcontainers instance started on first
//! use. Migrations run once, into a process-unique template database;
//! every test then clones the template, so per-test setup is a single
//! `CREATE DATABASE ... TEMPLATE`.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use drover_db::pool;

struct PgServer {
    /// Server root URL, with no database path appended.
    root_url: String,
    /// Held to keep the container alive; `None` for an external server.
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();
static TEMPLATE: OnceCell<String> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("DROVER_TEST_PG_URL") {
                return PgServer {
                    root_url: url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("postgres container should start");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("mapped postgres port");

            PgServer {
                root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// Single-connection pool against the `postgres` maintenance database,
/// for CREATE/DROP DATABASE statements.
async fn maintenance_pool() -> PgPool {
    let server = server().await;
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{}/postgres", server.root_url))
        .await
        .expect("maintenance connection should succeed")
}

/// Name of the migrated template database, built exactly once per test
/// binary. The name embeds a fresh uuid so concurrently running test
/// binaries sharing an external server never collide.
async fn template_db() -> &'static str {
    TEMPLATE
        .get_or_init(|| async {
            let server = server().await;
            let name = format!("drover_tmpl_{}", Uuid::new_v4().simple());

            let maint = maintenance_pool().await;
            maint
                .execute(format!("CREATE DATABASE {name}").as_str())
                .await
                .expect("template creation should succeed");
            maint.close().await;

            let template_pool = pool::connect(&format!("{}/{name}", server.root_url))
                .await
                .expect("template connection should succeed");
            pool::run_migrations(&template_pool)
                .await
                .expect("migrations should apply to the template");
            // A template can only be cloned while nothing is connected
            // to it.
            template_pool.close().await;

            name
        })
        .await
}

/// Create a fresh migrated database by cloning the template.
///
/// Returns `(pool, db_name)`; pass `db_name` to [`drop_test_db`] when the
/// test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let template = template_db().await;
    let server = server().await;
    let db_name = format!("drover_test_{}", Uuid::new_v4().simple());

    let maint = maintenance_pool().await;
    maint
        .execute(format!("CREATE DATABASE {db_name} TEMPLATE {template}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to clone template into {db_name}: {e}"));
    maint.close().await;

    let test_pool = pool::connect(&format!("{}/{db_name}", server.root_url))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {db_name}: {e}"));

    (test_pool, db_name)
}

/// Drop a database created by [`create_test_db`], severing any straggler
/// connections first. Safe to call twice.
pub async fn drop_test_db(db_name: &str) {
    let maint = maintenance_pool().await;
    let _ = maint
        .execute(
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
            )
            .as_str(),
        )
        .await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint.close().await;
}
