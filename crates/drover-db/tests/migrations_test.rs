//! Schema smoke tests: migrations apply cleanly and create the expected
//! tables and constraints.

use drover_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename != '_sqlx_migrations' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "project_settings",
            "ticket_dependencies",
            "ticket_events",
            "tickets"
        ]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ticket_id_format_is_enforced() {
    let (pool, db_name) = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO tickets (id, project, title, repo_url, branch_name) \
         VALUES ('not-a-ticket-id', 'p', 't', 'u', 'b')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "malformed ticket id should be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_token_requires_active_status() {
    let (pool, db_name) = create_test_db().await;

    // A draft ticket cannot carry a claim token.
    let result = sqlx::query(
        "INSERT INTO tickets (id, project, title, repo_url, branch_name, claim_token) \
         VALUES ('TKT-0000aaaa', 'p', 't', 'u', 'b', 'tok')",
    )
    .execute(&pool)
    .await;
    assert!(
        result.is_err(),
        "claim token on a draft ticket should violate the check constraint"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
