//! Integration tests for DB-backed state machine transitions and the
//! semantic dispatch helpers.

use drover_core::state::{TicketStateMachine, dispatch};
use drover_db::models::TicketStatus;
use drover_db::queries::tickets::{self, NewTicket};
use drover_test_utils::{create_test_db, drop_test_db};
use sqlx::PgPool;

async fn seed(pool: &PgPool, id: &str, files: Vec<String>, criteria: serde_json::Value) {
    tickets::insert_ticket(
        pool,
        &NewTicket {
            id: id.to_owned(),
            project: "demo".to_owned(),
            title: "t".to_owned(),
            description: "d".to_owned(),
            acceptance_criteria: criteria,
            estimated_scope: "small".to_owned(),
            repo_url: "https://example.com/o/r.git".to_owned(),
            branch_name: format!("drover/{id}"),
            epic: None,
            model_override: None,
            files_to_create: files,
            files_to_modify: vec![],
            max_attempts: 3,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn invalid_edge_is_rejected_before_touching_the_store() {
    let (pool, db_name) = create_test_db().await;
    seed(
        &pool,
        "TKT-00000090",
        vec!["src/a.js".to_owned()],
        serde_json::json!([{"id": "AC-1", "description": "works"}]),
    )
    .await;

    let result = TicketStateMachine::transition(
        &pool,
        "TKT-00000090",
        TicketStatus::Draft,
        TicketStatus::Done,
        "operator",
    )
    .await;
    assert!(result.is_err());
    let t = tickets::get_ticket(&pool, "TKT-00000090").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Draft, "store must be untouched");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_lock_failure_reports_actual_status() {
    let (pool, db_name) = create_test_db().await;
    seed(
        &pool,
        "TKT-00000091",
        vec!["src/a.js".to_owned()],
        serde_json::json!([{"id": "AC-1", "description": "works"}]),
    )
    .await;
    dispatch::approve_ticket(&pool, "TKT-00000091", "operator")
        .await
        .unwrap();

    // Expecting draft when the ticket is already ready.
    let err = TicketStateMachine::transition(
        &pool,
        "TKT-00000091",
        TicketStatus::Draft,
        TicketStatus::Ready,
        "operator",
    )
    .await
    .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("optimistic lock failed"), "got: {msg}");
    assert!(msg.contains("ready"), "got: {msg}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unknown_ticket_is_reported_as_missing() {
    let (pool, db_name) = create_test_db().await;

    let err = TicketStateMachine::transition(
        &pool,
        "TKT-ffffff00",
        TicketStatus::Draft,
        TicketStatus::Ready,
        "operator",
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not found"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn approval_requires_well_formed_ticket() {
    let (pool, db_name) = create_test_db().await;

    // No target files at all.
    seed(
        &pool,
        "TKT-00000092",
        vec![],
        serde_json::json!([{"id": "AC-1", "description": "works"}]),
    )
    .await;
    let err = dispatch::approve_ticket(&pool, "TKT-00000092", "operator")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no target files"));

    // No acceptance criteria.
    seed(
        &pool,
        "TKT-00000093",
        vec!["src/a.js".to_owned()],
        serde_json::json!([]),
    )
    .await;
    let err = dispatch::approve_ticket(&pool, "TKT-00000093", "operator")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("criteria"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reviewer_verdicts_drive_the_review_states() {
    let (pool, db_name) = create_test_db().await;
    seed(
        &pool,
        "TKT-00000094",
        vec!["src/a.js".to_owned()],
        serde_json::json!([{"id": "AC-1", "description": "works"}]),
    )
    .await;
    dispatch::approve_ticket(&pool, "TKT-00000094", "operator")
        .await
        .unwrap();

    // Walk a ticket to in_review through the claim machinery.
    tickets::claim_ready_ticket(&pool, "TKT-00000094", "w1", "tok", 300)
        .await
        .unwrap();
    for (from, to) in [
        (TicketStatus::Assigned, TicketStatus::InProgress),
        (TicketStatus::InProgress, TicketStatus::Verifying),
    ] {
        tickets::advance_claimed_status(&pool, "TKT-00000094", "tok", from, to, "w1")
            .await
            .unwrap();
    }
    tickets::complete_success(
        &pool,
        "TKT-00000094",
        "tok",
        "w1",
        "https://example.com/pr/1",
        "drover/TKT-00000094",
        "abc",
        &serde_json::json!([]),
        &[],
    )
    .await
    .unwrap();

    // Reject: back to ready with feedback and a fresh budget.
    dispatch::reviewer_reject(&pool, "TKT-00000094", "split the module", "r1")
        .await
        .unwrap();
    let t = tickets::get_ticket(&pool, "TKT-00000094").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Ready);
    assert_eq!(t.attempts, 0);
    let feedback = t.review_feedback.unwrap();
    assert_eq!(feedback["notes"], "split the module");

    // A second run reaches in_review again; approve finishes it.
    tickets::claim_ready_ticket(&pool, "TKT-00000094", "w2", "tok2", 300)
        .await
        .unwrap();
    for (from, to) in [
        (TicketStatus::Assigned, TicketStatus::InProgress),
        (TicketStatus::InProgress, TicketStatus::Verifying),
    ] {
        tickets::advance_claimed_status(&pool, "TKT-00000094", "tok2", from, to, "w2")
            .await
            .unwrap();
    }
    tickets::complete_success(
        &pool,
        "TKT-00000094",
        "tok2",
        "w2",
        "https://example.com/pr/2",
        "drover/TKT-00000094",
        "def",
        &serde_json::json!([]),
        &[],
    )
    .await
    .unwrap();
    dispatch::reviewer_approve(&pool, "TKT-00000094", "r1")
        .await
        .unwrap();
    let t = tickets::get_ticket(&pool, "TKT-00000094").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Done);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn operator_retry_restores_escalated_tickets() {
    let (pool, db_name) = create_test_db().await;
    seed(
        &pool,
        "TKT-00000095",
        vec!["src/a.js".to_owned()],
        serde_json::json!([{"id": "AC-1", "description": "works"}]),
    )
    .await;
    dispatch::approve_ticket(&pool, "TKT-00000095", "operator")
        .await
        .unwrap();
    tickets::claim_ready_ticket(&pool, "TKT-00000095", "w1", "tok", 300)
        .await
        .unwrap();
    tickets::complete_failure(
        &pool,
        "TKT-00000095",
        "tok",
        "w1",
        TicketStatus::NeedsReview,
        "blocked",
        "cannot proceed",
    )
    .await
    .unwrap();

    dispatch::operator_retry(&pool, "TKT-00000095", "operator")
        .await
        .unwrap();
    let t = tickets::get_ticket(&pool, "TKT-00000095").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Ready);
    assert_eq!(t.attempts, 0);
    assert!(t.last_error_class.is_none());

    // Retrying a ready ticket is an error.
    let err = dispatch::operator_retry(&pool, "TKT-00000095", "operator")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expected needs_review or quarantined"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
