//! Integration tests for the claim/heartbeat/completion protocol:
//! single-owner claims, stale-token rejection, failure routing by the
//! attempts cap, reclaim idempotence, and cancellation visibility.

use drover_core::claim::{self, ClaimError, CompletionOutcome, error_class};
use drover_core::state::dispatch;
use drover_db::models::{EventCategory, TicketStatus};
use drover_db::queries::events;
use drover_db::queries::settings as settings_db;
use drover_db::queries::tickets::{self, NewTicket};
use drover_test_utils::{create_test_db, drop_test_db};
use sqlx::PgPool;

async fn seed_ready(pool: &PgPool, id: &str, max_attempts: i32) {
    tickets::insert_ticket(
        pool,
        &NewTicket {
            id: id.to_owned(),
            project: "demo".to_owned(),
            title: format!("ticket {id}"),
            description: "desc".to_owned(),
            acceptance_criteria: serde_json::json!([
                {"id": "AC-1", "description": "works"}
            ]),
            estimated_scope: "small".to_owned(),
            repo_url: "https://example.com/o/r.git".to_owned(),
            branch_name: format!("drover/{id}"),
            epic: None,
            model_override: None,
            files_to_create: vec!["src/a.js".to_owned()],
            files_to_modify: vec![],
            max_attempts,
        },
    )
    .await
    .unwrap();
    dispatch::approve_ticket(pool, id, "operator").await.unwrap();
}

async fn advance_to_verifying(pool: &PgPool, id: &str, worker: &str, token: &str) {
    claim::advance(pool, id, worker, token, TicketStatus::InProgress)
        .await
        .unwrap();
    claim::advance(pool, id, worker, token, TicketStatus::Verifying)
        .await
        .unwrap();
}

fn success_outcome(pr: &str) -> CompletionOutcome {
    CompletionOutcome::Success {
        pr_url: pr.to_owned(),
        branch_name: "drover/test".to_owned(),
        commit_sha: "abc123".to_owned(),
        criteria_status: serde_json::json!([
            {"id": "AC-1", "criterion": "works", "status": "SATISFIED", "evidence": "done"}
        ]),
        files_changed: vec!["src/a.js".to_owned()],
    }
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_queue_claim_returns_none_without_mutating() {
    let (pool, db_name) = create_test_db().await;

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap();
    assert!(grant.is_none());

    // No tickets, no events: nothing was written.
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ticket_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_claims_have_a_single_winner() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000080", 3).await;

    // Eight workers race for one ticket.
    let mut handles = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            claim::claim(&pool, &format!("w{i}"), "demo", None).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one worker may hold the claim");

    let t = tickets::get_ticket(&pool, "TKT-00000080")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.status, TicketStatus::Assigned);
    assert_eq!(t.attempts, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn losing_worker_claims_the_next_ticket() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000081", 3).await;
    seed_ready(&pool, "TKT-00000082", 3).await;

    let (a, b) = tokio::join!(
        claim::claim(&pool, "w1", "demo", None),
        claim::claim(&pool, "w2", "demo", None),
    );
    let a = a.unwrap().expect("w1 should get a ticket");
    let b = b.unwrap().expect("w2 should get a ticket");
    assert_ne!(a.ticket.id, b.ticket.id, "no double assignment");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_returns_project_settings() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000083", 3).await;

    let mut settings = settings_db::get_settings(&pool, "demo").await.unwrap();
    settings.worker_model = Some("claude-opus-4-1".to_owned());
    settings.claim_ttl_secs = 120;
    settings_db::upsert_settings(&pool, &settings).await.unwrap();

    let grant = claim::claim(&pool, "w1", "demo", None)
        .await
        .unwrap()
        .expect("should claim");
    assert_eq!(grant.settings.worker_model.as_deref(), Some("claude-opus-4-1"));
    assert_eq!(grant.settings.claim_ttl_secs, 120);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Heartbeats and completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_with_wrong_token_is_stale() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000084", 3).await;

    claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();

    let result = claim::heartbeat(&pool, "TKT-00000084", "w2", "forged-token").await;
    assert!(matches!(result, Err(ClaimError::StaleClaim)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn success_requires_verifying_and_records_pr() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000085", 3).await;

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let token = grant.ticket.claim_token.clone().unwrap();

    // Success from `assigned` is rejected; the worker must walk the
    // status chain first.
    let early = claim::complete(
        &pool,
        "TKT-00000085",
        "w1",
        &token,
        success_outcome("https://example.com/pr/1"),
    )
    .await;
    assert!(matches!(early, Err(ClaimError::StaleClaim)));

    advance_to_verifying(&pool, "TKT-00000085", "w1", &token).await;
    let landed = claim::complete(
        &pool,
        "TKT-00000085",
        "w1",
        &token,
        success_outcome("https://example.com/pr/1"),
    )
    .await
    .unwrap();
    assert_eq!(landed, TicketStatus::InReview);

    let t = tickets::get_ticket(&pool, "TKT-00000085").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::InReview);
    assert_eq!(t.pr_url.as_deref(), Some("https://example.com/pr/1"));
    assert!(t.claim_token.is_none());
    assert_eq!(t.attempts, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retryable_failure_routes_to_ready_until_cap() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000086", 2).await;

    // Attempt 1: claim consumes the attempt, failure returns to ready.
    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let token = grant.ticket.claim_token.clone().unwrap();
    let landed = claim::complete(
        &pool,
        "TKT-00000086",
        "w1",
        &token,
        CompletionOutcome::Failure {
            error_class: error_class::VALIDATION_EXHAUSTED.to_owned(),
            message: "syntax errors".to_owned(),
            should_retry: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(landed, TicketStatus::Ready);

    // Attempt 2 = max_attempts: the failure escalates.
    let grant = claim::claim(&pool, "w2", "demo", None).await.unwrap().unwrap();
    assert_eq!(grant.ticket.attempts, 2);
    let token = grant.ticket.claim_token.clone().unwrap();
    let landed = claim::complete(
        &pool,
        "TKT-00000086",
        "w2",
        &token,
        CompletionOutcome::Failure {
            error_class: error_class::VALIDATION_EXHAUSTED.to_owned(),
            message: "still syntax errors".to_owned(),
            should_retry: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(landed, TicketStatus::NeedsReview);

    // The exhausted ticket is never claimable again.
    let grant = claim::claim(&pool, "w3", "demo", None).await.unwrap();
    assert!(grant.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn blocked_failure_is_non_retryable() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000087", 3).await;

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let token = grant.ticket.claim_token.clone().unwrap();

    let landed = claim::complete(
        &pool,
        "TKT-00000087",
        "w1",
        &token,
        CompletionOutcome::Failure {
            error_class: error_class::BLOCKED.to_owned(),
            message: "AC-1: requires schema docs".to_owned(),
            should_retry: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(landed, TicketStatus::NeedsReview, "blocked skips the retry queue");

    let t = tickets::get_ticket(&pool, "TKT-00000087").await.unwrap().unwrap();
    assert_eq!(t.attempts, 1, "the claim consumed one attempt");
    assert_eq!(t.last_error_class.as_deref(), Some("blocked"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn monotone_attempts_across_lifecycle() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000088", 5).await;

    let mut last = 0;
    for round in 0..3 {
        let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
        assert!(grant.ticket.attempts > last, "attempts must be monotone");
        last = grant.ticket.attempts;
        let token = grant.ticket.claim_token.clone().unwrap();
        claim::complete(
            &pool,
            "TKT-00000088",
            "w1",
            &token,
            CompletionOutcome::Failure {
                error_class: error_class::API_ERROR.to_owned(),
                message: format!("round {round}"),
                should_retry: true,
            },
        )
        .await
        .unwrap();
    }
    assert_eq!(last, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Reclaim sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_claim_is_reclaimed_and_old_token_rejected() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-00000089", 3).await;

    // TTL of zero seconds: the claim is expired as soon as it exists.
    let mut settings = settings_db::get_settings(&pool, "demo").await.unwrap();
    settings.claim_ttl_secs = 0;
    settings_db::upsert_settings(&pool, &settings).await.unwrap();

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let dead_token = grant.ticket.claim_token.clone().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let report = claim::run_reclaim_sweep(&pool).await.unwrap();
    assert_eq!(report.reclaimed, vec!["TKT-00000089"]);

    // L1: a second pass reclaims nothing.
    let report = claim::run_reclaim_sweep(&pool).await.unwrap();
    assert!(report.reclaimed.is_empty());

    // The dead worker's completion is rejected.
    let zombie = claim::complete(
        &pool,
        "TKT-00000089",
        "w1",
        &dead_token,
        success_outcome("https://example.com/pr/zombie"),
    )
    .await;
    assert!(matches!(zombie, Err(ClaimError::StaleClaim)));

    // A second worker finishes the ticket.
    let mut settings = settings_db::get_settings(&pool, "demo").await.unwrap();
    settings.claim_ttl_secs = 300;
    settings_db::upsert_settings(&pool, &settings).await.unwrap();

    let grant = claim::claim(&pool, "w2", "demo", None).await.unwrap().unwrap();
    assert!(grant.ticket.attempts >= 2);
    let token = grant.ticket.claim_token.clone().unwrap();
    advance_to_verifying(&pool, "TKT-00000089", "w2", &token).await;
    let landed = claim::complete(
        &pool,
        "TKT-00000089",
        "w2",
        &token,
        success_outcome("https://example.com/pr/2"),
    )
    .await
    .unwrap();
    assert_eq!(landed, TicketStatus::InReview);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweep_quarantines_exhausted_tickets() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-0000008a", 1).await;

    let mut settings = settings_db::get_settings(&pool, "demo").await.unwrap();
    settings.claim_ttl_secs = 0;
    settings.max_attempts = 1;
    settings_db::upsert_settings(&pool, &settings).await.unwrap();

    claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let report = claim::run_reclaim_sweep(&pool).await.unwrap();
    assert_eq!(report.reclaimed, vec!["TKT-0000008a"]);
    assert_eq!(report.quarantined, vec!["TKT-0000008a"]);

    let t = tickets::get_ticket(&pool, "TKT-0000008a").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Quarantined);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_dominates_and_is_visible_as_stale_claim() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-0000008b", 3).await;

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let token = grant.ticket.claim_token.clone().unwrap();

    dispatch::cancel_ticket(&pool, "TKT-0000008b", "operator")
        .await
        .unwrap();

    let hb = claim::heartbeat(&pool, "TKT-0000008b", "w1", &token).await;
    assert!(matches!(hb, Err(ClaimError::StaleClaim)));

    let done = claim::complete(
        &pool,
        "TKT-0000008b",
        "w1",
        &token,
        success_outcome("https://example.com/pr/never"),
    )
    .await;
    assert!(matches!(done, Err(ClaimError::StaleClaim)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Event totality
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_transition_appends_one_status_change_event() {
    let (pool, db_name) = create_test_db().await;
    seed_ready(&pool, "TKT-0000008c", 3).await;

    let grant = claim::claim(&pool, "w1", "demo", None).await.unwrap().unwrap();
    let token = grant.ticket.claim_token.clone().unwrap();
    advance_to_verifying(&pool, "TKT-0000008c", "w1", &token).await;
    claim::complete(
        &pool,
        "TKT-0000008c",
        "w1",
        &token,
        success_outcome("https://example.com/pr/1"),
    )
    .await
    .unwrap();

    // draft->ready, ready->assigned, assigned->in_progress,
    // in_progress->verifying, verifying->in_review.
    let changes = events::count_events(&pool, "TKT-0000008c", EventCategory::StatusChange)
        .await
        .unwrap();
    assert_eq!(changes, 5);

    let claimed = events::count_events(&pool, "TKT-0000008c", EventCategory::TicketClaimed)
        .await
        .unwrap();
    assert_eq!(claimed, 1);
    let completed = events::count_events(&pool, "TKT-0000008c", EventCategory::Completed)
        .await
        .unwrap();
    assert_eq!(completed, 1);
    let prs = events::count_events(&pool, "TKT-0000008c", EventCategory::PrCreated)
        .await
        .unwrap();
    assert_eq!(prs, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
