//! End-to-end worker tests: a real orchestrator router on a TCP listener,
//! a real local git origin, and wiremock standing in for the LLM and the
//! pull-request API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::PgPool;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use drover_core::llm::{LlmConfig, ScopeModelMap};
use drover_core::server::{AppState, build_router};
use drover_core::state::dispatch;
use drover_core::worker::api::OrchestratorClient;
use drover_core::worker::pr::PrConfig;
use drover_core::worker::{Worker, WorkerConfig};
use drover_db::models::{EventCategory, TicketStatus};
use drover_db::queries::events;
use drover_db::queries::tickets::{self, NewTicket};
use drover_test_utils::{create_test_db, drop_test_db};

const AGENT_KEY: &str = "e2e-agent-key";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

async fn git(cwd: &Path, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Bare origin with one commit on `main` containing `src/b.js`.
async fn make_origin(tmp: &Path) -> PathBuf {
    let origin = tmp.join("fixtures").join("origin.git");
    std::fs::create_dir_all(&origin).unwrap();
    let seed = tmp.join("seed");
    std::fs::create_dir_all(seed.join("src")).unwrap();

    git(tmp, &["init", "--bare", origin.to_str().unwrap()]).await;
    git(tmp, &["init", "-b", "main", seed.to_str().unwrap()]).await;
    git(&seed, &["config", "user.name", "seed"]).await;
    git(&seed, &["config", "user.email", "seed@test"]).await;
    std::fs::write(seed.join("src/b.js"), "function old() {\n  return 1;\n}\n").unwrap();
    git(&seed, &["add", "-A"]).await;
    git(&seed, &["commit", "-m", "seed"]).await;
    git(&seed, &["push", origin.to_str().unwrap(), "main:main"]).await;

    origin
}

/// Serve the orchestrator router on an ephemeral port, returning its URL.
async fn start_orchestrator(pool: PgPool) -> String {
    let app = build_router(AppState {
        pool,
        agent_key: AGENT_KEY.to_owned(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    format!("http://{addr}")
}

fn llm_body(output: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "content": [{"type": "text", "text": output.to_string()}],
        "usage": {"input_tokens": 120, "output_tokens": 80},
    })
}

fn worker_config(
    tmp: &Path,
    orchestrator_url: String,
    llm_url: String,
    pr_url: String,
) -> WorkerConfig {
    WorkerConfig {
        orchestrator_url,
        agent_key: AGENT_KEY.to_owned(),
        agent_id: "w-e2e".to_owned(),
        project: "demo".to_owned(),
        epic_filter: None,
        poll_interval: Duration::from_millis(100),
        max_internal_attempts: 3,
        heartbeat_period: Duration::from_secs(5),
        validation_timeout: Duration::from_secs(30),
        ticket_timeout: Duration::from_secs(120),
        max_prompt_lines: 400,
        workspace_root: tmp.join("workspaces"),
        repo_token: None,
        allowed_models: vec![],
        scope_models: ScopeModelMap::default(),
        llm: LlmConfig {
            api_url: llm_url,
            api_key: "test-key".to_owned(),
            request_timeout: Duration::from_secs(30),
            max_tokens: 4096,
        },
        pr: PrConfig {
            api_base: pr_url,
            token: "test-token".to_owned(),
        },
    }
}

async fn seed_ticket(
    pool: &PgPool,
    id: &str,
    repo_url: &str,
    files_to_create: Vec<String>,
    files_to_modify: Vec<String>,
) {
    tickets::insert_ticket(
        pool,
        &NewTicket {
            id: id.to_owned(),
            project: "demo".to_owned(),
            title: "add foo".to_owned(),
            description: "Implement foo.".to_owned(),
            acceptance_criteria: serde_json::json!([
                {"id": "AC-1", "description": "exports foo"}
            ]),
            estimated_scope: "small".to_owned(),
            repo_url: repo_url.to_owned(),
            branch_name: format!("drover/{id}"),
            epic: None,
            model_override: None,
            files_to_create,
            files_to_modify,
            max_attempts: 3,
        },
    )
    .await
    .unwrap();
    dispatch::approve_ticket(pool, id, "operator").await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_ends_in_review_with_one_pr() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();
    let origin = make_origin(tmp.path()).await;

    seed_ticket(
        &pool,
        "TKT-000000e2",
        origin.to_str().unwrap(),
        vec!["src/a.js".to_owned()],
        vec![],
    )
    .await;

    let orchestrator_url = start_orchestrator(pool.clone()).await;

    // LLM returns one clean create plus a satisfied criterion.
    let llm = MockServer::start().await;
    let generation = serde_json::json!({
        "files": [
            {"path": "src/a.js", "action": "create", "content": "export function foo() {}\n"}
        ],
        "tests": [],
        "summary": "Adds the foo export.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "SATISFIED",
             "evidence": "src/a.js exports foo"}
        ],
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&generation)))
        .expect(1)
        .mount(&llm)
        .await;

    let pr = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/repos/.+/pulls$"))
        .respond_with(ResponseTemplate::new(201).set_body_json(
            serde_json::json!({"html_url": "https://example.com/pr/42"}),
        ))
        .expect(1)
        .mount(&pr)
        .await;

    let config = worker_config(
        tmp.path(),
        orchestrator_url.clone(),
        format!("{}/v1/messages", llm.uri()),
        pr.uri(),
    );
    let worker = Worker::new(config);

    let client = OrchestratorClient::new(orchestrator_url, AGENT_KEY, "w-e2e");
    let grant = client
        .claim(Some("demo"), None)
        .await
        .expect("claim should succeed")
        .expect("a ticket should be available");
    worker.execute(&grant).await;

    // Terminal assertions: in_review, one PR, one attempt.
    let ticket = tickets::get_ticket(&pool, "TKT-000000e2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::InReview);
    assert_eq!(ticket.pr_url.as_deref(), Some("https://example.com/pr/42"));
    assert_eq!(ticket.attempts, 1);
    assert!(ticket.claim_token.is_none());
    let criteria = ticket.criteria_status.expect("criteria recorded");
    assert_eq!(criteria.0.len(), 1);
    assert_eq!(criteria.0[0].id, "AC-1");

    // The commit landed on the ticket branch in the origin.
    let output = tokio::process::Command::new("git")
        .args(["log", "drover/TKT-000000e2", "-1", "--format=%s"])
        .current_dir(&origin)
        .output()
        .await
        .unwrap();
    let subject = String::from_utf8_lossy(&output.stdout);
    assert!(subject.contains("TKT-000000e2: add foo"), "got: {subject}");

    // Event stream covers the material steps.
    for category in [
        EventCategory::TicketClaimed,
        EventCategory::CodeGeneration,
        EventCategory::GitOperation,
        EventCategory::PrCreated,
        EventCategory::Completed,
    ] {
        let count = events::count_events(&pool, "TKT-000000e2", category)
            .await
            .unwrap();
        assert!(count >= 1, "expected at least one {category} event");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: patch fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_patch_retries_with_full_rewrite() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();
    let origin = make_origin(tmp.path()).await;

    seed_ticket(
        &pool,
        "TKT-000000e3",
        origin.to_str().unwrap(),
        vec![],
        vec!["src/b.js".to_owned()],
    )
    .await;

    let orchestrator_url = start_orchestrator(pool.clone()).await;

    let llm = MockServer::start().await;
    // Attempt 1: a modify whose search text matches nothing.
    let bad_patch = serde_json::json!({
        "files": [
            {"path": "src/b.js", "action": "modify", "patches": [
                {"search": "function that was never written", "replace": "function renamed() {}"}
            ]}
        ],
        "tests": [],
        "summary": "Renames old.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "SATISFIED",
             "evidence": "renamed"}
        ],
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&bad_patch)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&llm)
        .await;
    // Attempt 2 (driven by the PATCH FAILED retry prompt): full rewrite.
    let rewrite = serde_json::json!({
        "files": [
            {"path": "src/b.js", "action": "create",
             "content": "export function foo() {\n  return 1;\n}\n"}
        ],
        "tests": [],
        "summary": "Rewrites b.js with the foo export.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "SATISFIED",
             "evidence": "src/b.js exports foo"}
        ],
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&rewrite)))
        .expect(1)
        .mount(&llm)
        .await;

    let pr = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/repos/.+/pulls$"))
        .respond_with(ResponseTemplate::new(201).set_body_json(
            serde_json::json!({"html_url": "https://example.com/pr/43"}),
        ))
        .mount(&pr)
        .await;

    let config = worker_config(
        tmp.path(),
        orchestrator_url.clone(),
        format!("{}/v1/messages", llm.uri()),
        pr.uri(),
    );
    let worker = Worker::new(config);

    let client = OrchestratorClient::new(orchestrator_url, AGENT_KEY, "w-e2e");
    let grant = client
        .claim(Some("demo"), None)
        .await
        .unwrap()
        .expect("a ticket should be available");
    worker.execute(&grant).await;

    // From the orchestrator's view this was one attempt; internally two.
    let ticket = tickets::get_ticket(&pool, "TKT-000000e3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::InReview);
    assert_eq!(ticket.attempts, 1);

    let generations = events::count_events(&pool, "TKT-000000e3", EventCategory::CodeGeneration)
        .await
        .unwrap();
    assert_eq!(generations, 2, "attempt history should show both attempts");

    // The rewrite (not the failed patch) is what got committed.
    let output = tokio::process::Command::new("git")
        .args(["show", "drover/TKT-000000e3:src/b.js"])
        .current_dir(&origin)
        .output()
        .await
        .unwrap();
    let content = String::from_utf8_lossy(&output.stdout);
    assert!(content.contains("export function foo"), "got: {content}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: BLOCKED criterion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocked_criterion_escalates_without_retry() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();
    let origin = make_origin(tmp.path()).await;

    seed_ticket(
        &pool,
        "TKT-000000e4",
        origin.to_str().unwrap(),
        vec!["src/a.js".to_owned()],
        vec![],
    )
    .await;

    let orchestrator_url = start_orchestrator(pool.clone()).await;

    let llm = MockServer::start().await;
    let blocked = serde_json::json!({
        "files": [],
        "tests": [],
        "summary": "Cannot proceed.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "BLOCKED",
             "evidence": "the upstream schema is not documented"}
        ],
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&blocked)))
        .expect(1)
        .mount(&llm)
        .await;

    let pr = MockServer::start().await;

    let config = worker_config(
        tmp.path(),
        orchestrator_url.clone(),
        format!("{}/v1/messages", llm.uri()),
        pr.uri(),
    );
    let worker = Worker::new(config);

    let client = OrchestratorClient::new(orchestrator_url, AGENT_KEY, "w-e2e");
    let grant = client
        .claim(Some("demo"), None)
        .await
        .unwrap()
        .expect("a ticket should be available");
    worker.execute(&grant).await;

    let ticket = tickets::get_ticket(&pool, "TKT-000000e4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::NeedsReview);
    assert_eq!(ticket.attempts, 1, "the consumed claim is the only increment");
    assert_eq!(ticket.last_error_class.as_deref(), Some("blocked"));

    let failures = events::count_events(&pool, "TKT-000000e4", EventCategory::Failure)
        .await
        .unwrap();
    assert_eq!(failures, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: validation exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistent_syntax_errors_exhaust_internal_attempts() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();
    let origin = make_origin(tmp.path()).await;

    seed_ticket(
        &pool,
        "TKT-000000e5",
        origin.to_str().unwrap(),
        vec!["src/a.js".to_owned()],
        vec![],
    )
    .await;

    let orchestrator_url = start_orchestrator(pool.clone()).await;

    let llm = MockServer::start().await;
    // Every attempt emits the same unbalanced file.
    let broken = serde_json::json!({
        "files": [
            {"path": "src/a.js", "action": "create", "content": "export function foo() {\n"}
        ],
        "tests": [],
        "summary": "Tries to add foo.",
        "acceptance_criteria_status": [
            {"id": "AC-1", "criterion": "exports foo", "status": "SATISFIED",
             "evidence": "added"}
        ],
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&broken)))
        .expect(3)
        .mount(&llm)
        .await;

    let pr = MockServer::start().await;

    let config = worker_config(
        tmp.path(),
        orchestrator_url.clone(),
        format!("{}/v1/messages", llm.uri()),
        pr.uri(),
    );
    let worker = Worker::new(config);

    let client = OrchestratorClient::new(orchestrator_url, AGENT_KEY, "w-e2e");
    let grant = client
        .claim(Some("demo"), None)
        .await
        .unwrap()
        .expect("a ticket should be available");
    worker.execute(&grant).await;

    // Retryable: back to ready for another claim, error class recorded.
    let ticket = tickets::get_ticket(&pool, "TKT-000000e5")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Ready);
    assert_eq!(ticket.attempts, 1);
    assert_eq!(
        ticket.last_error_class.as_deref(),
        Some("validation_exhausted")
    );

    let generations = events::count_events(&pool, "TKT-000000e5", EventCategory::CodeGeneration)
        .await
        .unwrap();
    assert_eq!(generations, 3, "all internal attempts are in the history");

    pool.close().await;
    drop_test_db(&db_name).await;
}
