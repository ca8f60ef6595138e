use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Draft,
    Ready,
    Assigned,
    InProgress,
    Verifying,
    InReview,
    Done,
    NeedsReview,
    Cancelled,
    Quarantined,
}

impl TicketStatus {
    /// Whether a ticket in this status is held by a worker under a claim.
    pub fn is_claimed(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::Verifying)
    }

    /// Whether this status is terminal (no further automatic transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Verifying => "verifying",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::NeedsReview => "needs_review",
            Self::Cancelled => "cancelled",
            Self::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = TicketStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "verifying" => Ok(Self::Verifying),
            "in_review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "needs_review" => Ok(Self::NeedsReview),
            "cancelled" => Ok(Self::Cancelled),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(TicketStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketStatus`] string.
#[derive(Debug, Clone)]
pub struct TicketStatusParseError(pub String);

impl fmt::Display for TicketStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket status: {:?}", self.0)
    }
}

impl std::error::Error for TicketStatusParseError {}

// ---------------------------------------------------------------------------

/// Estimated scope of a ticket -- keys the model-selection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EstimatedScope {
    Small,
    Medium,
    Large,
}

impl fmt::Display for EstimatedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for EstimatedScope {
    type Err = EstimatedScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(EstimatedScopeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EstimatedScope`] string.
#[derive(Debug, Clone)]
pub struct EstimatedScopeParseError(pub String);

impl fmt::Display for EstimatedScopeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid estimated scope: {:?}", self.0)
    }
}

impl std::error::Error for EstimatedScopeParseError {}

// ---------------------------------------------------------------------------

/// How strictly a worker validates generated files before committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Minimal,
    Standard,
    Strict,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Strict => "strict",
        };
        f.write_str(s)
    }
}

impl FromStr for ValidationLevel {
    type Err = ValidationLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(ValidationLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ValidationLevel`] string.
#[derive(Debug, Clone)]
pub struct ValidationLevelParseError(pub String);

impl fmt::Display for ValidationLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid validation level: {:?}", self.0)
    }
}

impl std::error::Error for ValidationLevelParseError {}

// ---------------------------------------------------------------------------

/// Category of a ticket event. Closed set: events are the authoritative
/// history and the activity log is a projection over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    TicketClaimed,
    StatusChange,
    CodeGeneration,
    GitOperation,
    PrCreated,
    Validation,
    Heartbeat,
    Failure,
    Completed,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TicketClaimed => "ticket_claimed",
            Self::StatusChange => "status_change",
            Self::CodeGeneration => "code_generation",
            Self::GitOperation => "git_operation",
            Self::PrCreated => "pr_created",
            Self::Validation => "validation",
            Self::Heartbeat => "heartbeat",
            Self::Failure => "failure",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for EventCategory {
    type Err = EventCategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ticket_claimed" => Ok(Self::TicketClaimed),
            "status_change" => Ok(Self::StatusChange),
            "code_generation" => Ok(Self::CodeGeneration),
            "git_operation" => Ok(Self::GitOperation),
            "pr_created" => Ok(Self::PrCreated),
            "validation" => Ok(Self::Validation),
            "heartbeat" => Ok(Self::Heartbeat),
            "failure" => Ok(Self::Failure),
            "completed" => Ok(Self::Completed),
            other => Err(EventCategoryParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventCategory`] string.
#[derive(Debug, Clone)]
pub struct EventCategoryParseError(pub String);

impl fmt::Display for EventCategoryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event category: {:?}", self.0)
    }
}

impl std::error::Error for EventCategoryParseError {}

// ---------------------------------------------------------------------------

/// Status a worker reports for one acceptance criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriterionStatus {
    Satisfied,
    PartiallySatisfied,
    Blocked,
}

impl fmt::Display for CriterionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Satisfied => "SATISFIED",
            Self::PartiallySatisfied => "PARTIALLY_SATISFIED",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JSON payload structs
// ---------------------------------------------------------------------------

/// One acceptance criterion attached to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
}

/// A worker's verdict on one acceptance criterion, recorded on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionReport {
    pub id: String,
    pub criterion: String,
    pub status: CriterionStatus,
    pub evidence: String,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A ticket -- one unit of coding work with acceptance criteria and a
/// target file set. Identity is an opaque `TKT-<8 hex>` string.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: String,
    pub project: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Json<Vec<AcceptanceCriterion>>,
    pub estimated_scope: EstimatedScope,
    pub repo_url: String,
    pub branch_name: String,
    pub epic: Option<String>,
    pub model_override: Option<String>,
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error_class: Option<String>,
    pub status: TicketStatus,
    pub assignee_id: Option<String>,
    pub claim_token: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub review_feedback: Option<serde_json::Value>,
    pub criteria_status: Option<Json<Vec<CriterionReport>>>,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An edge in the ticket dependency DAG: `ticket_id` depends on
/// `depends_on`, which must reach `done` first.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketDependency {
    pub ticket_id: String,
    pub depends_on: String,
}

/// An append-only event in a ticket's history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketEvent {
    pub id: i64,
    pub ticket_id: String,
    pub category: EventCategory,
    pub actor_id: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Per-project overrides consulted at claim time and handed to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectSettings {
    pub project: String,
    pub worker_model: Option<String>,
    pub validation_level: ValidationLevel,
    pub max_attempts: i32,
    pub claim_ttl_secs: i32,
    pub base_branch: String,
}

impl ProjectSettings {
    /// Settings applied when a project has no stored overrides.
    pub fn defaults_for(project: &str) -> Self {
        Self {
            project: project.to_owned(),
            worker_model: None,
            validation_level: ValidationLevel::Standard,
            max_attempts: 3,
            claim_ttl_secs: 300,
            base_branch: "main".to_owned(),
        }
    }
}

/// Generate a fresh ticket id of the form `TKT-<8 hex>`.
pub fn new_ticket_id() -> String {
    format!("TKT-{:08x}", rand::random::<u32>())
}

/// Whether a string is a well-formed ticket id.
pub fn is_ticket_id(s: &str) -> bool {
    let Some(hex) = s.strip_prefix("TKT-") else {
        return false;
    };
    hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
