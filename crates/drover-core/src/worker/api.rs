//! Wire types and client for the worker-facing orchestrator HTTP API.
//!
//! The server side (the `drover serve` router) consumes the same request
//! and response types, so the two ends cannot drift. All calls carry the
//! shared service key in the `X-Agent-Key` header; a 409 maps to
//! [`ApiError::StaleClaim`], which obliges the worker to abort its
//! in-memory work immediately.

use serde::{Deserialize, Serialize};

use drover_db::models::{CriterionReport, ProjectSettings, Ticket, TicketStatus};

/// Header carrying the shared worker service key.
pub const AGENT_KEY_HEADER: &str = "x-agent-key";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
    pub project_id: Option<String>,
    /// Optional epic restriction on the tickets this worker will take.
    pub ticket_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub ticket: Ticket,
    pub project_settings: ProjectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub ticket_id: String,
    pub agent_id: String,
    pub claim_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub ticket_id: String,
    pub agent_id: String,
    pub claim_token: String,
    pub state: TicketStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub ticket_id: String,
    pub agent_id: String,
    pub claim_token: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CompletionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_status: Option<Vec<CriterionReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionError {
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub ticket_id: String,
    pub agent_id: String,
    pub claim_token: String,
    pub error_class: String,
    pub error_message: String,
    pub should_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub agent_id: String,
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Errors from the orchestrator API, as seen by the worker.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The claim token no longer holds the ticket. Abort everything.
    #[error("stale claim")]
    StaleClaim,

    #[error("orchestrator returned status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("orchestrator unreachable: {0}")]
    Network(String),
}

/// HTTP client for the orchestrator, bound to one worker identity.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
    agent_key: String,
    pub agent_id: String,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, agent_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            agent_key: agent_key.into(),
            agent_id: agent_id.into(),
        }
    }

    async fn post<B: Serialize>(
        &self,
        route: &str,
        body: &B,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{route}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header(AGENT_KEY_HEADER, &self.agent_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            409 => Err(ApiError::StaleClaim),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Http { status, body })
            }
        }
    }

    /// Request a ticket. `Ok(None)` means no work is available (204).
    pub async fn claim(
        &self,
        project_id: Option<&str>,
        ticket_filter: Option<&str>,
    ) -> Result<Option<ClaimResponse>, ApiError> {
        let request = ClaimRequest {
            agent_id: self.agent_id.clone(),
            project_id: project_id.map(str::to_owned),
            ticket_filter: ticket_filter.map(str::to_owned),
        };
        let response = self.post("/claim", &request).await?;
        if response.status().as_u16() == 204 {
            return Ok(None);
        }
        let grant = response
            .json()
            .await
            .map_err(|e| ApiError::Network(format!("malformed claim response: {e}")))?;
        Ok(Some(grant))
    }

    pub async fn heartbeat(&self, ticket_id: &str, claim_token: &str) -> Result<(), ApiError> {
        let request = HeartbeatRequest {
            ticket_id: ticket_id.to_owned(),
            agent_id: self.agent_id.clone(),
            claim_token: claim_token.to_owned(),
        };
        self.post("/heartbeat", &request).await?;
        Ok(())
    }

    /// Advance the ticket within the active statuses.
    pub async fn advance_status(
        &self,
        ticket_id: &str,
        claim_token: &str,
        state: TicketStatus,
    ) -> Result<(), ApiError> {
        let request = StatusRequest {
            ticket_id: ticket_id.to_owned(),
            agent_id: self.agent_id.clone(),
            claim_token: claim_token.to_owned(),
            state,
        };
        self.post("/status", &request).await?;
        Ok(())
    }

    pub async fn complete(&self, request: &CompleteRequest) -> Result<(), ApiError> {
        self.post("/complete", request).await?;
        Ok(())
    }

    /// Report an explicit retryable/non-retryable failure.
    pub async fn fail(
        &self,
        ticket_id: &str,
        claim_token: &str,
        error_class: &str,
        error_message: &str,
        should_retry: bool,
    ) -> Result<(), ApiError> {
        let request = FailRequest {
            ticket_id: ticket_id.to_owned(),
            agent_id: self.agent_id.clone(),
            claim_token: claim_token.to_owned(),
            error_class: error_class.to_owned(),
            error_message: error_message.to_owned(),
            should_retry,
        };
        self.post("/fail", &request).await?;
        Ok(())
    }

    /// Emit a worker-side activity event (best-effort from callers).
    pub async fn post_activity(
        &self,
        ticket_id: &str,
        category: &str,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<(), ApiError> {
        let request = ActivityRequest {
            agent_id: self.agent_id.clone(),
            category: category.to_owned(),
            message: message.to_owned(),
            metadata,
        };
        self.post(&format!("/tickets/{ticket_id}/activity"), &request)
            .await?;
        Ok(())
    }
}
