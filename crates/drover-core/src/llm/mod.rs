//! LLM upstream client and model selection.
//!
//! The upstream contract is a single POST returning a list of text blocks
//! plus token usage. The client is a process-wide handle created at
//! startup; worker code never constructs ad-hoc clients per call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use drover_db::models::{EstimatedScope, ProjectSettings, Ticket};

/// Configuration for the LLM upstream.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Full URL of the messages endpoint.
    pub api_url: String,
    /// API key sent as `x-api-key`.
    pub api_key: String,
    /// Per-call timeout for the generation request.
    pub request_timeout: Duration,
    /// Maximum tokens requested per generation call.
    pub max_tokens: u32,
}

/// Errors from the LLM upstream, split along the worker's failure
/// taxonomy: non-200 responses are `api_error`, transport failures are
/// `network_error`. Both abort retries inside the worker and are reported
/// to the orchestrator as retryable.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error: status {status}")]
    Api { status: u16, body: String },

    #[error("LLM network error: {0}")]
    Network(String),

    #[error("LLM response had no text blocks")]
    EmptyResponse,
}

/// Token usage reported by the upstream and echoed into attempt history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One completed generation call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// All text blocks concatenated in order.
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Serialize)]
struct LlmRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<LlmMessage<'a>>,
}

#[derive(Serialize)]
struct LlmMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct LlmWireResponse {
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Process-wide LLM client.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Issue one generation call and collect the text blocks.
    pub async fn generate(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<LlmResponse, LlmError> {
        let request = LlmRequest {
            model,
            max_tokens: self.config.max_tokens,
            system,
            messages: vec![LlmMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let wire: LlmWireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Network(format!("malformed LLM response: {e}")))?;

        let text: String = wire
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(LlmResponse {
            text,
            usage: TokenUsage {
                input_tokens: wire.usage.input_tokens,
                output_tokens: wire.usage.output_tokens,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Model selection
// ---------------------------------------------------------------------------

/// Scope-keyed model table, the last resort of model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeModelMap {
    pub small: String,
    pub medium: String,
    pub large: String,
}

impl Default for ScopeModelMap {
    fn default() -> Self {
        Self {
            small: "claude-3-5-haiku-latest".to_owned(),
            medium: "claude-sonnet-4-5".to_owned(),
            large: "claude-opus-4-1".to_owned(),
        }
    }
}

impl ScopeModelMap {
    pub fn for_scope(&self, scope: EstimatedScope) -> &str {
        match scope {
            EstimatedScope::Small => &self.small,
            EstimatedScope::Medium => &self.medium,
            EstimatedScope::Large => &self.large,
        }
    }
}

/// Pick the model for one generation call.
///
/// Precedence: project setting (when present and allow-listed), then the
/// ticket-level override, then the scope table. An empty allow-list
/// permits everything.
pub fn select_model(
    settings: &ProjectSettings,
    ticket: &Ticket,
    allowed: &[String],
    table: &ScopeModelMap,
) -> String {
    if let Some(model) = &settings.worker_model {
        if allowed.is_empty() || allowed.iter().any(|a| a == model) {
            return model.clone();
        }
    }
    if let Some(model) = &ticket.model_override {
        return model.clone();
    }
    table.for_scope(ticket.estimated_scope).to_owned()
}
