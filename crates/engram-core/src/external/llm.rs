//! LLM Endpoint Client
//!
//! Plain text-in / text-out. Strictly optional: no engine operation requires
//! it, and every caller has a no-LLM fallback path.

use std::time::Duration;

use super::{classify_reqwest_error, ExternalError, Result};

/// Default request timeout; tiebreak prompts are short but generation is slow
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the optional LLM endpoint
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl LlmClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a prompt, returning the raw completion text
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(prompt.to_string())
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExternalError::Unavailable(format!(
                "llm endpoint returned {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ExternalError::BadResponse(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
