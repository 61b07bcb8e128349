//! Embedding Endpoint Client
//!
//! `POST {model, prompt}` to the configured URL, expecting
//! `{"embedding": [f32, ...]}`. The dimension is configurable (default 768);
//! a reply with the wrong dimension is a contract violation, not a resize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{classify_reqwest_error, ExternalError, Result};

/// Default embedding dimension
pub const DEFAULT_DIMENSIONS: usize = 768;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for the embedding endpoint
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl EmbeddingClient {
    /// Create a client for `endpoint`, embedding with `model` at
    /// `dimensions`
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dimensions,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expected embedding dimension
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed one prompt. The returned vector always has the configured
    /// dimension.
    pub async fn embed(&self, prompt: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExternalError::Unavailable(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::BadResponse(e.to_string()))?;

        if body.embedding.len() != self.dimensions {
            return Err(ExternalError::BadResponse(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                body.embedding.len()
            )));
        }

        Ok(body.embedding)
    }
}

// ============================================================================
// TESTS
// ============================================================================
