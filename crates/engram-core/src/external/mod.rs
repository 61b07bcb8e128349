//! External Endpoints
//!
//! The engine's only network contacts: an embedding endpoint returning
//! vectors and an optional LLM endpoint used for entity tiebreaks. Both are
//! opaque HTTP services; failures degrade to the no-external path and never
//! propagate as engine errors. Calls happen outside of open write
//! transactions and are cancellation-safe (dropping the future aborts the
//! request).

pub mod embedding;
pub mod llm;

pub use embedding::EmbeddingClient;
pub use llm::LlmClient;

/// External endpoint error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    /// Endpoint unreachable or returned a transport-level failure
    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),
    /// Request exceeded the configured timeout
    #[error("Endpoint timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Endpoint replied with something the contract does not allow
    #[error("Bad response: {0}")]
    BadResponse(String),
}

/// External endpoint result type
pub type Result<T> = std::result::Result<T, ExternalError>;

pub(crate) fn classify_reqwest_error(e: reqwest::Error, timeout: std::time::Duration) -> ExternalError {
    if e.is_timeout() {
        ExternalError::Timeout(timeout)
    } else {
        ExternalError::Unavailable(e.to_string())
    }
}
