//! Engine Configuration
//!
//! A flat record handed to [`crate::Engine::init`]. Loading it from disk or
//! environment belongs to the embedding application, not this crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;

/// Default embedding model name sent to the endpoint
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

fn default_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

fn default_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_worker_interval_secs() -> u64 {
    30
}

fn default_worker_batch_size() -> usize {
    50
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Filesystem path of the relational store (required)
    pub db_path: PathBuf,
    /// Directory for the persistent vector index; absent means the
    /// in-memory fallback
    pub vector_db_path: Option<PathBuf>,
    /// Embedding endpoint URL; absent disables embedding entirely
    pub embedding_endpoint: Option<String>,
    /// Model name sent with each embedding request
    #[serde(default = "default_model")]
    pub embedding_model: String,
    /// Expected embedding dimension
    #[serde(default = "default_dimensions")]
    pub embedding_dimensions: usize,
    /// Optional LLM endpoint for entity tiebreaks
    pub llm_endpoint: Option<String>,
    /// The user's own email, for self-detection on ingested messages
    pub user_email: Option<String>,
    /// The user's own phone, for self-detection on ingested messages
    pub user_phone: Option<String>,
    /// Background worker cycle period (seconds)
    #[serde(default = "default_worker_interval_secs")]
    pub worker_interval_secs: u64,
    /// Most messages drained per worker cycle
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,
}

impl EngineConfig {
    /// Minimal config: a database path and defaults for everything else
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            vector_db_path: None,
            embedding_endpoint: None,
            embedding_model: default_model(),
            embedding_dimensions: default_dimensions(),
            llm_endpoint: None,
            user_email: None,
            user_phone: None,
            worker_interval_secs: default_worker_interval_secs(),
            worker_batch_size: default_worker_batch_size(),
        }
    }

    /// Worker interval as a [`Duration`]
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "dbPath": "/tmp/engram.db" }"#).unwrap();
        assert_eq!(config.embedding_dimensions, 768);
        assert_eq!(config.embedding_model, "nomic-embed-text");
        assert_eq!(config.worker_interval_secs, 30);
        assert!(config.vector_db_path.is_none());
        assert!(config.llm_endpoint.is_none());
    }
}
