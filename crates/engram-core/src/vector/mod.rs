//! Vector Index
//!
//! Cosine-similarity search over message embeddings. Two backends implement
//! one [`VectorStore`] contract:
//!
//! - [`persistent::PersistentVectorStore`] — USearch HNSW index saved under
//!   the configured directory (feature `vector-search`)
//! - [`memory::InMemoryVectorStore`] — brute-force scan, used when no
//!   directory is configured or the persistent backend is unavailable
//!
//! Raw embeddings are persisted as f32-LE blobs in the `vector_rows` table,
//! so either backend can rebuild itself from the database at startup.

pub mod memory;

#[cfg(feature = "vector-search")]
pub mod persistent;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::Storage;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    /// Underlying relational storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    /// Vector has the wrong number of dimensions
    #[error("Invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
    /// Index-level failure (create/add/search/persist)
    #[error("Index error: {0}")]
    Index(String),
}

/// Vector store result type
pub type Result<T> = std::result::Result<T, VectorStoreError>;

// ============================================================================
// CONTRACT
// ============================================================================

/// A search hit from the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorHit {
    /// Row id in `vector_rows`
    pub id: String,
    /// Source table/kind of the embedded item
    pub source_type: String,
    /// Id within the source
    pub source_id: String,
    /// Embedded text, if stored
    pub text: Option<String>,
    /// Opaque metadata JSON, if stored
    pub metadata: Option<serde_json::Value>,
    /// Cosine similarity to the query in [-1, 1]
    pub score: f32,
}

/// Filters applied to a vector search
#[derive(Debug, Clone, Default)]
pub struct VectorFilters {
    /// Restrict hits to one source type
    pub source_type: Option<String>,
}

/// Contract shared by the persistent index and the in-memory fallback
pub trait VectorStore: Send + Sync {
    /// Store (or replace) the vector for `(source_type, source_id)`.
    /// Returns the row id.
    fn store(
        &self,
        source_id: &str,
        source_type: &str,
        vector: &[f32],
        text: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String>;

    /// Rank the `limit` nearest rows by cosine similarity
    fn search(&self, query: &[f32], limit: usize, filters: &VectorFilters)
    -> Result<Vec<VectorHit>>;

    /// Delete by row id. Returns true when a row was removed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Delete by source key. Returns true when a row was removed.
    fn delete_by_source(&self, source_type: &str, source_id: &str) -> Result<bool>;

    /// Number of stored vectors
    fn count_rows(&self) -> Result<usize>;

    /// Flush index state to disk, if the backend persists anything
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// EMBEDDING ENCODING
// ============================================================================

/// Encode an embedding as little-endian f32 bytes for blob storage
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode an embedding from little-endian f32 bytes.
/// Returns None when the blob length is not a multiple of 4.
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Open the best available vector store.
///
/// With a configured directory and the `vector-search` feature, this is the
/// persistent HNSW backend; a persistent open failure logs and falls back to
/// the in-memory store so retrieval keeps working.
pub fn open_vector_store(
    storage: Arc<Storage>,
    vector_db_path: Option<&Path>,
    dimensions: usize,
) -> Arc<dyn VectorStore> {
    #[cfg(feature = "vector-search")]
    if let Some(dir) = vector_db_path {
        match persistent::PersistentVectorStore::open(Arc::clone(&storage), dir, dimensions) {
            Ok(store) => return Arc::new(store),
            Err(e) => {
                tracing::warn!(
                    "persistent vector store unavailable ({e}), using in-memory fallback"
                );
            }
        }
    }

    #[cfg(not(feature = "vector-search"))]
    if vector_db_path.is_some() {
        tracing::warn!(
            "vector_db_path configured but the vector-search feature is disabled; \
             using in-memory fallback"
        );
    }

    Arc::new(memory::InMemoryVectorStore::open(storage, dimensions))
}

// ============================================================================
// TESTS
// ============================================================================
