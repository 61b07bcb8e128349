//! In-Memory Vector Fallback
//!
//! Brute-force cosine scan over vectors held in a HashMap. Used when no
//! vector directory is configured or the persistent backend fails to open.
//! Vectors still round-trip through `vector_rows`, so a later restart with a
//! working persistent backend loses nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::params;
use uuid::Uuid;

use super::{
    cosine_similarity, embedding_from_bytes, embedding_to_bytes, Result, VectorFilters, VectorHit,
    VectorStore, VectorStoreError,
};
use crate::model::db_now;
use crate::storage::Storage;

/// Brute-force in-memory vector store
pub struct InMemoryVectorStore {
    storage: Arc<Storage>,
    dimensions: usize,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl InMemoryVectorStore {
    /// Open the store, preloading any embeddings already persisted in
    /// `vector_rows`. Preload failures are logged, not fatal.
    pub fn open(storage: Arc<Storage>, dimensions: usize) -> Self {
        let mut vectors = HashMap::new();

        let preload = storage.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT id, embedding FROM vector_rows")?;
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        });

        match preload {
            Ok(rows) => {
                for (id, blob) in rows {
                    if let Some(vector) = embedding_from_bytes(&blob) {
                        vectors.insert(id, vector);
                    }
                }
            }
            Err(e) => tracing::warn!("vector preload failed, starting empty: {e}"),
        }

        tracing::debug!(count = vectors.len(), "in-memory vector store loaded");

        Self {
            storage,
            dimensions,
            vectors: Mutex::new(vectors),
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(VectorStoreError::InvalidDimensions {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    fn lock_vectors(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<f32>>>> {
        self.vectors
            .lock()
            .map_err(|_| VectorStoreError::Index("vector map lock poisoned".into()))
    }
}

impl VectorStore for InMemoryVectorStore {
    fn store(
        &self,
        source_id: &str,
        source_type: &str,
        vector: &[f32],
        text: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String> {
        self.check_dimensions(vector)?;

        let blob = embedding_to_bytes(vector);
        let metadata_json = metadata.map(|m| m.to_string());
        let candidate_id = Uuid::new_v4().to_string();

        // Upsert keyed on the source; the row id survives replacement
        let id = self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO vector_rows
                    (id, source_type, source_id, embedding, text, metadata, dimensions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (source_type, source_id) DO UPDATE SET
                    embedding = excluded.embedding,
                    text = excluded.text,
                    metadata = excluded.metadata,
                    dimensions = excluded.dimensions",
                params![
                    candidate_id,
                    source_type,
                    source_id,
                    blob,
                    text,
                    metadata_json,
                    self.dimensions as i64,
                    db_now(),
                ],
            )?;
            let id: String = tx.query_row(
                "SELECT id FROM vector_rows WHERE source_type = ?1 AND source_id = ?2",
                params![source_type, source_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })?;

        self.lock_vectors()?.insert(id.clone(), vector.to_vec());
        Ok(id)
    }

    fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &VectorFilters,
    ) -> Result<Vec<VectorHit>> {
        self.check_dimensions(query)?;

        let mut scored: Vec<(String, f32)> = {
            let vectors = self.lock_vectors()?;
            vectors
                .iter()
                .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
                .collect()
        };
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits = Vec::with_capacity(limit);
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_type, source_id, text, metadata
                 FROM vector_rows WHERE id = ?1",
            )?;
            for (id, score) in scored {
                if hits.len() >= limit {
                    break;
                }
                let row: Option<(String, String, Option<String>, Option<String>)> = stmt
                    .query_row([&id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some((source_type, source_id, text, metadata)) = row else {
                    continue;
                };
                if let Some(ref wanted) = filters.source_type {
                    if &source_type != wanted {
                        continue;
                    }
                }
                hits.push(VectorHit {
                    id,
                    source_type,
                    source_id,
                    text,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    score,
                });
            }
            Ok(())
        })?;

        Ok(hits)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.storage.with_tx(|tx| {
            Ok(tx.execute("DELETE FROM vector_rows WHERE id = ?1", [id])? > 0)
        })?;
        self.lock_vectors()?.remove(id);
        Ok(removed)
    }

    fn delete_by_source(&self, source_type: &str, source_id: &str) -> Result<bool> {
        let id: Option<String> = self.storage.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM vector_rows WHERE source_type = ?1 AND source_id = ?2",
                    params![source_type, source_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
        })?;

        match id {
            Some(id) => self.delete(&id),
            None => Ok(false),
        }
    }

    fn count_rows(&self) -> Result<usize> {
        let count: i64 = self.storage.with_reader(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM vector_rows", [], |row| row.get(0))?)
        })?;
        Ok(count as usize)
    }
}

// ============================================================================
// TESTS
// ============================================================================
