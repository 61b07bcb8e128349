//! Persistent Vector Index
//!
//! USearch HNSW index saved under the configured vector directory with a
//! JSON key-mapping sibling. On open, the saved index is loaded when present;
//! otherwise the index is rebuilt from the embeddings persisted in
//! `vector_rows`, so losing the directory only costs a rebuild.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::params;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};
use uuid::Uuid;

use super::{
    embedding_from_bytes, embedding_to_bytes, Result, VectorFilters, VectorHit, VectorStore,
    VectorStoreError,
};
use crate::model::db_now;
use crate::storage::Storage;

/// HNSW connectivity parameter (higher = better recall, more memory)
const CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
const EXPANSION_SEARCH: usize = 64;

/// Index file name inside the vector directory
const INDEX_FILE: &str = "index.usearch";

/// Key-mapping sibling file name
const MAPPINGS_FILE: &str = "index.mappings.json";

/// Mutable index state guarded by one lock
struct IndexState {
    index: Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl IndexState {
    fn add(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
            self.reserve_for(self.index.size() + 1)?;
            self.index
                .add(existing, vector)
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
            return Ok(());
        }

        // usearch requires reserve() before add() when at capacity
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.reserve_for(std::cmp::max(capacity * 2, 16))?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| VectorStoreError::Index(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        match self.key_to_id.remove(key) {
            Some(id) => {
                self.id_to_key.remove(&id);
                self.index
                    .remove(id)
                    .map_err(|e| VectorStoreError::Index(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn reserve_for(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorStoreError::Index(format!("reserve failed: {e}")))
    }
}

/// HNSW vector store persisted under a directory
pub struct PersistentVectorStore {
    storage: Arc<Storage>,
    dimensions: usize,
    dir: PathBuf,
    state: Mutex<IndexState>,
}

impl PersistentVectorStore {
    /// Open the store, loading the saved index or rebuilding it from
    /// `vector_rows`
    pub fn open(storage: Arc<Storage>, dir: &Path, dimensions: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| VectorStoreError::Index(format!("cannot create {}: {e}", dir.display())))?;

        let index = Self::new_index(dimensions)?;
        let mut state = IndexState {
            index,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        };

        let index_path = dir.join(INDEX_FILE);
        let mappings_path = dir.join(MAPPINGS_FILE);
        let loaded = index_path.exists()
            && mappings_path.exists()
            && Self::try_load(&mut state, &index_path, &mappings_path);

        let store = Self {
            storage,
            dimensions,
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
        };

        if !loaded {
            store.rebuild_from_rows()?;
        }

        Ok(store)
    }

    fn new_index(dimensions: usize) -> Result<Index> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: CONNECTIVITY,
            expansion_add: EXPANSION_ADD,
            expansion_search: EXPANSION_SEARCH,
            multi: false,
        };
        Index::new(&options).map_err(|e| VectorStoreError::Index(e.to_string()))
    }

    /// Best-effort load of a previously saved index; false means rebuild
    fn try_load(state: &mut IndexState, index_path: &Path, mappings_path: &Path) -> bool {
        let Some(path_str) = index_path.to_str() else {
            return false;
        };
        if state.index.load(path_str).is_err() {
            return false;
        }
        let Ok(raw) = std::fs::read_to_string(mappings_path) else {
            return false;
        };
        let Ok(mappings) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return false;
        };
        let Ok(key_to_id) =
            serde_json::from_value::<HashMap<String, u64>>(mappings["key_to_id"].clone())
        else {
            return false;
        };
        let Some(next_id) = mappings["next_id"].as_u64() else {
            return false;
        };

        state.id_to_key = key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();
        state.key_to_id = key_to_id;
        state.next_id = next_id;
        tracing::debug!(count = state.index.size(), "vector index loaded from disk");
        true
    }

    /// Rebuild the index from embeddings persisted in `vector_rows`
    fn rebuild_from_rows(&self) -> Result<()> {
        let rows: Vec<(String, Vec<u8>)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT id, embedding FROM vector_rows")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut state = self.lock_state()?;
        for (id, blob) in rows {
            let Some(vector) = embedding_from_bytes(&blob) else {
                continue;
            };
            if vector.len() != self.dimensions {
                tracing::warn!(
                    id,
                    got = vector.len(),
                    expected = self.dimensions,
                    "skipping embedding with stale dimensions"
                );
                continue;
            }
            if let Err(e) = state.add(&id, &vector) {
                tracing::warn!("failed to load embedding for {id}: {e}");
            }
        }
        tracing::debug!(count = state.index.size(), "vector index rebuilt from rows");
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, IndexState>> {
        self.state
            .lock()
            .map_err(|_| VectorStoreError::Index("index lock poisoned".into()))
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
}

impl VectorStore for PersistentVectorStore {
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

        self.lock_state()?.add(&id, vector)?;
        Ok(id)
    }

    fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &VectorFilters,
    ) -> Result<Vec<VectorHit>> {
        self.check_dimensions(query)?;

        // Over-fetch so source-type filtering can still fill the limit
        let fetch = if filters.source_type.is_some() {
            limit * 4
        } else {
            limit
        };

        let scored: Vec<(String, f32)> = {
            let state = self.lock_state()?;
            if state.index.size() == 0 {
                return Ok(vec![]);
            }
            let results = state
                .index
                .search(query, fetch)
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
            results
                .keys
                .iter()
                .zip(results.distances.iter())
                .filter_map(|(key, distance)| {
                    state
                        .id_to_key
                        .get(key)
                        // Cosine distance -> similarity
                        .map(|id| (id.clone(), 1.0 - distance))
                })
                .collect()
        };

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
        self.lock_state()?.remove(id)?;
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

    fn persist(&self) -> Result<()> {
        let state = self.lock_state()?;
        let index_path = self.dir.join(INDEX_FILE);
        let path_str = index_path
            .to_str()
            .ok_or_else(|| VectorStoreError::Index("invalid index path".into()))?;

        state
            .index
            .save(path_str)
            .map_err(|e| VectorStoreError::Index(e.to_string()))?;

        let mappings = serde_json::json!({
            "key_to_id": state.key_to_id,
            "next_id": state.next_id,
        });
        std::fs::write(self.dir.join(MAPPINGS_FILE), mappings.to_string())
            .map_err(|e| VectorStoreError::Index(e.to_string()))?;

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
