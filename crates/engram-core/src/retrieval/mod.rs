//! Hybrid Retrieval
//!
//! Three primitive searches (keyword over messages/entities/assertions,
//! vector over message embeddings, graph walk for possessive queries) fused
//! with Reciprocal Rank Fusion and filtered through the viewer's context
//! visibility. The primitives are read-only; fusion is deterministic given
//! their outputs.

pub mod graph;
pub mod keyword;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ContextManager;
use crate::external::EmbeddingClient;
use crate::storage::{Result, Storage, StorageError};
use crate::vector::{VectorFilters, VectorStore};

pub use graph::{graph_walk, parse_possessive};
pub use keyword::{sanitize_fts5_query, search_assertions, search_entities, search_messages};

// ============================================================================
// TYPES
// ============================================================================

/// Default RRF constant
pub const RRF_K: f64 = 60.0;

/// What kind of record a hit points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Message,
    Entity,
    Assertion,
}

/// One ranked result from a primitive search or the fused output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub kind: ResultKind,
    pub id: String,
    pub score: f64,
    /// Display text; fusion keeps the earliest-appearing highlight per
    /// `(kind, id)`
    pub highlight: String,
}

/// Options steering a hybrid search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// Viewer's active context for visibility filtering; None skips the
    /// filter
    pub viewer_context: Option<String>,
    /// Let graph walks pull recent messages of found entities
    pub include_graph_messages: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            viewer_context: None,
            include_graph_messages: false,
        }
    }
}

// ============================================================================
// FUSION
// ============================================================================

/// Reciprocal Rank Fusion across ranked lists.
///
/// Each result contributes `1 / (k + rank + 1)` per list it appears in
/// (rank is zero-based). Results are deduplicated by `(kind, id)` keeping
/// the earliest-appearing highlight, and sorted by fused score descending.
pub fn reciprocal_rank_fusion(lists: &[Vec<SearchHit>], k: f64) -> Vec<SearchHit> {
    let mut fused: HashMap<(ResultKind, String), (f64, usize, String)> = HashMap::new();
    let mut order = 0usize;

    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);
            let key = (hit.kind, hit.id.clone());
            match fused.get_mut(&key) {
                Some((score, _, _)) => *score += contribution,
                None => {
                    fused.insert(key, (contribution, order, hit.highlight.clone()));
                    order += 1;
                }
            }
        }
    }

    let mut results: Vec<((ResultKind, String), (f64, usize, String))> =
        fused.into_iter().collect();
    // Score descending; first-seen order breaks exact ties deterministically
    results.sort_by(|a, b| {
        b.1 .0
            .partial_cmp(&a.1 .0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1 .1.cmp(&b.1 .1))
    });

    results
        .into_iter()
        .map(|((kind, id), (score, _, highlight))| SearchHit {
            kind,
            id,
            score,
            highlight,
        })
        .collect()
}

// ============================================================================
// ENGINE
// ============================================================================

/// Hybrid search over all primitives
pub struct RetrievalEngine {
    storage: Arc<Storage>,
    vectors: Arc<dyn VectorStore>,
    embedding: Option<EmbeddingClient>,
    contexts: ContextManager,
}

impl RetrievalEngine {
    /// Create over shared storage and the vector backend
    pub fn new(
        storage: Arc<Storage>,
        vectors: Arc<dyn VectorStore>,
        embedding: Option<EmbeddingClient>,
    ) -> Self {
        let contexts = ContextManager::new(Arc::clone(&storage));
        Self {
            storage,
            vectors,
            embedding,
            contexts,
        }
    }

    /// Run every applicable primitive, fuse, and filter.
    ///
    /// The vector primitive runs only when an embedding client is
    /// configured; an embedding failure logs and degrades to the remaining
    /// primitives rather than failing the search.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        // Over-fetch per source so fusion has overlap to work with
        let source_limit = options.limit * 2;

        let mut lists: Vec<Vec<SearchHit>> = vec![
            keyword::search_messages(&self.storage, query, source_limit)?,
            keyword::search_entities(&self.storage, query, source_limit)?,
            keyword::search_assertions(&self.storage, query, source_limit)?,
            graph::graph_walk(
                &self.storage,
                query,
                options.include_graph_messages,
                source_limit,
            )?,
        ];

        if let Some(ref embedding) = self.embedding {
            match embedding.embed(query).await {
                Ok(vector) => {
                    let hits = self
                        .vectors
                        .search(
                            &vector,
                            source_limit,
                            &VectorFilters {
                                source_type: Some("message".into()),
                            },
                        )
                        .map_err(|e| StorageError::InvalidInput(e.to_string()));
                    match hits {
                        Ok(hits) => lists.push(
                            hits.into_iter()
                                .map(|hit| SearchHit {
                                    kind: ResultKind::Message,
                                    id: hit.source_id,
                                    score: hit.score as f64,
                                    highlight: hit.text.unwrap_or_default(),
                                })
                                .collect(),
                        ),
                        Err(e) => tracing::warn!("vector search failed: {e}"),
                    }
                }
                Err(e) => tracing::warn!("query embedding failed, keyword-only search: {e}"),
            }
        }

        let mut fused = reciprocal_rank_fusion(&lists, RRF_K);

        if let Some(ref viewer) = options.viewer_context {
            fused = self.filter_visible(viewer, fused)?;
        }

        fused.truncate(options.limit);
        Ok(fused)
    }

    /// Drop hits the viewer's context may not see.
    ///
    /// Assertions honor their visibility scope (`private` stays inside its
    /// own context, `context_only` follows the policy map, `global` is
    /// unrestricted). Entities survive when any of their context
    /// memberships is visible; membership-free records are visible to all.
    fn filter_visible(&self, viewer: &str, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>> {
        let graph = crate::graph::EntityGraph::new(Arc::clone(&self.storage));
        let mut kept = Vec::with_capacity(hits.len());

        for hit in hits {
            let visible = match hit.kind {
                ResultKind::Message => true,
                ResultKind::Entity => {
                    let memberships = graph.context_memberships(&hit.id)?;
                    if memberships.is_empty() {
                        true
                    } else {
                        let mut any = false;
                        for membership in &memberships {
                            if self.contexts.can_see_context(viewer, membership)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                }
                ResultKind::Assertion => self.assertion_visible(viewer, &hit.id)?,
            };
            if visible {
                kept.push(hit);
            }
        }
        Ok(kept)
    }

    fn assertion_visible(&self, viewer: &str, assertion_id: &str) -> Result<bool> {
        let row: Option<(Option<String>, Option<String>)> = self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT a.context_id, v.visibility_scope
                 FROM assertions a
                 LEFT JOIN assertion_visibility v ON v.assertion_id = a.id
                 WHERE a.id = ?1",
                [assertion_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })?;

        let Some((context_id, scope)) = row else {
            return Ok(false);
        };
        // No context attached: visible everywhere
        let Some(context_id) = context_id else {
            return Ok(true);
        };

        match scope.as_deref() {
            Some("private") => Ok(viewer == context_id),
            Some("context_only") => self.contexts.can_see_context(viewer, &context_id),
            // 'global' and unset both mean unrestricted
            _ => Ok(true),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(kind: ResultKind, id: &str) -> SearchHit {
        SearchHit {
            kind,
            id: id.to_string(),
            score: 1.0,
            highlight: format!("hl-{id}"),
        }
    }

    #[test]
    fn test_rrf_reference_ordering() {
        // Lists [a, b, c] and [b, d, c] with k = 60: fused order must be
        // b, c, a, d
        let lists = vec![
            vec![
                hit(ResultKind::Message, "a"),
                hit(ResultKind::Message, "b"),
                hit(ResultKind::Message, "c"),
            ],
            vec![
                hit(ResultKind::Message, "b"),
                hit(ResultKind::Message, "d"),
                hit(ResultKind::Message, "c"),
            ],
        ];

        let fused = reciprocal_rank_fusion(&lists, 60.0);
        let order: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a", "d"]);

        // b: rank 1 in the first list, rank 0 in the second
        let expected_b = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected_b).abs() < 1e-12);
        // c: rank 2 in both
        let expected_c = 2.0 / 63.0;
        assert!((fused[1].score - expected_c).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_dedup_keeps_earliest_highlight() {
        let mut renamed = hit(ResultKind::Entity, "e1");
        renamed.highlight = "from list two".into();
        let lists = vec![vec![hit(ResultKind::Entity, "e1")], vec![renamed]];

        let fused = reciprocal_rank_fusion(&lists, 60.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].highlight, "hl-e1");
    }

    #[test]
    fn test_rrf_distinguishes_kinds() {
        // The same id under different kinds is two results
        let lists = vec![vec![hit(ResultKind::Entity, "x"), hit(ResultKind::Message, "x")]];
        let fused = reciprocal_rank_fusion(&lists, 60.0);
        assert_eq!(fused.len(), 2);
    }

    #[tokio::test]
    async fn test_search_fuses_and_filters() {
        use crate::context::ContextBoundary;
        use crate::model::EntityType;

        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = crate::graph::EntityGraph::new(Arc::clone(&storage));
        let contexts = ContextManager::new(Arc::clone(&storage));
        contexts.upsert_boundary(&ContextBoundary::named("work")).unwrap();
        contexts
            .upsert_boundary(&ContextBoundary::named("personal"))
            .unwrap();

        let work_person = graph
            .create_entity("Morgan Reyes", EntityType::Person, &[])
            .unwrap();
        graph.add_context_membership(&work_person.id, "work").unwrap();
        let personal_person = graph
            .create_entity("Morgan Lee", EntityType::Person, &[])
            .unwrap();
        graph
            .add_context_membership(&personal_person.id, "personal")
            .unwrap();

        let vectors = crate::vector::open_vector_store(Arc::clone(&storage), None, 8);
        let engine = RetrievalEngine::new(Arc::clone(&storage), vectors, None);

        // Unfiltered: both Morgans
        let all = engine
            .search("Morgan", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // Work viewer: the personal Morgan is filtered out
        let work_only = engine
            .search(
                "Morgan",
                &SearchOptions {
                    viewer_context: Some("work".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(work_only.len(), 1);
        assert_eq!(work_only[0].id, work_person.id);
    }
}
