//! Keyword Search Primitives
//!
//! BM25 full-text search over messages plus LIKE-based lookups over entity
//! names/attributes (prefix matches preferred) and assertions. Each primitive
//! returns its own ranked list; fusion happens in the parent module.

use std::sync::Arc;

use rusqlite::params;

use super::{ResultKind, SearchHit};
use crate::storage::{Result, Storage};

/// Sanitize user text for an FTS5 MATCH expression: each token is quoted so
/// query syntax characters cannot break the parse
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            let cleaned: String = token.chars().filter(|c| *c != '"').collect();
            format!("\"{cleaned}\"")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// BM25-ranked message search
pub fn search_messages(storage: &Arc<Storage>, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let sanitized = sanitize_fts5_query(query);
    if sanitized.is_empty() {
        return Ok(vec![]);
    }

    storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT m.id, COALESCE(m.subject, ''), m.body_text, bm25(messages_fts)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.id
             WHERE messages_fts MATCH ?1
             ORDER BY bm25(messages_fts)
             LIMIT ?2",
        )?;
        let rows: Vec<(String, String, String, f64)> = stmt
            .query_map(params![sanitized, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, subject, body, rank)| SearchHit {
                kind: ResultKind::Message,
                id,
                // bm25() returns lower-is-better; negate for a descending
                // score
                score: -rank,
                highlight: if subject.is_empty() {
                    snippet(&body)
                } else {
                    subject
                },
            })
            .collect())
    })
}

/// Entity search over canonical names and attribute values. Name-prefix
/// matches outrank substring matches, which outrank attribute matches.
pub fn search_entities(storage: &Arc<Storage>, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    let prefix = format!("{trimmed}%");
    let contains = format!("%{trimmed}%");

    storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, canonical_name,
                    CASE
                        WHEN canonical_name LIKE ?1 THEN 1.0
                        WHEN canonical_name LIKE ?2 THEN 0.6
                        ELSE 0.5
                    END AS score
             FROM entities
             WHERE canonical_name LIKE ?2
                OR id IN (SELECT entity_id FROM entity_attributes
                          WHERE attribute_value LIKE ?2)
             ORDER BY score DESC, canonical_name
             LIMIT ?3",
        )?;
        let rows: Vec<(String, String, f64)> = stmt
            .query_map(params![prefix, contains, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, name, score)| SearchHit {
                kind: ResultKind::Entity,
                id,
                score,
                highlight: name,
            })
            .collect())
    })
}

/// Assertion search over predicates, literal objects, and subject entity
/// names
pub fn search_assertions(
    storage: &Arc<Storage>,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    let contains = format!("%{trimmed}%");

    storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT a.id, a.predicate, COALESCE(a.object_text, ''), a.confidence,
                    COALESCE(e.canonical_name, '')
             FROM assertions a
             LEFT JOIN entities e ON e.id = a.subject_entity_id
             WHERE a.superseded_by_id IS NULL
               AND (a.predicate LIKE ?1 OR a.object_text LIKE ?1
                    OR e.canonical_name LIKE ?1)
             ORDER BY a.confidence DESC, a.extracted_at DESC
             LIMIT ?2",
        )?;
        let rows: Vec<(String, String, String, f64, String)> = stmt
            .query_map(params![contains, limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, predicate, object, confidence, subject)| SearchHit {
                kind: ResultKind::Assertion,
                id,
                score: confidence,
                highlight: if subject.is_empty() {
                    format!("{predicate} {object}")
                } else {
                    format!("{subject} {predicate} {object}")
                },
            })
            .collect())
    })
}

/// First few words of a body for display
fn snippet(body: &str) -> String {
    let words: Vec<&str> = body.split_whitespace().take(12).collect();
    words.join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::db_now;

    fn storage_with_messages() -> Arc<Storage> {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO messages (id, source_type, source_id, subject, body_text, timestamp)
                     VALUES ('m1', 'gmail', 'g-1', 'Budget review',
                             'the quarterly budget numbers look solid', ?1)",
                    [db_now()],
                )?;
                tx.execute(
                    "INSERT INTO messages (id, source_type, source_id, body_text, timestamp)
                     VALUES ('m2', 'gmail', 'g-2', 'dinner plans on friday', ?1)",
                    [db_now()],
                )?;
                Ok(())
            })
            .unwrap();
        storage
    }

    #[test]
    fn test_sanitize_fts5_query() {
        assert_eq!(sanitize_fts5_query("budget review"), "\"budget\" \"review\"");
        assert_eq!(sanitize_fts5_query("a\"b OR *"), "\"ab\" \"OR\" \"*\"");
        assert_eq!(sanitize_fts5_query("  "), "");
    }

    #[test]
    fn test_message_fts_matches() {
        let storage = storage_with_messages();
        let hits = search_messages(&storage, "budget", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
        assert_eq!(hits[0].kind, ResultKind::Message);
        assert_eq!(hits[0].highlight, "Budget review");

        // Query syntax characters never break the search
        assert!(search_messages(&storage, "budget\" OR 1", 10).is_ok());
    }

    #[test]
    fn test_entity_prefix_preference() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = crate::graph::EntityGraph::new(Arc::clone(&storage));
        graph
            .create_entity("Jane Porter", crate::model::EntityType::Person, &[])
            .unwrap();
        graph
            .create_entity("Mary-Jane Kim", crate::model::EntityType::Person, &[])
            .unwrap();

        let hits = search_entities(&storage, "Jane", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].highlight, "Jane Porter");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_entity_attribute_match() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = crate::graph::EntityGraph::new(Arc::clone(&storage));
        graph
            .create_entity(
                "Jane Porter",
                crate::model::EntityType::Person,
                &[("email", "jp@initech.example")],
            )
            .unwrap();

        let hits = search_entities(&storage, "initech", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].highlight, "Jane Porter");
    }

    #[test]
    fn test_assertion_search() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = crate::graph::EntityGraph::new(Arc::clone(&storage));
        let beliefs = crate::beliefs::BeliefStore::new(Arc::clone(&storage));
        let jane = graph
            .create_entity("Jane Porter", crate::model::EntityType::Person, &[])
            .unwrap();
        beliefs
            .record(crate::beliefs::AssertionInput {
                subject_entity_id: Some(jane.id.clone()),
                predicate: "lives_in".into(),
                object_text: Some("Lisbon".into()),
                source_type: "test".into(),
                source_id: "t1".into(),
                ..Default::default()
            })
            .unwrap();

        let by_object = search_assertions(&storage, "Lisbon", 10).unwrap();
        assert_eq!(by_object.len(), 1);
        assert!(by_object[0].highlight.contains("Jane Porter"));

        let by_subject = search_assertions(&storage, "Porter", 10).unwrap();
        assert_eq!(by_subject.len(), 1);
    }
}
