//! Graph-Walk Search
//!
//! Answers possessive queries ("Jane's boss", "Sam's wife") by fuzzy-finding
//! the owner entity, mapping the relation word to edge types, and walking
//! the graph one hop. Optionally pulls recent messages involving the found
//! entities.

use std::sync::Arc;

use rusqlite::params;

use super::{ResultKind, SearchHit};
use crate::graph::EntityGraph;
use crate::matcher;
use crate::storage::{Result, Storage};

/// Fuzzy threshold for recognizing the owner entity
const OWNER_MATCH_MIN: f64 = 0.7;

/// Relation word to edge types. The first matching edge type wins; family
/// words map to both the generic and specific edges.
fn relation_edge_types(relation: &str) -> Vec<&'static str> {
    match relation {
        "boss" | "manager" => vec!["reports_to"],
        "report" | "reports" => vec!["manages", "reports_to"],
        "wife" | "husband" | "spouse" | "partner" => vec!["spouse", "family"],
        "mom" | "mother" | "dad" | "father" | "brother" | "sister" | "son" | "daughter"
        | "family" => vec!["family"],
        "coworker" | "colleague" | "team" | "teammate" => vec!["works_with"],
        "friend" | "friends" => vec!["friend", "communicates_with"],
        _ => vec![],
    }
}

/// Parse "X's Y" / "X’s Y" into `(owner, relation)`
pub fn parse_possessive(query: &str) -> Option<(String, String)> {
    let normalized = query.replace('\u{2019}', "'");
    let idx = normalized.find("'s ")?;
    let owner = normalized[..idx].trim();
    let relation = normalized[idx + 3..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if owner.is_empty() || relation.is_empty() {
        return None;
    }
    Some((owner.to_string(), relation))
}

/// Run a graph walk for a possessive query. Empty when the query has no
/// possessive shape, the owner is unknown, or the relation maps to nothing.
pub fn graph_walk(
    storage: &Arc<Storage>,
    query: &str,
    include_messages: bool,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let Some((owner_name, relation)) = parse_possessive(query) else {
        return Ok(vec![]);
    };
    let edge_types = relation_edge_types(&relation);
    if edge_types.is_empty() {
        return Ok(vec![]);
    }

    let graph = EntityGraph::new(Arc::clone(storage));

    // Fuzzy-find the owner across all entities
    let mut owner: Option<(String, f64)> = None;
    for entity_type in [
        crate::model::EntityType::Person,
        crate::model::EntityType::Org,
    ] {
        for entity in graph.entities_of_type(entity_type)? {
            let score = matcher::similarity(&owner_name, &entity.canonical_name);
            if score >= OWNER_MATCH_MIN
                && owner.as_ref().is_none_or(|(_, best)| score > *best)
            {
                owner = Some((entity.id.clone(), score));
            }
        }
    }
    let Some((owner_id, owner_score)) = owner else {
        return Ok(vec![]);
    };

    // One hop along the mapped edge types. reports_to is directional
    // (owner -> boss); everything else is symmetric.
    let mut hits = Vec::new();
    for edge in graph.edges_of(&owner_id)? {
        if !edge_types.contains(&edge.edge_type.as_str()) {
            continue;
        }
        let other_id = if edge.from_entity_id == owner_id {
            edge.to_entity_id.clone()
        } else if edge.edge_type == "reports_to" {
            // Incoming reports_to means the owner is the boss, not the
            // other way around
            continue;
        } else {
            edge.from_entity_id.clone()
        };

        if let Some(other) = graph.get_entity(&other_id)? {
            hits.push(SearchHit {
                kind: ResultKind::Entity,
                id: other.id.clone(),
                score: owner_score * edge.strength.max(0.1),
                highlight: other.canonical_name.clone(),
            });

            if include_messages {
                hits.extend(messages_involving(storage, &other_id, 3)?);
            }
        }
        if hits.len() >= limit {
            break;
        }
    }

    hits.truncate(limit);
    Ok(hits)
}

/// Recent messages sent by or to an entity
fn messages_involving(
    storage: &Arc<Storage>,
    entity_id: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let needle = format!("%\"{entity_id}\"%");
    storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, COALESCE(subject, ''), body_text FROM messages
             WHERE sender_entity_id = ?1 OR recipient_entity_ids LIKE ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map(params![entity_id, needle, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, subject, body)| SearchHit {
                kind: ResultKind::Message,
                id,
                score: 0.3,
                highlight: if subject.is_empty() {
                    body.split_whitespace().take(12).collect::<Vec<_>>().join(" ")
                } else {
                    subject
                },
            })
            .collect())
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use crate::storage::Storage;

    #[test]
    fn test_parse_possessive() {
        assert_eq!(
            parse_possessive("Jane's boss"),
            Some(("Jane".into(), "boss".into()))
        );
        assert_eq!(
            parse_possessive("Sam Chen\u{2019}s wife"),
            Some(("Sam Chen".into(), "wife".into()))
        );
        assert_eq!(parse_possessive("no possessive here"), None);
        assert_eq!(parse_possessive("'s orphan"), None);
    }

    #[test]
    fn test_boss_walk_is_directional() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        let jane = graph.create_entity("Jane Porter", EntityType::Person, &[]).unwrap();
        let boss = graph.create_entity("Ada Chen", EntityType::Person, &[]).unwrap();
        let report = graph.create_entity("Leo Park", EntityType::Person, &[]).unwrap();

        // jane reports_to ada; leo reports_to jane
        graph.assert_edge(&jane.id, &boss.id, "reports_to", 0.9).unwrap();
        graph.assert_edge(&report.id, &jane.id, "reports_to", 0.9).unwrap();

        let hits = graph_walk(&storage, "Jane's boss", false, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].highlight, "Ada Chen");
    }

    #[test]
    fn test_family_walk_is_symmetric() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        let sam = graph.create_entity("Sam Chen", EntityType::Person, &[]).unwrap();
        let spouse = graph.create_entity("Riley Chen", EntityType::Person, &[]).unwrap();
        graph.assert_edge(&spouse.id, &sam.id, "family", 0.9).unwrap();

        let hits = graph_walk(&storage, "Sam Chen's wife", false, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].highlight, "Riley Chen");
    }

    #[test]
    fn test_unknown_owner_or_relation_is_empty() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        graph.create_entity("Jane Porter", EntityType::Person, &[]).unwrap();

        assert!(graph_walk(&storage, "Zorblax's boss", false, 10)
            .unwrap()
            .is_empty());
        assert!(graph_walk(&storage, "Jane's flurb", false, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_walk_includes_messages_when_asked() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        let jane = graph.create_entity("Jane Porter", EntityType::Person, &[]).unwrap();
        let boss = graph.create_entity("Ada Chen", EntityType::Person, &[]).unwrap();
        graph.assert_edge(&jane.id, &boss.id, "reports_to", 0.9).unwrap();
        storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO messages
                        (id, source_type, source_id, sender_entity_id, body_text, timestamp)
                     VALUES ('m1', 'gmail', 'g-1', ?1, 'planning sync', ?2)",
                    params![boss.id, crate::model::db_now()],
                )?;
                Ok(())
            })
            .unwrap();

        let hits = graph_walk(&storage, "Jane's boss", true, 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.kind == ResultKind::Message));
    }
}
