//! Context Assembler
//!
//! Bundles everything the engine knows that is relevant to a query — the
//! primary entity with its attributes and interaction stats, related
//! entities, top assertions, open commitments, active goals, and the thread
//! conversation — into one structure plus a readable rendering. The whole
//! assembly runs inside a single read pass for snapshot consistency.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::beliefs::Assertion;
use crate::commitments::Commitment;
use crate::model::{Entity, EntityAttribute, Message};
use crate::storage::{Result, Storage};

/// Default cap on assertions in a bundle
const DEFAULT_MAX_ASSERTIONS: usize = 10;

/// Cap on thread messages in a bundle
const MAX_THREAD_MESSAGES: usize = 20;

// ============================================================================
// TYPES
// ============================================================================

/// What to assemble context for
#[derive(Debug, Clone, Default)]
pub struct AssemblyQuery {
    /// Primary entity by id
    pub entity_id: Option<String>,
    /// Thread to include conversation state from
    pub thread_id: Option<String>,
    /// Cap on assertions (default 10)
    pub max_assertions: Option<usize>,
}

/// The primary entity with its interaction statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryEntity {
    pub entity: Entity,
    pub attributes: Vec<EntityAttribute>,
    /// Strongest explicit relationship edge type, if any
    pub relationship: Option<String>,
    pub last_interaction: Option<DateTime<Utc>>,
    pub interaction_count: i64,
}

/// A goal summary inside a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSummary {
    pub id: String,
    pub description: String,
    pub status: String,
}

/// Assembled context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub primary: Option<PrimaryEntity>,
    pub related_entities: Vec<Entity>,
    pub assertions: Vec<Assertion>,
    pub open_commitments: Vec<Commitment>,
    pub goals: Vec<GoalSummary>,
    pub thread: Vec<Message>,
    /// Wall-clock assembly time
    pub assembled_in_ms: u64,
}

// ============================================================================
// ASSEMBLER
// ============================================================================

/// Builds context bundles over shared storage
#[derive(Clone)]
pub struct ContextAssembler {
    storage: Arc<Storage>,
}

impl ContextAssembler {
    /// Create over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Assemble a bundle for the query
    pub fn assemble(&self, query: &AssemblyQuery) -> Result<ContextBundle> {
        let started = Instant::now();
        let max_assertions = query.max_assertions.unwrap_or(DEFAULT_MAX_ASSERTIONS);

        // One reader pass over everything
        let mut bundle = self.storage.with_reader(|conn| {
            let primary = match query.entity_id {
                Some(ref entity_id) => load_primary(conn, entity_id)?,
                None => None,
            };

            let related_entities = match query.entity_id {
                Some(ref entity_id) => load_related(conn, entity_id)?,
                None => vec![],
            };

            let assertions = match query.entity_id {
                Some(ref entity_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, subject_entity_id, predicate, object_text, object_entity_id,
                                confidence, source_type, source_id, source_timestamp, extracted_at,
                                valid_from, valid_until, supersedes_id, superseded_by_id, context_id
                         FROM assertions
                         WHERE subject_entity_id = ?1 AND superseded_by_id IS NULL
                         ORDER BY confidence DESC, extracted_at DESC
                         LIMIT ?2",
                    )?;
                    stmt.query_map(params![entity_id, max_assertions as i64], Assertion::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => vec![],
            };

            let open_commitments = {
                let mut sql = String::from(
                    "SELECT id, commitment_type, description, owner_entity_id,
                            counterparty_entity_id, due_date, status, source_type, source_id,
                            created_at, completed_at, reminder_sent
                     FROM commitments WHERE status = 'open'",
                );
                if query.entity_id.is_some() {
                    sql.push_str(" AND (owner_entity_id = ?1 OR counterparty_entity_id = ?1)");
                }
                sql.push_str(" ORDER BY due_date IS NULL, due_date ASC");
                let mut stmt = conn.prepare(&sql)?;
                match query.entity_id {
                    Some(ref entity_id) => stmt
                        .query_map([entity_id], Commitment::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                    None => stmt
                        .query_map([], Commitment::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                }
            };

            let goals = {
                let mut stmt = conn.prepare(
                    "SELECT id, description, status, related_entities FROM goals
                     WHERE status = 'active' ORDER BY created_at",
                )?;
                let rows: Vec<(String, String, String, Option<String>)> = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .filter(|(_, _, _, related)| match query.entity_id {
                        Some(ref entity_id) => crate::model::decode_id_list(related.clone())
                            .iter()
                            .any(|e| e == entity_id),
                        None => true,
                    })
                    .map(|(id, description, status, _)| GoalSummary {
                        id,
                        description,
                        status,
                    })
                    .collect()
            };

            let thread = match query.thread_id {
                Some(ref thread_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, source_type, source_id, thread_id, sender_entity_id,
                                recipient_entity_ids, subject, body_text, body_html, timestamp,
                                is_from_user, processed
                         FROM messages WHERE thread_id = ?1
                         ORDER BY timestamp DESC LIMIT ?2",
                    )?;
                    let mut messages = stmt
                        .query_map(params![thread_id, MAX_THREAD_MESSAGES as i64], Message::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    messages.reverse();
                    messages
                }
                None => vec![],
            };

            Ok(ContextBundle {
                primary,
                related_entities,
                assertions,
                open_commitments,
                goals,
                thread,
                assembled_in_ms: 0,
            })
        })?;

        bundle.assembled_in_ms = started.elapsed().as_millis() as u64;
        Ok(bundle)
    }

    /// Render a bundle for a human or a prompt
    pub fn render(&self, bundle: &ContextBundle) -> String {
        let mut out = String::new();

        if let Some(ref primary) = bundle.primary {
            out.push_str(&format!("## {}\n", primary.entity.canonical_name));
            if let Some(ref relationship) = primary.relationship {
                out.push_str(&format!("Relationship: {relationship}\n"));
            }
            out.push_str(&format!(
                "Interactions: {} (last: {})\n",
                primary.interaction_count,
                primary
                    .last_interaction
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into()),
            ));
            for attr in &primary.attributes {
                out.push_str(&format!(
                    "- {}: {}\n",
                    attr.attribute_type, attr.attribute_value
                ));
            }
        }

        if !bundle.assertions.is_empty() {
            out.push_str("\n### Known facts\n");
            for assertion in &bundle.assertions {
                let object = assertion
                    .object_text
                    .clone()
                    .or_else(|| assertion.object_entity_id.clone())
                    .unwrap_or_default();
                out.push_str(&format!(
                    "- {} {} (confidence {:.2})\n",
                    assertion.predicate, object, assertion.confidence
                ));
            }
        }

        if !bundle.open_commitments.is_empty() {
            out.push_str("\n### Open commitments\n");
            for commitment in &bundle.open_commitments {
                let due = commitment
                    .due_date
                    .map(|d| format!(" (due {})", d.format("%Y-%m-%d")))
                    .unwrap_or_default();
                out.push_str(&format!("- {}{due}\n", commitment.description));
            }
        }

        if !bundle.goals.is_empty() {
            out.push_str("\n### Active goals\n");
            for goal in &bundle.goals {
                out.push_str(&format!("- {}\n", goal.description));
            }
        }

        if !bundle.thread.is_empty() {
            out.push_str("\n### Conversation\n");
            for message in &bundle.thread {
                let who = if message.is_from_user { "me" } else { "them" };
                out.push_str(&format!("[{who}] {}\n", message.body_text));
            }
        }

        out
    }
}

fn load_primary(
    conn: &rusqlite::Connection,
    entity_id: &str,
) -> rusqlite::Result<Option<PrimaryEntity>> {
    let entity = conn
        .query_row(
            "SELECT id, canonical_name, entity_type, created_at, updated_at, merge_history
             FROM entities WHERE id = ?1",
            [entity_id],
            Entity::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some(entity) = entity else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, entity_id, attribute_type, attribute_value, confidence,
                source_assertion_id, created_at
         FROM entity_attributes WHERE entity_id = ?1 ORDER BY attribute_type",
    )?;
    let attributes = stmt
        .query_map([entity_id], EntityAttribute::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // Strongest non-communication edge names the relationship
    let relationship: Option<String> = conn
        .query_row(
            "SELECT edge_type FROM graph_edges
             WHERE (from_entity_id = ?1 OR to_entity_id = ?1)
               AND edge_type != 'communicates_with'
             ORDER BY strength DESC LIMIT 1",
            [entity_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let needle = format!("%\"{entity_id}\"%");
    let (interaction_count, last_interaction): (i64, Option<DateTime<Utc>>) = conn.query_row(
        "SELECT COUNT(*), MAX(timestamp) FROM messages
         WHERE sender_entity_id = ?1 OR recipient_entity_ids LIKE ?2",
        params![entity_id, needle],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(Some(PrimaryEntity {
        entity,
        attributes,
        relationship,
        last_interaction,
        interaction_count,
    }))
}

fn load_related(conn: &rusqlite::Connection, entity_id: &str) -> rusqlite::Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.canonical_name, e.entity_type, e.created_at, e.updated_at,
                e.merge_history
         FROM graph_edges g
         JOIN entities e ON e.id = CASE
             WHEN g.from_entity_id = ?1 THEN g.to_entity_id
             ELSE g.from_entity_id
         END
         WHERE g.from_entity_id = ?1 OR g.to_entity_id = ?1
         ORDER BY g.strength DESC LIMIT 10",
    )?;
    stmt.query_map([entity_id], Entity::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beliefs::{AssertionInput, BeliefStore};
    use crate::commitments::{CommitmentInput, CommitmentTracker, CommitmentType};
    use crate::graph::EntityGraph;
    use crate::model::EntityType;

    fn setup() -> (Arc<Storage>, EntityGraph, String) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        let jane = graph
            .create_entity(
                "Jane Porter",
                EntityType::Person,
                &[("email", "jane@acme.example")],
            )
            .unwrap();
        (storage, graph, jane.id)
    }

    #[test]
    fn test_assemble_primary_with_stats() {
        let (storage, graph, jane_id) = setup();
        let sam = graph.create_entity("Sam", EntityType::Person, &[]).unwrap();
        graph.assert_edge(&jane_id, &sam.id, "works_with", 0.8).unwrap();

        storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO messages
                        (id, source_type, source_id, sender_entity_id, body_text, timestamp)
                     VALUES ('m1', 'gmail', 'g-1', ?1, 'hi', ?2)",
                    params![jane_id, crate::model::db_now()],
                )?;
                Ok(())
            })
            .unwrap();

        let assembler = ContextAssembler::new(storage);
        let bundle = assembler
            .assemble(&AssemblyQuery {
                entity_id: Some(jane_id.clone()),
                ..Default::default()
            })
            .unwrap();

        let primary = bundle.primary.unwrap();
        assert_eq!(primary.entity.canonical_name, "Jane Porter");
        assert_eq!(primary.interaction_count, 1);
        assert!(primary.last_interaction.is_some());
        assert_eq!(primary.relationship.as_deref(), Some("works_with"));
        assert_eq!(bundle.related_entities.len(), 1);
        assert_eq!(bundle.related_entities[0].canonical_name, "Sam");
    }

    #[test]
    fn test_assertions_ordered_by_confidence() {
        let (storage, _, jane_id) = setup();
        let beliefs = BeliefStore::new(Arc::clone(&storage));
        for (object, confidence) in [("runner", 0.4), ("climber", 0.9)] {
            beliefs
                .record(AssertionInput {
                    subject_entity_id: Some(jane_id.clone()),
                    predicate: "hobby".into(),
                    object_text: Some(object.into()),
                    confidence: Some(confidence),
                    source_type: "test".into(),
                    source_id: "t".into(),
                    ..Default::default()
                })
                .unwrap();
        }

        let assembler = ContextAssembler::new(storage);
        let bundle = assembler
            .assemble(&AssemblyQuery {
                entity_id: Some(jane_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(bundle.assertions.len(), 2);
        assert_eq!(bundle.assertions[0].object_text.as_deref(), Some("climber"));
    }

    #[test]
    fn test_thread_in_order_and_render() {
        let (storage, _, jane_id) = setup();
        let commitments = CommitmentTracker::new(Arc::clone(&storage));
        commitments
            .create(CommitmentInput {
                commitment_type: CommitmentType::Promise,
                description: "send the deck".into(),
                owner_entity_id: None,
                counterparty_entity_id: Some(jane_id.clone()),
                due_date: Some(Utc::now() + chrono::Duration::days(1)),
                source_type: None,
                source_id: None,
            })
            .unwrap();

        storage
            .with_tx(|tx| {
                for (i, (body, from_user)) in
                    [("question?", false), ("answer.", true)].iter().enumerate()
                {
                    tx.execute(
                        "INSERT INTO messages
                            (id, source_type, source_id, thread_id, body_text, timestamp,
                             is_from_user)
                         VALUES (?1, 'gmail', ?2, 'th-9', ?3, ?4, ?5)",
                        params![
                            format!("m{i}"),
                            format!("g-{i}"),
                            body,
                            crate::model::db_time(
                                Utc::now() + chrono::Duration::seconds(i as i64)
                            ),
                            from_user,
                        ],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let assembler = ContextAssembler::new(storage);
        let bundle = assembler
            .assemble(&AssemblyQuery {
                entity_id: Some(jane_id),
                thread_id: Some("th-9".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(bundle.thread.len(), 2);
        assert!(!bundle.thread[0].is_from_user);
        assert_eq!(bundle.open_commitments.len(), 1);

        let rendered = assembler.render(&bundle);
        assert!(rendered.contains("Jane Porter"));
        assert!(rendered.contains("send the deck"));
        assert!(rendered.contains("[them] question?"));
        assert!(rendered.contains("[me] answer."));
    }

    #[test]
    fn test_empty_query_yields_global_view() {
        let (storage, _, _) = setup();
        let assembler = ContextAssembler::new(storage);
        let bundle = assembler.assemble(&AssemblyQuery::default()).unwrap();
        assert!(bundle.primary.is_none());
        assert!(bundle.assertions.is_empty());
    }
}
