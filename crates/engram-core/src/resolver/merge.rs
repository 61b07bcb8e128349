//! Entity Merge
//!
//! Folds one entity into another inside a single transaction: attributes,
//! edges (both directions), assertions (subject and object), messages,
//! commitments, and context memberships all move to the kept entity; the
//! absorbed canonical name survives as an alias; the absorbed row is deleted
//! last. Uniqueness collisions while moving rows are silently dropped. A
//! merge never leaves a dangling foreign key, and the absorbed id is recorded
//! in the kept entity's merge history so the operation is auditable and
//! reversible from provenance.

use rusqlite::params;

use crate::graph::{insert_attribute_tx, EntityGraph};
use crate::model::{db_now, decode_id_list, encode_id_list, Entity};
use crate::storage::{Result, StorageError};

/// Merge `merge_id` into `keep_id`, returning the updated kept entity
pub fn merge_entities(graph: &EntityGraph, keep_id: &str, merge_id: &str) -> Result<Entity> {
    if keep_id == merge_id {
        return Err(StorageError::InvalidInput(
            "cannot merge an entity into itself".into(),
        ));
    }

    let keep = graph
        .get_entity(keep_id)?
        .ok_or_else(|| StorageError::NotFound(format!("keep entity {keep_id}")))?;
    let absorbed = graph
        .get_entity(merge_id)?
        .ok_or_else(|| StorageError::NotFound(format!("merge entity {merge_id}")))?;

    graph.storage().with_tx(|tx| {
        let now = db_now();

        // Merge history: the absorbed entity's own history folds in, then
        // the absorbed id itself
        let mut history = keep.merge_history.clone();
        history.extend(absorbed.merge_history.iter().cloned());
        history.push(merge_id.to_string());
        tx.execute(
            "UPDATE entities SET merge_history = ?1, updated_at = ?2 WHERE id = ?3",
            params![encode_id_list(&history), now, keep_id],
        )?;

        // Attributes: move what fits, drop uniqueness collisions
        tx.execute(
            "UPDATE OR IGNORE entity_attributes SET entity_id = ?1 WHERE entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "DELETE FROM entity_attributes WHERE entity_id = ?1",
            [merge_id],
        )?;

        // Edges, both directions. Rows that would collide with an existing
        // (from, to, type) edge or become self-loops are dropped.
        tx.execute(
            "UPDATE OR IGNORE graph_edges SET from_entity_id = ?1 WHERE from_entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "UPDATE OR IGNORE graph_edges SET to_entity_id = ?1 WHERE to_entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "DELETE FROM graph_edges
             WHERE from_entity_id = ?1 OR to_entity_id = ?1
                OR (from_entity_id = ?2 AND to_entity_id = ?2)",
            params![merge_id, keep_id],
        )?;

        // Assertions reference the entity as subject or object
        tx.execute(
            "UPDATE assertions SET subject_entity_id = ?1 WHERE subject_entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "UPDATE assertions SET object_entity_id = ?1 WHERE object_entity_id = ?2",
            params![keep_id, merge_id],
        )?;

        // Messages: sender column plus the recipient id list
        tx.execute(
            "UPDATE messages SET sender_entity_id = ?1 WHERE sender_entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        rewrite_recipient_lists(tx, keep_id, merge_id)?;

        // Commitments hold plain foreign keys to entities
        tx.execute(
            "UPDATE commitments SET owner_entity_id = ?1 WHERE owner_entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "UPDATE commitments SET counterparty_entity_id = ?1 WHERE counterparty_entity_id = ?2",
            params![keep_id, merge_id],
        )?;

        // Context memberships and recipient style rows; collisions keep the
        // kept entity's row
        tx.execute(
            "UPDATE OR IGNORE entity_contexts SET entity_id = ?1 WHERE entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "UPDATE OR IGNORE recipient_style_profiles SET entity_id = ?1 WHERE entity_id = ?2",
            params![keep_id, merge_id],
        )?;
        tx.execute(
            "UPDATE engagement_events SET recipient_entity_id = ?1 WHERE recipient_entity_id = ?2",
            params![keep_id, merge_id],
        )?;

        // The absorbed name lives on as an alias of the kept entity
        insert_attribute_tx(tx, keep_id, "alias", &absorbed.canonical_name, 1.0, None)?;

        // Delete the absorbed entity last; remaining dependent rows
        // (context memberships, style rows that collided) cascade
        tx.execute("DELETE FROM entities WHERE id = ?1", [merge_id])?;

        Ok(())
    })?;

    graph
        .get_entity(keep_id)?
        .ok_or_else(|| StorageError::NotFound(keep_id.to_string()))
}

/// Replace `merge_id` with `keep_id` inside message recipient JSON lists
fn rewrite_recipient_lists(
    tx: &rusqlite::Transaction<'_>,
    keep_id: &str,
    merge_id: &str,
) -> Result<()> {
    let needle = format!("%\"{merge_id}\"%");
    let rows: Vec<(String, Option<String>)> = {
        let mut stmt = tx.prepare(
            "SELECT id, recipient_entity_ids FROM messages WHERE recipient_entity_ids LIKE ?1",
        )?;
        stmt.query_map([&needle], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (message_id, raw) in rows {
        let mut ids = decode_id_list(raw);
        let mut changed = false;
        for id in ids.iter_mut() {
            if id == merge_id {
                *id = keep_id.to_string();
                changed = true;
            }
        }
        if changed {
            ids.dedup();
            tx.execute(
                "UPDATE messages SET recipient_entity_ids = ?1 WHERE id = ?2",
                params![encode_id_list(&ids), message_id],
            )?;
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn graph() -> EntityGraph {
        EntityGraph::new(Arc::new(Storage::open_in_memory().unwrap()))
    }

    #[test]
    fn test_merge_moves_attributes_and_records_history() {
        let graph = graph();
        let keep = graph
            .create_entity(
                "Jacob Miller",
                EntityType::Person,
                &[("email", "jake@co.example")],
            )
            .unwrap();
        let merge = graph
            .create_entity(
                "Jake Miller",
                EntityType::Person,
                &[("email", "jake@co.example"), ("phone", "5550100199")],
            )
            .unwrap();

        let merged = merge_entities(&graph, &keep.id, &merge.id).unwrap();

        assert_eq!(merged.merge_history, vec![merge.id.clone()]);
        assert!(graph.get_entity(&merge.id).unwrap().is_none());

        // Attribute count equals the union: email (deduped), phone, alias
        let attrs = graph.attributes(&keep.id).unwrap();
        let types: Vec<&str> = attrs.iter().map(|a| a.attribute_type.as_str()).collect();
        assert_eq!(attrs.len(), 3);
        assert!(types.contains(&"email"));
        assert!(types.contains(&"phone"));
        assert!(types.contains(&"alias"));
    }

    #[test]
    fn test_merge_moves_edges_without_self_loops() {
        let graph = graph();
        let keep = graph.create_entity("Keep", EntityType::Person, &[]).unwrap();
        let merge = graph.create_entity("Merge", EntityType::Person, &[]).unwrap();
        let other = graph.create_entity("Other", EntityType::Person, &[]).unwrap();

        // merge <-> other, plus keep <-> merge (becomes a self-loop and must
        // be dropped)
        graph
            .record_edge_evidence(&merge.id, &other.id, "communicates_with")
            .unwrap();
        graph
            .record_edge_evidence(&keep.id, &merge.id, "communicates_with")
            .unwrap();

        merge_entities(&graph, &keep.id, &merge.id).unwrap();

        let edges = graph.edges_of(&keep.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].from_entity_id != edges[0].to_entity_id);
    }

    #[test]
    fn test_merge_transitive_history() {
        let graph = graph();
        let a = graph.create_entity("A", EntityType::Person, &[]).unwrap();
        let b = graph.create_entity("B", EntityType::Person, &[]).unwrap();
        let c = graph.create_entity("C", EntityType::Person, &[]).unwrap();

        merge_entities(&graph, &b.id, &c.id).unwrap();
        let merged = merge_entities(&graph, &a.id, &b.id).unwrap();

        // A absorbed B which had absorbed C: both ids appear, C before B
        assert_eq!(merged.merge_history, vec![c.id.clone(), b.id.clone()]);
        assert!(graph.get_entity(&b.id).unwrap().is_none());
        assert!(graph.get_entity(&c.id).unwrap().is_none());
    }

    #[test]
    fn test_merge_rewrites_message_recipients() {
        let graph = graph();
        let keep = graph.create_entity("Keep", EntityType::Person, &[]).unwrap();
        let merge = graph.create_entity("Merge", EntityType::Person, &[]).unwrap();

        graph
            .storage()
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO messages
                        (id, source_type, source_id, sender_entity_id, recipient_entity_ids,
                         body_text, timestamp)
                     VALUES ('m1', 'gmail', 'g-1', ?1, ?2, 'hi', ?3)",
                    params![
                        merge.id,
                        encode_id_list(&[merge.id.clone()]),
                        db_now()
                    ],
                )?;
                Ok(())
            })
            .unwrap();

        merge_entities(&graph, &keep.id, &merge.id).unwrap();

        let (sender, recipients): (String, String) = graph
            .storage()
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT sender_entity_id, recipient_entity_ids FROM messages WHERE id = 'm1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(sender, keep.id);
        assert!(recipients.contains(&keep.id));
        assert!(!recipients.contains(&merge.id));
    }

    #[test]
    fn test_merge_missing_entity_is_invalid() {
        let graph = graph();
        let keep = graph.create_entity("Keep", EntityType::Person, &[]).unwrap();
        assert!(matches!(
            merge_entities(&graph, &keep.id, "nope"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            merge_entities(&graph, &keep.id, &keep.id),
            Err(StorageError::InvalidInput(_))
        ));
    }
}
