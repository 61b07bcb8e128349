//! Entity Graph
//!
//! Row-level operations for canonical entities, their attributes, and the
//! typed edges between them. The resolver, ingestion, and retrieval all sit
//! on top of this layer; none of them hold a long-lived in-memory graph.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::params;
use uuid::Uuid;

use crate::model::{db_now, Entity, EntityAttribute, EntityType, GraphEdge};
use crate::storage::{Result, Storage, StorageError};

/// Strength bump applied per communication observation
pub const EDGE_EVIDENCE_BUMP: f64 = 0.05;

/// Default traversal depth
pub const DEFAULT_TRAVERSAL_DEPTH: usize = 1;

/// Hard traversal depth bound
pub const MAX_TRAVERSAL_DEPTH: usize = 3;

/// Entity/attribute/edge operations over shared storage
#[derive(Clone)]
pub struct EntityGraph {
    storage: Arc<Storage>,
}

impl EntityGraph {
    /// Create over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Create a new canonical entity with optional seed attributes
    pub fn create_entity(
        &self,
        canonical_name: &str,
        entity_type: EntityType,
        attributes: &[(&str, &str)],
    ) -> Result<Entity> {
        let name = canonical_name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidInput("entity name is empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = db_now();

        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at, merge_history)
                 VALUES (?1, ?2, ?3, ?4, ?4, '[]')",
                params![id, name, entity_type.as_str(), now],
            )?;
            for (attr_type, attr_value) in attributes {
                insert_attribute_tx(tx, &id, attr_type, attr_value, 1.0, None)?;
            }
            Ok(())
        })?;

        self.get_entity(&id)?
            .ok_or_else(|| StorageError::NotFound(id))
    }

    /// Fetch an entity by id
    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, canonical_name, entity_type, created_at, updated_at, merge_history
                 FROM entities WHERE id = ?1",
                [id],
                Entity::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    /// All entities of one type
    pub fn entities_of_type(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, canonical_name, entity_type, created_at, updated_at, merge_history
                 FROM entities WHERE entity_type = ?1",
            )?;
            let entities = stmt
                .query_map([entity_type.as_str()], Entity::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entities)
        })
    }

    /// Rename an entity, keeping the old name reachable as an alias
    pub fn rename_entity(&self, id: &str, new_name: &str) -> Result<()> {
        let entity = self
            .get_entity(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        self.storage.with_tx(|tx| {
            tx.execute(
                "UPDATE entities SET canonical_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_name, db_now(), id],
            )?;
            insert_attribute_tx(tx, id, "alias", &entity.canonical_name, 1.0, None)?;
            Ok(())
        })
    }

    // ========================================================================
    // ATTRIBUTES
    // ========================================================================

    /// Add an attribute; a `(entity, type, value)` duplicate is silently
    /// ignored
    pub fn add_attribute(
        &self,
        entity_id: &str,
        attribute_type: &str,
        attribute_value: &str,
        confidence: f64,
        source_assertion_id: Option<&str>,
    ) -> Result<()> {
        self.storage.with_tx(|tx| {
            insert_attribute_tx(
                tx,
                entity_id,
                attribute_type,
                attribute_value,
                confidence,
                source_assertion_id,
            )
        })
    }

    /// All attributes of an entity
    pub fn attributes(&self, entity_id: &str) -> Result<Vec<EntityAttribute>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_id, attribute_type, attribute_value, confidence,
                        source_assertion_id, created_at
                 FROM entity_attributes WHERE entity_id = ?1
                 ORDER BY attribute_type, created_at",
            )?;
            let attrs = stmt
                .query_map([entity_id], EntityAttribute::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(attrs)
        })
    }

    /// Find the entity holding an exact attribute value
    /// (case-insensitive on the value)
    pub fn find_by_attribute(
        &self,
        attribute_type: &str,
        attribute_value: &str,
    ) -> Result<Option<Entity>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT e.id, e.canonical_name, e.entity_type, e.created_at, e.updated_at,
                        e.merge_history
                 FROM entities e
                 JOIN entity_attributes a ON a.entity_id = e.id
                 WHERE a.attribute_type = ?1 AND a.attribute_value = ?2 COLLATE NOCASE
                 LIMIT 1",
                params![attribute_type, attribute_value],
                Entity::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Record communication evidence between two entities: bump strength,
    /// increment the evidence count, stamp `last_evidence_at`. Creates the
    /// edge on first observation.
    pub fn record_edge_evidence(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        edge_type: &str,
    ) -> Result<()> {
        let now = db_now();
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO graph_edges
                    (id, from_entity_id, to_entity_id, edge_type, strength, evidence_count,
                     last_evidence_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
                 ON CONFLICT (from_entity_id, to_entity_id, edge_type) DO UPDATE SET
                    strength = MIN(1.0, strength + ?5),
                    evidence_count = evidence_count + 1,
                    last_evidence_at = excluded.last_evidence_at",
                params![
                    Uuid::new_v4().to_string(),
                    from_entity_id,
                    to_entity_id,
                    edge_type,
                    EDGE_EVIDENCE_BUMP,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Assert an explicit relationship edge (`reports_to`, `family`, ...)
    /// with a fixed strength
    pub fn assert_edge(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        edge_type: &str,
        strength: f64,
    ) -> Result<()> {
        let now = db_now();
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO graph_edges
                    (id, from_entity_id, to_entity_id, edge_type, strength, evidence_count,
                     last_evidence_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
                 ON CONFLICT (from_entity_id, to_entity_id, edge_type) DO UPDATE SET
                    strength = excluded.strength,
                    last_evidence_at = excluded.last_evidence_at",
                params![
                    Uuid::new_v4().to_string(),
                    from_entity_id,
                    to_entity_id,
                    edge_type,
                    strength.clamp(0.0, 1.0),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Edges touching an entity, both directions
    pub fn edges_of(&self, entity_id: &str) -> Result<Vec<GraphEdge>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_entity_id, to_entity_id, edge_type, strength, evidence_count,
                        last_evidence_at, created_at
                 FROM graph_edges
                 WHERE from_entity_id = ?1 OR to_entity_id = ?1
                 ORDER BY strength DESC",
            )?;
            let edges = stmt
                .query_map([entity_id], GraphEdge::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(edges)
        })
    }

    /// Ids of entities connected to `entity_id` within `depth` hops.
    ///
    /// The communication graph contains cycles, so traversal keeps a visited
    /// set; depth is clamped to [`MAX_TRAVERSAL_DEPTH`].
    pub fn neighbors(&self, entity_id: &str, depth: usize) -> Result<HashSet<String>> {
        let depth = depth.clamp(1, MAX_TRAVERSAL_DEPTH);
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(entity_id.to_string());
        let mut frontier: Vec<String> = vec![entity_id.to_string()];

        for _ in 0..depth {
            let mut next_frontier = Vec::new();
            for id in frontier.drain(..) {
                for edge in self.edges_of(&id)? {
                    let other = if edge.from_entity_id == id {
                        edge.to_entity_id
                    } else {
                        edge.from_entity_id
                    };
                    if visited.insert(other.clone()) {
                        next_frontier.push(other);
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        visited.remove(entity_id);
        Ok(visited)
    }

    /// How many of `others` share a direct connection with `entity_id`
    pub fn shared_connection_count(
        &self,
        entity_id: &str,
        others: &HashSet<String>,
    ) -> Result<usize> {
        if others.is_empty() {
            return Ok(0);
        }
        let direct = self.neighbors(entity_id, 1)?;
        Ok(direct.intersection(others).count())
    }

    // ========================================================================
    // CONTEXT MEMBERSHIP
    // ========================================================================

    /// Attach an entity to a named context
    pub fn add_context_membership(&self, entity_id: &str, context_name: &str) -> Result<()> {
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO entity_contexts (entity_id, context_name) VALUES (?1, ?2)",
                params![entity_id, context_name],
            )?;
            Ok(())
        })
    }

    /// Context names an entity belongs to
    pub fn context_memberships(&self, entity_id: &str) -> Result<Vec<String>> {
        self.storage.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT context_name FROM entity_contexts WHERE entity_id = ?1")?;
            let names = stmt
                .query_map([entity_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }
}

/// Insert an attribute inside an open transaction, ignoring uniqueness
/// collisions
pub(crate) fn insert_attribute_tx(
    tx: &rusqlite::Transaction<'_>,
    entity_id: &str,
    attribute_type: &str,
    attribute_value: &str,
    confidence: f64,
    source_assertion_id: Option<&str>,
) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO entity_attributes
            (id, entity_id, attribute_type, attribute_value, confidence,
             source_assertion_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            entity_id,
            attribute_type,
            attribute_value,
            confidence.clamp(0.0, 1.0),
            source_assertion_id,
            db_now(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
