//! Goal Hierarchy
//!
//! Goals form an acyclic forest via `parent_goal_id`. Deleting a goal
//! detaches its children (parent set to null) rather than orphaning them to
//! a dangling id. Progress rolls up: a completed goal is 1, an abandoned one
//! 0, a leaf is the fraction of its linked commitments completed, and an
//! inner node is the mean of its children.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CommitmentTracker;
use crate::model::{db_now, db_time, decode_id_list, encode_id_list};
use crate::storage::{Result, StorageError};

// ============================================================================
// TYPES
// ============================================================================

/// Goal horizon classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    ShortTerm,
    LongTerm,
    Project,
}

impl GoalType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::ShortTerm => "short_term",
            GoalType::LongTerm => "long_term",
            GoalType::Project => "project",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "long_term" => GoalType::LongTerm,
            "project" => GoalType::Project,
            _ => GoalType::ShortTerm,
        }
    }
}

/// Goal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
    Abandoned,
}

impl GoalStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "completed" => GoalStatus::Completed,
            "abandoned" => GoalStatus::Abandoned,
            _ => GoalStatus::Active,
        }
    }
}

/// A goal in the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub goal_type: GoalType,
    pub status: GoalStatus,
    pub parent_goal_id: Option<String>,
    pub related_entities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub target_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            description: row.get("description")?,
            goal_type: GoalType::parse_name(&row.get::<_, String>("goal_type")?),
            status: GoalStatus::parse_name(&row.get::<_, String>("status")?),
            parent_goal_id: row.get("parent_goal_id")?,
            related_entities: decode_id_list(row.get("related_entities")?),
            created_at: row.get("created_at")?,
            target_date: row.get("target_date")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

const GOAL_COLUMNS: &str = "id, description, goal_type, status, parent_goal_id,
    related_entities, created_at, target_date, completed_at";

// ============================================================================
// TRACKER
// ============================================================================

/// Goal operations, sharing storage with the commitment tracker
#[derive(Clone)]
pub struct GoalTracker {
    commitments: CommitmentTracker,
}

impl GoalTracker {
    /// Create over the commitment tracker (progress needs commitment status)
    pub fn new(commitments: CommitmentTracker) -> Self {
        Self { commitments }
    }

    /// Create a goal. A named parent must exist.
    pub fn create(
        &self,
        description: &str,
        goal_type: GoalType,
        parent_goal_id: Option<&str>,
        related_entities: &[String],
        target_date: Option<DateTime<Utc>>,
    ) -> Result<Goal> {
        if description.trim().is_empty() {
            return Err(StorageError::InvalidInput("description is empty".into()));
        }
        if let Some(parent) = parent_goal_id {
            if self.get(parent)?.is_none() {
                return Err(StorageError::InvalidInput(format!(
                    "parent goal {parent} does not exist"
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        self.commitments.storage().with_tx(|tx| {
            tx.execute(
                "INSERT INTO goals
                    (id, description, goal_type, status, parent_goal_id, related_entities,
                     created_at, target_date)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7)",
                params![
                    id,
                    description,
                    goal_type.as_str(),
                    parent_goal_id,
                    encode_id_list(related_entities),
                    db_now(),
                    target_date.map(db_time),
                ],
            )?;
            Ok(())
        })?;

        self.get(&id)?.ok_or_else(|| StorageError::NotFound(id))
    }

    /// Fetch a goal by id
    pub fn get(&self, id: &str) -> Result<Option<Goal>> {
        self.commitments.storage().with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
                [id],
                Goal::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    /// Active goals, optionally restricted to those touching an entity
    pub fn active_goals(&self, entity_id: Option<&str>) -> Result<Vec<Goal>> {
        let goals = self.commitments.storage().with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GOAL_COLUMNS} FROM goals WHERE status = 'active' ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([], Goal::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(match entity_id {
            Some(entity) => goals
                .into_iter()
                .filter(|g| g.related_entities.iter().any(|e| e == entity))
                .collect(),
            None => goals,
        })
    }

    /// Direct children of a goal
    pub fn children(&self, goal_id: &str) -> Result<Vec<Goal>> {
        self.commitments.storage().with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GOAL_COLUMNS} FROM goals WHERE parent_goal_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([goal_id], Goal::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Re-parent a goal. Rejects moves that would create a cycle.
    pub fn set_parent(&self, goal_id: &str, new_parent_id: Option<&str>) -> Result<()> {
        if self.get(goal_id)?.is_none() {
            return Err(StorageError::NotFound(goal_id.to_string()));
        }
        if let Some(parent) = new_parent_id {
            // Walk up from the candidate parent; hitting the goal means a
            // cycle
            let mut cursor = Some(parent.to_string());
            while let Some(current) = cursor {
                if current == goal_id {
                    return Err(StorageError::InvalidInput(
                        "re-parenting would create a cycle".into(),
                    ));
                }
                cursor = self
                    .get(&current)?
                    .ok_or_else(|| StorageError::InvalidInput(format!(
                        "parent goal {current} does not exist"
                    )))?
                    .parent_goal_id;
            }
        }

        self.commitments.storage().with_tx(|tx| {
            tx.execute(
                "UPDATE goals SET parent_goal_id = ?1 WHERE id = ?2",
                params![new_parent_id, goal_id],
            )?;
            Ok(())
        })
    }

    /// Transition a goal's status; completion stamps `completed_at`
    pub fn set_status(&self, goal_id: &str, status: GoalStatus) -> Result<()> {
        let completed_at = match status {
            GoalStatus::Completed => Some(db_now()),
            _ => None,
        };
        self.commitments.storage().with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE goals SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), completed_at, goal_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(goal_id.to_string()));
            }
            Ok(())
        })
    }

    /// Delete a goal, detaching children instead of orphaning them
    pub fn delete(&self, goal_id: &str) -> Result<()> {
        self.commitments.storage().with_tx(|tx| {
            tx.execute(
                "UPDATE goals SET parent_goal_id = NULL WHERE parent_goal_id = ?1",
                [goal_id],
            )?;
            let changed = tx.execute("DELETE FROM goals WHERE id = ?1", [goal_id])?;
            if changed == 0 {
                return Err(StorageError::NotFound(goal_id.to_string()));
            }
            Ok(())
        })
    }

    /// Link a commitment to a goal; the association is created on demand
    /// and duplicates are ignored
    pub fn link_commitment(&self, goal_id: &str, commitment_id: &str) -> Result<()> {
        if self.get(goal_id)?.is_none() {
            return Err(StorageError::NotFound(format!("goal {goal_id}")));
        }
        if self.commitments.get(commitment_id)?.is_none() {
            return Err(StorageError::NotFound(format!("commitment {commitment_id}")));
        }
        self.commitments.storage().with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO goal_commitments (goal_id, commitment_id) VALUES (?1, ?2)",
                params![goal_id, commitment_id],
            )?;
            Ok(())
        })
    }

    /// Roll-up progress in [0, 1]
    pub fn progress(&self, goal_id: &str) -> Result<f64> {
        let goal = self
            .get(goal_id)?
            .ok_or_else(|| StorageError::NotFound(goal_id.to_string()))?;

        match goal.status {
            GoalStatus::Completed => return Ok(1.0),
            GoalStatus::Abandoned => return Ok(0.0),
            GoalStatus::Active => {}
        }

        let children = self.children(goal_id)?;
        if children.is_empty() {
            // Leaf: fraction of linked commitments completed
            let (total, completed): (i64, i64) =
                self.commitments.storage().with_reader(|conn| {
                    Ok(conn.query_row(
                        "SELECT COUNT(*),
                                COALESCE(SUM(CASE WHEN c.status = 'completed' THEN 1 ELSE 0 END), 0)
                         FROM goal_commitments gc
                         JOIN commitments c ON c.id = gc.commitment_id
                         WHERE gc.goal_id = ?1",
                        [goal_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?)
                })?;
            if total == 0 {
                return Ok(0.0);
            }
            return Ok(completed as f64 / total as f64);
        }

        // Inner node: mean of children
        let mut sum = 0.0;
        for child in &children {
            sum += self.progress(&child.id)?;
        }
        Ok(sum / children.len() as f64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
