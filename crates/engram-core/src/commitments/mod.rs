//! Commitment Tracker
//!
//! Lifecycle of promises, asks, decisions, deadlines, and meetings extracted
//! from the user's communications. A commitment without a due date never
//! appears in deadline scans. Goal hierarchy lives in [`goals`].

pub mod goals;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{db_now, db_time};
use crate::storage::{Result, Storage, StorageError};

pub use goals::{Goal, GoalStatus, GoalTracker, GoalType};

// ============================================================================
// TYPES
// ============================================================================

/// Kinds of tracked commitments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentType {
    /// Something the user promised to someone
    Promise,
    /// Something someone asked of the user
    Ask,
    /// A decision that was made
    Decision,
    /// A hard date
    Deadline,
    /// A calendar meeting
    Meeting,
}

impl CommitmentType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentType::Promise => "promise",
            CommitmentType::Ask => "ask",
            CommitmentType::Decision => "decision",
            CommitmentType::Deadline => "deadline",
            CommitmentType::Meeting => "meeting",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "ask" => CommitmentType::Ask,
            "decision" => CommitmentType::Decision,
            "deadline" => CommitmentType::Deadline,
            "meeting" => CommitmentType::Meeting,
            _ => CommitmentType::Promise,
        }
    }
}

/// Lifecycle status of a commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    Open,
    Completed,
    Broken,
    Cancelled,
}

impl CommitmentStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Open => "open",
            CommitmentStatus::Completed => "completed",
            CommitmentStatus::Broken => "broken",
            CommitmentStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "completed" => CommitmentStatus::Completed,
            "broken" => CommitmentStatus::Broken,
            "cancelled" => CommitmentStatus::Cancelled,
            _ => CommitmentStatus::Open,
        }
    }
}

/// A tracked commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    pub id: String,
    pub commitment_type: CommitmentType,
    pub description: String,
    pub owner_entity_id: Option<String>,
    pub counterparty_entity_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: CommitmentStatus,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
}

impl Commitment {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            commitment_type: CommitmentType::parse_name(
                &row.get::<_, String>("commitment_type")?,
            ),
            description: row.get("description")?,
            owner_entity_id: row.get("owner_entity_id")?,
            counterparty_entity_id: row.get("counterparty_entity_id")?,
            due_date: row.get("due_date")?,
            status: CommitmentStatus::parse_name(&row.get::<_, String>("status")?),
            source_type: row.get("source_type")?,
            source_id: row.get("source_id")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
            reminder_sent: row.get("reminder_sent")?,
        })
    }
}

const COMMITMENT_COLUMNS: &str = "id, commitment_type, description, owner_entity_id,
    counterparty_entity_id, due_date, status, source_type, source_id,
    created_at, completed_at, reminder_sent";

/// Input for creating a commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentInput {
    pub commitment_type: CommitmentType,
    pub description: String,
    pub owner_entity_id: Option<String>,
    pub counterparty_entity_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Commitment operations over shared storage
#[derive(Clone)]
pub struct CommitmentTracker {
    storage: Arc<Storage>,
}

impl CommitmentTracker {
    /// Create over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Create a new open commitment
    pub fn create(&self, input: CommitmentInput) -> Result<Commitment> {
        if input.description.trim().is_empty() {
            return Err(StorageError::InvalidInput("description is empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO commitments
                    (id, commitment_type, description, owner_entity_id, counterparty_entity_id,
                     due_date, status, source_type, source_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?8, ?9)",
                params![
                    id,
                    input.commitment_type.as_str(),
                    input.description,
                    input.owner_entity_id,
                    input.counterparty_entity_id,
                    input.due_date.map(db_time),
                    input.source_type,
                    input.source_id,
                    db_now(),
                ],
            )?;
            Ok(())
        })?;

        self.get(&id)?.ok_or_else(|| StorageError::NotFound(id))
    }

    /// Fetch a commitment by id
    pub fn get(&self, id: &str) -> Result<Option<Commitment>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE id = ?1"),
                [id],
                Commitment::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    /// All open commitments, due date ascending with undated ones last
    pub fn open_commitments(&self) -> Result<Vec<Commitment>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMITMENT_COLUMNS} FROM commitments
                 WHERE status = 'open'
                 ORDER BY due_date IS NULL, due_date ASC, created_at ASC"
            ))?;
            let rows = stmt
                .query_map([], Commitment::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Open commitments whose due date has passed
    pub fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<Commitment>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMITMENT_COLUMNS} FROM commitments
                 WHERE status = 'open' AND due_date IS NOT NULL AND due_date < ?1
                 ORDER BY due_date ASC"
            ))?;
            let rows = stmt
                .query_map([db_time(now)], Commitment::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Open commitments due within `hours` that have not been reminded yet
    pub fn reminders_due(&self, now: DateTime<Utc>, hours: i64) -> Result<Vec<Commitment>> {
        let horizon = now + Duration::hours(hours);
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMITMENT_COLUMNS} FROM commitments
                 WHERE status = 'open' AND reminder_sent = 0
                   AND due_date IS NOT NULL AND due_date >= ?1 AND due_date <= ?2
                 ORDER BY due_date ASC"
            ))?;
            let rows = stmt
                .query_map(params![db_time(now), db_time(horizon)], Commitment::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Mark a commitment's reminder as sent
    pub fn mark_reminder_sent(&self, id: &str) -> Result<()> {
        self.storage.with_tx(|tx| {
            let changed =
                tx.execute("UPDATE commitments SET reminder_sent = 1 WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Transition a commitment's status. Completion stamps `completed_at`
    /// with the current time.
    pub fn set_status(&self, id: &str, status: CommitmentStatus) -> Result<Commitment> {
        let completed_at = match status {
            CommitmentStatus::Completed => Some(db_now()),
            _ => None,
        };
        self.storage.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE commitments SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), completed_at, id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Ok(())
        })?;
        self.get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Calendar-sync pass: complete meeting commitments from calendar
    /// sources once they are more than an hour past due, stamping
    /// `completed_at = due_date` (the meeting happened when it was
    /// scheduled). Returns the number completed.
    pub fn complete_past_calendar_events(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = db_time(now - Duration::hours(1));
        self.storage.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE commitments
                 SET status = 'completed', completed_at = due_date
                 WHERE status = 'open' AND commitment_type = 'meeting'
                   AND source_type = 'calendar'
                   AND due_date IS NOT NULL AND due_date < ?1",
                [cutoff],
            )?;
            Ok(changed)
        })
    }

    /// Open commitments owned by or owed to an entity
    pub fn for_entity(&self, entity_id: &str) -> Result<Vec<Commitment>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMITMENT_COLUMNS} FROM commitments
                 WHERE status = 'open'
                   AND (owner_entity_id = ?1 OR counterparty_entity_id = ?1)
                 ORDER BY due_date IS NULL, due_date ASC"
            ))?;
            let rows = stmt
                .query_map([entity_id], Commitment::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
