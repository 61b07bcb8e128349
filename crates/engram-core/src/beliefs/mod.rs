//! Bi-Temporal Belief Store
//!
//! Every assertion records both when it became true in the world
//! (`valid_from`, `valid_until`) and when the engine learned it
//! (`extracted_at`). Supersession chains are strictly linear: exactly one
//! assertion per chain has no `superseded_by_id`, and it is the latest by
//! `extracted_at`. Contradiction handling lives in [`contradiction`].

pub mod contradiction;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{db_now, db_time};
use crate::storage::{Result, Storage, StorageError};

pub use contradiction::{
    AutoResolution, BeliefContradiction, ContradictionType, ResolutionStatus,
};

// ============================================================================
// TYPES
// ============================================================================

/// A subject-predicate-object fact with provenance and bi-temporal validity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub id: String,
    pub subject_entity_id: Option<String>,
    pub predicate: String,
    /// Literal object; typically exactly one of `object_text` /
    /// `object_entity_id` is set
    pub object_text: Option<String>,
    /// Entity-valued object
    pub object_entity_id: Option<String>,
    pub confidence: f64,
    pub source_type: String,
    pub source_id: String,
    /// When the source said it (message timestamp, calendar time)
    pub source_timestamp: Option<DateTime<Utc>>,
    /// When the engine learned it
    pub extracted_at: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub supersedes_id: Option<String>,
    pub superseded_by_id: Option<String>,
    /// Context compartment this assertion belongs to
    pub context_id: Option<String>,
}

impl Assertion {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            subject_entity_id: row.get("subject_entity_id")?,
            predicate: row.get("predicate")?,
            object_text: row.get("object_text")?,
            object_entity_id: row.get("object_entity_id")?,
            confidence: row.get("confidence")?,
            source_type: row.get("source_type")?,
            source_id: row.get("source_id")?,
            source_timestamp: row.get("source_timestamp")?,
            extracted_at: row.get("extracted_at")?,
            valid_from: row.get("valid_from")?,
            valid_until: row.get("valid_until")?,
            supersedes_id: row.get("supersedes_id")?,
            superseded_by_id: row.get("superseded_by_id")?,
            context_id: row.get("context_id")?,
        })
    }

    /// The two objects are the same belief value
    pub(crate) fn same_object(&self, other: &Assertion) -> bool {
        self.object_text == other.object_text && self.object_entity_id == other.object_entity_id
    }
}

const ASSERTION_COLUMNS: &str = "id, subject_entity_id, predicate, object_text, object_entity_id,
    confidence, source_type, source_id, source_timestamp, extracted_at,
    valid_from, valid_until, supersedes_id, superseded_by_id, context_id";

/// Input for recording a new assertion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionInput {
    pub subject_entity_id: Option<String>,
    pub predicate: String,
    pub object_text: Option<String>,
    pub object_entity_id: Option<String>,
    /// Defaults to 0.5 when unset
    pub confidence: Option<f64>,
    pub source_type: String,
    pub source_id: String,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub context_id: Option<String>,
}

/// Options for time-travel queries
#[derive(Debug, Clone, Default)]
pub struct AsOfOptions {
    /// Restrict to one predicate
    pub predicate: Option<String>,
    /// Include assertions that have been superseded
    pub include_superseded: bool,
}

// ============================================================================
// BELIEF STORE
// ============================================================================

/// Assertion log operations over shared storage
#[derive(Clone)]
pub struct BeliefStore {
    storage: Arc<Storage>,
}

impl BeliefStore {
    /// Create over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Record a new assertion and detect contradictions against live
    /// assertions with the same subject and predicate. Detected
    /// contradictions are persisted and returned; they are records, not
    /// errors.
    pub fn record(
        &self,
        input: AssertionInput,
    ) -> Result<(Assertion, Vec<BeliefContradiction>)> {
        if input.predicate.trim().is_empty() {
            return Err(StorageError::InvalidInput("predicate is empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = db_now();

        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO assertions
                    (id, subject_entity_id, predicate, object_text, object_entity_id,
                     confidence, source_type, source_id, source_timestamp, extracted_at,
                     valid_from, valid_until, context_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    input.subject_entity_id,
                    input.predicate,
                    input.object_text,
                    input.object_entity_id,
                    input.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                    input.source_type,
                    input.source_id,
                    input.source_timestamp.map(db_time),
                    now,
                    input.valid_from.map(db_time),
                    input.valid_until.map(db_time),
                    input.context_id,
                ],
            )?;
            Ok(())
        })?;

        let assertion = self
            .get(&id)?
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        let contradictions = contradiction::detect_for(self, &assertion)?;
        Ok((assertion, contradictions))
    }

    /// Fetch an assertion by id
    pub fn get(&self, id: &str) -> Result<Option<Assertion>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {ASSERTION_COLUMNS} FROM assertions WHERE id = ?1"),
                [id],
                Assertion::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    /// Time-travel query: the assertions about an entity that the engine
    /// knew and believed valid at `t`.
    ///
    /// Selects rows where `extracted_at <= t`, `valid_from` is unset or
    /// `<= t`, and `valid_until` is unset or `> t`; superseded rows are
    /// excluded unless requested. Ordered by `extracted_at` descending.
    pub fn assertions_as_of(
        &self,
        subject_entity_id: &str,
        t: DateTime<Utc>,
        options: &AsOfOptions,
    ) -> Result<Vec<Assertion>> {
        let t_str = db_time(t);
        self.storage.with_reader(|conn| {
            let mut sql = format!(
                "SELECT {ASSERTION_COLUMNS} FROM assertions
                 WHERE subject_entity_id = ?1
                   AND extracted_at <= ?2
                   AND (valid_from IS NULL OR valid_from <= ?2)
                   AND (valid_until IS NULL OR valid_until > ?2)"
            );
            if !options.include_superseded {
                sql.push_str(" AND superseded_by_id IS NULL");
            }
            if options.predicate.is_some() {
                sql.push_str(" AND predicate = ?3");
            }
            sql.push_str(" ORDER BY extracted_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = match options.predicate {
                Some(ref predicate) => stmt
                    .query_map(params![subject_entity_id, t_str, predicate], Assertion::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map(params![subject_entity_id, t_str], Assertion::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(rows)
        })
    }

    /// Live (non-superseded) assertions about a subject, newest first
    pub fn live_for_subject(
        &self,
        subject_entity_id: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Assertion>> {
        self.storage.with_reader(|conn| {
            let mut sql = format!(
                "SELECT {ASSERTION_COLUMNS} FROM assertions
                 WHERE subject_entity_id = ?1 AND superseded_by_id IS NULL"
            );
            if predicate.is_some() {
                sql.push_str(" AND predicate = ?2");
            }
            sql.push_str(" ORDER BY confidence DESC, extracted_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = match predicate {
                Some(p) => stmt
                    .query_map(params![subject_entity_id, p], Assertion::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map(params![subject_entity_id], Assertion::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(rows)
        })
    }

    /// Supersede `old_id` with a new version.
    ///
    /// The new assertion inherits subject, predicate, and context from the
    /// old one; the old assertion's validity is closed at the supersession
    /// instant and its `superseded_by_id` set, keeping the chain strictly
    /// linear. Superseding an already-superseded assertion is an
    /// `InvalidInput` (it would branch the chain); a missing old id is
    /// `NotFound`.
    pub fn supersede(&self, old_id: &str, new: AssertionInput) -> Result<Assertion> {
        let old = self
            .get(old_id)?
            .ok_or_else(|| StorageError::NotFound(format!("assertion {old_id}")))?;
        if old.superseded_by_id.is_some() {
            return Err(StorageError::InvalidInput(format!(
                "assertion {old_id} is already superseded"
            )));
        }

        let new_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = db_time(now);

        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO assertions
                    (id, subject_entity_id, predicate, object_text, object_entity_id,
                     confidence, source_type, source_id, source_timestamp, extracted_at,
                     valid_from, valid_until, supersedes_id, context_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    new_id,
                    old.subject_entity_id,
                    old.predicate,
                    new.object_text,
                    new.object_entity_id,
                    new.confidence.unwrap_or(old.confidence).clamp(0.0, 1.0),
                    new.source_type,
                    new.source_id,
                    new.source_timestamp.map(db_time),
                    now_str,
                    new.valid_from.map(db_time),
                    new.valid_until.map(db_time),
                    old_id,
                    old.context_id,
                ],
            )?;
            tx.execute(
                "UPDATE assertions SET valid_until = ?1, superseded_by_id = ?2 WHERE id = ?3",
                params![now_str, new_id, old_id],
            )?;
            Ok(())
        })?;

        self.get(&new_id)?
            .ok_or_else(|| StorageError::NotFound(new_id))
    }

    /// Walk a supersession chain from any member to its full history,
    /// oldest first
    pub fn history(&self, assertion_id: &str) -> Result<Vec<Assertion>> {
        let mut current = self
            .get(assertion_id)?
            .ok_or_else(|| StorageError::NotFound(assertion_id.to_string()))?;

        // Walk back to the root
        while let Some(ref prev_id) = current.supersedes_id {
            match self.get(prev_id)? {
                Some(prev) => current = prev,
                None => break,
            }
        }

        // Walk forward collecting the chain
        let mut chain = vec![current];
        loop {
            let next_id = match chain.last().and_then(|a| a.superseded_by_id.clone()) {
                Some(id) => id,
                None => break,
            };
            match self.get(&next_id)? {
                Some(next) => chain.push(next),
                None => break,
            }
        }
        Ok(chain)
    }

    /// Update an assertion's confidence, logging the change to
    /// `belief_revision_log`
    pub fn revise_confidence(
        &self,
        assertion_id: &str,
        new_confidence: f64,
        reason: &str,
    ) -> Result<()> {
        let assertion = self
            .get(assertion_id)?
            .ok_or_else(|| StorageError::NotFound(assertion_id.to_string()))?;

        self.storage.with_tx(|tx| {
            tx.execute(
                "UPDATE assertions SET confidence = ?1 WHERE id = ?2",
                params![new_confidence.clamp(0.0, 1.0), assertion_id],
            )?;
            tx.execute(
                "INSERT INTO belief_revision_log
                    (assertion_id, old_confidence, new_confidence, reason, revised_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    assertion_id,
                    assertion.confidence,
                    new_confidence.clamp(0.0, 1.0),
                    reason,
                    db_now(),
                ],
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
