//! Contradiction Detection & Resolution
//!
//! Two assertions contradict when they share a subject and predicate, claim
//! different objects, and their validity intervals overlap (missing endpoints
//! read as unbounded). Non-overlapping intervals are change over time, not
//! contradiction. Detected contradictions are surfaced as records, never as
//! control-flow failures.
//!
//! Per-contradiction state machine: `pending -> {resolved, escalated}`;
//! `escalated -> resolved` only via user resolution. `resolved` is terminal.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Assertion, BeliefStore};
use crate::model::{db_now, db_time};
use crate::storage::{Result, StorageError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Severity at or above which auto-resolution escalates instead of deciding
const ESCALATION_SEVERITY: f64 = 0.8;

/// Confidence gap above which the higher-confidence assertion wins
const CONFIDENCE_GAP: f64 = 0.3;

/// Confidence multiplier applied to the loser of an auto-resolution
const AUTO_LOSER_FACTOR: f64 = 0.5;

/// Confidence floor for auto-resolution losers
const AUTO_LOSER_FLOOR: f64 = 0.1;

/// Confidence multiplier applied when the user rejects the loser outright
const USER_LOSER_FACTOR: f64 = 0.2;

/// Confidence floor for user-resolution losers
const USER_LOSER_FLOOR: f64 = 0.05;

/// Default age (days) past which assertion confidence decays
pub const DECAY_AGE_DAYS: i64 = 365;

/// Default decay multiplier
pub const DECAY_FACTOR: f64 = 0.9;

/// Confidence floor for decay
const DECAY_FLOOR: f64 = 0.1;

// ============================================================================
// TYPES
// ============================================================================

/// How two assertions contradict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionType {
    /// Plain conflicting claims
    Direct,
    /// Conflicting claims that both carry explicit validity starts
    Temporal,
    /// One side is held with much more confidence than the other
    Confidence,
}

impl ContradictionType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ContradictionType::Direct => "direct",
            ContradictionType::Temporal => "temporal",
            ContradictionType::Confidence => "confidence",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "temporal" => ContradictionType::Temporal,
            "confidence" => ContradictionType::Confidence,
            _ => ContradictionType::Direct,
        }
    }
}

/// Lifecycle state of a contradiction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    /// Awaiting resolution
    Pending,
    /// Decided (terminal)
    Resolved,
    /// Too severe for auto-resolution; waiting on the user
    Escalated,
}

impl ResolutionStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Resolved => "resolved",
            ResolutionStatus::Escalated => "escalated",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "resolved" => ResolutionStatus::Resolved,
            "escalated" => ResolutionStatus::Escalated,
            _ => ResolutionStatus::Pending,
        }
    }
}

/// A detected contradiction between two assertions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeliefContradiction {
    pub id: String,
    pub assertion_id_1: String,
    pub assertion_id_2: String,
    pub detected_at: DateTime<Utc>,
    pub contradiction_type: ContradictionType,
    pub severity: f64,
    pub resolution_status: ResolutionStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_method: Option<String>,
    pub winning_assertion_id: Option<String>,
}

impl BeliefContradiction {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            assertion_id_1: row.get("assertion_id_1")?,
            assertion_id_2: row.get("assertion_id_2")?,
            detected_at: row.get("detected_at")?,
            contradiction_type: ContradictionType::parse_name(
                &row.get::<_, String>("contradiction_type")?,
            ),
            severity: row.get("severity")?,
            resolution_status: ResolutionStatus::parse_name(
                &row.get::<_, String>("resolution_status")?,
            ),
            resolved_at: row.get("resolved_at")?,
            resolution_method: row.get("resolution_method")?,
            winning_assertion_id: row.get("winning_assertion_id")?,
        })
    }
}

/// Outcome of an auto-resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoResolution {
    /// Too severe or too ambiguous; left for the user. Neither assertion's
    /// confidence is touched until then.
    Escalated,
    /// Decided: the loser's confidence was reduced and logged
    Resolved {
        winning_assertion_id: String,
        losing_assertion_id: String,
    },
}

// ============================================================================
// DETECTION
// ============================================================================

/// Validity intervals overlap, treating missing endpoints as unbounded
fn intervals_overlap(a: &Assertion, b: &Assertion) -> bool {
    let a_starts_before_b_ends = match (a.valid_from, b.valid_until) {
        (Some(from), Some(until)) => from < until,
        _ => true,
    };
    let b_starts_before_a_ends = match (b.valid_from, a.valid_until) {
        (Some(from), Some(until)) => from < until,
        _ => true,
    };
    a_starts_before_b_ends && b_starts_before_a_ends
}

/// Classify a contradicting pair, returning `(type, severity)`.
/// Returns None when the pair does not contradict.
pub fn classify(a: &Assertion, b: &Assertion) -> Option<(ContradictionType, f64)> {
    if a.subject_entity_id.is_none() || a.subject_entity_id != b.subject_entity_id {
        return None;
    }
    if a.predicate != b.predicate {
        return None;
    }
    if a.same_object(b) {
        return None;
    }
    if !intervals_overlap(a, b) {
        // Change over time, not contradiction
        return None;
    }

    let gap = (a.confidence - b.confidence).abs();
    if gap > 0.5 {
        // Severity scales with how weakly the weaker side is held
        let weaker = a.confidence.min(b.confidence);
        return Some((ContradictionType::Confidence, 0.3 + 0.4 * (1.0 - weaker)));
    }
    if a.valid_from.is_some() && b.valid_from.is_some() {
        return Some((ContradictionType::Temporal, 0.7));
    }
    Some((ContradictionType::Direct, 0.8))
}

/// Detect and persist contradictions between `assertion` and the live
/// assertions sharing its subject and predicate
pub(crate) fn detect_for(
    store: &BeliefStore,
    assertion: &Assertion,
) -> Result<Vec<BeliefContradiction>> {
    let Some(ref subject) = assertion.subject_entity_id else {
        return Ok(vec![]);
    };

    let mut found = Vec::new();
    for other in store.live_for_subject(subject, Some(&assertion.predicate))? {
        if other.id == assertion.id {
            continue;
        }
        let Some((contradiction_type, severity)) = classify(assertion, &other) else {
            continue;
        };

        let id = Uuid::new_v4().to_string();
        store.storage().with_tx(|tx| {
            tx.execute(
                "INSERT INTO belief_contradictions
                    (id, assertion_id_1, assertion_id_2, detected_at, contradiction_type,
                     severity, resolution_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                params![
                    id,
                    assertion.id,
                    other.id,
                    db_now(),
                    contradiction_type.as_str(),
                    severity,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            contradiction_id = %id,
            kind = contradiction_type.as_str(),
            severity,
            "contradiction detected"
        );

        if let Some(record) = get_contradiction(store, &id)? {
            found.push(record);
        }
    }
    Ok(found)
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Fetch a contradiction record by id
pub fn get_contradiction(
    store: &BeliefStore,
    id: &str,
) -> Result<Option<BeliefContradiction>> {
    store.storage().with_reader(|conn| {
        conn.query_row(
            "SELECT id, assertion_id_1, assertion_id_2, detected_at, contradiction_type,
                    severity, resolution_status, resolved_at, resolution_method,
                    winning_assertion_id
             FROM belief_contradictions WHERE id = ?1",
            [id],
            BeliefContradiction::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Database(other)),
        })
    })
}

/// All contradictions awaiting a decision (pending or escalated)
pub fn unresolved_contradictions(store: &BeliefStore) -> Result<Vec<BeliefContradiction>> {
    store.storage().with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, assertion_id_1, assertion_id_2, detected_at, contradiction_type,
                    severity, resolution_status, resolved_at, resolution_method,
                    winning_assertion_id
             FROM belief_contradictions
             WHERE resolution_status IN ('pending', 'escalated')
             ORDER BY detected_at",
        )?;
        let rows = stmt
            .query_map([], BeliefContradiction::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
}

/// Attempt automatic resolution of a pending contradiction.
///
/// Severity at or above 0.8 escalates without a decision. Otherwise a
/// confidence gap above 0.3 picks the higher-confidence assertion; failing
/// that, differing source timestamps pick the more recent; failing that, the
/// contradiction escalates. The loser's confidence is halved (floor 0.1) and
/// the change logged with reason `contradiction`.
pub fn resolve_auto(store: &BeliefStore, contradiction_id: &str) -> Result<AutoResolution> {
    let record = get_contradiction(store, contradiction_id)?
        .ok_or_else(|| StorageError::NotFound(format!("contradiction {contradiction_id}")))?;
    if record.resolution_status != ResolutionStatus::Pending {
        return Err(StorageError::InvalidInput(format!(
            "contradiction {contradiction_id} is {}",
            record.resolution_status.as_str()
        )));
    }

    let a = store
        .get(&record.assertion_id_1)?
        .ok_or_else(|| StorageError::NotFound(record.assertion_id_1.clone()))?;
    let b = store
        .get(&record.assertion_id_2)?
        .ok_or_else(|| StorageError::NotFound(record.assertion_id_2.clone()))?;

    if record.severity >= ESCALATION_SEVERITY {
        mark_escalated(store, contradiction_id)?;
        return Ok(AutoResolution::Escalated);
    }

    let winner = if (a.confidence - b.confidence).abs() > CONFIDENCE_GAP {
        if a.confidence > b.confidence { &a } else { &b }
    } else {
        match (a.source_timestamp, b.source_timestamp) {
            (Some(ta), Some(tb)) if ta != tb => {
                if ta > tb { &a } else { &b }
            }
            _ => {
                mark_escalated(store, contradiction_id)?;
                return Ok(AutoResolution::Escalated);
            }
        }
    };

    let loser = if winner.id == a.id { &b } else { &a };
    let new_confidence = (loser.confidence * AUTO_LOSER_FACTOR).max(AUTO_LOSER_FLOOR);
    store.revise_confidence(&loser.id, new_confidence, "contradiction")?;

    store.storage().with_tx(|tx| {
        tx.execute(
            "UPDATE belief_contradictions
             SET resolution_status = 'resolved', resolved_at = ?1,
                 resolution_method = 'auto', winning_assertion_id = ?2
             WHERE id = ?3",
            params![db_now(), winner.id, contradiction_id],
        )?;
        Ok(())
    })?;

    Ok(AutoResolution::Resolved {
        winning_assertion_id: winner.id.clone(),
        losing_assertion_id: loser.id.clone(),
    })
}

fn mark_escalated(store: &BeliefStore, contradiction_id: &str) -> Result<()> {
    store.storage().with_tx(|tx| {
        tx.execute(
            "UPDATE belief_contradictions SET resolution_status = 'escalated' WHERE id = ?1",
            [contradiction_id],
        )?;
        Ok(())
    })
}

/// User resolution: the caller names the winner.
///
/// With `keep_both`, the loser keeps its confidence but its validity closes
/// at the winner's source timestamp (both were true, one stopped being).
/// Without it, the loser's confidence drops to a fifth (floor 0.05). Valid
/// from both `pending` and `escalated` states.
pub fn resolve_user(
    store: &BeliefStore,
    contradiction_id: &str,
    winning_assertion_id: &str,
    keep_both: bool,
) -> Result<()> {
    let record = get_contradiction(store, contradiction_id)?
        .ok_or_else(|| StorageError::NotFound(format!("contradiction {contradiction_id}")))?;
    if record.resolution_status == ResolutionStatus::Resolved {
        return Err(StorageError::InvalidInput(format!(
            "contradiction {contradiction_id} is already resolved"
        )));
    }

    let loser_id = if winning_assertion_id == record.assertion_id_1 {
        record.assertion_id_2.clone()
    } else if winning_assertion_id == record.assertion_id_2 {
        record.assertion_id_1.clone()
    } else {
        return Err(StorageError::InvalidInput(format!(
            "assertion {winning_assertion_id} is not part of contradiction {contradiction_id}"
        )));
    };

    let winner = store
        .get(winning_assertion_id)?
        .ok_or_else(|| StorageError::NotFound(winning_assertion_id.to_string()))?;
    let loser = store
        .get(&loser_id)?
        .ok_or_else(|| StorageError::NotFound(loser_id.clone()))?;

    if keep_both {
        let boundary = winner.source_timestamp.unwrap_or(winner.extracted_at);
        store.storage().with_tx(|tx| {
            tx.execute(
                "UPDATE assertions SET valid_until = ?1 WHERE id = ?2",
                params![db_time(boundary), loser.id],
            )?;
            Ok(())
        })?;
    } else {
        let new_confidence = (loser.confidence * USER_LOSER_FACTOR).max(USER_LOSER_FLOOR);
        store.revise_confidence(&loser.id, new_confidence, "user_resolution")?;
    }

    store.storage().with_tx(|tx| {
        tx.execute(
            "UPDATE belief_contradictions
             SET resolution_status = 'resolved', resolved_at = ?1,
                 resolution_method = 'user', winning_assertion_id = ?2
             WHERE id = ?3",
            params![db_now(), winning_assertion_id, contradiction_id],
        )?;
        Ok(())
    })?;

    Ok(())
}

// ============================================================================
// DECAY
// ============================================================================

/// Decay confidence of every assertion older than `max_age_days` by
/// `factor`, floored at 0.1, logging each change with reason `decay`.
/// Returns the number of assertions touched.
pub fn decay_confidence(store: &BeliefStore, max_age_days: i64, factor: f64) -> Result<usize> {
    let cutoff = db_time(Utc::now() - chrono::Duration::days(max_age_days));

    let stale: Vec<(String, f64)> = store.storage().with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, confidence FROM assertions
             WHERE extracted_at < ?1 AND confidence > ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, DECAY_FLOOR], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    let count = stale.len();
    for (id, confidence) in stale {
        let decayed = (confidence * factor).max(DECAY_FLOOR);
        store.revise_confidence(&id, decayed, "decay")?;
    }

    if count > 0 {
        tracing::info!(count, "assertion confidence decayed");
    }
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beliefs::AssertionInput;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn store() -> BeliefStore {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        for id in ["e1", "e2"] {
            storage
                .with_tx(|tx| {
                    tx.execute(
                        "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at)
                         VALUES (?1, ?1, 'person', ?2, ?2)",
                        rusqlite::params![id, crate::model::db_now()],
                    )?;
                    Ok(())
                })
                .unwrap();
        }
        BeliefStore::new(storage)
    }

    fn input(subject: &str, predicate: &str, object: &str, confidence: f64) -> AssertionInput {
        AssertionInput {
            subject_entity_id: Some(subject.to_string()),
            predicate: predicate.to_string(),
            object_text: Some(object.to_string()),
            confidence: Some(confidence),
            source_type: "test".into(),
            source_id: "t-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_confidence_contradiction_severity() {
        let store = store();
        let (_, none) = store.record(input("e1", "lives_in", "NYC", 0.9)).unwrap();
        assert!(none.is_empty());

        let (_, found) = store.record(input("e1", "lives_in", "SF", 0.3)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].contradiction_type, ContradictionType::Confidence);
        assert!((found[0].severity - 0.58).abs() < 1e-9);
    }

    #[test]
    fn test_no_contradiction_without_overlap() {
        let store = store();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::days(30);

        let mut first = input("e1", "lives_in", "NYC", 0.8);
        first.valid_from = Some(t0);
        first.valid_until = Some(t1);
        store.record(first).unwrap();

        // Starts exactly when the first ends: change over time
        let mut second = input("e1", "lives_in", "SF", 0.8);
        second.valid_from = Some(t1);
        let (_, found) = store.record(second).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_temporal_and_direct_types() {
        let store = store();
        let t0 = Utc::now();

        let mut a = input("e1", "works_at", "Initech", 0.6);
        a.valid_from = Some(t0);
        store.record(a).unwrap();

        let mut b = input("e1", "works_at", "Initrode", 0.7);
        b.valid_from = Some(t0);
        let (_, found) = store.record(b).unwrap();
        assert_eq!(found[0].contradiction_type, ContradictionType::Temporal);
        assert!((found[0].severity - 0.7).abs() < 1e-9);

        // No valid_from on either side: direct
        store.record(input("e2", "likes", "tea", 0.6)).unwrap();
        let (_, found) = store.record(input("e2", "likes", "coffee", 0.7)).unwrap();
        assert_eq!(found[0].contradiction_type, ContradictionType::Direct);
        assert!((found[0].severity - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_auto_resolution_confidence_gap() {
        let store = store();
        let (high, _) = store.record(input("e1", "lives_in", "NYC", 0.9)).unwrap();
        let (low, found) = store.record(input("e1", "lives_in", "SF", 0.3)).unwrap();

        let outcome = resolve_auto(&store, &found[0].id).unwrap();
        assert_eq!(
            outcome,
            AutoResolution::Resolved {
                winning_assertion_id: high.id.clone(),
                losing_assertion_id: low.id.clone(),
            }
        );

        // Loser confidence: max(0.1, 0.3 * 0.5) = 0.15
        let loser = store.get(&low.id).unwrap().unwrap();
        assert!((loser.confidence - 0.15).abs() < 1e-9);

        // Terminal: a second resolution attempt is invalid
        assert!(resolve_auto(&store, &found[0].id).is_err());
    }

    #[test]
    fn test_high_severity_escalates_untouched() {
        let store = store();
        let (a, _) = store.record(input("e1", "likes", "tea", 0.6)).unwrap();
        let (b, found) = store.record(input("e1", "likes", "coffee", 0.7)).unwrap();
        assert!((found[0].severity - 0.8).abs() < 1e-9);

        let outcome = resolve_auto(&store, &found[0].id).unwrap();
        assert_eq!(outcome, AutoResolution::Escalated);

        // Neither confidence moves until the user decides
        assert!((store.get(&a.id).unwrap().unwrap().confidence - 0.6).abs() < 1e-9);
        assert!((store.get(&b.id).unwrap().unwrap().confidence - 0.7).abs() < 1e-9);

        // Escalated resolves only via user
        resolve_user(&store, &found[0].id, &b.id, false).unwrap();
        let resolved = get_contradiction(&store, &found[0].id).unwrap().unwrap();
        assert_eq!(resolved.resolution_status, ResolutionStatus::Resolved);
        assert_eq!(resolved.resolution_method.as_deref(), Some("user"));

        // Loser: max(0.05, 0.6 * 0.2) = 0.12
        assert!((store.get(&a.id).unwrap().unwrap().confidence - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_user_keep_both_closes_validity() {
        let store = store();
        let t_winner = Utc::now();

        store.record(input("e1", "likes", "tea", 0.6)).unwrap();
        let mut winner_input = input("e1", "likes", "coffee", 0.7);
        winner_input.source_timestamp = Some(t_winner);
        let (winner, found) = store.record(winner_input).unwrap();

        resolve_user(&store, &found[0].id, &winner.id, true).unwrap();

        // The loser's validity closes at the winner's source timestamp
        let loser_id = &found[0].assertion_id_2;
        let loser = store.get(loser_id).unwrap().unwrap();
        let until = loser.valid_until.unwrap();
        assert!((until - t_winner).num_milliseconds().abs() < 10);
        // Confidence untouched in keep-both mode
        assert!((loser.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_user_resolution_rejects_outsider() {
        let store = store();
        store.record(input("e1", "likes", "tea", 0.6)).unwrap();
        let (_, found) = store.record(input("e1", "likes", "coffee", 0.7)).unwrap();

        assert!(matches!(
            resolve_user(&store, &found[0].id, "not-a-party", false),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_decay_floors_at_point_one() {
        let store = store();
        let (a, _) = store.record(input("e1", "likes", "tea", 0.5)).unwrap();

        // Backdate the assertion two years
        let old = db_time(Utc::now() - chrono::Duration::days(730));
        store
            .storage()
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE assertions SET extracted_at = ?1 WHERE id = ?2",
                    params![old, a.id],
                )?;
                Ok(())
            })
            .unwrap();

        let touched = decay_confidence(&store, DECAY_AGE_DAYS, DECAY_FACTOR).unwrap();
        assert_eq!(touched, 1);
        let decayed = store.get(&a.id).unwrap().unwrap();
        assert!((decayed.confidence - 0.45).abs() < 1e-9);

        // Repeated decay never drops below the floor
        for _ in 0..30 {
            decay_confidence(&store, DECAY_AGE_DAYS, DECAY_FACTOR).unwrap();
        }
        let floored = store.get(&a.id).unwrap().unwrap();
        assert!(floored.confidence >= 0.1 - 1e-9);
    }

    #[test]
    fn test_unresolved_listing() {
        let store = store();
        store.record(input("e1", "likes", "tea", 0.6)).unwrap();
        store.record(input("e1", "likes", "coffee", 0.7)).unwrap();

        let unresolved = unresolved_contradictions(&store).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].resolution_status, ResolutionStatus::Pending);
    }
}
