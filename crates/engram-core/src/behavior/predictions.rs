//! Predictions
//!
//! Forward-looking guesses derived from the calendar, mined patterns, and
//! the rhythm matrix: meeting prep nudges, pattern-based anticipations, and
//! likely context switches. Predictions fire when their time arrives and are
//! verified after the fact; one whose moment passes unconfirmed is marked
//! incorrect.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::patterns::stored_patterns;
use super::rhythms::rhythm_slot;
use super::PatternType;
use crate::model::{db_now, db_time};
use crate::storage::{Result, Storage, StorageError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Most predictions generated per pass
const MAX_PREDICTIONS: usize = 10;

/// Meeting prep lead time
const PREP_LEAD_MINUTES: i64 = 5;

/// Meeting prep-review lead time
const PREP_REVIEW_LEAD_MINUTES: i64 = 30;

/// Grace period before an unconfirmed prediction is marked incorrect
const VERIFY_GRACE_MINUTES: i64 = 15;

// ============================================================================
// TYPES
// ============================================================================

/// An upcoming calendar event considered during generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingEvent {
    pub title: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
}

/// Inputs to a prediction pass
#[derive(Debug, Clone)]
pub struct PredictionContext {
    pub now: DateTime<Utc>,
    pub upcoming_events: Vec<UpcomingEvent>,
    pub active_context: Option<String>,
}

/// A stored prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: String,
    pub prediction_type: String,
    pub description: String,
    pub predicted_for: DateTime<Utc>,
    pub confidence: f64,
    pub source_pattern_id: Option<String>,
    pub fired: bool,
    pub was_correct: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            prediction_type: row.get("prediction_type")?,
            description: row.get("description")?,
            predicted_for: row.get("predicted_for")?,
            confidence: row.get("confidence")?,
            source_pattern_id: row.get("source_pattern_id")?,
            fired: row.get("fired")?,
            was_correct: row.get("was_correct")?,
            created_at: row.get("created_at")?,
            verified_at: row.get("verified_at")?,
        })
    }
}

const PREDICTION_COLUMNS: &str = "id, prediction_type, description, predicted_for, confidence,
    source_pattern_id, fired, was_correct, created_at, verified_at";

struct Candidate {
    prediction_type: &'static str,
    description: String,
    predicted_for: DateTime<Utc>,
    confidence: f64,
    source_pattern_id: Option<String>,
}

// ============================================================================
// GENERATION
// ============================================================================

/// Generate and persist predictions for the given context. At most ten are
/// produced, ordered by predicted time then confidence; duplicates of
/// still-pending predictions (same type and minute) are skipped.
pub fn generate_predictions(
    storage: &Arc<Storage>,
    ctx: &PredictionContext,
) -> Result<Vec<Prediction>> {
    let mut candidates: Vec<Candidate> = Vec::new();

    // Meeting prep: ~5 minutes before each upcoming event, with an earlier
    // review pass for meetings still half an hour out
    for event in &ctx.upcoming_events {
        if event.start_time <= ctx.now {
            continue;
        }
        let prep_at = event.start_time - Duration::minutes(PREP_LEAD_MINUTES);
        if prep_at > ctx.now {
            candidates.push(Candidate {
                prediction_type: "meeting_prep",
                description: format!("Prep for \"{}\"", event.title),
                predicted_for: prep_at,
                confidence: 0.9,
                source_pattern_id: None,
            });
        }
        let review_at = event.start_time - Duration::minutes(PREP_REVIEW_LEAD_MINUTES);
        if review_at > ctx.now {
            candidates.push(Candidate {
                prediction_type: "meeting_prep_review",
                description: format!("Review materials for \"{}\"", event.title),
                predicted_for: review_at,
                confidence: 0.7,
                source_pattern_id: None,
            });
        }
    }

    // Pattern-based anticipations whose signatures fire right now
    let hour = ctx.now.hour();
    let weekday = ctx.now.weekday().num_days_from_monday();
    for pattern in stored_patterns(storage)? {
        let fires = match pattern.pattern_type {
            PatternType::TimeOfDay => {
                pattern.signature["hour"].as_u64() == Some(hour as u64)
            }
            PatternType::DayOfWeek => {
                pattern.signature["weekday"].as_u64() == Some(weekday as u64)
            }
            _ => false,
        };
        if !fires {
            continue;
        }
        let event_type = pattern.signature["event_type"]
            .as_str()
            .unwrap_or("activity");
        candidates.push(Candidate {
            prediction_type: "pattern_anticipation",
            description: format!("Likely {event_type} around now"),
            predicted_for: ctx.now + Duration::minutes(10),
            confidence: (pattern.confidence * pattern.strength).clamp(0.0, 1.0),
            source_pattern_id: Some(pattern.id.clone()),
        });
    }

    // Context switch at the top of the next hour when the rhythm matrix
    // disagrees with the active context
    let next_hour = ctx.now + Duration::hours(1);
    if let Some(slot) = rhythm_slot(
        storage,
        next_hour.weekday().num_days_from_monday(),
        next_hour.hour(),
    )? {
        if let Some(typical) = slot.typical_context {
            if ctx.active_context.as_deref() != Some(typical.as_str()) {
                let switch_at = next_hour
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .unwrap_or(next_hour);
                candidates.push(Candidate {
                    prediction_type: "context_switch",
                    description: format!("Usually in {typical} by then"),
                    predicted_for: switch_at,
                    confidence: 0.5,
                    source_pattern_id: None,
                });
            }
        }
    }

    candidates.sort_by(|a, b| {
        a.predicted_for.cmp(&b.predicted_for).then(
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    candidates.truncate(MAX_PREDICTIONS);

    let mut stored = Vec::new();
    for candidate in candidates {
        // Skip when an unverified twin already exists in the same minute
        let minute_start = db_time(candidate.predicted_for - Duration::seconds(30));
        let minute_end = db_time(candidate.predicted_for + Duration::seconds(30));
        let exists: bool = storage.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM predictions
                    WHERE prediction_type = ?1 AND was_correct IS NULL
                      AND predicted_for >= ?2 AND predicted_for <= ?3)",
                params![candidate.prediction_type, minute_start, minute_end],
                |row| row.get(0),
            )?)
        })?;
        if exists {
            continue;
        }

        let id = Uuid::new_v4().to_string();
        storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO predictions
                    (id, prediction_type, description, predicted_for, confidence,
                     source_pattern_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    candidate.prediction_type,
                    candidate.description,
                    db_time(candidate.predicted_for),
                    candidate.confidence,
                    candidate.source_pattern_id,
                    db_now(),
                ],
            )?;
            Ok(())
        })?;
        if let Some(prediction) = get_prediction(storage, &id)? {
            stored.push(prediction);
        }
    }

    Ok(stored)
}

// ============================================================================
// FIRING & VERIFICATION
// ============================================================================

/// Fetch one prediction
pub fn get_prediction(storage: &Arc<Storage>, id: &str) -> Result<Option<Prediction>> {
    storage.with_reader(|conn| {
        conn.query_row(
            &format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE id = ?1"),
            [id],
            Prediction::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Database(other)),
        })
    })
}

/// Fire predictions whose time has arrived, returning them. Firing is
/// idempotent: an already-fired prediction never fires again.
pub fn fire_due_predictions(storage: &Arc<Storage>, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
    let due: Vec<Prediction> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions
             WHERE fired = 0 AND predicted_for <= ?1
             ORDER BY predicted_for"
        ))?;
        let rows = stmt
            .query_map([db_time(now)], Prediction::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    if !due.is_empty() {
        storage.with_tx(|tx| {
            for prediction in &due {
                tx.execute("UPDATE predictions SET fired = 1 WHERE id = ?1", [&prediction.id])?;
            }
            Ok(())
        })?;
    }
    Ok(due)
}

/// Confirm a prediction came true
pub fn confirm_prediction(storage: &Arc<Storage>, id: &str) -> Result<()> {
    storage.with_tx(|tx| {
        let changed = tx.execute(
            "UPDATE predictions SET was_correct = 1, verified_at = ?1 WHERE id = ?2",
            params![db_now(), id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    })
}

/// Mark overdue unconfirmed predictions incorrect. Returns the number
/// marked.
pub fn verify_overdue(storage: &Arc<Storage>, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = db_time(now - Duration::minutes(VERIFY_GRACE_MINUTES));
    storage.with_tx(|tx| {
        let changed = tx.execute(
            "UPDATE predictions
             SET was_correct = 0, verified_at = ?1
             WHERE was_correct IS NULL AND predicted_for < ?2",
            params![db_now(), cutoff],
        )?;
        Ok(changed)
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::patterns::{mine_patterns, upsert_pattern, MiningConfig};
    use crate::model::Event;
    use chrono::TimeZone;
    use serde_json::json;

    fn storage() -> Arc<Storage> {
        Arc::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn test_meeting_prep_predictions() {
        let storage = storage();
        let now = Utc::now();
        let ctx = PredictionContext {
            now,
            upcoming_events: vec![UpcomingEvent {
                title: "Design review".into(),
                start_time: now + Duration::hours(1),
                entity_ids: vec![],
            }],
            active_context: None,
        };

        let predictions = generate_predictions(&storage, &ctx).unwrap();
        assert_eq!(predictions.len(), 2);
        // Sorted by predicted time: review (t+30m lead) precedes prep (t-5m)
        assert_eq!(predictions[0].prediction_type, "meeting_prep_review");
        assert_eq!(predictions[1].prediction_type, "meeting_prep");
        assert!(predictions[1].predicted_for < now + Duration::hours(1));

        // Regenerating does not duplicate pending predictions
        let again = generate_predictions(&storage, &ctx).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_pattern_anticipation_fires_at_matching_hour() {
        let storage = storage();
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        let events: Vec<Event> = (0..3)
            .map(|d| Event {
                id: Uuid::new_v4().to_string(),
                event_type: "email_check".into(),
                timestamp: t + Duration::days(d),
                payload: json!({ "category": "work" }),
                context_type: None,
                entities: vec![],
                processed: false,
            })
            .collect();
        for detected in mine_patterns(&events, &MiningConfig::default()) {
            upsert_pattern(&storage, &detected).unwrap();
        }

        // At 09:xx the time-of-day pattern fires
        let ctx = PredictionContext {
            now: Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap(),
            upcoming_events: vec![],
            active_context: None,
        };
        let predictions = generate_predictions(&storage, &ctx).unwrap();
        assert!(predictions
            .iter()
            .any(|p| p.prediction_type == "pattern_anticipation"
                && p.source_pattern_id.is_some()));

        // At 14:xx it stays quiet
        let ctx = PredictionContext {
            now: Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).unwrap(),
            upcoming_events: vec![],
            active_context: None,
        };
        let predictions = generate_predictions(&storage, &ctx).unwrap();
        assert!(predictions
            .iter()
            .all(|p| p.prediction_type != "pattern_anticipation"));
    }

    #[test]
    fn test_fire_and_verify_lifecycle() {
        let storage = storage();
        let now = Utc::now();
        let ctx = PredictionContext {
            now: now - Duration::hours(2),
            upcoming_events: vec![UpcomingEvent {
                title: "Standup".into(),
                start_time: now - Duration::hours(1),
                entity_ids: vec![],
            }],
            active_context: None,
        };
        let predictions = generate_predictions(&storage, &ctx).unwrap();
        assert!(!predictions.is_empty());

        // Everything is due now; firing twice yields nothing the second time
        let fired = fire_due_predictions(&storage, now).unwrap();
        assert_eq!(fired.len(), predictions.len());
        assert!(fire_due_predictions(&storage, now).unwrap().is_empty());

        // One gets confirmed; the overdue rest go incorrect
        confirm_prediction(&storage, &fired[0].id).unwrap();
        let marked = verify_overdue(&storage, now).unwrap();
        assert_eq!(marked, fired.len() - 1);

        let confirmed = get_prediction(&storage, &fired[0].id).unwrap().unwrap();
        assert_eq!(confirmed.was_correct, Some(true));
        for p in &fired[1..] {
            let verified = get_prediction(&storage, &p.id).unwrap().unwrap();
            assert_eq!(verified.was_correct, Some(false));
            assert!(verified.verified_at.is_some());
        }
    }
}
