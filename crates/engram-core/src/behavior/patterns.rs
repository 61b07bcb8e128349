//! Pattern Mining
//!
//! Four detectors over a window of events, each gated on a minimum
//! occurrence threshold and a confidence floor. Detection is pure; matches
//! are persisted with [`upsert_pattern`], which bumps strength on
//! re-observation. Strength decays periodically and weak patterns are
//! pruned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::params;
use serde_json::json;
use uuid::Uuid;

use super::{period_confidence, BehaviorPattern, PatternType};
use crate::model::{db_now, db_time, Event};
use crate::storage::{Result, Storage};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Strength gained per observation
const STRENGTH_PER_OBSERVATION: f64 = 0.05;

/// Default periodic strength decay multiplier
pub const STRENGTH_DECAY_FACTOR: f64 = 0.99;

/// Patterns below this strength may be pruned
pub const PRUNE_STRENGTH: f64 = 0.1;

/// Sequence gap bounds (seconds)
const SEQUENCE_GAP_MIN_SECS: i64 = 60;
const SEQUENCE_GAP_MAX_SECS: i64 = 30 * 60;

/// Trigger-response window (seconds)
const TRIGGER_RESPONSE_SECS: i64 = 60;

/// Event types that count as triggers for trigger-response mining
const TRIGGER_EVENT_TYPES: &[&str] = &[
    "message_received",
    "meeting_started",
    "reminder_fired",
    "app_opened",
];

/// Mining thresholds
#[derive(Debug, Clone)]
pub struct MiningConfig {
    /// Minimum occurrences (distinct periods for periodic patterns)
    pub min_occurrences: usize,
    /// Detected patterns below this confidence are dropped
    pub confidence_floor: f64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 3,
            confidence_floor: 0.5,
        }
    }
}

/// A freshly mined pattern, not yet persisted
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    pub signature: serde_json::Value,
    pub category: Option<String>,
    pub occurrence_count: i64,
    pub distinct_periods: i64,
    pub confidence: f64,
    pub occurrence_times: Vec<DateTime<Utc>>,
}

fn event_category(event: &Event) -> String {
    event
        .payload
        .get("category")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| event.context_type.clone())
        .unwrap_or_else(|| "general".to_string())
}

// ============================================================================
// DETECTORS
// ============================================================================

/// Run all four detectors over a window of events
pub fn mine_patterns(events: &[Event], config: &MiningConfig) -> Vec<DetectedPattern> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    let mut detected = Vec::new();
    detected.extend(detect_time_of_day(&sorted, config));
    detected.extend(detect_sequences(&sorted, config));
    detected.extend(detect_day_of_week(&sorted, config));
    detected.extend(detect_trigger_response(&sorted, config));
    detected.retain(|p| p.confidence >= config.confidence_floor);
    detected
}

/// Same event type and category at the same hour, across enough distinct
/// calendar days
fn detect_time_of_day(events: &[&Event], config: &MiningConfig) -> Vec<DetectedPattern> {
    let mut groups: HashMap<(String, String, u32), (HashSet<String>, Vec<DateTime<Utc>>)> =
        HashMap::new();

    for event in events {
        let key = (
            event.event_type.clone(),
            event_category(event),
            event.timestamp.hour(),
        );
        let entry = groups.entry(key).or_default();
        entry.0.insert(event.timestamp.date_naive().to_string());
        entry.1.push(event.timestamp);
    }

    groups
        .into_iter()
        .filter(|(_, (days, _))| days.len() >= config.min_occurrences)
        .map(|((event_type, category, hour), (days, times))| DetectedPattern {
            pattern_type: PatternType::TimeOfDay,
            signature: json!({ "event_type": event_type, "category": category, "hour": hour }),
            category: Some(category),
            occurrence_count: times.len() as i64,
            distinct_periods: days.len() as i64,
            confidence: period_confidence(days.len() as i64),
            occurrence_times: times,
        })
        .collect()
}

/// Consecutive events 1-30 minutes apart, grouped by category pair
fn detect_sequences(events: &[&Event], config: &MiningConfig) -> Vec<DetectedPattern> {
    let mut groups: HashMap<(String, String), Vec<DateTime<Utc>>> = HashMap::new();

    for window in events.windows(2) {
        let (a, b) = (window[0], window[1]);
        let gap = (b.timestamp - a.timestamp).num_seconds();
        if !(SEQUENCE_GAP_MIN_SECS..=SEQUENCE_GAP_MAX_SECS).contains(&gap) {
            continue;
        }
        let key = (event_category(a), event_category(b));
        if key.0 == key.1 {
            continue;
        }
        groups.entry(key).or_default().push(b.timestamp);
    }

    groups
        .into_iter()
        .filter(|(_, times)| times.len() >= config.min_occurrences)
        .map(|((from, to), times)| DetectedPattern {
            pattern_type: PatternType::Sequence,
            signature: json!({ "from_category": from, "to_category": to }),
            category: Some(to),
            occurrence_count: times.len() as i64,
            distinct_periods: times.len() as i64,
            confidence: period_confidence(times.len() as i64),
            occurrence_times: times,
        })
        .collect()
}

/// Same event type on the same weekday across enough distinct weeks
fn detect_day_of_week(events: &[&Event], config: &MiningConfig) -> Vec<DetectedPattern> {
    let mut groups: HashMap<(String, u32), (HashSet<String>, Vec<DateTime<Utc>>)> = HashMap::new();

    for event in events {
        let key = (
            event.event_type.clone(),
            event.timestamp.weekday().num_days_from_monday(),
        );
        let week = format!(
            "{}-{}",
            event.timestamp.iso_week().year(),
            event.timestamp.iso_week().week()
        );
        let entry = groups.entry(key).or_default();
        entry.0.insert(week);
        entry.1.push(event.timestamp);
    }

    groups
        .into_iter()
        .filter(|(_, (weeks, _))| weeks.len() >= config.min_occurrences)
        .map(|((event_type, weekday), (weeks, times))| DetectedPattern {
            pattern_type: PatternType::DayOfWeek,
            signature: json!({ "event_type": event_type, "weekday": weekday }),
            category: None,
            occurrence_count: times.len() as i64,
            distinct_periods: weeks.len() as i64,
            confidence: period_confidence(weeks.len() as i64),
            occurrence_times: times,
        })
        .collect()
}

/// A recognized trigger answered by another event within a minute
fn detect_trigger_response(events: &[&Event], config: &MiningConfig) -> Vec<DetectedPattern> {
    let mut groups: HashMap<(String, String), Vec<DateTime<Utc>>> = HashMap::new();

    for (i, trigger) in events.iter().enumerate() {
        if !TRIGGER_EVENT_TYPES.contains(&trigger.event_type.as_str()) {
            continue;
        }
        for response in events.iter().skip(i + 1) {
            let gap = (response.timestamp - trigger.timestamp).num_seconds();
            if gap > TRIGGER_RESPONSE_SECS {
                break;
            }
            if gap <= 0 || response.event_type == trigger.event_type {
                continue;
            }
            groups
                .entry((trigger.event_type.clone(), response.event_type.clone()))
                .or_default()
                .push(response.timestamp);
            break;
        }
    }

    groups
        .into_iter()
        .filter(|(_, times)| times.len() >= config.min_occurrences)
        .map(|((trigger, response), times)| DetectedPattern {
            pattern_type: PatternType::TriggerResponse,
            signature: json!({ "trigger": trigger, "response": response }),
            category: None,
            occurrence_count: times.len() as i64,
            distinct_periods: times.len() as i64,
            confidence: period_confidence(times.len() as i64),
            occurrence_times: times,
        })
        .collect()
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Insert a detected pattern, or fold it into the existing row with the
/// same type and signature: occurrence counts accumulate and strength rises
/// by 0.05 per new observation (capped at 1).
pub fn upsert_pattern(storage: &Arc<Storage>, detected: &DetectedPattern) -> Result<String> {
    let signature = detected.signature.to_string();
    let existing: Option<(String, i64, f64)> = storage.with_reader(|conn| {
        conn.query_row(
            "SELECT id, occurrence_count, strength FROM behavior_patterns
             WHERE pattern_type = ?1 AND signature = ?2",
            params![detected.pattern_type.as_str(), signature],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(crate::storage::StorageError::Database(other)),
        })
    })?;

    let times_json = serde_json::to_string(
        &detected
            .occurrence_times
            .iter()
            .map(|t| db_time(*t))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());
    let now = db_now();

    match existing {
        Some((id, old_count, old_strength)) => {
            let new_observations = (detected.occurrence_count - old_count).max(0);
            let strength = (old_strength
                + new_observations as f64 * STRENGTH_PER_OBSERVATION)
                .min(1.0);
            storage.with_tx(|tx| {
                tx.execute(
                    "UPDATE behavior_patterns SET
                        occurrence_count = ?1, distinct_periods = ?2, confidence = ?3,
                        strength = ?4, occurrence_times = ?5, last_seen = ?6
                     WHERE id = ?7",
                    params![
                        detected.occurrence_count.max(old_count),
                        detected.distinct_periods,
                        detected.confidence,
                        strength,
                        times_json,
                        now,
                        id,
                    ],
                )?;
                Ok(())
            })?;
            Ok(id)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let strength =
                (detected.occurrence_count as f64 * STRENGTH_PER_OBSERVATION).min(1.0);
            storage.with_tx(|tx| {
                tx.execute(
                    "INSERT INTO behavior_patterns
                        (id, pattern_type, signature, category, occurrence_count,
                         distinct_periods, confidence, strength, occurrence_times,
                         first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        id,
                        detected.pattern_type.as_str(),
                        signature,
                        detected.category,
                        detected.occurrence_count,
                        detected.distinct_periods,
                        detected.confidence,
                        strength,
                        times_json,
                        now,
                    ],
                )?;
                Ok(())
            })?;
            Ok(id)
        }
    }
}

/// All stored patterns
pub fn stored_patterns(storage: &Arc<Storage>) -> Result<Vec<BehaviorPattern>> {
    storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, pattern_type, signature, category, occurrence_count, distinct_periods,
                    confidence, strength, occurrence_times, first_seen, last_seen
             FROM behavior_patterns ORDER BY strength DESC",
        )?;
        let rows = stmt
            .query_map([], BehaviorPattern::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
}

/// Decay every pattern's strength and prune those that fell below the
/// threshold. Returns `(decayed, pruned)`.
pub fn decay_strengths(storage: &Arc<Storage>, factor: f64) -> Result<(usize, usize)> {
    storage.with_tx(|tx| {
        let decayed = tx.execute(
            "UPDATE behavior_patterns SET strength = strength * ?1",
            [factor],
        )?;
        let pruned = tx.execute(
            "DELETE FROM behavior_patterns WHERE strength < ?1",
            [PRUNE_STRENGTH],
        )?;
        Ok((decayed, pruned))
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(event_type: &str, category: &str, timestamp: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            timestamp,
            payload: json!({ "category": category }),
            context_type: None,
            entities: vec![],
            processed: false,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() // a Monday
    }

    #[test]
    fn test_time_of_day_needs_distinct_days() {
        let t = base_time();
        // Same hour on three distinct days
        let events: Vec<Event> = (0..3)
            .map(|d| event("email_check", "work", t + Duration::days(d)))
            .collect();
        let patterns = mine_patterns(&events, &MiningConfig::default());
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::TimeOfDay);
        assert_eq!(patterns[0].signature["hour"], 9);
        assert!(patterns[0].confidence >= 0.5);

        // Three times the same day is no habit
        let same_day: Vec<Event> = (0..3)
            .map(|m| event("email_check", "work", t + Duration::minutes(m)))
            .collect();
        assert!(mine_patterns(&same_day, &MiningConfig::default()).is_empty());
    }

    #[test]
    fn test_sequence_gap_bounds() {
        let t = base_time();
        let mut events = Vec::new();
        // Three A->B transitions with a 10-minute gap, on separate days to
        // keep the time-of-day detector quiet
        for d in 0..3 {
            let day = t + Duration::days(d) + Duration::hours(d as i64);
            events.push(event("app_focus", "email", day));
            events.push(event("app_focus", "calendar", day + Duration::minutes(10)));
        }
        let patterns = mine_patterns(&events, &MiningConfig::default());
        let seq: Vec<_> = patterns
            .iter()
            .filter(|p| p.pattern_type == PatternType::Sequence)
            .collect();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].signature["from_category"], "email");
        assert_eq!(seq[0].signature["to_category"], "calendar");

        // Sub-minute gaps never form sequences
        let mut rapid = Vec::new();
        for d in 0..3 {
            let day = t + Duration::days(d);
            rapid.push(event("app_focus", "email", day));
            rapid.push(event("app_focus", "calendar", day + Duration::seconds(20)));
        }
        let patterns = mine_patterns(&rapid, &MiningConfig::default());
        assert!(patterns
            .iter()
            .all(|p| p.pattern_type != PatternType::Sequence));
    }

    #[test]
    fn test_day_of_week_needs_distinct_weeks() {
        let t = base_time();
        let events: Vec<Event> = (0..3)
            .map(|w| event("team_sync", "work", t + Duration::weeks(w)))
            .collect();
        let patterns = mine_patterns(&events, &MiningConfig::default());
        let dow: Vec<_> = patterns
            .iter()
            .filter(|p| p.pattern_type == PatternType::DayOfWeek)
            .collect();
        assert_eq!(dow.len(), 1);
        assert_eq!(dow[0].signature["weekday"], 0);
    }

    #[test]
    fn test_trigger_response_window() {
        let t = base_time();
        let mut events = Vec::new();
        for d in 0..3 {
            let day = t + Duration::days(d);
            events.push(event("message_received", "chat", day));
            events.push(event("message_sent", "chat", day + Duration::seconds(30)));
        }
        let patterns = mine_patterns(&events, &MiningConfig::default());
        let tr: Vec<_> = patterns
            .iter()
            .filter(|p| p.pattern_type == PatternType::TriggerResponse)
            .collect();
        assert_eq!(tr.len(), 1);
        assert_eq!(tr[0].signature["trigger"], "message_received");
        assert_eq!(tr[0].signature["response"], "message_sent");
    }

    #[test]
    fn test_upsert_bumps_strength() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let t = base_time();
        let events: Vec<Event> = (0..3)
            .map(|d| event("email_check", "work", t + Duration::days(d)))
            .collect();
        let detected = &mine_patterns(&events, &MiningConfig::default())[0];

        let id = upsert_pattern(&storage, detected).unwrap();
        let initial = stored_patterns(&storage).unwrap()[0].strength;
        assert!((initial - 0.15).abs() < 1e-9);

        // Re-mining with one more observation bumps the same row
        let mut more = events.clone();
        more.push(event("email_check", "work", t + Duration::days(3)));
        let redetected = &mine_patterns(&more, &MiningConfig::default())[0];
        let same_id = upsert_pattern(&storage, redetected).unwrap();
        assert_eq!(id, same_id);

        let patterns = stored_patterns(&storage).unwrap();
        assert_eq!(patterns.len(), 1);
        assert!((patterns[0].strength - 0.20).abs() < 1e-9);
        assert_eq!(patterns[0].occurrence_count, 4);
    }

    #[test]
    fn test_decay_and_prune() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let t = base_time();
        let events: Vec<Event> = (0..3)
            .map(|d| event("email_check", "work", t + Duration::days(d)))
            .collect();
        let detected = &mine_patterns(&events, &MiningConfig::default())[0];
        upsert_pattern(&storage, detected).unwrap();

        // 0.15 decays below the 0.1 prune line in ~41 cycles
        for _ in 0..45 {
            decay_strengths(&storage, STRENGTH_DECAY_FACTOR).unwrap();
        }
        assert!(stored_patterns(&storage).unwrap().is_empty());
    }
}
