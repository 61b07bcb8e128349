//! Daily Rhythms
//!
//! A 7x24 matrix describing what the user's week looks like: per
//! (weekday, hour) slot, the activity distribution, a focus score, inferred
//! energy from reply latency, message volume, and the typical context.
//! Rebuilt periodically from the recent event log; upsert is
//! replace-on-conflict.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::model::{db_now, db_time};
use crate::storage::{Result, Storage};

/// Reply latency that drains energy to zero (ten minutes, in seconds)
const ENERGY_FULL_DRAIN_SECS: f64 = 600.0;

/// One slot of the rhythm matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RhythmSlot {
    /// 0 = Monday
    pub day_of_week: u32,
    pub hour: u32,
    /// Event-type counts observed in this slot
    pub activity_distribution: HashMap<String, i64>,
    /// Share of slot activity belonging to the dominant category
    pub focus_score: f64,
    /// `max(0, 1 - avg_response_time / 10 min)`
    pub energy: f64,
    pub message_volume: i64,
    pub typical_context: Option<String>,
}

/// Rebuild the rhythm matrix from the last `days` of events and messages.
/// Returns the number of slots written.
pub fn rebuild_rhythms(storage: &Arc<Storage>, days: i64) -> Result<usize> {
    let cutoff = db_time(Utc::now() - Duration::days(days));

    // Event activity per slot
    let events: Vec<(DateTime<Utc>, String, Option<String>)> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT timestamp, event_type, context_type FROM events WHERE timestamp >= ?1",
        )?;
        let rows = stmt
            .query_map([&cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    // Message volume per slot
    let message_times: Vec<DateTime<Utc>> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare("SELECT timestamp FROM messages WHERE timestamp >= ?1")?;
        let rows = stmt
            .query_map([&cutoff], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    // Reply latency per slot: incoming message -> next user message in the
    // same thread
    let reply_gaps: Vec<(DateTime<Utc>, f64)> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT m.timestamp,
                    (SELECT MIN(u.timestamp) FROM messages u
                     WHERE u.thread_id = m.thread_id
                       AND u.is_from_user = 1 AND u.timestamp > m.timestamp)
             FROM messages m
             WHERE m.is_from_user = 0 AND m.thread_id IS NOT NULL AND m.timestamp >= ?1",
        )?;
        let pairs: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = stmt
            .query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs
            .into_iter()
            .filter_map(|(incoming, reply)| {
                reply.map(|r| (incoming, (r - incoming).num_seconds() as f64))
            })
            .filter(|(_, secs)| *secs >= 0.0)
            .collect())
    })?;

    // Aggregate per slot
    type SlotKey = (u32, u32);
    let slot_of = |t: &DateTime<Utc>| -> SlotKey {
        (t.weekday().num_days_from_monday(), t.hour())
    };

    let mut activity: HashMap<SlotKey, HashMap<String, i64>> = HashMap::new();
    let mut contexts: HashMap<SlotKey, HashMap<String, i64>> = HashMap::new();
    for (timestamp, event_type, context_type) in &events {
        let slot = slot_of(timestamp);
        *activity
            .entry(slot)
            .or_default()
            .entry(event_type.clone())
            .or_default() += 1;
        if let Some(context) = context_type {
            *contexts
                .entry(slot)
                .or_default()
                .entry(context.clone())
                .or_default() += 1;
        }
    }

    let mut volume: HashMap<SlotKey, i64> = HashMap::new();
    for timestamp in &message_times {
        *volume.entry(slot_of(timestamp)).or_default() += 1;
    }

    let mut gaps: HashMap<SlotKey, Vec<f64>> = HashMap::new();
    for (timestamp, secs) in &reply_gaps {
        gaps.entry(slot_of(timestamp)).or_default().push(*secs);
    }

    let mut slots: Vec<SlotKey> = activity
        .keys()
        .chain(volume.keys())
        .chain(gaps.keys())
        .copied()
        .collect();
    slots.sort_unstable();
    slots.dedup();

    let now = db_now();
    let written = slots.len();
    storage.with_tx(|tx| {
        for slot in slots {
            let distribution = activity.remove(&slot).unwrap_or_default();
            let total: i64 = distribution.values().sum();
            let dominant = distribution.values().max().copied().unwrap_or(0);
            let focus = if total > 0 {
                dominant as f64 / total as f64
            } else {
                0.0
            };

            let energy = match gaps.get(&slot) {
                Some(slot_gaps) if !slot_gaps.is_empty() => {
                    let avg = slot_gaps.iter().sum::<f64>() / slot_gaps.len() as f64;
                    (1.0 - avg / ENERGY_FULL_DRAIN_SECS).max(0.0)
                }
                _ => 0.0,
            };

            let typical_context = contexts.remove(&slot).and_then(|counts| {
                counts
                    .into_iter()
                    .max_by_key(|(_, count)| *count)
                    .map(|(context, _)| context)
            });

            tx.execute(
                "INSERT INTO daily_rhythms
                    (day_of_week, hour, activity_distribution, focus_score, energy,
                     message_volume, typical_context, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (day_of_week, hour) DO UPDATE SET
                    activity_distribution = excluded.activity_distribution,
                    focus_score = excluded.focus_score,
                    energy = excluded.energy,
                    message_volume = excluded.message_volume,
                    typical_context = excluded.typical_context,
                    updated_at = excluded.updated_at",
                params![
                    slot.0 as i64,
                    slot.1 as i64,
                    serde_json::to_string(&distribution).unwrap_or_else(|_| "{}".into()),
                    focus,
                    energy,
                    volume.get(&slot).copied().unwrap_or(0),
                    typical_context,
                    now,
                ],
            )?;
        }
        Ok(())
    })?;

    Ok(written)
}

/// Load one slot of the matrix
pub fn rhythm_slot(storage: &Arc<Storage>, day_of_week: u32, hour: u32) -> Result<Option<RhythmSlot>> {
    storage.with_reader(|conn| {
        conn.query_row(
            "SELECT day_of_week, hour, activity_distribution, focus_score, energy,
                    message_volume, typical_context
             FROM daily_rhythms WHERE day_of_week = ?1 AND hour = ?2",
            params![day_of_week as i64, hour as i64],
            |row| {
                let distribution_raw: String = row.get(2)?;
                Ok(RhythmSlot {
                    day_of_week: row.get::<_, i64>(0)? as u32,
                    hour: row.get::<_, i64>(1)? as u32,
                    activity_distribution: serde_json::from_str(&distribution_raw)
                        .unwrap_or_default(),
                    focus_score: row.get(3)?,
                    energy: row.get(4)?,
                    message_volume: row.get(5)?,
                    typical_context: row.get(6)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(crate::storage::StorageError::Database(other)),
        })
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn insert_event(
        storage: &Arc<Storage>,
        event_type: &str,
        context: Option<&str>,
        timestamp: DateTime<Utc>,
    ) {
        storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO events (id, event_type, timestamp, payload, context_type)
                     VALUES (?1, ?2, ?3, '{}', ?4)",
                    params![
                        Uuid::new_v4().to_string(),
                        event_type,
                        db_time(timestamp),
                        context,
                    ],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rebuild_aggregates_slots() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let now = Utc::now();

        insert_event(&storage, "email_check", Some("work"), now);
        insert_event(&storage, "email_check", Some("work"), now);
        insert_event(&storage, "calendar_view", Some("work"), now);

        let written = rebuild_rhythms(&storage, 7).unwrap();
        assert_eq!(written, 1);

        let slot = rhythm_slot(
            &storage,
            now.weekday().num_days_from_monday(),
            now.hour(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(slot.activity_distribution["email_check"], 2);
        // Dominant activity is 2 of 3 events
        assert!((slot.focus_score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(slot.typical_context.as_deref(), Some("work"));
        // No reply data: energy bottoms out
        assert_eq!(slot.energy, 0.0);
    }

    #[test]
    fn test_energy_from_reply_latency() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let now = Utc::now();

        storage
            .with_tx(|tx| {
                // Incoming message answered three minutes later
                tx.execute(
                    "INSERT INTO messages
                        (id, source_type, source_id, thread_id, body_text, timestamp, is_from_user)
                     VALUES ('m1', 'imessage', 'i-1', 'th-1', 'ping', ?1, 0)",
                    [db_time(now)],
                )?;
                tx.execute(
                    "INSERT INTO messages
                        (id, source_type, source_id, thread_id, body_text, timestamp, is_from_user)
                     VALUES ('m2', 'imessage', 'i-2', 'th-1', 'pong', ?1, 1)",
                    [db_time(now + Duration::minutes(3))],
                )?;
                Ok(())
            })
            .unwrap();

        rebuild_rhythms(&storage, 7).unwrap();
        let slot = rhythm_slot(
            &storage,
            now.weekday().num_days_from_monday(),
            now.hour(),
        )
        .unwrap()
        .unwrap();
        // 180s of 600s drained: energy = 0.7
        assert!((slot.energy - 0.7).abs() < 1e-6);
        assert!(slot.message_volume >= 1);
    }

    #[test]
    fn test_rebuild_is_replace_on_conflict() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let now = Utc::now();
        insert_event(&storage, "email_check", None, now);
        rebuild_rhythms(&storage, 7).unwrap();

        insert_event(&storage, "email_check", None, now);
        rebuild_rhythms(&storage, 7).unwrap();

        let slot = rhythm_slot(
            &storage,
            now.weekday().num_days_from_monday(),
            now.hour(),
        )
        .unwrap()
        .unwrap();
        // Second rebuild replaced, not accumulated
        assert_eq!(slot.activity_distribution["email_check"], 2);
    }
}
