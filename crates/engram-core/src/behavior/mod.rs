//! Behavioral Engine
//!
//! Mines the event log for recurring structure (habits, sequences, weekly
//! routines, trigger-response reflexes), maintains the 7x24 daily-rhythm
//! matrix, and turns both into forward-looking predictions that are verified
//! after the fact.

pub mod patterns;
pub mod predictions;
pub mod rhythms;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use patterns::{decay_strengths, mine_patterns, upsert_pattern, MiningConfig};
pub use predictions::{
    confirm_prediction, fire_due_predictions, generate_predictions, verify_overdue, Prediction,
    PredictionContext, UpcomingEvent,
};
pub use rhythms::{rebuild_rhythms, RhythmSlot};

// ============================================================================
// PATTERN TYPES
// ============================================================================

/// The closed set of mined pattern variants. New kinds extend this enum,
/// not a class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Same activity at the same hour across distinct days
    TimeOfDay,
    /// A followed by B within a 1-30 minute gap
    Sequence,
    /// Same activity on the same weekday across distinct weeks
    DayOfWeek,
    /// A trigger event answered within a minute
    TriggerResponse,
}

impl PatternType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::TimeOfDay => "time_of_day",
            PatternType::Sequence => "sequence",
            PatternType::DayOfWeek => "day_of_week",
            PatternType::TriggerResponse => "trigger_response",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "sequence" => PatternType::Sequence,
            "day_of_week" => PatternType::DayOfWeek,
            "trigger_response" => PatternType::TriggerResponse,
            _ => PatternType::TimeOfDay,
        }
    }
}

/// A mined behavior pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorPattern {
    pub id: String,
    pub pattern_type: PatternType,
    /// The identifying signature (hour, weekday, event types involved)
    pub signature: serde_json::Value,
    pub category: Option<String>,
    pub occurrence_count: i64,
    /// Distinct days/weeks the pattern was observed in
    pub distinct_periods: i64,
    /// Bounded rising function of `distinct_periods`
    pub confidence: f64,
    /// Habit strength in [0, 1]: +0.05 per observation, decayed periodically
    pub strength: f64,
    pub occurrence_times: Vec<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl BehaviorPattern {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let signature_raw: String = row.get("signature")?;
        let times_raw: Option<String> = row.get("occurrence_times")?;
        Ok(Self {
            id: row.get("id")?,
            pattern_type: PatternType::parse_name(&row.get::<_, String>("pattern_type")?),
            signature: serde_json::from_str(&signature_raw)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            category: row.get("category")?,
            occurrence_count: row.get("occurrence_count")?,
            distinct_periods: row.get("distinct_periods")?,
            confidence: row.get("confidence")?,
            strength: row.get("strength")?,
            occurrence_times: times_raw
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
        })
    }
}

/// Confidence as a bounded rising function of the distinct-period count
pub(crate) fn period_confidence(distinct_periods: i64) -> f64 {
    let p = distinct_periods.max(0) as f64;
    p / (p + 2.0)
}
