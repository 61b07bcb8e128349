//! Engagement Scoring & Adaptation
//!
//! Observes how the user treats AI drafts (edits, sentiment, thread
//! continuation), folds the signal into the style profile at a decaying
//! learning rate, and refuses to adapt at all while the user is venting.
//! Change points in the adapted style are caught by the CUSUM detector and
//! audited with `was_change_point = true`.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::cusum::{CusumDetector, StyleVector, DIMENSION_NAMES};
use super::{
    compute_recipient_style, compute_user_style, load_recipient_profile, load_user_profile,
    save_recipient_profile, save_user_profile, RecipientStyleProfile, StyleProfile,
    STYLE_WINDOW_MESSAGES,
};
use crate::model::{db_now, db_time};
use crate::storage::{Result, Storage, StorageError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Component weights for engagement scoring
const WEIGHT_EDIT: f64 = 0.35;
const WEIGHT_SENTIMENT: f64 = 0.30;
const WEIGHT_LENGTH: f64 = 0.20;
const WEIGHT_CONTINUATION: f64 = 0.10;

/// A score is actionable when this much signal weight was present
pub const ACTIONABLE_CONFIDENCE: f64 = 0.3;

/// Per-session cap numerator for dimension changes
const SESSION_CAP: f64 = 0.01;

/// Vent-mode thresholds
const VENT_SENTIMENT_NEGATIVE: f64 = -0.5;
const VENT_SENTIMENT_STRONG: f64 = -0.7;
const VENT_THREAD_LENGTH: i64 = 5;
const VENT_VELOCITY_PER_MIN: f64 = 3.0;
const VENT_CAPS_RATIO: f64 = 0.3;
const VENT_SCORE_THRESHOLD: f64 = 3.0;

// ============================================================================
// PURE FUNCTIONS
// ============================================================================

/// Learning-rate schedule: starts at 0.3 and decays toward the 0.05 floor as
/// the interaction count grows. `rate(0) = 0.3`; monotonically
/// non-increasing.
pub fn calculate_learning_rate(interaction_count: i64) -> f64 {
    (0.3 * 0.9f64.powf(interaction_count as f64 / 10.0)).max(0.05)
}

/// Vent-mode detection. Each firing signal contributes a point (strongly
/// negative sentiment contributes two); venting is declared at three.
pub fn detect_vent_mode(
    sentiment: f64,
    thread_length: i64,
    messages_per_minute: f64,
    caps_ratio: f64,
) -> bool {
    vent_score(sentiment, thread_length, messages_per_minute, caps_ratio) >= VENT_SCORE_THRESHOLD
}

fn vent_score(
    sentiment: f64,
    thread_length: i64,
    messages_per_minute: f64,
    caps_ratio: f64,
) -> f64 {
    let mut score = 0.0;
    if sentiment < VENT_SENTIMENT_NEGATIVE {
        score += 1.0;
        if sentiment < VENT_SENTIMENT_STRONG {
            score += 1.0;
        }
    }
    if thread_length > VENT_THREAD_LENGTH && sentiment < 0.0 {
        score += 1.0;
    }
    if messages_per_minute > VENT_VELOCITY_PER_MIN {
        score += 1.0;
    }
    if caps_ratio > VENT_CAPS_RATIO {
        score += 1.0;
    }
    score
}

// ============================================================================
// ENGAGEMENT TYPES
// ============================================================================

/// Observable properties of one draft interaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementSignal {
    /// Id of the AI draft, when known
    pub draft_id: Option<String>,
    pub ai_draft_length: Option<usize>,
    pub user_final_length: Option<usize>,
    /// Sentiment of the counterparty's response, in [-1, 1]
    pub user_response_sentiment: Option<f64>,
    pub thread_length: Option<i64>,
    pub thread_continued: Option<bool>,
    pub context_type: Option<String>,
    pub recipient_entity_id: Option<String>,
}

/// Scored engagement with per-component breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementScore {
    /// Weighted mean of the available components
    pub overall: f64,
    /// Sum of the weights that were present
    pub confidence: f64,
    pub edit_score: Option<f64>,
    pub sentiment_score: Option<f64>,
    pub length_score: Option<f64>,
    pub continuation_score: Option<f64>,
}

impl EngagementScore {
    /// Enough signal arrived to act on
    pub fn is_actionable(&self) -> bool {
        self.confidence >= ACTIONABLE_CONFIDENCE
    }
}

/// Score an engagement signal. Missing components contribute nothing and do
/// not dilute: the overall is normalized by the weight actually present.
pub fn score_engagement(signal: &EngagementSignal) -> EngagementScore {
    let mut weighted_sum = 0.0;
    let mut weight_present = 0.0;

    let edit_score = match (signal.ai_draft_length, signal.user_final_length) {
        (Some(draft), Some(final_len)) if draft > 0 => {
            let edit_ratio = (final_len as f64 - draft as f64).abs() / draft as f64;
            Some(1.0 - edit_ratio.min(1.0))
        }
        _ => None,
    };
    if let Some(s) = edit_score {
        weighted_sum += s * WEIGHT_EDIT;
        weight_present += WEIGHT_EDIT;
    }

    let sentiment_score = signal
        .user_response_sentiment
        .map(|s| (s.clamp(-1.0, 1.0) + 1.0) / 2.0);
    if let Some(s) = sentiment_score {
        weighted_sum += s * WEIGHT_SENTIMENT;
        weight_present += WEIGHT_SENTIMENT;
    }

    let length_score = match (signal.ai_draft_length, signal.user_final_length) {
        (Some(draft), Some(final_len)) if draft > 0 => {
            Some((final_len as f64 / draft as f64).min(2.0) / 2.0)
        }
        _ => None,
    };
    if let Some(s) = length_score {
        weighted_sum += s * WEIGHT_LENGTH;
        weight_present += WEIGHT_LENGTH;
    }

    let continuation_score = signal
        .thread_continued
        .map(|continued| if continued { 1.0 } else { 0.0 });
    if let Some(s) = continuation_score {
        weighted_sum += s * WEIGHT_CONTINUATION;
        weight_present += WEIGHT_CONTINUATION;
    }

    let overall = if weight_present > 0.0 {
        weighted_sum / weight_present
    } else {
        0.0
    };

    EngagementScore {
        overall,
        confidence: weight_present,
        edit_score,
        sentiment_score,
        length_score,
        continuation_score,
    }
}

// ============================================================================
// ADAPTATION TYPES
// ============================================================================

/// Session signals checked for venting before any adaptation
#[derive(Debug, Clone, Default)]
pub struct VentSignals {
    pub sentiment: f64,
    pub thread_length: i64,
    pub messages_per_minute: f64,
    pub caps_ratio: f64,
}

/// One adaptation step: observed style targets plus session context
#[derive(Debug, Clone)]
pub struct AdaptationRequest {
    /// Target values per dimension, index-aligned with
    /// [`DIMENSION_NAMES`]
    pub observed: StyleVector,
    /// Session engagement score, bounding the per-dimension change
    pub session_engagement: f64,
    /// Vent detection inputs
    pub vent: VentSignals,
}

/// Result of an adaptation attempt
#[derive(Debug, Clone)]
pub struct AdaptationOutcome {
    /// False when adaptation was frozen
    pub applied: bool,
    /// Learning rate used (0 when frozen)
    pub learning_rate: f64,
    /// Why the outcome happened
    pub reason: String,
    /// The CUSUM detector declared a change point on this update
    pub change_detected: bool,
    /// Per-dimension `(name, old, new)` changes actually applied
    pub changes: Vec<(String, f64, f64)>,
}

// ============================================================================
// STYLE ENGINE
// ============================================================================

/// Style extraction, engagement logging, and guarded adaptation
pub struct StyleEngine {
    storage: Arc<Storage>,
    cusum: Mutex<CusumDetector>,
}

impl StyleEngine {
    /// Create over shared storage with a default change-point detector
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cusum: Mutex::new(CusumDetector::default()),
        }
    }

    /// Current user style profile (defaults when never extracted)
    pub fn user_profile(&self) -> Result<StyleProfile> {
        load_user_profile(&self.storage)
    }

    /// Recipient profile, when one has been computed
    pub fn recipient_profile(&self, entity_id: &str) -> Result<Option<RecipientStyleProfile>> {
        load_recipient_profile(&self.storage, entity_id)
    }

    // ========================================================================
    // EXTRACTION
    // ========================================================================

    /// Re-extract the user's style from their recent sent messages and
    /// persist it
    pub fn extract_user_style(&self) -> Result<StyleProfile> {
        let bodies: Vec<String> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body_text FROM messages
                 WHERE is_from_user = 1
                 ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([STYLE_WINDOW_MESSAGES as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })?;

        let previous = load_user_profile(&self.storage)?;
        let refs: Vec<&str> = bodies.iter().map(|b| b.as_str()).collect();
        let profile = compute_user_style(&refs, previous.interaction_count);
        save_user_profile(&self.storage, &profile)?;
        tracing::debug!(messages = refs.len(), "user style extracted");
        Ok(profile)
    }

    /// Re-extract the style used toward one recipient. Returns None (and
    /// stores nothing) below the minimum message count.
    pub fn extract_recipient_style(
        &self,
        entity_id: &str,
    ) -> Result<Option<RecipientStyleProfile>> {
        let needle = format!("%\"{entity_id}\"%");
        let bodies: Vec<String> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body_text FROM messages
                 WHERE is_from_user = 1 AND recipient_entity_ids LIKE ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![needle, STYLE_WINDOW_MESSAGES as i64], |row| {
                    row.get(0)
                })?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })?;

        let gaps = self.response_gaps_hours(entity_id)?;
        let refs: Vec<&str> = bodies.iter().map(|b| b.as_str()).collect();
        let profile = compute_recipient_style(entity_id, &refs, &gaps, refs.len() as i64);
        if let Some(ref profile) = profile {
            save_recipient_profile(&self.storage, profile)?;
        }
        Ok(profile)
    }

    /// Observed reply latencies of a recipient: for each message they sent
    /// in a thread, hours until the user's next message in that thread
    fn response_gaps_hours(&self, entity_id: &str) -> Result<Vec<f64>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.timestamp,
                        (SELECT MIN(u.timestamp) FROM messages u
                         WHERE u.thread_id = m.thread_id
                           AND u.is_from_user = 1 AND u.timestamp > m.timestamp)
                 FROM messages m
                 WHERE m.sender_entity_id = ?1 AND m.thread_id IS NOT NULL",
            )?;
            let pairs: Vec<(chrono::DateTime<Utc>, Option<chrono::DateTime<Utc>>)> = stmt
                .query_map([entity_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pairs
                .into_iter()
                .filter_map(|(theirs, reply)| {
                    reply.map(|r| (r - theirs).num_seconds() as f64 / 3600.0)
                })
                .filter(|h| *h >= 0.0)
                .collect())
        })
    }

    // ========================================================================
    // ENGAGEMENT LOG
    // ========================================================================

    /// Append an engagement event. The log is append-only; reads observe
    /// insertion order.
    pub fn record_engagement(&self, interaction_type: &str, signal: &EngagementSignal) -> Result<()> {
        let edit_ratio = match (signal.ai_draft_length, signal.user_final_length) {
            (Some(draft), Some(final_len)) if draft > 0 => {
                Some((final_len as f64 - draft as f64).abs() / draft as f64)
            }
            _ => None,
        };
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO engagement_events
                    (interaction_type, timestamp, ai_draft_length, user_final_length,
                     edit_ratio, thread_length, user_response_sentiment, context_type,
                     recipient_entity_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    interaction_type,
                    db_now(),
                    signal.ai_draft_length.map(|v| v as i64),
                    signal.user_final_length.map(|v| v as i64),
                    edit_ratio,
                    signal.thread_length,
                    signal.user_response_sentiment,
                    signal.context_type,
                    signal.recipient_entity_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Record that a thread the AI drafted into kept going. The semantics
    /// live entirely in the interaction type; there is no boolean column.
    pub fn record_thread_continued(&self, recipient_entity_id: Option<&str>) -> Result<()> {
        self.record_engagement(
            "thread_continued",
            &EngagementSignal {
                recipient_entity_id: recipient_entity_id.map(|s| s.to_string()),
                ..Default::default()
            },
        )
    }

    /// Fold a scored interaction into the engagement baseline EMA.
    ///
    /// The statement computes `(1 - alpha) * old + alpha * new` with alpha
    /// as the bound parameter; the binding order is load-bearing and pinned
    /// by test.
    pub fn update_baseline_with_interaction(&self, score: f64, alpha: f64) -> Result<f64> {
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO engagement_baseline (user_id, baseline, interaction_count, updated_at)
                 VALUES ('default', ?2, 1, ?3)
                 ON CONFLICT (user_id) DO UPDATE SET
                    baseline = (1.0 - ?1) * baseline + ?1 * ?2,
                    interaction_count = interaction_count + 1,
                    updated_at = ?3",
                params![alpha, score.clamp(0.0, 1.0), db_now()],
            )?;
            let baseline: f64 = tx.query_row(
                "SELECT baseline FROM engagement_baseline WHERE user_id = 'default'",
                [],
                |row| row.get(0),
            )?;
            Ok(baseline)
        })
    }

    /// Current engagement baseline (0.5 before any interaction)
    pub fn engagement_baseline(&self) -> Result<f64> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT baseline FROM engagement_baseline WHERE user_id = 'default'",
                [],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0.5),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    // ========================================================================
    // ADAPTATION
    // ========================================================================

    /// Nudge the style profile toward the observed vector, unless the user
    /// is venting.
    ///
    /// Per dimension, the step is `learning_rate * (observed - current)`
    /// clamped to the session cap; every change is logged to
    /// `personality_evolution`, marked as a change point when the CUSUM
    /// detector trips on this update.
    pub fn apply_adaptation(&self, request: &AdaptationRequest) -> Result<AdaptationOutcome> {
        let v = &request.vent;
        if detect_vent_mode(
            v.sentiment,
            v.thread_length,
            v.messages_per_minute,
            v.caps_ratio,
        ) {
            self.record_engagement("vent_mode_detected", &EngagementSignal::default())?;
            tracing::info!("vent mode detected; style adaptation frozen");
            return Ok(AdaptationOutcome {
                applied: false,
                learning_rate: 0.0,
                reason: "Vent mode detected; adaptation frozen".into(),
                change_detected: false,
                changes: vec![],
            });
        }

        let mut profile = load_user_profile(&self.storage)?;
        let learning_rate = calculate_learning_rate(profile.interaction_count);
        let cap = SESSION_CAP / request.session_engagement.max(0.01);

        let current = profile.style_vector();
        let mut updated = current;
        for i in 0..updated.len() {
            let step = (learning_rate * (request.observed[i] - current[i])).clamp(-cap, cap);
            updated[i] = (current[i] + step).clamp(0.0, 1.0);
        }

        let cusum_update = self
            .cusum
            .lock()
            .map_err(|_| StorageError::Init("cusum lock poisoned".into()))?
            .update(updated);

        let now = db_time(Utc::now());
        let mut changes = Vec::new();
        self.storage.with_tx(|tx| {
            for i in 0..updated.len() {
                if (updated[i] - current[i]).abs() > f64::EPSILON {
                    tx.execute(
                        "INSERT INTO personality_evolution
                            (timestamp, dimension, old_value, new_value, learning_rate_used,
                             was_change_point)
                         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                        params![now, DIMENSION_NAMES[i], current[i], updated[i], learning_rate],
                    )?;
                    changes.push((DIMENSION_NAMES[i].to_string(), current[i], updated[i]));
                }
            }
            if cusum_update.change_detected {
                // Audit the dimensions that moved against the window
                // baseline, flagged as change points
                for i in 0..updated.len() {
                    if cusum_update.dimension_deltas[i].abs() > 0.1 {
                        tx.execute(
                            "INSERT INTO personality_evolution
                                (timestamp, dimension, old_value, new_value,
                                 learning_rate_used, was_change_point)
                             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                            params![
                                now,
                                DIMENSION_NAMES[i],
                                updated[i] - cusum_update.dimension_deltas[i],
                                updated[i],
                                learning_rate,
                            ],
                        )?;
                    }
                }
            }
            Ok(())
        })?;

        profile.apply_vector(updated);
        profile.interaction_count += 1;
        save_user_profile(&self.storage, &profile)?;

        Ok(AdaptationOutcome {
            applied: true,
            learning_rate,
            reason: if cusum_update.change_detected {
                "Adaptation applied; style change point detected".into()
            } else {
                "Adaptation applied".into()
            },
            change_detected: cusum_update.change_detected,
            changes,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StyleEngine {
        StyleEngine::new(Arc::new(Storage::open_in_memory().unwrap()))
    }

    #[test]
    fn test_learning_rate_schedule() {
        assert!((calculate_learning_rate(0) - 0.3).abs() < 1e-12);
        // Monotonically non-increasing toward the floor
        let mut previous = calculate_learning_rate(0);
        for n in (10..500).step_by(10) {
            let rate = calculate_learning_rate(n);
            assert!(rate <= previous);
            previous = rate;
        }
        assert!((calculate_learning_rate(10_000) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_vent_mode_boundaries() {
        assert!(!detect_vent_mode(0.0, 3, 0.0, 0.0));
        assert!(detect_vent_mode(-0.8, 10, 5.0, 0.4));
        // Two signals alone are not venting
        assert!(!detect_vent_mode(-0.6, 2, 0.0, 0.0));
        assert!(!detect_vent_mode(0.0, 10, 4.0, 0.0));
    }

    #[test]
    fn test_engagement_score_full_signal() {
        let signal = EngagementSignal {
            ai_draft_length: Some(100),
            user_final_length: Some(100),
            user_response_sentiment: Some(1.0),
            thread_continued: Some(true),
            ..Default::default()
        };
        let score = score_engagement(&signal);
        // edit 1.0, sentiment 1.0, length 0.5, continuation 1.0
        let expected =
            (0.35 * 1.0 + 0.30 * 1.0 + 0.20 * 0.5 + 0.10 * 1.0) / (0.35 + 0.30 + 0.20 + 0.10);
        assert!((score.overall - expected).abs() < 1e-9);
        assert!((score.confidence - 0.95).abs() < 1e-9);
        assert!(score.is_actionable());
    }

    #[test]
    fn test_engagement_score_missing_components_do_not_dilute() {
        let signal = EngagementSignal {
            user_response_sentiment: Some(1.0),
            ..Default::default()
        };
        let score = score_engagement(&signal);
        // Only sentiment present: overall is its score, not 0.3 of it
        assert!((score.overall - 1.0).abs() < 1e-9);
        assert!((score.confidence - 0.30).abs() < 1e-9);
        assert!(score.is_actionable());

        let continuation_only = score_engagement(&EngagementSignal {
            thread_continued: Some(true),
            ..Default::default()
        });
        assert!(!continuation_only.is_actionable());
    }

    #[test]
    fn test_vent_freeze_blocks_adaptation() {
        let engine = engine();
        let outcome = engine
            .apply_adaptation(&AdaptationRequest {
                observed: [0.9, 0.9, 0.9, 0.9, 0.9],
                session_engagement: 1.0,
                vent: VentSignals {
                    sentiment: -0.7,
                    thread_length: 10,
                    messages_per_minute: 5.0,
                    caps_ratio: 0.4,
                },
            })
            .unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.learning_rate, 0.0);
        assert!(outcome.reason.contains("Vent mode"));

        // The freeze itself is logged as an engagement event
        let count: i64 = engine
            .storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM engagement_events
                     WHERE interaction_type = 'vent_mode_detected'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);

        // And the profile did not move
        let profile = engine.user_profile().unwrap();
        assert!((profile.formality - 0.5).abs() < 1e-9);
        assert_eq!(profile.interaction_count, 0);
    }

    #[test]
    fn test_adaptation_moves_within_session_cap() {
        let engine = engine();
        let outcome = engine
            .apply_adaptation(&AdaptationRequest {
                observed: [1.0, 1.0, 1.0, 1.0, 1.0],
                session_engagement: 1.0,
                vent: VentSignals::default(),
            })
            .unwrap();

        assert!(outcome.applied);
        assert!((outcome.learning_rate - 0.3).abs() < 1e-12);

        // Cap = 0.01 / 1.0: each dimension moves at most 0.01
        let profile = engine.user_profile().unwrap();
        assert!((profile.formality - 0.51).abs() < 1e-9);
        assert_eq!(profile.interaction_count, 1);
        assert_eq!(outcome.changes.len(), 5);

        // Every change was audited
        let audited: i64 = engine
            .storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM personality_evolution WHERE was_change_point = 0",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(audited, 5);
    }

    #[test]
    fn test_baseline_ema_binding_order() {
        let engine = engine();
        // First interaction seeds the baseline directly
        let first = engine.update_baseline_with_interaction(0.8, 0.2).unwrap();
        assert!((first - 0.8).abs() < 1e-9);

        // (1 - 0.2) * 0.8 + 0.2 * 0.3 = 0.70
        let second = engine.update_baseline_with_interaction(0.3, 0.2).unwrap();
        assert!((second - 0.70).abs() < 1e-9);

        assert!((engine.engagement_baseline().unwrap() - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_thread_continued_has_no_boolean_column() {
        let engine = engine();
        engine.record_thread_continued(Some("entity-1")).unwrap();

        let (interaction_type, recipient): (String, Option<String>) = engine
            .storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT interaction_type, recipient_entity_id FROM engagement_events",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(interaction_type, "thread_continued");
        assert_eq!(recipient.as_deref(), Some("entity-1"));
    }

    #[test]
    fn test_extract_user_style_from_messages() {
        let engine = engine();
        engine
            .storage
            .with_tx(|tx| {
                for (i, body) in [
                    "Hey Jane, quick question about the deck!",
                    "Dear team, please find the summary attached. Regards",
                    "hey, gonna be 5 late",
                ]
                .iter()
                .enumerate()
                {
                    tx.execute(
                        "INSERT INTO messages
                            (id, source_type, source_id, body_text, timestamp, is_from_user)
                         VALUES (?1, 'gmail', ?2, ?3, ?4, 1)",
                        params![format!("m{i}"), format!("g-{i}"), body, db_now()],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let profile = engine.extract_user_style().unwrap();
        assert!(profile.avg_message_length > 0.0);
        assert!((0.0..=1.0).contains(&profile.formality));

        // Persisted
        let loaded = engine.user_profile().unwrap();
        assert!((loaded.avg_message_length - profile.avg_message_length).abs() < 1e-9);
    }
}
