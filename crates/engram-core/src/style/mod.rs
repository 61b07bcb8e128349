//! Style & Engagement Loop
//!
//! Extracts how the user writes (formality, verbosity, emoji habits,
//! greetings, signoffs, signature phrases) and how they write *to each
//! recipient*; scores how well AI drafts land; freezes adaptation during
//! emotional venting; and watches for genuine style shifts with a CUSUM
//! change-point detector. Every dimension update is audited in
//! `personality_evolution`.

pub mod bounds;
pub mod cusum;
pub mod engagement;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::model::db_now;
use crate::storage::{Result, Storage, StorageError};

pub use bounds::{BoundsVerdict, EthicalBounds, RiskLevel, Violation, ViolationAction};
pub use cusum::{CusumDetector, CusumUpdate, StyleVector, DIMENSION_NAMES, STYLE_DIMENSIONS};
pub use engagement::{
    calculate_learning_rate, detect_vent_mode, score_engagement, AdaptationOutcome,
    AdaptationRequest, EngagementScore, EngagementSignal, StyleEngine, VentSignals,
    ACTIONABLE_CONFIDENCE,
};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Cap on messages considered by user style extraction
pub const STYLE_WINDOW_MESSAGES: usize = 500;

/// Minimum messages before a recipient profile is computed
pub const RECIPIENT_MIN_MESSAGES: usize = 3;

/// Markers of formal register
const FORMAL_KEYWORDS: &[&str] = &[
    "regards",
    "sincerely",
    "dear",
    "please",
    "kindly",
    "furthermore",
    "therefore",
    "respectfully",
    "regarding",
    "accordingly",
];

/// Markers of informal register
const INFORMAL_KEYWORDS: &[&str] = &[
    "hey", "yeah", "yep", "nope", "lol", "haha", "gonna", "wanna", "kinda", "btw", "omg", "dude",
    "cool", "sup",
];

/// Words that mark a greeting line
const GREETING_WORDS: &[&str] = &["hi", "hey", "hello", "dear", "yo", "greetings", "morning"];

/// Recognized signoff lines
const SIGNOFF_PHRASES: &[&str] = &[
    "thanks",
    "thank you",
    "best",
    "cheers",
    "regards",
    "best regards",
    "talk soon",
    "later",
    "take care",
    "sincerely",
];

/// Emotional-positive keywords used for warmth estimation
const WARM_KEYWORDS: &[&str] = &[
    "thanks",
    "thank",
    "love",
    "appreciate",
    "great",
    "awesome",
    "excited",
    "happy",
    "glad",
    "wonderful",
    "amazing",
    "hope",
];

// ============================================================================
// PROFILE TYPES
// ============================================================================

/// The user's extracted communication style. Single record; all real-valued
/// dimensions lie in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleProfile {
    pub formality: f64,
    pub verbosity: f64,
    pub emoji_density: f64,
    pub warmth: f64,
    pub expressiveness: f64,
    pub avg_message_length: f64,
    pub greeting_patterns: Vec<String>,
    pub signoff_patterns: Vec<String>,
    pub signature_phrases: Vec<String>,
    pub interaction_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl Default for StyleProfile {
    fn default() -> Self {
        Self {
            formality: 0.5,
            verbosity: 0.5,
            emoji_density: 0.0,
            warmth: 0.5,
            expressiveness: 0.5,
            avg_message_length: 0.0,
            greeting_patterns: vec![],
            signoff_patterns: vec![],
            signature_phrases: vec![],
            interaction_count: 0,
            updated_at: Utc::now(),
        }
    }
}

impl StyleProfile {
    /// The profile as a point in style space, index-aligned with
    /// [`DIMENSION_NAMES`]
    pub fn style_vector(&self) -> StyleVector {
        [
            self.formality,
            self.verbosity,
            self.emoji_density,
            self.warmth,
            self.expressiveness,
        ]
    }

    /// Write a style-space point back into the profile dimensions
    pub fn apply_vector(&mut self, vector: StyleVector) {
        self.formality = vector[0].clamp(0.0, 1.0);
        self.verbosity = vector[1].clamp(0.0, 1.0);
        self.emoji_density = vector[2].clamp(0.0, 1.0);
        self.warmth = vector[3].clamp(0.0, 1.0);
        self.expressiveness = vector[4].clamp(0.0, 1.0);
    }
}

/// Per-recipient style variant. `relationship_type` is derived and optional;
/// nothing on the write path requires it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientStyleProfile {
    pub entity_id: String,
    pub formality: f64,
    pub warmth: f64,
    pub emoji_usage: f64,
    pub avg_response_time_hours: Option<f64>,
    pub example_messages: Vec<String>,
    pub message_count: i64,
    pub relationship_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// TEXT METRICS
// ============================================================================

/// True for characters in the common emoji blocks
fn is_emoji(c: char) -> bool {
    let code = c as u32;
    (0x1F300..=0x1F9FF).contains(&code)
        || (0x1FA00..=0x1FAFF).contains(&code)
        || (0x2600..=0x26FF).contains(&code)
        || (0x2700..=0x27BF).contains(&code)
}

/// Number of emoji characters in a text
pub fn count_emoji(text: &str) -> usize {
    text.chars().filter(|c| is_emoji(*c)).count()
}

/// Ratio of uppercase letters among alphabetic characters; 0 for empty or
/// letterless text
pub fn calculate_caps_ratio(text: &str) -> f64 {
    let mut letters = 0usize;
    let mut upper = 0usize;
    for c in text.chars() {
        if c.is_alphabetic() {
            letters += 1;
            if c.is_uppercase() {
                upper += 1;
            }
        }
    }
    if letters == 0 {
        return 0.0;
    }
    upper as f64 / letters as f64
}

/// Emoji per 100 characters, clamped to [0, 1]
pub fn emoji_density(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    (count_emoji(text) as f64 / text.chars().count() as f64 * 100.0).min(1.0)
}

/// Per-message formality estimate in [0, 1]: keyword deltas between formal
/// and informal lexicons, pulled down by emoji presence and shouting
pub fn formality_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let formal_hits = FORMAL_KEYWORDS
        .iter()
        .filter(|k| lowered.contains(*k))
        .count() as f64;
    let informal_hits = INFORMAL_KEYWORDS
        .iter()
        .filter(|k| contains_word(&lowered, k))
        .count() as f64;

    let mut score = 0.5 + 0.08 * formal_hits - 0.08 * informal_hits;
    if count_emoji(text) > 0 {
        score -= 0.1;
    }
    score -= 0.2 * calculate_caps_ratio(text);
    score.clamp(0.0, 1.0)
}

/// Word-boundary containment ("cool" should not fire inside "coolant")
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

// ============================================================================
// PATTERN EXTRACTION
// ============================================================================

/// Pull a greeting pattern from the first line, if it opens with one
fn extract_greeting(body: &str) -> Option<String> {
    let first_line = body.lines().find(|l| !l.trim().is_empty())?.trim();
    let lowered = first_line.to_lowercase();
    let first_word = lowered.split_whitespace().next()?;
    let word = first_word.trim_matches(|c: char| !c.is_alphanumeric());
    if GREETING_WORDS.contains(&word) {
        let pattern: Vec<&str> = lowered.split_whitespace().take(2).collect();
        return Some(pattern.join(" "));
    }
    None
}

/// Pull a signoff pattern from the last lines, if one matches
fn extract_signoff(body: &str) -> Option<String> {
    for line in body.lines().rev().filter(|l| !l.trim().is_empty()).take(3) {
        let lowered = line
            .trim()
            .trim_matches(|c: char| c == ',' || c == '!' || c == '.')
            .to_lowercase();
        if SIGNOFF_PHRASES.contains(&lowered.as_str()) {
            return Some(lowered);
        }
    }
    None
}

/// 2-4 grams appearing in at least two messages but at most half of them:
/// distinctive turns of phrase, not boilerplate
fn extract_signature_phrases(bodies: &[&str], max_phrases: usize) -> Vec<String> {
    use std::collections::{HashMap, HashSet};

    let total = bodies.len();
    if total < 2 {
        return vec![];
    }

    let mut message_counts: HashMap<String, usize> = HashMap::new();
    for body in bodies {
        let words: Vec<String> = body
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_string())
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        for n in 2..=4usize {
            if words.len() < n {
                continue;
            }
            for window in words.windows(n) {
                // Require one substantial word so "of the" never qualifies
                if !window.iter().any(|w| w.len() >= 4) {
                    continue;
                }
                seen.insert(window.join(" "));
            }
        }
        for phrase in seen {
            *message_counts.entry(phrase).or_default() += 1;
        }
    }

    let half = total.div_ceil(2);
    let mut qualifying: Vec<(String, usize)> = message_counts
        .into_iter()
        .filter(|(_, count)| *count >= 2 && *count <= half)
        .collect();
    qualifying.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    // Longer phrases subsume their own sub-grams; drop a phrase contained in
    // an already-kept one
    let mut kept: Vec<String> = Vec::new();
    for (phrase, _) in qualifying {
        if kept.len() >= max_phrases {
            break;
        }
        if !kept.iter().any(|k| k.contains(&phrase) || phrase.contains(k)) {
            kept.push(phrase);
        }
    }
    kept
}

/// Top patterns by frequency
fn top_patterns(patterns: Vec<String>, limit: usize) -> Vec<String> {
    use std::collections::HashMap;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for p in patterns {
        *counts.entry(p).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(p, _)| p).collect()
}

// ============================================================================
// EXTRACTION
// ============================================================================

/// Compute a user style profile from sent message bodies, preserving the
/// stored interaction count
pub(crate) fn compute_user_style(bodies: &[&str], interaction_count: i64) -> StyleProfile {
    if bodies.is_empty() {
        return StyleProfile {
            interaction_count,
            ..Default::default()
        };
    }

    let count = bodies.len() as f64;
    let mean_length = bodies.iter().map(|b| b.chars().count()).sum::<usize>() as f64 / count;

    let formality = bodies.iter().map(|b| formality_score(b)).sum::<f64>() / count;
    let verbosity = if mean_length > 0.0 {
        bodies
            .iter()
            .map(|b| (b.chars().count() as f64 / (2.0 * mean_length)).min(1.0))
            .sum::<f64>()
            / count
    } else {
        0.5
    };
    let emoji = bodies.iter().map(|b| emoji_density(b)).sum::<f64>() / count;

    let warmth = bodies
        .iter()
        .map(|b| {
            let lowered = b.to_lowercase();
            let hits = WARM_KEYWORDS
                .iter()
                .filter(|k| contains_word(&lowered, k))
                .count() as f64;
            (0.3 + (hits * 0.15).min(0.4) + if count_emoji(b) > 0 { 0.1 } else { 0.0 })
                .clamp(0.0, 1.0)
        })
        .sum::<f64>()
        / count;

    let expressiveness = bodies
        .iter()
        .map(|b| {
            let exclamations = b.matches('!').count() as f64;
            (0.3 + (exclamations * 0.1).min(0.4) + emoji_density(b) * 0.3).clamp(0.0, 1.0)
        })
        .sum::<f64>()
        / count;

    let greetings = top_patterns(
        bodies.iter().filter_map(|b| extract_greeting(b)).collect(),
        3,
    );
    let signoffs = top_patterns(
        bodies.iter().filter_map(|b| extract_signoff(b)).collect(),
        3,
    );
    let phrases = extract_signature_phrases(bodies, 5);

    StyleProfile {
        formality,
        verbosity,
        emoji_density: emoji,
        warmth,
        expressiveness,
        avg_message_length: mean_length,
        greeting_patterns: greetings,
        signoff_patterns: signoffs,
        signature_phrases: phrases,
        interaction_count,
        updated_at: Utc::now(),
    }
}

/// Compute a recipient profile from the user's messages to them.
/// `response_gaps_hours` are observed reply latencies of the recipient.
pub(crate) fn compute_recipient_style(
    entity_id: &str,
    bodies: &[&str],
    response_gaps_hours: &[f64],
    message_count: i64,
) -> Option<RecipientStyleProfile> {
    if bodies.len() < RECIPIENT_MIN_MESSAGES {
        return None;
    }

    let count = bodies.len() as f64;
    let formality = bodies.iter().map(|b| formality_score(b)).sum::<f64>() / count;
    let emoji = bodies.iter().map(|b| emoji_density(b)).sum::<f64>() / count;

    let warmth = bodies
        .iter()
        .map(|b| {
            let lowered = b.to_lowercase();
            let hits = WARM_KEYWORDS
                .iter()
                .filter(|k| contains_word(&lowered, k))
                .count() as f64;
            let exclamations = b.matches('!').count() as f64;
            let mut w = 0.3 + (hits * 0.15).min(0.4) + (exclamations * 0.1).min(0.2);
            if count_emoji(b) > 0 {
                w += 0.1;
            }
            w.clamp(0.0, 1.0)
        })
        .sum::<f64>()
        / count;

    let avg_response_time_hours = if response_gaps_hours.is_empty() {
        None
    } else {
        Some(response_gaps_hours.iter().sum::<f64>() / response_gaps_hours.len() as f64)
    };

    let example_messages: Vec<String> = bodies
        .iter()
        .take(5)
        .map(|b| b.chars().take(280).collect())
        .collect();

    Some(RecipientStyleProfile {
        entity_id: entity_id.to_string(),
        formality,
        warmth,
        emoji_usage: emoji,
        avg_response_time_hours,
        example_messages,
        message_count,
        relationship_type: None,
        updated_at: Utc::now(),
    })
}

// ============================================================================
// PROFILE PERSISTENCE
// ============================================================================

pub(crate) fn load_user_profile(storage: &Arc<Storage>) -> Result<StyleProfile> {
    storage.with_reader(|conn| {
        conn.query_row(
            "SELECT formality, verbosity, emoji_density, warmth, expressiveness,
                    avg_message_length, greeting_patterns, signoff_patterns,
                    signature_phrases, interaction_count, updated_at
             FROM style_profile WHERE user_id = 'default'",
            [],
            |row| {
                Ok(StyleProfile {
                    formality: row.get(0)?,
                    verbosity: row.get(1)?,
                    emoji_density: row.get(2)?,
                    warmth: row.get(3)?,
                    expressiveness: row.get(4)?,
                    avg_message_length: row.get(5)?,
                    greeting_patterns: crate::model::decode_id_list(row.get(6)?),
                    signoff_patterns: crate::model::decode_id_list(row.get(7)?),
                    signature_phrases: crate::model::decode_id_list(row.get(8)?),
                    interaction_count: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            },
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(StyleProfile::default()),
            other => Err(StorageError::Database(other)),
        })
    })
}

pub(crate) fn save_user_profile(storage: &Arc<Storage>, profile: &StyleProfile) -> Result<()> {
    storage.with_tx(|tx| {
        tx.execute(
            "INSERT INTO style_profile
                (user_id, formality, verbosity, emoji_density, warmth, expressiveness,
                 avg_message_length, greeting_patterns, signoff_patterns,
                 signature_phrases, interaction_count, updated_at)
             VALUES ('default', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (user_id) DO UPDATE SET
                formality = excluded.formality,
                verbosity = excluded.verbosity,
                emoji_density = excluded.emoji_density,
                warmth = excluded.warmth,
                expressiveness = excluded.expressiveness,
                avg_message_length = excluded.avg_message_length,
                greeting_patterns = excluded.greeting_patterns,
                signoff_patterns = excluded.signoff_patterns,
                signature_phrases = excluded.signature_phrases,
                interaction_count = excluded.interaction_count,
                updated_at = excluded.updated_at",
            params![
                profile.formality,
                profile.verbosity,
                profile.emoji_density,
                profile.warmth,
                profile.expressiveness,
                profile.avg_message_length,
                crate::model::encode_id_list(&profile.greeting_patterns),
                crate::model::encode_id_list(&profile.signoff_patterns),
                crate::model::encode_id_list(&profile.signature_phrases),
                profile.interaction_count,
                db_now(),
            ],
        )?;
        Ok(())
    })
}

pub(crate) fn load_recipient_profile(
    storage: &Arc<Storage>,
    entity_id: &str,
) -> Result<Option<RecipientStyleProfile>> {
    storage.with_reader(|conn| {
        conn.query_row(
            "SELECT entity_id, formality, warmth, emoji_usage, avg_response_time_hours,
                    example_messages, message_count, relationship_type, updated_at
             FROM recipient_style_profiles WHERE entity_id = ?1",
            [entity_id],
            |row| {
                Ok(RecipientStyleProfile {
                    entity_id: row.get(0)?,
                    formality: row.get(1)?,
                    warmth: row.get(2)?,
                    emoji_usage: row.get(3)?,
                    avg_response_time_hours: row.get(4)?,
                    example_messages: crate::model::decode_id_list(row.get(5)?),
                    message_count: row.get(6)?,
                    relationship_type: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Database(other)),
        })
    })
}

pub(crate) fn save_recipient_profile(
    storage: &Arc<Storage>,
    profile: &RecipientStyleProfile,
) -> Result<()> {
    storage.with_tx(|tx| {
        tx.execute(
            "INSERT INTO recipient_style_profiles
                (entity_id, formality, warmth, emoji_usage, avg_response_time_hours,
                 example_messages, message_count, relationship_type, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (entity_id) DO UPDATE SET
                formality = excluded.formality,
                warmth = excluded.warmth,
                emoji_usage = excluded.emoji_usage,
                avg_response_time_hours = excluded.avg_response_time_hours,
                example_messages = excluded.example_messages,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
            params![
                profile.entity_id,
                profile.formality,
                profile.warmth,
                profile.emoji_usage,
                profile.avg_response_time_hours,
                crate::model::encode_id_list(&profile.example_messages),
                profile.message_count,
                profile.relationship_type,
                db_now(),
            ],
        )?;
        Ok(())
    })
}

// ============================================================================
// TESTS
// ============================================================================
