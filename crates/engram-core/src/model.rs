//! Core records of the entity graph
//!
//! Shared row types used across subsystems: entities, attributes, graph
//! edges, messages, and the event log. Subsystem-specific records (beliefs,
//! commitments, style, behavior, contexts) live with their subsystems.
//!
//! All ids are UUID v4 strings; all timestamps are stored as ISO-8601 text
//! with millisecond precision (`2026-08-01T12:00:00.000Z`), which makes
//! lexicographic comparison in SQL chronologically correct.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TIME HELPERS
// ============================================================================

/// Render a timestamp in the canonical database format
pub fn db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in the canonical database format
pub fn db_now() -> String {
    db_time(Utc::now())
}

/// Decode a JSON string-array column, tolerating NULL/empty
pub(crate) fn decode_id_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Encode a string list for a JSON column
pub(crate) fn encode_id_list(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Types of canonical entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A human being
    #[default]
    Person,
    /// A company or organization
    Org,
    /// A physical or named place
    Place,
    /// Anything else worth tracking
    Thing,
}

impl EntityType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Org => "org",
            EntityType::Place => "place",
            EntityType::Thing => "thing",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "org" | "organization" | "company" => EntityType::Org,
            "place" | "location" => EntityType::Place,
            "thing" => EntityType::Thing,
            _ => EntityType::Person,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical entity: the surviving record of a person/org/place/thing
/// after any number of merges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Primary display name
    pub canonical_name: String,
    /// Entity classification
    pub entity_type: EntityType,
    /// When the entity was created
    pub created_at: DateTime<Utc>,
    /// When the entity was last modified
    pub updated_at: DateTime<Utc>,
    /// Every entity id ever folded into this one, oldest first. A listed id
    /// never appears as a live entity row.
    pub merge_history: Vec<String>,
}

impl Entity {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            canonical_name: row.get("canonical_name")?,
            entity_type: EntityType::parse_name(&row.get::<_, String>("entity_type")?),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            merge_history: decode_id_list(row.get("merge_history")?),
        })
    }
}

/// A single attribute of an entity, unique per
/// `(entity_id, attribute_type, attribute_value)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAttribute {
    pub id: String,
    pub entity_id: String,
    /// 'email', 'phone', 'alias', 'first_name', 'last_name', 'company',
    /// 'title', 'birthday', 'photo_url', 'label', 'notes', or open-ended
    pub attribute_type: String,
    pub attribute_value: String,
    pub confidence: f64,
    /// Assertion this attribute was derived from, if any
    pub source_assertion_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EntityAttribute {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            entity_id: row.get("entity_id")?,
            attribute_type: row.get("attribute_type")?,
            attribute_value: row.get("attribute_value")?,
            confidence: row.get("confidence")?,
            source_assertion_id: row.get("source_assertion_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

// ============================================================================
// GRAPH EDGES
// ============================================================================

/// A typed, weighted edge between two entities.
///
/// `communicates_with` is maintained automatically from message traffic and
/// is the primary communication-density signal; other edge types
/// (`reports_to`, `family`, `works_with`, ...) are asserted explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub edge_type: String,
    /// Edge weight in [0, 1]
    pub strength: f64,
    /// How many observations support this edge
    pub evidence_count: i64,
    pub last_evidence_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GraphEdge {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            from_entity_id: row.get("from_entity_id")?,
            to_entity_id: row.get("to_entity_id")?,
            edge_type: row.get("edge_type")?,
            strength: row.get("strength")?,
            evidence_count: row.get("evidence_count")?,
            last_evidence_at: row.get("last_evidence_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// A persisted message, deduplicated on `(source_type, source_id)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// 'gmail', 'imessage', 'slack', ...
    pub source_type: String,
    /// Id within the source system
    pub source_id: String,
    pub thread_id: Option<String>,
    pub sender_entity_id: Option<String>,
    pub recipient_entity_ids: Vec<String>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_from_user: bool,
    pub processed: bool,
}

impl Message {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            source_type: row.get("source_type")?,
            source_id: row.get("source_id")?,
            thread_id: row.get("thread_id")?,
            sender_entity_id: row.get("sender_entity_id")?,
            recipient_entity_ids: decode_id_list(row.get("recipient_entity_ids")?),
            subject: row.get("subject")?,
            body_text: row.get("body_text")?,
            body_html: row.get("body_html")?,
            timestamp: row.get("timestamp")?,
            is_from_user: row.get("is_from_user")?,
            processed: row.get("processed")?,
        })
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// An event on the append-only spine. Everything downstream of ingestion
/// (patterns, rhythms, predictions) consumes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque structured payload
    pub payload: serde_json::Value,
    pub context_type: Option<String>,
    pub entities: Vec<String>,
    pub processed: bool,
}

impl Event {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let payload_raw: String = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            timestamp: row.get("timestamp")?,
            payload: serde_json::from_str(&payload_raw)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            context_type: row.get("context_type")?,
            entities: decode_id_list(row.get("entities")?),
            processed: row.get("processed")?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
