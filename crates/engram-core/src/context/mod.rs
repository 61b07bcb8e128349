//! Context Boundaries
//!
//! Named compartments (`work`, `personal`, `family`, `health`, ...) with a
//! declarative visibility policy between them, plus the leak guard that
//! decides whether data may cross compartments at a given sensitivity.
//! Active-context detection for a session lives in [`detection`].

pub mod detection;

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::storage::{Result, Storage, StorageError};

pub use detection::{ActiveContext, ContextDetector, DetectionSignals};

// ============================================================================
// TYPES
// ============================================================================

/// Sensitivity of data crossing a context boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

/// A named compartment and its policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBoundary {
    pub context_name: String,
    /// Which other contexts this context's viewer may read
    pub visibility_policy: HashMap<String, bool>,
    /// Signals used by active-context detection (apps, domains, keywords,
    /// hours)
    pub classification_signals: serde_json::Value,
    pub formality_floor: f64,
    pub professionalism_required: bool,
    pub humor_allowed: bool,
}

impl ContextBoundary {
    /// A boundary with no policy grants and default tone settings
    pub fn named(context_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            visibility_policy: HashMap::new(),
            classification_signals: serde_json::Value::Object(Default::default()),
            formality_floor: 0.0,
            professionalism_required: false,
            humor_allowed: true,
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let policy_raw: String = row.get("visibility_policy")?;
        let signals_raw: String = row.get("classification_signals")?;
        Ok(Self {
            context_name: row.get("context_name")?,
            visibility_policy: serde_json::from_str(&policy_raw).unwrap_or_default(),
            classification_signals: serde_json::from_str(&signals_raw)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            formality_floor: row.get("formality_floor")?,
            professionalism_required: row.get("professionalism_required")?,
            humor_allowed: row.get("humor_allowed")?,
        })
    }
}

/// The compartments whose pairing with work is guarded at medium
/// sensitivity
const PERSONAL_SPHERE: &[&str] = &["personal", "family", "health"];

// ============================================================================
// MANAGER
// ============================================================================

/// Context boundary storage and the leak guard
#[derive(Clone)]
pub struct ContextManager {
    storage: Arc<Storage>,
}

impl ContextManager {
    /// Create over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Create or replace a boundary
    pub fn upsert_boundary(&self, boundary: &ContextBoundary) -> Result<()> {
        if boundary.context_name.trim().is_empty() {
            return Err(StorageError::InvalidInput("context name is empty".into()));
        }
        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO context_boundaries
                    (context_name, visibility_policy, classification_signals,
                     formality_floor, professionalism_required, humor_allowed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (context_name) DO UPDATE SET
                    visibility_policy = excluded.visibility_policy,
                    classification_signals = excluded.classification_signals,
                    formality_floor = excluded.formality_floor,
                    professionalism_required = excluded.professionalism_required,
                    humor_allowed = excluded.humor_allowed",
                params![
                    boundary.context_name,
                    serde_json::to_string(&boundary.visibility_policy)
                        .unwrap_or_else(|_| "{}".into()),
                    boundary.classification_signals.to_string(),
                    boundary.formality_floor,
                    boundary.professionalism_required,
                    boundary.humor_allowed,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch a boundary by name
    pub fn get_boundary(&self, context_name: &str) -> Result<Option<ContextBoundary>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT context_name, visibility_policy, classification_signals,
                        formality_floor, professionalism_required, humor_allowed
                 FROM context_boundaries WHERE context_name = ?1",
                [context_name],
                ContextBoundary::from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Database(other)),
            })
        })
    }

    /// All configured boundaries
    pub fn boundaries(&self) -> Result<Vec<ContextBoundary>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT context_name, visibility_policy, classification_signals,
                        formality_floor, professionalism_required, humor_allowed
                 FROM context_boundaries ORDER BY context_name",
            )?;
            let rows = stmt
                .query_map([], ContextBoundary::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// A viewer context can see data from another context when they are the
    /// same, or when the viewer's policy explicitly grants it. An unknown
    /// viewer context sees only itself.
    pub fn can_see_context(&self, viewer: &str, data: &str) -> Result<bool> {
        if viewer == data {
            return Ok(true);
        }
        let Some(boundary) = self.get_boundary(viewer)? else {
            return Ok(false);
        };
        Ok(boundary.visibility_policy.get(data).copied().unwrap_or(false))
    }

    /// Cross-context leak guard.
    ///
    /// High sensitivity never crosses. Medium blocks the work/personal
    /// sphere pairing unless the viewer's policy explicitly permits it.
    /// Low is permissive.
    pub fn check_cross_context_access(
        &self,
        viewer: &str,
        data: &str,
        sensitivity: Sensitivity,
    ) -> Result<bool> {
        if viewer == data {
            return Ok(true);
        }
        match sensitivity {
            Sensitivity::High => Ok(false),
            Sensitivity::Low => Ok(true),
            Sensitivity::Medium => {
                let guarded = (viewer == "work" && PERSONAL_SPHERE.contains(&data))
                    || (data == "work" && PERSONAL_SPHERE.contains(&viewer));
                if !guarded {
                    return Ok(true);
                }
                self.can_see_context(viewer, data)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
