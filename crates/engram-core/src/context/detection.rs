//! Active-Context Detection
//!
//! Fuses the foreground app, URL/domain patterns, window-title keywords,
//! work-hour windows, and the context memberships of the entities being
//! talked to into additive per-context scores, normalized into a confidence.
//! The winning context is cached per session; the cache is the only
//! long-lived in-memory state this subsystem holds.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::ContextManager;
use crate::storage::Result;

// ============================================================================
// SIGNAL WEIGHTS
// ============================================================================

const WEIGHT_APP: f64 = 2.0;
const WEIGHT_DOMAIN: f64 = 2.0;
const WEIGHT_RECIPIENT: f64 = 2.0;
const WEIGHT_KEYWORD: f64 = 1.0;
const WEIGHT_HOURS: f64 = 1.0;

// ============================================================================
// TYPES
// ============================================================================

/// Observations available at detection time
#[derive(Debug, Clone, Default)]
pub struct DetectionSignals {
    /// Foreground application identifier
    pub app_id: Option<String>,
    /// URL in the foreground browser, if any
    pub url: Option<String>,
    /// Foreground window title
    pub window_title: Option<String>,
    /// Entities the user is currently communicating with
    pub recipient_entity_ids: Vec<String>,
    /// Detection instant (work-hour windows are evaluated against this)
    pub now: Option<DateTime<Utc>>,
}

/// The detected context attached to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveContext {
    pub session_id: String,
    pub current_context: String,
    pub detected_at: DateTime<Utc>,
    /// Per-context raw scores that produced the decision
    pub signals: HashMap<String, f64>,
    /// Winning score over the score total, in [0, 1]
    pub confidence: f64,
    pub active_persona: Option<String>,
    pub style_adjustments: Option<serde_json::Value>,
}

// ============================================================================
// DETECTOR
// ============================================================================

/// Session-scoped context detection over the configured boundaries
pub struct ContextDetector {
    manager: ContextManager,
    active: Mutex<HashMap<String, ActiveContext>>,
}

impl ContextDetector {
    /// Create over the boundary manager
    pub fn new(manager: ContextManager) -> Self {
        Self {
            manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Detect the active context for a session. Returns None when no
    /// boundary scores above zero; otherwise caches and returns the winner.
    pub fn detect(
        &self,
        session_id: &str,
        signals: &DetectionSignals,
    ) -> Result<Option<ActiveContext>> {
        let boundaries = self.manager.boundaries()?;
        if boundaries.is_empty() {
            return Ok(None);
        }

        let now = signals.now.unwrap_or_else(Utc::now);
        let mut scores: HashMap<String, f64> = HashMap::new();

        for boundary in &boundaries {
            let mut score = 0.0;
            let rules = &boundary.classification_signals;

            if let (Some(app), Some(apps)) = (&signals.app_id, rules["apps"].as_array()) {
                if apps.iter().any(|a| a.as_str() == Some(app.as_str())) {
                    score += WEIGHT_APP;
                }
            }

            if let (Some(url), Some(domains)) = (&signals.url, rules["domains"].as_array()) {
                let url_lower = url.to_lowercase();
                if domains
                    .iter()
                    .filter_map(|d| d.as_str())
                    .any(|d| url_lower.contains(&d.to_lowercase()))
                {
                    score += WEIGHT_DOMAIN;
                }
            }

            if let (Some(title), Some(keywords)) =
                (&signals.window_title, rules["keywords"].as_array())
            {
                let title_lower = title.to_lowercase();
                for keyword in keywords.iter().filter_map(|k| k.as_str()) {
                    if title_lower.contains(&keyword.to_lowercase()) {
                        score += WEIGHT_KEYWORD;
                    }
                }
            }

            if let Some(hours) = rules["hours"].as_object() {
                let (start, end) = (
                    hours.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    hours.get("end").and_then(|v| v.as_u64()).unwrap_or(24) as u32,
                );
                let hour = now.hour();
                if hour >= start && hour < end {
                    score += WEIGHT_HOURS;
                }
            }

            if score > 0.0 || !signals.recipient_entity_ids.is_empty() {
                scores.insert(boundary.context_name.clone(), score);
            }
        }

        // Recipient memberships count toward their contexts
        let graph = crate::graph::EntityGraph::new(self.manager.storage().clone());
        for entity_id in &signals.recipient_entity_ids {
            for context_name in graph.context_memberships(entity_id)? {
                *scores.entry(context_name).or_default() += WEIGHT_RECIPIENT;
            }
        }

        let total: f64 = scores.values().sum();
        let winner = scores
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, score)| (name.clone(), *score));

        let Some((context_name, top_score)) = winner else {
            return Ok(None);
        };
        if top_score <= 0.0 {
            return Ok(None);
        }

        let active = ActiveContext {
            session_id: session_id.to_string(),
            current_context: context_name,
            detected_at: now,
            confidence: if total > 0.0 { top_score / total } else { 0.0 },
            signals: scores,
            active_persona: None,
            style_adjustments: None,
        };

        self.active
            .lock()
            .map_err(|_| crate::storage::StorageError::Init("context cache lock poisoned".into()))?
            .insert(session_id.to_string(), active.clone());

        tracing::debug!(
            session = session_id,
            context = %active.current_context,
            confidence = active.confidence,
            "active context detected"
        );

        Ok(Some(active))
    }

    /// The cached active context for a session
    pub fn active_context(&self, session_id: &str) -> Option<ActiveContext> {
        self.active.lock().ok()?.get(session_id).cloned()
    }

    /// Drop a session's cached context
    pub fn clear_session(&self, session_id: &str) {
        if let Ok(mut cache) = self.active.lock() {
            cache.remove(session_id);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBoundary;
    use crate::model::EntityType;
    use crate::storage::Storage;
    use serde_json::json;
    use std::sync::Arc;

    fn detector() -> (ContextDetector, crate::graph::EntityGraph) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let manager = ContextManager::new(Arc::clone(&storage));

        let mut work = ContextBoundary::named("work");
        work.classification_signals = json!({
            "apps": ["slack", "outlook"],
            "domains": ["github.com", "linear.app"],
            "keywords": ["standup", "quarterly"],
            "hours": { "start": 9, "end": 17 },
        });
        manager.upsert_boundary(&work).unwrap();

        let mut personal = ContextBoundary::named("personal");
        personal.classification_signals = json!({
            "apps": ["imessage"],
            "keywords": ["dinner"],
        });
        manager.upsert_boundary(&personal).unwrap();

        (
            ContextDetector::new(manager),
            crate::graph::EntityGraph::new(storage),
        )
    }

    #[test]
    fn test_app_and_title_signals() {
        let (detector, _) = detector();
        let signals = DetectionSignals {
            app_id: Some("slack".into()),
            window_title: Some("Standup notes".into()),
            ..Default::default()
        };
        let active = detector.detect("s1", &signals).unwrap().unwrap();
        assert_eq!(active.current_context, "work");
        assert!(active.confidence > 0.5);

        // Cached per session
        let cached = detector.active_context("s1").unwrap();
        assert_eq!(cached.current_context, "work");
        assert!(detector.active_context("other").is_none());
    }

    #[test]
    fn test_recipient_membership_signal() {
        let (detector, graph) = detector();
        let mom = graph.create_entity("Mom", EntityType::Person, &[]).unwrap();
        graph.add_context_membership(&mom.id, "personal").unwrap();

        let signals = DetectionSignals {
            recipient_entity_ids: vec![mom.id.clone()],
            ..Default::default()
        };
        let active = detector.detect("s1", &signals).unwrap().unwrap();
        assert_eq!(active.current_context, "personal");
    }

    #[test]
    fn test_no_signal_no_context() {
        let (detector, _) = detector();
        let active = detector
            .detect("s1", &DetectionSignals::default())
            .unwrap();
        // Work hours may score; anything else yields nothing. Either way,
        // an empty signal set never crashes.
        if let Some(active) = active {
            assert_eq!(active.current_context, "work");
        }
    }

    #[test]
    fn test_domain_signal() {
        let (detector, _) = detector();
        let signals = DetectionSignals {
            url: Some("https://github.com/acme/payroll/pull/7".into()),
            now: Some(Utc::now()),
            ..Default::default()
        };
        let active = detector.detect("s1", &signals).unwrap().unwrap();
        assert_eq!(active.current_context, "work");
        assert!(active.signals["work"] >= WEIGHT_DOMAIN);
    }

    #[test]
    fn test_clear_session() {
        let (detector, _) = detector();
        let signals = DetectionSignals {
            app_id: Some("imessage".into()),
            ..Default::default()
        };
        detector.detect("s1", &signals).unwrap();
        assert!(detector.active_context("s1").is_some());
        detector.clear_session("s1");
        assert!(detector.active_context("s1").is_none());
    }
}
