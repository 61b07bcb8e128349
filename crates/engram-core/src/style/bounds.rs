//! Ethical Bounds
//!
//! Hard limits on what adaptation may produce. Before an AI draft is
//! finalized, its text is scored against pattern classes (manipulation,
//! sycophancy, urgency pressure, authenticity); a score outside a bound is a
//! violation, and any blocking violation rejects the draft. The adjustment
//! table provides deterministic rewrites so callers can repair a draft
//! without another model round-trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Distance from a bound inside which a violation is a warning rather than
/// a block
const WARNING_MARGIN: f64 = 0.2;

/// Markers of manipulative framing
const MANIPULATION_MARKERS: &[&str] = &[
    "you owe me",
    "after all i've done",
    "after everything i did",
    "everyone agrees",
    "everyone knows",
    "you have to",
    "if you really cared",
    "a real friend would",
];

/// Markers of reflexive agreement
const SYCOPHANCY_MARKERS: &[&str] = &[
    "absolutely brilliant",
    "totally agree",
    "completely agree",
    "you're so right",
    "couldn't agree more",
    "what a genius",
    "amazing idea",
    "perfect idea",
];

/// Markers of urgency pressure
const URGENCY_MARKERS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "right now",
    "act now",
    "final notice",
    "last chance",
    "don't wait",
    "time is running out",
];

/// Softening rewrites applied by [`EthicalBounds::apply_adjustments`]
const AGREEMENT_REWRITES: &[(&str, &str)] = &[
    ("totally agree", "that makes sense"),
    ("completely agree", "that makes sense"),
    ("couldn't agree more", "that makes sense"),
    ("you're so right", "good point"),
    ("absolutely brilliant", "a solid idea"),
    ("amazing idea", "a good idea"),
    ("perfect idea", "a good idea"),
];

// ============================================================================
// TYPES
// ============================================================================

/// One bounded dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthicalBound {
    pub dimension: String,
    pub min: f64,
    pub max: f64,
    pub description: String,
}

/// Severity of a bound violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationAction {
    /// Close to the bound; surface but allow
    Warning,
    /// Far outside the bound; the draft must not ship
    Block,
}

/// A scored violation of one bound
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub dimension: String,
    pub score: f64,
    pub bound_min: f64,
    pub bound_max: f64,
    pub action: ViolationAction,
}

/// Overall risk of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Result of checking a draft against the bounds table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundsVerdict {
    pub scores: HashMap<String, f64>,
    pub violations: Vec<Violation>,
    pub risk: RiskLevel,
}

impl BoundsVerdict {
    /// High risk (any blocking violation) rejects the draft
    pub fn is_rejected(&self) -> bool {
        self.risk == RiskLevel::High
    }
}

// ============================================================================
// BOUNDS TABLE
// ============================================================================

/// The bounds table with its default limits
#[derive(Debug, Clone)]
pub struct EthicalBounds {
    bounds: Vec<EthicalBound>,
}

impl Default for EthicalBounds {
    fn default() -> Self {
        Self {
            bounds: vec![
                EthicalBound {
                    dimension: "manipulation_score".into(),
                    min: 0.0,
                    max: 0.3,
                    description: "Drafts must not lean on guilt or social pressure".into(),
                },
                EthicalBound {
                    dimension: "sycophancy".into(),
                    min: 0.0,
                    max: 0.4,
                    description: "Agreement must track substance, not mood".into(),
                },
                EthicalBound {
                    dimension: "urgency_pressure".into(),
                    min: 0.0,
                    max: 0.5,
                    description: "Manufactured urgency is off-limits".into(),
                },
                EthicalBound {
                    dimension: "authenticity".into(),
                    min: 0.6,
                    max: 1.0,
                    description: "Drafts must stay recognizably the user's voice".into(),
                },
            ],
        }
    }
}

impl EthicalBounds {
    /// The configured bounds
    pub fn bounds(&self) -> &[EthicalBound] {
        &self.bounds
    }

    /// Score a draft's pattern classes
    pub fn analyze(&self, text: &str) -> HashMap<String, f64> {
        let lowered = text.to_lowercase();

        let marker_score = |markers: &[&str]| -> f64 {
            let hits = markers.iter().filter(|m| lowered.contains(*m)).count();
            (hits as f64 * 0.25).min(1.0)
        };

        let manipulation = marker_score(MANIPULATION_MARKERS);
        let sycophancy = marker_score(SYCOPHANCY_MARKERS);
        let urgency = marker_score(URGENCY_MARKERS);
        // Heavy reliance on pressure or flattery reads as inauthentic
        let authenticity =
            (1.0 - 0.5 * manipulation - 0.3 * sycophancy - 0.2 * urgency).clamp(0.0, 1.0);

        let mut scores = HashMap::new();
        scores.insert("manipulation_score".into(), manipulation);
        scores.insert("sycophancy".into(), sycophancy);
        scores.insert("urgency_pressure".into(), urgency);
        scores.insert("authenticity".into(), authenticity);
        scores
    }

    /// Check a draft, producing violations and an overall risk
    pub fn check(&self, text: &str) -> BoundsVerdict {
        let scores = self.analyze(text);
        let mut violations = Vec::new();

        for bound in &self.bounds {
            let Some(&score) = scores.get(&bound.dimension) else {
                continue;
            };
            let distance = if score > bound.max {
                score - bound.max
            } else if score < bound.min {
                bound.min - score
            } else {
                continue;
            };
            violations.push(Violation {
                dimension: bound.dimension.clone(),
                score,
                bound_min: bound.min,
                bound_max: bound.max,
                action: if distance <= WARNING_MARGIN {
                    ViolationAction::Warning
                } else {
                    ViolationAction::Block
                },
            });
        }

        let risk = if violations.iter().any(|v| v.action == ViolationAction::Block) {
            RiskLevel::High
        } else if !violations.is_empty() {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        BoundsVerdict {
            scores,
            violations,
            risk,
        }
    }

    /// Deterministic repairs: strip urgency markers and soften reflexive
    /// agreement. Case-insensitive on the markers, preserving surrounding
    /// text.
    pub fn apply_adjustments(&self, text: &str) -> String {
        let mut adjusted = text.to_string();

        for marker in URGENCY_MARKERS {
            adjusted = replace_case_insensitive(&adjusted, marker, "");
        }
        for (from, to) in AGREEMENT_REWRITES {
            adjusted = replace_case_insensitive(&adjusted, from, to);
        }

        // Collapse whitespace artifacts left by removals
        let collapsed: Vec<&str> = adjusted.split_whitespace().collect();
        collapsed.join(" ")
    }
}

/// Replace every case-insensitive occurrence of `needle`
fn replace_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    let lowered = haystack.to_lowercase();
    let needle_lower = needle.to_lowercase();
    let mut result = String::with_capacity(haystack.len());
    let mut cursor = 0;

    while let Some(found) = lowered[cursor..].find(&needle_lower) {
        let start = cursor + found;
        result.push_str(&haystack[cursor..start]);
        result.push_str(replacement);
        cursor = start + needle.len();
    }
    result.push_str(&haystack[cursor..]);
    result
}

// ============================================================================
// TESTS
// ============================================================================
