//! Entity Resolution
//!
//! The staged pipeline that turns a raw mention ("Jake Miller",
//! jake@co.example, +1 555 010 0199) into a canonical entity id. Stages run
//! in order and the first confident decision wins:
//!
//! 1. Exact attribute match — email (case-insensitive) or phone (last-10
//!    digits)
//! 2. Fuzzy name match — [`crate::matcher::similarity`] over same-type
//!    entities
//! 3. Graph-proximity rescoring — shared connections with co-occurring
//!    entities
//! 4. LLM tiebreak — optional, JSON `{choice, reason}` over the top five
//!
//! No confident stage means a new entity is created with every supplied
//! attribute. Resolution is idempotent: resolving the same candidate twice
//! returns the same id.

pub mod merge;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::external::LlmClient;
use crate::graph::EntityGraph;
use crate::matcher;
use crate::model::{Entity, EntityType};
use crate::storage::Result;

pub use merge::merge_entities;

// ============================================================================
// INPUT TYPES
// ============================================================================

/// A mention to resolve
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveCandidate {
    /// Display name as it appeared in the source
    pub name: String,
    /// Expected entity type
    #[serde(default)]
    pub entity_type: EntityType,
    /// Email address, if the source carried one
    pub email: Option<String>,
    /// Phone number, if the source carried one
    pub phone: Option<String>,
    /// Additional attributes to record, as `(type, value)` pairs
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

/// Thresholds steering the pipeline
#[derive(Debug, Clone)]
pub struct ResolverThresholds {
    /// Minimum fuzzy score to keep a candidate
    pub fuzzy_min: f64,
    /// Score at which a single candidate wins outright
    pub high_confidence: f64,
    /// Cap on the graph-proximity boost
    pub graph_boost_max: f64,
    /// Boost per shared connection
    pub graph_boost_per_connection: f64,
}

impl Default for ResolverThresholds {
    fn default() -> Self {
        Self {
            fuzzy_min: 0.7,
            high_confidence: 0.9,
            graph_boost_max: 0.3,
            graph_boost_per_connection: 0.1,
        }
    }
}

/// Context surrounding a resolution request
#[derive(Default)]
pub struct ResolutionContext<'a> {
    /// Entities co-occurring with the mention (other recipients, thread
    /// participants)
    pub co_occurring: HashSet<String>,
    /// Text surrounding the mention, shown to the LLM tiebreak
    pub surrounding_text: Option<String>,
    /// Optional LLM endpoint for stage 4
    pub llm: Option<&'a LlmClient>,
    /// Pipeline thresholds
    pub thresholds: ResolverThresholds,
}

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Which stage decided the resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Exact email/phone attribute hit
    Exact,
    /// Unique high-confidence fuzzy name match
    Fuzzy,
    /// Fuzzy match promoted by graph proximity
    Graph,
    /// LLM tiebreak choice
    Llm,
    /// No confident match; a new entity was created
    Created,
}

/// Result of resolving one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Canonical entity id the mention resolved to
    pub entity_id: String,
    /// Stage that decided
    pub match_type: MatchType,
    /// Final score of the winning candidate (1.0 for exact, 0.0 for created)
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct TiebreakReply {
    choice: usize,
    #[allow(dead_code)]
    reason: Option<String>,
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Staged entity resolver over the shared graph
#[derive(Clone)]
pub struct EntityResolver {
    graph: EntityGraph,
}

impl EntityResolver {
    /// Create over the shared entity graph
    pub fn new(graph: EntityGraph) -> Self {
        Self { graph }
    }

    /// Resolve a mention to a canonical entity, creating one when no stage
    /// is confident.
    pub async fn resolve(
        &self,
        candidate: &ResolveCandidate,
        ctx: &ResolutionContext<'_>,
    ) -> Result<Resolution> {
        // Stage 1: exact attribute match
        if let Some(entity) = self.exact_match(candidate)? {
            self.record_candidate_attributes(&entity.id, candidate)?;
            return Ok(Resolution {
                entity_id: entity.id,
                match_type: MatchType::Exact,
                score: 1.0,
            });
        }

        // Stage 2: fuzzy name scoring over same-type entities
        let mut scored = self.fuzzy_candidates(candidate, &ctx.thresholds)?;

        let high: Vec<&(Entity, f64)> = scored
            .iter()
            .filter(|(_, score)| *score >= ctx.thresholds.high_confidence)
            .collect();
        if high.len() == 1 {
            let (entity, score) = (high[0].0.clone(), high[0].1);
            self.record_candidate_attributes(&entity.id, candidate)?;
            return Ok(Resolution {
                entity_id: entity.id,
                match_type: MatchType::Fuzzy,
                score,
            });
        }

        // Stage 3: graph-proximity rescoring against co-occurring entities
        if !scored.is_empty() && !ctx.co_occurring.is_empty() {
            for (entity, score) in scored.iter_mut() {
                let shared = self
                    .graph
                    .shared_connection_count(&entity.id, &ctx.co_occurring)?;
                let boost = (shared as f64 * ctx.thresholds.graph_boost_per_connection)
                    .min(ctx.thresholds.graph_boost_max);
                *score += boost;
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((entity, score)) = scored.first() {
                if *score >= ctx.thresholds.high_confidence {
                    self.record_candidate_attributes(&entity.id, candidate)?;
                    return Ok(Resolution {
                        entity_id: entity.id.clone(),
                        match_type: MatchType::Graph,
                        score: *score,
                    });
                }
            }
        }

        // Stage 4: LLM tiebreak over the remaining candidates
        if scored.len() > 1 {
            if let Some(llm) = ctx.llm {
                match self.llm_tiebreak(llm, candidate, ctx, &scored).await {
                    Some(resolution) => {
                        self.record_candidate_attributes(&resolution.entity_id, candidate)?;
                        return Ok(resolution);
                    }
                    // Explicit "new entity" choice or an endpoint failure:
                    // both fall through to creation
                    None => {}
                }
            }
        }

        self.create_from_candidate(candidate)
    }

    // ========================================================================
    // STAGES
    // ========================================================================

    fn exact_match(&self, candidate: &ResolveCandidate) -> Result<Option<Entity>> {
        if let Some(ref email) = candidate.email {
            if let Some(entity) = self.graph.find_by_attribute("email", email.trim())? {
                return Ok(Some(entity));
            }
        }

        if let Some(ref phone) = candidate.phone {
            if let Some(wanted) = normalize_phone(phone) {
                // Phone values are stored as supplied; compare on the
                // normalized last-10 form
                let matched = self.graph.storage().with_reader(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT entity_id, attribute_value FROM entity_attributes
                         WHERE attribute_type = 'phone'",
                    )?;
                    let rows: Vec<(String, String)> = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows
                        .into_iter()
                        .find(|(_, value)| normalize_phone(value).as_deref() == Some(&wanted))
                        .map(|(entity_id, _)| entity_id))
                })?;
                if let Some(entity_id) = matched {
                    return self.graph.get_entity(&entity_id);
                }
            }
        }

        Ok(None)
    }

    /// Score every same-type entity; keep those above the fuzzy floor,
    /// sorted descending
    fn fuzzy_candidates(
        &self,
        candidate: &ResolveCandidate,
        thresholds: &ResolverThresholds,
    ) -> Result<Vec<(Entity, f64)>> {
        let mut scored = Vec::new();
        for entity in self.graph.entities_of_type(candidate.entity_type)? {
            let mut score = matcher::similarity(&candidate.name, &entity.canonical_name);
            // Absorbed names live on as aliases; score them too so merged
            // entities keep resolving
            for attr in self.graph.attributes(&entity.id)? {
                if attr.attribute_type == "alias" {
                    score = score.max(matcher::similarity(&candidate.name, &attr.attribute_value));
                }
            }
            if score >= thresholds.fuzzy_min {
                scored.push((entity, score));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }

    /// Ask the LLM to pick among the top five candidates.
    ///
    /// Returns None for "new entity" (choice 0), an endpoint failure, or an
    /// unparseable reply; all three fall back to creation.
    async fn llm_tiebreak(
        &self,
        llm: &LlmClient,
        candidate: &ResolveCandidate,
        ctx: &ResolutionContext<'_>,
        scored: &[(Entity, f64)],
    ) -> Option<Resolution> {
        let top: Vec<&(Entity, f64)> = scored.iter().take(5).collect();

        let mut prompt = String::from(
            "You are resolving a mention of a person or organization to a known entity.\n\n",
        );
        prompt.push_str(&format!("Mention: {:?}\n", candidate.name));
        if let Some(ref email) = candidate.email {
            prompt.push_str(&format!("Email: {email}\n"));
        }
        if let Some(ref text) = ctx.surrounding_text {
            prompt.push_str(&format!("Surrounding text: {text}\n"));
        }
        prompt.push_str("\nCandidates:\n");
        for (i, (entity, score)) in top.iter().enumerate() {
            let attrs = self.graph.attributes(&entity.id).ok().unwrap_or_default();
            let attr_summary: Vec<String> = attrs
                .iter()
                .map(|a| format!("{}={}", a.attribute_type, a.attribute_value))
                .collect();
            prompt.push_str(&format!(
                "{}. {} (score {:.2}) [{}]\n",
                i + 1,
                entity.canonical_name,
                score,
                attr_summary.join(", ")
            ));
        }
        prompt.push_str(
            "\nReply with JSON only: {\"choice\": <number>, \"reason\": \"...\"}.\n\
             Use choice 0 if this is a new entity not in the list.\n",
        );

        let reply = match llm.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("llm tiebreak failed, creating new entity: {e}");
                return None;
            }
        };

        let parsed = extract_json_object(&reply)
            .and_then(|json| serde_json::from_str::<TiebreakReply>(&json).ok());
        let Some(reply) = parsed else {
            tracing::warn!("llm tiebreak reply was not valid JSON");
            return None;
        };

        if reply.choice == 0 || reply.choice > top.len() {
            return None;
        }

        let (entity, score) = top[reply.choice - 1];
        Some(Resolution {
            entity_id: entity.id.clone(),
            match_type: MatchType::Llm,
            score: *score,
        })
    }

    // ========================================================================
    // CREATION & ATTRIBUTES
    // ========================================================================

    fn create_from_candidate(&self, candidate: &ResolveCandidate) -> Result<Resolution> {
        let mut attrs: Vec<(&str, &str)> = Vec::new();
        if let Some(ref email) = candidate.email {
            attrs.push(("email", email.as_str()));
        }
        if let Some(ref phone) = candidate.phone {
            attrs.push(("phone", phone.as_str()));
        }
        for (attr_type, attr_value) in &candidate.attributes {
            attrs.push((attr_type.as_str(), attr_value.as_str()));
        }

        let entity = self
            .graph
            .create_entity(&candidate.name, candidate.entity_type, &attrs)?;

        tracing::debug!(entity_id = %entity.id, name = %candidate.name, "created new entity");

        Ok(Resolution {
            entity_id: entity.id,
            match_type: MatchType::Created,
            score: 0.0,
        })
    }

    /// Attach whatever the candidate carried to the matched entity;
    /// duplicates are ignored by the uniqueness constraint
    fn record_candidate_attributes(
        &self,
        entity_id: &str,
        candidate: &ResolveCandidate,
    ) -> Result<()> {
        if let Some(ref email) = candidate.email {
            self.graph.add_attribute(entity_id, "email", email, 1.0, None)?;
        }
        if let Some(ref phone) = candidate.phone {
            self.graph.add_attribute(entity_id, "phone", phone, 1.0, None)?;
        }
        for (attr_type, attr_value) in &candidate.attributes {
            self.graph
                .add_attribute(entity_id, attr_type, attr_value, 1.0, None)?;
        }
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Normalize a phone number to its last ten digits
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].to_string())
}

/// Pull the first balanced `{...}` block out of free-form LLM text
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================
