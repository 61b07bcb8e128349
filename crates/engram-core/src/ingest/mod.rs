//! Ingestion
//!
//! Entry point for normalized messages, contacts, and calendar events
//! produced by source-specific scrapers. Every participant is resolved to a
//! canonical entity, messages are deduplicated on `(source_type, source_id)`
//! (a duplicate is a counted skip, not an error), communication edges are
//! updated, and per-item failures are aggregated without aborting the batch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commitments::{CommitmentInput, CommitmentTracker, CommitmentType};
use crate::graph::EntityGraph;
use crate::model::{db_time, encode_id_list, EntityType};
use crate::resolver::{EntityResolver, ResolutionContext, ResolveCandidate};
use crate::storage::Result;

// ============================================================================
// INPUT SHAPES
// ============================================================================

/// A message participant as the scraper saw it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

impl Participant {
    fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none() && self.name.is_none()
    }

    fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        if let Some(ref email) = self.email {
            return email.split('@').next().unwrap_or(email).to_string();
        }
        self.phone.clone().unwrap_or_else(|| "Unknown".to_string())
    }

    fn to_candidate(&self) -> ResolveCandidate {
        ResolveCandidate {
            name: self.display_name(),
            entity_type: EntityType::Person,
            email: self.email.clone(),
            phone: self.phone.clone(),
            attributes: vec![],
        }
    }
}

/// Recipient role on a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    #[default]
    To,
    Cc,
    Bcc,
}

/// A recipient with its role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(flatten)]
    pub participant: Participant,
    #[serde(rename = "type", default)]
    pub kind: RecipientKind,
}

/// A normalized message from any source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub source_type: String,
    pub source_id: String,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub sender: Participant,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set by the scraper when it knows; inferred from the configured user
    /// identifiers otherwise
    pub is_from_user: Option<bool>,
}

/// A normalized contact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingContact {
    pub name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub birthday: Option<String>,
}

/// A normalized calendar event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCalendarEvent {
    pub source_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attendees: Vec<Participant>,
    pub location: Option<String>,
}

// ============================================================================
// REPORTS
// ============================================================================

/// Per-item failure inside a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub source_id: String,
    pub error_message: String,
}

/// Outcome of one ingestion batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub ingested: usize,
    pub duplicates: usize,
    pub errors: Vec<ItemError>,
}

// ============================================================================
// INGESTOR
// ============================================================================

/// Batch ingestion over the resolver and graph
pub struct Ingestor {
    graph: EntityGraph,
    resolver: EntityResolver,
    commitments: CommitmentTracker,
    user_email: Option<String>,
    user_phone: Option<String>,
}

impl Ingestor {
    /// Create with the user's own identifiers for self-detection
    pub fn new(
        graph: EntityGraph,
        resolver: EntityResolver,
        commitments: CommitmentTracker,
        user_email: Option<String>,
        user_phone: Option<String>,
    ) -> Self {
        Self {
            graph,
            resolver,
            commitments,
            user_email,
            user_phone,
        }
    }

    fn is_user(&self, participant: &Participant) -> bool {
        if let (Some(email), Some(user_email)) = (&participant.email, &self.user_email) {
            if email.eq_ignore_ascii_case(user_email) {
                return true;
            }
        }
        if let (Some(phone), Some(user_phone)) = (&participant.phone, &self.user_phone) {
            if crate::resolver::normalize_phone(phone) == crate::resolver::normalize_phone(user_phone)
            {
                return true;
            }
        }
        false
    }

    /// Ingest a batch of messages. Duplicates are counted and skipped;
    /// per-item errors are collected without aborting the batch.
    pub async fn ingest_messages(&self, batch: &[IncomingMessage]) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for message in batch {
            match self.ingest_one_message(message).await {
                Ok(true) => report.ingested += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => report.errors.push(ItemError {
                    source_id: message.source_id.clone(),
                    error_message: e.to_string(),
                }),
            }
        }

        tracing::info!(
            ingested = report.ingested,
            duplicates = report.duplicates,
            errors = report.errors.len(),
            "message batch ingested"
        );
        Ok(report)
    }

    /// Returns Ok(false) for a duplicate
    async fn ingest_one_message(&self, message: &IncomingMessage) -> Result<bool> {
        let storage = self.graph.storage();

        let exists: bool = storage.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE source_type = ?1 AND source_id = ?2)",
                params![message.source_type, message.source_id],
                |row| row.get(0),
            )?)
        })?;
        if exists {
            return Ok(false);
        }

        // Resolve recipients first: they become the co-occurring set for the
        // sender's resolution
        let mut recipient_ids: Vec<String> = Vec::new();
        for recipient in &message.recipients {
            if recipient.participant.is_empty() || self.is_user(&recipient.participant) {
                continue;
            }
            let resolution = self
                .resolver
                .resolve(&recipient.participant.to_candidate(), &ResolutionContext::default())
                .await?;
            recipient_ids.push(resolution.entity_id);
        }

        let is_from_user = message
            .is_from_user
            .unwrap_or_else(|| self.is_user(&message.sender));

        let sender_entity_id = if is_from_user || message.sender.is_empty() {
            None
        } else {
            let co_occurring: HashSet<String> = recipient_ids.iter().cloned().collect();
            let ctx = ResolutionContext {
                co_occurring,
                surrounding_text: Some(snippet(&message.body_text)),
                ..Default::default()
            };
            Some(
                self.resolver
                    .resolve(&message.sender.to_candidate(), &ctx)
                    .await?
                    .entity_id,
            )
        };

        storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO messages
                    (id, source_type, source_id, thread_id, sender_entity_id,
                     recipient_entity_ids, subject, body_text, body_html, timestamp,
                     is_from_user, processed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
                params![
                    Uuid::new_v4().to_string(),
                    message.source_type,
                    message.source_id,
                    message.thread_id,
                    sender_entity_id,
                    encode_id_list(&recipient_ids),
                    message.subject,
                    message.body_text,
                    message.body_html,
                    db_time(message.timestamp),
                    is_from_user,
                ],
            )?;
            Ok(())
        })?;

        // Communication edges: sender toward every recipient
        if let Some(ref sender_id) = sender_entity_id {
            for recipient_id in &recipient_ids {
                self.graph
                    .record_edge_evidence(sender_id, recipient_id, "communicates_with")?;
            }
        }

        Ok(true)
    }

    /// Ingest contacts, seeding entities and attributes
    pub async fn ingest_contacts(&self, batch: &[IncomingContact]) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for contact in batch {
            let result: Result<()> = async {
                let mut attributes: Vec<(String, String)> = Vec::new();
                if let Some(ref company) = contact.company {
                    attributes.push(("company".into(), company.clone()));
                }
                if let Some(ref title) = contact.title {
                    attributes.push(("title".into(), title.clone()));
                }
                if let Some(ref birthday) = contact.birthday {
                    attributes.push(("birthday".into(), birthday.clone()));
                }

                let candidate = ResolveCandidate {
                    name: contact.name.clone(),
                    entity_type: EntityType::Person,
                    email: contact.emails.first().cloned(),
                    phone: contact.phones.first().cloned(),
                    attributes,
                };
                let resolution = self
                    .resolver
                    .resolve(&candidate, &ResolutionContext::default())
                    .await?;

                // Secondary emails/phones attach to the same entity
                for email in contact.emails.iter().skip(1) {
                    self.graph
                        .add_attribute(&resolution.entity_id, "email", email, 1.0, None)?;
                }
                for phone in contact.phones.iter().skip(1) {
                    self.graph
                        .add_attribute(&resolution.entity_id, "phone", phone, 1.0, None)?;
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => report.ingested += 1,
                Err(e) => report.errors.push(ItemError {
                    source_id: contact.name.clone(),
                    error_message: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// Ingest calendar events: attendees resolve to entities and each event
    /// becomes a meeting commitment. Re-ingesting the same event is a
    /// counted duplicate.
    pub async fn ingest_calendar_events(
        &self,
        batch: &[IncomingCalendarEvent],
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for event in batch {
            let exists: bool = self.graph.storage().with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM commitments
                     WHERE source_type = 'calendar' AND source_id = ?1)",
                    [&event.source_id],
                    |row| row.get(0),
                )?)
            })?;
            if exists {
                report.duplicates += 1;
                continue;
            }

            let result: Result<()> = async {
                let mut counterparty: Option<String> = None;
                for attendee in &event.attendees {
                    if attendee.is_empty() || self.is_user(attendee) {
                        continue;
                    }
                    let resolution = self
                        .resolver
                        .resolve(&attendee.to_candidate(), &ResolutionContext::default())
                        .await?;
                    counterparty.get_or_insert(resolution.entity_id);
                }

                self.commitments.create(CommitmentInput {
                    commitment_type: CommitmentType::Meeting,
                    description: event.title.clone(),
                    owner_entity_id: None,
                    counterparty_entity_id: counterparty,
                    due_date: Some(event.start_time),
                    source_type: Some("calendar".into()),
                    source_id: Some(event.source_id.clone()),
                })?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => report.ingested += 1,
                Err(e) => report.errors.push(ItemError {
                    source_id: event.source_id.clone(),
                    error_message: e.to_string(),
                }),
            }
        }
        Ok(report)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn ingestor() -> Ingestor {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let graph = EntityGraph::new(Arc::clone(&storage));
        let resolver = EntityResolver::new(graph.clone());
        let commitments = CommitmentTracker::new(storage);
        Ingestor::new(
            graph,
            resolver,
            commitments,
            Some("me@example.com".into()),
            Some("+1 555 010 0100".into()),
        )
    }

    fn message(source_id: &str, from: &str, to: &str) -> IncomingMessage {
        IncomingMessage {
            source_type: "gmail".into(),
            source_id: source_id.into(),
            thread_id: Some("th-1".into()),
            sender: Participant {
                email: Some(from.into()),
                name: None,
                phone: None,
            },
            recipients: vec![Recipient {
                participant: Participant {
                    email: Some(to.into()),
                    name: None,
                    phone: None,
                },
                kind: RecipientKind::To,
            }],
            subject: Some("hello".into()),
            body_text: "hello there".into(),
            body_html: None,
            timestamp: Utc::now(),
            is_from_user: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_resolves_and_dedups() {
        let ingestor = ingestor();
        let batch = vec![
            message("g-1", "jane@acme.example", "me@example.com"),
            message("g-1", "jane@acme.example", "me@example.com"),
        ];

        let report = ingestor.ingest_messages(&batch).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.duplicates, 1);
        assert!(report.errors.is_empty());

        // Jane exists exactly once
        let jane = ingestor
            .graph
            .find_by_attribute("email", "jane@acme.example")
            .unwrap();
        assert!(jane.is_some());
    }

    #[tokio::test]
    async fn test_is_from_user_inferred() {
        let ingestor = ingestor();
        let batch = vec![message("g-2", "me@example.com", "jane@acme.example")];
        ingestor.ingest_messages(&batch).await.unwrap();

        let (is_from_user, sender): (bool, Option<String>) = ingestor
            .graph
            .storage()
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT is_from_user, sender_entity_id FROM messages WHERE source_id = 'g-2'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert!(is_from_user);
        // The user is not resolved to an entity of their own
        assert!(sender.is_none());
    }

    #[tokio::test]
    async fn test_communication_edges_recorded() {
        let ingestor = ingestor();
        let batch = vec![
            message("g-3", "jane@acme.example", "sam@acme.example"),
            message("g-4", "jane@acme.example", "sam@acme.example"),
        ];
        ingestor.ingest_messages(&batch).await.unwrap();

        let jane = ingestor
            .graph
            .find_by_attribute("email", "jane@acme.example")
            .unwrap()
            .unwrap();
        let edges = ingestor.graph.edges_of(&jane.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, "communicates_with");
        assert_eq!(edges[0].evidence_count, 2);
    }

    #[tokio::test]
    async fn test_ingest_contacts_attaches_attributes() {
        let ingestor = ingestor();
        let report = ingestor
            .ingest_contacts(&[IncomingContact {
                name: "Jane Porter".into(),
                emails: vec!["jane@acme.example".into(), "jp@personal.example".into()],
                phones: vec!["+1 555 010 0199".into()],
                company: Some("Acme".into()),
                title: Some("CTO".into()),
                birthday: None,
            }])
            .await
            .unwrap();
        assert_eq!(report.ingested, 1);

        let jane = ingestor
            .graph
            .find_by_attribute("email", "jp@personal.example")
            .unwrap()
            .unwrap();
        let attrs = ingestor.graph.attributes(&jane.id).unwrap();
        let types: Vec<&str> = attrs.iter().map(|a| a.attribute_type.as_str()).collect();
        assert!(types.contains(&"company"));
        assert!(types.contains(&"title"));
        assert_eq!(types.iter().filter(|t| **t == "email").count(), 2);
    }

    #[tokio::test]
    async fn test_calendar_events_become_meetings() {
        let ingestor = ingestor();
        let event = IncomingCalendarEvent {
            source_id: "cal-1".into(),
            title: "Design sync".into(),
            start_time: Utc::now() + chrono::Duration::hours(2),
            end_time: None,
            attendees: vec![
                Participant {
                    email: Some("me@example.com".into()),
                    ..Default::default()
                },
                Participant {
                    email: Some("jane@acme.example".into()),
                    ..Default::default()
                },
            ],
            location: None,
        };

        let report = ingestor.ingest_calendar_events(&[event.clone()]).await.unwrap();
        assert_eq!(report.ingested, 1);

        // Re-ingesting is a duplicate
        let report = ingestor.ingest_calendar_events(&[event]).await.unwrap();
        assert_eq!(report.duplicates, 1);

        let open = ingestor.commitments.open_commitments().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].commitment_type, CommitmentType::Meeting);
        assert!(open[0].counterparty_entity_id.is_some());
    }
}
