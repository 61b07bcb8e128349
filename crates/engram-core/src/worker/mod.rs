//! Background Worker
//!
//! One periodic loop that keeps the derived state fresh: messages drain into
//! the event log (ordered by source timestamp), unembedded messages get
//! vectors, patterns are mined, the rhythm matrix is rebuilt, predictions
//! fire and verify, and proactive triggers go out deduplicated per window.
//! Every step's error is collected into the cycle result; no step aborts the
//! cycle, and a cancelled cycle leaves the database at its last committed
//! step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Timelike, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::behavior::{
    self, patterns::MiningConfig, predictions::PredictionContext, predictions::UpcomingEvent,
};
use crate::external::EmbeddingClient;
use crate::model::{db_now, db_time, Event};
use crate::storage::{Result, Storage};
use crate::vector::VectorStore;

// ============================================================================
// CONFIG & STATUS
// ============================================================================

/// Worker tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cycle period
    pub interval: Duration,
    /// Most messages drained per cycle
    pub batch_size: usize,
    /// Unprocessed events required before mining runs
    pub min_events_for_mining: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 50,
            min_events_for_mining: 10,
        }
    }
}

/// Outcome of one worker cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub messages_processed: usize,
    pub events_created: usize,
    pub embeddings_stored: usize,
    pub patterns_detected: usize,
    pub rhythm_slots: usize,
    pub predictions_fired: usize,
    pub predictions_expired: usize,
    pub triggers_fired: usize,
    /// Per-step error messages; a failed step never aborts the cycle
    pub errors: Vec<String>,
    pub completed_at: Option<String>,
}

/// Live worker state
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub running: bool,
    pub cycles_run: u64,
    pub last_cycle: Option<CycleResult>,
}

// ============================================================================
// WORKER
// ============================================================================

/// The periodic background worker
pub struct BackgroundWorker {
    storage: Arc<Storage>,
    vectors: Arc<dyn VectorStore>,
    embedding: Option<EmbeddingClient>,
    config: WorkerConfig,
    status: Mutex<WorkerStatus>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl BackgroundWorker {
    /// Create a worker; it does nothing until started or manually
    /// triggered
    pub fn new(
        storage: Arc<Storage>,
        vectors: Arc<dyn VectorStore>,
        embedding: Option<EmbeddingClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            vectors,
            embedding,
            config,
            status: Mutex::new(WorkerStatus::default()),
            shutdown: Mutex::new(None),
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Start the periodic loop. A second start while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut shutdown_slot = match self.shutdown.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if shutdown_slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *shutdown_slot = Some(tx);
        drop(shutdown_slot);

        if let Ok(mut status) = self.status.lock() {
            status.running = true;
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("background worker started");
            let mut interval = tokio::time::interval(worker.config.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let result = worker.run_cycle().await;
                        if let Ok(mut status) = worker.status.lock() {
                            status.cycles_run += 1;
                            status.last_cycle = Some(result);
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            tracing::info!("background worker shutting down");
                            break;
                        }
                    }
                }
            }
            if let Ok(mut status) = worker.status.lock() {
                status.running = false;
            }
        });
    }

    /// Stop the periodic loop
    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(true);
            }
        }
    }

    /// Run one cycle immediately (also used by the periodic loop)
    pub async fn run_cycle(&self) -> CycleResult {
        let mut result = CycleResult::default();
        let now = Utc::now();

        match self.drain_messages() {
            Ok((messages, events)) => {
                result.messages_processed = messages;
                result.events_created = events;
            }
            Err(e) => result.errors.push(format!("drain_messages: {e}")),
        }

        if self.embedding.is_some() {
            match self.embed_pending().await {
                Ok(count) => result.embeddings_stored = count,
                Err(e) => result.errors.push(format!("embed_pending: {e}")),
            }
        }

        match self.mine_patterns() {
            Ok(count) => result.patterns_detected = count,
            Err(e) => result.errors.push(format!("mine_patterns: {e}")),
        }

        match behavior::rebuild_rhythms(&self.storage, 7) {
            Ok(slots) => result.rhythm_slots = slots,
            Err(e) => result.errors.push(format!("rebuild_rhythms: {e}")),
        }

        match self.process_predictions(now) {
            Ok((fired, expired)) => {
                result.predictions_fired = fired;
                result.predictions_expired = expired;
            }
            Err(e) => result.errors.push(format!("process_predictions: {e}")),
        }

        match self.fire_proactive_triggers(now) {
            Ok(count) => result.triggers_fired = count,
            Err(e) => result.errors.push(format!("proactive_triggers: {e}")),
        }

        result.completed_at = Some(db_now());
        if !result.errors.is_empty() {
            tracing::warn!(errors = ?result.errors, "worker cycle completed with errors");
        }
        result
    }

    // ========================================================================
    // STEP 1: MESSAGES -> EVENTS
    // ========================================================================

    /// Drain unprocessed messages into the event log in source-timestamp
    /// order. Returns `(messages, events)`.
    fn drain_messages(&self) -> Result<(usize, usize)> {
        struct Row {
            id: String,
            timestamp: String,
            is_from_user: bool,
            sender: Option<String>,
            recipients: Vec<String>,
            source_type: String,
        }

        let rows: Vec<Row> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, is_from_user, sender_entity_id, recipient_entity_ids,
                        source_type
                 FROM messages WHERE processed = 0
                 ORDER BY timestamp ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([self.config.batch_size as i64], |row| {
                    Ok(Row {
                        id: row.get(0)?,
                        timestamp: row.get::<_, String>(1)?,
                        is_from_user: row.get(2)?,
                        sender: row.get(3)?,
                        recipients: crate::model::decode_id_list(row.get(4)?),
                        source_type: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        if rows.is_empty() {
            return Ok((0, 0));
        }

        let mut events = 0usize;
        let count = rows.len();
        for row in rows {
            let mut entities: Vec<String> = row.recipients.clone();
            if let Some(ref sender) = row.sender {
                entities.insert(0, sender.clone());
            }
            let context_type = self.infer_context(&entities)?;

            let event_type = if row.is_from_user {
                "message_sent"
            } else {
                "message_received"
            };
            let payload = serde_json::json!({
                "category": context_type.clone().unwrap_or_else(|| "communication".into()),
                "source_type": row.source_type,
                "message_id": row.id,
            });

            self.storage.with_tx(|tx| {
                tx.execute(
                    "INSERT INTO events (id, event_type, timestamp, payload, context_type, entities)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        event_type,
                        row.timestamp,
                        payload.to_string(),
                        context_type,
                        crate::model::encode_id_list(&entities),
                    ],
                )?;
                tx.execute("UPDATE messages SET processed = 1 WHERE id = ?1", [&row.id])?;
                Ok(())
            })?;
            events += 1;
        }

        Ok((count, events))
    }

    /// Modal context membership among the message's entities
    fn infer_context(&self, entities: &[String]) -> Result<Option<String>> {
        if entities.is_empty() {
            return Ok(None);
        }
        let graph = crate::graph::EntityGraph::new(Arc::clone(&self.storage));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entity_id in entities {
            for context in graph.context_memberships(entity_id)? {
                *counts.entry(context).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(context, _)| context))
    }

    // ========================================================================
    // STEP 2: EMBEDDINGS
    // ========================================================================

    /// Embed messages that have no vector yet. Each failure is logged and
    /// the message stays unembedded for a later cycle.
    async fn embed_pending(&self) -> Result<usize> {
        let Some(ref embedding) = self.embedding else {
            return Ok(0);
        };

        let pending: Vec<(String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.body_text FROM messages m
                 LEFT JOIN vector_rows v
                    ON v.source_type = 'message' AND v.source_id = m.id
                 WHERE v.id IS NULL
                 ORDER BY m.timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([self.config.batch_size as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut stored = 0usize;
        for (message_id, body) in pending {
            // The embed call suspends; no transaction is open across it
            match embedding.embed(&body).await {
                Ok(vector) => {
                    match self
                        .vectors
                        .store(&message_id, "message", &vector, Some(&body), None)
                    {
                        Ok(_) => stored += 1,
                        Err(e) => tracing::warn!("vector store failed for {message_id}: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("embedding failed for {message_id}, will retry: {e}");
                }
            }
        }
        Ok(stored)
    }

    // ========================================================================
    // STEP 3: PATTERN MINING
    // ========================================================================

    /// Mine patterns once enough unprocessed events have accumulated.
    /// Detection runs over the last week of events so periodic patterns see
    /// their full history; the unprocessed ones are then marked processed.
    fn mine_patterns(&self) -> Result<usize> {
        let unprocessed: i64 = self.storage.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE processed = 0",
                [],
                |row| row.get(0),
            )?)
        })?;
        if (unprocessed as usize) < self.config.min_events_for_mining {
            return Ok(0);
        }

        let cutoff = db_time(Utc::now() - chrono::Duration::days(7));
        let events: Vec<Event> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, timestamp, payload, context_type, entities, processed
                 FROM events WHERE timestamp >= ?1 ORDER BY timestamp",
            )?;
            let rows = stmt
                .query_map([&cutoff], Event::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let detected = behavior::mine_patterns(&events, &MiningConfig::default());
        let count = detected.len();
        for pattern in &detected {
            behavior::upsert_pattern(&self.storage, pattern)?;
        }

        self.storage.with_tx(|tx| {
            tx.execute("UPDATE events SET processed = 1 WHERE processed = 0", [])?;
            Ok(())
        })?;

        Ok(count)
    }

    // ========================================================================
    // STEP 4: PREDICTIONS
    // ========================================================================

    /// Generate predictions from upcoming meetings, fire the due ones, and
    /// expire the overdue unverified ones. Returns `(fired, expired)`.
    fn process_predictions(&self, now: chrono::DateTime<Utc>) -> Result<(usize, usize)> {
        let horizon = db_time(now + chrono::Duration::hours(2));
        let upcoming: Vec<UpcomingEvent> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT description, due_date FROM commitments
                 WHERE status = 'open' AND commitment_type = 'meeting'
                   AND due_date IS NOT NULL AND due_date > ?1 AND due_date <= ?2",
            )?;
            let rows: Vec<(String, chrono::DateTime<Utc>)> = stmt
                .query_map(params![db_time(now), horizon], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .map(|(title, start_time)| UpcomingEvent {
                    title,
                    start_time,
                    entity_ids: vec![],
                })
                .collect())
        })?;

        behavior::generate_predictions(
            &self.storage,
            &PredictionContext {
                now,
                upcoming_events: upcoming,
                active_context: None,
            },
        )?;

        let fired = behavior::fire_due_predictions(&self.storage, now)?.len();
        let expired = behavior::verify_overdue(&self.storage, now)?;
        Ok((fired, expired))
    }

    // ========================================================================
    // STEP 5: PROACTIVE TRIGGERS
    // ========================================================================

    /// Fire proactive triggers, deduplicated against those already fired in
    /// the relevant window
    fn fire_proactive_triggers(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let mut fired = 0usize;

        // Meeting prep: open meetings starting within half an hour
        let soon = db_time(now + chrono::Duration::minutes(30));
        let meetings: Vec<(String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, description FROM commitments
                 WHERE status = 'open' AND commitment_type = 'meeting'
                   AND due_date IS NOT NULL AND due_date > ?1 AND due_date <= ?2",
            )?;
            let rows = stmt
                .query_map(params![db_time(now), soon], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        for (id, description) in meetings {
            fired += self.fire_once(
                "meeting_prep",
                &id,
                chrono::Duration::hours(1),
                serde_json::json!({ "commitment_id": id, "description": description }),
                now,
            )? as usize;
        }

        // Deadline warnings: anything else due within a day
        let tomorrow = db_time(now + chrono::Duration::hours(24));
        let deadlines: Vec<(String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, description FROM commitments
                 WHERE status = 'open' AND commitment_type != 'meeting'
                   AND due_date IS NOT NULL AND due_date > ?1 AND due_date <= ?2",
            )?;
            let rows = stmt
                .query_map(params![db_time(now), tomorrow], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        for (id, description) in deadlines {
            fired += self.fire_once(
                "deadline_warning",
                &id,
                chrono::Duration::hours(24),
                serde_json::json!({ "commitment_id": id, "description": description }),
                now,
            )? as usize;
        }

        // Stale follow-ups: undated open commitments older than a week
        let week_ago = db_time(now - chrono::Duration::days(7));
        let stale: Vec<(String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, description FROM commitments
                 WHERE status = 'open' AND due_date IS NULL AND created_at < ?1",
            )?;
            let rows = stmt
                .query_map([&week_ago], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        for (id, description) in stale {
            fired += self.fire_once(
                "stale_followup",
                &id,
                chrono::Duration::days(7),
                serde_json::json!({ "commitment_id": id, "description": description }),
                now,
            )? as usize;
        }

        // Pattern-based: strong habits whose hour is now
        let hour = now.hour();
        for pattern in behavior::patterns::stored_patterns(&self.storage)? {
            if pattern.strength < 0.7 {
                continue;
            }
            if pattern.signature["hour"].as_u64() != Some(hour as u64) {
                continue;
            }
            fired += self.fire_once(
                "pattern_based",
                &pattern.id,
                chrono::Duration::hours(24),
                serde_json::json!({ "pattern_id": pattern.id, "signature": pattern.signature }),
                now,
            )? as usize;
        }

        Ok(fired)
    }

    /// Insert a trigger unless one with the same type and key fired inside
    /// the window. Returns whether it fired.
    fn fire_once(
        &self,
        trigger_type: &str,
        dedupe_key: &str,
        window: chrono::Duration,
        payload: serde_json::Value,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        let window_start = db_time(now - window);
        let exists: bool = self.storage.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM proactive_triggers
                 WHERE trigger_type = ?1 AND dedupe_key = ?2 AND fired_at > ?3)",
                params![trigger_type, dedupe_key, window_start],
                |row| row.get(0),
            )?)
        })?;
        if exists {
            return Ok(false);
        }

        self.storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO proactive_triggers (id, trigger_type, dedupe_key, fired_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    trigger_type,
                    dedupe_key,
                    db_time(now),
                    payload.to_string(),
                ],
            )?;
            Ok(())
        })?;
        tracing::debug!(trigger_type, dedupe_key, "proactive trigger fired");
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitments::{CommitmentInput, CommitmentTracker, CommitmentType};

    fn worker() -> BackgroundWorker {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let vectors = crate::vector::open_vector_store(Arc::clone(&storage), None, 8);
        BackgroundWorker::new(storage, vectors, None, WorkerConfig::default())
    }

    fn insert_message(worker: &BackgroundWorker, source_id: &str, offset_secs: i64) {
        worker
            .storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO messages (id, source_type, source_id, body_text, timestamp)
                     VALUES (?1, 'gmail', ?1, 'note to self', ?2)",
                    params![
                        source_id,
                        db_time(Utc::now() + chrono::Duration::seconds(offset_secs)),
                    ],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_drains_messages_into_events() {
        let worker = worker();
        insert_message(&worker, "g-2", 1);
        insert_message(&worker, "g-1", 0);

        let result = worker.run_cycle().await;
        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
        assert_eq!(result.messages_processed, 2);
        assert_eq!(result.events_created, 2);

        // Events follow source-timestamp order, not insertion order
        let ids: Vec<String> = worker
            .storage
            .with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT json_extract(payload, '$.message_id') FROM events ORDER BY rowid",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(ids, vec!["g-1", "g-2"]);

        // A second cycle finds nothing to drain
        let result = worker.run_cycle().await;
        assert_eq!(result.messages_processed, 0);
    }

    #[tokio::test]
    async fn test_proactive_triggers_dedupe() {
        let worker = worker();
        let commitments = CommitmentTracker::new(Arc::clone(&worker.storage));
        commitments
            .create(CommitmentInput {
                commitment_type: CommitmentType::Meeting,
                description: "standup".into(),
                owner_entity_id: None,
                counterparty_entity_id: None,
                due_date: Some(Utc::now() + chrono::Duration::minutes(10)),
                source_type: Some("calendar".into()),
                source_id: Some("cal-1".into()),
            })
            .unwrap();

        let first = worker.run_cycle().await;
        assert!(first.triggers_fired >= 1);

        // Same meeting, same window: no re-fire
        let second = worker.run_cycle().await;
        assert_eq!(second.triggers_fired, 0);
    }

    #[tokio::test]
    async fn test_mining_waits_for_enough_events() {
        let worker = worker();
        // 5 events: below the threshold of 10
        worker
            .storage
            .with_tx(|tx| {
                for i in 0..5 {
                    tx.execute(
                        "INSERT INTO events (id, event_type, timestamp, payload)
                         VALUES (?1, 'message_sent', ?2, '{}')",
                        params![format!("e{i}"), db_now()],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let result = worker.run_cycle().await;
        assert_eq!(result.patterns_detected, 0);

        // Events stay unprocessed for the next cycle
        let unprocessed: i64 = worker
            .storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE processed = 0",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(unprocessed, 5);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let worker = Arc::new({
            let storage = Arc::new(Storage::open_in_memory().unwrap());
            let vectors = crate::vector::open_vector_store(Arc::clone(&storage), None, 8);
            BackgroundWorker::new(
                storage,
                vectors,
                None,
                WorkerConfig {
                    interval: Duration::from_millis(10),
                    ..Default::default()
                },
            )
        });

        worker.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(worker.status().running);
        assert!(worker.status().cycles_run >= 1);

        worker.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!worker.status().running);
    }
}
