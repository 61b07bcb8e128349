//! Structural invariants that must survive any sequence of operations.

use chrono::{Duration, Utc};
use engram_core::{
    AssertionInput, CommitmentInput, CommitmentStatus, CommitmentType, IncomingMessage,
    Participant, Recipient,
};
use engram_e2e_tests::harness::TestEngine;

fn message(source_id: &str, from: &str, to: &str) -> IncomingMessage {
    IncomingMessage {
        source_type: "gmail".into(),
        source_id: source_id.into(),
        thread_id: None,
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
            kind: Default::default(),
        }],
        subject: None,
        body_text: "hello".into(),
        body_html: None,
        timestamp: Utc::now(),
        is_from_user: None,
    }
}

/// After a merge: every id in merge_history is dead, and no table holds a
/// reference to a deleted entity.
#[tokio::test]
async fn merge_leaves_no_dangling_references() {
    let fixture = TestEngine::new();
    let engine = &fixture.engine;

    // Build rows in every entity-referencing table
    engine
        .ingestor()
        .ingest_messages(&[
            message("g-1", "dup@acme.example", "sam@acme.example"),
            message("g-2", "sam@acme.example", "dup@acme.example"),
        ])
        .await
        .unwrap();

    let duplicate = engine
        .graph()
        .find_by_attribute("email", "dup@acme.example")
        .unwrap()
        .unwrap();
    let keeper = engine
        .graph()
        .create_entity("The Keeper", engram_core::EntityType::Person, &[])
        .unwrap();

    engine
        .beliefs()
        .record(AssertionInput {
            subject_entity_id: Some(duplicate.id.clone()),
            predicate: "works_at".into(),
            object_entity_id: Some(keeper.id.clone()),
            source_type: "test".into(),
            source_id: "t".into(),
            ..Default::default()
        })
        .unwrap();
    engine
        .commitments()
        .create(CommitmentInput {
            commitment_type: CommitmentType::Promise,
            description: "owed to the duplicate".into(),
            owner_entity_id: None,
            counterparty_entity_id: Some(duplicate.id.clone()),
            due_date: None,
            source_type: None,
            source_id: None,
        })
        .unwrap();
    engine
        .graph()
        .add_context_membership(&duplicate.id, "work")
        .unwrap();

    let merged = engram_core::merge_entities(engine.graph(), &keeper.id, &duplicate.id).unwrap();

    // Every merged id refers to a deleted entity
    for absorbed in &merged.merge_history {
        assert!(engine.graph().get_entity(absorbed).unwrap().is_none());
    }

    // And nothing in the database still points at it
    let dangling: i64 = engine
        .storage()
        .with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM entity_attributes
                     WHERE entity_id NOT IN (SELECT id FROM entities))
                  + (SELECT COUNT(*) FROM graph_edges
                     WHERE from_entity_id NOT IN (SELECT id FROM entities)
                        OR to_entity_id NOT IN (SELECT id FROM entities))
                  + (SELECT COUNT(*) FROM assertions
                     WHERE (subject_entity_id IS NOT NULL
                            AND subject_entity_id NOT IN (SELECT id FROM entities))
                        OR (object_entity_id IS NOT NULL
                            AND object_entity_id NOT IN (SELECT id FROM entities)))
                  + (SELECT COUNT(*) FROM messages
                     WHERE sender_entity_id IS NOT NULL
                       AND sender_entity_id NOT IN (SELECT id FROM entities))
                  + (SELECT COUNT(*) FROM commitments
                     WHERE (owner_entity_id IS NOT NULL
                            AND owner_entity_id NOT IN (SELECT id FROM entities))
                        OR (counterparty_entity_id IS NOT NULL
                            AND counterparty_entity_id NOT IN (SELECT id FROM entities)))
                  + (SELECT COUNT(*) FROM entity_contexts
                     WHERE entity_id NOT IN (SELECT id FROM entities))",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(dangling, 0);
}

/// At most one message row per (source_type, source_id), no matter how
/// often a batch is replayed.
#[tokio::test]
async fn message_uniqueness_survives_replay() {
    let fixture = TestEngine::new();
    let engine = &fixture.engine;
    let batch = vec![message("g-1", "a@x.example", "b@x.example")];

    for _ in 0..3 {
        engine.ingestor().ingest_messages(&batch).await.unwrap();
    }

    let count: i64 = engine
        .storage()
        .with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE source_type = 'gmail' AND source_id = 'g-1'",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(count, 1);
}

/// An open calendar meeting transitions to completed once the sync pass
/// runs more than an hour past its due time, with completed_at equal to the
/// scheduled time.
#[test]
fn calendar_meetings_eventually_complete() {
    let fixture = TestEngine::new();
    let commitments = fixture.engine.commitments();
    let meeting_time = Utc::now() - Duration::hours(2);

    let meeting = commitments
        .create(CommitmentInput {
            commitment_type: CommitmentType::Meeting,
            description: "retro".into(),
            owner_entity_id: None,
            counterparty_entity_id: None,
            due_date: Some(meeting_time),
            source_type: Some("calendar".into()),
            source_id: Some("cal-9".into()),
        })
        .unwrap();

    let completed = commitments.complete_past_calendar_events(Utc::now()).unwrap();
    assert_eq!(completed, 1);

    let meeting = commitments.get(&meeting.id).unwrap().unwrap();
    assert_eq!(meeting.status, CommitmentStatus::Completed);
    let completed_at = meeting.completed_at.unwrap();
    assert!((completed_at - meeting_time).num_milliseconds().abs() < 10);

    // A commitment without a due date never shows up in deadline scans
    let undated = commitments
        .create(CommitmentInput {
            commitment_type: CommitmentType::Promise,
            description: "someday".into(),
            owner_entity_id: None,
            counterparty_entity_id: None,
            due_date: None,
            source_type: None,
            source_id: None,
        })
        .unwrap();
    assert!(commitments
        .overdue(Utc::now() + Duration::days(365))
        .unwrap()
        .iter()
        .all(|c| c.id != undated.id));
    assert!(commitments
        .reminders_due(Utc::now(), 24 * 365)
        .unwrap()
        .iter()
        .all(|c| c.id != undated.id));
}

/// Every supersession chain has exactly one live tail, and it is the latest
/// by extraction time.
#[test]
fn supersession_chains_stay_linear() {
    let fixture = TestEngine::new();
    let beliefs = fixture.engine.beliefs();
    let person = fixture
        .engine
        .graph()
        .create_entity("P1", engram_core::EntityType::Person, &[])
        .unwrap();

    let (first, _) = beliefs
        .record(AssertionInput {
            subject_entity_id: Some(person.id.clone()),
            predicate: "title".into(),
            object_text: Some("engineer".into()),
            source_type: "test".into(),
            source_id: "t".into(),
            ..Default::default()
        })
        .unwrap();

    let mut current = first.id.clone();
    for title in ["senior engineer", "staff engineer", "principal engineer"] {
        let next = beliefs
            .supersede(
                &current,
                AssertionInput {
                    subject_entity_id: Some(person.id.clone()),
                    predicate: "title".into(),
                    object_text: Some(title.into()),
                    source_type: "test".into(),
                    source_id: "t".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        current = next.id;
    }

    let history = beliefs.history(&first.id).unwrap();
    assert_eq!(history.len(), 4);

    let tails: Vec<_> = history
        .iter()
        .filter(|a| a.superseded_by_id.is_none())
        .collect();
    assert_eq!(tails.len(), 1);
    assert_eq!(tails[0].id, current);
    // The tail is the newest by extraction time
    assert!(history
        .iter()
        .all(|a| a.extracted_at <= tails[0].extracted_at));

    // Timestamps are monotone along the chain
    for pair in history.windows(2) {
        assert!(pair[0].extracted_at <= pair[1].extracted_at);
    }
}
