//! Cross-subsystem scenarios: the behaviors that only make sense with the
//! whole engine wired together.

use chrono::{Duration, Utc};
use engram_core::beliefs::contradiction::{self, AutoResolution};
use engram_core::style::cusum::CusumDetector;
use engram_core::style::{AdaptationRequest, VentSignals};
use engram_core::{
    AsOfOptions, AssertionInput, ContradictionType, IncomingContact, IncomingMessage, MatchType,
    Participant, Recipient, ResolutionContext, ResolveCandidate, SearchOptions,
};
use engram_e2e_tests::harness::TestEngine;

fn assertion(subject: &str, object: &str, confidence: f64) -> AssertionInput {
    AssertionInput {
        subject_entity_id: Some(subject.to_string()),
        predicate: "lives_in".into(),
        object_text: Some(object.to_string()),
        confidence: Some(confidence),
        source_type: "test".into(),
        source_id: "t-1".into(),
        ..Default::default()
    }
}

/// Insert an entity row with a caller-chosen id so assertions can reference
/// it directly, satisfying the `assertions.subject_entity_id` foreign key.
fn create_test_entity(fixture: &TestEngine, id: &str) {
    fixture
        .engine
        .storage()
        .with_tx(|tx| {
            tx.execute(
                "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at)
                 VALUES (?1, ?1, 'person', ?2, ?2)",
                (id, engram_core::db_now()),
            )?;
            Ok(())
        })
        .unwrap();
}

/// Scenario: a contact seeds "Jacob Miller (jake@co)"; a later mention of
/// "Jake Miller" with no email resolves to the same entity via the nickname
/// table, and an explicit duplicate merge leaves the attribute union.
#[tokio::test]
async fn resolver_merge_roundtrip() {
    let fixture = TestEngine::new();
    let engine = &fixture.engine;

    engine
        .ingestor()
        .ingest_contacts(&[IncomingContact {
            name: "Jacob Miller".into(),
            emails: vec!["jake@co.example".into()],
            ..Default::default()
        }])
        .await
        .unwrap();

    let jacob = engine
        .graph()
        .find_by_attribute("email", "jake@co.example")
        .unwrap()
        .expect("contact created Jacob");

    // Name-only mention: fuzzy + nickname carries it to the same entity
    let resolution = engine
        .resolver()
        .resolve(
            &ResolveCandidate {
                name: "Jake Miller".into(),
                ..Default::default()
            },
            &ResolutionContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolution.entity_id, jacob.id);
    assert_eq!(resolution.match_type, MatchType::Fuzzy);
    assert!(resolution.score >= 0.95);

    // An explicitly duplicated entity merges cleanly
    let duplicate = engine
        .graph()
        .create_entity(
            "J. Miller",
            engram_core::EntityType::Person,
            &[("email", "jake@co.example"), ("phone", "5550100123")],
        )
        .unwrap();
    let merged = engram_core::merge_entities(engine.graph(), &jacob.id, &duplicate.id).unwrap();

    assert!(merged.merge_history.contains(&duplicate.id));
    assert!(engine.graph().get_entity(&duplicate.id).unwrap().is_none());

    // Union of attributes: email (deduped), phone, plus the alias
    let attrs = engine.graph().attributes(&jacob.id).unwrap();
    let mut types: Vec<&str> = attrs.iter().map(|a| a.attribute_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, vec!["alias", "email", "phone"]);

    // Resolution stays idempotent after the merge
    let again = engine
        .resolver()
        .resolve(
            &ResolveCandidate {
                name: "Jake Miller".into(),
                ..Default::default()
            },
            &ResolutionContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(again.entity_id, jacob.id);
}

/// Scenario: "lives in NYC" asserted at t0, superseded by "lives in SF" at
/// t1. Time-travel returns NYC just after t0 and SF just after t1; history
/// links SF back to NYC.
#[test]
fn bitemporal_supersession() {
    let fixture = TestEngine::new();
    let beliefs = fixture.engine.beliefs();
    create_test_entity(&fixture, "person-1");

    let t0 = Utc::now();
    let mut nyc_input = assertion("person-1", "NYC", 0.8);
    nyc_input.valid_from = Some(t0);
    let (nyc, _) = beliefs.record(nyc_input).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(80));

    let t1 = Utc::now();
    let mut sf_input = assertion("person-1", "SF", 0.8);
    sf_input.valid_from = Some(t1);
    let sf = beliefs.supersede(&nyc.id, sf_input).unwrap();

    let history_options = AsOfOptions {
        include_superseded: true,
        ..Default::default()
    };

    // Just after t0 the engine knew NYC and nothing else
    let at_t0 = beliefs
        .assertions_as_of("person-1", t0 + Duration::milliseconds(30), &history_options)
        .unwrap();
    assert_eq!(at_t0.len(), 1);
    assert_eq!(at_t0[0].object_text.as_deref(), Some("NYC"));

    // Just after t1 the truth is SF
    let at_t1 = beliefs
        .assertions_as_of("person-1", t1 + Duration::milliseconds(25), &history_options)
        .unwrap();
    assert_eq!(at_t1.len(), 1);
    assert_eq!(at_t1[0].object_text.as_deref(), Some("SF"));

    // The default view is a subset of the superseded-inclusive view
    let now = Utc::now() + Duration::seconds(1);
    let current = beliefs
        .assertions_as_of("person-1", now, &AsOfOptions::default())
        .unwrap();
    let full = beliefs
        .assertions_as_of("person-1", now, &history_options)
        .unwrap();
    assert!(current.iter().all(|c| full.iter().any(|f| f.id == c.id)));

    // History carries both versions, SF pointing at NYC
    let history = beliefs.history(&nyc.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, nyc.id);
    assert_eq!(history[1].id, sf.id);
    assert_eq!(history[1].supersedes_id.as_deref(), Some(nyc.id.as_str()));
    assert_eq!(
        history
            .iter()
            .filter(|a| a.superseded_by_id.is_none())
            .count(),
        1
    );
}

/// Scenario: conflicting objects at confidence 0.9 vs 0.3 produce a
/// confidence-type contradiction at severity 0.58; auto-resolution picks the
/// strong one, drops the loser to 0.15, and logs the revision.
#[test]
fn contradiction_detection_and_auto_resolution() {
    let fixture = TestEngine::new();
    let beliefs = fixture.engine.beliefs();
    create_test_entity(&fixture, "person-1");

    let (strong, _) = beliefs.record(assertion("person-1", "NYC", 0.9)).unwrap();
    let (weak, detected) = beliefs.record(assertion("person-1", "SF", 0.3)).unwrap();

    assert_eq!(detected.len(), 1);
    let record = &detected[0];
    assert_eq!(record.contradiction_type, ContradictionType::Confidence);
    assert!((record.severity - 0.58).abs() < 1e-9);

    let outcome = contradiction::resolve_auto(beliefs, &record.id).unwrap();
    assert_eq!(
        outcome,
        AutoResolution::Resolved {
            winning_assertion_id: strong.id.clone(),
            losing_assertion_id: weak.id.clone(),
        }
    );

    // max(0.1, 0.3 * 0.5) = 0.15
    let loser = beliefs.get(&weak.id).unwrap().unwrap();
    assert!((loser.confidence - 0.15).abs() < 1e-9);

    // The revision log carries the reason
    let (reason, old_conf, new_conf): (String, f64, f64) = fixture
        .engine
        .storage()
        .with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT reason, old_confidence, new_confidence FROM belief_revision_log
                 WHERE assertion_id = ?1",
                [&weak.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?)
        })
        .unwrap();
    assert_eq!(reason, "contradiction");
    assert!((old_conf - 0.3).abs() < 1e-9);
    assert!((new_conf - 0.15).abs() < 1e-9);
}

/// Scenario: hybrid retrieval fuses keyword, entity, and graph hits and the
/// possessive walk answers "Jane's boss".
#[tokio::test]
async fn hybrid_search_end_to_end() {
    let fixture = TestEngine::new();
    let engine = &fixture.engine;

    // Two people with a reporting edge and some mail
    let jane = engine
        .graph()
        .create_entity(
            "Jane Porter",
            engram_core::EntityType::Person,
            &[("email", "jane@acme.example")],
        )
        .unwrap();
    let boss = engine
        .graph()
        .create_entity("Ada Chen", engram_core::EntityType::Person, &[])
        .unwrap();
    engine
        .graph()
        .assert_edge(&jane.id, &boss.id, "reports_to", 0.9)
        .unwrap();

    engine
        .ingestor()
        .ingest_messages(&[IncomingMessage {
            source_type: "gmail".into(),
            source_id: "g-1".into(),
            thread_id: None,
            sender: Participant {
                email: Some("jane@acme.example".into()),
                name: Some("Jane Porter".into()),
                phone: None,
            },
            recipients: vec![Recipient::default()],
            subject: Some("budget review".into()),
            body_text: "can we go over the budget tomorrow?".into(),
            body_html: None,
            timestamp: Utc::now(),
            is_from_user: None,
        }])
        .await
        .unwrap();

    // Keyword search finds the message and the entity search finds Jane
    let hits = engine
        .retrieval()
        .search("budget", &SearchOptions::default())
        .await
        .unwrap();
    assert!(hits
        .iter()
        .any(|h| h.kind == engram_core::ResultKind::Message));

    // The possessive graph walk answers with Ada
    let hits = engine
        .retrieval()
        .search("Jane's boss", &SearchOptions::default())
        .await
        .unwrap();
    assert!(
        hits.iter()
            .any(|h| h.kind == engram_core::ResultKind::Entity && h.id == boss.id),
        "expected Ada in {hits:?}"
    );
}

/// Scenario: an emotionally charged session freezes adaptation entirely and
/// records the freeze in the engagement log.
#[test]
fn vent_mode_freezes_adaptation() {
    let fixture = TestEngine::new();
    let style = fixture.engine.style();

    let before = style.user_profile().unwrap();
    let outcome = style
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

    let after = style.user_profile().unwrap();
    assert_eq!(before.formality, after.formality);
    assert_eq!(before.interaction_count, after.interaction_count);

    let vent_events: i64 = fixture
        .engine
        .storage()
        .with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM engagement_events
                 WHERE interaction_type = 'vent_mode_detected'",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(vent_events, 1);
}

/// Scenario: a stable style stream followed by a sustained shift trips the
/// CUSUM detector; the reset state stays quiet on the next update.
#[test]
fn cusum_change_point_detects_and_resets() {
    let mut detector = CusumDetector::default();

    for _ in 0..20 {
        detector.update([0.5; 5]);
    }

    let mut change = None;
    for _ in 0..12 {
        let update = detector.update([1.0; 5]);
        if update.change_detected {
            change = Some(update);
            break;
        }
    }
    let change = change.expect("sustained shift must trip the detector");
    assert!(change.dimension_deltas.iter().all(|d| d.abs() > 0.1));

    // State was reset: the very next update is quiet
    let next = detector.update([1.0; 5]);
    assert!(!next.change_detected);
    assert_eq!(detector.cusum_pos().min(detector.cusum_neg()), 0.0);
}
