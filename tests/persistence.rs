//! Persistence and recovery tests for the staging and feature stores.
//!
//! These verify that staged drafts, provenance sessions, published state,
//! and built feature records survive a process restart (close + reopen the
//! same `data_dir`), grounded in the same open/stage/drop/reopen/assert
//! shape used for the engine's own persistence tests.

use proethica_core::feature::{CaseFeatureRecord, ComponentEmbeddings, FeatureStore};
use proethica_core::model::{
    CaseId, ConceptType, DraftId, EntityKind, Outcome, Pass, SectionType, SessionId, SessionOutcome, Step,
};
use proethica_core::provenance::ExtractionSessionRecord;
use proethica_core::store::{DraftEntity, DraftFilter, PublishSelector, StagingStore};

fn draft(case_id: &CaseId, session_id: SessionId, label: &str) -> DraftEntity {
    DraftEntity {
        draft_id: DraftId::new(1).unwrap(),
        case_id: case_id.clone(),
        extraction_session_id: session_id,
        step: Step::Contextual,
        pass: Pass::One,
        concept_type: ConceptType::Role,
        kind: EntityKind::Individual,
        label: label.to_string(),
        definition: format!("{label} is a party to the case."),
        source_section: Some(SectionType::Facts),
        source_text_spans: vec!["the engineer signed the plans".to_string()],
        matched_ontology_uri: None,
        match_confidence: None,
        match_method: None,
        is_board_choice: false,
        is_published: false,
        published_at: None,
        created_at: 0,
    }
}

#[test]
fn staged_drafts_and_sessions_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let case_id = CaseId::from("76-4");

    let staged_id;
    {
        let store = StagingStore::open(dir.path()).unwrap();
        let session_id = store.next_session_id();
        staged_id = store.stage(draft(&case_id, session_id, "Engineer A")).unwrap();
        store
            .log_session(ExtractionSessionRecord {
                session_id,
                case_id: case_id.clone(),
                step: Step::Contextual,
                pass: Pass::One,
                section_type: Some(SectionType::Facts),
                concept_type: ConceptType::Role,
                prompt_text: "# Task\nIdentify role entities".to_string(),
                response_text: "{\"individuals\":[{\"label\":\"Engineer A\"}]}".to_string(),
                model_id: "llama3.1:70b".to_string(),
                started_at: 0,
                finished_at: 1,
                outcome: SessionOutcome::Ok,
                ontology_degraded: false,
            })
            .unwrap();
    }

    let store = StagingStore::open(dir.path()).unwrap();
    let reopened = store.get_draft(staged_id).unwrap();
    assert_eq!(reopened.label, "Engineer A");
    assert!(!reopened.is_published);

    let sessions = store.sessions_for_case(&case_id);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].outcome, SessionOutcome::Ok);
}

#[test]
fn published_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let case_id = CaseId::from("76-4");

    {
        let store = StagingStore::open(dir.path()).unwrap();
        let session_id = store.next_session_id();
        store.stage(draft(&case_id, session_id, "Engineer A")).unwrap();
        let published = store.publish(&case_id, &PublishSelector::default()).unwrap();
        assert_eq!(published, 1);
    }

    let store = StagingStore::open(dir.path()).unwrap();
    let published_drafts = store.get_drafts(
        &case_id,
        &DraftFilter {
            is_published: Some(true),
            ..Default::default()
        },
    );
    assert_eq!(published_drafts.len(), 1);
    assert_eq!(published_drafts[0].label, "Engineer A");
}

#[test]
fn allocator_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let case_id = CaseId::from("76-4");

    let first_id;
    {
        let store = StagingStore::open(dir.path()).unwrap();
        let session_id = store.next_session_id();
        first_id = store.stage(draft(&case_id, session_id, "Engineer A")).unwrap();
    }

    let store = StagingStore::open(dir.path()).unwrap();
    let session_id = store.next_session_id();
    let second_id = store.stage(draft(&case_id, session_id, "Engineer B")).unwrap();
    assert!(second_id.get() > first_id.get());
}

fn sample_feature_record(case_id: &str) -> CaseFeatureRecord {
    CaseFeatureRecord {
        case_id: CaseId::from(case_id),
        outcome: Outcome::Unethical,
        outcome_confidence: 0.8,
        outcome_rationale: "failed to disclose a conflict of interest".into(),
        provisions_cited: vec!["II.1.a".into()],
        cited_case_numbers: Vec::new(),
        subject_tags: vec!["conflict of interest".into()],
        entity_classes: Default::default(),
        principle_tensions: Vec::new(),
        obligation_conflicts: Vec::new(),
        transformation: None,
        component_embeddings: ComponentEmbeddings::default(),
        combined_embedding: Some(vec![0.4, 0.3, 0.2]),
        features_version: 1,
        built_at: 0,
    }
}

#[test]
fn feature_store_and_staging_store_recover_independently() {
    let dir = tempfile::TempDir::new().unwrap();
    let case_id = CaseId::from("76-4");

    {
        let staging = StagingStore::open(dir.path()).unwrap();
        let session_id = staging.next_session_id();
        staging.stage(draft(&case_id, session_id, "Engineer A")).unwrap();
        staging.publish(&case_id, &PublishSelector::default()).unwrap();

        let features = FeatureStore::open(dir.path()).unwrap();
        features.put(sample_feature_record("76-4")).unwrap();
    }

    let staging = StagingStore::open(dir.path()).unwrap();
    let published = staging.get_drafts(
        &case_id,
        &DraftFilter {
            is_published: Some(true),
            ..Default::default()
        },
    );
    assert_eq!(published.len(), 1);

    let features = FeatureStore::open(dir.path()).unwrap();
    let record = features.get(&case_id).unwrap();
    assert_eq!(record.outcome, Outcome::Unethical);
    assert_eq!(record.provisions_cited, vec!["II.1.a".to_string()]);
}
