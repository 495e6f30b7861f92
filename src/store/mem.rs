//! In-memory hot index for the Staging Store: concurrent maps of drafts,
//! sessions, and the idempotency/case-draft indexes, backed by `DashMap` so
//! reads never block a concurrent stage/publish (§5).

use dashmap::{DashMap, DashSet};

use crate::model::{CaseId, DraftId, RelationId, SessionId};
use crate::provenance::ExtractionSessionRecord;

use super::{DraftEntity, RelationPair};

/// Hot in-memory index. A [`super::StagingStore`] always has one of these;
/// it additionally mirrors writes to a [`super::durable::DurableStore`] when
/// persistence is configured.
#[derive(Debug, Default)]
pub struct MemIndex {
    drafts: DashMap<DraftId, DraftEntity>,
    sessions: DashMap<SessionId, ExtractionSessionRecord>,
    /// idempotency key -> draft_id (§4.4 `stage` operation).
    idempotency: DashMap<String, DraftId>,
    case_drafts: DashMap<CaseId, DashSet<DraftId>>,
    relations: DashMap<RelationId, RelationPair>,
    case_relations: DashMap<CaseId, DashSet<RelationId>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_draft(&self, draft: DraftEntity) {
        self.case_drafts
            .entry(draft.case_id.clone())
            .or_default()
            .insert(draft.draft_id);
        self.drafts.insert(draft.draft_id, draft);
    }

    pub fn get_draft(&self, id: DraftId) -> Option<DraftEntity> {
        self.drafts.get(&id).map(|d| d.value().clone())
    }

    /// Apply `f` to the draft for `id` while holding that draft's `DashMap`
    /// shard lock, so a concurrent `publish`/`update_draft`/`merge_refinement`
    /// on the same id can't interleave its own read and write inside this
    /// one's — the loser sees the winner's already-applied state in `f`
    /// rather than a stale clone it would otherwise overwrite. Returns `None`
    /// if no such draft exists.
    pub fn with_draft_mut<T>(&self, id: DraftId, f: impl FnOnce(&mut DraftEntity) -> T) -> Option<T> {
        match self.drafts.entry(id) {
            dashmap::Entry::Occupied(mut e) => Some(f(e.get_mut())),
            dashmap::Entry::Vacant(_) => None,
        }
    }

    pub fn remove_draft(&self, id: DraftId) -> Option<DraftEntity> {
        let removed = self.drafts.remove(&id).map(|(_, v)| v);
        if let Some(d) = &removed {
            if let Some(set) = self.case_drafts.get(&d.case_id) {
                set.remove(&id);
            }
        }
        removed
    }

    pub fn drafts_for_case(&self, case_id: &CaseId) -> Vec<DraftEntity> {
        self.case_drafts
            .get(case_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.drafts.get(&id).map(|d| d.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn idempotency_get(&self, key: &str) -> Option<DraftId> {
        self.idempotency.get(key).map(|v| *v)
    }

    pub fn idempotency_put(&self, key: String, draft_id: DraftId) {
        self.idempotency.insert(key, draft_id);
    }

    pub fn insert_session(&self, session: ExtractionSessionRecord) {
        self.sessions.insert(session.session_id, session);
    }

    pub fn sessions_for_case(&self, case_id: &CaseId) -> Vec<ExtractionSessionRecord> {
        self.sessions
            .iter()
            .filter(|s| &s.case_id == case_id)
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<ExtractionSessionRecord> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn insert_relation(&self, relation: RelationPair) {
        self.case_relations
            .entry(relation.case_id.clone())
            .or_default()
            .insert(relation.relation_id);
        self.relations.insert(relation.relation_id, relation);
    }

    pub fn get_relation(&self, id: RelationId) -> Option<RelationPair> {
        self.relations.get(&id).map(|r| r.value().clone())
    }

    pub fn relations_for_case(&self, case_id: &CaseId) -> Vec<RelationPair> {
        self.case_relations
            .get(case_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.relations.get(&id).map(|r| r.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConceptType, EntityKind, Pass, SectionType, Step};

    fn draft(id: u64, case: &str) -> DraftEntity {
        DraftEntity {
            draft_id: DraftId::new(id).unwrap(),
            case_id: CaseId::from(case),
            extraction_session_id: SessionId::new(1).unwrap(),
            step: Step::Contextual,
            pass: Pass::One,
            concept_type: ConceptType::Role,
            kind: EntityKind::Individual,
            label: "Engineer T".into(),
            definition: "the respondent engineer".into(),
            source_section: Some(SectionType::Facts),
            source_text_spans: vec!["Engineer T designed the bridge".into()],
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
    fn drafts_for_case_only_returns_own_case() {
        let idx = MemIndex::new();
        idx.insert_draft(draft(1, "case-a"));
        idx.insert_draft(draft(2, "case-b"));
        assert_eq!(idx.drafts_for_case(&CaseId::from("case-a")).len(), 1);
    }

    #[test]
    fn remove_draft_cleans_case_index() {
        let idx = MemIndex::new();
        idx.insert_draft(draft(1, "case-a"));
        idx.remove_draft(DraftId::new(1).unwrap());
        assert!(idx.drafts_for_case(&CaseId::from("case-a")).is_empty());
    }
}
