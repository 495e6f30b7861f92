//! Staging Store (§4.4): the transactional draft/publish repository for
//! extracted entities, paired with the append-only provenance log.
//!
//! Reads and filtering happen against an in-memory hot index
//! ([`mem::MemIndex`]); when a `data_dir` is configured, every write is also
//! mirrored into a `redb`-backed [`durable::DurableStore`] so drafts and
//! sessions survive a process restart. A pure in-memory store (no
//! `data_dir`) is used for tests.

pub mod durable;
pub mod mem;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProEthicaResult, StagingError, StoreError};

/// Result alias for the low-level `redb` table operations in [`durable`].
pub type StoreResult<T> = std::result::Result<T, StoreError>;
use crate::model::{
    CaseId, ConceptType, DraftId, EntityKind, IdAllocator, MatchMethod, Pass, PairKind, RelationId,
    SectionType, SessionId, Step, now_unix, normalize_label,
};
use crate::provenance::ExtractionSessionRecord;

pub use mem::MemIndex;

/// A Step-4 unordered relation pair — principle tension or obligation
/// conflict (§4.5.4, §9). Pair identity is order-independent: `(A, B)` and
/// `(B, A)` are the same pair, so `entity_a`/`entity_b` are stored in a
/// stable sorted order rather than extraction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationPair {
    pub relation_id: RelationId,
    pub case_id: CaseId,
    pub kind: PairKind,
    pub entity_a: String,
    pub entity_b: String,
    pub rationale: String,
    pub evidence_span: String,
    pub is_published: bool,
    pub created_at: u64,
}

impl RelationPair {
    /// Construct with endpoints sorted so `(A, B)` and `(B, A)` produce an
    /// identical record, for the two symmetric pair kinds (§9 "Cyclic
    /// references"). `HasOption` keeps `entity_a`/`entity_b` in caller order
    /// (point, option) since its endpoints are not interchangeable.
    pub fn new(
        relation_id: RelationId,
        case_id: CaseId,
        kind: PairKind,
        entity_a: String,
        entity_b: String,
        rationale: String,
        evidence_span: String,
    ) -> Self {
        let (a, b) = if !kind.is_symmetric() || entity_a <= entity_b {
            (entity_a, entity_b)
        } else {
            (entity_b, entity_a)
        };
        Self {
            relation_id,
            case_id,
            kind,
            entity_a: a,
            entity_b: b,
            rationale,
            evidence_span,
            is_published: false,
            created_at: 0,
        }
    }

    fn identity_key(&self) -> (String, String) {
        (normalize_label(&self.entity_a), normalize_label(&self.entity_b))
    }
}

/// A single staged entity (§3 Draft Entity). Covers both `kind=class` and
/// `kind=individual` records for all seventeen concept types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftEntity {
    pub draft_id: DraftId,
    pub case_id: CaseId,
    pub extraction_session_id: SessionId,
    pub step: Step,
    pub pass: Pass,
    pub concept_type: ConceptType,
    pub kind: EntityKind,
    pub label: String,
    pub definition: String,
    /// `None` for step-4 synthesis entities that aren't tied to one section.
    pub source_section: Option<SectionType>,
    /// Source-text spans this draft was extracted from; extended (not
    /// replaced) when a later pass's extraction is merged in (§9 Open
    /// Question 1).
    pub source_text_spans: Vec<String>,
    pub matched_ontology_uri: Option<String>,
    pub match_confidence: Option<f32>,
    pub match_method: Option<MatchMethod>,
    /// Set only on `concept_type=DecisionOption` drafts: whether this is the
    /// option the board actually chose (§3 Decision Point / Decision Option row).
    #[serde(default)]
    pub is_board_choice: bool,
    pub is_published: bool,
    pub published_at: Option<u64>,
    pub created_at: u64,
}

impl DraftEntity {
    pub fn normalized_label(&self) -> String {
        normalize_label(&self.label)
    }
}

/// Fields `update_draft` is allowed to mutate (§4.4) — always rejected once
/// `is_published` is true.
#[derive(Debug, Clone, Default)]
pub struct DraftPatch {
    pub label: Option<String>,
    pub definition: Option<String>,
    pub matched_ontology_uri: Option<Option<String>>,
    pub match_method: Option<MatchMethod>,
    pub match_confidence: Option<Option<f32>>,
}

/// Filters supported by `get_drafts` (§4.4).
#[derive(Debug, Clone, Default)]
pub struct DraftFilter {
    pub concept_type: Option<ConceptType>,
    pub is_published: Option<bool>,
    pub pass: Option<Pass>,
    pub step: Option<Step>,
    pub section: Option<SectionType>,
}

impl DraftFilter {
    pub fn matches(&self, d: &DraftEntity) -> bool {
        self.concept_type.is_none_or(|c| c == d.concept_type)
            && self.is_published.is_none_or(|p| p == d.is_published)
            && self.pass.is_none_or(|p| p == d.pass)
            && self.step.is_none_or(|s| s == d.step)
            && self.section.is_none_or(|s| Some(s) == d.source_section)
    }
}

/// Which published drafts a `publish` call should mark; mirrors
/// `DraftFilter` but only the fields meaningful for a publish selection.
#[derive(Debug, Clone, Default)]
pub struct PublishSelector {
    pub step: Option<Step>,
    pub pass: Option<Pass>,
    pub concept_type: Option<ConceptType>,
}

impl PublishSelector {
    fn matches(&self, d: &DraftEntity) -> bool {
        self.step.is_none_or(|s| s == d.step)
            && self.pass.is_none_or(|p| p == d.pass)
            && self.concept_type.is_none_or(|c| c == d.concept_type)
    }
}

/// The Staging Store (§4.4): draft entities plus the extraction-session
/// provenance log.
pub struct StagingStore {
    ids: IdAllocator,
    mem: MemIndex,
    durable: Option<durable::DurableStore>,
}

impl StagingStore {
    pub fn memory_only() -> Self {
        Self {
            ids: IdAllocator::new(),
            mem: MemIndex::new(),
            durable: None,
        }
    }

    /// Open (or create) a durably-persisted store, replaying its contents
    /// into the in-memory hot index.
    pub fn open(data_dir: &Path) -> ProEthicaResult<Self> {
        let durable = durable::DurableStore::open(data_dir)?;
        let mem = MemIndex::new();
        let mut max_id = 0u64;

        for (_, bytes) in durable.scan_all_drafts()? {
            let draft: DraftEntity = bincode::deserialize(&bytes).map_err(|e| crate::error::StoreError::Serialization {
                message: format!("failed to decode draft: {e}"),
            })?;
            max_id = max_id.max(draft.draft_id.get()).max(draft.extraction_session_id.get());
            mem.insert_draft(draft);
        }
        for (_, bytes) in durable.scan_all_sessions()? {
            let session: ExtractionSessionRecord = bincode::deserialize(&bytes).map_err(|e| crate::error::StoreError::Serialization {
                message: format!("failed to decode session: {e}"),
            })?;
            max_id = max_id.max(session.session_id.get());
            mem.insert_session(session);
        }
        for (_, bytes) in durable.scan_all_relations()? {
            let relation: RelationPair = bincode::deserialize(&bytes).map_err(|e| crate::error::StoreError::Serialization {
                message: format!("failed to decode relation: {e}"),
            })?;
            max_id = max_id.max(relation.relation_id.get());
            mem.insert_relation(relation);
        }

        Ok(Self {
            ids: IdAllocator::starting_from(max_id + 1),
            mem,
            durable: Some(durable),
        })
    }

    pub fn next_session_id(&self) -> SessionId {
        self.ids.next_session_id()
    }

    /// Stage a new draft. `draft.draft_id` and `.created_at` are assigned by
    /// the store; the caller-provided values are ignored. Returns the same
    /// `DraftId` for a retried idempotent stage within the same session
    /// (§4.4 `stage`, testable property 1), collapsing the duplicate rather
    /// than creating a second draft.
    pub fn stage(&self, mut draft: DraftEntity) -> ProEthicaResult<DraftId> {
        let key = idempotency_key(
            &draft.case_id,
            draft.extraction_session_id,
            draft.concept_type,
            &normalize_label(&draft.label),
        );
        if let Some(existing) = self.mem.idempotency_get(&key) {
            return Ok(existing);
        }

        let id = self.ids.next_draft_id();
        draft.draft_id = id;
        draft.created_at = now_unix();
        draft.is_published = false;
        draft.published_at = None;

        self.mem.idempotency_put(key, id);
        self.mem.insert_draft(draft.clone());
        self.persist_draft(&draft)?;
        Ok(id)
    }

    pub fn get_draft(&self, draft_id: DraftId) -> Option<DraftEntity> {
        self.mem.get_draft(draft_id)
    }

    pub fn get_drafts(&self, case_id: &CaseId, filter: &DraftFilter) -> Vec<DraftEntity> {
        let mut drafts: Vec<DraftEntity> = self
            .mem
            .drafts_for_case(case_id)
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();
        drafts.sort_by_key(|d| d.draft_id);
        drafts
    }

    /// Merge a later pass's refinement into an existing draft: extend its
    /// source-text spans and, per the configured merge policy, replace the
    /// definition only if the new one is strictly longer (§9 Open Question 1).
    pub fn merge_refinement(&self, draft_id: DraftId, new_span: &str, new_definition: &str) -> ProEthicaResult<()> {
        let outcome = self.mem.with_draft_mut(draft_id, |draft| {
            if draft.is_published {
                return Err(StagingError::PublishConflict {
                    draft_id: draft_id.to_string(),
                });
            }
            if !draft.source_text_spans.iter().any(|s| s == new_span) {
                draft.source_text_spans.push(new_span.to_string());
            }
            if new_definition.len() > draft.definition.len() {
                draft.definition = new_definition.to_string();
            }
            Ok(draft.clone())
        });
        match outcome {
            Some(Ok(draft)) => self.persist_draft(&draft),
            Some(Err(e)) => Err(e.into()),
            None => Err(StagingError::DraftNotFound {
                draft_id: draft_id.to_string(),
                case_id: String::new(),
            }
            .into()),
        }
    }

    /// Apply `patch` to a draft. Atomic with respect to `publish`: if a
    /// concurrent `publish` marks the draft published before this update's
    /// shard lock is acquired, the update sees `is_published == true` and
    /// fails with `PublishConflict` rather than silently reverting the
    /// publish with a stale clone (§4.4).
    pub fn update_draft(&self, draft_id: DraftId, patch: DraftPatch) -> ProEthicaResult<()> {
        let outcome = self.mem.with_draft_mut(draft_id, |draft| {
            if draft.is_published {
                return Err(StagingError::PublishConflict {
                    draft_id: draft_id.to_string(),
                });
            }
            if let Some(label) = patch.label {
                draft.label = label;
            }
            if let Some(def) = patch.definition {
                draft.definition = def;
            }
            if let Some(uri) = patch.matched_ontology_uri {
                draft.matched_ontology_uri = uri;
            }
            if let Some(method) = patch.match_method {
                draft.match_method = Some(method);
            }
            if let Some(conf) = patch.match_confidence {
                draft.match_confidence = conf;
            }
            Ok(draft.clone())
        });
        match outcome {
            Some(Ok(draft)) => self.persist_draft(&draft),
            Some(Err(e)) => Err(e.into()),
            None => Err(StagingError::DraftNotFound {
                draft_id: draft_id.to_string(),
                case_id: String::new(),
            }
            .into()),
        }
    }

    /// Publish all unpublished drafts of `case_id` matching `selector`.
    /// Idempotent: already-published drafts are left untouched and not
    /// recounted. Each draft's publish flag flip happens under that draft's
    /// own shard lock, so it can't race a concurrent `update_draft`/
    /// `merge_refinement` on the same id (§4.4).
    pub fn publish(&self, case_id: &CaseId, selector: &PublishSelector) -> ProEthicaResult<usize> {
        let mut count = 0;
        for candidate in self.mem.drafts_for_case(case_id) {
            if candidate.is_published || !selector.matches(&candidate) {
                continue;
            }
            let published = self.mem.with_draft_mut(candidate.draft_id, |draft| {
                if draft.is_published || !selector.matches(draft) {
                    return None;
                }
                draft.is_published = true;
                draft.published_at = Some(now_unix());
                Some(draft.clone())
            });
            if let Some(Some(draft)) = published {
                self.persist_draft(&draft)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Unpublish a single draft, reverting it to draft state. Callers are
    /// responsible for invalidating any derived Case Feature Record (§4.4).
    pub fn unpublish(&self, draft_id: DraftId) -> ProEthicaResult<()> {
        let mut draft = self
            .mem
            .get_draft(draft_id)
            .ok_or_else(|| StagingError::DraftNotFound {
                draft_id: draft_id.to_string(),
                case_id: String::new(),
            })?;
        draft.is_published = false;
        draft.published_at = None;
        self.mem.insert_draft(draft.clone());
        self.persist_draft(&draft)?;
        Ok(())
    }

    /// Delete unpublished drafts of one extraction session ("re-extract this
    /// cell", §4.4).
    pub fn delete_drafts(&self, case_id: &CaseId, session_id: SessionId) -> ProEthicaResult<usize> {
        let mut count = 0;
        for draft in self.mem.drafts_for_case(case_id) {
            if draft.is_published || draft.extraction_session_id != session_id {
                continue;
            }
            self.mem.remove_draft(draft.draft_id);
            if let Some(d) = &self.durable {
                d.remove_draft(draft.draft_id.get())?;
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn log_session(&self, session: ExtractionSessionRecord) -> ProEthicaResult<()> {
        self.mem.insert_session(session.clone());
        if let Some(d) = &self.durable {
            let bytes = bincode::serialize(&session).map_err(|e| crate::error::StoreError::Serialization {
                message: format!("failed to encode session: {e}"),
            })?;
            d.put_session(session.session_id.get(), &bytes)?;
        }
        Ok(())
    }

    pub fn sessions_for_case(&self, case_id: &CaseId) -> Vec<ExtractionSessionRecord> {
        self.mem.sessions_for_case(case_id)
    }

    /// Stage a Step-4 relation pair, collapsing duplicates by (kind, sorted
    /// endpoints) within the same case rather than by session — tensions and
    /// conflicts aren't re-extracted per pass the way draft entities are.
    pub fn stage_relation(&self, mut relation: RelationPair) -> ProEthicaResult<RelationId> {
        let key = relation.identity_key();
        if let Some(existing) = self
            .mem
            .relations_for_case(&relation.case_id)
            .into_iter()
            .find(|r| r.kind == relation.kind && r.identity_key() == key)
        {
            return Ok(existing.relation_id);
        }
        let id = self.ids.next_relation_id();
        relation.relation_id = id;
        relation.created_at = now_unix();
        self.mem.insert_relation(relation.clone());
        self.persist_relation(&relation)?;
        Ok(id)
    }

    pub fn relations_for_case(&self, case_id: &CaseId, kind: Option<PairKind>) -> Vec<RelationPair> {
        self.mem
            .relations_for_case(case_id)
            .into_iter()
            .filter(|r| kind.is_none_or(|k| k == r.kind))
            .collect()
    }

    pub fn publish_relations(&self, case_id: &CaseId) -> ProEthicaResult<usize> {
        let mut count = 0;
        for mut r in self.mem.relations_for_case(case_id) {
            if r.is_published {
                continue;
            }
            r.is_published = true;
            self.mem.insert_relation(r.clone());
            self.persist_relation(&r)?;
            count += 1;
        }
        Ok(count)
    }

    fn persist_relation(&self, relation: &RelationPair) -> ProEthicaResult<()> {
        let Some(d) = &self.durable else { return Ok(()) };
        let bytes = bincode::serialize(relation).map_err(|e| crate::error::StoreError::Serialization {
            message: format!("failed to encode relation: {e}"),
        })?;
        d.put_relation(relation.relation_id.get(), &bytes)?;
        Ok(())
    }

    fn persist_draft(&self, draft: &DraftEntity) -> ProEthicaResult<()> {
        let Some(d) = &self.durable else { return Ok(()) };
        let bytes = bincode::serialize(draft).map_err(|e| crate::error::StoreError::Serialization {
            message: format!("failed to encode draft: {e}"),
        })?;
        d.put_draft(draft.draft_id.get(), &bytes)?;
        d.index_case_draft(&draft.case_id.0, draft.draft_id.get())?;
        Ok(())
    }
}

fn idempotency_key(case_id: &CaseId, session_id: SessionId, concept_type: ConceptType, normalized_label: &str) -> String {
    format!("{}\0{}\0{}\0{}", case_id.0, session_id.get(), concept_type.as_str(), normalized_label)
}
