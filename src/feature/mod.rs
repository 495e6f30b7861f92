//! Case Feature Builder (§4.6): derives the Case Feature Record from a
//! case's published drafts — nine per-component embeddings, a narrative
//! combined embedding, outcome classification, and the scalar/array features
//! the Precedent Engine scores against.

mod store;

pub use store::FeatureStore;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingService;
use crate::error::{FeatureError, ProEthicaResult};
use crate::llm::LlmProvider;
use crate::model::{CaseId, ConceptType, Outcome, PairKind, SectionType, TransformationType, now_unix};
use crate::parser::ParsedDocument;
use crate::store::{DraftEntity, DraftFilter, StagingStore};

/// Schema version of [`CaseFeatureRecord`]. Bumped only when the record's
/// shape changes — not on every rebuild — since a features_version bump is
/// what invalidates the similarity cache (§4.7.3, Glossary "Features Version").
pub const FEATURES_VERSION: u32 = 1;

/// Truncation budget, in characters, for the text concatenated into one
/// component embedding (§4.6 step 2 "bounded text"). A character count
/// stands in for a token count; there is no tokenizer dependency in this
/// crate's stack.
const COMPONENT_TEXT_CHAR_BUDGET: usize = 4000;

/// An unordered Step-4 relation pair, lifted into the feature record (§4.6
/// step 7). Mirrors [`crate::store::RelationPair`] minus the bookkeeping
/// fields a feature consumer doesn't need.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationSummary {
    pub entity_a: String,
    pub entity_b: String,
    pub rationale: String,
    pub evidence_span: String,
}

/// Step-4 transformation classification, lifted into the feature record
/// (§4.6 step 7, §4.5.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformationSummary {
    pub transformation_type: TransformationType,
    /// No pattern catalog exists in this spec; stands in as the closed-set
    /// value's own identifier so the field is still populated and joinable.
    pub pattern_id: String,
    pub confidence: f32,
    pub rationale: String,
    pub indicators: Vec<String>,
}

/// The nine D-tuple component embeddings (§3 Case Feature Record, §4.6 step
/// 2). Field order matches [`ConceptType::D_TUPLE`] / [`crate::config::Weights::embedding_weights`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ComponentEmbeddings {
    pub role: Option<Vec<f32>>,
    pub principle: Option<Vec<f32>>,
    pub obligation: Option<Vec<f32>>,
    pub state: Option<Vec<f32>>,
    pub resource: Option<Vec<f32>>,
    pub action: Option<Vec<f32>>,
    pub event: Option<Vec<f32>>,
    pub capability: Option<Vec<f32>>,
    pub constraint: Option<Vec<f32>>,
}

impl ComponentEmbeddings {
    /// In [`ConceptType::D_TUPLE`] order, for the precedent formula's
    /// component loop (§4.7.1).
    pub fn as_array(&self) -> [&Option<Vec<f32>>; 9] {
        [
            &self.role,
            &self.principle,
            &self.obligation,
            &self.state,
            &self.resource,
            &self.action,
            &self.event,
            &self.capability,
            &self.constraint,
        ]
    }

    fn slot_mut(&mut self, concept_type: ConceptType) -> &mut Option<Vec<f32>> {
        match concept_type {
            ConceptType::Role => &mut self.role,
            ConceptType::Principle => &mut self.principle,
            ConceptType::Obligation => &mut self.obligation,
            ConceptType::State => &mut self.state,
            ConceptType::Resource => &mut self.resource,
            ConceptType::Action => &mut self.action,
            ConceptType::Event => &mut self.event,
            ConceptType::Capability => &mut self.capability,
            ConceptType::Constraint => &mut self.constraint,
            other => panic!("{other} is not a D-tuple component"),
        }
    }
}

/// The Case Feature Record (§3): everything the Precedent Engine needs,
/// derived once from a case's published drafts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseFeatureRecord {
    pub case_id: CaseId,
    pub outcome: Outcome,
    pub outcome_confidence: f32,
    pub outcome_rationale: String,
    /// Ordered, deduplicated, canonicalized code references (§4.6 step 5).
    pub provisions_cited: Vec<String>,
    /// Ordered, deduplicated case-number strings; overlap is computed on the
    /// text identifiers themselves, not on any resolved internal case ID
    /// (§9 Open Question 3).
    pub cited_case_numbers: Vec<String>,
    pub subject_tags: Vec<String>,
    /// concept_type.as_str() -> ordered set of distinct ontology class URIs
    /// referenced by any published individual of that type (§4.6 step 6).
    pub entity_classes: BTreeMap<String, Vec<String>>,
    pub principle_tensions: Vec<RelationSummary>,
    pub obligation_conflicts: Vec<RelationSummary>,
    pub transformation: Option<TransformationSummary>,
    pub component_embeddings: ComponentEmbeddings,
    /// Mean of the facts/discussion/conclusions section embeddings, not of
    /// the component embeddings (§4.6 step 3, §9 Open Question 2).
    pub combined_embedding: Option<Vec<f32>>,
    pub features_version: u32,
    pub built_at: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct OutcomeResponse {
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TransformationRationale {
    #[serde(default)]
    rationale: String,
}

const OUTCOME_SYSTEM_PROMPT: &str = "You are classifying the ethical outcome the board reached in a \
professional-engineering case. Choose exactly one of: ethical, unethical, mixed, unclear. Respond with \
a JSON object: {\"outcome\": <one of the four values>, \"confidence\": <0.0-1.0>, \"rationale\": <short \
justification>}.";

static CASE_NUMBER_WITH_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcase\s*(?:no\.?|number)?\s*#?\s*(\d{2,4}-\d{1,3}[a-z]?)\b").unwrap());
static BARE_CASE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{2,4}-\d{1,3}[a-z]?)\b").unwrap());

/// Builds a [`CaseFeatureRecord`] from a case's published drafts (§4.6).
/// Borrows its collaborators like [`crate::pipeline::Orchestrator`] so a
/// caller can swap in mocks per test.
pub struct FeatureBuilder<'a> {
    store: &'a StagingStore,
    embeddings: &'a EmbeddingService,
    llm: &'a dyn LlmProvider,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(store: &'a StagingStore, embeddings: &'a EmbeddingService, llm: &'a dyn LlmProvider) -> Self {
        Self { store, embeddings, llm }
    }

    /// Rebuild the feature record for `case_id` (§4.6 `build`). Idempotent:
    /// running it twice with no intervening publish produces byte-identical
    /// content apart from `built_at` (§8 testable property 7).
    pub fn build(&self, case_id: &CaseId, document: &ParsedDocument) -> ProEthicaResult<CaseFeatureRecord> {
        let published = self.store.get_drafts(case_id, &DraftFilter {
            is_published: Some(true),
            ..Default::default()
        });
        let published_relations = self
            .store
            .relations_for_case(case_id, None)
            .into_iter()
            .filter(|r| r.is_published)
            .collect::<Vec<_>>();
        if published.is_empty() && published_relations.is_empty() {
            return Err(FeatureError::NoPublishedContent {
                case_id: case_id.to_string(),
            }
            .into());
        }

        let mut component_embeddings = ComponentEmbeddings::default();
        for concept_type in ConceptType::D_TUPLE {
            let individuals: Vec<&DraftEntity> = published.iter().filter(|d| d.concept_type == concept_type).collect();
            if individuals.is_empty() {
                continue;
            }
            let text = component_text(&individuals);
            match self.embeddings.embed(&text) {
                Ok(v) => *component_embeddings.slot_mut(concept_type) = Some(v.values),
                Err(e) => {
                    tracing::warn!(case_id = %case_id.0, %concept_type, error = %e, "component embedding degraded");
                }
            }
        }

        let combined_embedding = self.combined_embedding(case_id, document);

        let (outcome, outcome_confidence, outcome_rationale) = self.classify_outcome(case_id, document);

        let provisions_cited = ordered_set(
            published
                .iter()
                .filter(|d| d.concept_type == ConceptType::Provision)
                .map(|d| canonicalize_provision_code(&d.label)),
        );

        let cited_case_numbers = ordered_set(extract_case_numbers(document));

        let subject_tags = ordered_set(
            published
                .iter()
                .filter(|d| d.concept_type == ConceptType::Principle)
                .map(|d| d.normalized_label()),
        );

        let mut entity_classes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for draft in &published {
            let Some(uri) = &draft.matched_ontology_uri else { continue };
            let set = entity_classes.entry(draft.concept_type.as_str().to_string()).or_default();
            if !set.contains(uri) {
                set.push(uri.clone());
            }
        }
        for uris in entity_classes.values_mut() {
            uris.sort();
        }

        let principle_tensions = published_relations
            .iter()
            .filter(|r| r.kind == PairKind::PrincipleTension)
            .map(relation_summary)
            .collect();
        let obligation_conflicts = published_relations
            .iter()
            .filter(|r| r.kind == PairKind::ObligationConflict)
            .map(relation_summary)
            .collect();

        let transformation = published
            .iter()
            .find(|d| d.concept_type == ConceptType::Transformation)
            .and_then(|d| transformation_summary(d));

        Ok(CaseFeatureRecord {
            case_id: case_id.clone(),
            outcome,
            outcome_confidence,
            outcome_rationale,
            provisions_cited,
            cited_case_numbers,
            subject_tags,
            entity_classes,
            principle_tensions,
            obligation_conflicts,
            transformation,
            component_embeddings,
            combined_embedding,
            features_version: FEATURES_VERSION,
            built_at: now_unix(),
        })
    }

    /// Mean of the facts/discussion/conclusions section embeddings (§4.6
    /// step 3). `None` if the document has none of those three sections.
    fn combined_embedding(&self, case_id: &CaseId, document: &ParsedDocument) -> Option<Vec<f32>> {
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        for section in [SectionType::Facts, SectionType::Discussion, SectionType::Conclusions] {
            let Some(text) = document.section(section).map(|s| s.text.as_str()) else { continue };
            if text.trim().is_empty() {
                continue;
            }
            match self.embeddings.embed(text) {
                Ok(v) => vectors.push(v.values),
                Err(e) => {
                    tracing::warn!(case_id = %case_id.0, %section, error = %e, "section embedding degraded");
                }
            }
        }
        if vectors.is_empty() {
            return None;
        }
        let dim = vectors[0].len();
        let mut mean = vec![0.0f32; dim];
        for v in &vectors {
            for (m, x) in mean.iter_mut().zip(v.iter()) {
                *m += x;
            }
        }
        let n = vectors.len() as f32;
        for m in mean.iter_mut() {
            *m /= n;
        }
        Some(mean)
    }

    /// Classify the case's ethical outcome from the Conclusions section
    /// (§4.6 step 4). Degrades to `unclear`/0.0 on a missing section, an
    /// unparseable response, or a closed-set violation, rather than failing
    /// the whole build.
    fn classify_outcome(&self, case_id: &CaseId, document: &ParsedDocument) -> (Outcome, f32, String) {
        let Some(conclusions) = document.section(SectionType::Conclusions).map(|s| s.text.as_str()) else {
            return (Outcome::Unclear, 0.0, "no conclusions section present".into());
        };
        if conclusions.trim().is_empty() {
            return (Outcome::Unclear, 0.0, "conclusions section is empty".into());
        }

        let prompt = format!("# Conclusions\n{conclusions}");
        let response = match self.llm.complete(OUTCOME_SYSTEM_PROMPT, &prompt) {
            Ok(r) => r.text,
            Err(e) => {
                tracing::warn!(case_id = %case_id.0, error = %e, "outcome classification call failed");
                return (Outcome::Unclear, 0.0, "outcome classification call failed".into());
            }
        };

        let Ok(parsed) = serde_json::from_str::<OutcomeResponse>(extract_json_object(&response)) else {
            tracing::warn!(case_id = %case_id.0, "outcome classification response did not parse");
            return (Outcome::Unclear, 0.0, "outcome classification response did not parse".into());
        };
        match Outcome::parse(&parsed.outcome) {
            Ok(outcome) => (outcome, parsed.confidence.clamp(0.0, 1.0), parsed.rationale),
            Err(_) => {
                tracing::warn!(case_id = %case_id.0, value = %parsed.outcome, "outcome value outside closed set");
                (Outcome::Unclear, 0.0, format!("'{}' is outside the closed set", parsed.outcome))
            }
        }
    }
}

fn extract_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

fn relation_summary(r: &crate::store::RelationPair) -> RelationSummary {
    RelationSummary {
        entity_a: r.entity_a.clone(),
        entity_b: r.entity_b.clone(),
        rationale: r.rationale.clone(),
        evidence_span: r.evidence_span.clone(),
    }
}

fn transformation_summary(draft: &DraftEntity) -> Option<TransformationSummary> {
    let transformation_type = TransformationType::parse(&draft.label).ok()?;
    let rationale = serde_json::from_str::<TransformationRationale>(extract_json_object(&draft.definition))
        .map(|r| r.rationale)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|_| draft.definition.clone());
    Some(TransformationSummary {
        transformation_type,
        pattern_id: transformation_type.as_str().to_string(),
        confidence: 1.0,
        rationale,
        indicators: Vec::new(),
    })
}

/// Concatenate labels and definitions of one concept type's published
/// individuals, ordered by label for determinism (§4.6 step 2), truncated to
/// [`COMPONENT_TEXT_CHAR_BUDGET`] at a character boundary.
fn component_text(individuals: &[&DraftEntity]) -> String {
    let mut sorted: Vec<&&DraftEntity> = individuals.iter().collect();
    sorted.sort_by(|a, b| a.label.cmp(&b.label));
    let mut text = String::new();
    for draft in sorted {
        text.push_str(&draft.label);
        text.push_str(": ");
        text.push_str(&draft.definition);
        text.push('\n');
    }
    truncate_chars(&text, COMPONENT_TEXT_CHAR_BUDGET)
}

fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    text.chars().take(budget).collect()
}

/// Canonicalize a provision code like `ii.1.a`: the leading roman-numeral
/// segment uppercased, numeric segments unchanged, trailing letter segments
/// lowercased (§4.6 step 5) — matching `II.1.a`, the form the cited
/// provisions are quoted in throughout the board-decision text.
fn canonicalize_provision_code(raw: &str) -> String {
    let segments: Vec<&str> = raw.trim().split('.').collect();
    let last = segments.len().saturating_sub(1);
    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            if segment.chars().all(|c| c.is_ascii_digit()) {
                segment.to_string()
            } else if i == last {
                segment.to_lowercase()
            } else {
                segment.to_uppercase()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Scan the document for NSPE-style cited case numbers ("Case No. 76-4",
/// "BER Case 92-6", or a bare "76-4" in a References list). There is no
/// dedicated concept_type for case-number citations in the closed set (§3),
/// so this is a deterministic regex pass over the document rather than a
/// Step-4 entity.
fn extract_case_numbers(document: &ParsedDocument) -> Vec<String> {
    let mut found = Vec::new();
    for section in &document.sections {
        for cap in CASE_NUMBER_WITH_PREFIX.captures_iter(&section.text) {
            found.push(cap[1].to_lowercase());
        }
        if section.section_type == SectionType::References {
            for cap in BARE_CASE_NUMBER.captures_iter(&section.text) {
                found.push(cap[1].to_lowercase());
            }
        }
    }
    found
}

fn ordered_set(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut set: Vec<String> = items.filter(|s| !s.is_empty()).collect();
    set.sort();
    set.dedup();
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DeterministicProvider;
    use crate::llm::MockLlmProvider;
    use crate::model::{DraftId, EntityKind, Pass, SessionId, Step};
    use crate::parser::parse_document;
    use crate::store::PublishSelector;

    fn embeddings() -> EmbeddingService {
        EmbeddingService::new(vec![Box::new(DeterministicProvider::new("det", 8))], 8)
    }

    fn stage_published(store: &StagingStore, case_id: &CaseId, concept_type: ConceptType, label: &str, uri: Option<&str>) -> DraftId {
        let id = store
            .stage(DraftEntity {
                draft_id: DraftId::new(1).unwrap(),
                case_id: case_id.clone(),
                extraction_session_id: SessionId::new(1).unwrap(),
                step: Step::Contextual,
                pass: Pass::One,
                concept_type,
                kind: EntityKind::Individual,
                label: label.to_string(),
                definition: format!("definition of {label}"),
                source_section: Some(SectionType::Facts),
                source_text_spans: vec!["span".into()],
                matched_ontology_uri: uri.map(|u| u.to_string()),
                match_confidence: None,
                match_method: None,
                is_board_choice: false,
                is_published: false,
                published_at: None,
                created_at: 0,
            })
            .unwrap();
        store.publish(case_id, &PublishSelector::default()).unwrap();
        id
    }

    fn fixture_document() -> ParsedDocument {
        parse_document(
            "Facts\nEngineer T used AI-generated design without verification; a worker was injured.\n\n\
             Discussion\nThe board considered the engineer's duty to verify designs.\n\n\
             Conclusions\nThe engineer's conduct was not ethical.\n\n\
             References\n76-4, 77-3",
        )
    }

    #[test]
    fn no_published_content_is_an_error() {
        let store = StagingStore::memory_only();
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", "{}");
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);
        let result = builder.build(&CaseId::from("case-1"), &fixture_document());
        assert!(result.is_err());
    }

    #[test]
    fn component_embedding_present_only_for_nonempty_concept_types() {
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");
        stage_published(&store, &case_id, ConceptType::Role, "Engineer T", Some("urn:proethica:Engineer"));
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", r#"{"outcome":"unethical","confidence":0.9,"rationale":"failed to verify"}"#);
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);

        let record = builder.build(&case_id, &fixture_document()).unwrap();
        assert!(record.component_embeddings.role.is_some());
        assert!(record.component_embeddings.principle.is_none());
        assert_eq!(record.outcome, Outcome::Unethical);
        assert!((record.outcome_confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn missing_conclusions_degrades_outcome_to_unclear() {
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");
        stage_published(&store, &case_id, ConceptType::Role, "Engineer T", None);
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", "{}");
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);

        let doc = parse_document("Facts\nNo conclusion was ever reached.");
        let record = builder.build(&case_id, &doc).unwrap();
        assert_eq!(record.outcome, Outcome::Unclear);
        assert_eq!(record.outcome_confidence, 0.0);
    }

    #[test]
    fn provision_codes_are_canonicalized_and_deduped() {
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");
        stage_published(&store, &case_id, ConceptType::Provision, "ii.1.A", None);
        stage_published(&store, &case_id, ConceptType::Provision, "II.1.a", None);
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", r#"{"outcome":"unclear","confidence":0.0,"rationale":""}"#);
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);

        let record = builder.build(&case_id, &fixture_document()).unwrap();
        assert_eq!(record.provisions_cited, vec!["II.1.a".to_string()]);
    }

    #[test]
    fn cited_case_numbers_are_extracted_from_references() {
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");
        stage_published(&store, &case_id, ConceptType::Role, "Engineer T", None);
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", r#"{"outcome":"unclear","confidence":0.0,"rationale":""}"#);
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);

        let record = builder.build(&case_id, &fixture_document()).unwrap();
        assert_eq!(record.cited_case_numbers, vec!["76-4".to_string(), "77-3".to_string()]);
    }

    #[test]
    fn rebuild_with_no_intervening_writes_is_byte_identical_excluding_timestamp() {
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");
        stage_published(&store, &case_id, ConceptType::Role, "Engineer T", Some("urn:proethica:Engineer"));
        let embeddings = embeddings();
        let llm = MockLlmProvider::new("mock", r#"{"outcome":"unethical","confidence":0.9,"rationale":"r"}"#);
        let builder = FeatureBuilder::new(&store, &embeddings, &llm);

        let first = builder.build(&case_id, &fixture_document()).unwrap();
        let second = builder.build(&case_id, &fixture_document()).unwrap();
        assert_eq!(first.component_embeddings, second.component_embeddings);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.provisions_cited, second.provisions_cited);
    }

    #[test]
    fn canonicalize_provision_code_matches_spec_example() {
        assert_eq!(canonicalize_provision_code("ii.1.a"), "II.1.a");
        assert_eq!(canonicalize_provision_code(" II.1.A "), "II.1.a");
    }
}
