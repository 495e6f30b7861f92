//! Extraction Orchestrator (§4.5): drives the Step x Pass x concept-type
//! state machine described in the state-machine table, turning one parsed
//! case document into staged draft entities plus an append-only provenance
//! log. Step 4's relation pairs and transformation classification are driven
//! by [`Orchestrator::extract_relations`] and
//! [`Orchestrator::classify_transformation`] rather than `run_cell`, since
//! neither produces an ordinary concept-typed draft entity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{OrchestratorError, ProEthicaResult};
use crate::llm::LlmProvider;
use crate::model::{
    normalize_label, now_unix, CaseId, ConceptType, DraftId, EntityKind, MatchMethod, PairKind,
    Pass, RelationId, SectionType, SessionId, SessionOutcome, Step, TransformationType,
};
use crate::ontology::{OntologyClass, OntologyGateway};
use crate::parser::ParsedDocument;
use crate::provenance::ExtractionSessionRecord;
use crate::store::{DraftEntity, DraftFilter, DraftPatch, RelationPair, StagingStore};

/// One new ontology-class candidate proposed by the LLM alongside the
/// individuals that reference it (§4.5.2 step 3).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NewClassCandidate {
    pub label: String,
    pub definition: String,
    #[serde(default)]
    pub rationale: String,
}

/// One extracted individual (§4.5.2 step 3). `class_ref` is either an
/// existing ontology URI or the label of one of the response's `new_classes`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IndividualCandidate {
    pub label: String,
    #[serde(default)]
    pub class_ref: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub source_span: String,
    #[serde(default)]
    pub relationships: Vec<String>,
}

/// Required LLM response shape for an ordinary extraction cell (§4.5.2 step 3).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub new_classes: Vec<NewClassCandidate>,
    #[serde(default)]
    pub individuals: Vec<IndividualCandidate>,
}

/// Outcome of running one extraction cell.
#[derive(Debug, Clone)]
pub struct CellReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub staged: Vec<DraftId>,
    pub ontology_degraded: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RelationCandidate {
    #[serde(default)]
    entity_a: String,
    #[serde(default)]
    entity_b: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    evidence_span: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RelationResponse {
    #[serde(default)]
    pairs: Vec<RelationCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransformationCandidate {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    rationale: String,
}

const TRANSFORMATION_SYSTEM_PROMPT: &str = "You are classifying how the ethical tension in a \
professional-engineering case resolves. Choose exactly one of the four closed-set values below, \
using their definitions verbatim:\n\
- transfer: the case resolves by shifting obligation or responsibility to another party; a clear \
A->B transition.\n\
- stalemate: obligations remain in tension without resolution; parties cannot exit the rule set.\n\
- oscillation: obligations alternate between parties over time.\n\
- phase_lag: delayed recognition or action on an obligation; consequences emerge out-of-phase with \
the triggering condition.\n\
Respond with a JSON object: {\"type\": <one of the four values>, \"rationale\": <short justification>}.";

/// The Extraction Orchestrator. Borrows its collaborators rather than owning
/// them so a caller can swap in mocks per test or share one embedding/LLM
/// pool across cases.
pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    llm: &'a dyn LlmProvider,
    ontology: &'a dyn OntologyGateway,
    embeddings: &'a EmbeddingService,
    store: &'a StagingStore,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        llm: &'a dyn LlmProvider,
        ontology: &'a dyn OntologyGateway,
        embeddings: &'a EmbeddingService,
        store: &'a StagingStore,
    ) -> Self {
        Self {
            config,
            llm,
            ontology,
            embeddings,
            store,
        }
    }

    /// Run one (step, pass, concept_type) cell against `document` (§4.5.2).
    pub fn run_cell(
        &self,
        case_id: &CaseId,
        document: &ParsedDocument,
        step: Step,
        pass: Pass,
        concept_type: ConceptType,
    ) -> ProEthicaResult<CellReport> {
        let started_at = now_unix();
        let session_id = self.store.next_session_id();
        let section = step.emphasis_section(pass);
        let section_text = section_text_for(document, section);

        let (classes, ontology_degraded) = self.fetch_ontology_context(concept_type);
        let prior_drafts = self.build_context(case_id, step, pass, concept_type);

        let prompt = build_prompt(concept_type, &section_text, &classes, &prior_drafts);
        let system_prompt = system_prompt_for(concept_type);

        let mut response_text = match self.llm.complete(&system_prompt, &prompt) {
            Ok(resp) => resp.text,
            Err(e) => {
                self.record_session(
                    case_id, session_id, step, pass, section, concept_type, &prompt, "",
                    started_at, SessionOutcome::LlmError, ontology_degraded,
                )?;
                return Err(e);
            }
        };

        let mut parsed_result = parse_extraction_response(&response_text);
        let mut retries_left = self.config.parse_repair_retries;
        while let Err(parse_err) = &parsed_result {
            if retries_left == 0 {
                break;
            }
            retries_left -= 1;
            tracing::warn!(case_id = %case_id.0, ?step, ?pass, ?concept_type, error = %parse_err, "repairing malformed extraction response");
            let repair_prompt = format!(
                "{prompt}\n\nYour previous response could not be parsed: {parse_err}. Respond again with ONLY a JSON object matching the required shape."
            );
            response_text = match self.llm.complete(&system_prompt, &repair_prompt) {
                Ok(resp) => resp.text,
                Err(e) => {
                    self.record_session(
                        case_id, session_id, step, pass, section, concept_type, &repair_prompt, "",
                        started_at, SessionOutcome::LlmError, ontology_degraded,
                    )?;
                    return Err(e);
                }
            };
            parsed_result = parse_extraction_response(&response_text);
        }

        let parsed = match parsed_result {
            Ok(p) => p,
            Err(_) => {
                self.record_session(
                    case_id, session_id, step, pass, section, concept_type, &prompt, &response_text,
                    started_at, SessionOutcome::ParseError, ontology_degraded,
                )?;
                return Ok(CellReport {
                    session_id,
                    outcome: SessionOutcome::ParseError,
                    staged: Vec::new(),
                    ontology_degraded,
                });
            }
        };

        if parsed.individuals.is_empty() && parsed.new_classes.is_empty() {
            self.record_session(
                case_id, session_id, step, pass, section, concept_type, &prompt, &response_text,
                started_at, SessionOutcome::Empty, ontology_degraded,
            )?;
            return Ok(CellReport {
                session_id,
                outcome: SessionOutcome::Empty,
                staged: Vec::new(),
                ontology_degraded,
            });
        }

        let mut known = self.store.get_drafts(case_id, &DraftFilter {
            concept_type: Some(concept_type),
            ..Default::default()
        });
        let mut staged = Vec::new();

        for class_candidate in &parsed.new_classes {
            let normalized = normalize_label(&class_candidate.label);
            if known
                .iter()
                .any(|d| d.kind == EntityKind::Class && d.normalized_label() == normalized)
            {
                continue;
            }
            let id = self.store.stage(DraftEntity {
                draft_id: DraftId::new(1).unwrap(),
                case_id: case_id.clone(),
                extraction_session_id: session_id,
                step,
                pass,
                concept_type,
                kind: EntityKind::Class,
                label: class_candidate.label.clone(),
                definition: class_candidate.definition.clone(),
                source_section: section,
                source_text_spans: vec![class_candidate.rationale.clone()],
                matched_ontology_uri: None,
                match_confidence: None,
                match_method: None,
                is_board_choice: false,
                is_published: false,
                published_at: None,
                created_at: 0,
            })?;
            staged.push(id);
            if let Some(d) = self.store.get_draft(id) {
                known.push(d);
            }
        }

        for individual in &parsed.individuals {
            let normalized = normalize_label(&individual.label);
            if let Some(existing) = known
                .iter()
                .find(|d| d.kind == EntityKind::Individual && d.normalized_label() == normalized)
            {
                self.store.merge_refinement(existing.draft_id, &individual.source_span, &individual.definition)?;
                staged.push(existing.draft_id);
                continue;
            }

            let (matched_uri, confidence, method) = if concept_type.ontology_category().is_some() {
                let (uri, conf, method) =
                    self.assign_class(concept_type, individual, &classes, &parsed.new_classes, ontology_degraded)?;
                (Some(uri), Some(conf), Some(method))
            } else {
                (None, None, None)
            };

            let id = self.store.stage(DraftEntity {
                draft_id: DraftId::new(1).unwrap(),
                case_id: case_id.clone(),
                extraction_session_id: session_id,
                step,
                pass,
                concept_type,
                kind: EntityKind::Individual,
                label: individual.label.clone(),
                definition: individual.definition.clone(),
                source_section: section,
                source_text_spans: vec![individual.source_span.clone()],
                matched_ontology_uri: matched_uri,
                match_confidence: confidence,
                match_method: method,
                is_board_choice: false,
                is_published: false,
                published_at: None,
                created_at: 0,
            })?;
            staged.push(id);
            if let Some(d) = self.store.get_draft(id) {
                known.push(d);
            }

            if concept_type == ConceptType::DecisionPoint {
                staged.extend(self.stage_decision_options(
                    case_id,
                    session_id,
                    step,
                    pass,
                    section,
                    &individual.label,
                    &individual.relationships,
                )?);
            }
        }

        self.record_session(
            case_id, session_id, step, pass, section, concept_type, &prompt, &response_text,
            started_at, SessionOutcome::Ok, ontology_degraded,
        )?;

        Ok(CellReport {
            session_id,
            outcome: SessionOutcome::Ok,
            staged,
            ontology_degraded,
        })
    }

    /// Run every concept type this (step, pass) produces concurrently
    /// (§4.5.1: "concept-types within the same pass may execute in any
    /// order or concurrently"). One result per concept type, in
    /// `concept_types_for_pass` order regardless of completion order.
    pub fn run_pass(&self, case_id: &CaseId, document: &ParsedDocument, step: Step, pass: Pass) -> Vec<ProEthicaResult<CellReport>> {
        use rayon::prelude::*;

        step.concept_types_for_pass(pass)
            .par_iter()
            .map(|&concept_type| self.run_cell(case_id, document, step, pass, concept_type))
            .collect()
    }

    /// Step-4 principle-tension / obligation-conflict extraction (§4.5.4).
    /// Reads published Principle or Obligation drafts (depending on `kind`)
    /// and asks the LLM for unordered pairs among them.
    pub fn extract_relations(&self, case_id: &CaseId, kind: PairKind) -> ProEthicaResult<Vec<RelationId>> {
        let concept_type = relation_concept_type(kind);
        let candidates = self.store.get_drafts(case_id, &DraftFilter {
            concept_type: Some(concept_type),
            is_published: Some(true),
            ..Default::default()
        });
        if candidates.len() < 2 {
            return Ok(Vec::new());
        }

        let started_at = now_unix();
        let session_id = self.store.next_session_id();
        let prompt = build_relation_prompt(kind, &candidates);
        let system_prompt = relation_system_prompt(kind);

        let response = match self.llm.complete(&system_prompt, &prompt) {
            Ok(resp) => resp,
            Err(e) => {
                self.record_session(
                    case_id, session_id, Step::Synthesis, Pass::One, None, concept_type,
                    &prompt, "", started_at, SessionOutcome::LlmError, false,
                )?;
                return Err(e);
            }
        };

        let parsed = match parse_relation_candidates(&response.text) {
            Ok(p) => p,
            Err(message) => {
                self.record_session(
                    case_id, session_id, Step::Synthesis, Pass::One, None, concept_type,
                    &prompt, &response.text, started_at, SessionOutcome::ParseError, false,
                )?;
                return Err(OrchestratorError::ParseError { message }.into());
            }
        };

        let mut ids = Vec::new();
        for candidate in parsed {
            if candidate.entity_a.trim().is_empty()
                || candidate.entity_b.trim().is_empty()
                || normalize_label(&candidate.entity_a) == normalize_label(&candidate.entity_b)
            {
                continue;
            }
            let relation = RelationPair::new(
                RelationId::new(1).unwrap(),
                case_id.clone(),
                kind,
                candidate.entity_a,
                candidate.entity_b,
                candidate.rationale,
                candidate.evidence_span,
            );
            ids.push(self.store.stage_relation(relation)?);
        }

        self.record_session(
            case_id, session_id, Step::Synthesis, Pass::One, None, concept_type,
            &prompt, &response.text, started_at, SessionOutcome::Ok, false,
        )?;
        Ok(ids)
    }

    /// Step-4 transformation classification (§4.5.4): exactly one record,
    /// rejecting any value outside the closed set and retrying once before
    /// logging `parse_error`. The classification is staged as an ordinary
    /// `concept_type=Transformation` draft so it flows through publish and
    /// feature-building like every other synthesis-step entity.
    pub fn classify_transformation(&self, case_id: &CaseId, document: &ParsedDocument) -> ProEthicaResult<DraftId> {
        let started_at = now_unix();
        let session_id = self.store.next_session_id();
        let prompt = format!("# Case text\n{}", section_text_for(document, None));

        let first = match self.llm.complete(TRANSFORMATION_SYSTEM_PROMPT, &prompt) {
            Ok(resp) => resp,
            Err(e) => {
                self.record_session(
                    case_id, session_id, Step::Synthesis, Pass::One, None, ConceptType::Transformation,
                    &prompt, "", started_at, SessionOutcome::LlmError, false,
                )?;
                return Err(e);
            }
        };
        let mut result = parse_transformation(&first.text);
        let mut response_text = first.text;
        if result.is_err() && self.config.parse_repair_retries > 0 {
            let repair_prompt = format!(
                "{prompt}\n\nYour previous answer was not one of transfer, stalemate, oscillation, phase_lag. Answer again with exactly one of those four values."
            );
            let second = match self.llm.complete(TRANSFORMATION_SYSTEM_PROMPT, &repair_prompt) {
                Ok(resp) => resp,
                Err(e) => {
                    self.record_session(
                        case_id, session_id, Step::Synthesis, Pass::One, None, ConceptType::Transformation,
                        &repair_prompt, "", started_at, SessionOutcome::LlmError, false,
                    )?;
                    return Err(e);
                }
            };
            result = parse_transformation(&second.text);
            response_text = second.text;
        }

        let transformation = match result {
            Ok(t) => t,
            Err(_) => {
                self.record_session(
                    case_id, session_id, Step::Synthesis, Pass::One, None, ConceptType::Transformation,
                    &prompt, &response_text, started_at, SessionOutcome::ParseError, false,
                )?;
                return Err(OrchestratorError::ParseError {
                    message: "transformation classification did not converge to a closed-set value".into(),
                }
                .into());
            }
        };

        self.record_session(
            case_id, session_id, Step::Synthesis, Pass::One, None, ConceptType::Transformation,
            &prompt, &response_text, started_at, SessionOutcome::Ok, false,
        )?;

        self.store.stage(DraftEntity {
            draft_id: DraftId::new(1).unwrap(),
            case_id: case_id.clone(),
            extraction_session_id: session_id,
            step: Step::Synthesis,
            pass: Pass::One,
            concept_type: ConceptType::Transformation,
            kind: EntityKind::Individual,
            label: transformation.as_str().to_string(),
            definition: response_text,
            source_section: None,
            source_text_spans: Vec::new(),
            matched_ontology_uri: None,
            match_confidence: None,
            match_method: None,
            is_board_choice: false,
            is_published: false,
            published_at: None,
            created_at: 0,
        })
    }

    /// Re-link `new_candidate` match URIs to canonical ontology classes by
    /// exact label match once the ontology service recovers (§11 supplement
    /// 1, Scenario E). Published drafts are immutable and skipped; only
    /// unpublished drafts can still be corrected via `update_draft`.
    pub fn reconcile_candidates(&self, case_id: &CaseId) -> ProEthicaResult<usize> {
        let mut reconciled = 0;
        for draft in self.store.get_drafts(case_id, &DraftFilter {
            is_published: Some(false),
            ..Default::default()
        }) {
            if draft.match_method != Some(MatchMethod::NewCandidate) {
                continue;
            }
            let Some(category) = draft.concept_type.ontology_category() else {
                continue;
            };
            let classes = match self.ontology.get_classes(category) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let normalized = draft.normalized_label();
            if let Some(class) = classes.iter().find(|c| normalize_label(&c.label) == normalized) {
                self.store.update_draft(draft.draft_id, DraftPatch {
                    matched_ontology_uri: Some(Some(class.uri.clone())),
                    match_method: Some(MatchMethod::ExactLabel),
                    match_confidence: Some(Some(1.0)),
                    ..Default::default()
                })?;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    fn fetch_ontology_context(&self, concept_type: ConceptType) -> (Vec<OntologyClass>, bool) {
        let Some(category) = concept_type.ontology_category() else {
            return (Vec::new(), false);
        };
        match self.ontology.get_classes(category) {
            Ok(classes) => (classes, false),
            Err(e) => {
                tracing::warn!(category, error = %e, "ontology context degraded for this cell");
                (Vec::new(), true)
            }
        }
    }

    /// Pass-2 cells see their own pass-1 drafts; step-4 cells see every
    /// published draft of steps 1-3 (§4.5.2 step 1).
    fn build_context(&self, case_id: &CaseId, step: Step, pass: Pass, concept_type: ConceptType) -> Vec<DraftEntity> {
        if step == Step::Synthesis {
            self.store.get_drafts(case_id, &DraftFilter { is_published: Some(true), ..Default::default() })
        } else if pass == Pass::Two {
            self.store.get_drafts(case_id, &DraftFilter { concept_type: Some(concept_type), ..Default::default() })
        } else {
            Vec::new()
        }
    }

    /// Stage each of a decision point's options as a `DecisionOption` draft
    /// linked back to the point by a `HasOption` relation pair (§3 Decision
    /// Point / Decision Option row). `relationships` entries name one option
    /// each; an entry prefixed `BOARD_CHOICE:` (case-insensitive) marks the
    /// option the board actually selected. Warns, but does not fail the
    /// cell, when fewer than two options are named (§3 invariant "each point
    /// has >= 2 options" is advisory here since it depends on what the LLM
    /// actually returned).
    fn stage_decision_options(
        &self,
        case_id: &CaseId,
        session_id: SessionId,
        step: Step,
        pass: Pass,
        section: Option<SectionType>,
        point_label: &str,
        relationships: &[String],
    ) -> ProEthicaResult<Vec<DraftId>> {
        if relationships.len() < 2 {
            tracing::warn!(
                case_id = %case_id.0,
                point = %point_label,
                option_count = relationships.len(),
                "decision point has fewer than two options"
            );
        }

        let mut staged = Vec::new();
        for raw_option in relationships {
            let (is_board_choice, option_label) = match raw_option
                .strip_prefix("BOARD_CHOICE:")
                .or_else(|| raw_option.strip_prefix("board_choice:"))
            {
                Some(rest) => (true, rest.trim().to_string()),
                None => (false, raw_option.trim().to_string()),
            };
            if option_label.is_empty() {
                continue;
            }

            let option_id = self.store.stage(DraftEntity {
                draft_id: DraftId::new(1).unwrap(),
                case_id: case_id.clone(),
                extraction_session_id: session_id,
                step,
                pass,
                concept_type: ConceptType::DecisionOption,
                kind: EntityKind::Individual,
                label: option_label.clone(),
                definition: format!("option under decision point \"{point_label}\""),
                source_section: section,
                source_text_spans: Vec::new(),
                matched_ontology_uri: None,
                match_confidence: None,
                match_method: None,
                is_board_choice,
                is_published: false,
                published_at: None,
                created_at: 0,
            })?;
            staged.push(option_id);

            self.store.stage_relation(RelationPair::new(
                RelationId::new(1).unwrap(),
                case_id.clone(),
                PairKind::HasOption,
                point_label.to_string(),
                option_label,
                String::new(),
                String::new(),
            ))?;
        }
        Ok(staged)
    }

    /// Ordered class-assignment strategy (§4.5.2 step 5): exact label match,
    /// then embedding similarity above the configured threshold, then a
    /// proposed class via the Ontology Gateway (or a provisional URI when
    /// the gateway is degraded or rejects the candidate).
    fn assign_class(
        &self,
        concept_type: ConceptType,
        individual: &IndividualCandidate,
        classes: &[OntologyClass],
        new_classes: &[NewClassCandidate],
        ontology_degraded: bool,
    ) -> ProEthicaResult<(String, f32, MatchMethod)> {
        if !ontology_degraded {
            if let Some(class) = classes
                .iter()
                .find(|c| normalize_label(&c.label) == normalize_label(&individual.class_ref))
            {
                return Ok((class.uri.clone(), 1.0, MatchMethod::ExactLabel));
            }
            if let Some((uri, score)) = self.best_embedding_match(&individual.class_ref, classes)? {
                if score >= self.config.class_match_threshold {
                    return Ok((uri, score, MatchMethod::Embedding));
                }
            }
        }

        let category = concept_type.ontology_category().unwrap_or("synthesis");
        let (label, definition) = new_classes
            .iter()
            .find(|c| normalize_label(&c.label) == normalize_label(&individual.class_ref))
            .map(|c| (c.label.clone(), c.definition.clone()))
            .unwrap_or_else(|| (individual.class_ref.clone(), individual.definition.clone()));

        if ontology_degraded {
            return Ok((provisional_uri(category, &label), 0.0, MatchMethod::NewCandidate));
        }

        match self.ontology.propose_class(category, &label, &definition) {
            Ok(class) => Ok((class.uri, 0.5, MatchMethod::NewCandidate)),
            Err(_) => Ok((provisional_uri(category, &label), 0.0, MatchMethod::NewCandidate)),
        }
    }

    fn best_embedding_match(&self, query_text: &str, classes: &[OntologyClass]) -> ProEthicaResult<Option<(String, f32)>> {
        if classes.is_empty() {
            return Ok(None);
        }
        let query = self.embeddings.embed(query_text)?;
        let mut best: Option<(String, f32)> = None;
        for class in classes {
            let text = format!("{} {}", class.label, class.definition);
            let vec = self.embeddings.embed(&text)?;
            let score = cosine_similarity(&query.values, &vec.values);
            if best.as_ref().is_none_or(|(_, b)| score > *b) {
                best = Some((class.uri.clone(), score));
            }
        }
        Ok(best)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_session(
        &self,
        case_id: &CaseId,
        session_id: SessionId,
        step: Step,
        pass: Pass,
        section: Option<SectionType>,
        concept_type: ConceptType,
        prompt_text: &str,
        response_text: &str,
        started_at: u64,
        outcome: SessionOutcome,
        ontology_degraded: bool,
    ) -> ProEthicaResult<()> {
        self.store.log_session(ExtractionSessionRecord {
            session_id,
            case_id: case_id.clone(),
            step,
            pass,
            section_type: section,
            concept_type,
            prompt_text: prompt_text.to_string(),
            response_text: response_text.to_string(),
            model_id: self.llm.model_id().to_string(),
            started_at,
            finished_at: now_unix(),
            outcome,
            ontology_degraded,
        })
    }
}

fn provisional_uri(category: &str, label: &str) -> String {
    format!("urn:proethica:pending:{category}:{}", normalize_label(label).replace(' ', "_"))
}

fn relation_concept_type(kind: PairKind) -> ConceptType {
    match kind {
        PairKind::PrincipleTension => ConceptType::Principle,
        PairKind::ObligationConflict => ConceptType::Obligation,
        PairKind::HasOption => unreachable!("HasOption pairs are staged inline by stage_decision_options, never via extract_relations"),
    }
}

fn relation_system_prompt(kind: PairKind) -> String {
    let noun = match kind {
        PairKind::PrincipleTension => "principle tensions",
        PairKind::ObligationConflict => "obligation conflicts",
        PairKind::HasOption => unreachable!("HasOption pairs are staged inline by stage_decision_options, never via extract_relations"),
    };
    format!(
        "Identify unordered pairs of {noun} among the entities below, each with a rationale and \
         an evidence span grounded in the case text. (A, B) and (B, A) are the same pair; report \
         each pair once. Respond with a JSON object: {{\"pairs\": [{{\"entity_a\":, \"entity_b\":, \
         \"rationale\":, \"evidence_span\":}}]}}."
    )
}

fn build_relation_prompt(kind: PairKind, candidates: &[DraftEntity]) -> String {
    let mut prompt = format!("# Candidates for {}\n", relation_kind_label(kind));
    for c in candidates {
        prompt.push_str(&format!("- {} :: {}\n", c.label, c.definition));
    }
    prompt
}

fn relation_kind_label(kind: PairKind) -> &'static str {
    match kind {
        PairKind::PrincipleTension => "principle tension pairs",
        PairKind::ObligationConflict => "obligation conflict pairs",
        PairKind::HasOption => unreachable!("HasOption pairs are staged inline by stage_decision_options, never via extract_relations"),
    }
}

fn section_text_for(document: &ParsedDocument, section: Option<SectionType>) -> String {
    match section {
        Some(s) => document.section(s).map(|sec| sec.text.clone()).unwrap_or_default(),
        None => document
            .sections
            .iter()
            .map(|s| format!("[{}]\n{}", s.section_type, s.text))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn system_prompt_for(concept_type: ConceptType) -> String {
    let base = format!(
        "You are an expert in professional engineering ethics. Extract {} entities from the \
         supplied case text. Respond with a single JSON object containing two arrays: \
         \"new_classes\" (label, definition, rationale) and \"individuals\" (label, class_ref, \
         definition, source_span, relationships). Reuse an existing class label in class_ref \
         whenever one fits; otherwise reference a label from new_classes. An empty response (both \
         arrays empty) is valid when the text names nothing of this type.",
        concept_type.as_str()
    );
    if concept_type == ConceptType::DecisionPoint {
        format!(
            "{base} For each decision point, list every option the board weighed as a separate \
             string in its \"relationships\" array, naming at least two. Prefix the option the \
             board actually chose with \"BOARD_CHOICE:\" (the other options carry no prefix)."
        )
    } else {
        base
    }
}

fn build_prompt(
    concept_type: ConceptType,
    section_text: &str,
    classes: &[OntologyClass],
    prior_drafts: &[DraftEntity],
) -> String {
    let mut prompt = format!("# Task\nIdentify {} entities in the text below.\n\n", concept_type.as_str());

    prompt.push_str("# Known classes\n");
    if classes.is_empty() {
        prompt.push_str("(none available)\n");
    } else {
        for class in classes {
            prompt.push_str(&format!("- {} :: {}\n", class.label, class.definition));
        }
    }

    if !prior_drafts.is_empty() {
        prompt.push_str("\n# Prior drafts to refine, not duplicate\n");
        for draft in prior_drafts {
            prompt.push_str(&format!("- {} :: {}\n", draft.label, draft.definition));
        }
    }

    prompt.push_str("\n# Case text\n");
    prompt.push_str(section_text);
    prompt
}

/// Slices from the first `{` to the matching last `}` so chatty LLM
/// responses that wrap JSON in prose still parse (§4.5.2 step 4).
fn extract_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

fn parse_extraction_response(text: &str) -> Result<ExtractionResponse, String> {
    serde_json::from_str(extract_json_object(text)).map_err(|e| e.to_string())
}

fn parse_relation_candidates(text: &str) -> Result<Vec<RelationCandidate>, String> {
    let parsed: RelationResponse = serde_json::from_str(extract_json_object(text)).map_err(|e| e.to_string())?;
    Ok(parsed.pairs)
}

fn parse_transformation(text: &str) -> ProEthicaResult<TransformationType> {
    let sliced = extract_json_object(text);
    if let Ok(resp) = serde_json::from_str::<TransformationCandidate>(sliced) {
        return TransformationType::parse(&resp.kind);
    }
    TransformationType::parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DeterministicProvider;
    use crate::model::CaseId;
    use crate::ontology::MockOntologyGateway;
    use crate::parser::parse_document;
    use crate::llm::MockLlmProvider;

    fn fixture_document() -> ParsedDocument {
        parse_document(
            "Facts\nEngineer T used AI-generated design without verification; a worker was injured.\n\n\
             Discussion\nThe board considered the engineer's duty to verify designs.\n\n\
             Conclusions\nThe engineer's conduct was not ethical.",
        )
    }

    fn role_class() -> OntologyClass {
        OntologyClass {
            uri: "urn:proethica:Engineer".into(),
            label: "Engineer".into(),
            definition: "A licensed professional engineer".into(),
            parent_uri: None,
            category: "role".into(),
        }
    }

    fn orchestrator_parts() -> (PipelineConfig, EmbeddingService) {
        let config = PipelineConfig::default();
        let embeddings = EmbeddingService::new(vec![Box::new(DeterministicProvider::new("det", 8))], 8);
        (config, embeddings)
    }

    #[test]
    fn successful_cell_stages_drafts_and_logs_ok() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![role_class()]);
        let llm = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify role",
            r#"{"new_classes":[],"individuals":[{"label":"Engineer T","class_ref":"Engineer","definition":"the respondent engineer","source_span":"Engineer T used AI-generated design"}]}"#,
        );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let report = orchestrator
            .run_cell(&case_id, &document, Step::Contextual, Pass::One, ConceptType::Role)
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Ok);
        assert_eq!(report.staged.len(), 1);
        assert!(!report.ontology_degraded);
        let draft = store.get_draft(report.staged[0]).unwrap();
        assert_eq!(draft.matched_ontology_uri.as_deref(), Some("urn:proethica:Engineer"));
        assert_eq!(draft.match_method, Some(MatchMethod::ExactLabel));
    }

    #[test]
    fn empty_response_is_recorded_as_empty_not_error() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", r#"{"new_classes":[],"individuals":[]}"#);
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let report = orchestrator
            .run_cell(&case_id, &document, Step::Contextual, Pass::One, ConceptType::Role)
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Empty);
        assert!(report.staged.is_empty());
    }

    #[test]
    fn unparseable_response_is_recorded_as_parse_error_after_retry() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", "not json at all");
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let report = orchestrator
            .run_cell(&case_id, &document, Step::Contextual, Pass::One, ConceptType::Role)
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::ParseError);
        assert!(store.sessions_for_case(&case_id).iter().any(|s| s.outcome == SessionOutcome::ParseError));
    }

    #[test]
    fn pass_two_dedup_merges_normalized_label_and_extends_spans() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![role_class()]);
        let llm = MockLlmProvider::new("mock-1", "{}")
            .with_response(
                "Identify role",
                r#"{"new_classes":[],"individuals":[{"label":"Engineer A.","class_ref":"Engineer","definition":"the respondent","source_span":"pass one span"}]}"#,
            );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        orchestrator.run_cell(&case_id, &document, Step::Contextual, Pass::One, ConceptType::Role).unwrap();

        let llm2 = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify role",
            r#"{"new_classes":[],"individuals":[{"label":"engineer a","class_ref":"Engineer","definition":"pass two refinement","source_span":"pass two span"}]}"#,
        );
        let orchestrator2 = Orchestrator::new(&config, &llm2, &ontology, &embeddings, &store);
        let report = orchestrator2
            .run_cell(&case_id, &document, Step::Contextual, Pass::Two, ConceptType::Role)
            .unwrap();

        assert_eq!(store.get_drafts(&case_id, &DraftFilter { concept_type: Some(ConceptType::Role), ..Default::default() }).len(), 1);
        let draft = store.get_draft(report.staged[0]).unwrap();
        assert_eq!(draft.source_text_spans.len(), 2);
    }

    #[test]
    fn ontology_degraded_cell_stages_provisional_uris() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::unavailable(vec![role_class()]);
        let llm = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify role",
            r#"{"new_classes":[],"individuals":[{"label":"Engineer T","class_ref":"Engineer","definition":"the respondent engineer","source_span":"span"}]}"#,
        );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let report = orchestrator
            .run_cell(&case_id, &document, Step::Contextual, Pass::One, ConceptType::Role)
            .unwrap();

        assert!(report.ontology_degraded);
        let draft = store.get_draft(report.staged[0]).unwrap();
        assert_eq!(draft.match_method, Some(MatchMethod::NewCandidate));
        assert!(draft.matched_ontology_uri.as_deref().unwrap().starts_with("urn:proethica:pending:"));
    }

    #[test]
    fn reconcile_candidates_relinks_exact_label_match_once_ontology_recovers() {
        let (config, embeddings) = orchestrator_parts();
        let ontology_down = MockOntologyGateway::unavailable(vec![role_class()]);
        let llm = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify role",
            r#"{"new_classes":[],"individuals":[{"label":"Engineer T","class_ref":"Engineer","definition":"the respondent engineer","source_span":"span"}]}"#,
        );
        let store = StagingStore::memory_only();
        {
            let orchestrator = Orchestrator::new(&config, &llm, &ontology_down, &embeddings, &store);
            let document = fixture_document();
            orchestrator.run_cell(&CaseId::from("case-1"), &document, Step::Contextual, Pass::One, ConceptType::Role).unwrap();
        }

        let ontology_up = MockOntologyGateway::new(vec![role_class()]);
        let orchestrator = Orchestrator::new(&config, &llm, &ontology_up, &embeddings, &store);
        let reconciled = orchestrator.reconcile_candidates(&CaseId::from("case-1")).unwrap();

        assert_eq!(reconciled, 1);
        let draft = store.get_drafts(&CaseId::from("case-1"), &DraftFilter::default())[0].clone();
        assert_eq!(draft.matched_ontology_uri.as_deref(), Some("urn:proethica:Engineer"));
        assert_eq!(draft.match_method, Some(MatchMethod::ExactLabel));
    }

    #[test]
    fn extract_relations_stages_unordered_principle_tension_pair() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", "{\"pairs\":[]}").with_response(
            "principle tension pairs",
            r#"{"pairs":[{"entity_a":"Public Safety","entity_b":"Client Loyalty","rationale":"both bear on the decision","evidence_span":"span"}]}"#,
        );
        let store = StagingStore::memory_only();
        let case_id = CaseId::from("case-1");

        store.stage(DraftEntity {
            draft_id: DraftId::new(1).unwrap(),
            case_id: case_id.clone(),
            extraction_session_id: store.next_session_id(),
            step: Step::Normative,
            pass: Pass::One,
            concept_type: ConceptType::Principle,
            kind: EntityKind::Individual,
            label: "Public Safety".into(),
            definition: "the duty to protect the public".into(),
            source_section: None,
            source_text_spans: vec!["span".into()],
            matched_ontology_uri: None,
            match_confidence: None,
            match_method: None,
            is_board_choice: false,
            is_published: false,
            published_at: None,
            created_at: 0,
        }).unwrap();
        store.stage(DraftEntity {
            draft_id: DraftId::new(2).unwrap(),
            case_id: case_id.clone(),
            extraction_session_id: store.next_session_id(),
            step: Step::Normative,
            pass: Pass::One,
            concept_type: ConceptType::Principle,
            kind: EntityKind::Individual,
            label: "Client Loyalty".into(),
            definition: "the duty owed to the client".into(),
            source_section: None,
            source_text_spans: vec!["span".into()],
            matched_ontology_uri: None,
            match_confidence: None,
            match_method: None,
            is_board_choice: false,
            is_published: false,
            published_at: None,
            created_at: 0,
        }).unwrap();
        store.publish(&case_id, &crate::store::PublishSelector::default()).unwrap();

        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let ids = orchestrator.extract_relations(&case_id, PairKind::PrincipleTension).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.relations_for_case(&case_id, Some(PairKind::PrincipleTension)).len(), 1);
    }

    #[test]
    fn classify_transformation_accepts_closed_set_value() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", r#"{"type":"transfer","rationale":"obligation shifted"}"#);
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let draft_id = orchestrator.classify_transformation(&case_id, &document).unwrap();
        let draft = store.get_draft(draft_id).unwrap();
        assert_eq!(draft.concept_type, ConceptType::Transformation);
        assert_eq!(draft.label, "transfer");
    }

    #[test]
    fn classify_transformation_fails_closed_on_persistent_garbage() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", "not a transformation at all");
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let result = orchestrator.classify_transformation(&case_id, &document);
        assert!(result.is_err());
        assert!(store
            .sessions_for_case(&case_id)
            .iter()
            .any(|s| s.concept_type == ConceptType::Transformation && s.outcome == SessionOutcome::ParseError));
    }

    #[test]
    fn run_pass_drives_every_concept_type_for_the_step() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![role_class()]);
        let llm = MockLlmProvider::new("mock-1", r#"{"new_classes":[],"individuals":[]}"#).with_response(
            "Identify role",
            r#"{"new_classes":[],"individuals":[{"label":"Engineer T","class_ref":"Engineer","definition":"the respondent engineer","source_span":"span"}]}"#,
        );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let reports = orchestrator.run_pass(&case_id, &document, Step::Contextual, Pass::One);

        assert_eq!(reports.len(), Step::Contextual.concept_types_for_pass(Pass::One).len());
        let role_report = reports[0].as_ref().unwrap();
        assert_eq!(role_report.staged.len(), 1);
        for report in &reports[1..] {
            assert_eq!(report.as_ref().unwrap().outcome, SessionOutcome::Empty);
        }
    }

    #[test]
    fn decision_point_cell_stages_options_and_has_option_relations() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify decision_point",
            r#"{"new_classes":[],"individuals":[{"label":"Whether to disclose the defect","class_ref":"","definition":"the board's central choice","source_span":"span","relationships":["BOARD_CHOICE: Disclose to the client","Remain silent"]}]}"#,
        );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        let report = orchestrator
            .run_cell(&case_id, &document, Step::Synthesis, Pass::One, ConceptType::DecisionPoint)
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Ok);
        let options = store.get_drafts(&case_id, &DraftFilter { concept_type: Some(ConceptType::DecisionOption), ..Default::default() });
        assert_eq!(options.len(), 2);
        assert_eq!(options.iter().filter(|o| o.is_board_choice).count(), 1);
        assert_eq!(
            options.iter().find(|o| o.is_board_choice).unwrap().label,
            "Disclose to the client"
        );

        let relations = store.relations_for_case(&case_id, Some(PairKind::HasOption));
        assert_eq!(relations.len(), 2);
        assert!(relations.iter().all(|r| r.entity_a == "Whether to disclose the defect"));
    }

    #[test]
    fn decision_point_with_one_option_still_stages_but_is_flagged() {
        let (config, embeddings) = orchestrator_parts();
        let ontology = MockOntologyGateway::new(vec![]);
        let llm = MockLlmProvider::new("mock-1", "{}").with_response(
            "Identify decision_point",
            r#"{"new_classes":[],"individuals":[{"label":"Whether to disclose","class_ref":"","definition":"choice","source_span":"span","relationships":["Disclose"]}]}"#,
        );
        let store = StagingStore::memory_only();
        let orchestrator = Orchestrator::new(&config, &llm, &ontology, &embeddings, &store);
        let document = fixture_document();
        let case_id = CaseId::from("case-1");

        orchestrator
            .run_cell(&case_id, &document, Step::Synthesis, Pass::One, ConceptType::DecisionPoint)
            .unwrap();

        let options = store.get_drafts(&case_id, &DraftFilter { concept_type: Some(ConceptType::DecisionOption), ..Default::default() });
        assert_eq!(options.len(), 1);
    }
}
