//! Provenance ledger: the Extraction Session record (§3) and a helper to
//! check the provenance-completeness testable property (§8.3): every
//! published draft must trace back to at least one extraction session whose
//! response text references the draft's label.

use serde::{Deserialize, Serialize};

use crate::model::{CaseId, ConceptType, Pass, SectionType, SessionId, SessionOutcome, Step};

/// Append-only provenance record for one extraction cell's LLM call (§3,
/// §4.5.2). Historical sessions are retained even after a re-run produces a
/// newer "current" session for the same cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSessionRecord {
    pub session_id: SessionId,
    pub case_id: CaseId,
    pub step: Step,
    pub pass: Pass,
    /// `None` for step 4, which draws on all sections rather than one.
    pub section_type: Option<SectionType>,
    pub concept_type: ConceptType,
    pub prompt_text: String,
    pub response_text: String,
    pub model_id: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub outcome: SessionOutcome,
    /// Set when the ontology service was unreachable and extraction
    /// proceeded with an empty category listing (§4.5.3).
    pub ontology_degraded: bool,
}

impl ExtractionSessionRecord {
    /// Whether this session's response text mentions `label` (case-insensitive
    /// substring match), the check backing testable property 3.
    pub fn references_label(&self, label: &str) -> bool {
        let needle = label.trim().to_lowercase();
        !needle.is_empty() && self.response_text.to_lowercase().contains(&needle)
    }

    /// The cell identity this session belongs to: sessions for the same
    /// (case, step, pass, section, concept_type) are the same "cell" across
    /// re-runs (§3 Extraction Session invariant).
    pub fn cell_key(&self) -> (CaseId, u8, u8, Option<SectionType>, ConceptType) {
        (
            self.case_id.clone(),
            self.step.as_u8(),
            self.pass.as_u8(),
            self.section_type,
            self.concept_type,
        )
    }
}

/// Verify that every `(label, concept_type)` pair in `labels` is referenced
/// by at least one session in `sessions`. Returns the labels that fail the
/// check (empty if provenance is complete).
pub fn missing_provenance<'a>(
    labels: impl IntoIterator<Item = (&'a str, ConceptType)>,
    sessions: &[ExtractionSessionRecord],
) -> Vec<String> {
    labels
        .into_iter()
        .filter(|(label, concept_type)| {
            !sessions
                .iter()
                .any(|s| s.concept_type == *concept_type && s.references_label(label))
        })
        .map(|(label, _)| label.to_string())
        .collect()
}
