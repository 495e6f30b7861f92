//! Shared identifiers and closed-set vocabularies for the ProEthica pipeline.
//!
//! These types appear across every subsystem (staging, orchestrator, feature
//! building, precedent scoring) so they live in one place rather than being
//! redefined per module.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, ProEthicaResult};

/// Case identifier. Cases are created externally (upload); their ID is
/// whatever the caller's upload workflow assigns, so it is an opaque string
/// rather than an internally-allocated counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaseId(pub String);

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Niche-optimized identifier for a draft entity, minted by [`DraftIdAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DraftId(NonZeroU64);

impl DraftId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(DraftId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for DraftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "draft:{}", self.0)
    }
}

/// Niche-optimized identifier for an extraction session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(SessionId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Niche-optimized identifier for a Step-4 relation pair (§9 "Cyclic references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RelationId(NonZeroU64);

impl RelationId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(RelationId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relation:{}", self.0)
    }
}

/// Thread-safe monotonic allocator, shared by draft and session IDs.
///
/// IDs start from 1 so that `Option<DraftId>`/`Option<SessionId>` stay
/// niche-optimized.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    pub fn next_draft_id(&self) -> DraftId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        DraftId::new(raw).expect("allocator never yields zero")
    }

    pub fn next_session_id(&self) -> SessionId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        SessionId::new(raw).expect("allocator never yields zero")
    }

    pub fn next_relation_id(&self) -> RelationId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        RelationId::new(raw).expect("allocator never yields zero")
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The closed set of document sections a case is parsed into (§3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionType {
    Facts,
    Discussion,
    Questions,
    Conclusions,
    References,
    Dissenting,
}

impl SectionType {
    pub const ALL: [SectionType; 6] = [
        SectionType::Facts,
        SectionType::Discussion,
        SectionType::Questions,
        SectionType::Conclusions,
        SectionType::References,
        SectionType::Dissenting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Facts => "facts",
            SectionType::Discussion => "discussion",
            SectionType::Questions => "questions",
            SectionType::Conclusions => "conclusions",
            SectionType::References => "references",
            SectionType::Dissenting => "dissenting",
        }
    }
}

impl std::fmt::Display for SectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The nine D-tuple concept types plus the synthesis-step entity kinds (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConceptType {
    Role,
    Principle,
    Obligation,
    State,
    Resource,
    Action,
    Event,
    Capability,
    Constraint,
    Provision,
    Question,
    Conclusion,
    DecisionPoint,
    DecisionOption,
    ArgumentGenerated,
    ArgumentValidation,
    Transformation,
}

impl ConceptType {
    /// The nine D-tuple channels used for component embeddings (§4.6, §4.7.1).
    /// Order matches the glossary: R, P, O, S, Rs, A, E, Ca, Cs.
    pub const D_TUPLE: [ConceptType; 9] = [
        ConceptType::Role,
        ConceptType::Principle,
        ConceptType::Obligation,
        ConceptType::State,
        ConceptType::Resource,
        ConceptType::Action,
        ConceptType::Event,
        ConceptType::Capability,
        ConceptType::Constraint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConceptType::Role => "role",
            ConceptType::Principle => "principle",
            ConceptType::Obligation => "obligation",
            ConceptType::State => "state",
            ConceptType::Resource => "resource",
            ConceptType::Action => "action",
            ConceptType::Event => "event",
            ConceptType::Capability => "capability",
            ConceptType::Constraint => "constraint",
            ConceptType::Provision => "provision",
            ConceptType::Question => "question",
            ConceptType::Conclusion => "conclusion",
            ConceptType::DecisionPoint => "decision_point",
            ConceptType::DecisionOption => "decision_option",
            ConceptType::ArgumentGenerated => "argument_generated",
            ConceptType::ArgumentValidation => "argument_validation",
            ConceptType::Transformation => "transformation",
        }
    }

    /// Ontology category name used by the Gateway for class lookups (§4.3).
    /// Synthesis-only concept types have no ontology category of their own.
    pub fn ontology_category(self) -> Option<&'static str> {
        match self {
            ConceptType::Role
            | ConceptType::Principle
            | ConceptType::Obligation
            | ConceptType::State
            | ConceptType::Resource
            | ConceptType::Action
            | ConceptType::Event
            | ConceptType::Capability
            | ConceptType::Constraint => Some(self.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConceptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a draft entity is an ontology class or an individual instance (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Class,
    Individual,
}

/// How a draft individual's ontology class was resolved (§4.5.2 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchMethod {
    ExactLabel,
    Embedding,
    Llm,
    UserOverride,
    NewCandidate,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::ExactLabel => "exact_label",
            MatchMethod::Embedding => "embedding",
            MatchMethod::Llm => "llm",
            MatchMethod::UserOverride => "user_override",
            MatchMethod::NewCandidate => "new_candidate",
        }
    }
}

/// Pipeline step (§4.5.1). Step 4 (Synthesis) has no pass distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Contextual = 1,
    Normative = 2,
    Temporal = 3,
    Synthesis = 4,
}

impl Step {
    pub const ORDER: [Step; 4] = [
        Step::Contextual,
        Step::Normative,
        Step::Temporal,
        Step::Synthesis,
    ];

    /// The concept types this step produces, grouped by pass.
    pub fn concept_types_for_pass(self, pass: Pass) -> &'static [ConceptType] {
        use ConceptType::*;
        match (self, pass) {
            (Step::Contextual, _) => &[Role, State, Resource],
            (Step::Normative, _) => &[Principle, Obligation, Constraint, Capability],
            (Step::Temporal, _) => &[Action, Event],
            (Step::Synthesis, _) => &[
                Provision,
                Question,
                Conclusion,
                DecisionPoint,
                ArgumentGenerated,
                Transformation,
            ],
        }
    }

    /// The section this step/pass emphasizes when building prompts (§4.5.1).
    pub fn emphasis_section(self, pass: Pass) -> Option<SectionType> {
        match (self, pass) {
            (Step::Synthesis, _) => None, // all sections + prior-step outputs
            (_, Pass::One) => Some(SectionType::Facts),
            (_, Pass::Two) => Some(SectionType::Discussion),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Extraction pass within a step. Step 4 is modeled as running once under
/// `Pass::One` since the synthesis step has no two-pass structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pass {
    One = 1,
    Two = 2,
}

impl Pass {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Outcome of running one extraction cell (§3 Extraction Session table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionOutcome {
    Ok,
    ParseError,
    LlmError,
    Empty,
}

/// Case-level ethical outcome classification, closed set (§3, §4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Ethical,
    Unethical,
    Mixed,
    Unclear,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ethical => "ethical",
            Outcome::Unethical => "unethical",
            Outcome::Mixed => "mixed",
            Outcome::Unclear => "unclear",
        }
    }

    pub fn parse(s: &str) -> ProEthicaResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "ethical" => Ok(Outcome::Ethical),
            "unethical" => Ok(Outcome::Unethical),
            "mixed" => Ok(Outcome::Mixed),
            "unclear" => Ok(Outcome::Unclear),
            other => Err(OrchestratorError::ValidationError {
                message: format!("outcome '{other}' is outside the closed set"),
            }
            .into()),
        }
    }

    /// Outcome-agreement alignment function used by the precedent formula (§4.7.1):
    /// same outcome -> 1.0, opposite ethical/unethical -> 0.0, otherwise -> 0.5.
    pub fn align(self, other: Outcome) -> f32 {
        if self == other {
            1.0
        } else {
            match (self, other) {
                (Outcome::Ethical, Outcome::Unethical) | (Outcome::Unethical, Outcome::Ethical) => {
                    0.0
                }
                _ => 0.5,
            }
        }
    }
}

/// Transformation classification, closed set of four values (Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformationType {
    Transfer,
    Stalemate,
    Oscillation,
    PhaseLag,
}

impl TransformationType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransformationType::Transfer => "transfer",
            TransformationType::Stalemate => "stalemate",
            TransformationType::Oscillation => "oscillation",
            TransformationType::PhaseLag => "phase_lag",
        }
    }

    pub fn parse(s: &str) -> ProEthicaResult<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "transfer" => Ok(TransformationType::Transfer),
            "stalemate" => Ok(TransformationType::Stalemate),
            "oscillation" => Ok(TransformationType::Oscillation),
            "phase_lag" | "phaselag" => Ok(TransformationType::PhaseLag),
            other => Err(OrchestratorError::ValidationError {
                message: format!("transformation type '{other}' is outside the closed set"),
            }
            .into()),
        }
    }
}

/// Honorifics and trailing role qualifiers stripped during label
/// normalization (§4.5.2 step 6), checked as whole leading/trailing words.
const HONORIFICS: [&str; 6] = ["mr", "mrs", "ms", "dr", "engineer", "prof"];
const TRAILING_QUALIFIERS: [&str; 4] = ["pe", "p.e", "jr", "sr"];

/// Normalize a draft label for the deduplication key (§4.5.2 step 6, §3
/// Draft Entity invariant): lowercase, strip punctuation, collapse
/// whitespace, strip leading honorifics and trailing role qualifiers.
///
/// This is deliberately conservative — it strips at most one leading
/// honorific and one trailing qualifier token, so "Engineer A." and
/// "engineer a" collapse to the same key (Scenario D) without merging
/// distinct multi-word labels that merely share a word.
pub fn normalize_label(label: &str) -> String {
    let stripped: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<String> = stripped
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();

    if tokens.len() > 1 && HONORIFICS.contains(&tokens[0].as_str()) {
        tokens.remove(0);
    }
    if tokens.len() > 1 && TRAILING_QUALIFIERS.contains(&tokens[tokens.len() - 1].as_str()) {
        tokens.pop();
    }
    tokens.join(" ")
}

/// Kind of unordered relation pair produced by Step 4 synthesis (§4.5.4,
/// §9 "Cyclic references"). These are *not* draft entities — the Draft
/// Entity concept_type closed set in §3 has no tension/conflict member — so
/// they live in a side table keyed by sorted endpoint labels rather than as
/// individuals with back-pointers. `HasOption` links a decision point to one
/// of its options (§3 Decision Point / Decision Option row) and, unlike the
/// other two kinds, is directional: entity_a is always the point, entity_b
/// always the option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairKind {
    PrincipleTension,
    ObligationConflict,
    HasOption,
}

impl PairKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PairKind::PrincipleTension => "principle_tension",
            PairKind::ObligationConflict => "obligation_conflict",
            PairKind::HasOption => "has_option",
        }
    }

    /// Whether `(a, b)` and `(b, a)` denote the same pair. True for the two
    /// relation kinds the LLM proposes freely; false for `HasOption`, whose
    /// endpoints have fixed roles (point, then option).
    pub fn is_symmetric(self) -> bool {
        !matches!(self, PairKind::HasOption)
    }
}

/// Current timestamp in seconds since the UNIX epoch.
///
/// Used throughout instead of pulling in a datetime crate; every timestamp
/// field in the data model (§3) is a plain unix-seconds `u64`.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocator_is_monotonic_and_nonzero() {
        let alloc = IdAllocator::new();
        let a = alloc.next_draft_id();
        let b = alloc.next_draft_id();
        assert!(b.get() > a.get());
        assert!(a.get() > 0);
    }

    #[test]
    fn outcome_alignment() {
        assert_eq!(Outcome::Ethical.align(Outcome::Ethical), 1.0);
        assert_eq!(Outcome::Ethical.align(Outcome::Unethical), 0.0);
        assert_eq!(Outcome::Ethical.align(Outcome::Mixed), 0.5);
    }

    #[test]
    fn outcome_closed_set_rejects_unknown() {
        assert!(Outcome::parse("ethical").is_ok());
        assert!(Outcome::parse("not-a-real-outcome").is_err());
    }

    #[test]
    fn transformation_closed_set() {
        assert_eq!(
            TransformationType::parse("phase_lag").unwrap(),
            TransformationType::PhaseLag
        );
        assert!(TransformationType::parse("bogus").is_err());
    }

    #[test]
    fn normalize_label_collapses_case_and_punctuation() {
        assert_eq!(normalize_label("Engineer A."), normalize_label("engineer a"));
        assert_eq!(normalize_label("Engineer A."), "a");
    }

    #[test]
    fn normalize_label_strips_trailing_qualifier() {
        assert_eq!(normalize_label("Jane Doe, PE"), normalize_label("Jane Doe"));
    }

    #[test]
    fn normalize_label_collapses_whitespace() {
        assert_eq!(normalize_label("  public   welfare  "), "public welfare");
    }

    #[test]
    fn step_concept_types_match_state_machine_table() {
        assert_eq!(
            Step::Contextual.concept_types_for_pass(Pass::One),
            &[ConceptType::Role, ConceptType::State, ConceptType::Resource]
        );
        assert_eq!(
            Step::Normative.emphasis_section(Pass::Two),
            Some(SectionType::Discussion)
        );
        assert_eq!(Step::Synthesis.emphasis_section(Pass::One), None);
    }
}
