//! Crate-wide error taxonomy.
//!
//! One enum per subsystem, each carrying a `miette` diagnostic code and a
//! `help()` string, aggregated into [`ProEthicaError`] via transparent
//! `#[from]` variants so callers can use `?` across subsystem boundaries and
//! still get a single error type back.

use miette::Diagnostic;
use thiserror::Error;

/// Crate-wide result alias.
pub type ProEthicaResult<T> = std::result::Result<T, ProEthicaError>;

/// The Document Section Parser never fails hard — malformed input degrades
/// to the unstructured fallback instead of returning an error. This type
/// exists for symmetry with the other subsystems; no parser operation
/// currently returns it, but callers that special-case a genuinely empty
/// document can surface it explicitly.
#[derive(Debug, Error, Diagnostic)]
pub enum ParserError {
    #[error("document body is empty after normalization")]
    #[diagnostic(
        code(proethica::parser::empty_document),
        help("check the source upload for a body before calling the parser")
    )]
    EmptyDocument,
}

#[derive(Debug, Error, Diagnostic)]
pub enum EmbeddingError {
    #[error("cannot embed empty or whitespace-only text")]
    #[diagnostic(
        code(proethica::embedding::empty_input),
        help("filter blank spans before calling embed/embed_batch")
    )]
    EmptyInput,

    #[error("no embedding provider in the priority chain is reachable")]
    #[diagnostic(
        code(proethica::embedding::provider_unavailable),
        help("check network access and provider health; the chain is tried in priority order")
    )]
    ProviderUnavailable,

    #[error("provider '{provider}' returned a {actual}-dimensional vector, expected {expected}")]
    #[diagnostic(
        code(proethica::embedding::dimension_mismatch),
        help("the provider's model changed or was misconfigured; check provider config")
    )]
    DimensionMismatch {
        provider: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error, Diagnostic)]
pub enum OntologyError {
    #[error("ontology service unavailable: {message}")]
    #[diagnostic(
        code(proethica::ontology::unavailable),
        help("callers should proceed with new_candidate matches and set ontology_degraded")
    )]
    Unavailable { message: String },

    #[error("candidate class '{label}' is invalid: {reason}")]
    #[diagnostic(
        code(proethica::ontology::invalid_candidate),
        help("candidate labels must be non-empty and not duplicate an existing class under the category")
    )]
    InvalidCandidate { label: String, reason: String },

    #[error("ontology class '{uri}' was not found")]
    #[diagnostic(
        code(proethica::ontology::not_found),
        help("verify the URI was resolved from a prior get_classes/search_classes call")
    )]
    NotFound { uri: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum StagingError {
    #[error("draft {draft_id} is published and cannot be mutated in place")]
    #[diagnostic(
        code(proethica::staging::publish_conflict),
        help("unpublish the draft first, or stage a new draft instead of mutating a published one")
    )]
    PublishConflict { draft_id: String },

    #[error("draft {draft_id} was not found in case {case_id}")]
    #[diagnostic(
        code(proethica::staging::draft_not_found),
        help("check the draft was staged and not already deleted")
    )]
    DraftNotFound { draft_id: String, case_id: String },

    #[error("underlying store operation failed: {message}")]
    #[diagnostic(
        code(proethica::staging::store_io),
        help("check disk space and permissions on the configured data directory")
    )]
    StoreIo { message: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("external call failed after exhausting retries: {message}")]
    #[diagnostic(
        code(proethica::orchestrator::transient_external),
        help("the LLM or ontology endpoint may be overloaded; check its health")
    )]
    TransientExternal { message: String },

    #[error("LLM response could not be parsed as the expected structure: {message}")]
    #[diagnostic(
        code(proethica::orchestrator::parse_error),
        help("one repair retry with explicit format instructions is attempted before this is raised")
    )]
    ParseError { message: String },

    #[error("extraction result failed validation: {message}")]
    #[diagnostic(
        code(proethica::orchestrator::validation_error),
        help("check the value against its closed set or structural invariant")
    )]
    ValidationError { message: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum FeatureError {
    #[error("case {case_id} has no published drafts to build features from")]
    #[diagnostic(
        code(proethica::features::no_published_content),
        help("publish at least one draft entity for this case before building features")
    )]
    NoPublishedContent { case_id: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum PrecedentError {
    #[error("similarity weights are all zero")]
    #[diagnostic(
        code(proethica::precedent::all_zero_weights),
        help("at least one weight must be nonzero so normalization is well-defined")
    )]
    AllZeroWeights,

    #[error("case {case_id} has no feature record; build_features must run first")]
    #[diagnostic(
        code(proethica::precedent::case_not_found),
        help("call the feature builder for this case before requesting neighbors")
    )]
    CaseNotFound { case_id: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid component weights: {message}")]
    #[diagnostic(
        code(proethica::config::invalid_weights),
        help("weights must be nonnegative and at least one must be nonzero")
    )]
    InvalidWeights { message: String },

    #[error("invalid threshold '{name}': {message}")]
    #[diagnostic(
        code(proethica::config::invalid_threshold),
        help("thresholds must fall within [0.0, 1.0]")
    )]
    InvalidThreshold { name: String, message: String },

    #[error("failed to load configuration from {path}: {message}")]
    #[diagnostic(
        code(proethica::config::load_failed),
        help("check the TOML file is well-formed and readable")
    )]
    LoadFailed { path: String, message: String },
}

/// RDF mirror error for the published-entity graph store.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("SPARQL store operation failed: {message}")]
    #[diagnostic(
        code(proethica::graph::sparql),
        help("check the oxigraph data directory and that the query is well-formed")
    )]
    Sparql { message: String },
}

/// Errors from the durable draft/session store.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("redb operation failed: {message}")]
    #[diagnostic(
        code(proethica::store::redb),
        help("check disk space and that no other process holds an exclusive lock on the data directory")
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(proethica::store::serde),
        help("stored record format may have changed between versions; check the bincode schema")
    )]
    Serialization { message: String },
}

/// Aggregated crate error. Every subsystem error converts into this via
/// `#[from]`, so pipeline code can propagate with `?` regardless of which
/// subsystem raised it.
#[derive(Debug, Error, Diagnostic)]
pub enum ProEthicaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ontology(#[from] OntologyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Precedent(#[from] PrecedentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    #[diagnostic(code(proethica::io))]
    Io(#[from] std::io::Error),
}
