//! proethica CLI: a thin driver over the extraction-and-synthesis pipeline.
//!
//! Every subcommand here invokes exactly the operation a task queue would
//! otherwise call directly against the library: there is no auth, no web
//! routes, no background scheduler. `ingest` previews how a case body
//! splits into sections; `extract` runs one (step, pass, concept_type)
//! cell; `publish` promotes drafts; `build-features` derives the Case
//! Feature Record; `neighbors` ranks precedent cases; `info` reports
//! store/feature counts.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};

use proethica_core::config::PipelineConfig;
use proethica_core::embedding::{EmbeddingProvider, EmbeddingService, HttpEmbeddingProvider};
use proethica_core::feature::{CaseFeatureRecord, FeatureBuilder, FeatureStore};
use proethica_core::graph::PublishedGraph;
use proethica_core::llm::{HttpLlmProvider, LlmProvider};
use proethica_core::model::{CaseId, ConceptType, Pass, PairKind, SectionType, SessionOutcome, Step};
use proethica_core::ontology::{HttpOntologyGateway, OntologyGateway};
use proethica_core::parser::parse_document;
use proethica_core::pipeline::Orchestrator;
use proethica_core::precedent::{NeighborFilter, PrecedentEngine};
use proethica_core::store::{DraftFilter, PublishSelector, StagingStore};

#[derive(Parser)]
#[command(name = "proethica", version, about = "Professional-ethics case extraction and precedent analysis")]
struct Cli {
    /// Data directory for persistent storage (redb + oxigraph). Omit for an
    /// in-memory-only run (tests, one-off dry runs).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Path to a TOML config file overriding the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a case body into sections and report what was found. Parsing
    /// itself is not persisted; it is a pure function re-run by every
    /// `extract`/`build-features` call, so this exists to preview the split.
    Ingest {
        /// Path to the case body (plain text or lightly-marked HTML).
        #[arg(long)]
        file: PathBuf,
    },

    /// Run one extraction cell against a case body.
    Extract {
        /// Case identifier.
        #[arg(long)]
        case_id: String,
        /// Path to the case body.
        #[arg(long)]
        file: PathBuf,
        /// Pipeline step.
        #[arg(long)]
        step: StepArg,
        /// Extraction pass (ignored for the synthesis step).
        #[arg(long, default_value = "one")]
        pass: PassArg,
        /// Concept type to extract.
        #[arg(long)]
        concept_type: ConceptTypeArg,
    },

    /// Run step-4 relation-pair extraction (principle tensions or
    /// obligation conflicts) over a case's published drafts.
    ExtractRelations {
        #[arg(long)]
        case_id: String,
        #[arg(long)]
        kind: RelationKindArg,
    },

    /// Run step-4 transformation-pattern classification for a case.
    ClassifyTransformation {
        #[arg(long)]
        case_id: String,
        #[arg(long)]
        file: PathBuf,
    },

    /// Re-link `new_candidate` drafts to canonical ontology classes once the
    /// ontology service has recovered.
    Reconcile {
        #[arg(long)]
        case_id: String,
    },

    /// Publish unpublished drafts (and relation pairs) for a case.
    Publish {
        #[arg(long)]
        case_id: String,
        /// Restrict to one concept type; omit to publish everything staged.
        #[arg(long)]
        concept_type: Option<ConceptTypeArg>,
    },

    /// Build (or rebuild) the Case Feature Record from a case's published
    /// drafts.
    BuildFeatures {
        #[arg(long)]
        case_id: String,
        /// Path to the case body (needed to re-derive section embeddings
        /// for the combined narrative vector).
        #[arg(long)]
        file: PathBuf,
    },

    /// Rank the most similar cases to a query case.
    Neighbors {
        #[arg(long)]
        case_id: String,
        #[arg(long, default_value = "5")]
        k: usize,
    },

    /// Report store contents: data directory, feature records built,
    /// collaborator health.
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum StepArg {
    Contextual,
    Normative,
    Temporal,
    Synthesis,
}

impl From<StepArg> for Step {
    fn from(value: StepArg) -> Self {
        match value {
            StepArg::Contextual => Step::Contextual,
            StepArg::Normative => Step::Normative,
            StepArg::Temporal => Step::Temporal,
            StepArg::Synthesis => Step::Synthesis,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PassArg {
    One,
    Two,
}

impl From<PassArg> for Pass {
    fn from(value: PassArg) -> Self {
        match value {
            PassArg::One => Pass::One,
            PassArg::Two => Pass::Two,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ConceptTypeArg {
    Role,
    Principle,
    Obligation,
    State,
    Resource,
    Action,
    Event,
    Capability,
    Constraint,
}

impl From<ConceptTypeArg> for ConceptType {
    fn from(value: ConceptTypeArg) -> Self {
        match value {
            ConceptTypeArg::Role => ConceptType::Role,
            ConceptTypeArg::Principle => ConceptType::Principle,
            ConceptTypeArg::Obligation => ConceptType::Obligation,
            ConceptTypeArg::State => ConceptType::State,
            ConceptTypeArg::Resource => ConceptType::Resource,
            ConceptTypeArg::Action => ConceptType::Action,
            ConceptTypeArg::Event => ConceptType::Event,
            ConceptTypeArg::Capability => ConceptType::Capability,
            ConceptTypeArg::Constraint => ConceptType::Constraint,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RelationKindArg {
    PrincipleTension,
    ObligationConflict,
}

impl From<RelationKindArg> for PairKind {
    fn from(value: RelationKindArg) -> Self {
        match value {
            RelationKindArg::PrincipleTension => PairKind::PrincipleTension,
            RelationKindArg::ObligationConflict => PairKind::ObligationConflict,
        }
    }
}

/// Collaborators the pipeline needs wired up per invocation: a staging
/// store, an LLM provider, an ontology gateway, and an embedding service.
/// Built fresh per CLI invocation rather than held across calls, matching
/// the thin-driver framing — a long-lived daemon would hold these instead.
struct Collaborators {
    store: StagingStore,
    llm: HttpLlmProvider,
    ontology: HttpOntologyGateway,
    embeddings: EmbeddingService,
    config: PipelineConfig,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path).into_diagnostic()?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.display().to_string());
    }
    Ok(config)
}

fn wire_up(cli: &Cli) -> Result<Collaborators> {
    let config = load_config(cli)?;

    let store = match &config.data_dir {
        Some(dir) => StagingStore::open(std::path::Path::new(dir)).into_diagnostic()?,
        None => StagingStore::memory_only(),
    };

    let llm = HttpLlmProvider::new(
        config.llm.model_id.clone(),
        config.llm.endpoint.clone(),
        config.llm_timeout(),
        config.llm.max_retries,
    );

    let ontology = HttpOntologyGateway::new(
        config.ontology.endpoint.clone(),
        config.ontology_timeout(),
        config.ontology.max_retries,
        Duration::from_secs(config.ontology.cache_ttl_secs),
    );

    let providers: Vec<Box<dyn EmbeddingProvider>> = config
        .embedding
        .provider_priority
        .iter()
        .map(|name| {
            Box::new(HttpEmbeddingProvider::new(
                name.clone(),
                format!("{}/embeddings/{}", config.ontology.endpoint, name),
                config.embedding_timeout(),
            )) as Box<dyn EmbeddingProvider>
        })
        .collect();
    let embeddings = EmbeddingService::new(providers, config.embedding.dimension);

    Ok(Collaborators {
        store,
        llm,
        ontology,
        embeddings,
        config,
    })
}

fn feature_store(config: &PipelineConfig) -> Result<FeatureStore> {
    match &config.data_dir {
        Some(dir) => FeatureStore::open(std::path::Path::new(dir)).into_diagnostic(),
        None => Ok(FeatureStore::memory_only()),
    }
}

fn mirror_store(config: &PipelineConfig) -> Result<PublishedGraph> {
    match &config.data_dir {
        Some(dir) => PublishedGraph::open(&std::path::Path::new(dir).join("graph")).into_diagnostic(),
        None => PublishedGraph::in_memory().into_diagnostic(),
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Ingest { file } => {
            let body = std::fs::read_to_string(file).into_diagnostic()?;
            let doc = parse_document(&body);
            println!("Parse method: {:?}", doc.parse_method);
            for section_type in SectionType::ALL {
                if let Some(section) = doc.section(section_type) {
                    println!(
                        "  {section_type} ({} chars, {} chars markup)",
                        section.text.len(),
                        section.markup.len()
                    );
                }
            }
        }

        Commands::Extract {
            case_id,
            file,
            step,
            pass,
            concept_type,
        } => {
            let collaborators = wire_up(&cli)?;
            let body = std::fs::read_to_string(file).into_diagnostic()?;
            let doc = parse_document(&body);
            let case_id = CaseId::from(case_id.as_str());

            let orchestrator = Orchestrator::new(
                &collaborators.config,
                &collaborators.llm,
                &collaborators.ontology,
                &collaborators.embeddings,
                &collaborators.store,
            );
            let report = orchestrator
                .run_cell(&case_id, &doc, (*step).into(), (*pass).into(), (*concept_type).into())
                .into_diagnostic()?;

            match report.outcome {
                SessionOutcome::Ok => println!("Staged {} draft(s).", report.staged.len()),
                other => println!("Cell finished with outcome {other:?} (0 drafts staged)."),
            }
            if report.ontology_degraded {
                eprintln!("warning: ontology service was unreachable; extraction ran with no category listing.");
            }
        }

        Commands::ExtractRelations { case_id, kind } => {
            let collaborators = wire_up(&cli)?;
            let case_id = CaseId::from(case_id.as_str());
            let orchestrator = Orchestrator::new(
                &collaborators.config,
                &collaborators.llm,
                &collaborators.ontology,
                &collaborators.embeddings,
                &collaborators.store,
            );
            let ids = orchestrator
                .extract_relations(&case_id, (*kind).into())
                .into_diagnostic()?;
            println!("Staged {} relation pair(s).", ids.len());
        }

        Commands::ClassifyTransformation { case_id, file } => {
            let collaborators = wire_up(&cli)?;
            let body = std::fs::read_to_string(file).into_diagnostic()?;
            let doc = parse_document(&body);
            let case_id = CaseId::from(case_id.as_str());
            let orchestrator = Orchestrator::new(
                &collaborators.config,
                &collaborators.llm,
                &collaborators.ontology,
                &collaborators.embeddings,
                &collaborators.store,
            );
            let draft_id = orchestrator
                .classify_transformation(&case_id, &doc)
                .into_diagnostic()?;
            println!("Staged transformation draft {draft_id}.");
        }

        Commands::Reconcile { case_id } => {
            let collaborators = wire_up(&cli)?;
            let case_id = CaseId::from(case_id.as_str());
            let orchestrator = Orchestrator::new(
                &collaborators.config,
                &collaborators.llm,
                &collaborators.ontology,
                &collaborators.embeddings,
                &collaborators.store,
            );
            let reconciled = orchestrator.reconcile_candidates(&case_id).into_diagnostic()?;
            println!("Reconciled {reconciled} candidate(s) to canonical ontology classes.");
        }

        Commands::Publish { case_id, concept_type } => {
            let collaborators = wire_up(&cli)?;
            let case_id = CaseId::from(case_id.as_str());

            let selector = PublishSelector {
                concept_type: concept_type.map(|ct| ct.into()),
                ..Default::default()
            };

            let published = collaborators.store.publish(&case_id, &selector).into_diagnostic()?;
            let relations_published = collaborators.store.publish_relations(&case_id).into_diagnostic()?;
            println!("Published {published} draft(s) and {relations_published} relation pair(s).");

            // Re-mirror the case's published drafts into the RDF graph (§10.4):
            // the explicit caller the library-level `mirror_published` was built
            // for. Invalidate first so a republish doesn't leave stale triples
            // behind for drafts that were unpublished in between.
            let graph = mirror_store(&collaborators.config)?;
            graph.invalidate_case(&case_id.0).into_diagnostic()?;
            for draft in collaborators.store.get_drafts(
                &case_id,
                &DraftFilter {
                    is_published: Some(true),
                    ..Default::default()
                },
            ) {
                graph.mirror_published(&draft).into_diagnostic()?;
            }
            println!("Mirrored published drafts to the RDF graph ({} triple(s)).", graph.len().into_diagnostic()?);
        }

        Commands::BuildFeatures { case_id, file } => {
            let collaborators = wire_up(&cli)?;
            let body = std::fs::read_to_string(file).into_diagnostic()?;
            let doc = parse_document(&body);
            let case_id = CaseId::from(case_id.as_str());

            let builder = FeatureBuilder::new(&collaborators.store, &collaborators.embeddings, &collaborators.llm);
            let record = builder.build(&case_id, &doc).into_diagnostic()?;
            let features = feature_store(&collaborators.config)?;
            features.put(record.clone()).into_diagnostic()?;

            print_feature_summary(&record);
        }

        Commands::Neighbors { case_id, k } => {
            let config = load_config(&cli)?;
            let features = feature_store(&config)?;
            let engine = PrecedentEngine::new(&features, config.weights.clone()).into_diagnostic()?;
            let case_id = CaseId::from(case_id.as_str());
            let neighbors = engine
                .neighbors(&case_id, *k, &NeighborFilter::default())
                .into_diagnostic()?;

            if neighbors.is_empty() {
                println!("No neighbors found for \"{case_id}\".");
            } else {
                println!("Nearest precedents for \"{case_id}\":");
                for (i, n) in neighbors.iter().enumerate() {
                    println!("  {}. {} (score {:.4})", i + 1, n.case_id, n.score);
                }
            }
        }

        Commands::Info => {
            let collaborators = wire_up(&cli)?;
            let features = feature_store(&collaborators.config)?;
            println!(
                "Data dir: {}",
                collaborators.config.data_dir.as_deref().unwrap_or("(in-memory)")
            );
            println!("Feature records built: {}", features.all_case_ids().len());
            println!("LLM model: {}", collaborators.llm.model_id());
            println!("Ontology service reachable: {}", collaborators.ontology.health_check());
        }
    }

    Ok(())
}

fn print_feature_summary(record: &CaseFeatureRecord) {
    println!("Case: {}", record.case_id);
    println!("  outcome:     {:?} (confidence {:.2})", record.outcome, record.outcome_confidence);
    println!("  provisions:  {}", record.provisions_cited.join(", "));
    println!("  cited cases: {}", record.cited_case_numbers.join(", "));
    println!("  subject tags: {}", record.subject_tags.join(", "));
    if let Some(t) = &record.transformation {
        println!("  transformation: {:?} ({})", t.transformation_type, t.pattern_id);
    }
    println!(
        "  principle tensions: {}, obligation conflicts: {}",
        record.principle_tensions.len(),
        record.obligation_conflicts.len(),
    );
}
