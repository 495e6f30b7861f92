// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # proethica-core
//!
//! An extraction-and-synthesis pipeline for professional ethics case
//! analysis: NSPE-style board-decision documents go in, a nine-concept
//! knowledge graph and a precedent-similarity index come out.
//!
//! ## Architecture
//!
//! - **Document Section Parser** (`parser`): splits a case body into its
//!   closed set of sections (facts, discussion, questions, conclusions,
//!   references, dissenting opinion).
//! - **Ontology Gateway** (`ontology`): resolves extracted labels against a
//!   shared professional-ethics ontology, minting new candidate classes when
//!   no match is found.
//! - **Embedding Service** (`embedding`): a priority-ordered provider chain
//!   producing dense vectors for similarity comparisons.
//! - **LLM provider** (`llm`): the chat-completion backend the Orchestrator
//!   drives per extraction cell.
//! - **Extraction Orchestrator** (`pipeline`): runs the four-step, two-pass
//!   state machine that stages draft entities into the Staging Store.
//! - **Staging Store** (`store`): a transactional draft/publish repository,
//!   tiered over an in-memory hot index and a `redb`-backed durable store.
//! - **Published-entity graph** (`graph`): an RDF mirror of published
//!   entities, queryable via SPARQL.
//! - **Case Feature Builder** (`feature`): derives the Case Feature Record —
//!   component embeddings, outcome classification, cited provisions — from a
//!   case's published drafts.
//! - **Precedent Engine** (`precedent`): scores and ranks cases against each
//!   other using the weighted Case Feature Record similarity formula.
//!
//! ## Library usage
//!
//! ```no_run
//! use proethica_core::config::PipelineConfig;
//! use proethica_core::store::StagingStore;
//! use proethica_core::parser::parse_document;
//!
//! let store = StagingStore::memory_only();
//! let config = PipelineConfig::default();
//! let doc = parse_document("Facts\nAn engineer signed a set of plans.\n");
//! assert!(!doc.is_empty());
//! let _ = config;
//! let _ = store;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod feature;
pub mod graph;
pub mod llm;
pub mod model;
pub mod ontology;
pub mod parser;
pub mod pipeline;
pub mod precedent;
pub mod provenance;
pub mod retry;
pub mod store;
