//! Published-entity RDF mirror (§2, §6, §10.4 ambient stack).
//!
//! spec.md explicitly keeps RDF serialization out of scope ("generation of
//! that serialization is not part of the core") — what the core *does* own
//! is keeping the "temporary RDF store" language literal: every published
//! draft is additionally represented as RDF triples in an `oxigraph` store,
//! ready for an external exporter to read. Drafts themselves live in the
//! `redb`-backed [`crate::store`]; this module is the mirror, not the
//! source of truth.

pub mod sparql;

pub use sparql::PublishedGraph;
