//! `oxigraph`-backed RDF mirror of published draft entities.
//!
//! A thin wrapper around `oxigraph`'s `Store` that turns one domain record
//! into a handful of triples and exposes `SELECT`/`ASK` passthrough for
//! anything an external exporter wants to query later.

use oxigraph::model::{GraphNameRef, NamedNode, Quad};
use oxigraph::sparql::QueryResults;
use oxigraph::store::Store;

use crate::error::GraphError;
use crate::store::DraftEntity;

type GraphResult<T> = std::result::Result<T, GraphError>;

/// IRI namespace for draft/published entities.
const ENTITY_NS: &str = "https://proethica.org/entity/";
/// IRI namespace for case named graphs — each case's published entities
/// live in their own named graph so `invalidate`/re-mirror can `DROP` just
/// that case's triples.
const CASE_NS: &str = "https://proethica.org/case/";

const RDF_TYPE: &str = "https://proethica.org/vocab/type";
const RDF_LABEL: &str = "https://proethica.org/vocab/label";
const RDF_DEFINITION: &str = "https://proethica.org/vocab/definition";
const RDF_INSTANCE_OF: &str = "https://proethica.org/vocab/instanceOf";

/// RDF mirror of published draft entities, keyed by case (§4.4, §6).
pub struct PublishedGraph {
    store: Store,
}

impl PublishedGraph {
    pub fn in_memory() -> GraphResult<Self> {
        let store = Store::new().map_err(|e| GraphError::Sparql {
            message: format!("failed to create oxigraph store: {e}"),
        })?;
        Ok(Self { store })
    }

    pub fn open(path: &std::path::Path) -> GraphResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| GraphError::Sparql {
            message: format!("failed to create oxigraph directory: {e}"),
        })?;
        let store = Store::open(path).map_err(|e| GraphError::Sparql {
            message: format!("failed to open oxigraph store at {}: {e}", path.display()),
        })?;
        Ok(Self { store })
    }

    fn entity_iri(draft_id: &str) -> NamedNode {
        NamedNode::new(format!("{ENTITY_NS}{draft_id}")).expect("valid IRI")
    }

    fn case_graph(case_id: &str) -> NamedNode {
        NamedNode::new(format!("{CASE_NS}{case_id}")).expect("valid IRI")
    }

    /// Mirror one published draft as RDF triples in its case's named graph.
    /// Called once per newly-published draft; re-mirroring the same draft
    /// id overwrites its triples.
    pub fn mirror_published(&self, draft: &DraftEntity) -> GraphResult<()> {
        let subject = Self::entity_iri(&draft.draft_id.to_string());
        let graph = Self::case_graph(&draft.case_id.0);
        let graph_ref = graph.as_ref();

        let type_pred = NamedNode::new(RDF_TYPE).expect("valid IRI");
        let type_obj = NamedNode::new(format!("{ENTITY_NS}concept/{}", draft.concept_type.as_str())).expect("valid IRI");
        self.insert(Quad::new(subject.clone(), type_pred, type_obj, graph_ref))?;

        let label_pred = NamedNode::new(RDF_LABEL).expect("valid IRI");
        let label_obj = oxigraph::model::Literal::new_simple_literal(&draft.label);
        self.insert(Quad::new(subject.clone(), label_pred, label_obj, graph_ref))?;

        let def_pred = NamedNode::new(RDF_DEFINITION).expect("valid IRI");
        let def_obj = oxigraph::model::Literal::new_simple_literal(&draft.definition);
        self.insert(Quad::new(subject.clone(), def_pred, def_obj, graph_ref))?;

        if let Some(uri) = &draft.matched_ontology_uri {
            if let Ok(class_node) = NamedNode::new(uri) {
                let pred = NamedNode::new(RDF_INSTANCE_OF).expect("valid IRI");
                self.insert(Quad::new(subject, pred, class_node, graph_ref))?;
            }
        }
        Ok(())
    }

    fn insert(&self, quad: Quad) -> GraphResult<()> {
        self.store.insert(&quad).map_err(|e| GraphError::Sparql {
            message: format!("insert failed: {e}"),
        })?;
        Ok(())
    }

    /// Drop every triple mirrored for a case, e.g. before re-mirroring after
    /// an unpublish/reconcile pass.
    pub fn invalidate_case(&self, case_id: &str) -> GraphResult<()> {
        let graph_iri = Self::case_graph(case_id);
        self.store
            .update(&format!("DROP GRAPH <{}>", graph_iri.as_str()))
            .map_err(|e| GraphError::Sparql {
                message: format!("failed to drop graph for case {case_id}: {e}"),
            })?;
        Ok(())
    }

    pub fn query_select(&self, sparql: &str) -> GraphResult<Vec<Vec<(String, String)>>> {
        let results = self.store.query(sparql).map_err(|e| GraphError::Sparql {
            message: format!("SPARQL query failed: {e}"),
        })?;
        match results {
            QueryResults::Solutions(solutions) => {
                let mut rows = Vec::new();
                for solution in solutions {
                    let solution = solution.map_err(|e| GraphError::Sparql {
                        message: format!("solution error: {e}"),
                    })?;
                    rows.push(solution.iter().map(|(v, t)| (v.to_string(), t.to_string())).collect());
                }
                Ok(rows)
            }
            QueryResults::Boolean(b) => Ok(vec![vec![("result".to_string(), b.to_string())]]),
            QueryResults::Graph(_) => Err(GraphError::Sparql {
                message: "CONSTRUCT/DESCRIBE queries not supported via query_select".into(),
            }),
        }
    }

    pub fn query_ask(&self, sparql: &str) -> GraphResult<bool> {
        match self.store.query(sparql).map_err(|e| GraphError::Sparql {
            message: format!("SPARQL query failed: {e}"),
        })? {
            QueryResults::Boolean(b) => Ok(b),
            _ => Err(GraphError::Sparql {
                message: "expected boolean result from ASK query".into(),
            }),
        }
    }

    pub fn len(&self) -> GraphResult<usize> {
        let rows = self.query_select("SELECT (COUNT(*) AS ?count) WHERE { GRAPH ?g { ?s ?p ?o } }")?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|(_, val)| val.trim_matches('"').split('^').next())
            .and_then(|s| s.trim_matches('"').parse().ok())
            .unwrap_or(0))
    }

    pub fn is_empty(&self) -> GraphResult<bool> {
        self.len().map(|n| n == 0)
    }
}

impl std::fmt::Debug for PublishedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedGraph").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseId, ConceptType, DraftId, EntityKind, Pass, SectionType, SessionId, Step};

    fn draft() -> DraftEntity {
        DraftEntity {
            draft_id: DraftId::new(1).unwrap(),
            case_id: CaseId::from("case-1"),
            extraction_session_id: SessionId::new(1).unwrap(),
            step: Step::Contextual,
            pass: Pass::One,
            concept_type: ConceptType::Role,
            kind: EntityKind::Individual,
            label: "Engineer T".into(),
            definition: "the respondent engineer".into(),
            source_section: Some(SectionType::Facts),
            source_text_spans: vec!["span".into()],
            matched_ontology_uri: Some("urn:proethica:Engineer".into()),
            match_confidence: Some(0.9),
            match_method: Some(crate::model::MatchMethod::Embedding),
            is_board_choice: false,
            is_published: true,
            published_at: Some(0),
            created_at: 0,
        }
    }

    #[test]
    fn mirrors_published_draft_as_triples() {
        let graph = PublishedGraph::in_memory().unwrap();
        graph.mirror_published(&draft()).unwrap();
        assert!(!graph.is_empty().unwrap());
        assert_eq!(graph.len().unwrap(), 4);
    }

    #[test]
    fn invalidate_case_drops_its_graph() {
        let graph = PublishedGraph::in_memory().unwrap();
        graph.mirror_published(&draft()).unwrap();
        graph.invalidate_case("case-1").unwrap();
        assert!(graph.is_empty().unwrap());
    }

    #[test]
    fn query_ask_finds_mirrored_subject() {
        let graph = PublishedGraph::in_memory().unwrap();
        graph.mirror_published(&draft()).unwrap();
        let iri = PublishedGraph::entity_iri("draft:1");
        let exists = graph.query_ask(&format!("ASK {{ GRAPH ?g {{ <{}> ?p ?o }} }}", iri.as_str())).unwrap();
        assert!(exists);
    }
}
