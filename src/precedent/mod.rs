//! Precedent Engine (§4.7): scores and ranks cases against each other using
//! the weighted Case Feature Record similarity formula, with an in-memory
//! pairwise cache keyed by the cases' feature versions and the active
//! weights (§4.7.3).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;

use crate::config::Weights;
use crate::embedding::cosine_similarity;
use crate::error::{PrecedentError, ProEthicaResult};
use crate::feature::{CaseFeatureRecord, FeatureStore};
use crate::model::{CaseId, ConceptType, Outcome, TransformationType};

/// Per-component contributions to one pair's overall score (§4.7.1), broken
/// out so a caller can explain a ranking rather than just see the total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerComponentScores {
    pub role: Option<f32>,
    pub principle: Option<f32>,
    pub obligation: Option<f32>,
    pub state: Option<f32>,
    pub resource: Option<f32>,
    pub action: Option<f32>,
    pub event: Option<f32>,
    pub capability: Option<f32>,
    pub constraint: Option<f32>,
    pub provision_overlap: f32,
    pub outcome_alignment: f32,
    pub tag_overlap: f32,
    pub cited_case_overlap: f32,
}

impl PerComponentScores {
    fn slot(&self, concept_type: ConceptType) -> Option<f32> {
        match concept_type {
            ConceptType::Role => self.role,
            ConceptType::Principle => self.principle,
            ConceptType::Obligation => self.obligation,
            ConceptType::State => self.state,
            ConceptType::Resource => self.resource,
            ConceptType::Action => self.action,
            ConceptType::Event => self.event,
            ConceptType::Capability => self.capability,
            ConceptType::Constraint => self.constraint,
            other => panic!("{other} is not a D-tuple component"),
        }
    }

    fn slot_mut(&mut self, concept_type: ConceptType) -> &mut Option<f32> {
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

/// Tie-break order for equal overall scores (§4.7.2): Principle, Obligation,
/// Action, Role, Event, State, Resource, Capability, Constraint, then
/// case_id ascending.
const TIE_BREAK_ORDER: [ConceptType; 9] = [
    ConceptType::Principle,
    ConceptType::Obligation,
    ConceptType::Action,
    ConceptType::Role,
    ConceptType::Event,
    ConceptType::State,
    ConceptType::Resource,
    ConceptType::Capability,
    ConceptType::Constraint,
];

/// One case's similarity to the query case, returned by [`PrecedentEngine::neighbors`].
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborResult {
    pub case_id: CaseId,
    pub score: f32,
    pub components: PerComponentScores,
}

/// Restricts the candidate set `neighbors` considers (§4.7.2).
#[derive(Debug, Clone, Default)]
pub struct NeighborFilter {
    pub min_overall: Option<f32>,
    pub outcomes: Option<HashSet<Outcome>>,
    pub required_provision: Option<String>,
    pub transformation_type: Option<TransformationType>,
}

impl NeighborFilter {
    fn matches(&self, record: &CaseFeatureRecord) -> bool {
        if let Some(outcomes) = &self.outcomes {
            if !outcomes.contains(&record.outcome) {
                return false;
            }
        }
        if let Some(provision) = &self.required_provision {
            if !record.provisions_cited.iter().any(|p| p == provision) {
                return false;
            }
        }
        if let Some(transformation_type) = self.transformation_type {
            let matches = record
                .transformation
                .as_ref()
                .is_some_and(|t| t.transformation_type == transformation_type);
            if !matches {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
struct CachedScore {
    weights_hash: u64,
    version_a: u32,
    version_b: u32,
    score: f32,
    components: PerComponentScores,
}

fn pair_key(a: &CaseId, b: &CaseId) -> (CaseId, CaseId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn weights_hash(weights: &Weights) -> u64 {
    let bytes = bincode::serialize(weights).expect("Weights serializes infallibly");
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Jaccard overlap of two string sets (§4.7.1). An empty union carries no
/// overlap signal either way, so it scores 0.0 rather than dividing by zero.
fn jaccard(a: &[String], b: &[String]) -> f32 {
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f32 / union as f32
}

/// Scores and ranks Case Feature Records against each other (§4.7).
pub struct PrecedentEngine<'a> {
    features: &'a FeatureStore,
    weights: Weights,
    cache: DashMap<(CaseId, CaseId), CachedScore>,
}

impl<'a> PrecedentEngine<'a> {
    /// `weights` must already be normalized (§4.7.1); construction fails the
    /// same way `Weights::normalized` does if it isn't.
    pub fn new(features: &'a FeatureStore, weights: Weights) -> ProEthicaResult<Self> {
        let weights = weights.normalized()?;
        Ok(Self {
            features,
            weights,
            cache: DashMap::new(),
        })
    }

    /// Rank every other case with a feature record against `case_id`,
    /// returning at most `k` results after applying `filter` (§4.7.2
    /// `neighbors`).
    pub fn neighbors(&self, case_id: &CaseId, k: usize, filter: &NeighborFilter) -> ProEthicaResult<Vec<NeighborResult>> {
        let query = self
            .features
            .get(case_id)
            .ok_or_else(|| PrecedentError::CaseNotFound {
                case_id: case_id.to_string(),
            })?;

        let mut results = Vec::new();
        for other_id in self.features.all_case_ids() {
            if &other_id == case_id {
                continue;
            }
            let Some(other) = self.features.get(&other_id) else { continue };
            if !filter.matches(&other) {
                continue;
            }
            let (score, components) = self.score_pair(&query, &other);
            if let Some(min) = filter.min_overall {
                if score < min {
                    continue;
                }
            }
            results.push(NeighborResult {
                case_id: other_id,
                score,
                components,
            });
        }

        results.sort_by(|a, b| compare_ranked(a, b));
        results.truncate(k);
        Ok(results)
    }

    /// Force a fresh computation of the pair's score, refreshing the cache
    /// entry regardless of what was cached before (§4.7.2 `recompute_pair`).
    pub fn recompute_pair(&self, a: &CaseId, b: &CaseId) -> ProEthicaResult<f32> {
        let record_a = self.features.get(a).ok_or_else(|| PrecedentError::CaseNotFound {
            case_id: a.to_string(),
        })?;
        let record_b = self.features.get(b).ok_or_else(|| PrecedentError::CaseNotFound {
            case_id: b.to_string(),
        })?;
        let (score, components) = self.compute(&record_a, &record_b);
        self.cache.insert(
            pair_key(a, b),
            CachedScore {
                weights_hash: weights_hash(&self.weights),
                version_a: record_a.features_version,
                version_b: record_b.features_version,
                score,
                components,
            },
        );
        Ok(score)
    }

    /// Drop every cached pair involving `case_id` (§4.4 "Callers are
    /// responsible for invalidating any derived Case Feature Record",
    /// §4.7.3). Call this after unpublishing a draft or rebuilding features.
    pub fn invalidate(&self, case_id: &CaseId) {
        self.cache.retain(|(a, b), _| a != case_id && b != case_id);
    }

    fn score_pair(&self, a: &CaseFeatureRecord, b: &CaseFeatureRecord) -> (f32, PerComponentScores) {
        let key = pair_key(&a.case_id, &b.case_id);
        let hash = weights_hash(&self.weights);
        if let Some(cached) = self.cache.get(&key) {
            if cached.weights_hash == hash && cached.version_a == a.features_version && cached.version_b == b.features_version {
                return (cached.score, cached.components.clone());
            }
        }
        let (score, components) = self.compute(a, b);
        self.cache.insert(
            key,
            CachedScore {
                weights_hash: hash,
                version_a: a.features_version,
                version_b: b.features_version,
                score,
                components: components.clone(),
            },
        );
        (score, components)
    }

    /// The similarity formula itself (§4.7.1): cosine similarity per present
    /// D-tuple component, weight-redistributed over the components present
    /// in both records, plus provision/tag/cited-case Jaccard overlap and
    /// outcome alignment. The final total is clamped to `[0.0, 1.0]`
    /// (testable property 6); no per-component rectification is applied.
    fn compute(&self, a: &CaseFeatureRecord, b: &CaseFeatureRecord) -> (f32, PerComponentScores) {
        let embedding_weights = self.weights.embedding_weights();
        let embedding_budget: f32 = embedding_weights.iter().sum();

        let a_components = a.component_embeddings.as_array();
        let b_components = b.component_embeddings.as_array();

        let mut present_weight_sum = 0.0f32;
        let mut present = [false; 9];
        for i in 0..9 {
            if a_components[i].is_some() && b_components[i].is_some() {
                present[i] = true;
                present_weight_sum += embedding_weights[i];
            }
        }
        let redistribution_scale = if present_weight_sum > 0.0 {
            embedding_budget / present_weight_sum
        } else {
            0.0
        };

        let mut components = PerComponentScores::default();
        let mut total = 0.0f32;
        for (i, concept_type) in ConceptType::D_TUPLE.iter().enumerate() {
            if !present[i] {
                continue;
            }
            let va = a_components[i].as_ref().unwrap();
            let vb = b_components[i].as_ref().unwrap();
            let similarity = cosine_similarity(va, vb);
            *components.slot_mut(*concept_type) = Some(similarity);
            let redistributed_weight = embedding_weights[i] * redistribution_scale;
            total += similarity * redistributed_weight;
        }

        components.provision_overlap = jaccard(&a.provisions_cited, &b.provisions_cited);
        components.outcome_alignment = a.outcome.align(b.outcome);
        components.tag_overlap = jaccard(&a.subject_tags, &b.subject_tags);
        components.cited_case_overlap = jaccard(&a.cited_case_numbers, &b.cited_case_numbers);

        total += components.provision_overlap * self.weights.provision_overlap_weight;
        total += components.outcome_alignment * self.weights.outcome_alignment_weight;
        total += components.tag_overlap * self.weights.tag_overlap_weight;
        total += components.cited_case_overlap * self.weights.cited_case_overlap_weight;

        (total.clamp(0.0, 1.0), components)
    }
}

fn compare_ranked(a: &NeighborResult, b: &NeighborResult) -> std::cmp::Ordering {
    if let Some(ord) = b.score.partial_cmp(&a.score) {
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    for concept_type in TIE_BREAK_ORDER {
        let sa = a.components.slot(concept_type).unwrap_or(0.0);
        let sb = b.components.slot(concept_type).unwrap_or(0.0);
        if let Some(ord) = sb.partial_cmp(&sa) {
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
    }
    a.case_id.cmp(&b.case_id)
}
