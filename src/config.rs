//! Pipeline configuration.
//!
//! A single `PipelineConfig`, loaded from an optional TOML file with
//! programmatic overrides winning over file values and file values winning
//! over built-in defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProEthicaResult};

/// Pass-2 merge policy for deduplicated extraction candidates (Open Question 1).
/// Only one variant exists today; the enum keeps the policy point visible and
/// swappable rather than hard-coding the behavior inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Always extend the matched span to cover both occurrences; replace the
    /// stored definition only if the new one is strictly longer.
    ExtendSpansReplaceIfLonger,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::ExtendSpansReplaceIfLonger
    }
}

/// Component weights for the precedent similarity formula (§4.7.1).
/// Field names match the configuration table in §6/§4.7.1 exactly. Normalized
/// to sum to 1.0 before use; all-zero is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub role_weight: f32,
    pub principle_weight: f32,
    pub obligation_weight: f32,
    pub state_weight: f32,
    pub resource_weight: f32,
    pub action_weight: f32,
    pub event_weight: f32,
    pub capability_weight: f32,
    pub constraint_weight: f32,
    pub provision_overlap_weight: f32,
    pub outcome_alignment_weight: f32,
    pub tag_overlap_weight: f32,
    pub cited_case_overlap_weight: f32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            role_weight: 0.08,
            principle_weight: 0.12,
            obligation_weight: 0.12,
            state_weight: 0.06,
            resource_weight: 0.04,
            action_weight: 0.10,
            event_weight: 0.06,
            capability_weight: 0.04,
            constraint_weight: 0.04,
            provision_overlap_weight: 0.14,
            outcome_alignment_weight: 0.08,
            tag_overlap_weight: 0.06,
            cited_case_overlap_weight: 0.06,
        }
    }
}

impl Weights {
    /// The nine embedding-component weights, in D-tuple order (R, P, O, S,
    /// Rs, A, E, Ca, Cs) — the subset redistributed when a component
    /// embedding is missing (§4.7.1, Scenario F).
    pub fn embedding_weights(&self) -> [f32; 9] {
        [
            self.role_weight,
            self.principle_weight,
            self.obligation_weight,
            self.state_weight,
            self.resource_weight,
            self.action_weight,
            self.event_weight,
            self.capability_weight,
            self.constraint_weight,
        ]
    }

    pub fn sum(&self) -> f32 {
        self.as_array().iter().sum()
    }

    /// Validate and return a copy normalized to sum to 1.0.
    pub fn normalized(&self) -> ProEthicaResult<Self> {
        let total = self.sum();
        if total <= 0.0 {
            return Err(ConfigError::InvalidWeights {
                message: "all weights are zero or negative".into(),
            }
            .into());
        }
        if self.as_array().iter().any(|w| *w < 0.0) {
            return Err(ConfigError::InvalidWeights {
                message: "weights must be nonnegative".into(),
            }
            .into());
        }
        Ok(Self {
            role_weight: self.role_weight / total,
            principle_weight: self.principle_weight / total,
            obligation_weight: self.obligation_weight / total,
            state_weight: self.state_weight / total,
            resource_weight: self.resource_weight / total,
            action_weight: self.action_weight / total,
            event_weight: self.event_weight / total,
            capability_weight: self.capability_weight / total,
            constraint_weight: self.constraint_weight / total,
            provision_overlap_weight: self.provision_overlap_weight / total,
            outcome_alignment_weight: self.outcome_alignment_weight / total,
            tag_overlap_weight: self.tag_overlap_weight / total,
            cited_case_overlap_weight: self.cited_case_overlap_weight / total,
        })
    }

    fn as_array(&self) -> [f32; 13] {
        [
            self.role_weight,
            self.principle_weight,
            self.obligation_weight,
            self.state_weight,
            self.resource_weight,
            self.action_weight,
            self.event_weight,
            self.capability_weight,
            self.constraint_weight,
            self.provision_overlap_weight,
            self.outcome_alignment_weight,
            self.tag_overlap_weight,
            self.cited_case_overlap_weight,
        ]
    }
}

/// Embedding provider priority configuration — an ordered list of provider
/// names tried in sequence until one succeeds (§9 Design Notes, "dynamic
/// provider selection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider_priority: Vec<String>,
    pub dimension: usize,
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec!["primary".into(), "fallback".into()],
            dimension: 384,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model_id: String,
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_id: "llama3.1:70b".into(),
            endpoint: "http://localhost:11434".into(),
            request_timeout_secs: 60,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyConfig {
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub cache_ttl_secs: u64,
}

impl Default for OntologyConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/ontology".into(),
            request_timeout_secs: 5,
            max_retries: 2,
            cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub weights: Weights,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub ontology: OntologyConfig,
    pub merge_policy: MergePolicy,
    /// Number of repair retries allowed when an LLM response fails to parse (§4.5.2).
    pub parse_repair_retries: u32,
    /// Minimum cosine similarity for an embedding-based class match (§4.5.2 step 5).
    pub class_match_threshold: f32,
    /// Upper bound on concurrently running extraction cells per case (§5).
    pub max_concurrent_cells_per_case: usize,
    /// Directory for durable storage; `None` means in-memory only (tests).
    pub data_dir: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            ontology: OntologyConfig::default(),
            merge_policy: MergePolicy::default(),
            parse_repair_retries: 1,
            class_match_threshold: 0.75,
            max_concurrent_cells_per_case: 3,
            data_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits. Programmatic callers should mutate the returned struct
    /// to apply overrides that take precedence over the file.
    pub fn load_from_file(path: &Path) -> ProEthicaResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProEthicaResult<()> {
        self.weights.normalized()?;
        if !(0.0..=1.0).contains(&self.class_match_threshold) {
            return Err(ConfigError::InvalidThreshold {
                name: "class_match_threshold".into(),
                message: format!("{} is outside [0.0, 1.0]", self.class_match_threshold),
            }
            .into());
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn ontology_timeout(&self) -> Duration {
        Duration::from_secs(self.ontology.request_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_close_to_one() {
        let w = Weights::default();
        assert!((w.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_zero_weights_rejected() {
        let w = Weights {
            role_weight: 0.0,
            principle_weight: 0.0,
            obligation_weight: 0.0,
            state_weight: 0.0,
            resource_weight: 0.0,
            action_weight: 0.0,
            event_weight: 0.0,
            capability_weight: 0.0,
            constraint_weight: 0.0,
            provision_overlap_weight: 0.0,
            outcome_alignment_weight: 0.0,
            tag_overlap_weight: 0.0,
            cited_case_overlap_weight: 0.0,
        };
        assert!(w.normalized().is_err());
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let w = Weights {
            role_weight: 2.0,
            principle_weight: 2.0,
            ..Weights::default()
        };
        let n = w.normalized().unwrap();
        assert!((n.sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn default_pipeline_config_validates() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_threshold_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.class_match_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
