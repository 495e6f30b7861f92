//! Embedding Service (§4.2).
//!
//! Produces dense `Vec<f32>` embeddings from a priority-ordered chain of
//! providers, following each with cosine similarity. Providers are modeled
//! as trait objects with a `health_check()` method and no shared mutable
//! state, per the Design Notes' guidance on dynamic provider selection.

mod provider;

pub use provider::{DeterministicProvider, EmbeddingProvider, HttpEmbeddingProvider, ProviderHealth};

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{EmbeddingError, ProEthicaResult};

/// A single embedding vector plus the provider that produced it.
#[derive(Debug, Clone)]
pub struct EmbeddedVector {
    pub values: Vec<f32>,
    pub provider: String,
}

impl EmbeddedVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

static URI_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>\s]+>").unwrap());
static XML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());
static LEXICAL_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@[a-zA-Z-]+|\^\^[^\s]+").unwrap());

/// Normalize text before embedding: strip bracketed URI tokens, XML/RDF
/// markup, and lexical annotations (language tags, datatype suffixes), then
/// collapse whitespace and apply Unicode NFC normalization.
pub fn preprocess(text: &str) -> String {
    use unicode_normalization::UnicodeNormalization;

    let no_uris = URI_TOKEN.replace_all(text, " ");
    let no_xml = XML_TAG.replace_all(&no_uris, " ");
    let no_annotations = LEXICAL_ANNOTATION.replace_all(&no_xml, " ");
    let collapsed = no_annotations.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.nfc().collect::<String>()
}

/// Minimum preprocessed length, in characters, to consider text embeddable.
const MIN_TEXT_LEN: usize = 1;

/// Provider-chain embedding service.
pub struct EmbeddingService {
    providers: Vec<Box<dyn EmbeddingProvider>>,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(providers: Vec<Box<dyn EmbeddingProvider>>, dimension: usize) -> Self {
        Self { providers, dimension }
    }

    /// Health-check every provider in priority order without embedding anything.
    pub fn health_report(&self) -> Vec<(String, ProviderHealth)> {
        self.providers
            .iter()
            .map(|p| (p.name().to_string(), p.health_check()))
            .collect()
    }

    pub fn embed(&self, text: &str) -> ProEthicaResult<EmbeddedVector> {
        Ok(self.embed_batch(&[text.to_string()])?.into_iter().next().unwrap())
    }

    /// Embed a batch of texts, trying providers in priority order. The whole
    /// batch goes to one provider — no mixing of providers within a batch,
    /// so downstream similarity comparisons stay apples-to-apples.
    pub fn embed_batch(&self, texts: &[String]) -> ProEthicaResult<Vec<EmbeddedVector>> {
        let prepared: Vec<String> = texts.iter().map(|t| preprocess(t)).collect();
        if prepared.iter().any(|t| t.chars().count() < MIN_TEXT_LEN) {
            return Err(EmbeddingError::EmptyInput.into());
        }

        for provider in &self.providers {
            match provider.embed_batch(&prepared) {
                Ok(vectors) => {
                    for v in &vectors {
                        if v.len() != self.dimension {
                            return Err(EmbeddingError::DimensionMismatch {
                                provider: provider.name().to_string(),
                                expected: self.dimension,
                                actual: v.len(),
                            }
                            .into());
                        }
                    }
                    return Ok(vectors
                        .into_iter()
                        .map(|values| EmbeddedVector {
                            values,
                            provider: provider.name().to_string(),
                        })
                        .collect());
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "embedding provider failed, trying next");
                    continue;
                }
            }
        }
        Err(EmbeddingError::ProviderUnavailable.into())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 if either
/// vector has zero magnitude (rather than dividing by zero).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Search a list of candidate vectors for the `top_k` most similar to `query`,
/// sorted by descending similarity.
pub fn search<'a>(query: &[f32], candidates: &'a [(String, Vec<f32>)], top_k: usize) -> Vec<(&'a str, f32)> {
    let mut scored: Vec<(&str, f32)> = candidates
        .iter()
        .map(|(id, vec)| (id.as_str(), cosine_similarity(query, vec)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_strips_uri_tokens_and_annotations() {
        let out = preprocess("See <http://example.org/Engineer> and \"value\"@en and \"x\"^^xsd:string");
        assert!(!out.contains("http://"));
        assert!(!out.contains("@en"));
        assert!(!out.contains("^^"));
    }

    #[test]
    fn preprocess_strips_xml_tags() {
        let out = preprocess("<b>Engineer</b> owes a <i>duty</i> of care");
        assert!(!out.contains('<'));
        assert!(out.contains("Engineer"));
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn embed_batch_rejects_empty_text() {
        let service = EmbeddingService::new(
            vec![Box::new(DeterministicProvider::new("det", 8))],
            8,
        );
        let result = service.embed_batch(&["   ".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn embed_falls_through_chain_on_provider_failure() {
        let service = EmbeddingService::new(
            vec![
                Box::new(provider::AlwaysFailProvider::new("broken")),
                Box::new(DeterministicProvider::new("det", 8)),
            ],
            8,
        );
        let v = service.embed("duty of care").unwrap();
        assert_eq!(v.provider, "det");
        assert_eq!(v.dimension(), 8);
    }
}
