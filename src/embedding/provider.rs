//! Embedding provider implementations.
//!
//! Each provider is a self-contained record with a `health_check()` method;
//! the chain in [`super::EmbeddingService`] holds no shared mutable state
//! across providers, so providers can be probed independently and in
//! parallel if a caller wants to.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::Deserialize;

use crate::error::EmbeddingError;

/// Outcome of probing a provider without performing real work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHealth {
    Healthy,
    Unreachable,
}

/// A source of dense embeddings. Implementations may call out to an HTTP
/// endpoint, a local model, or (for tests) a deterministic hash function.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn health_check(&self) -> ProviderHealth;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// HTTP-backed embedding provider, calling a REST endpoint that accepts a
/// batch of strings and returns a batch of float vectors, generalized to an
/// arbitrary embedding endpoint rather than one fixed to a single vendor.
pub struct HttpEmbeddingProvider {
    name: String,
    endpoint: String,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            agent,
        }
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn health_check(&self) -> ProviderHealth {
        match self.agent.get(&format!("{}/health", self.endpoint)).call() {
            Ok(resp) if resp.status() < 500 => ProviderHealth::Healthy,
            _ => ProviderHealth::Unreachable,
        }
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "input": texts });
        let resp = self
            .agent
            .post(&format!("{}/embeddings", self.endpoint))
            .send_json(body)
            .map_err(|_| EmbeddingError::ProviderUnavailable)?;
        let parsed: EmbedResponse = resp
            .into_json()
            .map_err(|_| EmbeddingError::ProviderUnavailable)?;
        Ok(parsed.embeddings)
    }
}

/// Deterministic embedding provider for tests and offline fixtures: hashes
/// each whitespace token into a fixed-dimension vector so identical inputs
/// always produce identical vectors without any network access.
pub struct DeterministicProvider {
    name: String,
    dimension: usize,
}

impl DeterministicProvider {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dimension;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vec[idx] += sign;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }
}

impl EmbeddingProvider for DeterministicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn health_check(&self) -> ProviderHealth {
        ProviderHealth::Healthy
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Test-only provider that always fails, used to exercise the priority-chain
/// fallback path.
#[cfg(test)]
pub(crate) struct AlwaysFailProvider {
    name: String,
}

#[cfg(test)]
impl AlwaysFailProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(test)]
impl EmbeddingProvider for AlwaysFailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn health_check(&self) -> ProviderHealth {
        ProviderHealth::Unreachable
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::ProviderUnavailable)
    }
}
