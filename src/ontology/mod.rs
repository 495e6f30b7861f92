//! Ontology Gateway (§4.3).
//!
//! A thin, retrying HTTP client over the professional-ethics ontology
//! service, with a short-TTL cache for category listings and a closed
//! propose-class path for `new_candidate` matches when the service is down.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{OntologyError, ProEthicaResult};
use crate::retry::with_backoff;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OntologyClass {
    pub uri: String,
    pub label: String,
    pub definition: String,
    pub parent_uri: Option<String>,
    pub category: String,
}

/// The Ontology Gateway's external operations (§4.3.2).
pub trait OntologyGateway: Send + Sync {
    fn get_classes(&self, category: &str) -> ProEthicaResult<Vec<OntologyClass>>;
    fn search_classes(&self, category: &str, query: &str) -> ProEthicaResult<Vec<OntologyClass>>;
    fn get_class(&self, uri: &str) -> ProEthicaResult<OntologyClass>;
    fn propose_class(&self, category: &str, label: &str, definition: &str) -> ProEthicaResult<OntologyClass>;
    fn health_check(&self) -> bool;
}

struct CacheEntry {
    fetched_at: Instant,
    classes: Vec<OntologyClass>,
}

/// HTTP-backed gateway with bounded exponential backoff on transient
/// failures and a short-TTL in-memory cache for `get_classes` results.
pub struct HttpOntologyGateway {
    endpoint: String,
    agent: ureq::Agent,
    max_retries: u32,
    cache_ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl HttpOntologyGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, max_retries: u32, cache_ttl: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            endpoint: endpoint.into(),
            agent,
            max_retries,
            cache_ttl,
            cache: DashMap::new(),
        }
    }

    fn get(&self, path: &str) -> Result<ureq::Response, String> {
        with_backoff(self.max_retries, |_attempt| {
            self.agent
                .get(&format!("{}{}", self.endpoint, path))
                .call()
                .map_err(|e| e.to_string())
        })
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<ureq::Response, String> {
        with_backoff(self.max_retries, |_attempt| {
            self.agent
                .post(&format!("{}{}", self.endpoint, path))
                .send_json(body.clone())
                .map_err(|e| e.to_string())
        })
    }
}

impl OntologyGateway for HttpOntologyGateway {
    fn get_classes(&self, category: &str) -> ProEthicaResult<Vec<OntologyClass>> {
        if let Some(entry) = self.cache.get(category) {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return Ok(entry.classes.clone());
            }
        }
        let resp = self
            .get(&format!("/classes?category={category}"))
            .map_err(|message| OntologyError::Unavailable { message })?;
        let classes: Vec<OntologyClass> = resp
            .into_json()
            .map_err(|e| OntologyError::Unavailable {
                message: format!("malformed response body: {e}"),
            })?;
        self.cache.insert(
            category.to_string(),
            CacheEntry {
                fetched_at: Instant::now(),
                classes: classes.clone(),
            },
        );
        Ok(classes)
    }

    fn search_classes(&self, category: &str, query: &str) -> ProEthicaResult<Vec<OntologyClass>> {
        let resp = self
            .get(&format!("/classes/search?category={category}&q={query}"))
            .map_err(|message| OntologyError::Unavailable { message })?;
        let classes: Vec<OntologyClass> = resp
            .into_json()
            .map_err(|e| OntologyError::Unavailable {
                message: format!("malformed response body: {e}"),
            })?;
        Ok(classes)
    }

    fn get_class(&self, uri: &str) -> ProEthicaResult<OntologyClass> {
        let resp = self
            .get(&format!("/classes/by-uri?uri={}", urlencoding_lite(uri)))
            .map_err(|message| OntologyError::Unavailable { message })?;
        if resp.status() == 404 {
            return Err(OntologyError::NotFound { uri: uri.to_string() }.into());
        }
        resp.into_json()
            .map_err(|e| OntologyError::Unavailable {
                message: format!("malformed response body: {e}"),
            }.into())
    }

    fn propose_class(&self, category: &str, label: &str, definition: &str) -> ProEthicaResult<OntologyClass> {
        if label.trim().is_empty() {
            return Err(OntologyError::InvalidCandidate {
                label: label.to_string(),
                reason: "label must not be empty".into(),
            }
            .into());
        }
        let body = serde_json::json!({
            "category": category,
            "label": label,
            "definition": definition,
        });
        let resp = self
            .post("/classes/propose", body)
            .map_err(|message| OntologyError::Unavailable { message })?;
        resp.into_json()
            .map_err(|e| OntologyError::Unavailable {
                message: format!("malformed response body: {e}"),
            }.into())
    }

    fn health_check(&self) -> bool {
        self.agent
            .get(&format!("{}/health", self.endpoint))
            .call()
            .map(|r| r.status() < 500)
            .unwrap_or(false)
    }
}

fn urlencoding_lite(s: &str) -> String {
    s.replace(':', "%3A").replace('/', "%2F").replace(' ', "%20")
}

/// In-memory ontology gateway for tests, backed by a fixed class table with
/// a `RwLock`-guarded list of proposed candidates so `propose_class` is
/// observable across calls.
pub struct MockOntologyGateway {
    classes: Vec<OntologyClass>,
    proposed: RwLock<Vec<OntologyClass>>,
    available: bool,
}

impl MockOntologyGateway {
    pub fn new(classes: Vec<OntologyClass>) -> Self {
        Self {
            classes,
            proposed: RwLock::new(Vec::new()),
            available: true,
        }
    }

    pub fn unavailable(classes: Vec<OntologyClass>) -> Self {
        Self {
            classes,
            proposed: RwLock::new(Vec::new()),
            available: false,
        }
    }

    pub fn proposed_classes(&self) -> Vec<OntologyClass> {
        self.proposed.read().unwrap().clone()
    }
}

impl OntologyGateway for MockOntologyGateway {
    fn get_classes(&self, category: &str) -> ProEthicaResult<Vec<OntologyClass>> {
        if !self.available {
            return Err(OntologyError::Unavailable {
                message: "mock gateway offline".into(),
            }
            .into());
        }
        Ok(self
            .classes
            .iter()
            .filter(|c| c.category == category)
            .cloned()
            .collect())
    }

    fn search_classes(&self, category: &str, query: &str) -> ProEthicaResult<Vec<OntologyClass>> {
        let q = query.to_lowercase();
        Ok(self
            .get_classes(category)?
            .into_iter()
            .filter(|c| c.label.to_lowercase().contains(&q))
            .collect())
    }

    fn get_class(&self, uri: &str) -> ProEthicaResult<OntologyClass> {
        self.classes
            .iter()
            .chain(self.proposed.read().unwrap().iter())
            .find(|c| c.uri == uri)
            .cloned()
            .ok_or_else(|| OntologyError::NotFound { uri: uri.to_string() }.into())
    }

    fn propose_class(&self, category: &str, label: &str, definition: &str) -> ProEthicaResult<OntologyClass> {
        if !self.available {
            return Err(OntologyError::Unavailable {
                message: "mock gateway offline".into(),
            }
            .into());
        }
        if label.trim().is_empty() {
            return Err(OntologyError::InvalidCandidate {
                label: label.to_string(),
                reason: "label must not be empty".into(),
            }
            .into());
        }
        let uri = format!(
            "urn:proethica:candidate:{category}:{}",
            label.to_lowercase().replace(' ', "_")
        );
        let class = OntologyClass {
            uri,
            label: label.to_string(),
            definition: definition.to_string(),
            parent_uri: None,
            category: category.to_string(),
        };
        self.proposed.write().unwrap().push(class.clone());
        Ok(class)
    }

    fn health_check(&self) -> bool {
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> OntologyClass {
        OntologyClass {
            uri: "urn:proethica:Engineer".into(),
            label: "Engineer".into(),
            definition: "A licensed professional engineer".into(),
            parent_uri: None,
            category: "role".into(),
        }
    }

    #[test]
    fn get_classes_filters_by_category() {
        let gw = MockOntologyGateway::new(vec![sample_class()]);
        assert_eq!(gw.get_classes("role").unwrap().len(), 1);
        assert_eq!(gw.get_classes("principle").unwrap().len(), 0);
    }

    #[test]
    fn propose_class_rejects_empty_label() {
        let gw = MockOntologyGateway::new(vec![]);
        assert!(gw.propose_class("role", "", "definition").is_err());
    }

    #[test]
    fn propose_class_is_retrievable_afterward() {
        let gw = MockOntologyGateway::new(vec![]);
        let proposed = gw.propose_class("role", "Whistleblower", "one who reports misconduct").unwrap();
        let fetched = gw.get_class(&proposed.uri).unwrap();
        assert_eq!(fetched.label, "Whistleblower");
    }

    #[test]
    fn unavailable_gateway_surfaces_soft_error() {
        let gw = MockOntologyGateway::unavailable(vec![sample_class()]);
        assert!(gw.get_classes("role").is_err());
        assert!(!gw.health_check());
    }
}
