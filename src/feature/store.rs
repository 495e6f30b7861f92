//! Persistence for [`super::CaseFeatureRecord`] (§4.6 `build`/`get`).
//!
//! Mirrors the Staging Store's mem/durable split: an in-memory `DashMap`
//! keyed by case ID, mirrored into a dedicated `redb` table when a
//! `data_dir` is configured so a built feature record survives a restart
//! without forcing a rebuild.

use std::path::Path;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{ProEthicaResult, StoreError};
use crate::model::CaseId;

use super::CaseFeatureRecord;

const FEATURES: TableDefinition<&str, &[u8]> = TableDefinition::new("case_features");

/// Store for built Case Feature Records, separate from the Staging Store's
/// draft/session tables since features are a derived, fully-replaceable
/// cache rather than append-only provenance.
pub struct FeatureStore {
    mem: DashMap<CaseId, CaseFeatureRecord>,
    db: Option<Database>,
}

impl FeatureStore {
    pub fn memory_only() -> Self {
        Self {
            mem: DashMap::new(),
            db: None,
        }
    }

    pub fn open(data_dir: &Path) -> ProEthicaResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("proethica-features.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        let mem = DashMap::new();
        let txn = db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let table = txn.open_table(FEATURES).map_err(|e| StoreError::Redb {
                message: format!("open_table(case_features) failed: {e}"),
            })?;
            for entry in table.iter().map_err(|e| StoreError::Redb {
                message: format!("iter failed: {e}"),
            })? {
                let (k, v) = entry.map_err(|e| StoreError::Redb {
                    message: format!("iter entry failed: {e}"),
                })?;
                let record: CaseFeatureRecord =
                    bincode::deserialize(v.value()).map_err(|e| StoreError::Serialization {
                        message: format!("failed to decode case feature record: {e}"),
                    })?;
                mem.insert(CaseId::from(k.value().to_string()), record);
            }
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;

        Ok(Self { mem, db: Some(db) })
    }

    /// Replace `case_id`'s feature record (§4.6 `build` is a full rebuild,
    /// never a partial merge — stale fields from a previous build never
    /// survive into the new one).
    pub fn put(&self, record: CaseFeatureRecord) -> ProEthicaResult<()> {
        let case_id = record.case_id.clone();
        if let Some(db) = &self.db {
            let bytes = bincode::serialize(&record).map_err(|e| StoreError::Serialization {
                message: format!("failed to encode case feature record: {e}"),
            })?;
            let txn = db.begin_write().map_err(|e| StoreError::Redb {
                message: format!("begin_write failed: {e}"),
            })?;
            {
                let mut table = txn.open_table(FEATURES).map_err(|e| StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                })?;
                table.insert(case_id.0.as_str(), bytes.as_slice()).map_err(|e| StoreError::Redb {
                    message: format!("insert failed: {e}"),
                })?;
            }
            txn.commit().map_err(|e| StoreError::Redb {
                message: format!("commit failed: {e}"),
            })?;
        }
        self.mem.insert(case_id, record);
        Ok(())
    }

    pub fn get(&self, case_id: &CaseId) -> Option<CaseFeatureRecord> {
        self.mem.get(case_id).map(|r| r.clone())
    }

    pub fn remove(&self, case_id: &CaseId) -> ProEthicaResult<()> {
        self.mem.remove(case_id);
        if let Some(db) = &self.db {
            let txn = db.begin_write().map_err(|e| StoreError::Redb {
                message: format!("begin_write failed: {e}"),
            })?;
            {
                let mut table = txn.open_table(FEATURES).map_err(|e| StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                })?;
                table.remove(case_id.0.as_str()).map_err(|e| StoreError::Redb {
                    message: format!("remove failed: {e}"),
                })?;
            }
            txn.commit().map_err(|e| StoreError::Redb {
                message: format!("commit failed: {e}"),
            })?;
        }
        Ok(())
    }

    pub fn all_case_ids(&self) -> Vec<CaseId> {
        self.mem.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore").field("cases", &self.mem.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::ComponentEmbeddings;
    use crate::model::Outcome;
    use tempfile::TempDir;

    fn sample(case_id: &str) -> CaseFeatureRecord {
        CaseFeatureRecord {
            case_id: CaseId::from(case_id),
            outcome: Outcome::Unethical,
            outcome_confidence: 0.9,
            outcome_rationale: "failed to verify the design".into(),
            provisions_cited: vec!["II.1.a".into()],
            cited_case_numbers: vec!["76-4".into()],
            subject_tags: vec!["public safety".into()],
            entity_classes: Default::default(),
            principle_tensions: Vec::new(),
            obligation_conflicts: Vec::new(),
            transformation: None,
            component_embeddings: ComponentEmbeddings::default(),
            combined_embedding: Some(vec![0.1, 0.2, 0.3]),
            features_version: 1,
            built_at: 0,
        }
    }

    #[test]
    fn put_then_get_round_trips_in_memory() {
        let store = FeatureStore::memory_only();
        store.put(sample("case-1")).unwrap();
        let got = store.get(&CaseId::from("case-1")).unwrap();
        assert_eq!(got.outcome, Outcome::Unethical);
    }

    #[test]
    fn rebuild_replaces_rather_than_merges() {
        let store = FeatureStore::memory_only();
        store.put(sample("case-1")).unwrap();
        let mut second = sample("case-1");
        second.provisions_cited.clear();
        store.put(second).unwrap();
        assert!(store.get(&CaseId::from("case-1")).unwrap().provisions_cited.is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FeatureStore::open(dir.path()).unwrap();
            store.put(sample("case-1")).unwrap();
        }
        let store = FeatureStore::open(dir.path()).unwrap();
        assert!(store.get(&CaseId::from("case-1")).is_some());
    }

    #[test]
    fn remove_deletes_record() {
        let store = FeatureStore::memory_only();
        store.put(sample("case-1")).unwrap();
        store.remove(&CaseId::from("case-1")).unwrap();
        assert!(store.get(&CaseId::from("case-1")).is_none());
    }
}
