//! ACID-durable tables backed by redb: draft entities, the extraction
//! session provenance log, the idempotency index, and the per-case draft
//! index used to answer `get_drafts(case_id)` without a full table scan.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::StoreResult;

const DRAFTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("drafts");
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");
const IDEMPOTENCY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("idempotency");
/// Composite `case_id\0draft_id` keys, empty values — scanned by prefix to
/// answer "all drafts for this case" without a full-table scan of `drafts`.
const CASE_DRAFT_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("case_draft_index");
const RELATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("relations");

/// ACID-durable store for the Staging Store (§4.4).
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Redb {
            message: format!("failed to create data directory {}: {e}", data_dir.display()),
        })?;
        let db_path = data_dir.join("proethica.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        // Ensure every table exists so reads against an empty store don't fail.
        let txn = db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            txn.open_table(DRAFTS).map_err(|e| StoreError::Redb {
                message: format!("open_table(drafts) failed: {e}"),
            })?;
            txn.open_table(SESSIONS).map_err(|e| StoreError::Redb {
                message: format!("open_table(sessions) failed: {e}"),
            })?;
            txn.open_table(IDEMPOTENCY).map_err(|e| StoreError::Redb {
                message: format!("open_table(idempotency) failed: {e}"),
            })?;
            txn.open_table(CASE_DRAFT_INDEX).map_err(|e| StoreError::Redb {
                message: format!("open_table(case_draft_index) failed: {e}"),
            })?;
            txn.open_table(RELATIONS).map_err(|e| StoreError::Redb {
                message: format!("open_table(relations) failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut t = txn.open_table(table).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            t.insert(key, value).map_err(|e| StoreError::Redb {
                message: format!("insert failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    fn get(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let t = txn.open_table(table).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let result = t.get(key).map_err(|e| StoreError::Redb {
            message: format!("get failed: {e}"),
        })?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    fn remove(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8]) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        let existed = {
            let mut t = txn.open_table(table).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            t.remove(key)
                .map_err(|e| StoreError::Redb {
                    message: format!("remove failed: {e}"),
                })?
                .is_some()
        };
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(existed)
    }

    fn scan_prefix(&self, table: TableDefinition<&[u8], &[u8]>, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let t = txn.open_table(table).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(|e| StoreError::Redb {
            message: format!("iter failed: {e}"),
        })? {
            let (k, v) = entry.map_err(|e| StoreError::Redb {
                message: format!("iter entry failed: {e}"),
            })?;
            if k.value().starts_with(prefix) {
                out.push((k.value().to_vec(), v.value().to_vec()));
            }
        }
        Ok(out)
    }

    pub fn put_draft(&self, draft_id: u64, value: &[u8]) -> StoreResult<()> {
        self.put(DRAFTS, &draft_id.to_be_bytes(), value)
    }

    pub fn get_draft(&self, draft_id: u64) -> StoreResult<Option<Vec<u8>>> {
        self.get(DRAFTS, &draft_id.to_be_bytes())
    }

    pub fn remove_draft(&self, draft_id: u64) -> StoreResult<bool> {
        self.remove(DRAFTS, &draft_id.to_be_bytes())
    }

    pub fn put_relation(&self, relation_id: u64, value: &[u8]) -> StoreResult<()> {
        self.put(RELATIONS, &relation_id.to_be_bytes(), value)
    }

    pub fn scan_all_relations(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(RELATIONS, &[])
    }

    pub fn scan_all_drafts(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(DRAFTS, &[])
    }

    pub fn scan_all_sessions(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(SESSIONS, &[])
    }

    pub fn put_session(&self, session_id: u64, value: &[u8]) -> StoreResult<()> {
        self.put(SESSIONS, &session_id.to_be_bytes(), value)
    }

    pub fn get_session(&self, session_id: u64) -> StoreResult<Option<Vec<u8>>> {
        self.get(SESSIONS, &session_id.to_be_bytes())
    }

    pub fn scan_sessions_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(SESSIONS, prefix)
    }

    pub fn put_idempotency(&self, key: &[u8], draft_id: u64) -> StoreResult<()> {
        self.put(IDEMPOTENCY, key, &draft_id.to_be_bytes())
    }

    pub fn get_idempotency(&self, key: &[u8]) -> StoreResult<Option<u64>> {
        Ok(self
            .get(IDEMPOTENCY, key)?
            .map(|v| u64::from_be_bytes(v.try_into().unwrap_or([0; 8]))))
    }

    pub fn index_case_draft(&self, case_id: &str, draft_id: u64) -> StoreResult<()> {
        let key = case_draft_key(case_id, draft_id);
        self.put(CASE_DRAFT_INDEX, &key, &[])
    }

    pub fn unindex_case_draft(&self, case_id: &str, draft_id: u64) -> StoreResult<()> {
        let key = case_draft_key(case_id, draft_id);
        self.remove(CASE_DRAFT_INDEX, &key)?;
        Ok(())
    }

    pub fn draft_ids_for_case(&self, case_id: &str) -> StoreResult<Vec<u64>> {
        let prefix = case_prefix(case_id);
        let entries = self.scan_prefix(CASE_DRAFT_INDEX, &prefix)?;
        Ok(entries
            .into_iter()
            .filter_map(|(k, _)| k.get(prefix.len()..).map(|rest| rest.to_vec()))
            .filter_map(|rest| rest.try_into().ok())
            .map(u64::from_be_bytes)
            .collect())
    }
}

fn case_prefix(case_id: &str) -> Vec<u8> {
    let mut key = case_id.as_bytes().to_vec();
    key.push(0);
    key
}

fn case_draft_key(case_id: &str, draft_id: u64) -> Vec<u8> {
    let mut key = case_prefix(case_id);
    key.extend_from_slice(&draft_id.to_be_bytes());
    key
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn draft_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        store.put_draft(1, b"payload").unwrap();
        assert_eq!(store.get_draft(1).unwrap(), Some(b"payload".to_vec()));
        assert!(store.remove_draft(1).unwrap());
        assert_eq!(store.get_draft(1).unwrap(), None);
    }

    #[test]
    fn idempotency_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        store.put_idempotency(b"case-1|session-1|role|engineer", 42).unwrap();
        assert_eq!(
            store.get_idempotency(b"case-1|session-1|role|engineer").unwrap(),
            Some(42)
        );
    }

    #[test]
    fn case_draft_index_scans_by_case() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        store.index_case_draft("case-1", 1).unwrap();
        store.index_case_draft("case-1", 2).unwrap();
        store.index_case_draft("case-2", 3).unwrap();

        let mut ids = store.draft_ids_for_case("case-1").unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.draft_ids_for_case("case-2").unwrap(), vec![3]);
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let store = DurableStore::open(dir.path()).unwrap();
            store.put_draft(7, b"durable").unwrap();
            store.index_case_draft("case-x", 7).unwrap();
        }
        let store = DurableStore::open(dir.path()).unwrap();
        assert_eq!(store.get_draft(7).unwrap(), Some(b"durable".to_vec()));
        assert_eq!(store.draft_ids_for_case("case-x").unwrap(), vec![7]);
    }
}
