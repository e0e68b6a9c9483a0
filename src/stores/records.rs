use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use super::StoreError;
use crate::pipeline::{DocumentId, DocumentRecord};

/// Document record store with a content-hash index.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Record by identifier.
    async fn get(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Record whose content hash matches.
    async fn find_by_hash(&self, content_hash: &str)
    -> Result<Option<DocumentRecord>, StoreError>;

    /// Insert or overwrite a record.
    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    /// Every record, oldest first.
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError>;
}

#[derive(Default)]
struct RecordIndex {
    records: BTreeMap<DocumentId, DocumentRecord>,
    by_hash: HashMap<String, DocumentId>,
}

impl RecordIndex {
    fn insert(&mut self, record: DocumentRecord) {
        self.by_hash.insert(record.content_hash.clone(), record.id);
        self.records.insert(record.id, record);
    }

    fn find_by_hash(&self, content_hash: &str) -> Option<DocumentRecord> {
        self.by_hash
            .get(content_hash)
            .and_then(|id| self.records.get(id))
            .cloned()
    }

    fn list(&self) -> Vec<DocumentRecord> {
        let mut records: Vec<DocumentRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }
}

/// Process-local record store.
#[derive(Default)]
pub struct InMemoryRecordStore {
    index: RwLock<RecordIndex>,
}

impl InMemoryRecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.index.read().await.records.get(&id).cloned())
    }

    async fn find_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.index.read().await.find_by_hash(content_hash))
    }

    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.index.write().await.insert(record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self.index.read().await.list())
    }
}

/// Record store persisted as one JSON file.
///
/// Every save rewrites the file through a sibling temporary file followed by a rename, so a
/// crash never leaves a truncated store behind.
pub struct JsonRecordStore {
    path: PathBuf,
    index: Mutex<RecordIndex>,
}

impl JsonRecordStore {
    /// Open the store at `path`, creating parent directories; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut index = RecordIndex::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let records: Vec<DocumentRecord> = serde_json::from_slice(&bytes)?;
                for record in records {
                    index.insert(record);
                }
            }
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        tracing::debug!(path = %path.display(), records = index.records.len(), "Opened record store");
        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    async fn persist(&self, index: &RecordIndex) -> Result<(), StoreError> {
        let records = index.list();
        let body = serde_json::to_vec_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.index.lock().await.records.get(&id).cloned())
    }

    async fn find_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.index.lock().await.find_by_hash(content_hash))
    }

    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        let previous = index.records.get(&record.id).cloned();
        index.insert(record.clone());
        if let Err(error) = self.persist(&index).await {
            match previous {
                Some(previous) => index.insert(previous),
                None => {
                    index.records.remove(&record.id);
                    index.by_hash.remove(&record.content_hash);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self.index.lock().await.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DocumentStatus;

    fn record(hash: &str) -> DocumentRecord {
        DocumentRecord::new(Path::new("/data/estimate.txt"), hash.to_string())
    }

    #[tokio::test]
    async fn hash_index_finds_saved_records() {
        let store = InMemoryRecordStore::new();
        let mut saved = record("abc");
        store.save(&saved).await.expect("save");

        saved.status = DocumentStatus::Indexed;
        store.save(&saved).await.expect("update");

        let found = store.find_by_hash("abc").await.expect("lookup").expect("found");
        assert_eq!(found.id, saved.id);
        assert_eq!(found.status, DocumentStatus::Indexed);
        assert!(store.find_by_hash("zzz").await.expect("lookup").is_none());
        assert_eq!(store.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state/records.json");

        let saved = record("def");
        {
            let store = JsonRecordStore::open(&path).await.expect("open");
            store.save(&saved).await.expect("save");
        }

        let reopened = JsonRecordStore::open(&path).await.expect("reopen");
        let found = reopened
            .find_by_hash("def")
            .await
            .expect("lookup")
            .expect("found");
        assert_eq!(found, saved);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
