use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::StoreError;
use crate::normative::normalize_code;
use crate::pipeline::{DocumentId, WorkSequence};

/// Register status of a normative code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormativeStatus {
    /// In force.
    Current,
    /// Replaced by another code.
    Superseded,
    /// Withdrawn without replacement.
    Withdrawn,
}

/// One row of the normative reference table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormativeEntry {
    /// Document code as published.
    pub code: String,
    /// Register status.
    pub status: NormativeStatus,
    /// Replacing code for superseded entries.
    #[serde(default)]
    pub replacement: Option<String>,
    /// Optional title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Graph store contract used by the pipeline.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Replace the work sequence of the document, removing any previous one.
    async fn replace_work_sequence(&self, sequence: &WorkSequence) -> Result<(), StoreError>;

    /// Work sequence currently stored for the document.
    async fn work_sequence(&self, document_id: DocumentId)
    -> Result<Option<WorkSequence>, StoreError>;

    /// Remove the document's work sequence. Removing an absent sequence succeeds.
    async fn delete_work_sequence(&self, document_id: DocumentId) -> Result<(), StoreError>;

    /// Register entry for a normalised normative code.
    async fn normative_entry(&self, code: &str) -> Result<Option<NormativeEntry>, StoreError>;
}

/// Process-local graph store.
#[derive(Default)]
pub struct InMemoryGraphStore {
    sequences: RwLock<HashMap<DocumentId, WorkSequence>>,
    normative: RwLock<HashMap<String, NormativeEntry>>,
}

impl InMemoryGraphStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a normative reference table.
    pub fn with_normative_entries(entries: impl IntoIterator<Item = NormativeEntry>) -> Self {
        let normative = entries
            .into_iter()
            .map(|entry| (normalize_code(&entry.code), entry))
            .collect();
        Self {
            sequences: RwLock::default(),
            normative: RwLock::new(normative),
        }
    }

    /// Insert or replace a normative entry.
    pub async fn upsert_normative(&self, entry: NormativeEntry) {
        self.normative
            .write()
            .await
            .insert(normalize_code(&entry.code), entry);
    }

    /// Number of stored work sequences.
    pub async fn sequence_count(&self) -> usize {
        self.sequences.read().await.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn replace_work_sequence(&self, sequence: &WorkSequence) -> Result<(), StoreError> {
        self.sequences
            .write()
            .await
            .insert(sequence.document_id, sequence.clone());
        Ok(())
    }

    async fn work_sequence(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<WorkSequence>, StoreError> {
        Ok(self.sequences.read().await.get(&document_id).cloned())
    }

    async fn delete_work_sequence(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.sequences.write().await.remove(&document_id);
        Ok(())
    }

    async fn normative_entry(&self, code: &str) -> Result<Option<NormativeEntry>, StoreError> {
        Ok(self
            .normative
            .read()
            .await
            .get(&normalize_code(code))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(document_id: DocumentId, total_days: f32) -> WorkSequence {
        WorkSequence {
            document_id,
            items: Vec::new(),
            total_days,
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn work_sequences_are_replaced_not_appended() {
        let store = InMemoryGraphStore::new();
        let id = DocumentId::new();
        store
            .replace_work_sequence(&sequence(id, 3.0))
            .await
            .expect("first");
        store
            .replace_work_sequence(&sequence(id, 5.0))
            .await
            .expect("second");

        assert_eq!(store.sequence_count().await, 1);
        let stored = store.work_sequence(id).await.expect("read").expect("present");
        assert_eq!(stored.total_days, 5.0);
    }

    #[tokio::test]
    async fn deleting_a_sequence_is_idempotent() {
        let store = InMemoryGraphStore::new();
        let id = DocumentId::new();
        store
            .replace_work_sequence(&sequence(id, 2.0))
            .await
            .expect("write");
        store.delete_work_sequence(id).await.expect("delete");
        store.delete_work_sequence(id).await.expect("delete again");
        assert!(store.work_sequence(id).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn normative_lookup_ignores_spacing_and_case() {
        let store = InMemoryGraphStore::with_normative_entries([NormativeEntry {
            code: "SNiP 2.01.07-85".into(),
            status: NormativeStatus::Superseded,
            replacement: Some("SP 20.13330.2016".into()),
            title: None,
        }]);

        let entry = store
            .normative_entry("snip  2.01.07–85")
            .await
            .expect("lookup")
            .expect("entry");
        assert_eq!(entry.status, NormativeStatus::Superseded);
    }
}
