use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;
use crate::pipeline::DocumentId;

/// A chunk vector ready for the vector store.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorPoint {
    /// Deterministic chunk identifier.
    pub id: Uuid,
    /// Owning document; also written into the payload as `document_id`.
    pub document_id: DocumentId,
    /// Embedding.
    pub vector: Vec<f32>,
    /// Metadata stored alongside the vector.
    pub payload: Map<String, Value>,
}

/// Vector store contract used by the indexer.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Prepare the store for vectors of `dimension` components.
    async fn ensure_ready(&self, _dimension: usize) -> Result<(), StoreError> {
        Ok(())
    }

    /// Insert or overwrite points by id.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError>;

    /// Remove every chunk of the document.
    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError>;

    /// Identifiers of the chunks currently stored for the document, sorted.
    async fn chunk_ids(&self, document_id: DocumentId) -> Result<Vec<Uuid>, StoreError>;

    /// Replace the document's chunks: prior chunks are deleted before the new ones are written.
    ///
    /// Callers serialise calls per document id.
    async fn replace_document(
        &self,
        document_id: DocumentId,
        points: Vec<VectorPoint>,
    ) -> Result<(), StoreError> {
        self.delete_document(document_id).await?;
        if points.is_empty() {
            return Ok(());
        }
        self.upsert(points).await
    }
}

/// Process-local vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<HashMap<DocumentId, BTreeMap<Uuid, VectorPoint>>>,
}

impl InMemoryVectorStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Points stored for a document, ordered by id.
    pub async fn points(&self, document_id: DocumentId) -> Vec<VectorPoint> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of stored points.
    pub async fn len(&self) -> usize {
        self.documents.read().await.values().map(BTreeMap::len).sum()
    }

    /// Whether no points are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        for point in points {
            documents
                .entry(point.document_id)
                .or_default()
                .insert(point.id, point);
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.documents.write().await.remove(&document_id);
        Ok(())
    }

    async fn chunk_ids(&self, document_id: DocumentId) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .get(&document_id)
            .map(|points| points.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn replace_document(
        &self,
        document_id: DocumentId,
        points: Vec<VectorPoint>,
    ) -> Result<(), StoreError> {
        let replacement: BTreeMap<Uuid, VectorPoint> =
            points.into_iter().map(|point| (point.id, point)).collect();
        let mut documents = self.documents.write().await;
        if replacement.is_empty() {
            documents.remove(&document_id);
        } else {
            documents.insert(document_id, replacement);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(document_id: DocumentId, n: u128) -> VectorPoint {
        VectorPoint {
            id: Uuid::from_u128(n),
            document_id,
            vector: vec![0.0, 1.0],
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn replace_leaves_no_orphans() {
        let store = InMemoryVectorStore::new();
        let doc = DocumentId::new();
        let other = DocumentId::new();
        store
            .upsert(vec![point(doc, 1), point(doc, 2), point(other, 9)])
            .await
            .expect("upsert");

        store
            .replace_document(doc, vec![point(doc, 3)])
            .await
            .expect("replace");

        assert_eq!(
            store.chunk_ids(doc).await.expect("ids"),
            vec![Uuid::from_u128(3)]
        );
        assert_eq!(store.chunk_ids(other).await.expect("ids").len(), 1);
        assert_eq!(store.len().await, 2);
    }
}
