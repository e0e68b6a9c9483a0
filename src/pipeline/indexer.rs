//! Embedding and vector store writes for one document.

use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;

use super::chunker::Chunk;
use super::error::PipelineError;
use super::markup::NodeId;
use super::metadata::MetadataBundle;
use super::types::{DocumentId, DocumentRecord};
use crate::models::{ModelCache, ModelRole};
use crate::stores::{KeyedLocks, VectorPoint, VectorStore, current_timestamp_rfc3339};

/// Embedding batch size and expected vector width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexerSettings {
    /// Texts sent to the embedding model per request.
    pub batch_size: usize,
    /// Expected embedding dimension.
    pub dimension: usize,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            dimension: 768,
        }
    }
}

/// Embeds chunks and replaces the document's points in the vector store.
#[derive(Clone)]
pub struct Indexer {
    cache: ModelCache,
    store: Arc<dyn VectorStore>,
    locks: Arc<KeyedLocks<DocumentId>>,
    settings: IndexerSettings,
}

impl Indexer {
    /// Indexer writing to `store` with embeddings from `cache`.
    pub fn new(cache: ModelCache, store: Arc<dyn VectorStore>, settings: IndexerSettings) -> Self {
        Self {
            cache,
            store,
            locks: Arc::new(KeyedLocks::new()),
            settings,
        }
    }

    /// Vector store in use.
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Embed `chunks` and replace every stored chunk of the record with them.
    ///
    /// Returns the number of points written.
    pub async fn index(
        &self,
        record: &DocumentRecord,
        metadata: &MetadataBundle,
        chunks: &[Chunk],
    ) -> Result<usize, PipelineError> {
        let vectors = self.embed(chunks).await?;
        let indexed_at = current_timestamp_rfc3339();
        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.id,
                document_id: record.id,
                vector,
                payload: payload(record, metadata, chunk, &indexed_at),
            })
            .collect();
        let written = points.len();

        self.store.ensure_ready(self.settings.dimension).await?;
        let _guard = self.locks.lock(&record.id).await;
        self.store.replace_document(record.id, points).await?;
        tracing::info!(
            document_id = %record.id,
            store = self.store.name(),
            chunks = written,
            "Indexed document chunks"
        );
        Ok(written)
    }

    /// Delete every stored chunk of `document_id`.
    pub async fn remove(&self, document_id: DocumentId) -> Result<(), PipelineError> {
        let _guard = self.locks.lock(&document_id).await;
        self.store.delete_document(document_id).await?;
        tracing::info!(%document_id, store = self.store.name(), "Removed document chunks");
        Ok(())
    }

    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let handle = self.cache.acquire(ModelRole::Embedding).await?;
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let embedded = handle.embed(&texts).await?;
            if embedded.len() != texts.len() {
                return Err(PipelineError::Internal(format!(
                    "embedding model returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                )));
            }
            if let Some(vector) = embedded
                .iter()
                .find(|vector| vector.len() != self.settings.dimension)
            {
                return Err(PipelineError::Internal(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.settings.dimension,
                    vector.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }
}

fn payload(
    record: &DocumentRecord,
    metadata: &MetadataBundle,
    chunk: &Chunk,
    indexed_at: &str,
) -> Map<String, Value> {
    let nodes: HashSet<NodeId> = chunk.node_ids.iter().copied().collect();
    let dates: Vec<&str> = metadata
        .dates
        .iter()
        .filter(|date| nodes.contains(&date.provenance.node))
        .map(|date| date.value.as_str())
        .collect();
    let amounts: Vec<Value> = metadata
        .amounts
        .iter()
        .filter(|amount| nodes.contains(&amount.provenance.node))
        .map(|amount| json!({ "value": amount.value, "currency": amount.currency }))
        .collect();

    let mut payload = Map::new();
    payload.insert("document_id".into(), json!(record.id.to_string()));
    payload.insert("chunk_id".into(), json!(chunk.id.to_string()));
    payload.insert("ordinal".into(), json!(chunk.ordinal));
    payload.insert("text".into(), json!(chunk.text));
    payload.insert("kind".into(), json!(chunk.kind.as_str()));
    payload.insert("token_count".into(), json!(chunk.token_count));
    payload.insert("section_path".into(), json!(chunk.section_path));
    payload.insert("top_section".into(), json!(chunk.top_section));
    payload.insert("node_ids".into(), json!(chunk.node_ids));
    payload.insert("doc_type".into(), json!(record.doc_type));
    payload.insert("subtype".into(), json!(record.subtype));
    payload.insert("quality_score".into(), json!(record.quality_score));
    payload.insert("source_path".into(), json!(record.source_path));
    payload.insert("file_name".into(), json!(record.file_name));
    payload.insert("dates".into(), json!(dates));
    payload.insert("amounts".into(), Value::Array(amounts));
    payload.insert("indexed_at".into(), json!(indexed_at));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CacheSettings, LocalBackend, ModelRegistry, ModelSpec};
    use crate::pipeline::chunker::{ChunkSettings, Chunker, whitespace_token_counter};
    use crate::pipeline::markup::build_structure;
    use crate::pipeline::metadata;
    use crate::pipeline::skeleton::analyze;
    use crate::pipeline::types::DocumentType;
    use crate::stores::InMemoryVectorStore;
    use std::path::Path;
    use std::time::Duration;

    const TEXT: &str = "\
1 Costs
| Item | Amount |
| Concrete | 1 200 USD |

2 Schedule
Works start on 01.04.2024.
";

    fn cache(dimension: usize) -> ModelCache {
        ModelCache::new(
            Arc::new(LocalBackend::new(dimension)),
            ModelRegistry::new().with(ModelRole::Embedding, ModelSpec::new("embed")),
            CacheSettings {
                capacity: 1,
                ttl: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(1),
            },
        )
    }

    fn fixture() -> (DocumentRecord, MetadataBundle, Vec<Chunk>) {
        let graph = build_structure("doc", TEXT, &analyze(TEXT));
        let bundle = metadata::extract(&graph);
        let mut record = DocumentRecord::new(Path::new("/tmp/costs.txt"), "hash".into());
        record.doc_type = Some(DocumentType::Estimate);
        let chunker = Chunker::with_counter(
            ChunkSettings {
                max_tokens: 100,
                min_tokens: 0,
                overlap_tokens: 0,
                tokenizer: String::new(),
            },
            whitespace_token_counter(),
        )
        .expect("budget");
        let chunks = chunker.chunk(record.id, &graph);
        (record, bundle, chunks)
    }

    #[tokio::test]
    async fn payload_carries_metadata_traced_to_chunk_nodes() {
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = Indexer::new(
            cache(16),
            store.clone(),
            IndexerSettings {
                batch_size: 1,
                dimension: 16,
            },
        );
        let (record, bundle, chunks) = fixture();
        let written = indexer.index(&record, &bundle, &chunks).await.expect("indexed");
        assert_eq!(written, 2);

        let points = store.points(record.id).await;
        let table = points
            .iter()
            .find(|point| point.payload["kind"] == "table")
            .expect("table chunk");
        assert_eq!(table.payload["amounts"][0]["currency"], "USD");
        assert_eq!(table.payload["dates"], json!([]));
        assert_eq!(table.payload["doc_type"], "estimate");
        let prose = points
            .iter()
            .find(|point| point.payload["kind"] == "prose")
            .expect("prose chunk");
        assert_eq!(prose.payload["dates"], json!(["2024-04-01"]));
        assert_eq!(prose.payload["top_section"], "2 Schedule");
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_without_writing() {
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = Indexer::new(cache(8), store.clone(), IndexerSettings::default());
        let (record, bundle, chunks) = fixture();
        let error = indexer
            .index(&record, &bundle, &chunks)
            .await
            .expect_err("dimension mismatch");
        assert!(matches!(error, PipelineError::Internal(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reindexing_replaces_previous_points() {
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = Indexer::new(
            cache(16),
            store.clone(),
            IndexerSettings {
                batch_size: 32,
                dimension: 16,
            },
        );
        let (record, bundle, chunks) = fixture();
        indexer.index(&record, &bundle, &chunks).await.expect("first");
        indexer.index(&record, &bundle, &chunks[..1]).await.expect("second");
        assert_eq!(store.points(record.id).await.len(), 1);
    }
}
