//! Start-up wiring shared by the binaries: stores, model cache, resolver, pipeline and tools.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ModelBackendKind, VectorStoreKind};
use crate::metrics::PipelineMetrics;
use crate::models::{
    CacheSettings, LocalBackend, ModelBackend, ModelCache, ModelRegistry, ModelRole, ModelSpec,
    OllamaBackend,
};
use crate::normative::{NormativeResolver, load_normative_table};
use crate::pipeline::{
    ChunkSettings, ClassifierSettings, EventSink, HandlerTable, IndexerSettings, Pipeline,
    PipelineDeps, PipelineSettings,
};
use crate::qdrant::QdrantVectorStore;
use crate::retry::RetryPolicy;
use crate::stores::{
    GraphStore, InMemoryGraphStore, InMemoryRecordStore, InMemoryVectorStore, JsonRecordStore,
    RecordStore, VectorStore,
};
use crate::tools::{Dispatcher, builtin_registry};

/// How often idle models are checked against the TTL.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Fully wired services.
#[derive(Clone)]
pub struct Runtime {
    /// Document pipeline.
    pub pipeline: Pipeline,
    /// Tool dispatcher over the built-in tools.
    pub dispatcher: Dispatcher,
    /// Shared model cache.
    pub cache: ModelCache,
    /// Pipeline counters.
    pub metrics: Arc<PipelineMetrics>,
}

impl Runtime {
    /// Build every component from `config`, warm priority models and start the TTL sweeper.
    pub async fn build(config: &Config) -> Result<Self> {
        let graph = build_graph_store(config).await?;
        let records = build_record_store(config).await?;
        let vectors = build_vector_store(config)?;
        let cache = ModelCache::new(
            build_model_backend(config)?,
            model_registry(config),
            cache_settings(config),
        );

        let resolver = Arc::new(NormativeResolver::new(graph.clone()));
        let metrics = Arc::new(PipelineMetrics::new());
        let deps = PipelineDeps {
            records,
            graph,
            vectors,
            cache: cache.clone(),
            handlers: HandlerTable::new(resolver.clone()),
            resolver,
            metrics: metrics.clone(),
            events: EventSink::default(),
        };
        let pipeline = Pipeline::new(deps, pipeline_settings(config))
            .context("invalid chunking configuration")?;
        let dispatcher = Dispatcher::new(builtin_registry(&pipeline), dispatch_retry(config));

        for (role, error) in cache.warm_priority().await {
            tracing::warn!(role = %role, error = %error, "Priority model could not be warmed; it will load on first use");
        }
        // Dropping the handle detaches the sweeper; it runs for the process lifetime.
        drop(cache.spawn_sweeper(SWEEP_INTERVAL));

        tracing::info!(
            model_backend = ?config.model_backend,
            vector_store = ?config.vector_store,
            tools = dispatcher.registry().len(),
            "Runtime ready"
        );
        Ok(Self {
            pipeline,
            dispatcher,
            cache,
            metrics,
        })
    }
}

/// Model identifiers per role; warm roles are flagged as priority.
pub fn model_registry(config: &Config) -> ModelRegistry {
    let spec = |role: ModelRole, model_id: &str| {
        let spec = ModelSpec::new(model_id);
        if config.model_warm_roles.contains(&role) {
            spec.priority()
        } else {
            spec
        }
    };
    ModelRegistry::new()
        .with(
            ModelRole::Classification,
            spec(ModelRole::Classification, &config.classifier_model),
        )
        .with(
            ModelRole::Embedding,
            spec(ModelRole::Embedding, &config.embedding_model),
        )
        .with(
            ModelRole::Generation,
            spec(ModelRole::Generation, &config.generation_model),
        )
}

/// Cache limits from `config`.
pub fn cache_settings(config: &Config) -> CacheSettings {
    CacheSettings {
        capacity: config.model_cache_capacity,
        ttl: Duration::from_secs(config.model_cache_ttl_secs),
        acquire_timeout: Duration::from_secs(config.model_cache_acquire_timeout_secs),
    }
}

/// Pipeline tunables from `config`.
pub fn pipeline_settings(config: &Config) -> PipelineSettings {
    PipelineSettings {
        max_file_bytes: config.max_file_bytes,
        classifier: ClassifierSettings {
            confidence_floor: config.classifier_confidence_floor,
            model_assist: config.classifier_model_assist,
            ..ClassifierSettings::default()
        },
        completeness_floor: config.skeleton_completeness_floor,
        quality_floor: config.quality_score_floor,
        chunking: ChunkSettings {
            max_tokens: config.chunk_max_tokens,
            min_tokens: config.chunk_min_tokens,
            overlap_tokens: config.chunk_overlap_tokens,
            tokenizer: config.tokenizer.clone(),
        },
        indexer: IndexerSettings {
            dimension: config.embedding_dimension,
            ..IndexerSettings::default()
        },
        lexical_timeout: Duration::from_secs(config.stage_timeout_lexical_secs),
        model_timeout: Duration::from_secs(config.stage_timeout_model_secs),
        store_retry: RetryPolicy::default(),
        concurrency: config.worker_concurrency,
    }
}

/// Retry policy of the tool dispatcher.
pub fn dispatch_retry(config: &Config) -> RetryPolicy {
    RetryPolicy::new(
        config.dispatch_max_attempts,
        Duration::from_millis(config.dispatch_backoff_ms),
    )
}

fn build_model_backend(config: &Config) -> Result<Arc<dyn ModelBackend>> {
    Ok(match config.model_backend {
        ModelBackendKind::Local => Arc::new(LocalBackend::new(config.embedding_dimension)),
        ModelBackendKind::Ollama => Arc::new(
            OllamaBackend::new(config.ollama_url.clone())
                .with_context(|| format!("invalid Ollama URL {}", config.ollama_url))?,
        ),
    })
}

async fn build_graph_store(config: &Config) -> Result<Arc<dyn GraphStore>> {
    let entries = match &config.normative_table_path {
        Some(path) => load_normative_table(path)
            .await
            .with_context(|| format!("failed to load normative table {}", path.display()))?,
        None => Vec::new(),
    };
    tracing::debug!(entries = entries.len(), "Loaded normative register");
    Ok(Arc::new(InMemoryGraphStore::with_normative_entries(entries)))
}

async fn build_record_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    Ok(match &config.record_store_path {
        Some(path) => Arc::new(
            JsonRecordStore::open(path)
                .await
                .with_context(|| format!("failed to open record store {}", path.display()))?,
        ),
        None => Arc::new(InMemoryRecordStore::new()),
    })
}

fn build_vector_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    Ok(match config.vector_store {
        VectorStoreKind::Memory => Arc::new(InMemoryVectorStore::new()),
        VectorStoreKind::Qdrant => {
            let url = config
                .qdrant_url
                .as_deref()
                .context("QDRANT_URL is required for the qdrant vector store")?;
            let collection = config
                .qdrant_collection_name
                .clone()
                .context("QDRANT_COLLECTION_NAME is required for the qdrant vector store")?;
            Arc::new(
                QdrantVectorStore::new(url, collection, config.qdrant_api_key.clone())
                    .context("failed to build the Qdrant client")?,
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EnvelopeStatus;
    use serde_json::json;

    #[tokio::test]
    async fn default_config_builds_an_in_memory_runtime() {
        let config = Config {
            embedding_dimension: 32,
            ..Config::default()
        };
        let runtime = Runtime::build(&config).await.expect("runtime");
        assert_eq!(runtime.dispatcher.registry().len(), 6);
        assert_eq!(runtime.cache.loaded_count(), 1);

        let envelope = runtime
            .dispatcher
            .execute("pipeline_metrics", json!({}))
            .await;
        assert_eq!(envelope.status, EnvelopeStatus::Success);
    }

    #[test]
    fn warm_roles_become_priority_specs() {
        let config = Config {
            model_warm_roles: vec![ModelRole::Embedding, ModelRole::Classification],
            ..Config::default()
        };
        let mut roles = model_registry(&config).priority_roles();
        roles.sort();
        assert_eq!(roles, vec![ModelRole::Classification, ModelRole::Embedding]);
    }
}
