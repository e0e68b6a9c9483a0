//! Drives one document through every stage and persists its status after each one.

use futures_util::future::join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::candidates;
use super::checkpoint::{Artifacts, Checkpoints};
use super::chunker::{ChunkSettings, Chunker, ChunkingError};
use super::classifier::{Classifier, ClassifierSettings};
use super::error::{PipelineError, PipelineFailure};
use super::events::{EventSink, ProgressEvent};
use super::handlers::{HandlerContext, HandlerTable};
use super::indexer::{Indexer, IndexerSettings};
use super::markup::MarkupGenerator;
use super::metadata;
use super::quality::QualityGate;
use super::sequence;
use super::skeleton;
use super::source::{SourceDocument, load_source};
use super::types::{DocumentId, DocumentRecord, DocumentStatus, FailureInfo, Stage};
use crate::metrics::PipelineMetrics;
use crate::models::ModelCache;
use crate::normative::NormativeResolver;
use crate::retry::RetryPolicy;
use crate::stores::{GraphStore, KeyedLocks, RecordStore, VectorStore};

/// Tunables of the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Largest accepted input file.
    pub max_file_bytes: u64,
    /// Classifier thresholds.
    pub classifier: ClassifierSettings,
    /// Skeleton completeness below which a warning is recorded.
    pub completeness_floor: f32,
    /// Quality score below which a document is rejected.
    pub quality_floor: f32,
    /// Chunk token budgets.
    pub chunking: ChunkSettings,
    /// Embedding batch size and dimension.
    pub indexer: IndexerSettings,
    /// Budget of stages that only run lexical code.
    pub lexical_timeout: Duration,
    /// Budget of stages that may call a model or a store.
    pub model_timeout: Duration,
    /// Retry policy for graph store writes.
    pub store_retry: RetryPolicy,
    /// Documents processed concurrently by [`Pipeline::process_many`].
    pub concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            classifier: ClassifierSettings::default(),
            completeness_floor: 0.4,
            quality_floor: 0.5,
            chunking: ChunkSettings::default(),
            indexer: IndexerSettings::default(),
            lexical_timeout: Duration::from_secs(15),
            model_timeout: Duration::from_secs(180),
            store_retry: RetryPolicy::default(),
            concurrency: 4,
        }
    }
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Document records and the hash index.
    pub records: Arc<dyn RecordStore>,
    /// Work sequences and the normative register.
    pub graph: Arc<dyn GraphStore>,
    /// Chunk vectors.
    pub vectors: Arc<dyn VectorStore>,
    /// Shared model cache.
    pub cache: ModelCache,
    /// Normative code resolver.
    pub resolver: Arc<NormativeResolver>,
    /// Type handlers.
    pub handlers: HandlerTable,
    /// Counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Progress channel.
    pub events: EventSink,
}

/// Per-call options of [`Pipeline::process`].
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    /// Reprocess even when the content is already indexed.
    pub force: bool,
    /// Checked between stages.
    pub cancel: CancellationToken,
}

impl ProcessOptions {
    /// Options forcing a full reprocess.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

struct PipelineInner {
    deps: PipelineDeps,
    settings: PipelineSettings,
    classifier: Classifier,
    markup: MarkupGenerator,
    quality: QualityGate,
    chunker: Chunker,
    indexer: Indexer,
    checkpoints: Checkpoints,
    hash_locks: KeyedLocks<String>,
}

/// The document pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Wire the stages from `deps` and `settings`.
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Result<Self, ChunkingError> {
        let chunker = Chunker::new(settings.chunking.clone())?;
        Ok(Self::with_chunker(deps, settings, chunker))
    }

    /// Like [`Pipeline::new`] with an explicit chunker.
    pub fn with_chunker(deps: PipelineDeps, settings: PipelineSettings, chunker: Chunker) -> Self {
        let cache = deps.cache.clone();
        let inner = PipelineInner {
            classifier: Classifier::new(settings.classifier, Some(cache.clone())),
            markup: MarkupGenerator::new(Some(cache.clone())),
            quality: QualityGate::new(settings.quality_floor, settings.completeness_floor),
            indexer: Indexer::new(cache, deps.vectors.clone(), settings.indexer),
            chunker,
            checkpoints: Checkpoints::new(),
            hash_locks: KeyedLocks::new(),
            deps,
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Collaborators the pipeline was built with.
    pub fn deps(&self) -> &PipelineDeps {
        &self.inner.deps
    }

    /// Settings the pipeline was built with.
    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Progress channel.
    pub fn events(&self) -> &EventSink {
        &self.inner.deps.events
    }

    /// Number of documents with a stored checkpoint.
    pub fn checkpoint_count(&self) -> usize {
        self.inner.checkpoints.len()
    }

    /// Current record of a document.
    pub async fn status(&self, id: DocumentId) -> Result<DocumentRecord, PipelineError> {
        self.inner
            .deps
            .records
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("document {id}")))
    }

    /// Process the file at `path`.
    ///
    /// Identical content already indexed is returned unchanged unless `options.force` is set.
    /// Content whose previous run failed continues after its last committed stage.
    pub async fn process(
        &self,
        path: &Path,
        options: ProcessOptions,
    ) -> Result<DocumentRecord, PipelineFailure> {
        let source = match load_source(path, self.inner.settings.max_file_bytes).await {
            Ok(source) => source,
            Err(error) => {
                tracing::info!(path = %path.display(), error = %error, "Rejected input at intake");
                self.inner.deps.metrics.record_failed();
                return Err(PipelineFailure {
                    document_id: None,
                    stage: Stage::DuplicateCheck,
                    source: error,
                });
            }
        };
        self.run(source, options).await
    }

    /// Continue a failed or interrupted document from its last committed stage.
    pub async fn resume(
        &self,
        id: DocumentId,
        options: ProcessOptions,
    ) -> Result<DocumentRecord, PipelineFailure> {
        let failure = |source| PipelineFailure {
            document_id: Some(id),
            stage: Stage::DuplicateCheck,
            source,
        };
        let record = self.status(id).await.map_err(failure)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        let source = load_source(
            Path::new(&record.source_path),
            self.inner.settings.max_file_bytes,
        )
        .await
        .map_err(failure)?;
        if source.content_hash != record.content_hash {
            return Err(failure(PipelineError::validation(
                format!("{} changed since it was submitted", record.source_path),
                "submit the new file as a new document",
            )));
        }
        self.run(source, ProcessOptions { force: false, ..options }).await
    }

    /// Process many files, at most `concurrency` at a time. Results keep the input order.
    pub async fn process_many(
        &self,
        paths: Vec<PathBuf>,
        options: ProcessOptions,
    ) -> Vec<(PathBuf, Result<DocumentRecord, PipelineFailure>)> {
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.concurrency.max(1)));
        let tasks: Vec<_> = paths
            .into_iter()
            .map(|path| {
                let pipeline = self.clone();
                let semaphore = semaphore.clone();
                let options = options.clone();
                async move {
                    let handle = tokio::spawn({
                        let path = path.clone();
                        async move {
                            let _permit = semaphore.acquire_owned().await.map_err(|error| {
                                PipelineFailure {
                                    document_id: None,
                                    stage: Stage::DuplicateCheck,
                                    source: PipelineError::Internal(error.to_string()),
                                }
                            })?;
                            pipeline.process(&path, options).await
                        }
                    });
                    let result = handle.await.unwrap_or_else(|error| {
                        Err(PipelineFailure {
                            document_id: None,
                            stage: Stage::DuplicateCheck,
                            source: PipelineError::Internal(format!("worker task failed: {error}")),
                        })
                    });
                    (path, result)
                }
            })
            .collect();
        join_all(tasks).await
    }

    async fn run(
        &self,
        source: SourceDocument,
        options: ProcessOptions,
    ) -> Result<DocumentRecord, PipelineFailure> {
        let inner = &self.inner;
        // Identical content submitted concurrently is processed once.
        let _guard = inner.hash_locks.lock(&source.content_hash).await;
        inner.deps.metrics.record_submission();

        let existing = inner
            .deps
            .records
            .find_by_hash(&source.content_hash)
            .await
            .map_err(|error| PipelineFailure {
                document_id: None,
                stage: Stage::DuplicateCheck,
                source: error.into(),
            })?;

        let (mut record, artifacts, start) = match existing {
            Some(record) if record.status == DocumentStatus::Indexed && !options.force => {
                tracing::info!(document_id = %record.id, path = %source.path.display(), "Duplicate content; returning indexed record");
                inner.deps.metrics.record_duplicate();
                self.emit(record.id, Stage::DuplicateCheck, 100, "duplicate of an indexed document");
                return Ok(record);
            }
            Some(mut record) => {
                let checkpoint = match record.status {
                    DocumentStatus::Indexed | DocumentStatus::Rejected => None,
                    _ if options.force => None,
                    _ => inner.checkpoints.take(record.id, &source.content_hash),
                };
                match (checkpoint, record.last_stage.and_then(Stage::next)) {
                    (Some(artifacts), Some(next)) => {
                        tracing::info!(document_id = %record.id, stage = %next, "Resuming document from checkpoint");
                        inner.deps.metrics.record_resume();
                        record.failure = None;
                        if let Some(last) = record.last_stage {
                            record.status = status_through(last);
                        }
                        (record, artifacts, next)
                    }
                    _ => {
                        inner.checkpoints.discard(record.id);
                        record.reset_for_rerun(&source.path);
                        let artifacts = Artifacts::new(&source.content_hash, source.text);
                        (record, artifacts, Stage::DuplicateCheck)
                    }
                }
            }
            None => {
                let record = DocumentRecord::new(&source.path, source.content_hash.clone());
                let artifacts = Artifacts::new(&source.content_hash, source.text);
                (record, artifacts, Stage::DuplicateCheck)
            }
        };
        record.attempts += 1;
        record.touch();
        tracing::info!(
            document_id = %record.id,
            path = %record.source_path,
            format = ?source.format,
            start = %start,
            attempt = record.attempts,
            "Processing document"
        );
        self.run_stages(record, artifacts, start, &options).await
    }

    async fn run_stages(
        &self,
        mut record: DocumentRecord,
        mut artifacts: Artifacts,
        start: Stage,
        options: &ProcessOptions,
    ) -> Result<DocumentRecord, PipelineFailure> {
        let mut stage = start;
        loop {
            if options.cancel.is_cancelled() {
                return Err(self
                    .fail(record, artifacts, stage, PipelineError::Cancelled { stage })
                    .await);
            }
            let before = stage
                .index()
                .checked_sub(1)
                .map(|previous| Stage::ALL[previous].progress())
                .unwrap_or(0);
            self.emit(record.id, stage, before, format!("{stage} started"));

            let budget = if stage.is_model_backed() {
                self.inner.settings.model_timeout
            } else {
                self.inner.settings.lexical_timeout
            };
            let result = with_timeout(
                stage,
                budget,
                self.execute(stage, &mut record, &mut artifacts),
            )
            .await;
            if let Err(error) = result {
                return Err(self.fail(record, artifacts, stage, error).await);
            }

            record.last_stage = Some(stage);
            record.status = status_after(stage, record.status);
            record.touch();
            if let Err(error) = self.inner.deps.records.save(&record).await {
                return Err(self.fail(record, artifacts, stage, error.into()).await);
            }
            self.emit(record.id, stage, stage.progress(), format!("{stage} finished"));

            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }
        self.inner.checkpoints.discard(record.id);
        tracing::info!(
            document_id = %record.id,
            doc_type = ?record.doc_type,
            chunks = record.chunk_count,
            warnings = record.warnings.len(),
            "Document indexed"
        );
        Ok(record)
    }

    async fn execute(
        &self,
        stage: Stage,
        record: &mut DocumentRecord,
        artifacts: &mut Artifacts,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        match stage {
            // Hashing and the duplicate lookup already ran before the stage loop.
            Stage::DuplicateCheck => {}
            Stage::Classification => {
                let classification = inner
                    .classifier
                    .classify(&artifacts.text, &record.file_name)
                    .await?;
                if classification.degraded {
                    inner.deps.metrics.record_degraded();
                }
                for warning in &classification.warnings {
                    record.warn(warning.clone());
                }
                record.doc_type = Some(classification.doc_type);
                record.subtype = Some(classification.subtype.clone());
                record.confidence = Some(classification.confidence);
                artifacts.classification = Some(classification);
            }
            Stage::Structure => {
                let skeleton = skeleton::analyze(&artifacts.text);
                for warning in &skeleton.warnings {
                    record.warn(warning.clone());
                }
                if skeleton.completeness < inner.settings.completeness_floor {
                    record.warn(format!(
                        "structure completeness {:.2} below floor {:.2}",
                        skeleton.completeness, inner.settings.completeness_floor
                    ));
                }
                record.completeness = Some(skeleton.completeness);
                artifacts.skeleton = Some(skeleton);
            }
            Stage::Markup => {
                let doc_type = required(record.doc_type, "document type")?;
                let skeleton = required(artifacts.skeleton.as_ref(), "skeleton")?;
                let seeds = candidates::extract(&artifacts.text, doc_type);
                let outcome = inner
                    .markup
                    .generate(&record.file_name, &artifacts.text, skeleton, seeds)
                    .await;
                if outcome.degraded {
                    inner.deps.metrics.record_degraded();
                }
                for warning in outcome.warnings {
                    record.warn(warning);
                }
                artifacts.graph = Some(outcome.graph);
            }
            Stage::Metadata => {
                let graph = required(artifacts.graph.as_ref(), "markup graph")?;
                let bundle = metadata::extract(graph);
                if bundle.dropped > 0 {
                    record.warn(format!(
                        "{} metadata item(s) dropped for missing provenance",
                        bundle.dropped
                    ));
                }
                artifacts.metadata = Some(bundle);
            }
            Stage::QualityGate => {
                let doc_type = required(record.doc_type, "document type")?;
                let report = inner.quality.check(
                    doc_type,
                    required(artifacts.skeleton.as_ref(), "skeleton")?,
                    required(artifacts.graph.as_ref(), "markup graph")?,
                    required(artifacts.metadata.as_ref(), "metadata")?,
                )?;
                for warning in &report.warnings {
                    record.warn(warning.clone());
                }
                record.quality_score = Some(report.score);
                artifacts.quality = Some(report);
            }
            Stage::TypeHandling => {
                let ctx = HandlerContext {
                    doc_type: required(record.doc_type, "document type")?,
                    subtype: record.subtype.as_deref().unwrap_or_default(),
                    graph: required(artifacts.graph.as_ref(), "markup graph")?,
                    metadata: required(artifacts.metadata.as_ref(), "metadata")?,
                };
                let outcome = inner.deps.handlers.handle(&ctx).await?;
                for warning in &outcome.warnings {
                    record.warn(warning.clone());
                }
                record.notes = outcome.notes.clone();
                artifacts.handler = Some(outcome);
            }
            Stage::WorkSequence => {
                let wanted = artifacts
                    .handler
                    .as_ref()
                    .is_some_and(|outcome| outcome.build_sequence);
                if wanted {
                    let work = sequence::build(
                        record.id,
                        required(artifacts.graph.as_ref(), "markup graph")?,
                        required(artifacts.metadata.as_ref(), "metadata")?,
                    );
                    sequence::persist(
                        inner.deps.graph.as_ref(),
                        &work,
                        &inner.settings.store_retry,
                    )
                    .await?;
                    for warning in &work.warnings {
                        record.warn(warning.clone());
                    }
                    record.notes.push(format!(
                        "work sequence of {} item(s), {:.1} day(s)",
                        work.items.len(),
                        work.total_days
                    ));
                } else {
                    sequence::clear(
                        inner.deps.graph.as_ref(),
                        record.id,
                        &inner.settings.store_retry,
                    )
                    .await?;
                }
            }
            Stage::Chunking => {
                let graph = required(artifacts.graph.as_ref(), "markup graph")?;
                artifacts.chunks = Some(inner.chunker.chunk(record.id, graph));
            }
            Stage::Indexing => {
                let chunks = required(artifacts.chunks.as_deref(), "chunks")?;
                let metadata = required(artifacts.metadata.as_ref(), "metadata")?;
                let written = inner.indexer.index(record, metadata, chunks).await?;
                record.chunk_count = written;
                inner.deps.metrics.record_indexed(written as u64);
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        mut record: DocumentRecord,
        artifacts: Artifacts,
        stage: Stage,
        error: PipelineError,
    ) -> PipelineFailure {
        let inner = &self.inner;
        let category = error.category();
        if category.is_rejection() {
            record.status = DocumentStatus::Rejected;
            record.chunk_count = 0;
            inner.deps.metrics.record_rejected();
            inner.checkpoints.discard(record.id);
            self.withdraw(record.id).await;
        } else {
            // Cancellation keeps the last committed status; other failures are resumable.
            if !matches!(error, PipelineError::Cancelled { .. }) {
                record.status = DocumentStatus::Failed;
                inner.deps.metrics.record_failed();
            }
            inner.checkpoints.save(record.id, artifacts);
        }
        record.failure = Some(FailureInfo {
            category,
            stage,
            message: error.to_string(),
            suggestion: error.suggestion(),
        });
        record.touch();
        tracing::warn!(
            document_id = %record.id,
            stage = %stage,
            category = %category,
            error = %error,
            "Document processing stopped"
        );
        if let Err(save_error) = inner.deps.records.save(&record).await {
            tracing::error!(document_id = %record.id, error = %save_error, "Failed to persist failure status");
        }
        self.emit(record.id, stage, stage.progress(), format!("{stage} failed: {category}"));
        PipelineFailure {
            document_id: Some(record.id),
            stage,
            source: error,
        }
    }

    /// Remove whatever an earlier run of a now rejected document left in the stores.
    async fn withdraw(&self, document_id: DocumentId) {
        let inner = &self.inner;
        if let Err(error) = inner.indexer.remove(document_id).await {
            tracing::error!(%document_id, error = %error, "Failed to remove chunks of rejected document");
        }
        if let Err(error) = sequence::clear(
            inner.deps.graph.as_ref(),
            document_id,
            &inner.settings.store_retry,
        )
        .await
        {
            tracing::error!(%document_id, error = %error, "Failed to remove work sequence of rejected document");
        }
    }

    fn emit(
        &self,
        document_id: DocumentId,
        stage: Stage,
        progress: u8,
        message: impl Into<String>,
    ) {
        self.inner.deps.events.emit(ProgressEvent {
            document_id,
            stage,
            progress,
            message: message.into(),
        });
    }
}

async fn with_timeout<F>(stage: Stage, budget: Duration, future: F) -> Result<(), PipelineError>
where
    F: Future<Output = Result<(), PipelineError>>,
{
    match tokio::time::timeout(budget, future).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            stage,
            seconds: budget.as_secs(),
        }),
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, PipelineError> {
    value.ok_or_else(|| PipelineError::Internal(format!("{what} missing from checkpoint")))
}

/// Status of a record whose last completed stage is `last`.
fn status_through(last: Stage) -> DocumentStatus {
    Stage::ALL
        .iter()
        .take(last.index() + 1)
        .fold(DocumentStatus::Pending, |status, stage| status_after(*stage, status))
}

fn status_after(stage: Stage, current: DocumentStatus) -> DocumentStatus {
    match stage {
        Stage::DuplicateCheck => DocumentStatus::Pending,
        Stage::Classification => DocumentStatus::Classified,
        Stage::Structure => DocumentStatus::Structured,
        Stage::QualityGate => DocumentStatus::Validated,
        Stage::Indexing => DocumentStatus::Indexed,
        _ => current,
    }
}
