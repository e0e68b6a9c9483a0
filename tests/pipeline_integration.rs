use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sitedocs::metrics::PipelineMetrics;
use sitedocs::models::{
    CacheSettings, LocalBackend, ModelCache, ModelRegistry, ModelRole, ModelSpec,
};
use sitedocs::normative::NormativeResolver;
use sitedocs::pipeline::chunker::whitespace_token_counter;
use sitedocs::pipeline::{
    ChunkSettings, Chunker, ClassifierSettings, DocumentId, DocumentStatus, DocumentType,
    ErrorCategory, EventSink, HandlerContext, HandlerOutcome, HandlerTable, IndexerSettings,
    Pipeline, PipelineDeps, PipelineError, PipelineSettings, ProcessOptions, Stage, TypeHandler,
    WorkSequence,
};
use sitedocs::retry::RetryPolicy;
use sitedocs::stores::{
    GraphStore, InMemoryGraphStore, InMemoryRecordStore, InMemoryVectorStore, NormativeEntry,
    NormativeStatus, StoreError, VectorStore,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DIMENSION: usize = 32;

const METHOD_STATEMENT: &str = "\
Method statement: foundation works
Issued 12.03.2024

1 Earthworks
1.1 Excavate the foundation pit, 300 m3 of soil.
1.2 Backfill and compact the sinuses within 2 days.

2 Concrete works
2.1 Pour concrete C25/30 into the footings, 45 m3.
2.2 Strip the formwork after 3 days of curing.
";

const UNPRICED_ESTIMATE: &str = "\
1 Bill of quantities
| Item | Unit | Qty |
| Concrete C25/30 | m3 | 42 |
| Rebar A500 | t | 3.2 |
Prepared 12.03.2024
";

const OBSOLETE_CODE: &str = "\
SNiP 3.03.01-87
Building code: load-bearing and enclosing structures
1 Scope of application
1.1 These rules shall be applied to concrete works.
1.2 Formwork shall be removed after curing.
2 Terms and definitions
2.1 Concrete is an artificial stone.
";

fn normative_register() -> Vec<NormativeEntry> {
    vec![
        NormativeEntry {
            code: "SNIP 3.03.01-87".into(),
            status: NormativeStatus::Superseded,
            replacement: Some("SP 70.13330.2012".into()),
            title: None,
        },
        NormativeEntry {
            code: "SP 70.13330.2012".into(),
            status: NormativeStatus::Current,
            replacement: None,
            title: Some("Load-bearing and enclosing structures".into()),
        },
    ]
}

/// Graph store whose sequence writes fail while `offline` is set.
struct SwitchableGraphStore {
    inner: InMemoryGraphStore,
    offline: AtomicBool,
    /// Cancelled after the next successful sequence write.
    cancel_after_write: Mutex<Option<CancellationToken>>,
}

impl SwitchableGraphStore {
    fn offline() -> Self {
        Self {
            inner: InMemoryGraphStore::with_normative_entries(normative_register()),
            offline: AtomicBool::new(true),
            cancel_after_write: Mutex::new(None),
        }
    }
}

#[async_trait]
impl GraphStore for SwitchableGraphStore {
    async fn replace_work_sequence(&self, sequence: &WorkSequence) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("graph store offline".into()));
        }
        self.inner.replace_work_sequence(sequence).await?;
        if let Some(token) = self.cancel_after_write.lock().expect("token lock").take() {
            token.cancel();
        }
        Ok(())
    }

    async fn work_sequence(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<WorkSequence>, StoreError> {
        self.inner.work_sequence(document_id).await
    }

    async fn delete_work_sequence(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.inner.delete_work_sequence(document_id).await
    }

    async fn normative_entry(&self, code: &str) -> Result<Option<NormativeEntry>, StoreError> {
        self.inner.normative_entry(code).await
    }
}

/// Project handler that requests cancellation while it runs.
struct CancellingHandler {
    token: CancellationToken,
}

#[async_trait]
impl TypeHandler for CancellingHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Project
    }

    async fn handle(&self, _ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        self.token.cancel();
        Ok(HandlerOutcome {
            build_sequence: true,
            ..HandlerOutcome::default()
        })
    }
}

/// How the project handler behaves from its second call on.
#[derive(Clone, Copy)]
enum LaterRuns {
    Reject,
    SkipSequence,
}

/// Project handler that requests a work sequence once, then follows `later`.
struct ChangingHandler {
    calls: AtomicU32,
    later: LaterRuns,
}

impl ChangingHandler {
    fn new(later: LaterRuns) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            later,
        })
    }
}

#[async_trait]
impl TypeHandler for ChangingHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Project
    }

    async fn handle(&self, _ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
        match (first, self.later) {
            (true, _) => Ok(HandlerOutcome {
                build_sequence: true,
                ..HandlerOutcome::default()
            }),
            (false, LaterRuns::Reject) => Err(PipelineError::QualityGate {
                reasons: vec!["work items no longer match the register".into()],
                score: 0.1,
            }),
            (false, LaterRuns::SkipSequence) => Ok(HandlerOutcome::default()),
        }
    }
}

struct Fixture {
    pipeline: Pipeline,
    vectors: Arc<InMemoryVectorStore>,
    metrics: Arc<PipelineMetrics>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let graph = Arc::new(InMemoryGraphStore::with_normative_entries(normative_register()));
        Self::with_graph(graph, |table| table)
    }

    fn with_graph(
        graph: Arc<dyn GraphStore>,
        handlers: impl FnOnce(HandlerTable) -> HandlerTable,
    ) -> Self {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let resolver = Arc::new(NormativeResolver::new(graph.clone()));
        let cache = ModelCache::new(
            Arc::new(LocalBackend::new(DIMENSION)),
            ModelRegistry::new()
                .with(ModelRole::Classification, ModelSpec::new("local-cls"))
                .with(ModelRole::Embedding, ModelSpec::new("local-embed"))
                .with(ModelRole::Generation, ModelSpec::new("local-gen")),
            CacheSettings {
                capacity: 3,
                ttl: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(1),
            },
        );
        let deps = PipelineDeps {
            records: Arc::new(InMemoryRecordStore::new()),
            graph,
            vectors: vectors.clone(),
            cache,
            handlers: handlers(HandlerTable::new(resolver.clone())),
            resolver,
            metrics: metrics.clone(),
            events: EventSink::default(),
        };
        let settings = PipelineSettings {
            classifier: ClassifierSettings {
                confidence_floor: 0.3,
                model_assist: false,
                ..ClassifierSettings::default()
            },
            quality_floor: 0.2,
            completeness_floor: 0.0,
            indexer: IndexerSettings {
                dimension: DIMENSION,
                ..IndexerSettings::default()
            },
            store_retry: RetryPolicy::new(1, Duration::from_millis(1)),
            concurrency: 2,
            ..PipelineSettings::default()
        };
        let chunking = ChunkSettings {
            max_tokens: 64,
            min_tokens: 4,
            overlap_tokens: 8,
            ..ChunkSettings::default()
        };
        let chunker = Chunker::with_counter(chunking, whitespace_token_counter())
            .expect("valid chunk budgets");
        Self {
            pipeline: Pipeline::with_chunker(deps, settings, chunker),
            vectors,
            metrics,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write fixture");
        path
    }
}

async fn chunk_ids(vectors: &InMemoryVectorStore, id: DocumentId) -> BTreeSet<uuid::Uuid> {
    vectors
        .chunk_ids(id)
        .await
        .expect("chunk ids")
        .into_iter()
        .collect()
}

#[tokio::test]
async fn method_statement_is_indexed_with_a_work_sequence() {
    let fixture = Fixture::new();
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let record = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect("indexed");

    assert_eq!(record.status, DocumentStatus::Indexed);
    assert_eq!(record.doc_type, Some(DocumentType::Project));
    assert_eq!(record.last_stage, Some(Stage::Indexing));
    assert!(record.chunk_count > 0);
    assert_eq!(fixture.vectors.len().await, record.chunk_count);

    let sequence = fixture
        .pipeline
        .deps()
        .graph
        .work_sequence(record.id)
        .await
        .expect("read")
        .expect("sequence persisted");
    assert!(!sequence.items.is_empty());

    let stored = fixture.pipeline.status(record.id).await.expect("status");
    assert_eq!(stored, record);
}

#[tokio::test]
async fn forced_reprocessing_yields_the_same_chunk_ids() {
    let fixture = Fixture::new();
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let first = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect("first run");
    let before = chunk_ids(&fixture.vectors, first.id).await;

    let second = fixture
        .pipeline
        .process(&path, ProcessOptions::forced())
        .await
        .expect("forced run");
    let after = chunk_ids(&fixture.vectors, second.id).await;

    assert_eq!(first.id, second.id);
    assert_eq!(second.attempts, 2);
    assert!(!before.is_empty());
    assert_eq!(before, after);
    assert_eq!(fixture.vectors.len().await, after.len());
}

#[tokio::test]
async fn identical_content_under_two_names_is_processed_once() {
    let fixture = Fixture::new();
    let original = fixture.write("method_statement.txt", METHOD_STATEMENT);
    let copy = fixture.write("copy_of_method_statement.txt", METHOD_STATEMENT);

    let first = fixture
        .pipeline
        .process(&original, ProcessOptions::default())
        .await
        .expect("first");
    let second = fixture
        .pipeline
        .process(&copy, ProcessOptions::default())
        .await
        .expect("duplicate");

    assert_eq!(first.id, second.id);
    assert_eq!(second.attempts, 1);
    assert_eq!(second.source_path, first.source_path);
    let snapshot = fixture.metrics.snapshot();
    assert_eq!(snapshot.duplicates_skipped, 1);
    assert_eq!(snapshot.documents_indexed, 1);
    assert_eq!(snapshot.documents_submitted, 2);
}

#[tokio::test]
async fn estimate_without_amounts_is_rejected_before_indexing() {
    let fixture = Fixture::new();
    let path = fixture.write("boq_block_a.txt", UNPRICED_ESTIMATE);

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect_err("rejected");

    assert_eq!(failure.category(), ErrorCategory::QualityGate);
    assert_eq!(failure.stage, Stage::QualityGate);
    assert!(failure.suggestion().contains("monetary"));

    let id = failure.document_id.expect("record exists");
    let record = fixture.pipeline.status(id).await.expect("status");
    assert_eq!(record.status, DocumentStatus::Rejected);
    assert_eq!(record.doc_type, Some(DocumentType::Estimate));
    assert!(fixture.vectors.is_empty().await);
    assert_eq!(fixture.pipeline.checkpoint_count(), 0);
}

#[tokio::test]
async fn vague_text_is_rejected_with_confidence_and_floor() {
    let fixture = Fixture::new();
    let path = fixture.write("notes.txt", "Minutes of a call about lunch options.\n");

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect_err("low confidence");

    assert_eq!(failure.category(), ErrorCategory::LowConfidence);
    assert_eq!(failure.stage, Stage::Classification);
    let suggestion = failure.suggestion();
    assert!(suggestion.contains("confidence 0.00"), "{suggestion}");
    assert!(suggestion.contains("floor 0.30"), "{suggestion}");

    let record = fixture
        .pipeline
        .status(failure.document_id.expect("record"))
        .await
        .expect("status");
    assert_eq!(record.status, DocumentStatus::Rejected);
    let info = record.failure.expect("failure info");
    assert_eq!(info.category, ErrorCategory::LowConfidence);
    assert_eq!(info.suggestion, suggestion);
    assert_eq!(fixture.metrics.snapshot().documents_rejected, 1);
}

#[tokio::test]
async fn superseded_normative_document_is_rejected_as_obsolete() {
    let fixture = Fixture::new();
    let path = fixture.write("snip_3_03_01_87.txt", OBSOLETE_CODE);

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect_err("obsolete");

    assert_eq!(failure.category(), ErrorCategory::Obsolete);
    assert_eq!(failure.stage, Stage::TypeHandling);
    assert!(failure.suggestion().contains("SP 70.13330.2012"));
    let record = fixture
        .pipeline
        .status(failure.document_id.expect("record"))
        .await
        .expect("status");
    assert_eq!(record.status, DocumentStatus::Rejected);
    assert!(fixture.vectors.is_empty().await);
}

#[tokio::test]
async fn persistence_failure_resumes_from_the_failed_stage() {
    let graph = Arc::new(SwitchableGraphStore::offline());
    let fixture = Fixture::with_graph(graph.clone(), |table| table);
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect_err("graph store offline");
    assert_eq!(failure.category(), ErrorCategory::Persistence);
    assert_eq!(failure.stage, Stage::WorkSequence);
    let id = failure.document_id.expect("record");

    let record = fixture.pipeline.status(id).await.expect("status");
    assert_eq!(record.status, DocumentStatus::Failed);
    assert_eq!(record.last_stage, Some(Stage::TypeHandling));
    assert_eq!(fixture.pipeline.checkpoint_count(), 1);

    graph.offline.store(false, Ordering::SeqCst);
    let mut events = fixture.pipeline.events().subscribe();
    let resumed = fixture
        .pipeline
        .resume(id, ProcessOptions::default())
        .await
        .expect("resumed");

    assert_eq!(resumed.id, id);
    assert_eq!(resumed.status, DocumentStatus::Indexed);
    assert_eq!(resumed.attempts, 2);
    assert!(resumed.failure.is_none());
    assert_eq!(fixture.pipeline.checkpoint_count(), 0);
    assert_eq!(fixture.metrics.snapshot().resumed_runs, 1);

    let first = events.try_recv().expect("stage event");
    assert_eq!(first.stage, Stage::WorkSequence);
    let mut stages = vec![first.stage];
    while let Ok(event) = events.try_recv() {
        stages.push(event.stage);
    }
    assert!(!stages.contains(&Stage::Classification));
    assert!(stages.contains(&Stage::Indexing));
}

#[tokio::test]
async fn cancelling_a_resumed_run_keeps_the_restored_status() {
    let graph = Arc::new(SwitchableGraphStore::offline());
    let fixture = Fixture::with_graph(graph.clone(), |table| table);
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect_err("graph store offline");
    let id = failure.document_id.expect("record");

    let token = CancellationToken::new();
    graph.offline.store(false, Ordering::SeqCst);
    *graph.cancel_after_write.lock().expect("token lock") = Some(token.clone());
    let cancelled = fixture
        .pipeline
        .resume(
            id,
            ProcessOptions {
                force: false,
                cancel: token,
            },
        )
        .await
        .expect_err("cancelled after the sequence write");
    assert_eq!(cancelled.category(), ErrorCategory::Cancelled);
    assert_eq!(cancelled.stage, Stage::Chunking);

    let record = fixture.pipeline.status(id).await.expect("status");
    assert_eq!(record.last_stage, Some(Stage::WorkSequence));
    assert_eq!(record.status, DocumentStatus::Validated);
}

#[tokio::test]
async fn rejected_reprocess_withdraws_chunks_and_sequence() {
    let graph = Arc::new(InMemoryGraphStore::with_normative_entries(normative_register()));
    let handler = ChangingHandler::new(LaterRuns::Reject);
    let fixture = Fixture::with_graph(graph.clone(), |table| table.with_handler(handler));
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let indexed = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect("first run");
    assert!(!chunk_ids(&fixture.vectors, indexed.id).await.is_empty());
    assert!(graph.work_sequence(indexed.id).await.expect("read").is_some());

    let failure = fixture
        .pipeline
        .process(&path, ProcessOptions::forced())
        .await
        .expect_err("rejected on reprocess");
    assert_eq!(failure.category(), ErrorCategory::QualityGate);

    let record = fixture.pipeline.status(indexed.id).await.expect("status");
    assert_eq!(record.status, DocumentStatus::Rejected);
    assert_eq!(record.chunk_count, 0);
    assert!(chunk_ids(&fixture.vectors, indexed.id).await.is_empty());
    assert!(graph.work_sequence(indexed.id).await.expect("read").is_none());
}

#[tokio::test]
async fn reprocess_without_a_sequence_removes_the_old_one() {
    let graph = Arc::new(InMemoryGraphStore::with_normative_entries(normative_register()));
    let handler = ChangingHandler::new(LaterRuns::SkipSequence);
    let fixture = Fixture::with_graph(graph.clone(), |table| table.with_handler(handler));
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let first = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect("first run");
    assert!(graph.work_sequence(first.id).await.expect("read").is_some());

    let second = fixture
        .pipeline
        .process(&path, ProcessOptions::forced())
        .await
        .expect("second run");
    assert_eq!(second.status, DocumentStatus::Indexed);
    assert!(graph.work_sequence(second.id).await.expect("read").is_none());
}

#[tokio::test]
async fn cancellation_keeps_the_committed_status() {
    let token = CancellationToken::new();
    let graph = Arc::new(InMemoryGraphStore::with_normative_entries(normative_register()));
    let handler = Arc::new(CancellingHandler {
        token: token.clone(),
    });
    let fixture = Fixture::with_graph(graph, |table| table.with_handler(handler));
    let path = fixture.write("method_statement.txt", METHOD_STATEMENT);

    let failure = fixture
        .pipeline
        .process(
            &path,
            ProcessOptions {
                force: false,
                cancel: token,
            },
        )
        .await
        .expect_err("cancelled");
    assert_eq!(failure.category(), ErrorCategory::Cancelled);
    assert_eq!(failure.stage, Stage::WorkSequence);

    let id = failure.document_id.expect("record");
    let record = fixture.pipeline.status(id).await.expect("status");
    assert_eq!(record.status, DocumentStatus::Validated);
    assert_eq!(record.last_stage, Some(Stage::TypeHandling));
    assert_eq!(
        record.failure.map(|info| info.category),
        Some(ErrorCategory::Cancelled)
    );
    assert_eq!(fixture.metrics.snapshot().documents_failed, 0);
    assert!(fixture.vectors.is_empty().await);

    let resumed = fixture
        .pipeline
        .process(&path, ProcessOptions::default())
        .await
        .expect("resumed after cancellation");
    assert_eq!(resumed.status, DocumentStatus::Indexed);
    assert_eq!(fixture.metrics.snapshot().resumed_runs, 1);
}

#[tokio::test]
async fn intake_errors_carry_no_document() {
    let fixture = Fixture::new();
    let failure = fixture
        .pipeline
        .process(&fixture.dir.path().join("missing.txt"), ProcessOptions::default())
        .await
        .expect_err("missing file");
    assert_eq!(failure.category(), ErrorCategory::Validation);
    assert!(failure.document_id.is_none());
}

#[tokio::test]
async fn batch_results_follow_input_order() {
    let fixture = Fixture::new();
    let paths = vec![
        fixture.write("method_statement.txt", METHOD_STATEMENT),
        fixture.dir.path().join("absent.txt"),
        fixture.write("boq_block_a.txt", UNPRICED_ESTIMATE),
        fixture.write("notes.txt", "Minutes of a call about lunch options.\n"),
    ];

    let results = fixture
        .pipeline
        .process_many(paths.clone(), ProcessOptions::default())
        .await;

    let returned: Vec<&Path> = results.iter().map(|(path, _)| path.as_path()).collect();
    let expected: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
    assert_eq!(returned, expected);

    let categories: Vec<Option<ErrorCategory>> = results
        .iter()
        .map(|(_, result)| result.as_ref().err().map(|failure| failure.category()))
        .collect();
    assert_eq!(
        categories,
        vec![
            None,
            Some(ErrorCategory::Validation),
            Some(ErrorCategory::QualityGate),
            Some(ErrorCategory::LowConfidence),
        ]
    );
}
