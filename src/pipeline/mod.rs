//! Document processing pipeline: intake, classification, structure, markup, metadata,
//! validation, type handling, work sequencing, chunking and indexing.

pub mod candidates;
mod checkpoint;
pub mod chunker;
pub mod classifier;
mod error;
mod events;
pub mod handlers;
pub mod indexer;
pub mod markup;
pub mod metadata;
mod orchestrator;
pub mod quality;
pub mod sequence;
pub mod skeleton;
pub mod source;
mod types;

pub use checkpoint::{Artifacts, Checkpoints};
pub use chunker::{Chunk, ChunkSettings, Chunker, ChunkingError};
pub use classifier::{Classification, Classifier, ClassifierSettings};
pub use error::{ErrorCategory, PipelineError, PipelineFailure};
pub use events::{EventSink, ProgressEvent};
pub use handlers::{HandlerContext, HandlerOutcome, HandlerTable, TypeHandler};
pub use indexer::{Indexer, IndexerSettings};
pub use orchestrator::{Pipeline, PipelineDeps, PipelineSettings, ProcessOptions};
pub use quality::{QualityGate, QualityReport};
pub use source::{SourceDocument, SourceFormat, load_source};
pub use types::{
    DocumentId, DocumentRecord, DocumentStatus, DocumentType, FailureInfo, SequencedItem, Stage,
    WorkSequence,
};
