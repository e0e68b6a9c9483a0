use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::error::ErrorCategory;
use super::markup::NodeId;
use crate::stores::current_timestamp_rfc3339;

/// Stable identifier of a document record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Document categories of the construction domain taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Building codes, standards and regulations.
    Normative,
    /// Project documentation: method statements, work plans, specifications.
    Project,
    /// Cost estimates, bills of quantities, invoices.
    Estimate,
    /// Contracts, agreements and their amendments.
    Contract,
    /// Drawing sheets and CAD exports.
    Drawing,
    /// Inspection, test and progress reports.
    Report,
}

impl DocumentType {
    /// Every document type, in a stable order.
    pub const ALL: [DocumentType; 6] = [
        Self::Normative,
        Self::Project,
        Self::Estimate,
        Self::Contract,
        Self::Drawing,
        Self::Report,
    ];

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normative => "normative",
            Self::Project => "project",
            Self::Estimate => "estimate",
            Self::Contract => "contract",
            Self::Drawing => "drawing",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

/// Lifecycle status of a document record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Record created, nothing decided yet.
    Pending,
    /// Type and subtype assigned.
    Classified,
    /// Structural skeleton built.
    Structured,
    /// Quality gate passed.
    Validated,
    /// Terminally rejected; see the failure info for the reason.
    Rejected,
    /// Chunks written to the vector store.
    Indexed,
    /// Stopped on a retryable failure; resumable.
    Failed,
}

impl DocumentStatus {
    /// Whether the status ends processing for this content.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Indexed)
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Classified => "classified",
            Self::Structured => "structured",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Content hashing and duplicate lookup.
    DuplicateCheck,
    /// Type classification.
    Classification,
    /// Structural skeleton.
    Structure,
    /// Candidate extraction and markup generation.
    Markup,
    /// Metadata extraction from the markup graph.
    Metadata,
    /// Consistency checks against type requirements.
    QualityGate,
    /// Type-specific handler.
    TypeHandling,
    /// Work sequence build and persistence.
    WorkSequence,
    /// Structure-aligned chunking.
    Chunking,
    /// Embedding and vector store write.
    Indexing,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 10] = [
        Self::DuplicateCheck,
        Self::Classification,
        Self::Structure,
        Self::Markup,
        Self::Metadata,
        Self::QualityGate,
        Self::TypeHandling,
        Self::WorkSequence,
        Self::Chunking,
        Self::Indexing,
    ];

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateCheck => "duplicate_check",
            Self::Classification => "classification",
            Self::Structure => "structure",
            Self::Markup => "markup",
            Self::Metadata => "metadata",
            Self::QualityGate => "quality_gate",
            Self::TypeHandling => "type_handling",
            Self::WorkSequence => "work_sequence",
            Self::Chunking => "chunking",
            Self::Indexing => "indexing",
        }
    }

    /// Zero-based position in the stage sequence.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stage following this one, if any.
    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Whether the stage may call a model or a store, which selects the longer timeout.
    pub fn is_model_backed(self) -> bool {
        matches!(
            self,
            Self::Classification
                | Self::Markup
                | Self::TypeHandling
                | Self::WorkSequence
                | Self::Indexing
        )
    }

    /// Progress percentage reported once the stage completes.
    pub fn progress(self) -> u8 {
        ((self.index() + 1) * 100 / Self::ALL.len()) as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a document stopped, attached to the record for operator visibility.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Error category.
    pub category: ErrorCategory,
    /// Stage that raised the error.
    pub stage: Stage,
    /// Error message.
    pub message: String,
    /// Suggested remedy.
    pub suggestion: String,
}

/// Persistent state of one unique document content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Record identifier; also keys chunks and work sequences.
    pub id: DocumentId,
    /// SHA-256 of the raw file bytes, hex encoded.
    pub content_hash: String,
    /// Path the content was first (or most recently) submitted under.
    pub source_path: String,
    /// File name component of `source_path`.
    pub file_name: String,
    /// Detected document type.
    pub doc_type: Option<DocumentType>,
    /// Detected subtype label.
    pub subtype: Option<String>,
    /// Classification confidence.
    pub confidence: Option<f32>,
    /// Skeleton completeness estimate.
    pub completeness: Option<f32>,
    /// Quality gate score.
    pub quality_score: Option<f32>,
    /// Lifecycle status.
    pub status: DocumentStatus,
    /// Last stage that committed successfully.
    pub last_stage: Option<Stage>,
    /// Stage-local recoverable conditions.
    pub warnings: Vec<String>,
    /// Handler notes such as estimate totals.
    #[serde(default)]
    pub notes: Vec<String>,
    /// Failure that stopped the latest run.
    pub failure: Option<FailureInfo>,
    /// Number of chunks indexed for this document.
    pub chunk_count: usize,
    /// Number of full or resumed runs.
    pub attempts: u32,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    /// RFC3339 timestamp of the last update.
    pub updated_at: String,
}

impl DocumentRecord {
    /// Fresh `pending` record for content first seen at `path`.
    pub fn new(path: &Path, content_hash: String) -> Self {
        let now = current_timestamp_rfc3339();
        Self {
            id: DocumentId::new(),
            content_hash,
            source_path: path.display().to_string(),
            file_name: file_name_of(path),
            doc_type: None,
            subtype: None,
            confidence: None,
            completeness: None,
            quality_score: None,
            status: DocumentStatus::Pending,
            last_stage: None,
            warnings: Vec::new(),
            notes: Vec::new(),
            failure: None,
            chunk_count: 0,
            attempts: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_rfc3339();
    }

    /// Record a warning once.
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// Reset per-run fields before processing the content again from scratch.
    pub fn reset_for_rerun(&mut self, path: &Path) {
        self.source_path = path.display().to_string();
        self.file_name = file_name_of(path);
        self.doc_type = None;
        self.subtype = None;
        self.confidence = None;
        self.completeness = None;
        self.quality_score = None;
        self.status = DocumentStatus::Pending;
        self.last_stage = None;
        self.warnings.clear();
        self.notes.clear();
        self.failure = None;
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// One work item in a persisted sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedItem {
    /// Markup graph node of the work item.
    pub node: NodeId,
    /// Zero-based execution order.
    pub ordinal: usize,
    /// Work item text.
    pub title: String,
    /// Trade or clause tag.
    pub tag: String,
    /// Section path of the work item.
    pub section_path: Vec<String>,
    /// Nodes that must finish first.
    pub depends_on: Vec<NodeId>,
    /// Estimated duration in working days.
    pub estimated_days: f32,
    /// Earliest start, in days from project start.
    pub earliest_start_day: f32,
}

/// Ordered, dependency-annotated work items of one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkSequence {
    /// Owning document.
    pub document_id: DocumentId,
    /// Items in execution order.
    pub items: Vec<SequencedItem>,
    /// Length of the critical path in working days.
    pub total_days: f32,
    /// Conditions such as broken dependency cycles.
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_progress_monotonically_to_100() {
        let progress: Vec<u8> = Stage::ALL.iter().map(|stage| stage.progress()).collect();
        assert!(progress.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(Stage::Chunking.next(), Some(Stage::Indexing));
        assert_eq!(Stage::Indexing.next(), None);
    }

    #[test]
    fn document_types_round_trip_labels() {
        for kind in DocumentType::ALL {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
        assert!("memo".parse::<DocumentType>().is_err());
    }

    #[test]
    fn warnings_are_deduplicated() {
        let mut record = DocumentRecord::new(Path::new("/tmp/a.txt"), "abc".into());
        record.warn("malformed table");
        record.warn("malformed table");
        assert_eq!(record.warnings.len(), 1);
        assert_eq!(record.file_name, "a.txt");
        assert_eq!(record.status, DocumentStatus::Pending);
    }
}
