use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::chunker::ChunkingError;
use super::types::{DocumentId, Stage};
use crate::models::ModelError;
use crate::normative::ResolverError;
use crate::stores::StoreError;

/// Structured error categories surfaced to callers and stored on records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input; never retried.
    Validation,
    /// Classification below the confidence floor.
    LowConfidence,
    /// Post-hoc consistency failure.
    QualityGate,
    /// Normative document superseded by a newer code.
    Obsolete,
    /// Model or store unreachable.
    BackendUnavailable,
    /// Store write failed after retries.
    Persistence,
    /// A stage exceeded its time budget.
    Timeout,
    /// Processing was cancelled between stages.
    Cancelled,
    /// Referenced tool or record does not exist.
    NotFound,
    /// Unexpected failure inside the service.
    Internal,
}

impl ErrorCategory {
    /// Stable snake_case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::LowConfidence => "low_confidence",
            Self::QualityGate => "quality_gate",
            Self::Obsolete => "obsolete",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Persistence => "persistence",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// Whether another attempt may succeed without changing the input.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BackendUnavailable | Self::Timeout)
    }

    /// Whether the category ends in the `rejected` status rather than `failed`.
    pub fn is_rejection(self) -> bool {
        matches!(self, Self::LowConfidence | Self::QualityGate | Self::Obsolete)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document-fatal conditions raised by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable, oversized, empty or unsupported input.
    #[error("Invalid input: {message}")]
    Validation {
        /// What is wrong with the input.
        message: String,
        /// Remedy shown to the caller.
        suggestion: String,
    },
    /// Classification confidence below the configured floor.
    #[error("Document type undetermined: confidence {confidence:.2}, floor {floor:.2}")]
    LowConfidence {
        /// Best confidence reached.
        confidence: f32,
        /// Configured floor.
        floor: f32,
        /// Best lexical guess, for diagnostics only.
        best_guess: Option<String>,
    },
    /// Extracted content is inconsistent with the document type.
    #[error("Quality gate failed: {}", .reasons.join("; "))]
    QualityGate {
        /// Failed checks.
        reasons: Vec<String>,
        /// Score at rejection time.
        score: f32,
    },
    /// The document itself is superseded.
    #[error("Normative document {code} is superseded{}", .replacement.as_ref().map(|r| format!(" by {r}")).unwrap_or_default())]
    Obsolete {
        /// Code of the submitted document.
        code: String,
        /// Current replacement, when known.
        replacement: Option<String>,
    },
    /// A model or store could not be reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A store write failed after retries.
    #[error("Persistence failed: {0}")]
    Persistence(String),
    /// The stage exceeded its timeout.
    #[error("Stage {stage} timed out after {seconds}s")]
    Timeout {
        /// Stage that timed out.
        stage: Stage,
        /// Configured budget.
        seconds: u64,
    },
    /// Cancellation was requested before the stage started.
    #[error("Processing cancelled before stage {stage}")]
    Cancelled {
        /// Stage that did not start.
        stage: Stage,
    },
    /// The referenced document does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Validation error with a suggestion.
    pub fn validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Category of the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::LowConfidence { .. } => ErrorCategory::LowConfidence,
            Self::QualityGate { .. } => ErrorCategory::QualityGate,
            Self::Obsolete { .. } => ErrorCategory::Obsolete,
            Self::BackendUnavailable(_) => ErrorCategory::BackendUnavailable,
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether resubmitting the same content may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Human-readable remedy.
    pub fn suggestion(&self) -> String {
        match self {
            Self::Validation { suggestion, .. } => suggestion.clone(),
            Self::LowConfidence {
                confidence, floor, ..
            } => format!(
                "document type undetermined: confidence {confidence:.2}, floor {floor:.2}; verify this is a supported document category"
            ),
            Self::QualityGate { reasons, .. } => format!(
                "fix the source document so that it satisfies: {}",
                reasons.join("; ")
            ),
            Self::Obsolete { code, replacement } => match replacement {
                Some(replacement) => {
                    format!("{code} has been replaced; submit {replacement} instead")
                }
                None => format!("{code} is no longer in force; check the normative register"),
            },
            Self::BackendUnavailable(_) => {
                "check that the model runtime and stores are reachable, then resubmit to resume"
                    .to_string()
            }
            Self::Persistence(_) => {
                "the store rejected the write; resubmit to resume from the last completed stage"
                    .to_string()
            }
            Self::Timeout { stage, .. } => format!(
                "stage {stage} exceeded its time budget; resubmit to resume or raise the stage timeout"
            ),
            Self::Cancelled { .. } => "resubmit the document to resume processing".to_string(),
            Self::NotFound(_) => "check the document id; list known documents first".to_string(),
            Self::Internal(_) => "report this failure with the service logs".to_string(),
        }
    }
}

impl From<ModelError> for PipelineError {
    fn from(error: ModelError) -> Self {
        if error.is_unavailable() {
            Self::BackendUnavailable(error.to_string())
        } else {
            Self::Internal(error.to_string())
        }
    }
}

impl From<ResolverError> for PipelineError {
    fn from(error: ResolverError) -> Self {
        Self::BackendUnavailable(error.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(message) => Self::BackendUnavailable(message),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<ChunkingError> for PipelineError {
    fn from(error: ChunkingError) -> Self {
        Self::Internal(error.to_string())
    }
}

/// Error returned by [`super::Pipeline::process`], naming the document and stage.
#[derive(Debug, Error)]
#[error("document {document_id:?} failed at {stage}: {source}")]
pub struct PipelineFailure {
    /// Record the failure was attached to; `None` when intake failed before a record existed.
    pub document_id: Option<DocumentId>,
    /// Stage that raised the error.
    pub stage: Stage,
    /// Underlying error.
    #[source]
    pub source: PipelineError,
}

impl PipelineFailure {
    /// Category of the underlying error.
    pub fn category(&self) -> ErrorCategory {
        self.source.category()
    }

    /// Suggested remedy of the underlying error.
    pub fn suggestion(&self) -> String {
        self.source.suggestion()
    }
}
