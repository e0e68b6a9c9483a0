//! Stage artefacts kept after a failed run so the next run continues where it stopped.

use std::collections::HashMap;
use std::sync::Mutex;

use super::chunker::Chunk;
use super::classifier::Classification;
use super::handlers::HandlerOutcome;
use super::markup::MarkupGraph;
use super::metadata::MetadataBundle;
use super::quality::QualityReport;
use super::skeleton::Skeleton;
use super::types::DocumentId;

/// Everything computed for one run of a document, filled stage by stage.
#[derive(Clone, Debug, Default)]
pub struct Artifacts {
    /// Content hash the artefacts were computed from.
    pub content_hash: String,
    /// Extracted document text.
    pub text: String,
    /// Classification result.
    pub classification: Option<Classification>,
    /// Structural skeleton.
    pub skeleton: Option<Skeleton>,
    /// Markup graph.
    pub graph: Option<MarkupGraph>,
    /// Extracted metadata.
    pub metadata: Option<MetadataBundle>,
    /// Quality gate result.
    pub quality: Option<QualityReport>,
    /// Type handler result.
    pub handler: Option<HandlerOutcome>,
    /// Chunks awaiting indexing.
    pub chunks: Option<Vec<Chunk>>,
}

impl Artifacts {
    /// Empty artefacts for `text`.
    pub fn new(content_hash: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            text: text.into(),
            ..Self::default()
        }
    }
}

/// In-process checkpoint table keyed by document id.
#[derive(Debug, Default)]
pub struct Checkpoints {
    entries: Mutex<HashMap<DocumentId, Artifacts>>,
}

impl Checkpoints {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the artefacts of a failed run.
    pub fn save(&self, id: DocumentId, artifacts: Artifacts) {
        self.lock().insert(id, artifacts);
    }

    /// Take the artefacts for `id` when they were computed from `content_hash`.
    pub fn take(&self, id: DocumentId, content_hash: &str) -> Option<Artifacts> {
        let mut entries = self.lock();
        match entries.remove(&id) {
            Some(artifacts) if artifacts.content_hash == content_hash => Some(artifacts),
            _ => None,
        }
    }

    /// Forget the artefacts of `id`.
    pub fn discard(&self, id: DocumentId) {
        self.lock().remove(&id);
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no checkpoint is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, Artifacts>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_only_match_the_same_content() {
        let checkpoints = Checkpoints::new();
        let id = DocumentId::new();
        checkpoints.save(id, Artifacts::new("abc", "text"));
        assert!(checkpoints.take(id, "other").is_none());
        assert!(checkpoints.is_empty());

        checkpoints.save(id, Artifacts::new("abc", "text"));
        assert_eq!(checkpoints.take(id, "abc").map(|a| a.text), Some("text".to_string()));
    }
}
