use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_submitted: AtomicU64,
    documents_indexed: AtomicU64,
    documents_rejected: AtomicU64,
    documents_failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    resumed_runs: AtomicU64,
    chunks_indexed: AtomicU64,
    degraded_fallbacks: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission entering the pipeline.
    pub fn record_submission(&self) {
        self.documents_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an indexed document and the number of chunks written for it.
    pub fn record_indexed(&self, chunk_count: u64) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a document that ended in the `rejected` status.
    pub fn record_rejected(&self) {
        self.documents_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that stopped on a retryable failure.
    pub fn record_failed(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a submission answered from an existing indexed record.
    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that continued from a checkpoint.
    pub fn record_resume(&self) {
        self.resumed_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stage that fell back to lexical output because a model was unavailable.
    pub fn record_degraded(&self) {
        self.degraded_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_submitted: self.documents_submitted.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            documents_rejected: self.documents_rejected.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            resumed_runs: self.resumed_runs.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            degraded_fallbacks: self.degraded_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Submissions received since startup, duplicates included.
    pub documents_submitted: u64,
    /// Documents that reached the `indexed` status.
    pub documents_indexed: u64,
    /// Documents rejected by classification, the quality gate or type handling.
    pub documents_rejected: u64,
    /// Runs that stopped on a retryable failure.
    pub documents_failed: u64,
    /// Submissions short-circuited by the duplicate check.
    pub duplicates_skipped: u64,
    /// Runs that resumed from a checkpoint.
    pub resumed_runs: u64,
    /// Total chunk count written across all indexed documents.
    pub chunks_indexed: u64,
    /// Stages completed with lexical output after a model backend was unavailable.
    pub degraded_fallbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = PipelineMetrics::new();
        metrics.record_indexed(2);
        metrics.record_indexed(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_indexed, 2);
        assert_eq!(snapshot.chunks_indexed, 5);
    }

    #[test]
    fn outcome_counters_are_independent() {
        let metrics = PipelineMetrics::new();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_duplicate();
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_submitted, 2);
        assert_eq!(snapshot.duplicates_skipped, 1);
        assert_eq!(snapshot.documents_rejected, 1);
        assert_eq!(snapshot.documents_indexed, 0);
        assert_eq!(snapshot.degraded_fallbacks, 0);
    }
}
