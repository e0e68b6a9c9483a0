//! Work sequence: dependency-ordered work items with duration estimates.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use super::candidates::SeedTag;
use super::error::PipelineError;
use super::markup::{EdgeKind, MarkupGraph, NodeId, NodeKind};
use super::metadata::MetadataBundle;
use super::types::{DocumentId, SequencedItem, WorkSequence};
use crate::retry::RetryPolicy;
use crate::stores::{GraphStore, StoreError};

const DEFAULT_DAYS: f32 = 1.0;
const MIN_DAYS: f32 = 0.5;
const HOURS_PER_DAY: f32 = 8.0;
const DAYS_PER_WEEK: f32 = 5.0;

static EXPLICIT_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:[.,]\d+)?)\s*(working days?|days?|weeks?|hours?|hrs?|рабочих дн\w*|дн(?:я|ей|ь)|недел\w*|час\w*)\b",
    )
    .expect("duration pattern")
});

/// Output per day for a tag and unit.
fn productivity(tag: SeedTag, unit: &str) -> Option<f32> {
    let unit = unit.to_lowercase();
    let per_day = match (tag, unit.as_str()) {
        (SeedTag::Earthworks, "m3" | "м3") => 150.0,
        (SeedTag::Earthworks, "m2" | "м2") => 400.0,
        (SeedTag::Concrete, "m3" | "м3") => 30.0,
        (SeedTag::Concrete, "t" | "т" | "тн") => 2.0,
        (SeedTag::Masonry, "m3" | "м3") => 6.0,
        (SeedTag::Masonry, "m2" | "м2") => 15.0,
        (SeedTag::Steel, "t" | "т" | "тн" | "tonne" | "tonnes") => 5.0,
        (SeedTag::Installation, "m" | "м" | "lm") => 50.0,
        (SeedTag::Installation, "pcs" | "nr" | "шт") => 10.0,
        (SeedTag::Finishing, "m2" | "м2") => 80.0,
        _ => return None,
    };
    Some(per_day)
}

/// Estimated duration of a work item in working days.
fn estimate_days(text: &str, tag: SeedTag, quantity: Option<(f64, &str)>) -> f32 {
    if let Some(captures) = EXPLICIT_DURATION.captures(text)
        && let Ok(value) = captures[1].replace(',', ".").parse::<f32>()
    {
        let unit = captures[2].to_lowercase();
        let days = if unit.starts_with("week") || unit.starts_with("недел") {
            value * DAYS_PER_WEEK
        } else if unit.starts_with("h") || unit.starts_with("час") {
            value / HOURS_PER_DAY
        } else {
            value
        };
        return days.max(MIN_DAYS);
    }
    if let Some((value, unit)) = quantity
        && let Some(per_day) = productivity(tag, unit)
    {
        let days = value as f32 / per_day;
        // Round up to half days.
        return ((days * 2.0).ceil() / 2.0).max(MIN_DAYS);
    }
    DEFAULT_DAYS
}

/// Build the sequence of the work items in `graph`.
pub fn build(document_id: DocumentId, graph: &MarkupGraph, metadata: &MetadataBundle) -> WorkSequence {
    let items: Vec<NodeId> = graph
        .nodes_of(NodeKind::WorkItem)
        .into_iter()
        .filter(|id| {
            graph
                .node(*id)
                .and_then(|node| node.tag)
                .is_some_and(|tag| tag.is_work())
        })
        .collect();
    let (order, broken) = graph.dependency_order(&items);

    let mut warnings: Vec<String> = broken
        .iter()
        .map(|(item, dep)| format!("dependency cycle broken: {item} no longer waits for {dep}"))
        .collect();
    if !warnings.is_empty() {
        tracing::warn!(%document_id, broken = broken.len(), "Work sequence had dependency cycles");
    }

    let mut finish: HashMap<NodeId, f32> = HashMap::new();
    let mut sequenced = Vec::with_capacity(order.len());
    for (ordinal, id) in order.into_iter().enumerate() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let tag = node.tag.unwrap_or(SeedTag::General);
        let depends_on: Vec<NodeId> = graph
            .targets(id, EdgeKind::DependsOn)
            .into_iter()
            .filter(|dep| finish.contains_key(dep) && !broken.contains(&(id, *dep)))
            .collect();

        let quantity = metadata
            .quantities
            .iter()
            .find(|quantity| node.parent == Some(quantity.provenance.node) && node.text.contains(&quantity.raw))
            .map(|quantity| (quantity.value, quantity.unit.as_str()));
        let estimated_days = estimate_days(&node.text, tag, quantity);
        let earliest_start_day = depends_on
            .iter()
            .filter_map(|dep| finish.get(dep))
            .fold(0.0_f32, |latest, end| latest.max(*end));
        finish.insert(id, earliest_start_day + estimated_days);

        sequenced.push(SequencedItem {
            node: id,
            ordinal,
            title: node.text.clone(),
            tag: tag.as_str().to_string(),
            section_path: graph.section_path(id),
            depends_on,
            estimated_days,
            earliest_start_day,
        });
    }

    if sequenced.len() < items.len() {
        warnings.push(format!(
            "{} work item(s) could not be ordered",
            items.len() - sequenced.len()
        ));
    }
    let total_days = finish.values().fold(0.0_f32, |latest, end| latest.max(*end));
    WorkSequence {
        document_id,
        items: sequenced,
        total_days,
        warnings,
    }
}

/// Write `sequence` with retries, replacing any previous sequence of the document.
pub async fn persist(
    store: &dyn GraphStore,
    sequence: &WorkSequence,
    retry: &RetryPolicy,
) -> Result<(), PipelineError> {
    let (result, attempts) = retry
        .run(
            "replace_work_sequence",
            |error: &StoreError| matches!(error, StoreError::Unavailable(_) | StoreError::Io(_)),
            |_| store.replace_work_sequence(sequence),
        )
        .await;
    match result {
        Ok(()) => {
            tracing::debug!(document_id = %sequence.document_id, items = sequence.items.len(), attempts, "Persisted work sequence");
            Ok(())
        }
        Err(error) => Err(PipelineError::Persistence(format!(
            "work sequence write failed after {attempts} attempt(s): {error}"
        ))),
    }
}

/// Remove any stored work sequence of `document_id`.
pub async fn clear(
    store: &dyn GraphStore,
    document_id: DocumentId,
    retry: &RetryPolicy,
) -> Result<(), PipelineError> {
    let (result, attempts) = retry
        .run(
            "delete_work_sequence",
            |error: &StoreError| matches!(error, StoreError::Unavailable(_) | StoreError::Io(_)),
            |_| store.delete_work_sequence(document_id),
        )
        .await;
    result.map_err(|error| {
        PipelineError::Persistence(format!(
            "work sequence removal failed after {attempts} attempt(s): {error}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::markup::MarkupGenerator;
    use crate::pipeline::skeleton::analyze;
    use crate::pipeline::{DocumentType, candidates, metadata};
    use crate::stores::InMemoryGraphStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const PLAN: &str = "\
1 Earthworks
1.1 Excavate the foundation pit, 300 m3 of soil.
1.2 Backfill and compact the sinuses within 2 days.

2 Concrete works
2.1 Pour concrete C25/30 into the footings, 45 m3.
2.2 Strip the formwork after 3 days of curing.
";

    async fn graph_of(text: &str) -> (MarkupGraph, MetadataBundle) {
        let skeleton = analyze(text);
        let graph = MarkupGenerator::new(None)
            .generate(
                "plan",
                text,
                &skeleton,
                candidates::extract(text, DocumentType::Project),
            )
            .await
            .graph;
        let bundle = metadata::extract(&graph);
        (graph, bundle)
    }

    #[test]
    fn explicit_durations_win_over_productivity() {
        assert_eq!(estimate_days("cure for 2 weeks", SeedTag::Concrete, Some((45.0, "m3"))), 10.0);
        assert_eq!(estimate_days("test for 4 hours", SeedTag::Inspection, None), 0.5);
        assert_eq!(estimate_days("pour the slab", SeedTag::Concrete, Some((45.0, "m3"))), 1.5);
        assert_eq!(estimate_days("paint the walls", SeedTag::Finishing, None), DEFAULT_DAYS);
    }

    #[tokio::test]
    async fn sequence_follows_dependencies_and_accumulates_days() {
        let (graph, bundle) = graph_of(PLAN).await;
        let sequence = build(DocumentId::new(), &graph, &bundle);
        let tags: Vec<&str> = sequence.items.iter().map(|item| item.tag.as_str()).collect();
        assert_eq!(tags, vec!["earthworks", "earthworks", "concrete", "concrete"]);
        assert_eq!(sequence.items[0].estimated_days, 2.0);
        assert_eq!(sequence.items[1].estimated_days, 2.0);
        assert_eq!(sequence.items[1].earliest_start_day, 2.0);
        assert!(sequence.items[1].depends_on.contains(&sequence.items[0].node));
        assert!(sequence.total_days >= 4.0);
        assert!(sequence.warnings.is_empty());
    }

    struct FlakyStore {
        inner: InMemoryGraphStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl GraphStore for FlakyStore {
        async fn replace_work_sequence(&self, sequence: &WorkSequence) -> Result<(), StoreError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(StoreError::Unavailable("graph store offline".into()));
            }
            self.inner.replace_work_sequence(sequence).await
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

        async fn normative_entry(
            &self,
            code: &str,
        ) -> Result<Option<crate::stores::NormativeEntry>, StoreError> {
            self.inner.normative_entry(code).await
        }
    }

    fn empty_sequence() -> WorkSequence {
        WorkSequence {
            document_id: DocumentId::new(),
            items: Vec::new(),
            total_days: 0.0,
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn persistence_retries_transient_failures() {
        let store = FlakyStore {
            inner: InMemoryGraphStore::new(),
            failures: AtomicU32::new(2),
        };
        let sequence = empty_sequence();
        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        persist(&store, &sequence, &retry).await.expect("third attempt succeeds");
        assert!(store.work_sequence(sequence.document_id).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn persistence_failure_after_retries_is_reported() {
        let store = FlakyStore {
            inner: InMemoryGraphStore::new(),
            failures: AtomicU32::new(10),
        };
        let retry = RetryPolicy::new(2, Duration::from_millis(1));
        let error = persist(&store, &empty_sequence(), &retry)
            .await
            .expect_err("store stays down");
        assert!(matches!(error, PipelineError::Persistence(_)));
    }
}
