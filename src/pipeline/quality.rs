//! Post-hoc consistency checks between the document type and what was extracted.

use serde::Serialize;

use super::error::PipelineError;
use super::markup::{MarkupGraph, NodeKind};
use super::metadata::MetadataBundle;
use super::skeleton::Skeleton;
use super::types::DocumentType;

const SOFT_PENALTY: f32 = 0.15;
const COMPLETENESS_WEIGHT: f32 = 0.3;

/// Passed gate: score plus soft findings recorded as warnings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualityReport {
    /// Score in `[0, 1]`.
    pub score: f32,
    /// Soft checks that failed.
    pub warnings: Vec<String>,
}

/// Quality gate with a configured score floor.
#[derive(Clone, Copy, Debug)]
pub struct QualityGate {
    score_floor: f32,
    completeness_floor: f32,
}

impl QualityGate {
    /// Gate rejecting scores below `score_floor`; completeness below `completeness_floor` is a
    /// soft finding.
    pub fn new(score_floor: f32, completeness_floor: f32) -> Self {
        Self {
            score_floor,
            completeness_floor,
        }
    }

    /// Check the extracted artefacts of one document.
    pub fn check(
        &self,
        doc_type: DocumentType,
        skeleton: &Skeleton,
        graph: &MarkupGraph,
        metadata: &MetadataBundle,
    ) -> Result<QualityReport, PipelineError> {
        let hard = hard_failures(doc_type, graph, metadata);

        let mut soft = Vec::new();
        if doc_type == DocumentType::Estimate && metadata.quantities.is_empty() {
            soft.push("estimate lists no quantities".to_string());
        }
        if metadata.dates.is_empty() && doc_type != DocumentType::Normative {
            soft.push("no dates found".to_string());
        }
        if skeleton.completeness < self.completeness_floor {
            soft.push(format!(
                "structure completeness {:.2} below {:.2}",
                skeleton.completeness, self.completeness_floor
            ));
        }
        if metadata.dropped > 0 {
            soft.push(format!(
                "{} metadata item(s) failed provenance checks",
                metadata.dropped
            ));
        }
        let markup_sections = graph.nodes_of(NodeKind::Section).len();
        if markup_sections != skeleton.section_count() {
            soft.push(format!(
                "markup has {markup_sections} sections, skeleton has {}",
                skeleton.section_count()
            ));
        }

        let score = (1.0
            - SOFT_PENALTY * soft.len() as f32
            - COMPLETENESS_WEIGHT * (1.0 - skeleton.completeness.clamp(0.0, 1.0)))
        .clamp(0.0, 1.0);

        if !hard.is_empty() || score < self.score_floor {
            let mut reasons = hard;
            if score < self.score_floor {
                reasons.push(format!(
                    "quality score {score:.2} below floor {:.2}",
                    self.score_floor
                ));
                reasons.extend(soft);
            }
            tracing::info!(doc_type = %doc_type, score, reasons = ?reasons, "Quality gate rejected document");
            return Err(PipelineError::QualityGate { reasons, score });
        }

        Ok(QualityReport {
            score,
            warnings: soft,
        })
    }
}

fn hard_failures(
    doc_type: DocumentType,
    graph: &MarkupGraph,
    metadata: &MetadataBundle,
) -> Vec<String> {
    let mut failures = Vec::new();
    match doc_type {
        DocumentType::Estimate => {
            if metadata.amounts.is_empty() {
                failures.push("estimate contains no monetary amounts".to_string());
            }
        }
        DocumentType::Contract => {
            if metadata.dates.is_empty() {
                failures.push("contract contains no dates".to_string());
            }
            if !metadata.has_party() {
                failures.push("contract names no parties".to_string());
            }
        }
        DocumentType::Normative => {
            if graph.nodes_of(NodeKind::Section).is_empty() {
                failures.push("normative document has no sections".to_string());
            }
        }
        DocumentType::Project => {
            let has_work = graph.nodes_of(NodeKind::WorkItem).into_iter().any(|id| {
                graph
                    .node(id)
                    .and_then(|node| node.tag)
                    .is_some_and(|tag| tag.is_work())
            });
            if !has_work {
                failures.push("project document describes no work items".to_string());
            }
        }
        DocumentType::Report => {
            if metadata.dates.is_empty() {
                failures.push("report contains no dates".to_string());
            }
        }
        DocumentType::Drawing => {
            if graph.nodes_of(NodeKind::Figure).is_empty() && metadata.quantities.is_empty() {
                failures.push("drawing has neither figures nor dimensions".to_string());
            }
        }
    }
    failures
}
