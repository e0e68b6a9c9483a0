//! Type-specific processing after the quality gate.
//!
//! The table holds one handler per [`DocumentType`] and is built from an exhaustive `match`, so a
//! new type does not compile until it has a handler.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::error::PipelineError;
use super::markup::{EdgeKind, MarkupGraph, NodeId, NodeKind};
use super::metadata::{EntityKind, MetadataBundle};
use super::types::DocumentType;
use crate::normative::{CodeStatus, NormativeResolver};

/// Inputs shared by every handler.
pub struct HandlerContext<'a> {
    /// Document type decided by the classifier.
    pub doc_type: DocumentType,
    /// Subtype label.
    pub subtype: &'a str,
    /// Markup graph.
    pub graph: &'a MarkupGraph,
    /// Extracted metadata.
    pub metadata: &'a MetadataBundle,
}

/// What a handler decided.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HandlerOutcome {
    /// Whether a work sequence should be built and persisted.
    pub build_sequence: bool,
    /// Notes attached to the record.
    pub notes: Vec<String>,
    /// Recoverable findings such as superseded references.
    pub warnings: Vec<String>,
}

/// Processing specific to one document type.
#[async_trait]
pub trait TypeHandler: Send + Sync {
    /// Type served by this handler.
    fn doc_type(&self) -> DocumentType;

    /// Run the handler.
    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError>;
}

/// Handlers keyed by document type.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<DocumentType, Arc<dyn TypeHandler>>,
}

impl HandlerTable {
    /// One handler per document type, all checking references through `resolver`.
    pub fn new(resolver: Arc<NormativeResolver>) -> Self {
        let handlers = DocumentType::ALL
            .into_iter()
            .map(|doc_type| (doc_type, handler_for(doc_type, resolver.clone())))
            .collect();
        Self { handlers }
    }

    /// Replace the handler for its type.
    pub fn with_handler(mut self, handler: Arc<dyn TypeHandler>) -> Self {
        self.handlers.insert(handler.doc_type(), handler);
        self
    }

    /// Run the handler registered for `ctx.doc_type`.
    pub async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let handler = self.handlers.get(&ctx.doc_type).ok_or_else(|| {
            PipelineError::Internal(format!("no handler registered for {}", ctx.doc_type))
        })?;
        handler.handle(ctx).await
    }
}

fn handler_for(doc_type: DocumentType, resolver: Arc<NormativeResolver>) -> Arc<dyn TypeHandler> {
    let references = ReferenceCheck { resolver };
    match doc_type {
        DocumentType::Normative => Arc::new(NormativeHandler { references }),
        DocumentType::Project => Arc::new(ProjectHandler { references }),
        DocumentType::Estimate => Arc::new(EstimateHandler { references }),
        DocumentType::Contract => Arc::new(ContractHandler { references }),
        DocumentType::Drawing => Arc::new(DrawingHandler { references }),
        DocumentType::Report => Arc::new(ReportHandler { references }),
    }
}

/// Resolves the codes cited by a document.
struct ReferenceCheck {
    resolver: Arc<NormativeResolver>,
}

impl ReferenceCheck {
    /// Warnings for every cited code that is no longer current.
    async fn warnings(
        &self,
        graph: &MarkupGraph,
        skip: Option<&str>,
    ) -> Result<Vec<String>, PipelineError> {
        let mut warnings = Vec::new();
        for id in graph.nodes_of(NodeKind::Reference) {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if skip == Some(node.title.as_str()) {
                continue;
            }
            let check = self.resolver.is_current(&node.title).await?;
            match (check.status, &check.replacement) {
                (CodeStatus::Superseded, Some(replacement)) => warnings.push(format!(
                    "references superseded {}; current edition is {replacement}",
                    check.code
                )),
                (CodeStatus::Superseded | CodeStatus::Withdrawn, _) => {
                    warnings.push(format!("references {} which is no longer in force", check.code))
                }
                _ => {}
            }
        }
        Ok(warnings)
    }
}

struct NormativeHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for NormativeHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Normative
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let own_code = designation(ctx.graph);

        let mut outcome = HandlerOutcome::default();
        if let Some(code) = &own_code {
            let check = self.references.resolver.is_current(code).await?;
            if !check.is_current() {
                return Err(PipelineError::Obsolete {
                    code: check.code,
                    replacement: check.replacement,
                });
            }
            outcome.notes.push(format!("designation {}", check.code));
        }
        outcome.warnings = self
            .references
            .warnings(ctx.graph, own_code.as_deref())
            .await?;
        Ok(outcome)
    }
}

/// Code a normative document is designated by: the earliest code cited ahead of the first
/// numbered clause, or the earliest code at all when there are no numbered clauses.
fn designation(graph: &MarkupGraph) -> Option<String> {
    let body_start = graph
        .nodes()
        .iter()
        .filter(|node| node.kind == NodeKind::Section && node.number.is_some())
        .map(|node| node.span.start)
        .min()
        .unwrap_or(usize::MAX);
    let mut first_cited: HashMap<NodeId, usize> = HashMap::new();
    for edge in graph
        .edges()
        .iter()
        .filter(|edge| edge.kind == EdgeKind::References)
    {
        let (Some(source), Some(target)) = (graph.node(edge.from), graph.node(edge.to)) else {
            continue;
        };
        if target.kind != NodeKind::Reference {
            continue;
        }
        let start = first_cited.entry(target.id).or_insert(usize::MAX);
        *start = (*start).min(source.span.start);
    }
    first_cited
        .into_iter()
        .filter(|(_, start)| *start < body_start)
        .min_by_key(|(id, start)| (*start, *id))
        .and_then(|(id, _)| graph.node(id))
        .map(|node| node.title.clone())
}

struct ProjectHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for ProjectHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Project
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let work_items = ctx
            .graph
            .nodes_of(NodeKind::WorkItem)
            .into_iter()
            .filter_map(|id| ctx.graph.node(id))
            .filter(|node| node.tag.is_some_and(|tag| tag.is_work()))
            .count();
        Ok(HandlerOutcome {
            build_sequence: work_items > 0,
            notes: vec![format!("{work_items} work item(s) in {}", ctx.subtype)],
            warnings: self.references.warnings(ctx.graph, None).await?,
        })
    }
}

struct EstimateHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for EstimateHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Estimate
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
        for amount in &ctx.metadata.amounts {
            *totals.entry(amount.currency.as_str()).or_default() += amount.value;
        }
        let notes = totals
            .into_iter()
            .map(|(currency, total)| format!("total {currency} {total:.2}"))
            .collect();
        Ok(HandlerOutcome {
            build_sequence: false,
            notes,
            warnings: self.references.warnings(ctx.graph, None).await?,
        })
    }
}

struct ContractHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for ContractHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Contract
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let parties: Vec<&str> = ctx
            .metadata
            .entities
            .iter()
            .filter(|entity| matches!(entity.kind, EntityKind::Organisation | EntityKind::Party))
            .map(|entity| entity.value.as_str())
            .collect();
        let mut notes = Vec::new();
        if !parties.is_empty() {
            notes.push(format!("parties: {}", parties.join(", ")));
        }
        if let Some(first) = ctx.metadata.dates.iter().map(|date| &date.value).min() {
            notes.push(format!("earliest date {first}"));
        }
        Ok(HandlerOutcome {
            build_sequence: false,
            notes,
            warnings: self.references.warnings(ctx.graph, None).await?,
        })
    }
}

struct DrawingHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for DrawingHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Drawing
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let figures = ctx.graph.nodes_of(NodeKind::Figure).len();
        Ok(HandlerOutcome {
            build_sequence: false,
            notes: vec![format!(
                "{figures} figure(s), {} dimension(s)",
                ctx.metadata.quantities.len()
            )],
            warnings: self.references.warnings(ctx.graph, None).await?,
        })
    }
}

struct ReportHandler {
    references: ReferenceCheck,
}

#[async_trait]
impl TypeHandler for ReportHandler {
    fn doc_type(&self) -> DocumentType {
        DocumentType::Report
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome, PipelineError> {
        let findings = ctx
            .graph
            .nodes_of(NodeKind::WorkItem)
            .into_iter()
            .filter_map(|id| ctx.graph.node(id))
            .filter(|node| node.tag == Some(super::candidates::SeedTag::Finding))
            .count();
        Ok(HandlerOutcome {
            build_sequence: false,
            notes: vec![format!("{findings} finding(s)")],
            warnings: self.references.warnings(ctx.graph, None).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::markup::MarkupGenerator;
    use crate::pipeline::skeleton::analyze;
    use crate::pipeline::{candidates, metadata};
    use crate::stores::{InMemoryGraphStore, NormativeEntry, NormativeStatus};

    fn resolver() -> Arc<NormativeResolver> {
        let store = InMemoryGraphStore::with_normative_entries([
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
                title: None,
            },
        ]);
        Arc::new(NormativeResolver::new(Arc::new(store)))
    }

    async fn run(doc_type: DocumentType, text: &str) -> Result<HandlerOutcome, PipelineError> {
        let skeleton = analyze(text);
        let graph = MarkupGenerator::new(None)
            .generate("doc", text, &skeleton, candidates::extract(text, doc_type))
            .await
            .graph;
        let bundle = metadata::extract(&graph);
        HandlerTable::new(resolver())
            .handle(&HandlerContext {
                doc_type,
                subtype: "test",
                graph: &graph,
                metadata: &bundle,
            })
            .await
    }

    #[tokio::test]
    async fn superseded_normative_document_is_obsolete() {
        let text = "SNiP 3.03.01-87\nLoad-bearing and enclosing structures\n1 Scope\nThese rules apply to concrete works.\n";
        let error = run(DocumentType::Normative, text)
            .await
            .expect_err("obsolete");
        let PipelineError::Obsolete { code, replacement } = error else {
            panic!("unexpected error {error:?}");
        };
        assert_eq!(code, "SNIP 3.03.01-87");
        assert_eq!(replacement.as_deref(), Some("SP 70.13330.2012"));
    }

    #[tokio::test]
    async fn codes_cited_inside_clauses_are_not_the_designation() {
        let text = "Load-bearing and enclosing structures\n1 Scope\n1.1 These rules replace SNiP 3.03.01-87 for concrete works.\n";
        let outcome = run(DocumentType::Normative, text).await.expect("handled");
        assert!(outcome.notes.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("SP 70.13330.2012"));
    }

    #[tokio::test]
    async fn current_designation_is_noted() {
        let text = "SP 70.13330.2012\nLoad-bearing and enclosing structures\n1 Scope\n1.1 Applies to concrete works.\n";
        let outcome = run(DocumentType::Normative, text).await.expect("handled");
        assert_eq!(outcome.notes, vec!["designation SP 70.13330.2012".to_string()]);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn superseded_references_become_warnings() {
        let text = "1 Concrete works\nPour concrete in accordance with SNiP 3.03.01-87.\n";
        let outcome = run(DocumentType::Project, text).await.expect("handled");
        assert!(outcome.build_sequence);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("SP 70.13330.2012"));
    }

    #[tokio::test]
    async fn estimate_totals_per_currency() {
        let text = "1 Costs\n| Item | Amount |\n| Concrete | 1 200 USD |\n| Rebar | 800 USD |\n| Labour | 5 000 RUB |\n";
        let outcome = run(DocumentType::Estimate, text).await.expect("handled");
        assert_eq!(
            outcome.notes,
            vec!["total RUB 5000.00".to_string(), "total USD 2000.00".to_string()]
        );
    }
}
