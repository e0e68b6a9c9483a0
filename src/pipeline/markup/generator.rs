use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::LazyLock;

use super::graph::{EdgeKind, MarkupGraph, NodeId, NodeKind};
use crate::models::{ModelCache, ModelError, ModelRole};
use crate::normative::detect_codes;
use crate::pipeline::candidates::CandidateWorkItem;
use crate::pipeline::skeleton::{ElementKind, Skeleton, is_separator_row, line_starts};

static CLAUSE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{1,3}(?:\.\d{1,3})*[.)]?\s|\(?[a-zа-я]\)\s|[-–•*]\s)")
        .expect("clause start pattern")
});

static CROSS_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:section|clause|item|раздел\w*|пункт\w*|п\.)\s*(\d{1,3}(?:\.\d{1,3})*)")
        .expect("cross reference pattern")
});

static AFTER_COMPLETION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:after|upon|following)\s+(?:the\s+)?completion\s+of\s+(?:(?:the\s+)?works?\s+(?:in|of|under)\s+)?(?:section|clause|item)?\s*(\d{1,3}(?:\.\d{1,3})*)|после\s+(?:завершения|окончания)\s+(?:работ\s+)?(?:по\s+)?(?:раздела?|пункта?)?\s*(\d{1,3}(?:\.\d{1,3})*)",
    )
    .expect("completion link pattern")
});

const WORK_ITEM_TITLE_CHARS: usize = 80;

/// Whether a line opens a new clause-level block.
pub(crate) fn starts_clause(line: &str) -> bool {
    CLAUSE_START.is_match(line)
}

/// Result of markup generation.
#[derive(Clone, Debug)]
pub struct MarkupOutcome {
    /// Generated graph.
    pub graph: MarkupGraph,
    /// Recoverable conditions, including model fallbacks.
    pub warnings: Vec<String>,
    /// Seeds that did not fit inside a single paragraph or row, or were discarded by the model.
    pub discarded_seeds: usize,
    /// Whether the model was unreachable and the lexical graph was kept.
    pub degraded: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Refinement {
    #[serde(default)]
    discard: Vec<usize>,
    #[serde(default)]
    depends: Vec<(usize, usize)>,
}

/// Builds markup graphs, optionally refining work items with the generation model.
#[derive(Clone, Default)]
pub struct MarkupGenerator {
    cache: Option<ModelCache>,
}

impl MarkupGenerator {
    /// Generator that asks the generation model from `cache` for refinement, when given.
    pub fn new(cache: Option<ModelCache>) -> Self {
        Self { cache }
    }

    /// Build the markup graph of `text` from its skeleton and aligned seeds.
    pub async fn generate(
        &self,
        title: &str,
        text: &str,
        skeleton: &Skeleton,
        seeds: Vec<CandidateWorkItem>,
    ) -> MarkupOutcome {
        let mut graph = build_structure(title, text, skeleton);
        let mut warnings = Vec::new();
        let seed_count = seeds.len();

        let mut aligned = align_seeds(&graph, seeds);
        let mut refinement = Refinement::default();
        let mut degraded = false;
        if !aligned.is_empty()
            && let Some(cache) = &self.cache
        {
            match self.refine(cache, &aligned).await {
                Ok(Some(reply)) => refinement = reply,
                Ok(None) => {}
                Err(RefineError::Model(error)) => {
                    degraded = error.is_unavailable();
                    tracing::warn!(error = %error, "Markup refinement unavailable; keeping lexical markup");
                    warnings.push(format!(
                        "markup refinement skipped ({error}); lexical markup kept"
                    ));
                }
                Err(RefineError::Malformed(reason)) => {
                    tracing::warn!(reason = %reason, "Discarding malformed markup refinement");
                    warnings.push("markup refinement reply was malformed; lexical markup kept".into());
                }
            }
        }

        let discard: Vec<usize> = refinement.discard.clone();
        let mut index_to_node: HashMap<usize, NodeId> = HashMap::new();
        for (index, (leaf, seed)) in aligned.drain(..).enumerate() {
            if discard.contains(&index) {
                continue;
            }
            let title: String = seed.text.chars().take(WORK_ITEM_TITLE_CHARS).collect();
            let id = graph.add_child(leaf, NodeKind::WorkItem, title, seed.text, seed.span);
            if let Some(node) = graph.node_mut(id) {
                node.tag = Some(seed.tag);
            }
            index_to_node.insert(index, id);
        }
        let discarded_seeds = seed_count - index_to_node.len();

        link_consecutive_work(&mut graph);
        link_completion_clauses(&mut graph);
        for (dependent, prerequisite) in refinement.depends {
            if let (Some(from), Some(to)) =
                (index_to_node.get(&dependent), index_to_node.get(&prerequisite))
            {
                graph.add_edge(*from, *to, EdgeKind::DependsOn);
            }
        }
        link_references(&mut graph);

        tracing::debug!(
            nodes = graph.len(),
            edges = graph.edges().len(),
            discarded_seeds,
            degraded,
            "Generated markup graph"
        );
        MarkupOutcome {
            graph,
            warnings,
            discarded_seeds,
            degraded,
        }
    }

    async fn refine(
        &self,
        cache: &ModelCache,
        aligned: &[(NodeId, CandidateWorkItem)],
    ) -> Result<Option<Refinement>, RefineError> {
        let handle = cache
            .acquire(ModelRole::Generation)
            .await
            .map_err(RefineError::Model)?;
        let prompt = refinement_prompt(aligned);
        let reply = handle.complete(&prompt).await.map_err(RefineError::Model)?;
        parse_refinement(&reply, aligned.len())
    }
}

enum RefineError {
    Model(ModelError),
    Malformed(String),
}

fn refinement_prompt(aligned: &[(NodeId, CandidateWorkItem)]) -> String {
    let mut prompt = String::from(
        "You review work items extracted from a construction document.\n\
         Reply with JSON only: {\"discard\": [indexes of items that are not real work items], \
         \"depends\": [[a, b] when item a cannot start before item b finishes]}.\n\nItems:\n",
    );
    for (index, (_, seed)) in aligned.iter().enumerate() {
        prompt.push_str(&format!("[{index}] ({}) {}\n", seed.tag, seed.text));
    }
    prompt
}

fn parse_refinement(reply: &str, items: usize) -> Result<Option<Refinement>, RefineError> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(None);
    }
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(RefineError::Malformed("no JSON object in reply".into()));
    };
    if end < start {
        return Err(RefineError::Malformed("unbalanced JSON object".into()));
    }
    let mut refinement: Refinement = serde_json::from_str(&reply[start..=end])
        .map_err(|error| RefineError::Malformed(error.to_string()))?;
    refinement.discard.retain(|index| *index < items);
    refinement
        .depends
        .retain(|(a, b)| *a < items && *b < items && a != b);
    Ok(Some(refinement))
}

fn trimmed(text: &str, span: Range<usize>) -> Range<usize> {
    let slice = &text[span.clone()];
    let start = span.start + (slice.len() - slice.trim_start().len());
    let end = span.end - (slice.len() - slice.trim_end().len());
    start..end.max(start)
}

/// Build the structural part of the graph: sections, paragraphs, tables and figures.
pub(crate) fn build_structure(title: &str, text: &str, skeleton: &Skeleton) -> MarkupGraph {
    let mut graph = MarkupGraph::new(title, text.len());
    let lines: Vec<&str> = text.split('\n').collect();
    let offsets = line_starts(text);
    let line_span = |line: usize| offsets[line]..offsets[line] + lines[line].len();
    let starts = skeleton.starts();

    let mut sections: Vec<(NodeId, u8)> = Vec::new();
    let mut block: Option<(usize, usize)> = None;

    let flush = |graph: &mut MarkupGraph, block: &mut Option<(usize, usize)>, parent: NodeId| {
        if let Some((first, last)) = block.take() {
            let span = trimmed(text, offsets[first]..line_span(last).end);
            graph.add_child(parent, NodeKind::Paragraph, "", &text[span.clone()], span);
        }
    };

    let mut line = 0;
    while line < lines.len() {
        let current = sections.last().map(|(id, _)| *id).unwrap_or(graph.root());
        if let Some(element) = starts.get(&line).map(|index| &skeleton.elements[*index]) {
            flush(&mut graph, &mut block, current);
            match &element.kind {
                ElementKind::Section { level, number } => {
                    while sections.last().is_some_and(|(_, open)| open >= level) {
                        sections.pop();
                    }
                    let parent = sections.last().map(|(id, _)| *id).unwrap_or(graph.root());
                    let last_line = element.lines.end.max(line + 1) - 1;
                    let span = trimmed(text, offsets[line]..line_span(last_line).end);
                    let heading = lines[line].trim();
                    let id = graph.add_child(parent, NodeKind::Section, &element.title, heading, span);
                    if let Some(node) = graph.node_mut(id) {
                        node.number = number.clone();
                        node.level = *level;
                    }
                    sections.push((id, *level));
                    line += 1;
                }
                ElementKind::Table { .. } => {
                    let last_line = element.lines.end - 1;
                    let span = trimmed(text, offsets[line]..line_span(last_line).end);
                    let table =
                        graph.add_child(current, NodeKind::Table, &element.title, &text[span.clone()], span);
                    for row in element.lines.clone() {
                        if lines[row].trim().is_empty() || is_separator_row(lines[row]) {
                            continue;
                        }
                        let span = trimmed(text, line_span(row));
                        graph.add_child(table, NodeKind::TableRow, "", &text[span.clone()], span);
                    }
                    line = element.lines.end;
                }
                ElementKind::Figure => {
                    let span = trimmed(text, line_span(line));
                    graph.add_child(current, NodeKind::Figure, &element.title, &text[span.clone()], span);
                    line += 1;
                }
            }
            continue;
        }

        let content = lines[line].trim();
        if content.is_empty() {
            flush(&mut graph, &mut block, current);
        } else {
            if starts_clause(content) {
                flush(&mut graph, &mut block, current);
            }
            block = Some(match block {
                Some((first, _)) => (first, line),
                None => (line, line),
            });
        }
        line += 1;
    }
    let current = sections.last().map(|(id, _)| *id).unwrap_or(graph.root());
    flush(&mut graph, &mut block, current);
    graph
}

/// Pair each seed with the paragraph or row that fully contains it; others are dropped.
fn align_seeds(
    graph: &MarkupGraph,
    seeds: Vec<CandidateWorkItem>,
) -> Vec<(NodeId, CandidateWorkItem)> {
    let leaves: Vec<(NodeId, Range<usize>)> = graph
        .nodes()
        .iter()
        .filter(|node| node.kind.is_leaf_text())
        .map(|node| (node.id, node.span.clone()))
        .collect();
    seeds
        .into_iter()
        .filter_map(|seed| {
            leaves
                .iter()
                .find(|(_, span)| span.start <= seed.span.start && seed.span.end <= span.end)
                .map(|(leaf, _)| (*leaf, seed))
        })
        .collect()
}

fn work_items(graph: &MarkupGraph) -> Vec<NodeId> {
    graph
        .nodes_of(NodeKind::WorkItem)
        .into_iter()
        .filter(|id| {
            graph
                .node(*id)
                .and_then(|node| node.tag)
                .is_some_and(|tag| tag.is_work())
        })
        .collect()
}

/// Consecutive work items of one section depend on their predecessor.
fn link_consecutive_work(graph: &mut MarkupGraph) {
    let mut by_section: BTreeMap<Option<NodeId>, Vec<NodeId>> = BTreeMap::new();
    for item in work_items(graph) {
        by_section
            .entry(graph.enclosing_section(item))
            .or_default()
            .push(item);
    }
    for items in by_section.values() {
        for pair in items.windows(2) {
            graph.add_edge(pair[1], pair[0], EdgeKind::DependsOn);
        }
    }
}

/// "After completion of section N" makes the item depend on every work item of section N.
fn link_completion_clauses(graph: &mut MarkupGraph) {
    let sections_by_number: HashMap<String, NodeId> = graph
        .nodes()
        .iter()
        .filter(|node| node.kind == NodeKind::Section)
        .filter_map(|node| node.number.clone().map(|number| (number, node.id)))
        .collect();
    let items = work_items(graph);
    let mut links = Vec::new();
    for item in &items {
        let Some(node) = graph.node(*item) else {
            continue;
        };
        for captures in AFTER_COMPLETION.captures_iter(&node.text) {
            let Some(number) = captures.get(1).or_else(|| captures.get(2)) else {
                continue;
            };
            let Some(section) = sections_by_number.get(number.as_str()) else {
                continue;
            };
            for prerequisite in &items {
                if graph.ancestors(*prerequisite).contains(section) {
                    links.push((*item, *prerequisite));
                }
            }
        }
    }
    for (from, to) in links {
        graph.add_edge(from, to, EdgeKind::DependsOn);
    }
}

/// Reference nodes for normative codes and edges for clause cross references.
fn link_references(graph: &mut MarkupGraph) {
    let sections_by_number: HashMap<String, NodeId> = graph
        .nodes()
        .iter()
        .filter(|node| node.kind == NodeKind::Section)
        .filter_map(|node| node.number.clone().map(|number| (number, node.id)))
        .collect();
    let sources: Vec<(NodeId, String, Range<usize>)> = graph
        .nodes()
        .iter()
        .filter(|node| {
            matches!(
                node.kind,
                NodeKind::Section | NodeKind::Paragraph | NodeKind::TableRow | NodeKind::Figure
            )
        })
        .map(|node| {
            let text = if node.kind == NodeKind::Section {
                node.title.clone()
            } else {
                node.text.clone()
            };
            (node.id, text, node.span.clone())
        })
        .collect();

    let mut reference_nodes: HashMap<String, NodeId> = HashMap::new();
    for (source, text, span) in sources {
        for code in detect_codes(&text) {
            let target = match reference_nodes.get(&code) {
                Some(existing) => *existing,
                None => {
                    let root = graph.root();
                    let id = graph.add_child(root, NodeKind::Reference, &code, &code, span.clone());
                    reference_nodes.insert(code, id);
                    id
                }
            };
            graph.add_edge(source, target, EdgeKind::References);
        }
        for captures in CROSS_REFERENCE.captures_iter(&text) {
            if let Some(section) = sections_by_number.get(&captures[1]) {
                graph.add_edge(source, *section, EdgeKind::References);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CacheSettings, LoadedModel, ModelBackend, ModelRegistry, ModelSpec,
    };
    use crate::pipeline::candidates::{SeedTag, extract};
    use crate::pipeline::skeleton::analyze;
    use crate::pipeline::types::DocumentType;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const METHOD: &str = "\
1 Earthworks
Excavate the trench to 1.2 m depth. Compact the formation.

2 Concrete
Pour concrete C25/30 after completion of section 1. Cure the slab for 7 days.
See clause 1 for tolerances and SP 70.13330.2012 for acceptance.

Table 1 Mix schedule
| Element | Class |
| Slab | C25/30 |
";

    async fn outcome_of(generator: &MarkupGenerator) -> MarkupOutcome {
        let skeleton = analyze(METHOD);
        let seeds = extract(METHOD, DocumentType::Project);
        generator
            .generate("method.txt", METHOD, &skeleton, seeds)
            .await
    }

    #[tokio::test]
    async fn structure_follows_skeleton() {
        let outcome = outcome_of(&MarkupGenerator::default()).await;
        let graph = &outcome.graph;
        assert_eq!(graph.nodes_of(NodeKind::Section).len(), 2);
        assert_eq!(graph.nodes_of(NodeKind::Table).len(), 1);
        assert_eq!(graph.nodes_of(NodeKind::TableRow).len(), 2);
        for id in graph.nodes_of(NodeKind::Paragraph) {
            let node = graph.node(id).expect("paragraph");
            assert_eq!(&METHOD[node.span.clone()], node.text);
        }
    }

    #[tokio::test]
    async fn work_items_sit_under_paragraphs_with_dependencies() {
        let outcome = outcome_of(&MarkupGenerator::default()).await;
        let graph = &outcome.graph;
        let items = graph.nodes_of(NodeKind::WorkItem);
        assert!(items.len() >= 4, "{items:?}");
        for item in &items {
            let parent = graph.node(*item).and_then(|n| n.parent).expect("parent");
            assert!(graph.node(parent).expect("leaf").kind.is_leaf_text());
        }

        let pour = items
            .iter()
            .find(|id| graph.node(**id).is_some_and(|n| n.text.starts_with("Pour")))
            .expect("pour item");
        let deps = graph.targets(*pour, EdgeKind::DependsOn);
        let excavate = items
            .iter()
            .find(|id| graph.node(**id).is_some_and(|n| n.text.starts_with("Excavate")))
            .expect("excavate item");
        assert!(deps.contains(excavate));
        assert_eq!(
            graph.node(*pour).and_then(|n| n.tag),
            Some(SeedTag::Concrete)
        );
    }

    #[tokio::test]
    async fn references_cover_codes_and_clauses() {
        let outcome = outcome_of(&MarkupGenerator::default()).await;
        let graph = &outcome.graph;
        let references = graph.nodes_of(NodeKind::Reference);
        assert_eq!(references.len(), 1);
        assert_eq!(
            graph.node(references[0]).map(|n| n.title.as_str()),
            Some("SP 70.13330.2012")
        );
        let section_one = graph.nodes_of(NodeKind::Section)[0];
        assert!(
            graph
                .edges()
                .iter()
                .any(|e| e.kind == EdgeKind::References && e.to == section_one)
        );
    }

    struct ScriptedModel(String);

    #[async_trait]
    impl LoadedModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            Ok(Vec::new())
        }
        async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct ScriptedBackend(Option<String>);

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }
        async fn load(
            &self,
            _role: ModelRole,
            _spec: &ModelSpec,
        ) -> Result<Arc<dyn LoadedModel>, ModelError> {
            match &self.0 {
                Some(reply) => Ok(Arc::new(ScriptedModel(reply.clone()))),
                None => Err(ModelError::BackendUnavailable("offline".into())),
            }
        }
    }

    fn generator(reply: Option<&str>) -> MarkupGenerator {
        let registry =
            ModelRegistry::new().with(ModelRole::Generation, ModelSpec::new("gen"));
        let cache = ModelCache::new(
            Arc::new(ScriptedBackend(reply.map(str::to_string))),
            registry,
            CacheSettings {
                capacity: 1,
                ttl: Duration::from_secs(60),
                acquire_timeout: Duration::from_millis(100),
            },
        );
        MarkupGenerator::new(Some(cache))
    }

    #[tokio::test]
    async fn model_discards_are_applied() {
        let lexical = outcome_of(&MarkupGenerator::default()).await;
        let refined = outcome_of(&generator(Some(r#"Sure: {"discard":[0],"depends":[]}"#))).await;
        assert_eq!(
            refined.graph.nodes_of(NodeKind::WorkItem).len() + 1,
            lexical.graph.nodes_of(NodeKind::WorkItem).len()
        );
        assert!(!refined.degraded);
    }

    #[tokio::test]
    async fn unavailable_model_keeps_lexical_graph() {
        let lexical = outcome_of(&MarkupGenerator::default()).await;
        let degraded = outcome_of(&generator(None)).await;
        assert!(degraded.degraded);
        assert!(!degraded.warnings.is_empty());
        assert_eq!(degraded.graph.len(), lexical.graph.len());
    }

    #[tokio::test]
    async fn malformed_replies_are_ignored() {
        let lexical = outcome_of(&MarkupGenerator::default()).await;
        let outcome = outcome_of(&generator(Some("I think they all look fine"))).await;
        assert!(!outcome.degraded);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.graph.len(), lexical.graph.len());
    }
}
