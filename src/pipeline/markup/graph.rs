use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::Range;

use crate::pipeline::candidates::SeedTag;

/// Index of a node in a [`MarkupGraph`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a markup node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Root of the graph.
    Document,
    /// Heading and its content.
    Section,
    /// Clause-level prose block.
    Paragraph,
    /// Table container.
    Table,
    /// One table row; the first row is the header.
    TableRow,
    /// Figure or drawing caption.
    Figure,
    /// Aligned work item or clause seed.
    WorkItem,
    /// Normative code mentioned in the document.
    Reference,
}

impl NodeKind {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Table => "table",
            Self::TableRow => "table_row",
            Self::Figure => "figure",
            Self::WorkItem => "work_item",
            Self::Reference => "reference",
        }
    }

    /// Nodes that hold running text and can host work items.
    pub fn is_leaf_text(self) -> bool {
        matches!(self, Self::Paragraph | Self::TableRow)
    }
}

/// Relation between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Structural containment, mirrors `parent`/`children`.
    Contains,
    /// `from` cannot start before `to` finishes.
    DependsOn,
    /// `from` cites `to`.
    References,
}

/// Directed edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Relation.
    pub kind: EdgeKind,
}

/// Arena node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MarkupNode {
    /// Own identifier.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Containing node; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Contained nodes in document order.
    pub children: Vec<NodeId>,
    /// Heading, caption or code.
    pub title: String,
    /// Source text the node covers.
    pub text: String,
    /// Byte span in the document text.
    pub span: Range<usize>,
    /// Clause number of sections.
    pub number: Option<String>,
    /// Section level; 0 for everything else.
    pub level: u8,
    /// Tag of work items.
    pub tag: Option<SeedTag>,
}

/// Arena of markup nodes with typed edges.
#[derive(Clone, Debug, Serialize)]
pub struct MarkupGraph {
    nodes: Vec<MarkupNode>,
    edges: Vec<Edge>,
}

impl MarkupGraph {
    /// Graph holding only a document root spanning `len` bytes.
    pub fn new(title: impl Into<String>, len: usize) -> Self {
        Self {
            nodes: vec![MarkupNode {
                id: NodeId(0),
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
                title: title.into(),
                text: String::new(),
                span: 0..len,
                number: None,
                level: 0,
                tag: None,
            }],
            edges: Vec::new(),
        }
    }

    /// Root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Append a node under `parent` and record the containment edge.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        title: impl Into<String>,
        text: impl Into<String>,
        span: Range<usize>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(MarkupNode {
            id,
            kind,
            parent: Some(parent),
            children: Vec::new(),
            title: title.into(),
            text: text.into(),
            span,
            number: None,
            level: 0,
            tag: None,
        });
        self.nodes[parent.index()].children.push(id);
        self.edges.push(Edge {
            from: parent,
            to: id,
            kind: EdgeKind::Contains,
        });
        id
    }

    /// Add a non-structural edge; self loops and duplicates are ignored.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        if from == to || !self.contains(from) || !self.contains(to) {
            return false;
        }
        let edge = Edge { from, to, kind };
        if self.edges.contains(&edge) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    /// Whether `id` addresses a node of this graph.
    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&MarkupNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut MarkupNode> {
        self.nodes.get_mut(id.index())
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> &[MarkupNode] {
        &self.nodes
    }

    /// All edges.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds only its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Nodes of `kind` in document order.
    pub fn nodes_of(&self, kind: NodeKind) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|id| self.nodes[id.index()].kind == kind)
            .collect()
    }

    /// Targets of `kind` edges leaving `from`.
    pub fn targets(&self, from: NodeId, kind: EdgeKind) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|edge| edge.from == from && edge.kind == kind)
            .map(|edge| edge.to)
            .collect()
    }

    /// Depth-first walk from the root in document order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.index()].children.iter().rev().copied());
        }
        order
    }

    /// Ancestors of `id`, nearest first, ending with the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut current = self.node(id).and_then(|node| node.parent);
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.nodes[parent.index()].parent;
        }
        ancestors
    }

    /// Titles of the sections containing `id` (itself included), outermost first.
    pub fn section_path(&self, id: NodeId) -> Vec<String> {
        let mut path: Vec<String> = std::iter::once(id)
            .chain(self.ancestors(id))
            .filter_map(|node| self.node(node))
            .filter(|node| node.kind == NodeKind::Section)
            .map(|node| node.title.clone())
            .collect();
        path.reverse();
        path
    }

    /// Nearest section containing `id` (itself included).
    pub fn enclosing_section(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|node| self.node(*node).is_some_and(|n| n.kind == NodeKind::Section))
    }

    /// Outermost section containing `id` (itself included).
    pub fn top_section(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter(|node| self.node(*node).is_some_and(|n| n.kind == NodeKind::Section))
            .last()
    }

    /// Order `items` so that every item follows the items it depends on.
    ///
    /// Ties keep document order. When a cycle blocks progress, the earliest blocked item is
    /// released and the dependencies it ignored are returned as broken edges.
    pub fn dependency_order(&self, items: &[NodeId]) -> (Vec<NodeId>, Vec<(NodeId, NodeId)>) {
        let position: HashMap<NodeId, usize> = self
            .preorder()
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();
        let members: HashSet<NodeId> = items.iter().copied().collect();
        let rank = |id: &NodeId| position.get(id).copied().unwrap_or(usize::MAX);

        let mut pending: HashMap<NodeId, BTreeSet<(usize, NodeId)>> = items
            .iter()
            .map(|id| {
                let deps = self
                    .targets(*id, EdgeKind::DependsOn)
                    .into_iter()
                    .filter(|dep| members.contains(dep))
                    .map(|dep| (rank(&dep), dep))
                    .collect();
                (*id, deps)
            })
            .collect();

        let mut ready: BTreeSet<(usize, NodeId)> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| (rank(id), *id))
            .collect();
        let mut order = Vec::with_capacity(items.len());
        let mut broken = Vec::new();

        while order.len() < pending.len() {
            let next = match ready.pop_first() {
                Some((_, id)) => id,
                None => {
                    let Some((_, blocked)) = pending
                        .iter()
                        .filter(|(id, deps)| !deps.is_empty() && !order.contains(*id))
                        .map(|(id, _)| (rank(id), *id))
                        .min()
                    else {
                        break;
                    };
                    if let Some(deps) = pending.get_mut(&blocked) {
                        broken.extend(deps.iter().map(|(_, dep)| (blocked, *dep)));
                        deps.clear();
                    }
                    blocked
                }
            };
            order.push(next);
            for (id, deps) in pending.iter_mut() {
                if deps.remove(&(rank(&next), next)) && deps.is_empty() && !order.contains(id) {
                    ready.insert((rank(id), *id));
                }
            }
        }
        (order, broken)
    }
}
