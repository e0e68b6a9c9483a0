//! Structure-aligned chunking of the markup graph.
//!
//! Chunks follow the document structure instead of a sliding window:
//!
//! - one chunk per paragraph, table or figure that fits the token cap;
//! - oversized prose is split at sentence boundaries with a sentence overlap, and single
//!   sentences above the cap fall back to semantic splitting;
//! - oversized tables are split at row boundaries with the header row repeated;
//! - adjacent undersized siblings under the same parent are merged up to the cap.
//!
//! No chunk ever spans two top-level sections. Chunk ids are UUIDv5 values derived from the
//! document id, the chunk ordinal and the chunk text, so reprocessing identical content yields
//! identical ids.

mod tokens;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use super::markup::{MarkupGraph, NodeId, NodeKind};
use super::types::DocumentId;

pub use tokens::{TokenCounter, build_token_counter, whitespace_token_counter};
use tokens::semantic_split;

/// Errors produced while turning the markup graph into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// The configured token budgets are unusable.
    #[error("invalid chunk budget: max {max}, min {min}, overlap {overlap}")]
    InvalidBudget {
        /// Token cap per chunk.
        max: usize,
        /// Merge threshold.
        min: usize,
        /// Sentence overlap budget.
        overlap: usize,
    },
    /// Tokenizer resources were unavailable.
    #[error("failed to initialize tokenizer '{tokenizer}': {source}")]
    Tokenizer {
        /// Tokenizer that was requested.
        tokenizer: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: anyhow::Error,
    },
}

/// Token budgets for chunking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Hard cap on tokens per chunk.
    pub max_tokens: usize,
    /// Chunks below this size are merged with undersized siblings.
    pub min_tokens: usize,
    /// Budget of trailing sentences repeated at the start of the next prose chunk.
    pub overlap_tokens: usize,
    /// `tiktoken` encoding or model name.
    pub tokenizer: String,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_tokens: 384,
            min_tokens: 96,
            overlap_tokens: 32,
            tokenizer: "cl100k_base".to_string(),
        }
    }
}

/// Structural origin of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Clause or paragraph text.
    Prose,
    /// Table rows.
    Table,
    /// Figure caption.
    Figure,
    /// Several undersized siblings merged together.
    Merged,
}

impl ChunkKind {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prose => "prose",
            Self::Table => "table",
            Self::Figure => "figure",
            Self::Merged => "merged",
        }
    }
}

/// A retrieval unit ready for embedding.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Chunk {
    /// Deterministic identifier.
    pub id: Uuid,
    /// Position within the document.
    pub ordinal: usize,
    /// Chunk text.
    pub text: String,
    /// Section titles from the outermost section down.
    pub section_path: Vec<String>,
    /// Title of the top-level section, if any.
    pub top_section: Option<String>,
    /// Graph nodes whose text the chunk carries.
    pub node_ids: Vec<NodeId>,
    /// Structural origin.
    pub kind: ChunkKind,
    /// Token count under the configured counter.
    pub token_count: usize,
}

/// Deterministic chunk id for a document, ordinal and text.
pub fn chunk_id(document_id: DocumentId, ordinal: usize, text: &str) -> Uuid {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{document_id}:{ordinal}:{digest}").as_bytes(),
    )
}

/// Piece of a unit before merging and id assignment.
#[derive(Clone, Debug)]
struct Piece {
    text: String,
    nodes: Vec<NodeId>,
    parent: Option<NodeId>,
    top: Option<NodeId>,
    anchor: NodeId,
    kind: ChunkKind,
    tokens: usize,
    /// Whether the piece is a whole unit that may be merged with siblings.
    mergeable: bool,
}

/// Splits a markup graph into structure-aligned chunks.
#[derive(Clone)]
pub struct Chunker {
    settings: ChunkSettings,
    counter: TokenCounter,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Chunker using the tokenizer named in `settings`.
    pub fn new(settings: ChunkSettings) -> Result<Self, ChunkingError> {
        let counter = build_token_counter(&settings.tokenizer);
        Self::with_counter(settings, counter)
    }

    /// Chunker with an explicit token counter.
    pub fn with_counter(
        settings: ChunkSettings,
        counter: TokenCounter,
    ) -> Result<Self, ChunkingError> {
        if settings.max_tokens == 0
            || settings.min_tokens > settings.max_tokens
            || settings.overlap_tokens >= settings.max_tokens
        {
            return Err(ChunkingError::InvalidBudget {
                max: settings.max_tokens,
                min: settings.min_tokens,
                overlap: settings.overlap_tokens,
            });
        }
        Ok(Self { settings, counter })
    }

    /// Configured budgets.
    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    fn count(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Chunk every paragraph, table and figure of `graph`.
    pub fn chunk(&self, document_id: DocumentId, graph: &MarkupGraph) -> Vec<Chunk> {
        let mut pieces = Vec::new();
        for id in graph.preorder() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            match node.kind {
                NodeKind::Paragraph => {
                    pieces.extend(self.prose_pieces(graph, id, ChunkKind::Prose))
                }
                NodeKind::Figure => {
                    pieces.extend(self.prose_pieces(graph, id, ChunkKind::Figure))
                }
                NodeKind::Table => pieces.extend(self.table_pieces(graph, id)),
                _ => {}
            }
        }

        let merged = self.merge_undersized(pieces);
        let chunks: Vec<Chunk> = merged
            .into_iter()
            .enumerate()
            .map(|(ordinal, piece)| Chunk {
                id: chunk_id(document_id, ordinal, &piece.text),
                ordinal,
                section_path: graph.section_path(piece.anchor),
                top_section: piece
                    .top
                    .and_then(|top| graph.node(top))
                    .map(|node| node.title.clone()),
                node_ids: piece.nodes,
                kind: piece.kind,
                token_count: piece.tokens,
                text: piece.text,
            })
            .collect();
        tracing::debug!(%document_id, chunks = chunks.len(), max_tokens = self.settings.max_tokens, "Chunked document");
        chunks
    }

    fn piece(
        &self,
        graph: &MarkupGraph,
        anchor: NodeId,
        text: String,
        nodes: Vec<NodeId>,
        kind: ChunkKind,
        mergeable: bool,
    ) -> Piece {
        Piece {
            tokens: self.count(&text),
            parent: graph.node(anchor).and_then(|node| node.parent),
            top: graph.top_section(anchor),
            anchor,
            nodes,
            kind,
            mergeable,
            text,
        }
    }

    fn prose_pieces(&self, graph: &MarkupGraph, id: NodeId, kind: ChunkKind) -> Vec<Piece> {
        let Some(node) = graph.node(id) else {
            return Vec::new();
        };
        let text = node.text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if self.count(text) <= self.settings.max_tokens {
            return vec![self.piece(graph, id, text.to_string(), vec![id], kind, true)];
        }
        self.split_prose(text)
            .into_iter()
            .map(|part| self.piece(graph, id, part, vec![id], kind, false))
            .collect()
    }

    /// Greedy sentence packing with a trailing-sentence overlap.
    fn split_prose(&self, text: &str) -> Vec<String> {
        let max = self.settings.max_tokens;
        let mut sentences: Vec<String> = Vec::new();
        for sentence in text.split_sentence_bounds() {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            if self.count(sentence) > max {
                sentences.extend(semantic_split(sentence, max, &self.counter));
            } else {
                sentences.push(sentence.to_string());
            }
        }

        let mut parts = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        // Sentences of `current` that are overlap carried from the previous part.
        let mut carried = 0;
        for sentence in &sentences {
            let candidate = join_sentences(&current, sentence);
            if !current.is_empty() && self.count(&candidate) > max {
                if current.len() > carried {
                    parts.push(current.join(" "));
                }
                current = self.overlap_tail(&current, sentence);
                carried = current.len();
            }
            current.push(sentence);
        }
        if current.len() > carried || parts.is_empty() {
            parts.push(current.join(" "));
        }
        parts
            .into_iter()
            .flat_map(|part| {
                if self.count(&part) > max {
                    semantic_split(&part, max, &self.counter)
                } else {
                    vec![part]
                }
            })
            .collect()
    }

    /// Trailing sentences of `part` that fit in the overlap budget and still leave room for
    /// `next`.
    fn overlap_tail<'a>(&self, part: &[&'a str], next: &str) -> Vec<&'a str> {
        let budget = self.settings.overlap_tokens;
        let room = self.settings.max_tokens.saturating_sub(self.count(next));
        let mut tail: Vec<&'a str> = Vec::new();
        for sentence in part.iter().rev() {
            let mut candidate = vec![*sentence];
            candidate.extend(tail.iter().copied());
            let tokens = self.count(&candidate.join(" "));
            if tokens > budget || tokens >= room {
                break;
            }
            tail = candidate;
        }
        tail
    }

    fn table_pieces(&self, graph: &MarkupGraph, id: NodeId) -> Vec<Piece> {
        let Some(table) = graph.node(id) else {
            return Vec::new();
        };
        let mut rows: Vec<(NodeId, &str)> = table
            .children
            .iter()
            .filter_map(|child| graph.node(*child))
            .filter(|child| child.kind == NodeKind::TableRow)
            .map(|row| (row.id, row.text.trim()))
            .filter(|(_, text)| !text.is_empty())
            .collect();
        if rows.is_empty() {
            let text = table.text.trim();
            if text.is_empty() {
                return Vec::new();
            }
            rows.push((id, text));
        }
        let whole = rows
            .iter()
            .map(|(_, text)| *text)
            .collect::<Vec<_>>()
            .join("\n");
        let mut all_nodes = vec![id];
        all_nodes.extend(rows.iter().map(|(row, _)| *row).filter(|row| *row != id));
        let max = self.settings.max_tokens;
        if self.count(&whole) <= max {
            return vec![self.piece(graph, id, whole, all_nodes, ChunkKind::Table, true)];
        }

        // The header is repeated only when it leaves room for at least one body token.
        let header = (rows.len() > 1 && self.count(rows[0].1) < max).then_some(rows[0]);
        let body = if header.is_some() { &rows[1..] } else { &rows[..] };
        let header_tokens = header.map_or(0, |(_, text)| self.count(text) + 1);
        let row_budget = max.saturating_sub(header_tokens).max(1);

        let mut part = TablePart::new(id, header);
        let mut pieces = Vec::new();
        for (row_id, row) in body {
            let with_header = match header {
                Some((_, header)) => format!("{header}\n{row}"),
                None => (*row).to_string(),
            };
            let segments = if self.count(&with_header) <= max {
                vec![(*row).to_string()]
            } else {
                semantic_split(row, row_budget, &self.counter)
            };
            for segment in segments {
                if part.body_lines > 0 && self.count(&part.text_with(&segment)) > max {
                    let full = std::mem::replace(&mut part, TablePart::new(id, header));
                    pieces.push(full.into_piece(self, graph));
                }
                part.push(*row_id, segment);
            }
        }
        if part.body_lines > 0 {
            pieces.push(part.into_piece(self, graph));
        }
        pieces
    }

    fn merge_undersized(&self, pieces: Vec<Piece>) -> Vec<Piece> {
        let min = self.settings.min_tokens;
        let max = self.settings.max_tokens;
        let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if let Some(last) = merged.last_mut()
                && last.mergeable
                && piece.mergeable
                && piece.tokens < min
                && last.parent == piece.parent
                && last.top == piece.top
            {
                let text = format!("{}\n\n{}", last.text, piece.text);
                let tokens = self.count(&text);
                let last_undersized = last.tokens < min || last.kind == ChunkKind::Merged;
                if last_undersized && tokens <= max {
                    last.text = text;
                    last.tokens = tokens;
                    last.nodes.extend(piece.nodes);
                    last.kind = ChunkKind::Merged;
                    continue;
                }
            }
            merged.push(piece);
        }
        merged
    }
}

/// Rows accumulated for one piece of an oversized table.
struct TablePart {
    table: NodeId,
    lines: Vec<String>,
    nodes: Vec<NodeId>,
    body_lines: usize,
}

impl TablePart {
    fn new(table: NodeId, header: Option<(NodeId, &str)>) -> Self {
        let mut part = Self {
            table,
            lines: Vec::new(),
            nodes: vec![table],
            body_lines: 0,
        };
        if let Some((header_id, header)) = header {
            part.lines.push(header.to_string());
            part.nodes.push(header_id);
        }
        part
    }

    fn text_with(&self, line: &str) -> String {
        let mut lines: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        lines.push(line);
        lines.join("\n")
    }

    fn push(&mut self, row: NodeId, line: String) {
        if self.nodes.last() != Some(&row) {
            self.nodes.push(row);
        }
        self.lines.push(line);
        self.body_lines += 1;
    }

    fn into_piece(self, chunker: &Chunker, graph: &MarkupGraph) -> Piece {
        chunker.piece(
            graph,
            self.table,
            self.lines.join("\n"),
            self.nodes,
            ChunkKind::Table,
            false,
        )
    }
}

fn join_sentences(current: &[&str], next: &str) -> String {
    if current.is_empty() {
        next.to_string()
    } else {
        format!("{} {next}", current.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::markup::build_structure;
    use crate::pipeline::skeleton::analyze;

    fn chunker(max: usize, min: usize, overlap: usize) -> Chunker {
        Chunker::with_counter(
            ChunkSettings {
                max_tokens: max,
                min_tokens: min,
                overlap_tokens: overlap,
                tokenizer: "whitespace".into(),
            },
            whitespace_token_counter(),
        )
        .expect("valid budget")
    }

    fn graph(text: &str) -> MarkupGraph {
        build_structure("doc", text, &analyze(text))
    }

    fn counter() -> TokenCounter {
        whitespace_token_counter()
    }

    #[test]
    fn rejects_impossible_budgets() {
        let error = Chunker::with_counter(
            ChunkSettings {
                max_tokens: 10,
                min_tokens: 20,
                overlap_tokens: 0,
                tokenizer: String::new(),
            },
            counter(),
        )
        .expect_err("min above max");
        assert!(matches!(error, ChunkingError::InvalidBudget { .. }));
    }

    #[test]
    fn oversized_table_splits_at_rows_with_repeated_header() {
        let mut text = String::from("1 Quantities\n| Item | Unit | Qty |\n");
        for index in 0..12 {
            text.push_str(&format!("| Item {index} | m3 | {index} |\n"));
        }
        text.push_str("\n2 Notes\nAll quantities are net of waste.\n");
        let graph = graph(&text);
        let chunks = chunker(30, 0, 0).chunk(DocumentId::new(), &graph);

        let tables: Vec<&Chunk> = chunks.iter().filter(|chunk| chunk.kind == ChunkKind::Table).collect();
        assert!(tables.len() > 1);
        for chunk in &tables {
            assert!(chunk.text.starts_with("| Item | Unit | Qty |"));
            assert!(chunk.token_count <= 30);
            assert_eq!(chunk.top_section.as_deref(), Some("1 Quantities"));
        }
        let rows: usize = tables.iter().map(|chunk| chunk.text.lines().count() - 1).sum();
        assert_eq!(rows, 12);
        let last = chunks.last().expect("notes chunk");
        assert_eq!(last.top_section.as_deref(), Some("2 Notes"));
    }

    #[test]
    fn oversized_row_is_split_without_losing_text() {
        let words: Vec<String> = (0..40).map(|index| format!("w{index}")).collect();
        let text = format!(
            "1 Quantities\n| Item | Unit | Qty |\n| {} | m3 | 5 |\n",
            words.join(" ")
        );
        let graph = graph(&text);
        let chunks = chunker(20, 0, 0).chunk(DocumentId::new(), &graph);

        let tables: Vec<&Chunk> = chunks.iter().filter(|chunk| chunk.kind == ChunkKind::Table).collect();
        assert!(tables.len() > 1);
        for chunk in &tables {
            assert!(chunk.text.starts_with("| Item | Unit | Qty |"));
            assert!(chunk.token_count <= 20);
        }
        for word in &words {
            assert!(
                tables
                    .iter()
                    .any(|chunk| chunk.text.split_whitespace().any(|token| token == word)),
                "{word} was dropped"
            );
        }
    }

    #[test]
    fn oversized_prose_splits_at_sentences_with_overlap() {
        let text = "1 Scope\nAlpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu. Nu xi omicron pi.\n";
        let graph = graph(text);
        let chunks = chunker(9, 0, 4).chunk(DocumentId::new(), &graph);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.token_count <= 9);
        }
        // The second chunk starts with the last sentence of the first.
        let first_last = chunks[0].text.rsplit(". ").next().unwrap_or_default();
        assert!(chunks[1].text.starts_with(first_last.trim_end_matches('.')));
    }

    #[test]
    fn undersized_siblings_merge_but_never_across_sections() {
        let text = "1 General\n1.1 Keep the site clean.\n1.2 Store materials dry.\n\n2 Safety\n2.1 Wear helmets.\n";
        let graph = graph(text);
        let chunks = chunker(50, 10, 0).chunk(DocumentId::new(), &graph);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, ChunkKind::Merged);
        assert!(chunks[0].text.contains("Keep the site clean"));
        assert!(chunks[0].text.contains("Store materials dry"));
        assert_eq!(chunks[1].top_section.as_deref(), Some("2 Safety"));
    }

    #[test]
    fn chunk_ids_are_stable_for_the_same_document() {
        let text = "1 General\nThe contractor shall provide temporary fencing around the site.\n";
        let graph = graph(text);
        let id = DocumentId::new();
        let first = chunker(50, 0, 0).chunk(id, &graph);
        let second = chunker(50, 0, 0).chunk(id, &graph);
        assert_eq!(first, second);
        let other = chunker(50, 0, 0).chunk(DocumentId::new(), &graph);
        assert_ne!(first[0].id, other[0].id);
    }
}
