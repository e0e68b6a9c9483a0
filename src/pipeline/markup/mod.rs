//! Markup graph arena and its generator.
//!
//! The graph is an index-addressed arena: nodes refer to each other through [`NodeId`], so
//! reference and dependency cycles are representable without shared ownership.

mod generator;
mod graph;

#[cfg(test)]
pub(crate) use generator::build_structure;
pub(crate) use generator::starts_clause;
pub use generator::{MarkupGenerator, MarkupOutcome};
pub use graph::{Edge, EdgeKind, MarkupGraph, MarkupNode, NodeId, NodeKind};
