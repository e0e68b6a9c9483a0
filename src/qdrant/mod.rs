//! Qdrant-backed vector store.

mod client;
mod filters;
mod types;

pub use client::QdrantVectorStore;
pub use filters::document_filter;
pub use types::QdrantError;
