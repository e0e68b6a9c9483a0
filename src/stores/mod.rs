//! Write/read contracts of the external stores and their local implementations.
//!
//! The pipeline talks to three stores: the graph store (work sequences, normative status), the
//! vector store (chunk embeddings) and the document record store (status and hash index). Each is
//! an `async_trait` object so tests and deployments can swap implementations.

mod graph;
mod locks;
mod records;
mod vector;

pub use graph::{GraphStore, InMemoryGraphStore, NormativeEntry, NormativeStatus};
pub use locks::KeyedLocks;
pub use records::{InMemoryRecordStore, JsonRecordStore, RecordStore};
pub use vector::{InMemoryVectorStore, VectorPoint, VectorStore};

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the request.
    #[error("Store rejected request: {0}")]
    Rejected(String),
    /// Local file access failed.
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Stored data could not be encoded or decoded.
    #[error("Store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic SHA-256 of raw bytes, hex encoded.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Current timestamp formatted for record and payload storage.
pub fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let h1 = compute_content_hash(b"Hello world");
        let h2 = compute_content_hash(b"Hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_content_hash(b"Hello world!"));
    }

    #[test]
    fn timestamp_is_rfc3339_like() {
        let ts = current_timestamp_rfc3339();
        assert!(ts.contains('T') && ts.ends_with('Z'));
    }
}
