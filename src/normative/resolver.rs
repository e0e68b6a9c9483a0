use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::codes::normalize_code;
use crate::stores::{GraphStore, NormativeEntry, NormativeStatus, StoreError};

const MAX_CHAIN_DEPTH: usize = 8;

/// Errors raised while resolving normative codes.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The graph store could not answer.
    #[error("Normative register unavailable: {0}")]
    Unavailable(#[from] StoreError),
    /// The reference table file could not be loaded.
    #[error("Invalid normative table {path}: {reason}")]
    Table {
        /// File that failed to load.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Resolved status of a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    /// In force.
    Current,
    /// Replaced; see the replacement.
    Superseded,
    /// Withdrawn without replacement.
    Withdrawn,
    /// Not present in the register.
    Unknown,
}

/// Outcome of [`NormativeResolver::is_current`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NormativeCheck {
    /// Normalised code that was checked.
    pub code: String,
    /// Register status of the code itself.
    pub status: CodeStatus,
    /// Latest replacement reached by following the supersession chain.
    pub replacement: Option<String>,
    /// Codes visited after the checked one, in order.
    pub chain: Vec<String>,
}

impl NormativeCheck {
    /// Whether the code may be relied upon. Unknown codes are treated as current.
    pub fn is_current(&self) -> bool {
        matches!(self.status, CodeStatus::Current | CodeStatus::Unknown)
    }
}

/// Resolves normative codes against the graph store, following supersession chains.
pub struct NormativeResolver {
    store: Arc<dyn GraphStore>,
    memo: RwLock<HashMap<String, NormativeCheck>>,
}

impl NormativeResolver {
    /// Resolver reading from `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// Status of `code` and its current replacement, if superseded.
    pub async fn is_current(&self, code: &str) -> Result<NormativeCheck, ResolverError> {
        let code = normalize_code(code);
        if let Some(hit) = self.memo.read().await.get(&code) {
            return Ok(hit.clone());
        }

        let check = self.resolve(&code).await?;
        tracing::debug!(code = %check.code, status = ?check.status, replacement = ?check.replacement, "Resolved normative code");
        self.memo.write().await.insert(code, check.clone());
        Ok(check)
    }

    /// Forget memoised answers, e.g. after the register was updated.
    pub async fn invalidate(&self) {
        self.memo.write().await.clear();
    }

    async fn resolve(&self, code: &str) -> Result<NormativeCheck, ResolverError> {
        let Some(entry) = self.store.normative_entry(code).await? else {
            return Ok(NormativeCheck {
                code: code.to_string(),
                status: CodeStatus::Unknown,
                replacement: None,
                chain: Vec::new(),
            });
        };

        let status = match entry.status {
            NormativeStatus::Current => CodeStatus::Current,
            NormativeStatus::Superseded => CodeStatus::Superseded,
            NormativeStatus::Withdrawn => CodeStatus::Withdrawn,
        };

        let mut chain: Vec<String> = Vec::new();
        let mut next = entry.replacement.as_deref().map(normalize_code);
        while let Some(candidate) = next.take() {
            if candidate == code || chain.contains(&candidate) {
                tracing::warn!(code, cycle_at = %candidate, "Supersession chain loops; stopping");
                break;
            }
            chain.push(candidate.clone());
            if chain.len() >= MAX_CHAIN_DEPTH {
                tracing::warn!(code, depth = chain.len(), "Supersession chain too deep; stopping");
                break;
            }
            if let Some(NormativeEntry {
                status: NormativeStatus::Superseded,
                replacement: Some(replacement),
                ..
            }) = self.store.normative_entry(&candidate).await?
            {
                next = Some(normalize_code(&replacement));
            }
        }

        Ok(NormativeCheck {
            code: code.to_string(),
            status,
            replacement: chain.last().cloned(),
            chain,
        })
    }
}

/// Load a JSON reference table (`[{code, status, replacement?, title?}]`).
pub async fn load_normative_table(path: &Path) -> Result<Vec<NormativeEntry>, ResolverError> {
    let table_error = |reason: String| ResolverError::Table {
        path: path.display().to_string(),
        reason,
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| table_error(error.to_string()))?;
    let entries: Vec<NormativeEntry> =
        serde_json::from_slice(&bytes).map_err(|error| table_error(error.to_string()))?;
    tracing::info!(path = %path.display(), entries = entries.len(), "Loaded normative table");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryGraphStore;

    fn entry(code: &str, status: NormativeStatus, replacement: Option<&str>) -> NormativeEntry {
        NormativeEntry {
            code: code.into(),
            status,
            replacement: replacement.map(str::to_string),
            title: None,
        }
    }

    fn resolver(entries: Vec<NormativeEntry>) -> NormativeResolver {
        NormativeResolver::new(Arc::new(InMemoryGraphStore::with_normative_entries(entries)))
    }

    #[tokio::test]
    async fn follows_chain_to_latest_replacement() {
        let resolver = resolver(vec![
            entry("SNiP 2.03.01-84", NormativeStatus::Superseded, Some("SP 63.13330.2012")),
            entry("SP 63.13330.2012", NormativeStatus::Superseded, Some("SP 63.13330.2018")),
            entry("SP 63.13330.2018", NormativeStatus::Current, None),
        ]);

        let check = resolver.is_current("SNiP 2.03.01-84").await.expect("check");
        assert_eq!(check.status, CodeStatus::Superseded);
        assert!(!check.is_current());
        assert_eq!(check.replacement.as_deref(), Some("SP 63.13330.2018"));
        assert_eq!(check.chain.len(), 2);
    }

    #[tokio::test]
    async fn unknown_codes_are_not_rejected() {
        let resolver = resolver(Vec::new());
        let check = resolver.is_current("GOST 1234-99").await.expect("check");
        assert_eq!(check.status, CodeStatus::Unknown);
        assert!(check.is_current());
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let resolver = resolver(vec![
            entry("SP 1.1", NormativeStatus::Superseded, Some("SP 2.2")),
            entry("SP 2.2", NormativeStatus::Superseded, Some("SP 1.1")),
        ]);
        let check = resolver.is_current("SP 1.1").await.expect("check");
        assert_eq!(check.replacement.as_deref(), Some("SP 2.2"));
        assert_eq!(check.chain, vec!["SP 2.2"]);
    }

    #[tokio::test]
    async fn loads_table_from_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("normative.json");
        tokio::fs::write(
            &path,
            r#"[{"code":"SNiP 3.03.01-87","status":"superseded","replacement":"SP 70.13330.2012"}]"#,
        )
        .await
        .expect("write");

        let entries = load_normative_table(&path).await.expect("load");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, NormativeStatus::Superseded);

        let missing = load_normative_table(&dir.path().join("absent.json")).await;
        assert!(matches!(missing, Err(ResolverError::Table { .. })));
    }
}
