//! Token counting and token-budget helpers.
//!
//! Token counting prefers `tiktoken-rs` encodings and falls back to a whitespace counter when the
//! configured tokenizer cannot be resolved, so chunking keeps flowing for local model aliases.

use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use super::ChunkingError;

/// Counts tokens in a text segment.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Counter for `tokenizer`, falling back to whitespace counting when it cannot be loaded.
pub fn build_token_counter(tokenizer: &str) -> TokenCounter {
    match build_tiktoken_counter(tokenizer) {
        Ok(counter) => counter,
        Err(error) => {
            tracing::warn!(
                tokenizer,
                error = %error,
                "Tokenizer unavailable; falling back to whitespace counter"
            );
            whitespace_token_counter()
        }
    }
}

pub(crate) fn build_tiktoken_counter(tokenizer: &str) -> Result<TokenCounter, ChunkingError> {
    let normalized = tokenizer.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        tokenizer: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);
    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(encoding) = encoding_from_name(name) {
        return encoding;
    }
    match get_bpe_from_model(name) {
        Ok(encoding) => Ok(encoding),
        Err(error) => {
            tracing::warn!(
                tokenizer = name,
                error = %error,
                "Unknown tokenizer; using 'cl100k_base' for token counting"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

/// Counts whitespace-separated words; non-empty text counts at least one token.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.trim().is_empty() {
            1
        } else {
            tokens
        }
    })
}

/// Split text with no usable structure into pieces of at most `budget` tokens.
pub(crate) fn semantic_split(text: &str, budget: usize, counter: &TokenCounter) -> Vec<String> {
    let for_chunker = counter.clone();
    let chunker = Chunker::new(
        budget.max(1),
        Box::new(move |segment: &str| for_chunker.as_ref()(segment)),
    );
    chunker
        .chunk(text)
        .into_iter()
        .map(|piece| piece.trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_counter_counts_words() {
        let counter = whitespace_token_counter();
        assert_eq!(counter.as_ref()("one two  three"), 3);
        assert_eq!(counter.as_ref()("   "), 0);
    }

    #[test]
    fn semantic_split_respects_budget() {
        let counter = whitespace_token_counter();
        let pieces = semantic_split("one two three four five", 2, &counter);
        assert_eq!(pieces, vec!["one two", "three four", "five"]);
    }

    #[test]
    fn tiktoken_counter_is_resolved_by_encoding_name() {
        let counter = build_tiktoken_counter("cl100k_base").expect("bundled encoding");
        assert!(counter.as_ref()("The quick brown fox jumps over the lazy dog.") > 5);
    }
}
