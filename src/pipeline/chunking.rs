//! Token-budgeted chunking for the indexing stage.
//!
//! Chunk size comes from `TEXT_SPLITTER_CHUNK_SIZE` when set, otherwise from the embedding
//! model's context window divided by four and clamped into `[256, 1024]`. Adjacent chunks share
//! a sliding tail of `TEXT_SPLITTER_CHUNK_OVERLAP` tokens. Token counts use `tiktoken-rs` when an
//! encoding can be resolved and whitespace counting otherwise.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base};

use crate::config::EmbeddingProvider;
use crate::qdrant::compute_chunk_hash;

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

const MIN_AUTOMATIC_CHUNK_SIZE: usize = 256;
const MAX_AUTOMATIC_CHUNK_SIZE: usize = 1024;

/// Errors produced while splitting a document.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Configured token budget was zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Model whose tokenizer we attempted to load.
        model: String,
        /// Underlying tokenizer error.
        #[source]
        source: TokenizerError,
    },
}

/// Chunking parameters resolved once from configuration.
#[derive(Debug, Clone)]
pub struct ChunkingSettings {
    /// Token budget per chunk.
    pub chunk_size: usize,
    /// Tokens shared between adjacent chunks.
    pub overlap: usize,
    /// Embedding backend, used to pick a token counter.
    pub provider: EmbeddingProvider,
    /// Embedding model name.
    pub model: String,
}

impl ChunkingSettings {
    /// Resolve settings, deriving the chunk size when no override is given.
    pub fn resolve(
        override_size: Option<usize>,
        overlap: usize,
        provider: EmbeddingProvider,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            chunk_size: determine_chunk_size(override_size, provider, &model),
            overlap,
            provider,
            model,
        }
    }
}

/// A chunk with its content hash, ready to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChunk {
    /// Chunk text.
    pub text: String,
    /// SHA-256 of the text, hex encoded.
    pub chunk_hash: String,
}

pub(crate) fn determine_chunk_size(
    override_size: Option<usize>,
    provider: EmbeddingProvider,
    model: &str,
) -> usize {
    if let Some(explicit) = override_size {
        return explicit.max(1);
    }

    let window = embedding_context_window(provider, model);
    (window / 4).clamp(MIN_AUTOMATIC_CHUNK_SIZE, MAX_AUTOMATIC_CHUNK_SIZE)
}

fn embedding_context_window(provider: EmbeddingProvider, model: &str) -> usize {
    match provider {
        EmbeddingProvider::Hash => 2048,
        EmbeddingProvider::Ollama => {
            let normalized = model.to_lowercase();
            match normalized.as_str() {
                "nomic-embed-text" | "mxbai-embed-large" | "mxbai-embed-large-v1" => 8192,
                value if value.contains("all-minilm") => 512,
                value if value.starts_with("bge-m3") => 8192,
                value if value.starts_with("bge") || value.contains("e5-small") => 512,
                value if value.contains("e5-large") => 4096,
                _ => {
                    tracing::trace!(model, "Using default Ollama context window estimate");
                    4096
                }
            }
        }
    }
}

/// Split `text` into chunks of at most `settings.chunk_size` tokens.
///
/// Returns an empty vector for whitespace-only input.
pub fn chunk_text(text: &str, settings: &ChunkingSettings) -> Result<Vec<String>, ChunkingError> {
    if settings.chunk_size == 0 {
        return Err(ChunkingError::InvalidChunkSize);
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let counter = build_token_counter(settings.provider, &settings.model)?;
    Ok(chunk_text_with_counter(
        text,
        settings.chunk_size,
        settings.overlap,
        counter,
    ))
}

/// Drop empty and repeated chunks, keeping first occurrences in order.
pub fn dedupe_chunks(chunks: Vec<String>) -> (Vec<PreparedChunk>, usize) {
    let mut seen = HashSet::new();
    let mut prepared = Vec::new();
    let mut skipped = 0;

    for text in chunks {
        if text.trim().is_empty() {
            continue;
        }
        let chunk_hash = compute_chunk_hash(&text);
        if seen.insert(chunk_hash.clone()) {
            prepared.push(PreparedChunk { text, chunk_hash });
        } else {
            skipped += 1;
        }
    }

    (prepared, skipped)
}

fn build_token_counter(
    provider: EmbeddingProvider,
    model: &str,
) -> Result<TokenCounter, ChunkingError> {
    match provider {
        EmbeddingProvider::Hash => Ok(whitespace_counter()),
        EmbeddingProvider::Ollama => match build_tiktoken_counter(model) {
            Ok(counter) => Ok(counter),
            Err(error) => {
                tracing::warn!(
                    model,
                    error = %error,
                    "Tokenizer unavailable; falling back to whitespace counter"
                );
                Ok(whitespace_counter())
            }
        },
    }
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let target = match model.trim() {
        "" => "cl100k_base",
        trimmed => trimmed,
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);
    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(_) if model == "o200k_base" => o200k_base(),
        Err(error) => {
            tracing::debug!(model, error = %error, "Using cl100k_base for token counting");
            cl100k_base()
        }
    }
}

fn whitespace_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

fn chunk_text_with_counter(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    counter: TokenCounter,
) -> Vec<String> {
    let chunker_counter = counter.clone();
    let chunker = Chunker::new(
        chunk_size,
        Box::new(move |segment: &str| chunker_counter.as_ref()(segment)),
    );
    let base = chunker.chunk(text);

    let overlap = overlap.min(chunk_size.saturating_sub(1));
    if overlap == 0 || base.len() < 2 {
        return base;
    }

    let mut overlapped = Vec::with_capacity(base.len());
    let mut previous: Option<String> = None;
    for current in base {
        let chunk = match &previous {
            None => current.clone(),
            Some(prev) => {
                let tail = tail_within(prev, overlap, &counter);
                let mut combined = String::with_capacity(tail.len() + current.len() + 1);
                if !tail.is_empty() {
                    combined.push_str(tail);
                    if !tail.ends_with(char::is_whitespace)
                        && !current.starts_with(char::is_whitespace)
                    {
                        combined.push(' ');
                    }
                }
                combined.push_str(&current);
                tail_within(&combined, chunk_size, &counter).to_string()
            }
        };
        overlapped.push(chunk);
        previous = Some(current);
    }
    overlapped
}

/// Longest suffix of `text` (left-trimmed) whose token count fits `limit`.
fn tail_within<'a>(text: &'a str, limit: usize, counter: &TokenCounter) -> &'a str {
    if limit == 0 {
        return "";
    }
    for (offset, _) in text.char_indices() {
        let candidate = text[offset..].trim_start();
        if counter.as_ref()(candidate) <= limit {
            return candidate;
        }
    }
    ""
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_chunks_respect_budget() {
        let chunks = chunk_text_with_counter("one two three four five", 2, 0, whitespace_counter());
        assert_eq!(chunks, vec!["one two", "three four", "five"]);
    }

    #[test]
    fn overlap_repeats_tail_tokens() {
        let counter = whitespace_counter();
        let chunks = chunk_text_with_counter("one two three four five", 3, 1, counter.clone());
        assert_eq!(chunks, vec!["one two three", "three four five"]);
        assert!(chunks.iter().all(|chunk| counter.as_ref()(chunk) <= 3));
    }

    #[test]
    fn blank_input_yields_nothing() {
        let settings = ChunkingSettings::resolve(Some(8), 0, EmbeddingProvider::Hash, "hash");
        assert!(chunk_text("  \n ", &settings).expect("chunk").is_empty());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let settings = ChunkingSettings {
            chunk_size: 0,
            overlap: 0,
            provider: EmbeddingProvider::Hash,
            model: "hash".into(),
        };
        assert!(matches!(
            chunk_text("hello", &settings),
            Err(ChunkingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn chunk_size_override_and_model_windows() {
        assert_eq!(
            determine_chunk_size(Some(42), EmbeddingProvider::Ollama, "nomic-embed-text"),
            42
        );
        assert_eq!(
            determine_chunk_size(None, EmbeddingProvider::Ollama, "nomic-embed-text"),
            1024
        );
        assert_eq!(
            determine_chunk_size(None, EmbeddingProvider::Ollama, "all-minilm-l6-v2"),
            256
        );
        assert_eq!(determine_chunk_size(None, EmbeddingProvider::Hash, "hash"), 512);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let chunks = vec!["alpha".into(), "beta".into(), "alpha".into(), " ".into()];
        let (prepared, skipped) = dedupe_chunks(chunks);
        let texts: Vec<&str> = prepared.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["alpha", "beta"]);
        assert_eq!(skipped, 1);
    }
}
