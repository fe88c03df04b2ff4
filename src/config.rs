//! Configuration for chunking, embedding generation, and search.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};
use crate::types::DocumentType;

/// How text is segmented into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Sentence-accumulating chunks with overlap tails.
    Semantic,
    /// Character-window chunks with whitespace snapping.
    Fixed,
    /// Per page: semantic when sentence boundaries exist, else fixed.
    #[default]
    Hybrid,
}

/// Configuration for the chunking engine.
///
/// All sizes are in estimated tokens; the token estimate is
/// `ceil(chars / chars_per_token)` with no external tokenizer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Segmentation strategy.
    pub strategy: ChunkingStrategy,
    /// Target chunk size in tokens.
    pub target_chunk_size: usize,
    /// Hard upper bound on chunk size in tokens.
    pub max_chunk_size: usize,
    /// Chunks below this size are merged into their predecessor when possible.
    pub min_chunk_size: usize,
    /// Overlap carried between consecutive chunks, in tokens.
    pub overlap_tokens: usize,
    /// Whether semantic chunking keeps sentences intact.
    pub preserve_sentences: bool,
    /// Characters per token for the size estimate.
    pub chars_per_token: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Hybrid,
            target_chunk_size: 400,
            max_chunk_size: 500,
            min_chunk_size: 50,
            overlap_tokens: 50,
            preserve_sentences: true,
            chars_per_token: 4,
        }
    }
}

impl ChunkingConfig {
    /// Per-document-type chunking overrides.
    ///
    /// Structured ID documents use small fixed chunks without sentence
    /// preservation; legal text uses larger chunks with more overlap.
    pub fn for_document_type(doc_type: DocumentType) -> Self {
        match doc_type {
            DocumentType::General => Self::default(),
            DocumentType::IdDocument => Self {
                strategy: ChunkingStrategy::Fixed,
                target_chunk_size: 150,
                max_chunk_size: 200,
                min_chunk_size: 20,
                overlap_tokens: 20,
                preserve_sentences: false,
                ..Self::default()
            },
            DocumentType::Legal => Self {
                strategy: ChunkingStrategy::Semantic,
                target_chunk_size: 450,
                max_chunk_size: 600,
                min_chunk_size: 80,
                overlap_tokens: 100,
                ..Self::default()
            },
        }
    }

    /// Create a new builder.
    pub fn builder() -> ChunkingConfigBuilder {
        ChunkingConfigBuilder::default()
    }
}

/// Builder for a validated [`ChunkingConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChunkingConfigBuilder {
    config: ChunkingConfig,
}

impl ChunkingConfigBuilder {
    /// Set the segmentation strategy.
    pub fn strategy(mut self, strategy: ChunkingStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the target chunk size in tokens.
    pub fn target_chunk_size(mut self, tokens: usize) -> Self {
        self.config.target_chunk_size = tokens;
        self
    }

    /// Set the maximum chunk size in tokens.
    pub fn max_chunk_size(mut self, tokens: usize) -> Self {
        self.config.max_chunk_size = tokens;
        self
    }

    /// Set the minimum chunk size in tokens.
    pub fn min_chunk_size(mut self, tokens: usize) -> Self {
        self.config.min_chunk_size = tokens;
        self
    }

    /// Set the overlap between consecutive chunks in tokens.
    pub fn overlap_tokens(mut self, tokens: usize) -> Self {
        self.config.overlap_tokens = tokens;
        self
    }

    /// Set whether semantic chunking keeps sentences intact.
    pub fn preserve_sentences(mut self, preserve: bool) -> Self {
        self.config.preserve_sentences = preserve;
        self
    }

    /// Set the characters-per-token estimate.
    pub fn chars_per_token(mut self, chars: usize) -> Self {
        self.config.chars_per_token = chars;
        self
    }

    /// Build the config, validating parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] if:
    /// - `chars_per_token == 0` or `target_chunk_size == 0`
    /// - `target_chunk_size > max_chunk_size`
    /// - `overlap_tokens >= target_chunk_size`
    pub fn build(self) -> Result<ChunkingConfig> {
        let c = &self.config;
        if c.chars_per_token == 0 {
            return Err(RetrievalError::Config("chars_per_token must be greater than zero".into()));
        }
        if c.target_chunk_size == 0 {
            return Err(RetrievalError::Config(
                "target_chunk_size must be greater than zero".into(),
            ));
        }
        if c.target_chunk_size > c.max_chunk_size {
            return Err(RetrievalError::Config(format!(
                "target_chunk_size ({}) must not exceed max_chunk_size ({})",
                c.target_chunk_size, c.max_chunk_size
            )));
        }
        if c.overlap_tokens >= c.target_chunk_size {
            return Err(RetrievalError::Config(format!(
                "overlap_tokens ({}) must be less than target_chunk_size ({})",
                c.overlap_tokens, c.target_chunk_size
            )));
        }
        Ok(self.config)
    }
}

/// Configuration for the embedding generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Per-organization daily embedding cap.
    pub daily_quota_limit: i64,
    /// Texts per provider batch request.
    pub batch_size: usize,
    /// Batches in flight at once during batch generation.
    pub max_concurrent_batches: usize,
    /// Minimum delay between outbound provider calls, in milliseconds.
    pub rate_limit_delay_ms: u64,
    /// Attempts per embedding request before surfacing a provider error.
    pub max_retries: u32,
    /// Base for exponential backoff between attempts, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// TTL for cached embeddings, in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            daily_quota_limit: 1000,
            batch_size: 10,
            max_concurrent_batches: 3,
            rate_limit_delay_ms: 100,
            max_retries: 3,
            retry_base_delay_ms: 500,
            cache_ttl_secs: 3600,
        }
    }
}

impl EmbeddingConfig {
    /// Validate parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] if any count is zero or the
    /// quota limit is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.daily_quota_limit <= 0 {
            return Err(RetrievalError::Config("daily_quota_limit must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(RetrievalError::Config("batch_size must be greater than zero".into()));
        }
        if self.max_concurrent_batches == 0 {
            return Err(RetrievalError::Config(
                "max_concurrent_batches must be greater than zero".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(RetrievalError::Config("max_retries must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Options for similarity and hybrid search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Number of top candidates to take before score filtering.
    pub top_k: usize,
    /// Results scoring below this are dropped.
    pub min_score: f32,
    /// Restrict results to these source documents, when set.
    pub source_ids: Option<Vec<String>>,
    /// Weight of the vector component in hybrid scoring.
    pub vector_weight: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { top_k: 5, min_score: 0.5, source_ids: None, vector_weight: 0.7 }
    }
}

impl SearchOptions {
    /// Validate option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] if `top_k == 0` or
    /// `vector_weight` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RetrievalError::Config("top_k must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&self.vector_weight) {
            return Err(RetrievalError::Config(format!(
                "vector_weight ({}) must be within [0, 1]",
                self.vector_weight
            )));
        }
        Ok(())
    }

    /// Canonical string form used in cache keys. Field order is fixed so
    /// identical options always hash identically.
    pub(crate) fn cache_repr(&self) -> String {
        let sources = match &self.source_ids {
            Some(ids) => {
                let mut sorted = ids.clone();
                sorted.sort();
                sorted.join(",")
            }
            None => String::new(),
        };
        format!(
            "k={};min={:.4};w={:.4};src={sources}",
            self.top_k, self.min_score, self.vector_weight
        )
    }
}
