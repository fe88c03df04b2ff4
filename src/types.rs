//! Data types for chunks, search results, and field suggestions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RetrievalError};

/// Dimensionality of all embeddings accepted by this crate.
pub const EMBEDDING_DIM: usize = 768;

/// One page of extracted document text, as supplied by the ingestion
/// pipeline upstream of chunking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageText {
    /// 1-based page number in the source document.
    pub page_number: u32,
    /// Extracted text for the page.
    pub text: String,
}

/// Document categories with distinct chunking behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// General prose documents (default).
    #[default]
    General,
    /// Structured identity documents: small fixed chunks, no sentence
    /// preservation.
    IdDocument,
    /// Legal/contract text: larger chunks with more overlap.
    Legal,
}

/// A chunk ready for insertion: text, embedding, and positional metadata,
/// owned by one organization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChunk {
    /// UUID of the source document this chunk was cut from.
    pub source_id: String,
    /// UUID of the owning organization.
    pub organization_id: String,
    /// The chunk text.
    pub text: String,
    /// Estimated token count (`ceil(len / chars_per_token)`).
    pub token_count: u32,
    /// 0-based position of the chunk within its document.
    pub chunk_index: u32,
    /// The 768-dimensional embedding vector.
    pub embedding: Vec<f32>,
    /// SHA-256 of the trimmed chunk text, used for deduplication.
    pub text_hash: String,
    /// Page the chunk starts on, when known.
    pub page_number: Option<u32>,
    /// Most recent section header at or before the chunk start, when any.
    pub section_header: Option<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

/// A chunk produced by the chunking engine, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The chunk text.
    pub text: String,
    /// Estimated token count.
    pub token_count: u32,
    /// 0-based index after deduplication.
    pub chunk_index: u32,
    /// SHA-256 of the trimmed text.
    pub text_hash: String,
    /// Page the chunk starts on.
    pub page_number: Option<u32>,
    /// Section header in effect at the chunk start.
    pub section_header: Option<String>,
    /// True for fixed-strategy chunks after the first, which carry
    /// overlapping text from their predecessor.
    pub is_overlap: bool,
}

/// Aggregate statistics for one chunking run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingStats {
    /// Number of chunks after deduplication.
    pub total_chunks: usize,
    /// Sum of estimated token counts.
    pub total_tokens: u64,
    /// Mean tokens per chunk (0 when there are no chunks).
    pub average_tokens: f64,
    /// Chunks dropped because their text hash was already seen.
    pub duplicates_removed: usize,
}

/// A similarity search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// UUID of the matched chunk.
    pub chunk_id: String,
    /// UUID of the chunk's source document.
    pub source_id: String,
    /// Title of the source document.
    pub source_title: String,
    /// The chunk text.
    pub text: String,
    /// Page the chunk starts on, when known.
    pub page_number: Option<u32>,
    /// Section header attached to the chunk, when any.
    pub section_header: Option<String>,
    /// Position of the chunk within its document.
    pub chunk_index: u32,
    /// Cosine similarity in `[-1, 1]` (`1 - cosine_distance`).
    pub similarity: f32,
}

/// A hybrid search hit: vector and keyword rankings joined per chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HybridSearchResult {
    /// The underlying search hit, with `similarity` set to `final_score`.
    #[serde(flatten)]
    pub result: SearchResult,
    /// Vector similarity component.
    pub vector_score: f32,
    /// Keyword relevance component (0 when the chunk had no keyword match).
    pub keyword_score: f32,
    /// `vector_weight * vector_score + (1 - vector_weight) * keyword_score`.
    pub final_score: f32,
}

/// How a field suggestion was extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Field-type-specific regular expression.
    Regex,
    /// `"<field>: value"` / `"value is <field>"` phrasing.
    Semantic,
    /// Field-specific contextual heuristic.
    Context,
}

/// Known field value types for suggestion extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Free text.
    Text,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Calendar date.
    Date,
    /// Generic number.
    Number,
    /// Monetary amount.
    Currency,
    /// Postal address.
    Address,
    /// Person name.
    Name,
}

/// A ranked candidate value for a form field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSuggestion {
    /// The candidate value.
    pub value: String,
    /// Confidence in `[0, 1]`, derived from the search similarity and the
    /// extraction strategy's weight.
    pub confidence: f32,
    /// Chunk the value was extracted from.
    pub source_chunk_id: String,
    /// Title of the source document.
    pub source_title: String,
    /// The strategy that produced this suggestion.
    pub extraction_method: ExtractionMethod,
    /// Raw matched text, when it differs from `value`.
    pub matched_text: Option<String>,
}

/// Combine vector and keyword scores into a hybrid final score.
pub fn combine_scores(vector_weight: f32, vector_score: f32, keyword_score: f32) -> f32 {
    vector_weight * vector_score + (1.0 - vector_weight) * keyword_score
}

/// Validate that a string is a well-formed UUID, returning it parsed.
///
/// Every tenant-scoped operation runs its `organization_id` (and any
/// source/chunk ids) through this before touching I/O.
pub fn validate_uuid(value: &str, field: &str) -> Result<Uuid> {
    if value.trim().is_empty() {
        return Err(RetrievalError::validation(format!("{field} must not be empty")));
    }
    Uuid::parse_str(value)
        .map_err(|_| RetrievalError::validation(format!("{field} is not a valid UUID: {value:?}")))
}

/// Validate that an embedding has exactly [`EMBEDDING_DIM`] finite components.
pub fn validate_embedding(embedding: &[f32]) -> Result<()> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(RetrievalError::validation(format!(
            "embedding must have {EMBEDDING_DIM} dimensions, got {}",
            embedding.len()
        )));
    }
    if let Some(pos) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(RetrievalError::validation(format!(
            "embedding component {pos} is not finite"
        )));
    }
    Ok(())
}

/// SHA-256 of the trimmed text, hex-encoded. The per-(source, organization)
/// dedup key for chunk content.
pub fn text_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.trim().as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
