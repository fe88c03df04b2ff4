//! Vector store trait: tenant-scoped persistence and similarity/hybrid
//! search over chunks.

use async_trait::async_trait;

use crate::config::SearchOptions;
use crate::error::Result;
use crate::types::{
    HybridSearchResult, NewChunk, SearchResult, validate_embedding, validate_uuid,
};

/// Longest keyword query passed to the full-text ranker.
pub const MAX_KEYWORD_QUERY_LEN: usize = 200;

/// A tenant-isolated storage backend for chunks with embeddings.
///
/// Every operation takes a non-empty, UUID-formatted `organization_id` and
/// must never return or mutate a chunk belonging to a different
/// organization, even when source ids collide across tenants.
/// Implementations validate ids before any I/O and bind all query
/// parameters — ids, serialized vectors, sanitized keyword strings — rather
/// than concatenating them into query text.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Register (or retitle) a source document for the organization.
    async fn register_source(
        &self,
        organization_id: &str,
        source_id: &str,
        title: &str,
    ) -> Result<()>;

    /// Soft-delete a source, hiding its chunks from search. Returns whether
    /// a source row was marked.
    async fn soft_delete_source(&self, organization_id: &str, source_id: &str) -> Result<bool>;

    /// Insert one chunk, returning its generated chunk id.
    async fn insert(&self, chunk: &NewChunk) -> Result<String>;

    /// Insert many chunks in one atomic transaction. All chunks must share
    /// one organization; a heterogeneous batch fails before any write.
    async fn insert_batch(&self, chunks: &[NewChunk]) -> Result<Vec<String>>;

    /// Nearest-neighbor search, restricted to the organization (and to
    /// `options.source_ids` when set), excluding soft-deleted sources.
    /// Takes the `top_k` nearest, then drops results below
    /// `options.min_score`. `similarity = 1 - cosine_distance`.
    async fn search(
        &self,
        organization_id: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>>;

    /// Hybrid search: vector ranking and keyword ranking computed
    /// independently, joined per chunk, scored as
    /// `vector_weight * vector + (1 - vector_weight) * keyword`. A chunk
    /// without a keyword match still appears if its vector score alone
    /// clears the threshold (keyword score defaults to 0).
    async fn hybrid_search(
        &self,
        organization_id: &str,
        query: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<HybridSearchResult>>;

    /// Delete all chunks for a source within the organization, returning
    /// how many were removed.
    async fn delete_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64>;

    /// Delete at most one chunk by id, returning whether a row was removed.
    async fn delete_chunk(&self, organization_id: &str, chunk_id: &str) -> Result<bool>;

    /// Whether an identical chunk (same text hash) already exists for the
    /// source within the organization.
    async fn has_duplicate(
        &self,
        organization_id: &str,
        source_id: &str,
        text_hash: &str,
    ) -> Result<bool>;

    /// Chunk count for one source, tenant-scoped.
    async fn count_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64>;

    /// Chunk count for the whole organization.
    async fn count_by_organization(&self, organization_id: &str) -> Result<u64>;
}

/// Strip control and operator characters from a keyword query and cap its
/// length. Secondary defense only — the sanitized string is still passed as
/// a bound parameter.
pub fn sanitize_keyword_query(query: &str) -> String {
    let mut cleaned: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    if cleaned.len() > MAX_KEYWORD_QUERY_LEN {
        let mut cut = MAX_KEYWORD_QUERY_LEN;
        while cut > 0 && !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate a chunk's ids, embedding shape, and text before any write.
pub(crate) fn validate_new_chunk(chunk: &NewChunk) -> Result<()> {
    validate_uuid(&chunk.organization_id, "organization_id")?;
    validate_uuid(&chunk.source_id, "source_id")?;
    validate_embedding(&chunk.embedding)?;
    if chunk.text.trim().is_empty() {
        return Err(crate::error::RetrievalError::validation("chunk text must not be empty"));
    }
    Ok(())
}

/// Validate search inputs shared by every backend: organization id, query
/// embedding shape, option ranges, and any source-id filters.
pub(crate) fn validate_search_inputs(
    organization_id: &str,
    embedding: &[f32],
    options: &SearchOptions,
) -> Result<()> {
    validate_uuid(organization_id, "organization_id")?;
    validate_embedding(embedding)?;
    options.validate().map_err(|e| crate::error::RetrievalError::validation(e.to_string()))?;
    if let Some(source_ids) = &options.source_ids {
        for id in source_ids {
            validate_uuid(id, "source_id")?;
        }
    }
    Ok(())
}
