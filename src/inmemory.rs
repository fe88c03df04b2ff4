//! In-memory vector store using cosine similarity.
//!
//! [`InMemoryVectorStore`] keeps each organization's sources and chunks in
//! nested maps behind a `tokio::sync::RwLock`, with tenant isolation
//! enforced by partitioning on the organization key. Suitable for
//! development and tests; production deployments use the
//! `pgvector`-backed store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SearchOptions;
use crate::error::{Result, RetrievalError};
use crate::generator::cosine_similarity;
use crate::types::{HybridSearchResult, NewChunk, SearchResult, combine_scores, validate_uuid};
use crate::vectorstore::{
    VectorStore, sanitize_keyword_query, validate_new_chunk, validate_search_inputs,
};

#[derive(Debug, Clone)]
struct SourceRecord {
    title: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct OrgData {
    sources: HashMap<String, SourceRecord>,
    chunks: HashMap<String, NewChunk>,
}

/// An in-memory [`VectorStore`] partitioned by organization.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    orgs: RwLock<HashMap<String, OrgData>>,
}

impl InMemoryVectorStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks visible to search: organization-scoped, live source, and
    /// matching the source filter when one is set.
    fn visible<'a>(
        org: &'a OrgData,
        source_filter: Option<&'a [String]>,
    ) -> impl Iterator<Item = (&'a String, &'a NewChunk)> {
        org.chunks.iter().filter(move |(_, chunk)| {
            if org.sources.get(&chunk.source_id).is_some_and(|s| s.deleted) {
                return false;
            }
            match source_filter {
                Some(ids) => ids.contains(&chunk.source_id),
                None => true,
            }
        })
    }

    fn source_title(org: &OrgData, source_id: &str) -> String {
        org.sources.get(source_id).map(|s| s.title.clone()).unwrap_or_default()
    }

    /// Fraction of sanitized query tokens that occur in the chunk text.
    /// Stands in for the relational backend's full-text rank.
    fn keyword_score(query_tokens: &[String], text: &str) -> f32 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let haystack = text.to_lowercase();
        let hits = query_tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
        hits as f32 / query_tokens.len() as f32
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn register_source(
        &self,
        organization_id: &str,
        source_id: &str,
        title: &str,
    ) -> Result<()> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;
        let mut orgs = self.orgs.write().await;
        let org = orgs.entry(organization_id.to_string()).or_default();
        org.sources
            .insert(source_id.to_string(), SourceRecord { title: title.to_string(), deleted: false });
        Ok(())
    }

    async fn soft_delete_source(&self, organization_id: &str, source_id: &str) -> Result<bool> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;
        let mut orgs = self.orgs.write().await;
        let Some(org) = orgs.get_mut(organization_id) else { return Ok(false) };
        match org.sources.get_mut(source_id) {
            Some(source) => {
                source.deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert(&self, chunk: &NewChunk) -> Result<String> {
        validate_new_chunk(chunk)?;
        let id = Uuid::new_v4().to_string();
        let mut orgs = self.orgs.write().await;
        let org = orgs.entry(chunk.organization_id.clone()).or_default();
        // Sources unseen by register_source get an untitled record so the
        // chunk stays searchable.
        org.sources
            .entry(chunk.source_id.clone())
            .or_insert_with(|| SourceRecord { title: String::new(), deleted: false });
        org.chunks.insert(id.clone(), chunk.clone());
        Ok(id)
    }

    async fn insert_batch(&self, chunks: &[NewChunk]) -> Result<Vec<String>> {
        let Some(first) = chunks.first() else { return Ok(Vec::new()) };
        for chunk in chunks {
            validate_new_chunk(chunk)?;
            if chunk.organization_id != first.organization_id {
                return Err(RetrievalError::validation(
                    "batch insert requires all chunks to share one organization",
                ));
            }
        }

        // Single write-lock section keeps the batch atomic.
        let mut orgs = self.orgs.write().await;
        let org = orgs.entry(first.organization_id.clone()).or_default();
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = Uuid::new_v4().to_string();
            org.sources
                .entry(chunk.source_id.clone())
                .or_insert_with(|| SourceRecord { title: String::new(), deleted: false });
            org.chunks.insert(id.clone(), chunk.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        organization_id: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        validate_search_inputs(organization_id, embedding, options)?;
        let orgs = self.orgs.read().await;
        let Some(org) = orgs.get(organization_id) else { return Ok(Vec::new()) };

        let mut scored: Vec<SearchResult> = Vec::new();
        for (id, chunk) in Self::visible(org, options.source_ids.as_deref()) {
            let similarity = cosine_similarity(&chunk.embedding, embedding)?;
            scored.push(SearchResult {
                chunk_id: id.clone(),
                source_id: chunk.source_id.clone(),
                source_title: Self::source_title(org, &chunk.source_id),
                text: chunk.text.clone(),
                page_number: chunk.page_number,
                section_header: chunk.section_header.clone(),
                chunk_index: chunk.chunk_index,
                similarity,
            });
        }

        scored.sort_by(|a, b| {
            b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(options.top_k);
        scored.retain(|r| r.similarity >= options.min_score);
        Ok(scored)
    }

    async fn hybrid_search(
        &self,
        organization_id: &str,
        query: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<HybridSearchResult>> {
        validate_search_inputs(organization_id, embedding, options)?;
        let sanitized = sanitize_keyword_query(query);
        let query_tokens: Vec<String> =
            sanitized.to_lowercase().split_whitespace().map(str::to_string).collect();

        let orgs = self.orgs.read().await;
        let Some(org) = orgs.get(organization_id) else { return Ok(Vec::new()) };

        let mut scored: Vec<HybridSearchResult> = Vec::new();
        for (id, chunk) in Self::visible(org, options.source_ids.as_deref()) {
            let vector_score = cosine_similarity(&chunk.embedding, embedding)?;
            let keyword_score = Self::keyword_score(&query_tokens, &chunk.text);
            let final_score = combine_scores(options.vector_weight, vector_score, keyword_score);
            scored.push(HybridSearchResult {
                result: SearchResult {
                    chunk_id: id.clone(),
                    source_id: chunk.source_id.clone(),
                    source_title: Self::source_title(org, &chunk.source_id),
                    text: chunk.text.clone(),
                    page_number: chunk.page_number,
                    section_header: chunk.section_header.clone(),
                    chunk_index: chunk.chunk_index,
                    similarity: final_score,
                },
                vector_score,
                keyword_score,
                final_score,
            });
        }

        scored.sort_by(|a, b| {
            b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(options.top_k);
        scored.retain(|r| r.final_score >= options.min_score);
        Ok(scored)
    }

    async fn delete_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;
        let mut orgs = self.orgs.write().await;
        let Some(org) = orgs.get_mut(organization_id) else { return Ok(0) };
        let before = org.chunks.len();
        org.chunks.retain(|_, chunk| chunk.source_id != source_id);
        Ok((before - org.chunks.len()) as u64)
    }

    async fn delete_chunk(&self, organization_id: &str, chunk_id: &str) -> Result<bool> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(chunk_id, "chunk_id")?;
        let mut orgs = self.orgs.write().await;
        let Some(org) = orgs.get_mut(organization_id) else { return Ok(false) };
        Ok(org.chunks.remove(chunk_id).is_some())
    }

    async fn has_duplicate(
        &self,
        organization_id: &str,
        source_id: &str,
        text_hash: &str,
    ) -> Result<bool> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;
        let orgs = self.orgs.read().await;
        let Some(org) = orgs.get(organization_id) else { return Ok(false) };
        Ok(org
            .chunks
            .values()
            .any(|c| c.source_id == source_id && c.text_hash == text_hash))
    }

    async fn count_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;
        let orgs = self.orgs.read().await;
        let Some(org) = orgs.get(organization_id) else { return Ok(0) };
        Ok(org.chunks.values().filter(|c| c.source_id == source_id).count() as u64)
    }

    async fn count_by_organization(&self, organization_id: &str) -> Result<u64> {
        validate_uuid(organization_id, "organization_id")?;
        let orgs = self.orgs.read().await;
        Ok(orgs.get(organization_id).map_or(0, |org| org.chunks.len() as u64))
    }
}
