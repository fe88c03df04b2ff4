//! End-to-end retrieval pipeline: ingest, cached search, deletion, and
//! field suggestions over one generator and one vector store.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ragkit::cache::InMemoryCache;
//! use ragkit::config::EmbeddingConfig;
//! use ragkit::generator::EmbeddingGenerator;
//! use ragkit::inmemory::InMemoryVectorStore;
//! use ragkit::pipeline::RetrievalPipeline;
//! use ragkit::quota::InMemoryQuotaBackend;
//!
//! # fn build(providers: Vec<Arc<dyn ragkit::embedding::EmbeddingProvider>>) -> ragkit::error::Result<RetrievalPipeline> {
//! let generator = EmbeddingGenerator::new(
//!     providers,
//!     EmbeddingConfig::default(),
//!     Arc::new(InMemoryQuotaBackend::new()),
//!     None,
//! )?;
//! let pipeline = RetrievalPipeline::builder()
//!     .generator(Arc::new(generator))
//!     .store(Arc::new(InMemoryVectorStore::new()))
//!     .cache(Arc::new(InMemoryCache::new()))
//!     .build()?;
//! # Ok(pipeline)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{KeyValueCache, SearchCache, SearchMode};
use crate::chunking::ChunkingEngine;
use crate::config::{ChunkingConfig, SearchOptions};
use crate::error::{Result, RetrievalError};
use crate::generator::EmbeddingGenerator;
use crate::suggest::{SuggestionExtractor, SuggestionRequest};
use crate::types::{
    ChunkingStats, DocumentType, FieldSuggestion, HybridSearchResult, NewChunk, PageText,
    SearchResult, text_hash, validate_uuid,
};
use crate::vectorstore::VectorStore;

/// What an ingestion run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Ids of the chunks written to the store, in document order.
    pub chunk_ids: Vec<String>,
    /// Chunks written to the store.
    pub chunks_inserted: usize,
    /// Chunks skipped because an identical chunk already existed for the
    /// source.
    pub chunks_skipped: usize,
    /// Chunks dropped because their embedding could not be generated.
    pub embedding_failures: usize,
    /// Chunking statistics for the run.
    pub stats: ChunkingStats,
}

/// Builder for [`RetrievalPipeline`].
#[derive(Default)]
pub struct RetrievalPipelineBuilder {
    generator: Option<Arc<EmbeddingGenerator>>,
    store: Option<Arc<dyn VectorStore>>,
    cache: Option<Arc<dyn KeyValueCache>>,
    search_ttl: Option<Duration>,
}

impl RetrievalPipelineBuilder {
    /// Set the embedding generator (required).
    pub fn generator(mut self, generator: Arc<EmbeddingGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the vector store (required).
    pub fn store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Back search results and field suggestions with this cache. Without
    /// one, every query recomputes.
    pub fn cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the search-result cache TTL.
    pub fn search_ttl(mut self, ttl: Duration) -> Self {
        self.search_ttl = Some(ttl);
        self
    }

    /// Build the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] when the generator or store is
    /// missing.
    pub fn build(self) -> Result<RetrievalPipeline> {
        let generator = self
            .generator
            .ok_or_else(|| RetrievalError::Config("pipeline requires a generator".into()))?;
        let store = self
            .store
            .ok_or_else(|| RetrievalError::Config("pipeline requires a vector store".into()))?;

        let search_cache = self.cache.as_ref().map(|backend| {
            let cache = SearchCache::new(Arc::clone(backend));
            match self.search_ttl {
                Some(ttl) => cache.with_ttl(ttl),
                None => cache,
            }
        });
        let mut suggestions = SuggestionExtractor::new(Arc::clone(&generator), Arc::clone(&store));
        if let Some(backend) = &self.cache {
            suggestions = suggestions.with_cache(Arc::clone(backend));
        }

        Ok(RetrievalPipeline { generator, store, search_cache, suggestions })
    }
}

/// The full retrieval pipeline: chunking, embedding, storage, cached
/// search, and suggestion extraction behind one entry point.
pub struct RetrievalPipeline {
    generator: Arc<EmbeddingGenerator>,
    store: Arc<dyn VectorStore>,
    search_cache: Option<SearchCache>,
    suggestions: SuggestionExtractor,
}

impl RetrievalPipeline {
    /// Start building a pipeline.
    pub fn builder() -> RetrievalPipelineBuilder {
        RetrievalPipelineBuilder::default()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// The underlying generator.
    pub fn generator(&self) -> &Arc<EmbeddingGenerator> {
        &self.generator
    }

    /// Ingest a document: chunk its pages with the strategy for
    /// `document_type`, skip chunks that already exist for the source,
    /// embed the rest in batch, insert atomically, and invalidate the
    /// organization's cached queries.
    ///
    /// Chunks whose embedding fails are dropped and counted in the report
    /// rather than failing the whole ingest, except for quota exhaustion,
    /// which aborts before any write.
    pub async fn ingest_document(
        &self,
        organization_id: &str,
        source_id: &str,
        title: &str,
        pages: &[PageText],
        document_type: DocumentType,
    ) -> Result<IngestReport> {
        validate_uuid(organization_id, "organization_id")?;
        validate_uuid(source_id, "source_id")?;

        self.store.register_source(organization_id, source_id, title).await?;

        let engine = ChunkingEngine::new(ChunkingConfig::for_document_type(document_type));
        let output = engine.chunk_pages(pages);
        debug!(
            organization_id,
            source_id,
            chunks = output.chunks.len(),
            duplicates_removed = output.stats.duplicates_removed,
            "chunked document"
        );

        let mut fresh = Vec::with_capacity(output.chunks.len());
        let mut skipped = 0usize;
        for chunk in output.chunks {
            if self.store.has_duplicate(organization_id, source_id, &chunk.text_hash).await? {
                skipped += 1;
            } else {
                fresh.push(chunk);
            }
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let batch = self.generator.generate_batch(organization_id, &texts).await?;

        let mut rows: Vec<NewChunk> = Vec::with_capacity(fresh.len());
        for (chunk, embedding) in fresh.into_iter().zip(batch.embeddings) {
            let Some(embedding) = embedding else { continue };
            rows.push(NewChunk {
                source_id: source_id.to_string(),
                organization_id: organization_id.to_string(),
                text: chunk.text,
                token_count: chunk.token_count,
                chunk_index: chunk.chunk_index,
                embedding,
                text_hash: chunk.text_hash,
                page_number: chunk.page_number,
                section_header: chunk.section_header,
                metadata: HashMap::new(),
            });
        }
        let chunk_ids =
            if rows.is_empty() { Vec::new() } else { self.store.insert_batch(&rows).await? };

        self.invalidate(organization_id).await?;
        let report = IngestReport {
            chunks_inserted: chunk_ids.len(),
            chunk_ids,
            chunks_skipped: skipped,
            embedding_failures: batch.failure_count,
            stats: output.stats,
        };
        info!(
            organization_id,
            source_id,
            inserted = report.chunks_inserted,
            skipped = report.chunks_skipped,
            embedding_failures = report.embedding_failures,
            "document ingested"
        );
        Ok(report)
    }

    /// Semantic search with result caching. A cache hit skips embedding
    /// generation entirely.
    pub async fn search(
        &self,
        organization_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        validate_uuid(organization_id, "organization_id")?;
        if let Some(cache) = &self.search_cache
            && let Some(hit) =
                cache.get(organization_id, SearchMode::Semantic, query, options).await?
        {
            return Ok(hit);
        }

        let generated = self.generator.generate(organization_id, query).await?;
        let results = self.store.search(organization_id, &generated.embedding, options).await?;

        if let Some(cache) = &self.search_cache {
            cache.set(organization_id, SearchMode::Semantic, query, options, &results).await?;
        }
        Ok(results)
    }

    /// Hybrid vector + keyword search with result caching.
    pub async fn hybrid_search(
        &self,
        organization_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<HybridSearchResult>> {
        validate_uuid(organization_id, "organization_id")?;
        if let Some(cache) = &self.search_cache
            && let Some(hit) =
                cache.get(organization_id, SearchMode::Hybrid, query, options).await?
        {
            return Ok(hit);
        }

        let generated = self.generator.generate(organization_id, query).await?;
        let results = self
            .store
            .hybrid_search(organization_id, query, &generated.embedding, options)
            .await?;

        if let Some(cache) = &self.search_cache {
            cache.set(organization_id, SearchMode::Hybrid, query, options, &results).await?;
        }
        Ok(results)
    }

    /// Hard-delete a source's chunks and invalidate cached queries.
    /// Returns how many chunks were removed.
    pub async fn delete_source(&self, organization_id: &str, source_id: &str) -> Result<u64> {
        let removed = self.store.delete_by_source(organization_id, source_id).await?;
        self.invalidate(organization_id).await?;
        info!(organization_id, source_id, removed, "source deleted");
        Ok(removed)
    }

    /// Soft-delete a source, hiding its chunks from search without
    /// removing them, and invalidate cached queries.
    pub async fn archive_source(&self, organization_id: &str, source_id: &str) -> Result<bool> {
        let marked = self.store.soft_delete_source(organization_id, source_id).await?;
        if marked {
            self.invalidate(organization_id).await?;
        }
        Ok(marked)
    }

    /// Delete one chunk and invalidate cached queries when a row was
    /// removed.
    pub async fn delete_chunk(&self, organization_id: &str, chunk_id: &str) -> Result<bool> {
        let removed = self.store.delete_chunk(organization_id, chunk_id).await?;
        if removed {
            self.invalidate(organization_id).await?;
        }
        Ok(removed)
    }

    /// Suggest values for one form field.
    pub async fn suggest(
        &self,
        organization_id: &str,
        request: &SuggestionRequest,
    ) -> Result<Vec<FieldSuggestion>> {
        self.suggestions.suggest(organization_id, request).await
    }

    /// Suggest values for many fields concurrently.
    pub async fn suggest_batch(
        &self,
        organization_id: &str,
        requests: &[SuggestionRequest],
    ) -> Result<Vec<Vec<FieldSuggestion>>> {
        self.suggestions.suggest_batch(organization_id, requests).await
    }

    /// Suggest values for a field using already-filled fields as context.
    pub async fn suggest_with_values(
        &self,
        organization_id: &str,
        request: &SuggestionRequest,
        filled: &HashMap<String, String>,
    ) -> Result<Vec<FieldSuggestion>> {
        self.suggestions.suggest_with_values(organization_id, request, filled).await
    }

    /// Remaining embedding quota for the organization today.
    pub async fn remaining_quota(&self, organization_id: &str) -> Result<i64> {
        self.generator.remaining_quota(organization_id).await
    }

    /// Deduplication key for chunk text, exposed for callers that stage
    /// chunks outside the pipeline.
    pub fn chunk_text_hash(text: &str) -> String {
        text_hash(text)
    }

    /// Drop the organization's cached search results and suggestions.
    async fn invalidate(&self, organization_id: &str) -> Result<()> {
        if let Some(cache) = &self.search_cache {
            cache.invalidate_organization(organization_id).await?;
        }
        self.suggestions.invalidate_organization(organization_id).await?;
        Ok(())
    }
}
