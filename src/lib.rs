//! # ragkit
//!
//! Multi-tenant knowledge retrieval: document chunking, embedding
//! generation, vector + keyword search, and form-field suggestion
//! extraction, with strict per-organization isolation.
//!
//! ## Features
//!
//! - **Chunking**: semantic, fixed, and hybrid strategies with token
//!   budgets, overlap, section-header tracking, and hash deduplication
//! - **Embeddings**: 768-dimensional vectors behind a provider trait,
//!   with daily quotas, caching, rate limiting, and credential rotation
//! - **Search**: cosine similarity and hybrid vector + keyword ranking,
//!   tenant-isolated, with per-organization result caching
//! - **Suggestions**: ranked field-value candidates extracted from
//!   retrieved chunks by pattern, semantic, and context strategies
//!
//! Backends are feature-gated: `gemini` for the Gemini embedding
//! provider, `pgvector` for the Postgres store, `redis-backend` for
//! Redis quota and cache backends. The in-memory store, cache, and quota
//! backends always build and carry the same semantics.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ragkit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ragkit::error::Result<()> {
//!     let provider = Arc::new(GeminiEmbeddingProvider::new("api-key")?);
//!     let generator = EmbeddingGenerator::new(
//!         vec![provider],
//!         EmbeddingConfig::default(),
//!         Arc::new(InMemoryQuotaBackend::new()),
//!         None,
//!     )?;
//!     let pipeline = RetrievalPipeline::builder()
//!         .generator(Arc::new(generator))
//!         .store(Arc::new(InMemoryVectorStore::new()))
//!         .cache(Arc::new(InMemoryCache::new()))
//!         .build()?;
//!
//!     let org = "4b824c16-6b35-4b9e-a135-cc1f2fdab9c1";
//!     let results = pipeline.search(org, "payment terms", &SearchOptions::default()).await?;
//!     for hit in results {
//!         println!("{:.2} {}", hit.similarity, hit.source_title);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod chunking;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod inmemory;
pub mod pipeline;
pub mod quota;
pub mod suggest;
pub mod types;
pub mod vectorstore;

#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "pgvector")]
pub mod pgvector;

pub use cache::{InMemoryCache, KeyValueCache, SearchCache, SearchMode};
pub use chunking::{ChunkingEngine, ChunkingOutput};
pub use config::{
    ChunkingConfig, ChunkingConfigBuilder, ChunkingStrategy, EmbeddingConfig, SearchOptions,
};
pub use embedding::EmbeddingProvider;
pub use error::{Result, RetrievalError};
pub use generator::{
    BatchEmbeddingOutcome, EmbeddingGenerator, GeneratedEmbedding, cosine_similarity,
    top_k_similar,
};
pub use inmemory::InMemoryVectorStore;
pub use pipeline::{IngestReport, RetrievalPipeline, RetrievalPipelineBuilder};
pub use quota::{InMemoryQuotaBackend, QuotaBackend, QuotaDecision};
pub use suggest::{SuggestionExtractor, SuggestionRequest};
pub use types::{
    ChunkingStats, DocumentType, EMBEDDING_DIM, ExtractionMethod, FieldSuggestion, FieldType,
    HybridSearchResult, NewChunk, PageText, SearchResult, TextChunk,
};
pub use vectorstore::VectorStore;

#[cfg(feature = "gemini")]
pub use gemini::GeminiEmbeddingProvider;
#[cfg(feature = "pgvector")]
pub use pgvector::PgVectorStore;
#[cfg(feature = "redis-backend")]
pub use cache::RedisCache;
#[cfg(feature = "redis-backend")]
pub use quota::RedisQuotaBackend;

/// Convenience imports for pipeline users.
pub mod prelude {
    pub use crate::cache::{InMemoryCache, KeyValueCache};
    pub use crate::config::{ChunkingConfig, EmbeddingConfig, SearchOptions};
    pub use crate::embedding::EmbeddingProvider;
    pub use crate::generator::EmbeddingGenerator;
    pub use crate::inmemory::InMemoryVectorStore;
    pub use crate::pipeline::RetrievalPipeline;
    pub use crate::quota::InMemoryQuotaBackend;
    pub use crate::suggest::SuggestionRequest;
    pub use crate::types::{DocumentType, PageText, SearchResult};
    pub use crate::vectorstore::VectorStore;

    #[cfg(feature = "gemini")]
    pub use crate::gemini::GeminiEmbeddingProvider;
    #[cfg(feature = "pgvector")]
    pub use crate::pgvector::PgVectorStore;
}
