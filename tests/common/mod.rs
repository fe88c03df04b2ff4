//! Shared fixtures for integration tests: deterministic embedding
//! providers and chunk builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ragkit::config::EmbeddingConfig;
use ragkit::embedding::EmbeddingProvider;
use ragkit::error::{Result, RetrievalError};
use ragkit::generator::EmbeddingGenerator;
use ragkit::quota::InMemoryQuotaBackend;
use ragkit::types::{EMBEDDING_DIM, NewChunk, text_hash};

pub const ORG_A: &str = "11111111-1111-4111-8111-111111111111";
pub const ORG_B: &str = "22222222-2222-4222-8222-222222222222";
pub const SOURCE_A: &str = "33333333-3333-4333-8333-333333333333";
pub const SOURCE_B: &str = "44444444-4444-4444-8444-444444444444";

/// A unit vector along one axis.
pub fn unit_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[axis % EMBEDDING_DIM] = 1.0;
    v
}

/// Deterministic unit vector derived from the text. Identical texts map
/// to identical vectors; distinct texts usually land on distinct axes.
pub fn text_vector(text: &str) -> Vec<f32> {
    let axis = text.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    unit_vector(axis)
}

/// Provider returning [`text_vector`] embeddings and counting its calls.
#[derive(Default)]
pub struct DeterministicProvider {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for DeterministicProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(text_vector(text))
    }

    fn model(&self) -> &str {
        "test-embedding"
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Provider that fails its first `failures` calls, then behaves like
/// [`DeterministicProvider`].
pub struct FlakyProvider {
    failures_remaining: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyProvider {
    pub fn new(failures: usize) -> Self {
        Self { failures_remaining: AtomicUsize::new(failures), calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RetrievalError::Provider {
                provider: "flaky".into(),
                message: "simulated upstream failure".into(),
            });
        }
        Ok(text_vector(text))
    }

    fn model(&self) -> &str {
        "test-embedding"
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Provider that always fails.
#[derive(Default)]
pub struct BrokenProvider {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for BrokenProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RetrievalError::Provider {
            provider: "broken".into(),
            message: "permanently down".into(),
        })
    }

    fn model(&self) -> &str {
        "test-embedding"
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Config tuned for tests: no rate-limit or backoff sleeps.
pub fn fast_config() -> EmbeddingConfig {
    EmbeddingConfig {
        rate_limit_delay_ms: 0,
        retry_base_delay_ms: 0,
        ..EmbeddingConfig::default()
    }
}

/// A generator over the given providers with a fresh in-memory quota.
pub fn generator_with(
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    config: EmbeddingConfig,
) -> EmbeddingGenerator {
    EmbeddingGenerator::new(providers, config, Arc::new(InMemoryQuotaBackend::new()), None)
        .expect("valid test generator")
}

/// A chunk owned by `organization_id` whose embedding points along `axis`.
pub fn chunk_on_axis(
    organization_id: &str,
    source_id: &str,
    text: &str,
    index: u32,
    axis: usize,
) -> NewChunk {
    NewChunk {
        source_id: source_id.to_string(),
        organization_id: organization_id.to_string(),
        text: text.to_string(),
        token_count: (text.len() as u32).div_ceil(4),
        chunk_index: index,
        embedding: unit_vector(axis),
        text_hash: text_hash(text),
        page_number: Some(1),
        section_header: None,
        metadata: HashMap::new(),
    }
}
