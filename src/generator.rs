//! Embedding generator: produces 768-dimensional vectors under quota,
//! rate-limit, and retry constraints.
//!
//! The generator owns all process state the retry machinery needs — the
//! rotation cursor, the failed-credential set, and the rate-limit gate —
//! as explicit instance state. Quota accounting and the embedding cache are
//! injected backends, so the race-prone in-memory fallback is a swappable
//! strategy rather than hidden module state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{KeyValueCache, embedding_cache_key};
use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, RetrievalError};
use crate::quota::{QuotaBackend, quota_day_utc};
use crate::types::{validate_embedding, validate_uuid};

/// Maximum accepted input text length, in characters.
pub const MAX_TEXT_LEN: usize = 8000;

/// A generated embedding with its cache provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEmbedding {
    /// The 768-dimensional vector.
    pub embedding: Vec<f32>,
    /// True when the vector came from the embedding cache (no quota was
    /// consumed and no provider call was made).
    pub cached: bool,
}

/// The outcome of a batch generation run.
///
/// Per-batch failures are isolated: a failed provider batch leaves its
/// slots as `None` and counts toward `failure_count` without failing the
/// other batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEmbeddingOutcome {
    /// One slot per input text, in input order. `None` marks a failure.
    pub embeddings: Vec<Option<Vec<f32>>>,
    /// Number of texts that received an embedding.
    pub success_count: usize,
    /// Number of texts that did not.
    pub failure_count: usize,
    /// How many successes were served from the embedding cache.
    pub from_cache: usize,
}

/// Minimum-delay gate between outbound provider calls.
///
/// A single shared last-call timestamp behind a mutex; callers holding the
/// lock sleep out the remaining delay, which serializes outbound calls the
/// way the upstream provider expects.
struct RateGate {
    min_delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new(min_delay: Duration) -> Self {
        Self { min_delay, last_call: Mutex::new(None) }
    }

    async fn wait(&self) {
        if self.min_delay.is_zero() {
            return;
        }
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Credential rotation state: a cursor plus the set of provider indices
/// marked failed within this generator instance.
#[derive(Default)]
struct RotationState {
    cursor: usize,
    failed: HashSet<usize>,
}

/// Generates embeddings with per-organization daily quotas, caching, rate
/// limiting, and resilient retries across a rotating credential pool.
pub struct EmbeddingGenerator {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    config: EmbeddingConfig,
    quota: Arc<dyn QuotaBackend>,
    cache: Option<Arc<dyn KeyValueCache>>,
    rate_gate: RateGate,
    rotation: Mutex<RotationState>,
    model: String,
}

impl EmbeddingGenerator {
    /// Create a generator over a pool of providers (one per credential).
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] if the pool is empty or the
    /// config is inconsistent.
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        config: EmbeddingConfig,
        quota: Arc<dyn QuotaBackend>,
        cache: Option<Arc<dyn KeyValueCache>>,
    ) -> Result<Self> {
        config.validate()?;
        let Some(first) = providers.first() else {
            return Err(RetrievalError::Config(
                "at least one embedding provider is required".into(),
            ));
        };
        let model = first.model().to_string();
        let rate_gate = RateGate::new(Duration::from_millis(config.rate_limit_delay_ms));
        Ok(Self {
            providers,
            config,
            quota,
            cache,
            rate_gate,
            rotation: Mutex::new(RotationState::default()),
            model,
        })
    }

    /// Return a reference to the generator configuration.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Validate input text: length in `[1, 8000]` characters and no control
    /// characters apart from normal whitespace. Runs before any I/O.
    pub fn validate_text(text: &str) -> Result<()> {
        let len = text.chars().count();
        if len == 0 {
            return Err(RetrievalError::validation("text must not be empty"));
        }
        if len > MAX_TEXT_LEN {
            return Err(RetrievalError::validation(format!(
                "text length {len} exceeds maximum of {MAX_TEXT_LEN} characters"
            )));
        }
        if text.chars().any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t')) {
            return Err(RetrievalError::validation("text contains control characters"));
        }
        Ok(())
    }

    /// Generate an embedding for one text, enforcing quota and using the
    /// cache when possible.
    ///
    /// # Errors
    ///
    /// - [`RetrievalError::Validation`] for malformed input, before any I/O.
    /// - [`RetrievalError::QuotaExceeded`] when the daily cap is reached.
    /// - [`RetrievalError::Provider`] once retries are exhausted.
    pub async fn generate(&self, organization_id: &str, text: &str) -> Result<GeneratedEmbedding> {
        validate_uuid(organization_id, "organization_id")?;
        Self::validate_text(text)?;

        if let Some(embedding) = self.cache_lookup(text).await {
            return Ok(GeneratedEmbedding { embedding, cached: true });
        }

        self.consume_quota(organization_id, 1).await?;

        let mut vectors = self.call_provider(&[text]).await?;
        let embedding = vectors.pop().ok_or_else(|| RetrievalError::Provider {
            provider: self.model.clone(),
            message: "provider returned no embedding".into(),
        })?;

        self.cache_store(text, &embedding).await;
        Ok(GeneratedEmbedding { embedding, cached: false })
    }

    /// Generate embeddings for many texts.
    ///
    /// All inputs are validated up front (failing fast with the offending
    /// index). Cached texts are served without quota or provider calls; the
    /// rest are grouped into provider batches of `batch_size`, run with at
    /// most `max_concurrent_batches` in flight, and failures are isolated
    /// per batch.
    ///
    /// Quota exhaustion is not an isolated failure: once in-flight batches
    /// have drained, it is surfaced as [`RetrievalError::QuotaExceeded`] so
    /// callers can tell a spent daily cap from a provider outage.
    ///
    /// An empty input short-circuits with an empty success result.
    pub async fn generate_batch(
        &self,
        organization_id: &str,
        texts: &[String],
    ) -> Result<BatchEmbeddingOutcome> {
        validate_uuid(organization_id, "organization_id")?;
        if texts.is_empty() {
            return Ok(BatchEmbeddingOutcome::default());
        }
        for (index, text) in texts.iter().enumerate() {
            Self::validate_text(text).map_err(|e| {
                RetrievalError::validation(format!("text at index {index}: {e}"))
            })?;
        }

        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut from_cache = 0usize;
        let mut uncached: Vec<usize> = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            match self.cache_lookup(text).await {
                Some(embedding) => {
                    embeddings[index] = Some(embedding);
                    from_cache += 1;
                }
                None => uncached.push(index),
            }
        }

        let batches: Vec<Vec<usize>> =
            uncached.chunks(self.config.batch_size).map(<[usize]>::to_vec).collect();

        let outcomes: Vec<(Vec<usize>, Result<Vec<Vec<f32>>>)> =
            futures::stream::iter(batches.into_iter().map(|indices| async move {
                let result = self.run_batch(organization_id, texts, &indices).await;
                (indices, result)
            }))
            .buffer_unordered(self.config.max_concurrent_batches)
            .collect()
            .await;

        let mut quota_exhausted: Option<RetrievalError> = None;
        for (indices, outcome) in outcomes {
            match outcome {
                Ok(vectors) => {
                    for (index, vector) in indices.into_iter().zip(vectors) {
                        self.cache_store(&texts[index], &vector).await;
                        embeddings[index] = Some(vector);
                    }
                }
                Err(e @ RetrievalError::QuotaExceeded { .. }) => {
                    if quota_exhausted.is_none() {
                        quota_exhausted = Some(e);
                    }
                }
                Err(e) => {
                    warn!(
                        organization_id,
                        batch_len = indices.len(),
                        error = %e,
                        "embedding batch failed"
                    );
                }
            }
        }

        if let Some(e) = quota_exhausted {
            warn!(organization_id, "daily embedding quota exhausted during batch");
            return Err(e);
        }

        let success_count = embeddings.iter().filter(|e| e.is_some()).count();
        let outcome = BatchEmbeddingOutcome {
            failure_count: texts.len() - success_count,
            success_count,
            from_cache,
            embeddings,
        };
        info!(
            organization_id,
            successes = outcome.success_count,
            failures = outcome.failure_count,
            from_cache = outcome.from_cache,
            "batch embedding completed"
        );
        Ok(outcome)
    }

    /// Quota headroom for the organization today:
    /// `daily_quota_limit - current_usage`, the full limit when usage is
    /// unknown, and never negative.
    pub async fn remaining_quota(&self, organization_id: &str) -> Result<i64> {
        validate_uuid(organization_id, "organization_id")?;
        let used = self
            .quota
            .current_usage(organization_id, &quota_day_utc())
            .await?
            .unwrap_or(0);
        Ok((self.config.daily_quota_limit - used).max(0))
    }

    /// One quota-guarded provider batch.
    async fn run_batch(
        &self,
        organization_id: &str,
        texts: &[String],
        indices: &[usize],
    ) -> Result<Vec<Vec<f32>>> {
        self.consume_quota(organization_id, indices.len() as i64).await?;
        let batch: Vec<&str> = indices.iter().map(|&i| texts[i].as_str()).collect();
        self.call_provider(&batch).await
    }

    /// Account `amount` embeddings against the organization's daily quota.
    async fn consume_quota(&self, organization_id: &str, amount: i64) -> Result<()> {
        let decision = self
            .quota
            .check_and_increment(
                organization_id,
                &quota_day_utc(),
                amount,
                self.config.daily_quota_limit,
            )
            .await?;
        if !decision.allowed {
            return Err(RetrievalError::QuotaExceeded {
                organization_id: organization_id.to_string(),
                limit: self.config.daily_quota_limit,
                used: decision.used,
            });
        }
        Ok(())
    }

    /// Call the provider pool with retry, credential rotation, and
    /// exponential backoff. Output vectors are validated to be 768 finite
    /// components; a malformed response counts as a transient failure and
    /// is retried like a provider error.
    async fn call_provider(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut last_error: Option<RetrievalError> = None;

        for attempt in 1..=self.config.max_retries {
            let index = self.next_provider().await;
            self.rate_gate.wait().await;

            let result = if texts.len() == 1 {
                self.providers[index].embed(texts[0]).await.map(|v| vec![v])
            } else {
                self.providers[index].embed_batch(texts).await
            };

            let validated = result.and_then(|vectors| {
                if vectors.len() != texts.len() {
                    return Err(RetrievalError::validation(format!(
                        "provider returned {} embeddings for {} inputs",
                        vectors.len(),
                        texts.len()
                    )));
                }
                for vector in &vectors {
                    validate_embedding(vector)?;
                }
                Ok(vectors)
            });

            match validated {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    warn!(attempt, provider_index = index, error = %e, "embedding attempt failed");
                    self.mark_failed(index).await;
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        let delay = self.config.retry_base_delay_ms << (attempt - 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into());
        Err(RetrievalError::Provider {
            provider: self.model.clone(),
            message: format!(
                "embedding failed after {} attempts; last error: {cause}",
                self.config.max_retries
            ),
        })
    }

    /// Pick the next credential, skipping ones marked failed. When every
    /// credential has failed, the failed set is cleared and rotation
    /// resumes from the first.
    async fn next_provider(&self) -> usize {
        let mut rotation = self.rotation.lock().await;
        let pool_size = self.providers.len();
        if rotation.failed.len() >= pool_size {
            debug!("all credentials marked failed; clearing failed set");
            rotation.failed.clear();
            rotation.cursor = 0;
        }
        loop {
            let index = rotation.cursor % pool_size;
            rotation.cursor += 1;
            if !rotation.failed.contains(&index) {
                return index;
            }
        }
    }

    async fn mark_failed(&self, index: usize) {
        self.rotation.lock().await.failed.insert(index);
    }

    /// Cache lookup, degrading to a miss on backend errors or corrupt
    /// entries.
    async fn cache_lookup(&self, text: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        let key = embedding_cache_key(&self.model, text);
        match cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<f32>>(&raw) {
                Ok(embedding) if validate_embedding(&embedding).is_ok() => Some(embedding),
                _ => {
                    warn!("discarding corrupt cached embedding");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "embedding cache read failed; treating as miss");
                None
            }
        }
    }

    async fn cache_store(&self, text: &str, embedding: &[f32]) {
        let Some(cache) = self.cache.as_ref() else { return };
        let key = embedding_cache_key(&self.model, text);
        match serde_json::to_string(embedding) {
            Ok(raw) => {
                if let Err(e) = cache
                    .set(&key, &raw, Duration::from_secs(self.config.cache_ttl_secs))
                    .await
                {
                    warn!(error = %e, "embedding cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize embedding for cache"),
        }
    }
}

/// Cosine similarity between two equal-length vectors.
///
/// # Errors
///
/// Returns [`RetrievalError::Validation`] when the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(RetrievalError::validation(format!(
            "vector length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

/// Score every candidate against the query and return the top `k` as
/// `(input_index, similarity)` pairs, descending. The sort is stable, so
/// ties keep input order.
pub fn top_k_similar(
    query: &[f32],
    candidates: &[Vec<f32>],
    k: usize,
) -> Result<Vec<(usize, f32)>> {
    let mut scored = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        scored.push((index, cosine_similarity(query, candidate)?));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}
