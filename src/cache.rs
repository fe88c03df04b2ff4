//! Key-value cache backends and the tenant-scoped search cache.
//!
//! [`SearchCache`] keys are a deterministic hash of
//! `(organization_id, mode, query, normalized options)`. Entries carry a
//! bounded TTL, but freshness is guaranteed by mutation-triggered
//! invalidation: any document upload or delete for an organization calls
//! [`SearchCache::invalidate_organization`], which drops every cached entry
//! under that organization's key prefix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::SearchOptions;
use crate::error::{Result, RetrievalError};

/// A key-value store with TTL expiry and prefix removal.
///
/// Backs both the search cache and the embedding cache; quota accounting
/// has its own trait because it needs atomic arithmetic.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Fetch a value, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with the given time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many were
    /// removed.
    async fn remove_prefix(&self, prefix: &str) -> Result<u64>;
}

/// In-memory [`KeyValueCache`] with lazy expiry.
///
/// Entries are evicted when read after their deadline. Suitable for
/// development, tests, and single-process degraded operation.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    /// Create an empty in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

/// Which query path produced a cached result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Pure vector similarity search.
    Semantic,
    /// Combined vector + keyword search.
    Hybrid,
}

impl SearchMode {
    fn as_str(self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

/// Caches query results per tenant to avoid recomputing identical queries.
pub struct SearchCache {
    backend: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

impl SearchCache {
    /// Default TTL for cached search results.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    /// Create a search cache over the given backend with the default TTL.
    pub fn new(backend: Arc<dyn KeyValueCache>) -> Self {
        Self { backend, ttl: Self::DEFAULT_TTL }
    }

    /// Override the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Deterministic cache key. The organization id stays in clear text as
    /// the key prefix so invalidation can sweep one tenant's entries.
    fn key(
        organization_id: &str,
        mode: SearchMode,
        query: &str,
        options: &SearchOptions,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mode.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(query.as_bytes());
        hasher.update(b"|");
        hasher.update(options.cache_repr().as_bytes());
        let digest = hasher.finalize();
        format!("search:{organization_id}:{digest:x}")
    }

    /// Look up a cached result set for this query.
    pub async fn get<T: DeserializeOwned>(
        &self,
        organization_id: &str,
        mode: SearchMode,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Option<T>> {
        let key = Self::key(organization_id, mode, query, options);
        match self.backend.get(&key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw).map_err(|e| RetrievalError::Cache {
                    backend: "search-cache".into(),
                    message: format!("corrupt cached entry: {e}"),
                })?;
                debug!(organization_id, mode = mode.as_str(), "search cache hit");
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Store a result set for this query.
    pub async fn set<T: Serialize>(
        &self,
        organization_id: &str,
        mode: SearchMode,
        query: &str,
        options: &SearchOptions,
        results: &T,
    ) -> Result<()> {
        let key = Self::key(organization_id, mode, query, options);
        let raw = serde_json::to_string(results).map_err(|e| RetrievalError::Cache {
            backend: "search-cache".into(),
            message: format!("failed to serialize results: {e}"),
        })?;
        self.backend.set(&key, &raw, self.ttl).await
    }

    /// Drop every cached entry for an organization. Called on any mutation
    /// of the organization's documents.
    pub async fn invalidate_organization(&self, organization_id: &str) -> Result<u64> {
        let removed = self.backend.remove_prefix(&format!("search:{organization_id}:")).await?;
        debug!(organization_id, removed, "invalidated search cache");
        Ok(removed)
    }
}

/// Cache key for a generated embedding: hash of the model and the
/// whitespace-normalized text. Content-addressed, so it is shared across
/// tenants by design (the vector derives only from public model + text).
pub fn embedding_cache_key(model: &str, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    format!("emb:{digest:x}")
}

#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisCache;

#[cfg(feature = "redis-backend")]
mod redis_backend {
    use redis::AsyncCommands;

    use super::*;

    /// Redis-backed [`KeyValueCache`] using `SET EX`, `GET`, and
    /// `SCAN MATCH` + `DEL` for prefix removal.
    pub struct RedisCache {
        conn: redis::aio::ConnectionManager,
    }

    impl RedisCache {
        /// Connect to Redis at the given URL.
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(Self::map_err)?;
            let conn = client.get_connection_manager().await.map_err(Self::map_err)?;
            Ok(Self { conn })
        }

        /// Build from an existing connection manager.
        pub fn from_connection(conn: redis::aio::ConnectionManager) -> Self {
            Self { conn }
        }

        fn map_err(e: redis::RedisError) -> RetrievalError {
            RetrievalError::Cache { backend: "redis".to_string(), message: e.to_string() }
        }
    }

    #[async_trait]
    impl KeyValueCache for RedisCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.clone();
            conn.get(key).await.map_err(Self::map_err)
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(Self::map_err)?;
            Ok(())
        }

        async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
            let mut scan_conn = self.conn.clone();
            let pattern = format!("{prefix}*");
            let keys: Vec<String> = {
                let mut iter = scan_conn
                    .scan_match::<_, String>(&pattern)
                    .await
                    .map_err(Self::map_err)?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                keys
            };
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn.clone();
            let removed: u64 = conn.del(&keys).await.map_err(Self::map_err)?;
            Ok(removed)
        }
    }
}
