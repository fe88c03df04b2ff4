//! Per-organization daily embedding quota accounting.
//!
//! Two backends implement [`QuotaBackend`]:
//!
//! - [`RedisQuotaBackend`] *(feature `redis-backend`)* — increment-then-verify
//!   with a compensating decrement, safe under concurrent requests from any
//!   number of processes.
//! - [`InMemoryQuotaBackend`] — a check-then-act fallback for degraded
//!   operation. It can over-admit under concurrent load from multiple
//!   processes; that window is documented and accepted, not a bug to fix
//!   with locking it cannot actually provide.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::Result;

use std::collections::HashMap;

/// Seconds a daily usage record lives: a little over one UTC day, so the
/// record for a finished day lingers briefly and then expires on its own.
pub const QUOTA_RECORD_TTL_SECS: i64 = 25 * 60 * 60;

/// The outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Usage counted for the day after this decision was applied.
    pub used: i64,
}

/// Today's quota bucket key component, as a UTC date.
pub fn quota_day_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Atomic-or-best-effort daily quota accounting, keyed by organization and
/// UTC day. Date rollover implicitly resets usage (a new key/record).
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Account `amount` embeddings for the organization on `date`, against
    /// `limit`. Implementations decide whether the admission check is atomic;
    /// see the backend docs.
    async fn check_and_increment(
        &self,
        organization_id: &str,
        date: &str,
        amount: i64,
        limit: i64,
    ) -> Result<QuotaDecision>;

    /// Usage recorded so far for the organization on `date`. `None` when no
    /// record exists (treated as zero usage by callers).
    async fn current_usage(&self, organization_id: &str, date: &str) -> Result<Option<i64>>;
}

fn quota_key(organization_id: &str, date: &str) -> String {
    format!("quota:{organization_id}:{date}")
}

/// In-memory fallback quota backend.
///
/// The admission path is check-then-act: usage is read, compared against the
/// limit, and then written. Within one process the `RwLock` serializes the
/// two steps, but across processes there is no shared state at all, so
/// concurrent load can over-admit past the limit. This is the documented
/// degraded mode used when the shared key-value store is unavailable.
#[derive(Debug, Default)]
pub struct InMemoryQuotaBackend {
    usage: RwLock<HashMap<String, i64>>,
}

impl InMemoryQuotaBackend {
    /// Create an empty in-memory quota backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaBackend for InMemoryQuotaBackend {
    async fn check_and_increment(
        &self,
        organization_id: &str,
        date: &str,
        amount: i64,
        limit: i64,
    ) -> Result<QuotaDecision> {
        let key = quota_key(organization_id, date);
        let suffix = format!(":{date}");
        let mut usage = self.usage.write().await;
        // Date rollover: drop buckets from other days.
        usage.retain(|k, _| k.ends_with(&suffix));

        let current = usage.get(&key).copied().unwrap_or(0);
        if current + amount > limit {
            return Ok(QuotaDecision { allowed: false, used: current });
        }
        let updated = current + amount;
        usage.insert(key, updated);
        Ok(QuotaDecision { allowed: true, used: updated })
    }

    async fn current_usage(&self, organization_id: &str, date: &str) -> Result<Option<i64>> {
        let usage = self.usage.read().await;
        Ok(usage.get(&quota_key(organization_id, date)).copied())
    }
}

#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisQuotaBackend;

#[cfg(feature = "redis-backend")]
mod redis_backend {
    use redis::AsyncCommands;
    use tracing::debug;

    use super::*;
    use crate::error::RetrievalError;

    /// Redis-backed quota accounting.
    ///
    /// Admission is increment-then-verify: `INCRBY` first, and if the
    /// post-increment total exceeds the limit, a compensating `DECRBY`
    /// rolls the accounting back before the request is rejected. This
    /// avoids the check-then-act race under concurrent requests. The first
    /// increment of a day sets a ~25h expiry on the record.
    pub struct RedisQuotaBackend {
        conn: redis::aio::ConnectionManager,
    }

    impl RedisQuotaBackend {
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
    impl QuotaBackend for RedisQuotaBackend {
        async fn check_and_increment(
            &self,
            organization_id: &str,
            date: &str,
            amount: i64,
            limit: i64,
        ) -> Result<QuotaDecision> {
            let key = quota_key(organization_id, date);
            let mut conn = self.conn.clone();

            let total: i64 = conn.incr(&key, amount).await.map_err(Self::map_err)?;
            if total == amount {
                // First increment of the day: bound the record's lifetime.
                let _: bool =
                    conn.expire(&key, QUOTA_RECORD_TTL_SECS).await.map_err(Self::map_err)?;
            }

            if total > limit {
                let rolled_back: i64 =
                    conn.decr(&key, amount).await.map_err(Self::map_err)?;
                debug!(
                    organization_id,
                    used = rolled_back,
                    limit,
                    "quota exceeded, compensating decrement applied"
                );
                return Ok(QuotaDecision { allowed: false, used: rolled_back });
            }

            Ok(QuotaDecision { allowed: true, used: total })
        }

        async fn current_usage(&self, organization_id: &str, date: &str) -> Result<Option<i64>> {
            let mut conn = self.conn.clone();
            let used: Option<i64> = conn
                .get(quota_key(organization_id, date))
                .await
                .map_err(Self::map_err)?;
            Ok(used)
        }
    }
}
