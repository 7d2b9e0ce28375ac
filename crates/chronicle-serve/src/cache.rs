//! In-memory response caching with moka.
//!
//! Ranking queries scan wide time windows; the cache keeps repeated
//! leaderboard requests from re-running them. Each entry stores serialized
//! JSON plus the time it was cached.
//!
//! ## Cache Key Strategy
//!
//! Cache keys should include:
//! - Endpoint name (e.g., "rankings_messages")
//! - Tenant id
//! - All query parameters that affect the response
//!
//! ## TTL Guidelines
//!
//! | Data Type | TTL | Examples |
//! |-----------|-----|----------|
//! | Live counts | 30s | overview totals |
//! | Rankings | 5 min | message/voice leaderboards |
//! | Stable data | 30-60 min | all-time aggregates |

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ApiError;

/// Default cache capacity (number of entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// Default TTL for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cached response with metadata.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    /// Serialized JSON response.
    pub json: String,
    /// When this entry was cached.
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

/// Type alias for the response cache.
pub type ResponseCache = Cache<String, CachedEntry>;

/// Create a new response cache with default settings.
pub fn new_cache() -> ResponseCache {
    Cache::builder()
        .max_capacity(DEFAULT_CACHE_CAPACITY)
        .time_to_live(DEFAULT_TTL)
        .build()
}

/// Get a cached value or compute and cache it.
///
/// Checks the cache for `key`; on a miss, runs `compute`, caches the
/// serialized result, and returns it. A cache entry that no longer
/// deserializes is recomputed rather than surfaced as an error.
pub async fn get_or_compute<T, F, Fut>(
    cache: &ResponseCache,
    key: &str,
    compute: F,
) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    if let Some(entry) = cache.get(key).await {
        match serde_json::from_str(&entry.json) {
            Ok(value) => {
                metrics::counter!("api_cache_hits_total").increment(1);
                tracing::debug!(key = %key, cached_at = %entry.cached_at, "cache hit");
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to deserialize cached entry");
            }
        }
    }

    metrics::counter!("api_cache_misses_total").increment(1);
    tracing::debug!(key = %key, "cache miss, computing");
    let value = compute().await?;

    match serde_json::to_string(&value) {
        Ok(json) => {
            let entry = CachedEntry {
                json,
                cached_at: chrono::Utc::now(),
            };
            cache.insert(key.to_string(), entry).await;
        }
        Err(e) => {
            // Still return the value; only the cache write is lost.
            tracing::warn!(key = %key, error = %e, "failed to serialize for cache");
        }
    }

    Ok(value)
}

/// Common TTL values for different endpoint types.
pub mod ttl {
    use std::time::Duration;

    /// Live counts (overview totals) - 30 seconds
    pub const LIVE: Duration = Duration::from_secs(30);

    /// Ranking leaderboards - 5 minutes
    pub const RANKINGS: Duration = Duration::from_secs(300);

    /// Stable/slow-changing data - 1 hour
    pub const STABLE: Duration = Duration::from_secs(3600);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_hit() {
        let cache = new_cache();
        let key = "test_key";

        // First call - cache miss
        let result: i32 = get_or_compute(&cache, key, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);

        // Second call - cache hit (compute should not be called)
        let result: i32 = get_or_compute(&cache, key, || async {
            panic!("compute should not be called on cache hit")
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_cache_different_keys() {
        let cache = new_cache();

        let result1: i32 = get_or_compute(&cache, "key1", || async { Ok(1) })
            .await
            .unwrap();
        let result2: i32 = get_or_compute(&cache, "key2", || async { Ok(2) })
            .await
            .unwrap();

        assert_eq!(result1, 1);
        assert_eq!(result2, 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = new_cache();
        let result: Result<i32, _> = get_or_compute(&cache, "k", || async {
            Err(ApiError::BadRequest("nope".to_string()))
        })
        .await;
        assert!(result.is_err());

        // The failed compute left nothing behind; the next call recomputes.
        let result: i32 = get_or_compute(&cache, "k", || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(result, 5);
    }
}
