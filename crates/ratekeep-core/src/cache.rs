//! Cache-aside storage for resolved rates.
//!
//! [`CacheStore`] wraps a [`CacheBackend`] with a per-operation timeout and
//! deterministic coercion of whatever representation the backend holds into a
//! [`RateValue`]. Backends report freshness themselves, so the store never
//! compares clocks it does not own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bulkhead::Bulkhead;
use crate::error::{RateError, ValidationError};
use crate::value::RateValue;
use crate::BoxFuture;

/// Well-known cache key for the deployment's rate.
pub const DEFAULT_CACHE_KEY: &str = "percentage_key";

/// Defines how a resolution interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read from the cache if a live entry is present; otherwise fetch from
    /// the remote source and write the result. (Default)
    #[default]
    Use,
    /// Skip the read, always fetch, and write the fresh value.
    Refresh,
    /// Always fetch; neither read from nor write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Use | Self::Refresh)
    }
}

/// A value as the backing store holds it.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Text(String),
    Float(f64),
    Integer(i64),
    Decimal(Decimal),
}

impl CachedValue {
    /// Coerce into a rate. Native decimals pass through; floats go through
    /// their shortest decimal text; strings are parsed exactly.
    pub fn coerce(&self) -> Result<RateValue, ValidationError> {
        match self {
            Self::Decimal(value) => RateValue::new(*value),
            Self::Integer(value) => RateValue::new(Decimal::from(*value)),
            Self::Float(value) => RateValue::from_f64_text(*value),
            Self::Text(text) => RateValue::parse(text),
        }
    }

    /// Stable name of the representation, used by durable backends.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Float(_) => "float",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
        }
    }
}

impl From<RateValue> for CachedValue {
    fn from(value: RateValue) -> Self {
        Self::Decimal(value.as_decimal())
    }
}

/// A stored entry as returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub value: CachedValue,
    /// `false` once the entry's TTL has elapsed.
    pub fresh: bool,
}

/// Cache backend failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<CacheError> for RateError {
    fn from(error: CacheError) -> Self {
        RateError::cache_unavailable(error.to_string())
    }
}

/// Key/value storage with TTL.
pub trait CacheBackend: Send + Sync {
    /// Fetch the entry for `key`, expired or not.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CacheRecord>, CacheError>>;

    /// Replace any entry for `key` in full.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: CachedValue,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: CachedValue,
    expires_at: Instant,
}

/// In-process backend. Expiry follows the tokio clock, so paused-time tests
/// can advance past a TTL.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheBackend {
    map: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.map.write().await.clear();
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CacheRecord>, CacheError>> {
        Box::pin(async move {
            let map = self.map.read().await;
            Ok(map.get(key).map(|entry| CacheRecord {
                value: entry.value.clone(),
                fresh: Instant::now() < entry.expires_at,
            }))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: CachedValue,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let expires_at = Instant::now() + ttl;
            self.map
                .write()
                .await
                .insert(key.to_string(), MemoryEntry { value, expires_at });
            Ok(())
        })
    }
}

/// Thread-safe cache front used by the resolver.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    op_timeout: Duration,
    bulkhead: Option<Bulkhead>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, op_timeout: Duration) -> Self {
        Self {
            backend,
            op_timeout,
            bulkhead: None,
        }
    }

    /// Create an in-memory cache with the default 5 second operation timeout.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), Duration::from_secs(5))
    }

    /// Limit concurrent backend operations.
    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub const fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Return the value for `key` if a live entry exists.
    ///
    /// Entries whose stored representation cannot be coerced are treated as
    /// a miss.
    pub async fn read(&self, key: &str) -> Result<Option<RateValue>, CacheError> {
        let record = self.fetch(key).await?;
        Ok(record
            .filter(|record| record.fresh)
            .and_then(|record| coerce_or_miss(key, &record.value)))
    }

    /// Return the value for `key` even if its TTL has elapsed.
    pub async fn read_stale(&self, key: &str) -> Result<Option<RateValue>, CacheError> {
        let record = self.fetch(key).await?;
        Ok(record.and_then(|record| coerce_or_miss(key, &record.value)))
    }

    /// Store `value` under `key`, replacing any prior entry.
    pub async fn write(&self, key: &str, value: RateValue, ttl: Duration) -> Result<(), CacheError> {
        self.bounded(async {
            let _permit = self.permit().await?;
            self.backend.put(key, value.into(), ttl).await
        })
        .await?;
        debug!(cache_key = key, %value, ttl_secs = ttl.as_secs(), "cache entry written");
        Ok(())
    }

    async fn permit(&self) -> Result<Option<OwnedSemaphorePermit>, CacheError> {
        match &self.bulkhead {
            Some(bulkhead) => bulkhead
                .acquire()
                .await
                .map(Some)
                .map_err(|error| CacheError::Backend(error.to_string())),
            None => Ok(None),
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        self.bounded(async {
            let _permit = self.permit().await?;
            self.backend.get(key).await
        })
        .await
    }

    /// Run `operation`, bulkhead wait included, under the operation timeout.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.op_timeout, operation)
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))?
    }
}

fn coerce_or_miss(key: &str, value: &CachedValue) -> Option<RateValue> {
    match value.coerce() {
        Ok(rate) => Some(rate),
        Err(error) => {
            warn!(cache_key = key, kind = value.kind(), %error, "cached value could not be coerced, treating as miss");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn rate(value: Decimal) -> RateValue {
        RateValue::new(value).expect("non-negative")
    }

    #[tokio::test]
    async fn test_cache_store_basic_operations() {
        let cache = CacheStore::in_memory();

        assert_eq!(cache.read("key1").await, Ok(None));

        cache.write("key1", rate(dec!(0.10)), TTL).await.expect("write");
        assert_eq!(cache.read("key1").await, Ok(Some(rate(dec!(0.10)))));

        cache.write("key1", rate(dec!(0.20)), TTL).await.expect("overwrite");
        assert_eq!(cache.read("key1").await, Ok(Some(rate(dec!(0.20)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration_keeps_stale_value() {
        let cache = CacheStore::in_memory();
        cache
            .write("key1", rate(dec!(0.10)), Duration::from_millis(100))
            .await
            .expect("write");

        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(cache.read("key1").await, Ok(None));
        assert_eq!(cache.read_stale("key1").await, Ok(Some(rate(dec!(0.10)))));
    }

    #[tokio::test]
    async fn test_coercion_from_every_representation() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = CacheStore::new(backend.clone(), Duration::from_secs(5));

        for value in [
            CachedValue::Text(String::from(" 0.15 ")),
            CachedValue::Float(0.15),
            CachedValue::Decimal(dec!(0.15)),
        ] {
            backend.put("k", value, TTL).await.expect("put");
            assert_eq!(cache.read("k").await, Ok(Some(rate(dec!(0.15)))));
        }

        backend.put("k", CachedValue::Integer(1), TTL).await.expect("put");
        assert_eq!(cache.read("k").await, Ok(Some(rate(dec!(1)))));
    }

    #[tokio::test]
    async fn test_uncoercible_values_are_misses() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = CacheStore::new(backend.clone(), Duration::from_secs(5));

        backend
            .put("k", CachedValue::Text(String::from("abc")), TTL)
            .await
            .expect("put");
        assert_eq!(cache.read("k").await, Ok(None));

        backend
            .put("k", CachedValue::Text(String::from("-0.5")), TTL)
            .await
            .expect("put");
        assert_eq!(cache.read_stale("k").await, Ok(None));

        backend.put("k", CachedValue::Float(f64::INFINITY), TTL).await.expect("put");
        assert_eq!(cache.read("k").await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        struct Stalled;

        impl CacheBackend for Stalled {
            fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<CacheRecord>, CacheError>> {
                Box::pin(std::future::pending())
            }

            fn put<'a>(
                &'a self,
                _key: &'a str,
                _value: CachedValue,
                _ttl: Duration,
            ) -> BoxFuture<'a, Result<(), CacheError>> {
                Box::pin(std::future::pending())
            }
        }

        let cache = CacheStore::new(Arc::new(Stalled), Duration::from_secs(5));
        assert_eq!(cache.read("k").await, Err(CacheError::Timeout(Duration::from_secs(5))));
        assert_eq!(
            cache.write("k", rate(dec!(0.1)), TTL).await,
            Err(CacheError::Timeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_bulkhead_times_out() {
        let bulkhead = Bulkhead::new("cache", 1);
        let cache = CacheStore::new(Arc::new(MemoryCacheBackend::new()), Duration::from_secs(5))
            .with_bulkhead(bulkhead.clone());
        let _held = bulkhead.acquire().await.expect("permit");

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(60), cache.read("k"))
            .await
            .expect("read is bounded by the operation timeout");

        assert_eq!(outcome, Err(CacheError::Timeout(Duration::from_secs(5))));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(
            cache.write("k", rate(dec!(0.1)), TTL).await,
            Err(CacheError::Timeout(Duration::from_secs(5)))
        );
    }

    #[test]
    fn test_cache_mode_default() {
        let mode = CacheMode::default();
        assert_eq!(mode, CacheMode::Use);
        assert!(CacheMode::Refresh.writes() && !CacheMode::Refresh.reads());
        assert!(!CacheMode::Bypass.writes() && !CacheMode::Bypass.reads());
    }

    #[test]
    fn backend_failures_surface_as_cache_unavailable() {
        let error = RateError::from(CacheError::Timeout(Duration::from_secs(5)));
        assert_eq!(error.code(), "cache.unavailable");
        assert!(error.to_string().contains("timed out after 5s"), "{error}");
    }
}
