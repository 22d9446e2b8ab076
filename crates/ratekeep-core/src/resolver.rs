//! Rate resolution: cache-aside around a guarded, retried remote fetch.
//!
//! ```text
//! resolve()
//!   ├─ CacheStore::read ──────────── live hit → return
//!   ├─ RetryPolicy::execute
//!   │    └─ per attempt: quota → bulkhead → CircuitBreaker::call(RateSource::fetch)
//!   ├─ success → CacheStore::write → return
//!   └─ failure → CacheStore::read_stale (if enabled) → RemoteUnavailable
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::alert::Publisher;
use crate::bulkhead::Bulkhead;
use crate::cache::{CacheMode, CacheStore, DEFAULT_CACHE_KEY};
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::error::RateError;
use crate::retry::{RetryAttempt, RetryConfig, RetryPolicy};
use crate::source::RateSource;
use crate::throttling::OutboundQuota;
use crate::value::RateValue;

/// Name used for the fetched value in exhaustion messages.
const FETCH_TARGET: &str = "percentage";

/// Supplies the current rate.
pub struct Resolver {
    source: Arc<dyn RateSource>,
    cache: CacheStore,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    quota: Option<OutboundQuota>,
    remote_bulkhead: Option<Bulkhead>,
    cache_key: String,
    ttl: Duration,
    stale_fallback: bool,
}

impl Resolver {
    pub fn builder(source: Arc<dyn RateSource>) -> ResolverBuilder {
        ResolverBuilder::new(source)
    }

    /// Resolve using the cache normally.
    pub async fn resolve(&self) -> Result<RateValue, RateError> {
        self.resolve_with(CacheMode::Use).await
    }

    /// Resolve with an explicit cache interaction.
    ///
    /// Only [`RateError::RemoteUnavailable`] is ever returned.
    pub async fn resolve_with(&self, mode: CacheMode) -> Result<RateValue, RateError> {
        if mode.reads() {
            match self.cache.read(&self.cache_key).await {
                Ok(Some(rate)) => {
                    debug!(cache_key = %self.cache_key, %rate, "cache hit");
                    return Ok(rate);
                }
                Ok(None) => debug!(cache_key = %self.cache_key, "cache miss"),
                Err(error) => {
                    let error = RateError::from(error);
                    warn!(cache_key = %self.cache_key, code = error.code(), %error, "cache read failed, fetching from remote source");
                }
            }
        }

        match self.retry.execute(|attempt| self.attempt(attempt)).await {
            Ok(rate) => {
                if mode.writes() {
                    if let Err(error) = self.cache.write(&self.cache_key, rate, self.ttl).await {
                        let error = RateError::from(error);
                        warn!(cache_key = %self.cache_key, code = error.code(), %error, "cache write failed, returning fetched rate");
                    }
                }
                Ok(rate)
            }
            Err(error) => self.fall_back(mode, error).await,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn breaker_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    async fn attempt(&self, attempt: RetryAttempt) -> Result<RateValue, RateError> {
        debug!(
            source = %self.source.id(),
            attempt = attempt.attempt_number,
            delay_ms = u64::try_from(attempt.delay_before_attempt.as_millis()).unwrap_or(u64::MAX),
            "remote attempt"
        );

        let admission_timeout = self.breaker.config().call_timeout;
        let _permit = tokio::time::timeout(admission_timeout, self.admit())
            .await
            .map_err(|_| {
                RateError::transient(format!(
                    "no remote capacity within {}ms",
                    admission_timeout.as_millis()
                ))
            })??;

        self.breaker.call(async { self.source.fetch().await }).await
    }

    /// Wait for quota and a remote bulkhead slot.
    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, RateError> {
        if let Some(quota) = &self.quota {
            quota.acquire().await;
        }
        match &self.remote_bulkhead {
            Some(bulkhead) => bulkhead
                .acquire()
                .await
                .map(Some)
                .map_err(|error| RateError::transient(error.to_string())),
            None => Ok(None),
        }
    }

    async fn fall_back(&self, mode: CacheMode, error: RateError) -> Result<RateValue, RateError> {
        let unavailable = match error {
            RateError::RemoteUnavailable { .. } => error,
            RateError::CircuitOpen { source_id } => RateError::RemoteUnavailable {
                message: format!("circuit open for source '{source_id}'"),
                source_id,
                attempts: 0,
            },
            other => RateError::RemoteUnavailable {
                source_id: self.source.id().to_string(),
                attempts: 0,
                message: other.to_string(),
            },
        };

        if !self.stale_fallback || mode == CacheMode::Bypass {
            return Err(unavailable);
        }

        match self.cache.read_stale(&self.cache_key).await {
            Ok(Some(rate)) => {
                info!(cache_key = %self.cache_key, %rate, error = %unavailable, "remote unavailable, serving stale cached rate");
                Ok(rate)
            }
            Ok(None) => Err(unavailable),
            Err(cache_error) => {
                let cache_error = RateError::from(cache_error);
                warn!(cache_key = %self.cache_key, code = cache_error.code(), error = %cache_error, "stale cache read failed");
                Err(unavailable)
            }
        }
    }
}

/// Builder for [`Resolver`].
pub struct ResolverBuilder {
    source: Arc<dyn RateSource>,
    cache: Option<CacheStore>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry_config: RetryConfig,
    publisher: Option<Arc<dyn Publisher>>,
    quota: Option<OutboundQuota>,
    remote_bulkhead: Option<Bulkhead>,
    cache_key: String,
    ttl: Duration,
    stale_fallback: bool,
}

impl ResolverBuilder {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self {
            source,
            cache: None,
            breaker: None,
            retry_config: RetryConfig::default(),
            publisher: None,
            quota: None,
            remote_bulkhead: None,
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            ttl: Duration::from_secs(30 * 60),
            stale_fallback: true,
        }
    }

    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share a breaker between resolvers guarding the same resource.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn quota(mut self, quota: OutboundQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn remote_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.remote_bulkhead = Some(bulkhead);
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = key.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn stale_fallback(mut self, enabled: bool) -> Self {
        self.stale_fallback = enabled;
        self
    }

    pub fn build(self) -> Resolver {
        let source_id = self.source.id().to_string();
        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(source_id.clone(), Default::default())));
        let mut retry =
            RetryPolicy::new(self.retry_config, source_id, FETCH_TARGET).with_breaker(Arc::clone(&breaker));
        if let Some(publisher) = self.publisher {
            retry = retry.with_publisher(publisher);
        }

        Resolver {
            breaker,
            cache: self.cache.unwrap_or_else(CacheStore::in_memory),
            source: self.source,
            retry,
            quota: self.quota,
            remote_bulkhead: self.remote_bulkhead,
            cache_key: self.cache_key,
            ttl: self.ttl,
            stale_fallback: self.stale_fallback,
        }
    }
}
