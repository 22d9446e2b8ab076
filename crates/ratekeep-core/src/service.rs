//! Wiring every component from a [`RateKeepConfig`].

use std::sync::Arc;

use ratekeep_warehouse::{Warehouse, WarehouseError};
use thiserror::Error;
use tracing::info;

use crate::alert::{
    AlertChannel, AlertConsumer, AlertHandler, ChannelPublisher, MemoryAlertChannel, OutboxAlertChannel,
};
use crate::bulkhead::Bulkheads;
use crate::cache::{CacheBackend, CacheStore, MemoryCacheBackend};
use crate::calculation::Calculator;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{AlertChannelKind, CacheBackendKind, RateKeepConfig};
use crate::error::ConfigError;
use crate::http_client::HttpAuth;
use crate::resolver::Resolver;
use crate::source::{HttpRateSource, RateSource};
use crate::throttling::OutboundQuota;
use crate::warehouse_cache::DuckDbCacheBackend;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open warehouse: {0}")]
    Warehouse(#[from] WarehouseError),
}

/// A fully assembled resolution pipeline.
pub struct RateService {
    pub resolver: Arc<Resolver>,
    pub calculator: Calculator,
    pub publisher: Arc<ChannelPublisher>,
    pub alert_channel: Arc<dyn AlertChannel>,
    pub warehouse: Option<Warehouse>,
    config: RateKeepConfig,
}

impl RateService {
    /// Build against the configured HTTP source.
    pub fn from_config(config: RateKeepConfig) -> Result<Self, ServiceError> {
        let mut source = HttpRateSource::new(config.remote.source_id.clone(), config.remote.url.clone())
            .with_timeout(config.remote.timeout);
        if let Some(token) = &config.remote.bearer_token {
            source = source.with_auth(HttpAuth::BearerToken(token.clone()));
        }
        Self::with_source(config, Arc::new(source))
    }

    /// Build with an explicit source, e.g. a test double.
    pub fn with_source(config: RateKeepConfig, source: Arc<dyn RateSource>) -> Result<Self, ServiceError> {
        config.validate()?;

        let warehouse = if config.needs_warehouse() {
            let warehouse = Warehouse::open(config.warehouse_config())?;
            info!(db_path = ?warehouse.db_path(), "warehouse opened");
            Some(warehouse)
        } else {
            None
        };
        Self::assemble(config, source, warehouse)
    }

    /// Build on an already opened warehouse.
    pub fn with_warehouse(
        config: RateKeepConfig,
        source: Arc<dyn RateSource>,
        warehouse: Warehouse,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        Self::assemble(config, source, Some(warehouse))
    }

    fn assemble(
        config: RateKeepConfig,
        source: Arc<dyn RateSource>,
        warehouse: Option<Warehouse>,
    ) -> Result<Self, ServiceError> {
        let bulkheads = Bulkheads::new(config.pools.remote, config.pools.cache, config.pools.alert);

        let backend: Arc<dyn CacheBackend> = match (config.cache.backend, &warehouse) {
            (CacheBackendKind::Duckdb, Some(warehouse)) => Arc::new(DuckDbCacheBackend::new(warehouse.clone())),
            (CacheBackendKind::Duckdb, None) => return Err(missing_warehouse("RATEKEEP_CACHE_BACKEND", "duckdb").into()),
            (CacheBackendKind::Memory, _) => Arc::new(MemoryCacheBackend::new()),
        };
        let cache = CacheStore::new(backend, config.cache.op_timeout).with_bulkhead(bulkheads.cache.clone());

        let alert_channel: Arc<dyn AlertChannel> = match (config.alert.channel, &warehouse) {
            (AlertChannelKind::Outbox, Some(warehouse)) => Arc::new(OutboxAlertChannel::new(warehouse.clone())),
            (AlertChannelKind::Outbox, None) => return Err(missing_warehouse("RATEKEEP_ALERT_CHANNEL", "outbox").into()),
            (AlertChannelKind::Memory, _) => Arc::new(MemoryAlertChannel::new()),
        };
        let publisher = Arc::new(
            ChannelPublisher::new(Arc::clone(&alert_channel), config.alert.topic.clone())
                .with_bulkhead(bulkheads.alert.clone()),
        );

        let breaker = Arc::new(CircuitBreaker::new(source.id().to_string(), config.breaker_config()));

        let mut builder = Resolver::builder(source)
            .cache(cache)
            .breaker(breaker)
            .retry(config.retry_config())
            .publisher(publisher.clone())
            .remote_bulkhead(bulkheads.remote.clone())
            .cache_key(config.cache.key.clone())
            .ttl(config.cache.ttl)
            .stale_fallback(config.cache.stale_fallback);
        if let Some(limit) = config.remote.quota_per_minute {
            builder = builder.quota(OutboundQuota::per_minute(limit));
        }

        let resolver = Arc::new(builder.build());
        Ok(Self {
            calculator: Calculator::new(Arc::clone(&resolver)),
            resolver,
            publisher,
            alert_channel,
            warehouse,
            config,
        })
    }

    pub fn config(&self) -> &RateKeepConfig {
        &self.config
    }

    /// A consumer for this service's alert topic.
    pub fn consumer(&self, handler: Arc<dyn AlertHandler>) -> AlertConsumer {
        AlertConsumer::new(Arc::clone(&self.alert_channel), handler, self.config.consumer_config())
    }
}

fn missing_warehouse(key: &str, value: &str) -> ConfigError {
    ConfigError::invalid(key, value, "requires a warehouse")
}
