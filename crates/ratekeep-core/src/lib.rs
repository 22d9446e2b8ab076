//! # Ratekeep Core
//!
//! Resilient resolution of a numeric rate whose source of truth is an
//! unreliable remote service.
//!
//! ## Overview
//!
//! - **Cache store** with TTL and exact coercion of stored representations
//! - **Retry policy** with bounded exponential backoff and a failure classifier
//! - **Circuit breaker** guarding every remote attempt
//! - **Alerting** on retry exhaustion, decoupled from the caller
//! - **Resolver** composing all of the above into `resolve()`
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`alert`] | Failure events, publisher, channels and consumer |
//! | [`bulkhead`] | Per-resource concurrency limits |
//! | [`cache`] | Cache store, backends and coercion |
//! | [`calculation`] | Applying the rate to a sum |
//! | [`circuit_breaker`] | Closed / open / half-open gating |
//! | [`config`] | `RATEKEEP_*` configuration |
//! | [`error`] | Error taxonomy and retry classes |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`resolver`] | The orchestrator |
//! | [`retry`] | Backoff and retry policy |
//! | [`service`] | Wiring from configuration |
//! | [`source`] | Remote rate source |
//! | [`throttling`] | Outbound quota |
//! | [`value`] | The rate value type |
//! | [`warehouse_cache`] | DuckDB cache backend |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ratekeep_core::{HttpRateSource, Resolver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = HttpRateSource::new("rate-api", "http://localhost:8080/api/percentage");
//!     let resolver = Resolver::builder(Arc::new(source)).build();
//!
//!     let rate = resolver.resolve().await?;
//!     println!("current rate: {rate}");
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Callers only ever see [`RateError::RemoteUnavailable`]. Internally every
//! failure carries a [`RetryClass`]:
//!
//! ```rust
//! use ratekeep_core::{RateError, RetryClass};
//!
//! fn describe(error: &RateError) -> &'static str {
//!     match error.retry_class() {
//!         RetryClass::Retry => "try again after backoff",
//!         RetryClass::Never => "give up now",
//!         RetryClass::CircuitOpen => "fail fast",
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod alert;
pub mod bulkhead;
pub mod cache;
pub mod calculation;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http_client;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod source;
pub mod throttling;
pub mod value;
pub mod warehouse_cache;

/// Boxed future returned by the crate's object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Alerting
pub use alert::{
    AckOutcome, AlertChannel, AlertConsumer, AlertHandler, AlertMessage, ChannelPublisher, ConsumerConfig,
    ConsumerStats, Delivery, FailureEvent, LogAlertHandler, MemoryAlertChannel, OutboxAlertChannel, Publisher,
    DEFAULT_TOPIC,
};

// Bulkheads
pub use bulkhead::{Bulkhead, Bulkheads};

// Caching
pub use cache::{
    CacheBackend, CacheError, CacheMode, CacheRecord, CacheStore, CachedValue, MemoryCacheBackend,
    DEFAULT_CACHE_KEY,
};
pub use warehouse_cache::DuckDbCacheBackend;

// Calculation
pub use calculation::{apply_rate, Calculation, Calculator};

// Circuit breaker
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

// Configuration
pub use config::{AlertChannelKind, CacheBackendKind, LogFormat, RateKeepConfig};

// Error types
pub use error::{AlertError, ConfigError, RateError, RetryClass, ValidationError};

// HTTP client types
pub use http_client::{HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};

// Orchestration
pub use resolver::{Resolver, ResolverBuilder};
pub use service::{RateService, ServiceError};

// Retry logic
pub use retry::{Backoff, RetryAttempt, RetryConfig, RetryPolicy};

// Remote source
pub use source::{classify_status, parse_rate_body, HttpRateSource, RateSource};

// Throttling
pub use throttling::OutboundQuota;

// Values
pub use value::RateValue;

// Warehouse (re-exported from ratekeep-warehouse)
pub use ratekeep_warehouse::{Warehouse, WarehouseConfig, WarehouseError};

/// Wall-clock milliseconds since the Unix epoch, for durable timestamps.
pub(crate) fn now_unix_ms() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}
