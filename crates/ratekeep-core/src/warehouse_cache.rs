//! Durable cache backend over the warehouse `rate_cache` table.

use std::str::FromStr;
use std::time::Duration;

use ratekeep_warehouse::{CacheRow, Warehouse, WarehouseError};
use rust_decimal::Decimal;

use crate::cache::{CacheBackend, CacheError, CacheRecord, CachedValue};
use crate::{now_unix_ms, BoxFuture};

/// Stores each value as text next to its representation kind, so a read
/// hands the same representation back to the coercion rules.
#[derive(Clone)]
pub struct DuckDbCacheBackend {
    warehouse: Warehouse,
}

impl DuckDbCacheBackend {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Warehouse) -> Result<T, WarehouseError> + Send + 'static,
    {
        let warehouse = self.warehouse.clone();
        tokio::task::spawn_blocking(move || operation(&warehouse))
            .await
            .map_err(|error| CacheError::Backend(format!("cache task failed: {error}")))?
            .map_err(|error| CacheError::Backend(error.to_string()))
    }
}

impl CacheBackend for DuckDbCacheBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CacheRecord>, CacheError>> {
        Box::pin(async move {
            let owned_key = key.to_string();
            let row = self
                .blocking(move |warehouse| warehouse.get_cache_entry(&owned_key))
                .await?;

            Ok(row.map(|row| CacheRecord {
                fresh: now_unix_ms() < row.expires_at_ms,
                value: decode(&row.value_kind, row.value_text),
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
            let written_at_ms = now_unix_ms();
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let row = CacheRow {
                cache_key: key.to_string(),
                value_kind: value.kind().to_string(),
                value_text: encode(&value),
                expires_at_ms: written_at_ms.saturating_add(ttl_ms),
                written_at_ms,
            };
            self.blocking(move |warehouse| warehouse.put_cache_entry(&row))
                .await
        })
    }
}

fn encode(value: &CachedValue) -> String {
    match value {
        CachedValue::Text(text) => text.clone(),
        CachedValue::Float(float) => float.to_string(),
        CachedValue::Integer(integer) => integer.to_string(),
        CachedValue::Decimal(decimal) => decimal.to_string(),
    }
}

/// Unknown kinds or unparsable text fall back to `Text`, which the store's
/// coercion then treats as a miss if it is not a decimal.
fn decode(kind: &str, text: String) -> CachedValue {
    match kind {
        "float" => text.parse::<f64>().map_or(CachedValue::Text(text), CachedValue::Float),
        "integer" => text.parse::<i64>().map_or(CachedValue::Text(text), CachedValue::Integer),
        "decimal" => match Decimal::from_str(&text) {
            Ok(decimal) => CachedValue::Decimal(decimal),
            Err(_) => CachedValue::Text(text),
        },
        _ => CachedValue::Text(text),
    }
}
