//! # Ratekeep Warehouse
//!
//! DuckDB-backed durable storage for ratekeep.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `rate_cache` | Cached rate entries with their stored representation and expiry |
//! | `alert_outbox` | Ordered failure-alert messages awaiting consumer acknowledgement |
//! | `schema_version` | Applied migration versions |
//!
//! Every method here is blocking. Async callers run them on
//! `tokio::task::spawn_blocking`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratekeep_warehouse::{CacheRow, Warehouse};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!     warehouse.put_cache_entry(&CacheRow {
//!         cache_key: "percentage_key".to_string(),
//!         value_kind: "decimal".to_string(),
//!         value_text: "0.10".to_string(),
//!         expires_at_ms: 1_800_000,
//!         written_at_ms: 0,
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection, ToSql};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored row did not hold the expected shape.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for ratekeep data.
    pub ratekeep_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let ratekeep_home = resolve_ratekeep_home();
        let db_path = ratekeep_home.join("ratekeep.duckdb");
        Self {
            ratekeep_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl WarehouseConfig {
    /// Configuration rooted at an explicit database file.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let ratekeep_home = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            ratekeep_home,
            db_path,
            ..Self::default()
        }
    }
}

/// A cached rate row. The value is kept as text next to its representation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRow {
    pub cache_key: String,
    /// One of `decimal`, `float`, `integer`, `text`.
    pub value_kind: String,
    pub value_text: String,
    pub expires_at_ms: i64,
    pub written_at_ms: i64,
}

/// One alert outbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxRecord {
    /// Monotonic sequence; also the acknowledgement handle.
    pub seq: i64,
    pub topic: String,
    /// JSON-encoded message body.
    pub payload: String,
    pub created_at_ms: i64,
    /// Number of times this message has been handed to a consumer.
    pub delivery_count: i32,
    pub acked_at_ms: Option<i64>,
    pub dead_lettered: bool,
}

/// The main warehouse interface.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Open a private in-memory warehouse.
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let manager = DuckDbConnectionManager::open_in_memory(2)?;
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Apply pending schema migrations.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Path to the database file, `None` for in-memory warehouses.
    pub fn db_path(&self) -> Option<&Path> {
        self.manager.db_path()
    }

    /// Insert or fully replace the cache row for `row.cache_key`.
    pub fn put_cache_entry(&self, row: &CacheRow) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 5] = [
            &row.cache_key,
            &row.value_kind,
            &row.value_text,
            &row.expires_at_ms,
            &row.written_at_ms,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO rate_cache \
             (cache_key, value_kind, value_text, expires_at_ms, written_at_ms) \
             VALUES (?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        debug!(cache_key = %row.cache_key, "cache row written");
        Ok(())
    }

    /// Fetch the cache row for `key`, regardless of expiry.
    pub fn get_cache_entry(&self, key: &str) -> Result<Option<CacheRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT cache_key, value_kind, value_text, expires_at_ms, written_at_ms \
             FROM rate_cache WHERE cache_key = ?",
        )?;
        let mut rows = statement.query(params![key])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        Ok(Some(CacheRow {
            cache_key: row.get(0)?,
            value_kind: row.get(1)?,
            value_text: row.get(2)?,
            expires_at_ms: row.get(3)?,
            written_at_ms: row.get(4)?,
        }))
    }

    /// Remove the cache row for `key`. Returns whether a row existed.
    pub fn delete_cache_entry(&self, key: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let removed = connection.execute("DELETE FROM rate_cache WHERE cache_key = ?", params![key])?;
        Ok(removed > 0)
    }

    /// Append a message to the outbox and return its sequence number.
    pub fn enqueue_alert(
        &self,
        topic: &str,
        payload: &str,
        created_at_ms: i64,
    ) -> Result<i64, WarehouseError> {
        let connection = self.manager.acquire()?;
        let seq: i64 = connection.query_row(
            "INSERT INTO alert_outbox (topic, payload, created_at_ms) VALUES (?, ?, ?) RETURNING seq",
            params![topic, payload, created_at_ms],
            |row| row.get(0),
        )?;
        debug!(topic, seq, "alert enqueued");
        Ok(seq)
    }

    /// Lease up to `limit` unacknowledged messages of `topic` in sequence order.
    ///
    /// Each returned message has its delivery count incremented. Messages stay
    /// pending until acknowledged, so a consumer that crashes mid-batch sees
    /// them again.
    pub fn lease_pending_alerts(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<Vec<OutboxRecord>, WarehouseError> {
            let mut records = select_outbox(
                &connection,
                "WHERE topic = ? AND acked_at_ms IS NULL ORDER BY seq LIMIT ?",
                params![topic, limit],
            )?;
            for record in &mut records {
                connection.execute(
                    "UPDATE alert_outbox SET delivery_count = delivery_count + 1 WHERE seq = ?",
                    params![record.seq],
                )?;
                record.delivery_count += 1;
            }
            Ok(records)
        })();

        finalize_transaction(&connection, result)
    }

    /// Acknowledge a message. Dead-lettered messages are acknowledged too so
    /// they stop blocking the topic.
    pub fn ack_alert(
        &self,
        seq: i64,
        acked_at_ms: i64,
        dead_lettered: bool,
    ) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let updated = connection.execute(
            "UPDATE alert_outbox SET acked_at_ms = ?, dead_lettered = ? \
             WHERE seq = ? AND acked_at_ms IS NULL",
            params![acked_at_ms, dead_lettered, seq],
        )?;
        Ok(updated > 0)
    }

    /// List outbox messages newest first, for inspection.
    pub fn list_alerts(
        &self,
        topic: &str,
        include_acked: bool,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let filter = if include_acked {
            "WHERE topic = ? ORDER BY seq DESC LIMIT ?"
        } else {
            "WHERE topic = ? AND acked_at_ms IS NULL ORDER BY seq DESC LIMIT ?"
        };
        select_outbox(&connection, filter, params![topic, limit])
    }

    /// Count unacknowledged messages of `topic`.
    pub fn pending_alert_count(&self, topic: &str) -> Result<u64, WarehouseError> {
        let connection = self.manager.acquire()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM alert_outbox WHERE topic = ? AND acked_at_ms IS NULL",
            params![topic],
            |row| row.get(0),
        )?;
        u64::try_from(count).map_err(|_| WarehouseError::InvalidData(format!("negative count {count}")))
    }
}

fn select_outbox(
    connection: &Connection,
    filter: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<OutboxRecord>, WarehouseError> {
    let sql = format!(
        "SELECT seq, topic, payload, created_at_ms, delivery_count, acked_at_ms, dead_lettered \
         FROM alert_outbox {filter}"
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params, |row| {
        Ok(OutboxRecord {
            seq: row.get(0)?,
            topic: row.get(1)?,
            payload: row.get(2)?,
            created_at_ms: row.get(3)?,
            delivery_count: row.get(4)?,
            acked_at_ms: row.get(5)?,
            dead_lettered: row.get(6)?,
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Commit on success, roll back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// Resolve the ratekeep home directory from environment or default.
fn resolve_ratekeep_home() -> PathBuf {
    if let Some(path) = env::var_os("RATEKEEP_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ratekeep");
    }

    PathBuf::from(".ratekeep")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Warehouse) {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("home").join("ratekeep.duckdb");
        let warehouse = Warehouse::open(WarehouseConfig {
            max_pool_size: 2,
            ..WarehouseConfig::at_path(db_path)
        })
        .expect("warehouse open");
        (temp, warehouse)
    }

    fn row(text: &str, kind: &str) -> CacheRow {
        CacheRow {
            cache_key: String::from("percentage_key"),
            value_kind: kind.to_string(),
            value_text: text.to_string(),
            expires_at_ms: 2_000,
            written_at_ms: 1_000,
        }
    }

    #[test]
    fn cache_rows_are_replaced_in_full() {
        let (_temp, warehouse) = open_temp();

        warehouse.put_cache_entry(&row("0.10", "decimal")).expect("first write");
        warehouse.put_cache_entry(&row("0.15", "float")).expect("overwrite");

        let stored = warehouse
            .get_cache_entry("percentage_key")
            .expect("read")
            .expect("row exists");
        assert_eq!(stored, row("0.15", "float"));
        assert!(warehouse.get_cache_entry("other").expect("read").is_none());
    }

    #[test]
    fn cache_key_is_bound_as_parameter() {
        let (_temp, warehouse) = open_temp();
        let hostile = r#"k'; DROP TABLE rate_cache; --"#;

        let mut entry = row("0.2", "text");
        entry.cache_key = hostile.to_string();
        warehouse.put_cache_entry(&entry).expect("write");

        assert!(warehouse.get_cache_entry(hostile).expect("read").is_some());
        assert!(warehouse.delete_cache_entry(hostile).expect("delete"));
        assert!(!warehouse.delete_cache_entry(hostile).expect("second delete"));
    }

    #[test]
    fn outbox_leases_in_order_until_acked() {
        let (_temp, warehouse) = open_temp();

        let first = warehouse.enqueue_alert("retry-exhausted", r#"{"n":1}"#, 10).expect("enqueue");
        let second = warehouse.enqueue_alert("retry-exhausted", r#"{"n":2}"#, 11).expect("enqueue");
        warehouse.enqueue_alert("other-topic", r#"{"n":3}"#, 12).expect("enqueue");
        assert!(first < second);

        let leased = warehouse.lease_pending_alerts("retry-exhausted", 10).expect("lease");
        assert_eq!(leased.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![first, second]);
        assert!(leased.iter().all(|r| r.delivery_count == 1));

        assert!(warehouse.ack_alert(first, 20, false).expect("ack"));
        assert!(!warehouse.ack_alert(first, 21, false).expect("double ack is a no-op"));

        let again = warehouse.lease_pending_alerts("retry-exhausted", 10).expect("lease");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].seq, second);
        assert_eq!(again[0].delivery_count, 2);
        assert_eq!(warehouse.pending_alert_count("retry-exhausted").expect("count"), 1);
    }

    #[test]
    fn dead_lettered_messages_are_listed_as_acked() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        let seq = warehouse.enqueue_alert("t", "{}", 1).expect("enqueue");
        warehouse.ack_alert(seq, 2, true).expect("ack");

        assert!(warehouse.list_alerts("t", false, 10).expect("list").is_empty());
        let all = warehouse.list_alerts("t", true, 10).expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].dead_lettered);
        assert_eq!(all[0].acked_at_ms, Some(2));
    }
}
