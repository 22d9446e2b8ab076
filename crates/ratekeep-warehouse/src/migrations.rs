//! Schema migrations for the ratekeep warehouse.

use ::duckdb::{params, Connection};
use tracing::info;

/// Ordered migrations; the index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[
    // v1: cache table keyed by the resolver's cache key
    "CREATE TABLE IF NOT EXISTS rate_cache (
        cache_key VARCHAR PRIMARY KEY,
        value_kind VARCHAR NOT NULL,
        value_text VARCHAR NOT NULL,
        expires_at_ms BIGINT NOT NULL,
        written_at_ms BIGINT NOT NULL
    );",
    // v2: alert outbox, ordered by sequence within a topic
    "CREATE SEQUENCE IF NOT EXISTS alert_outbox_seq START 1;
     CREATE TABLE IF NOT EXISTS alert_outbox (
        seq BIGINT PRIMARY KEY DEFAULT nextval('alert_outbox_seq'),
        topic VARCHAR NOT NULL,
        payload VARCHAR NOT NULL,
        created_at_ms BIGINT NOT NULL,
        delivery_count INTEGER NOT NULL DEFAULT 0,
        acked_at_ms BIGINT,
        dead_lettered BOOLEAN NOT NULL DEFAULT FALSE
    );",
];

/// Latest schema version known to this build.
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Apply every migration newer than the stored schema version.
///
/// # Errors
/// Returns an error if any migration statement fails.
pub fn apply_migrations(connection: &Connection) -> Result<i64, ::duckdb::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version BIGINT NOT NULL);",
    )?;

    let current: i64 = connection.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        params![],
        |row| row.get(0),
    )?;

    for (index, statement) in MIGRATIONS.iter().enumerate() {
        let version = index as i64 + 1;
        if version <= current {
            continue;
        }
        connection.execute_batch(statement)?;
        connection.execute("INSERT INTO schema_version (version) VALUES (?)", params![version])?;
        info!(version, "applied warehouse migration");
    }

    Ok(SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let connection = Connection::open_in_memory().expect("open");

        assert_eq!(apply_migrations(&connection).expect("first run"), SCHEMA_VERSION);
        assert_eq!(apply_migrations(&connection).expect("second run"), SCHEMA_VERSION);

        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM schema_version", params![], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, SCHEMA_VERSION);
    }
}
