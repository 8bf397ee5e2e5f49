//! Database schema migrations.
//!
//! Version 1 creates the offline send queue and the key/value table used
//! for voice settings and first-use flags.

use rusqlite::Connection;
use tracing::info;

use mindease_core::error::MindeaseError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), MindeaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| MindeaseError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| MindeaseError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: offline_queue_and_kv");
    }

    Ok(())
}

/// Version 1: offline queue and key/value store.
fn apply_v1(conn: &Connection) -> Result<(), MindeaseError> {
    conn.execute_batch(
        "
        -- Outbound messages written while the push connection was down.
        -- seq preserves insertion order independently of clock skew.
        CREATE TABLE IF NOT EXISTS offline_queue (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            message         TEXT NOT NULL,
            enqueued_at     INTEGER NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS kv_store (
            key             TEXT PRIMARY KEY NOT NULL,
            value           TEXT NOT NULL,
            updated_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'offline_queue_and_kv');
        ",
    )
    .map_err(|e| MindeaseError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
