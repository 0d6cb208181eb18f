//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        // Fresh database - create all tables
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Pending location records, in insertion order (seq)
        CREATE TABLE IF NOT EXISTS locations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            latitude TEXT NOT NULL,
            longitude TEXT NOT NULL,
            other_data TEXT NOT NULL DEFAULT '',
            create_date TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_locations_id ON locations(id);

        -- Host-supplied settings and auxiliary key/value state
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Pending audit events
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            service TEXT NOT NULL,
            action TEXT NOT NULL,
            objects TEXT NOT NULL,
            create_date TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_id ON events(id);

        -- Last reported status per service
        CREATE TABLE IF NOT EXISTS service_status (
            service TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}

/// Run migrations from old_version to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    // Add future migrations here
    // if old_version < 2 { migrate_to_v2(conn)?; }

    let _ = old_version;
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}
