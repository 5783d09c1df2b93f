//! SQLite schema for the state table.

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Unsupported schema version {found} (this build supports {supported})")]
    UnsupportedVersion { supported: i32, found: i32 },
}

/// Schema version stamped into `PRAGMA user_version` on creation.
pub const CURRENT_VERSION: i32 = 1;

/// Open or create a state database at the given path.
pub fn open_database(path: &std::path::Path) -> Result<Connection, SchemaError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    prepare(&conn)?;
    Ok(conn)
}

/// Open an in-memory database with the full schema. Useful for testing.
pub fn open_memory() -> Result<Connection, SchemaError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    prepare(&conn)?;
    Ok(conn)
}

/// Create the state table and indexes, stamping the schema version.
///
/// Idempotent: safe to call on an existing database.
pub fn create_schema(conn: &Connection) -> Result<(), SchemaError> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", CURRENT_VERSION)?;
    Ok(())
}

/// Build the schema on fresh (or pre-versioning) databases and refuse
/// anything stamped with a version this build does not know.
fn prepare(conn: &Connection) -> Result<(), SchemaError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match version {
        0 => create_schema(conn),
        CURRENT_VERSION => Ok(()),
        found => Err(SchemaError::UnsupportedVersion {
            supported: CURRENT_VERSION,
            found,
        }),
    }
}

const SCHEMA_SQL: &str = r#"
-- One row per logical title. The JSON-valued columns are serialized with
-- sorted keys so json_extract predicates stay deterministic.
CREATE TABLE IF NOT EXISTS state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    watched INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL,
    via TEXT,
    title TEXT,
    year INTEGER,
    season INTEGER,
    episode INTEGER,
    guids TEXT,
    parent TEXT,
    metadata TEXT,
    extra TEXT
);

CREATE INDEX IF NOT EXISTS idx_state_type ON state(type);
CREATE INDEX IF NOT EXISTS idx_state_updated ON state(updated);

-- Expression indexes for the namespaces backends actually report.
CREATE INDEX IF NOT EXISTS idx_state_guid_imdb ON state(json_extract(guids, '$.imdb'));
CREATE INDEX IF NOT EXISTS idx_state_guid_tmdb ON state(json_extract(guids, '$.tmdb'));
CREATE INDEX IF NOT EXISTS idx_state_guid_tvdb ON state(json_extract(guids, '$.tvdb'));
"#;
