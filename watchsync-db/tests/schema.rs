use watchsync_db::{open_database, open_memory, Connection, SchemaError, CURRENT_VERSION};

#[test]
fn open_memory_creates_schema() {
    let conn = open_memory().unwrap();

    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='state')",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(exists);

    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, CURRENT_VERSION);
}

#[test]
fn reopening_a_database_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let conn = open_database(&path).unwrap();
        conn.execute(
            "INSERT INTO state (type, watched, updated) VALUES ('movie', 1, 100)",
            [],
        )
        .unwrap();
    }

    let conn = open_database(&path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM state", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn refuses_databases_stamped_with_an_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
    }

    let err = open_database(&path).unwrap_err();
    assert!(matches!(
        err,
        SchemaError::UnsupportedVersion { found, .. } if found == CURRENT_VERSION + 1
    ));
}

#[test]
fn guid_expression_indexes_exist() {
    let conn = open_memory().unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='index' AND name LIKE 'idx_state_guid_%'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 3);
}
