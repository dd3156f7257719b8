//! Database schema definitions and migrations.
//!
//! The layout is shared with stores written by the earlier tracker: a
//! `tracker` key/value table holding the `next` cursor, and a `sources`
//! table with one row per work item. Those stores predate `user_version`
//! and the `failure` column, and are upgraded in place on load.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use super::error::StoreError;
use super::types::{format_timestamp, WorkItem};

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Key of the cursor row in the `tracker` table.
pub(crate) const CURSOR_KEY: &str = "next";

/// Schema DDL for version 1.
const SCHEMA_V1: &str = r#"
CREATE TABLE tracker (
    key          TEXT NOT NULL PRIMARY KEY,
    value        TEXT
);

CREATE TABLE sources (
    id           BIGINT NOT NULL PRIMARY KEY,
    path         TEXT NOT NULL,
    done         TIMESTAMP,
    args         TEXT,
    command_line TEXT,
    returncode   INTEGER,
    stdout       TEXT,
    stderr       TEXT,
    failure      TEXT
);
"#;

/// Columns every readable `sources` table must have, `failure` excepted.
const LEGACY_COLUMNS: &[&str] = &[
    "id",
    "path",
    "done",
    "args",
    "command_line",
    "returncode",
    "stdout",
    "stderr",
];

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Create the schema and populate it in one transaction.
///
/// Items are written verbatim, so this also serves imports that carry
/// completion or failure state.
pub(crate) fn create(
    conn: &mut Connection,
    items: &[WorkItem],
    cursor: u64,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.execute(
        "INSERT INTO tracker (key, value) VALUES (?1, ?2)",
        rusqlite::params![CURSOR_KEY, cursor.to_string()],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO sources (id, path, done, args, command_line, returncode, stdout, stderr, failure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for item in items {
            let invocation = item.invocation.as_ref();
            stmt.execute(rusqlite::params![
                item.id as i64,
                item.path,
                item.completed_at.as_ref().map(format_timestamp),
                invocation.map(|i| encode_args(&i.args)),
                invocation.map(|i| i.command_line.as_str()),
                invocation.and_then(|i| i.returncode),
                invocation.map(|i| i.stdout.as_str()),
                invocation.map(|i| i.stderr.as_str()),
                item.failure,
            ])?;
        }
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::debug!(
        items = items.len(),
        "Initialized job store schema at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Check that an existing database has the expected layout, upgrading
/// stores written by the earlier tracker.
pub(crate) fn verify_and_migrate(conn: &Connection, path: &Path) -> Result<(), StoreError> {
    let version = get_schema_version(conn).map_err(|e| StoreError::corrupt(path, e))?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::corrupt(
            path,
            format!(
                "schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            ),
        ));
    }

    for table in ["tracker", "sources"] {
        if !table_exists(conn, table).map_err(|e| StoreError::corrupt(path, e))? {
            return Err(StoreError::corrupt(path, format!("missing table `{table}`")));
        }
    }

    for column in LEGACY_COLUMNS {
        if !column_exists(conn, column).map_err(|e| StoreError::corrupt(path, e))? {
            return Err(StoreError::corrupt(
                path,
                format!("table `sources` has no column `{column}`"),
            ));
        }
    }

    let has_cursor: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tracker WHERE key = ?1",
            [CURSOR_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::corrupt(path, e))?;
    if has_cursor.is_none() {
        return Err(StoreError::corrupt(path, "no `next` cursor in `tracker`"));
    }

    let (count, min_id, max_id): (i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(MIN(id), 0), COALESCE(MAX(id), -1) FROM sources",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| StoreError::corrupt(path, e))?;
    // `id` is the primary key, so these bounds leave no room for gaps.
    if count > 0 && (min_id != 0 || max_id != count - 1) {
        return Err(StoreError::corrupt(
            path,
            format!(
                "work item ids are not contiguous: {count} items span ids {min_id}..={max_id}"
            ),
        ));
    }

    let has_failure = column_exists(conn, "failure").map_err(|e| StoreError::corrupt(path, e))?;
    match (version, has_failure) {
        (SCHEMA_VERSION, true) => Ok(()),
        (0, _) => migrate_legacy(conn, has_failure).map_err(|e| StoreError::corrupt(path, e)),
        _ => Err(StoreError::corrupt(
            path,
            "table `sources` has no column `failure`",
        )),
    }
}

/// Bring a version-0 store up to the current schema.
fn migrate_legacy(conn: &Connection, has_failure: bool) -> rusqlite::Result<()> {
    if !has_failure {
        conn.execute_batch("ALTER TABLE sources ADD COLUMN failure TEXT")?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tracing::info!("Migrated legacy job store to schema version {}", SCHEMA_VERSION);
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('sources') WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Arguments are stored as a JSON array.
pub(crate) fn encode_args(args: &[String]) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

/// Decode the `args` column; a value that is not a JSON array is kept whole.
pub(crate) fn decode_args(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|_| vec![raw.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_DDL: &str = r#"
        CREATE TABLE tracker (key text NOT NULL PRIMARY KEY, value text);
        CREATE TABLE sources (
            id bigint NOT NULL PRIMARY KEY,
            path text NOT NULL,
            done timestamp,
            args text,
            command_line text,
            returncode integer,
            stdout text,
            stderr text
        );
        INSERT INTO tracker (key, value) VALUES ('next', 0);
        INSERT INTO sources (id, path) VALUES (0, '/data/a'), (1, '/data');
    "#;

    #[test]
    fn test_create_sets_version_and_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        let items = vec![WorkItem::pending(0, "/a/b"), WorkItem::pending(1, "/a")];
        create(&mut conn, &items, 0).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sources", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        verify_and_migrate(&conn, Path::new(":memory:")).unwrap();
    }

    #[test]
    fn test_create_twice_fails() {
        let mut conn = Connection::open_in_memory().unwrap();
        create(&mut conn, &[], 0).unwrap();
        assert!(create(&mut conn, &[], 0).is_err());
    }

    #[test]
    fn test_empty_database_is_corrupt() {
        let conn = Connection::open_in_memory().unwrap();
        let result = verify_and_migrate(&conn, Path::new(":memory:"));
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        create(&mut conn, &[], 0).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let result = verify_and_migrate(&conn, Path::new(":memory:"));
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_missing_cursor_row_is_corrupt() {
        let mut conn = Connection::open_in_memory().unwrap();
        create(&mut conn, &[], 0).unwrap();
        conn.execute("DELETE FROM tracker", []).unwrap();
        let err = verify_and_migrate(&conn, Path::new(":memory:")).unwrap_err();
        assert!(err.to_string().contains("cursor"));
    }

    #[test]
    fn test_legacy_store_gains_failure_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_DDL).unwrap();
        assert!(!column_exists(&conn, "failure").unwrap());

        verify_and_migrate(&conn, Path::new(":memory:")).unwrap();
        assert!(column_exists(&conn, "failure").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Second pass is a no-op
        verify_and_migrate(&conn, Path::new(":memory:")).unwrap();
    }

    #[test]
    fn test_gap_in_ids_is_corrupt() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_DDL).unwrap();
        conn.execute("UPDATE sources SET id = 2 WHERE id = 1", [])
            .unwrap();

        let err = verify_and_migrate(&conn, Path::new(":memory:")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.to_string().contains("not contiguous"), "{err}");
    }

    #[test]
    fn test_ids_not_starting_at_zero_are_corrupt() {
        let mut conn = Connection::open_in_memory().unwrap();
        create(&mut conn, &[WorkItem::pending(0, "/a")], 0).unwrap();
        conn.execute("UPDATE sources SET id = 1", []).unwrap();

        let result = verify_and_migrate(&conn, Path::new(":memory:"));
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_args_round_trip_and_fallback() {
        let args = vec!["rclone".to_string(), "copy".to_string()];
        assert_eq!(decode_args(&encode_args(&args)), args);
        assert_eq!(decode_args("not json"), vec!["not json".to_string()]);
    }
}
