//! Job store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use super::error::StoreError;
use super::schema::{self, CURSOR_KEY};
use super::types::{
    format_timestamp, parse_timestamp, Invocation, ItemOutcome, StoreSummary, WorkItem,
};

const ITEM_COLUMNS: &str =
    "id, path, done, args, command_line, returncode, stdout, stderr, failure";

/// Trait for job store operations.
///
/// The store is owned by a single engine for the lifetime of a process, so
/// every method takes `&self` and serialises through the connection mutex.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Read the progress cursor.
    async fn cursor(&self) -> Result<u64, StoreError>;

    /// Overwrite the progress cursor.
    ///
    /// Fails if the cursor would point past `len`.
    async fn set_cursor(&self, cursor: u64) -> Result<(), StoreError>;

    /// Fetch one work item; `None` marks the end of the sequence.
    async fn work_item(&self, id: u64) -> Result<Option<WorkItem>, StoreError>;

    /// Record the outcome of one attempt and move the cursor, in one
    /// transaction. Either both land or neither does.
    async fn update_work_item(
        &self,
        id: u64,
        outcome: &ItemOutcome,
        cursor: u64,
    ) -> Result<(), StoreError>;

    /// Lowest-id item without a completion timestamp whose id is greater
    /// than `after` (or any id when `after` is `None`).
    async fn next_undone_after(&self, after: Option<u64>) -> Result<Option<WorkItem>, StoreError>;

    /// Number of work items.
    async fn total(&self) -> Result<u64, StoreError>;

    /// Number of items whose last attempt failed.
    async fn failure_count(&self) -> Result<u64, StoreError>;

    /// Every failed item, in id order.
    async fn list_failures(&self) -> Result<Vec<WorkItem>, StoreError>;

    /// Number of items without a completion timestamp.
    async fn remaining(&self) -> Result<u64, StoreError>;

    /// Totals by status.
    async fn summary(&self) -> Result<StoreSummary, StoreError>;

    /// Close the store and move its file into `log_dir`, returning the new
    /// location. Not retried on failure.
    async fn archive(self: Box<Self>, log_dir: &Path) -> Result<PathBuf, StoreError>;
}

/// SQLite implementation of the job store.
pub struct SqliteJobStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages and archiving).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Create a fresh store with one pending item per path, ids assigned by
    /// position and the cursor at 0.
    pub async fn initialize(path: &Path, paths: Vec<String>) -> Result<Self, StoreError> {
        let items = paths
            .into_iter()
            .enumerate()
            .map(|(id, path)| WorkItem::pending(id as u64, path))
            .collect();
        Self::initialize_with(path, items, 0).await
    }

    /// Create a fresh store from fully-formed items.
    ///
    /// Item ids must be dense from 0 and the cursor must not exceed the item
    /// count. A partially written file is removed on failure.
    pub async fn initialize_with(
        path: &Path,
        items: Vec<WorkItem>,
        cursor: u64,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::init(path, "a store already exists at this path"));
        }
        if let Some(item) = items
            .iter()
            .enumerate()
            .find(|(position, item)| item.id != *position as u64)
        {
            return Err(StoreError::init(
                path,
                format!("work item ids are not dense: found {} at position {}", item.1.id, item.0),
            ));
        }
        if cursor > items.len() as u64 {
            return Err(StoreError::init(
                path,
                StoreError::CursorOutOfRange {
                    cursor,
                    len: items.len() as u64,
                },
            ));
        }

        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path_clone)
                .map_err(|e| StoreError::init(&path_clone, e))?;
            let result = configure(&conn).and_then(|()| schema::create(&mut conn, &items, cursor));
            match result {
                Ok(()) => Ok(conn),
                Err(e) => {
                    drop(conn);
                    let _ = std::fs::remove_file(&path_clone);
                    Err(StoreError::init(&path_clone, e))
                }
            }
        })
        .await??;

        tracing::debug!(path = %path.display(), "Created job store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an existing store.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path_clone,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| StoreError::corrupt(&path_clone, e))?;
            configure(&conn).map_err(|e| StoreError::corrupt(&path_clone, e))?;
            schema::verify_and_migrate(&conn, &path_clone)?;
            Ok::<_, StoreError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Loaded job store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

/// Connection settings shared by create and load.
///
/// The rollback journal keeps every committed transaction inside the single
/// store file, which is what gets archived.
fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "DELETE")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}

/// Number of items. Ids are dense, so this is `max(id) + 1` and stays an
/// index lookup rather than a table scan.
fn item_count(conn: &Connection) -> Result<u64, StoreError> {
    let count: i64 = conn
        .query_row("SELECT COALESCE(MAX(id) + 1, 0) FROM sources", [], |row| {
            row.get(0)
        })
        .map_err(StoreError::query)?;
    Ok(count as u64)
}

fn count_where(conn: &Connection, predicate: &str) -> Result<u64, StoreError> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM sources WHERE {predicate}"),
            [],
            |row| row.get(0),
        )
        .map_err(StoreError::query)?;
    Ok(count as u64)
}

fn read_cursor(conn: &Connection) -> Result<u64, StoreError> {
    // Stores written by the earlier tracker may hold the value as an integer.
    let value: Value = conn
        .query_row(
            "SELECT value FROM tracker WHERE key = ?1",
            [CURSOR_KEY],
            |row| row.get(0),
        )
        .map_err(StoreError::query)?;
    match value {
        Value::Integer(n) if n >= 0 => Ok(n as u64),
        Value::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| StoreError::Query(format!("cursor value {s:?} is not a number"))),
        other => Err(StoreError::Query(format!(
            "cursor value {other:?} is not a number"
        ))),
    }
}

fn write_cursor(conn: &Connection, cursor: u64) -> Result<(), StoreError> {
    let len = item_count(conn)?;
    if cursor > len {
        return Err(StoreError::CursorOutOfRange { cursor, len });
    }
    conn.execute(
        "UPDATE tracker SET value = ?1 WHERE key = ?2",
        rusqlite::params![cursor.to_string(), CURSOR_KEY],
    )
    .map_err(StoreError::query)?;
    Ok(())
}

fn query_items(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<WorkItem>, StoreError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {ITEM_COLUMNS} FROM sources WHERE {predicate} ORDER BY id"
        ))
        .map_err(StoreError::query)?;
    let items = stmt
        .query_map(params, row_to_work_item)
        .map_err(StoreError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::query)?;
    Ok(items)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn cursor(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        read_cursor(&conn)
    }

    async fn set_cursor(&self, cursor: u64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        write_cursor(&conn, cursor)
    }

    async fn work_item(&self, id: u64) -> Result<Option<WorkItem>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM sources WHERE id = ?1"),
            [id as i64],
            row_to_work_item,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn update_work_item(
        &self,
        id: u64,
        outcome: &ItemOutcome,
        cursor: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::query)?;

        let (done, failure, invocation) = match outcome {
            ItemOutcome::Done {
                completed_at,
                invocation,
            } => (Some(format_timestamp(completed_at)), None, invocation.as_ref()),
            ItemOutcome::Failed { reason, invocation } => {
                (None, Some(reason.as_str()), invocation.as_ref())
            }
        };

        let rows = tx
            .execute(
                "UPDATE sources SET done = ?1, failure = ?2, args = ?3, command_line = ?4,
                     returncode = ?5, stdout = ?6, stderr = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    done,
                    failure,
                    invocation.map(|i| schema::encode_args(&i.args)),
                    invocation.map(|i| i.command_line.as_str()),
                    invocation.and_then(|i| i.returncode),
                    invocation.map(|i| i.stdout.as_str()),
                    invocation.map(|i| i.stderr.as_str()),
                    id as i64,
                ],
            )
            .map_err(StoreError::query)?;
        if rows != 1 {
            return Err(StoreError::UnknownItem(id));
        }

        write_cursor(&tx, cursor)?;
        tx.commit().map_err(StoreError::query)?;
        Ok(())
    }

    async fn next_undone_after(&self, after: Option<u64>) -> Result<Option<WorkItem>, StoreError> {
        let conn = self.lock()?;
        let floor = after.map(|id| id as i64).unwrap_or(-1);
        conn.query_row(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM sources WHERE id > ?1 AND done IS NULL ORDER BY id LIMIT 1"
            ),
            [floor],
            row_to_work_item,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn total(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        item_count(&conn)
    }

    async fn failure_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        count_where(&conn, "failure IS NOT NULL")
    }

    async fn list_failures(&self) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.lock()?;
        query_items(&conn, "failure IS NOT NULL", [])
    }

    async fn remaining(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        count_where(&conn, "done IS NULL OR failure IS NOT NULL")
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.lock()?;
        let total = item_count(&conn)?;
        let failed = count_where(&conn, "failure IS NOT NULL")?;
        let done = count_where(&conn, "done IS NOT NULL AND failure IS NULL")?;
        Ok(StoreSummary {
            total,
            done,
            failed,
            pending: total - done - failed,
            cursor: read_cursor(&conn)?,
        })
    }

    async fn archive(self: Box<Self>, log_dir: &Path) -> Result<PathBuf, StoreError> {
        let Self { conn, path } = *self;
        let conn = conn
            .into_inner()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        conn.close().map_err(|(_, e)| StoreError::query(e))?;

        let base_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archived = log_dir.join(format!(
            "{}-{}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            base_name
        ));

        let archive_err = |source| StoreError::Archive {
            from: path.clone(),
            to: archived.clone(),
            source,
        };
        std::fs::create_dir_all(log_dir).map_err(archive_err)?;
        std::fs::rename(&path, &archived).map_err(archive_err)?;

        tracing::info!(path = %archived.display(), "Job store archived");
        Ok(archived)
    }
}

/// Convert a database row to a WorkItem.
fn row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let id: i64 = row.get(0)?;
    let path: String = row.get(1)?;
    let done: Option<String> = row.get(2)?;
    let args: Option<String> = row.get(3)?;
    let command_line: Option<String> = row.get(4)?;
    let returncode: Option<i32> = row.get(5)?;
    let stdout: Option<String> = row.get(6)?;
    let stderr: Option<String> = row.get(7)?;
    let failure: Option<String> = row.get(8)?;

    let invocation = if args.is_some() || command_line.is_some() {
        Some(Invocation {
            args: args.as_deref().map(schema::decode_args).unwrap_or_default(),
            command_line: command_line.unwrap_or_default(),
            returncode,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(WorkItem {
        id: id as u64,
        path,
        completed_at: done.as_deref().map(parse_timestamp),
        invocation,
        failure,
    })
}
