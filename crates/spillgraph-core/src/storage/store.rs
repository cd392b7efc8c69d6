//! SQLite-backed record store.
//!
//! An ordered `id -> bytes` map of serialized node bodies. Writes accumulate
//! in an open write transaction that [`Store::flush`] commits; reads on the
//! same connection see the uncommitted writes.
//!
//! The connection is opened lazily on first use. Ephemeral stores live in a
//! temporary directory that is removed on close.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use super::schema::{
    META_SCHEMA_VERSION, SCHEMA_CREATE_INDEX_CATALOG, SCHEMA_CREATE_METADATA,
    SCHEMA_CREATE_NODES, STORE_SCHEMA_VERSION,
};

/// File name of the database inside an ephemeral store directory
const EPHEMERAL_FILE_NAME: &str = "graph.db";

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid store location '{path}': {reason}")]
    InvalidLocation { path: PathBuf, reason: String },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("Invalid index name '{0}': use ASCII letters, digits and '_'")]
    InvalidIndexName(String),

    #[error("Store is closed")]
    Closed,
}

/// Open connection plus its transaction state
struct StoreConn {
    conn: Connection,
    in_transaction: bool,
}

/// Persistent record store
pub struct Store {
    path: PathBuf,
    /// Present for ephemeral stores until close
    temp_dir: Mutex<Option<TempDir>>,
    ephemeral: bool,
    conn: OnceCell<Mutex<Option<StoreConn>>>,
    closed: AtomicBool,
}

impl Store {
    /// Open (or create) a durable store at `path`
    ///
    /// The location is validated immediately; the database itself is opened
    /// on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if path.as_os_str().is_empty() {
            return Err(StoreError::InvalidLocation {
                path: path.to_path_buf(),
                reason: "empty path".to_string(),
            });
        }
        if path.is_dir() {
            return Err(StoreError::InvalidLocation {
                path: path.to_path_buf(),
                reason: "is a directory".to_string(),
            });
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::InvalidLocation {
                path: path.to_path_buf(),
                reason: format!("cannot create parent directory: {e}"),
            })?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            temp_dir: Mutex::new(None),
            ephemeral: false,
            conn: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Create an ephemeral store in a fresh temporary directory
    pub fn ephemeral() -> Result<Self, StoreError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("spillgraph-")
            .tempdir()?;
        let path = temp_dir.path().join(EPHEMERAL_FILE_NAME);
        debug!("Ephemeral store at {:?}", path);

        Ok(Self {
            path,
            temp_dir: Mutex::new(Some(temp_dir)),
            ephemeral: true,
            conn: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connection pragmas tuned for many small record writes
    fn configure_connection(conn: &Connection) -> SqliteResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "cache_size", -64000)?; // 64MB cache
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "mmap_size", 268435456)?; // 256MB mmap
        Ok(())
    }

    fn initialize(path: &Path) -> Result<StoreConn, StoreError> {
        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        conn.execute(SCHEMA_CREATE_NODES, [])?;
        conn.execute(SCHEMA_CREATE_METADATA, [])?;
        conn.execute(SCHEMA_CREATE_INDEX_CATALOG, [])?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = ?1",
                [META_SCHEMA_VERSION],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)",
                    params![META_SCHEMA_VERSION, STORE_SCHEMA_VERSION],
                )?;
            }
            Some(v) if v == STORE_SCHEMA_VERSION => {}
            Some(found) => {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: STORE_SCHEMA_VERSION.to_string(),
                    found,
                });
            }
        }

        Ok(StoreConn {
            conn,
            in_transaction: false,
        })
    }

    /// Get the connection, opening it on first use
    fn connection(&self) -> Result<&Mutex<Option<StoreConn>>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.conn.get_or_try_init(|| {
            debug!("Opening store at {:?}", self.path);
            Self::initialize(&self.path).map(|c| Mutex::new(Some(c)))
        })
    }

    /// Open the connection now
    ///
    /// A file SQLite cannot use as a store is reported as an invalid location.
    pub fn probe(&self) -> Result<(), StoreError> {
        match self.connection() {
            Ok(_) => Ok(()),
            Err(StoreError::Sqlite(e)) => Err(StoreError::InvalidLocation {
                path: self.path.clone(),
                reason: format!("not a usable store: {e}"),
            }),
            Err(e) => Err(e),
        }
    }

    /// Run a read against the connection
    pub(super) fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let guard = self.connection()?.lock();
        let sc = guard.as_ref().ok_or(StoreError::Closed)?;
        f(&sc.conn)
    }

    /// Run a write inside the open write transaction, beginning it if needed
    pub(super) fn with_write<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.connection()?.lock();
        let sc = guard.as_mut().ok_or(StoreError::Closed)?;
        if !sc.in_transaction {
            sc.conn.execute_batch("BEGIN")?;
            sc.in_transaction = true;
        }
        f(&sc.conn)
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Insert or replace the record of a node
    pub fn persist(&self, id: i64, record: &[u8]) -> Result<(), StoreError> {
        self.with_write(|conn| {
            conn.prepare_cached("INSERT OR REPLACE INTO nodes (id, record) VALUES (?1, ?2)")?
                .execute(params![id, record])?;
            Ok(())
        })
    }

    /// Insert or replace several records; either all are written or none
    pub fn persist_batch(&self, records: &[(i64, Vec<u8>)]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_write(|conn| {
            atomically(conn, "persist_batch", |conn| {
                let mut stmt = conn
                    .prepare_cached("INSERT OR REPLACE INTO nodes (id, record) VALUES (?1, ?2)")?;
                for (id, record) in records {
                    stmt.execute(params![id, record])?;
                }
                Ok(())
            })
        })
    }

    /// Read the record of a node
    pub fn read(&self, id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            let record = conn
                .prepare_cached("SELECT record FROM nodes WHERE id = ?1")?
                .query_row([id], |row| row.get(0))
                .optional()?;
            Ok(record)
        })
    }

    /// Delete the record of a node
    pub fn remove(&self, id: i64) -> Result<bool, StoreError> {
        self.with_write(|conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM nodes WHERE id = ?1")?
                .execute([id])?;
            Ok(deleted > 0)
        })
    }

    /// Whether a record exists for a node
    pub fn contains(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .prepare_cached("SELECT 1 FROM nodes WHERE id = ?1")?
                .query_row([id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Number of stored records
    pub fn record_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Visit every record in ascending id order
    ///
    /// The connection is held for the whole scan; `visit` must not call back
    /// into the store.
    pub fn scan(&self, mut visit: impl FnMut(i64, &[u8])) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, record FROM nodes ORDER BY id")?;
            let mut rows = stmt.query([])?;
            let mut visited = 0;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let record: Vec<u8> = row.get(1)?;
                visit(id, &record);
                visited += 1;
            }
            Ok(visited)
        })
    }

    /// Read the first `prefix_len` bytes of every record, in ascending id order
    pub fn scan_prefixes(&self, prefix_len: usize) -> Result<Vec<(i64, Vec<u8>)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, substr(record, 1, ?1) FROM nodes ORDER BY id")?;
            let rows = stmt
                .query_map([prefix_len as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // =========================================================================
    // Metadata Operations
    // =========================================================================

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM store_metadata WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO store_metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Commit the open write transaction, if any
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(cell) = self.conn.get() else {
            return Ok(());
        };
        let mut guard = cell.lock();
        if let Some(sc) = guard.as_mut() {
            if sc.in_transaction {
                sc.conn.execute_batch("COMMIT")?;
                sc.in_transaction = false;
            }
        }
        Ok(())
    }

    /// Flush, release the connection and delete ephemeral files
    ///
    /// Closing twice is a no-op. Ephemeral cleanup failures are logged.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(cell) = self.conn.get() {
            let mut guard = cell.lock();
            if let Some(mut sc) = guard.take() {
                if sc.in_transaction {
                    if let Err(e) = sc.conn.execute_batch("COMMIT") {
                        result = Err(StoreError::from(e));
                    }
                    sc.in_transaction = false;
                }
                if let Err((_, e)) = sc.conn.close() {
                    warn!("Failed to close store connection cleanly: {}", e);
                }
            }
        }

        if let Some(temp_dir) = self.temp_dir.lock().take() {
            let dir = temp_dir.path().to_path_buf();
            match temp_dir.close() {
                Ok(()) => debug!("Removed ephemeral store {:?}", dir),
                Err(e) => warn!("Failed to remove ephemeral store {:?}: {}", dir, e),
            }
        }

        result
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("ephemeral", &self.ephemeral)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run `f` inside a savepoint, rolling back everything it wrote on error
pub(super) fn atomically<R>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce(&Connection) -> Result<R, StoreError>,
) -> Result<R, StoreError> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) =
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            {
                warn!("Rollback of savepoint {} failed: {}", name, rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::schema::META_NEXT_ID;
    use tempfile::TempDir;

    #[test]
    fn test_persist_read_remove() {
        let store = Store::ephemeral().unwrap();

        store.persist(1, b"one").unwrap();
        store.persist(2, b"two").unwrap();
        store.persist(1, b"uno").unwrap();

        assert_eq!(store.read(1).unwrap(), Some(b"uno".to_vec()));
        assert_eq!(store.read(3).unwrap(), None);
        assert!(store.contains(2).unwrap());
        assert_eq!(store.record_count().unwrap(), 2);

        assert!(store.remove(2).unwrap());
        assert!(!store.remove(2).unwrap());
        assert!(!store.contains(2).unwrap());

        store.close().unwrap();
    }

    #[test]
    fn test_probe_rejects_foreign_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let store = Store::open(&path).unwrap();
        assert!(matches!(
            store.probe(),
            Err(StoreError::InvalidLocation { .. })
        ));

        let fresh = Store::open(&temp.path().join("graph.db")).unwrap();
        fresh.probe().unwrap();
        fresh.close().unwrap();
    }

    #[test]
    fn test_durable_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("graph.db");

        {
            let store = Store::open(&path).unwrap();
            store.persist(10, b"payload").unwrap();
            store.set_metadata(META_NEXT_ID, "11").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.read(10).unwrap(), Some(b"payload".to_vec()));
        assert_eq!(
            store.get_metadata(META_NEXT_ID).unwrap(),
            Some("11".to_string())
        );
        assert_eq!(
            store.get_metadata(META_SCHEMA_VERSION).unwrap(),
            Some(STORE_SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn test_flush_commits_for_other_connections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("graph.db");
        let store = Store::open(&path).unwrap();

        store.persist(5, b"five").unwrap();
        store.flush().unwrap();

        let other = Connection::open(&path).unwrap();
        let count: i64 = other
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_ephemeral_removed_on_close() {
        let store = Store::ephemeral().unwrap();
        store.persist(1, b"x").unwrap();
        let dir = store.path().parent().unwrap().to_path_buf();
        assert!(dir.exists());

        store.close().unwrap();
        assert!(!dir.exists());
        assert!(matches!(store.read(1), Err(StoreError::Closed)));
        store.close().unwrap();
    }

    #[test]
    fn test_directory_location_rejected() {
        let temp = TempDir::new().unwrap();
        let err = Store::open(temp.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidLocation { .. }));
    }

    #[test]
    fn test_uncreatable_parent_rejected() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain-file");
        std::fs::write(&file, b"not a directory").unwrap();

        let err = Store::open(&file.join("graph.db")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidLocation { .. }));
    }

    #[test]
    fn test_scan_in_id_order() {
        let store = Store::ephemeral().unwrap();
        store
            .persist_batch(&[
                (30, vec![3]),
                (10, vec![1]),
                (20, vec![2, 2, 2]),
            ])
            .unwrap();

        let mut seen = Vec::new();
        let visited = store.scan(|id, record| seen.push((id, record.to_vec()))).unwrap();
        assert_eq!(visited, 3);
        assert_eq!(
            seen,
            vec![(10, vec![1]), (20, vec![2, 2, 2]), (30, vec![3])]
        );

        let prefixes = store.scan_prefixes(2).unwrap();
        assert_eq!(prefixes[1], (20, vec![2, 2]));
    }

    #[test]
    fn test_schema_version_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("graph.db");
        {
            let store = Store::open(&path).unwrap();
            store.set_metadata(META_SCHEMA_VERSION, "99").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(matches!(
            store.read(1),
            Err(StoreError::SchemaVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_batch_leaves_no_rows() {
        let store = Store::ephemeral().unwrap();
        store.persist(1, b"kept").unwrap();

        let result = store.with_write(|conn| {
            atomically(conn, "test_batch", |conn| {
                conn.execute(
                    "INSERT INTO nodes (id, record) VALUES (?1, ?2)",
                    params![2, b"new".to_vec()],
                )?;
                conn.execute("INSERT INTO missing_table VALUES (1)", [])?;
                Ok(())
            })
        });

        assert!(result.is_err());
        assert!(!store.contains(2).unwrap());
        assert!(store.contains(1).unwrap());
    }
}
