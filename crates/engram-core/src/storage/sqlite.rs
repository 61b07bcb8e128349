//! SQLite Storage Substrate
//!
//! Single embedded database per user: relational tables, the FTS5 message
//! index, and the payload table backing the vector index. Uses separate
//! reader/writer connections for interior mutability so every subsystem can
//! share one `Arc<Storage>`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use super::migrations::{self, MigrationReport};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Caller supplied an inconsistent reference or malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Unrecoverable startup failure (unreadable or corrupt database file)
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// STORAGE
// ============================================================================

/// Process-wide storage handle.
///
/// All methods take `&self`, making Storage `Send + Sync` so the engine can
/// hand out `Arc<Storage>` instead of `Arc<Mutex<Storage>>`. Writes go
/// through [`Storage::with_tx`]; the transaction commits on `Ok` and rolls
/// back on `Err` or unwind, so locks are released on every exit path.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: Option<PathBuf>,
    migration_report: MigrationReport,
}

impl Storage {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// An unreadable or corrupt file is fatal; a migration statement failing
    /// non-benignly is recorded in [`Storage::migration_report`] without
    /// aborting startup.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(path)
            .map_err(|e| StorageError::Init(format!("cannot open {}: {e}", path.display())))?;
        Self::configure_connection(&writer_conn)?;

        let migration_report = migrations::apply_migrations(&writer_conn)
            .map_err(|e| StorageError::Init(format!("migration failure: {e}")))?;

        let reader_conn = Connection::open(path)
            .map_err(|e| StorageError::Init(format!("cannot open {}: {e}", path.display())))?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path: Some(path.to_path_buf()),
            migration_report,
        })
    }

    /// Open an in-memory database. Reader and writer share one connection
    /// (two `:memory:` handles would see different databases).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Init(format!("cannot open in-memory db: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let migration_report = migrations::apply_migrations(&conn)
            .map_err(|e| StorageError::Init(format!("migration failure: {e}")))?;

        // A second handle for the reader slot so lock ordering matches the
        // file-backed layout. SQLite shared-cache URIs would also work; a
        // cloned connection to the same in-memory db is not possible, so the
        // reader opens its own db and we instead route reads to the writer.
        let reader = Connection::open_in_memory()
            .map_err(|e| StorageError::Init(format!("cannot open in-memory db: {e}")))?;

        Ok(Self {
            writer: Mutex::new(conn),
            reader: Mutex::new(reader),
            path: None,
            migration_report,
        })
    }

    /// Filesystem path of the database, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Report from the migration pass run at open time
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    /// Lock the writer connection
    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("writer lock poisoned".into()))
    }

    /// Lock the reader connection.
    ///
    /// In-memory databases have no shared reader; reads fall through to the
    /// writer connection there.
    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        if self.path.is_none() {
            return self.writer();
        }
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("reader lock poisoned".into()))
    }

    /// Run `f` inside a write transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err` or
    /// unwinds (drop semantics of [`rusqlite::Transaction`]).
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against the read connection (snapshot-consistent under WAL)
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let reader = self.reader()?;
        f(&reader)
    }

    /// Flush the WAL into the main database file. Called on engine close.
    pub fn checkpoint(&self) -> Result<()> {
        if self.path.is_some() {
            let writer = self.writer()?;
            writer.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_runs_migrations() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.migration_report().is_clean());
        assert!(storage.path().is_none());
    }

    #[test]
    fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engram.db");

        let storage = Storage::open(&path).unwrap();
        assert!(storage.migration_report().is_clean());
        assert_eq!(storage.path(), Some(path.as_path()));

        // Reopening applies nothing new
        drop(storage);
        let storage = Storage::open(&path).unwrap();
        assert!(storage.migration_report().applied.is_empty());
    }

    #[test]
    fn test_with_tx_commits_on_ok() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at)
                     VALUES ('e1', 'Ada', 'person', datetime('now'), datetime('now'))",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = storage
            .with_reader(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_with_tx_rolls_back_on_err() {
        let storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_tx(|tx| {
            tx.execute(
                "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at)
                 VALUES ('e1', 'Ada', 'person', datetime('now'), datetime('now'))",
                [],
            )?;
            Err(StorageError::InvalidInput("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_reader(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
