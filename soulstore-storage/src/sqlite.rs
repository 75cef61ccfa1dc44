//! SQLite-backed record store.
//!
//! Records live in one table keyed by soul. The connection sits behind a
//! mutex and every call runs on a blocking task so the async runtime is never
//! stalled on disk I/O.

use crate::error::{StorageError, StorageResult};
use crate::store::{BackendStore, SetOptions};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use soulstore_types::Soul;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        soul TEXT PRIMARY KEY,
        body BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

/// Open an SQLite connection with stale WAL recovery.
///
/// If the initial open fails and a `-wal` file exists alongside the database,
/// it is removed and the open is retried once. This handles an unclean
/// shutdown leaving a journal that prevents reopening.
pub fn open_sqlite_with_wal_recovery(path: &Path) -> StorageResult<Connection> {
    let open = |path: &Path| -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    };
    match open(path) {
        Ok(conn) => Ok(conn),
        Err(first_err) => {
            let mut wal_path = path.as_os_str().to_owned();
            wal_path.push("-wal");
            let wal_path = Path::new(&wal_path);
            if wal_path.exists() {
                warn!(
                    "sqlite open failed ({first_err}), removing stale WAL and retrying: {}",
                    wal_path.display()
                );
                if std::fs::remove_file(wal_path).is_ok() {
                    return open(path).map_err(Into::into);
                }
            }
            Err(first_err.into())
        }
    }
}

/// Record store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = open_sqlite_with_wal_recovery(path.as_ref())?;
        debug!("opened sqlite record store at {}", path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(StorageError::from)?
    }
}

#[async_trait]
impl BackendStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn has(&self, soul: &Soul) -> StorageResult<bool> {
        let soul = soul.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row("SELECT 1 FROM records WHERE soul = ?1", [&soul], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn get(&self, soul: &Soul) -> StorageResult<Option<Vec<u8>>> {
        let soul = soul.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row("SELECT body FROM records WHERE soul = ?1", [&soul], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?)
        })
        .await
    }

    async fn set(&self, soul: &Soul, bytes: Vec<u8>, options: SetOptions) -> StorageResult<()> {
        let soul = soul.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO records (soul, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(soul) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![soul, bytes, now],
            )?;
            if options.immediate {
                conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            }
            Ok(())
        })
        .await
    }

    async fn del(&self, soul: &Soul) -> StorageResult<bool> {
        let soul = soul.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM records WHERE soul = ?1", [&soul])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn souls(&self) -> StorageResult<Vec<Soul>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT soul FROM records ORDER BY soul")?;
            let souls = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(souls.into_iter().map(Soul::from).collect())
        })
        .await
    }
}
