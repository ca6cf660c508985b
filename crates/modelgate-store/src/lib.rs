//! Embedded SQLite store for modelgate.
//!
//! Opens the database in WAL mode behind a bounded connection pool and
//! applies embedded migrations at startup. All rows are owned here; other
//! crates hold identifiers and fetch on demand through the typed
//! repository modules. Raw SQL never crosses the crate boundary.
//!
//! The design is single-instance: [`InstanceLock`] refuses to start when
//! another process already holds the data directory.

pub mod error;
pub mod models;
pub mod oauth_states;
pub mod providers;
pub mod sessions;
pub mod settings;
pub mod usage;
pub mod users;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

pub use error::StoreError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Handle to the embedded store. Cheap to clone; all clones share the
/// pool and the settings cache.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    settings_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl Store {
    /// Open (creating if missing) the database file and apply migrations.
    ///
    /// The engine serializes writes; readers are concurrent. WAL mode
    /// keeps readers unblocked during writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened and
    /// [`StoreError::Migration`] if a migration fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        MIGRATOR.run(&pool).await?;
        info!(path = %path.display(), "store opened");

        Ok(Self {
            pool,
            settings_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Open an in-memory database (tests and development).
    ///
    /// The pool is capped at one connection because every SQLite
    /// in-memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] or [`StoreError::Migration`].
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            settings_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Borrow the underlying pool for the repository modules.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// Exclusive lock on the data directory.
///
/// Two servers against one store are undefined behavior (last-writer-wins
/// on settings, config projection races), so startup refuses when the
/// lock file exists and names a live holder. The file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, writing our PID into `<data_dir>/modelgate.lock`.
    ///
    /// A stale file left by a crashed process is reclaimed when its PID no
    /// longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] when another live process holds the
    /// lock and [`StoreError::LockIo`] on filesystem failures.
    pub fn acquire(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("modelgate.lock");
        let lock_io = |source: std::io::Error| StoreError::LockIo {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(data_dir).map_err(lock_io)?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id()).map_err(lock_io)?;
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                if Self::holder_is_alive(holder.trim()) {
                    return Err(StoreError::Locked {
                        path: path.display().to_string(),
                    });
                }
                // Stale lock from a crashed process — reclaim it.
                std::fs::remove_file(&path).map_err(lock_io)?;
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(lock_io)?;
                write!(file, "{}", std::process::id()).map_err(lock_io)?;
                Ok(Self { path })
            }
            Err(err) => Err(lock_io(err)),
        }
    }

    #[cfg(unix)]
    fn holder_is_alive(pid: &str) -> bool {
        let Ok(pid) = pid.parse::<u32>() else {
            return false;
        };
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(unix))]
    fn holder_is_alive(pid: &str) -> bool {
        // No portable liveness probe — treat any recorded holder as live.
        !pid.is_empty()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_to_fresh_database() {
        let store = Store::open_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn open_creates_file_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("modelgate.db");
        {
            let store = Store::open(&db_path).await.unwrap();
            sqlx::query("INSERT INTO settings (key, value) VALUES ('k', 'v')")
                .execute(store.pool())
                .await
                .unwrap();
        }
        let store = Store::open(&db_path).await.unwrap();
        let value: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'k'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(value, "v");
    }

    #[test]
    fn instance_lock_refuses_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = InstanceLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            InstanceLock::acquire(dir.path()),
            Err(StoreError::Locked { .. })
        ));
    }

    #[test]
    fn instance_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = InstanceLock::acquire(dir.path()).unwrap();
        }
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // PID 0 never names a live process we could own.
        std::fs::write(dir.path().join("modelgate.lock"), "999999999").unwrap();
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }
}
