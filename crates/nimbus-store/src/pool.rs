//! Database connection pool management.
//!
//! Wraps SQLx's SqlitePool with:
//! - automatic directory creation for the database file
//! - WAL journal mode for concurrent reads
//! - schema migration on first connection
//! - open retry with backoff and stale shared-memory cleanup, because
//!   competing mount attempts can collide on a shared cache directory
//! - in-memory mode for tests

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::StoreError;

/// Attempts before stale-lock cleanup is considered.
const OPEN_ATTEMPTS: u32 = 5;

/// Delay between open attempts, doubled each retry.
const OPEN_RETRY_INITIAL: Duration = Duration::from_millis(200);

/// Manages the SQLite connection pool for one mount's state.
/// Cloning shares the underlying pool.
#[derive(Clone)]
pub struct StorePool {
    pool: SqlitePool,
}

impl StorePool {
    /// Open (creating if absent) the database at `db_path`.
    ///
    /// Retries with backoff when the database is locked by a mount
    /// that is still shutting down; if all attempts fail, removes a
    /// stale `-shm` file left by a dead process and tries once more.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "failed to create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut delay = OPEN_RETRY_INITIAL;
        let mut last_err = None;
        for attempt in 0..OPEN_ATTEMPTS {
            match Self::try_connect(db_path).await {
                Ok(pool) => {
                    if attempt > 0 {
                        tracing::info!(attempt, path = %db_path.display(), "Store opened after retry");
                    }
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        path = %db_path.display(),
                        "Store open attempt failed, backing off"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        // A dead mount can leave the shared-memory index behind with a
        // stale lock; removing it is safe once no live process has the
        // database open.
        let shm = Self::sibling(db_path, "-shm");
        if shm.exists() {
            tracing::warn!(path = %shm.display(), "Removing stale shared-memory file");
            let _ = std::fs::remove_file(&shm);
            if let Ok(pool) = Self::try_connect(db_path).await {
                return Ok(Self { pool });
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StoreError::ConnectionFailed(format!("could not open {}", db_path.display()))
        }))
    }

    /// Create an in-memory pool for tests. Single connection so data
    /// survives across queries.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!("failed to create in-memory store: {e}"))
            })?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Force a full WAL checkpoint; called on clean shutdown.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        sqlx::raw_sql("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&self.pool)
            .await?;
        tracing::debug!("WAL checkpoint completed");
        Ok(())
    }

    /// Non-blocking checkpoint for the engine's periodic pass.
    pub async fn checkpoint_passive(&self) -> Result<(), StoreError> {
        sqlx::raw_sql("PRAGMA wal_checkpoint(PASSIVE);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write a consistent single-file snapshot of the database to
    /// `dest` (clean shutdown keeps one beside the live store).
    pub async fn snapshot_to(&self, dest: &Path) -> Result<(), StoreError> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        // VACUUM INTO produces a compacted, WAL-free copy.
        let statement = format!("VACUUM INTO '{}'", dest.display());
        sqlx::raw_sql(&statement).execute(&self.pool).await?;
        tracing::debug!(dest = %dest.display(), "Store snapshot written");
        Ok(())
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn try_connect(db_path: &Path) -> Result<SqlitePool, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "failed to connect to store at {}: {e}",
                    db_path.display()
                ))
            })?;

        Self::run_migrations(&pool).await?;
        tracing::info!(path = %db_path.display(), "Store pool initialized");
        Ok(pool)
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        let migration_sql = include_str!("migrations/0001_init.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("initial migration failed: {e}")))?;
        tracing::debug!("Store migrations completed");
        Ok(())
    }

    fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
        let mut name = db_path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        db_path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_migrates() {
        let pool = StorePool::in_memory().await.unwrap();
        // Schema exists: querying an empty table succeeds.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_open_creates_file_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("metadata.db");
        let pool = StorePool::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        pool.checkpoint().await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("metadata.db");
        let pool = StorePool::open(&db_path).await.unwrap();

        let snapshot = dir.path().join("metadata.snapshot.db");
        pool.snapshot_to(&snapshot).await.unwrap();
        assert!(snapshot.exists());

        // Overwriting an existing snapshot succeeds.
        pool.snapshot_to(&snapshot).await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("metadata.db");
        let pool = StorePool::open(&db_path).await.unwrap();
        pool.close().await;
        // Second open re-runs migrations without error.
        let pool = StorePool::open(&db_path).await.unwrap();
        pool.close().await;
    }
}
