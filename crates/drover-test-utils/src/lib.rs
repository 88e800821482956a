//! Shared test utilities for drover integration tests.
//!
//! Every test gets its own SQLite file inside a temporary directory, with
//! migrations applied. The directory is removed when the returned
//! [`TestDb`] is dropped.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tempfile::TempDir;

use drover_db::config::DbConfig;
use drover_db::pool;

/// A migrated throwaway database.
pub struct TestDb {
    pub pool: SqlitePool,
    pub config: DbConfig,
    dir: TempDir,
}

impl TestDb {
    /// Directory holding the database file; tests may put fixtures here.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the database file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("drover.db")
    }

    /// Close the pool and open a fresh one against the same file,
    /// simulating a process restart.
    pub async fn reopen(&mut self) -> SqlitePool {
        self.pool.close().await;
        self.pool = pool::open(&self.config)
            .await
            .expect("reopening test database should succeed");
        self.pool.clone()
    }

    /// Close the pool. The directory goes away with `self`.
    pub async fn teardown(self) {
        self.pool.close().await;
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let config = DbConfig::for_path(dir.path().join("drover.db"));
    let pool = pool::open(&config)
        .await
        .expect("test database should open and migrate");
    TestDb { pool, config, dir }
}
