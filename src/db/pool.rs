use std::path::Path;
use std::sync::Arc;

use log::info;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::Error;

pub type InnerPool = Pool<SqliteConnectionManager>;

/// Storage handle: a pooled sqlite connection plus a process-wide
/// multi-reader/single-writer gate. WAL mode alone still serializes writers
/// at the sqlite layer;
/// this lock exists purely to avoid "database is locked" errors surfacing to
/// callers, not for in-memory consistency (consistency is guaranteed by
/// sqlite transactions themselves).
#[derive(Clone)]
pub struct Db {
    pool: InnerPool,
    lock: Arc<tokio::sync::RwLock<()>>,
}

/// A pooled connection held alongside the writer-side lock guard for the
/// duration of a read-then-write flow (verification, pop-random, migrations).
pub struct WriteGuard<'a> {
    pub conn: r2d2::PooledConnection<SqliteConnectionManager>,
    _permit: tokio::sync::RwLockWriteGuard<'a, ()>,
}

pub struct ReadGuard<'a> {
    pub conn: r2d2::PooledConnection<SqliteConnectionManager>,
    _permit: tokio::sync::RwLockReadGuard<'a, ()>,
}

impl Db {
    /// Opens (creating if missing) the database at `root_dir/db.db`, ensures
    /// `root_dir/images` exists, applies pending migrations, and returns a
    /// handle ready for use. Idempotent across restarts.
    pub fn open(root_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(root_dir)?;
        std::fs::create_dir_all(root_dir.join("images"))?;

        let db_path = root_dir.join("db.db");
        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::new(manager).map_err(|e| Error::Fatal(e.to_string()))?;

        {
            let conn = pool.get().map_err(|e| Error::Fatal(e.to_string()))?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
            .map_err(|e| Error::Fatal(e.to_string()))?;

            let version = super::migrations::run_migrations(&conn)
                .map_err(|e| Error::Fatal(e.to_string()))?;
            info!("captchouli: database at schema version {version}");
        }

        Ok(Db {
            pool,
            lock: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    /// In-memory database for tests; same migrations applied. Pinned to a
    /// single pooled connection: `SqliteConnectionManager::memory()` opens a
    /// fresh, empty `:memory:` database on every `get()`, so a pool that ever
    /// hands out more than one connection would silently fragment state
    /// across them.
    #[cfg(any(test, feature = "test-support"))]
    pub fn open_in_memory() -> Result<Self, Error> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Fatal(e.to_string()))?;
        {
            let conn = pool.get().map_err(|e| Error::Fatal(e.to_string()))?;
            super::migrations::run_migrations(&conn).map_err(|e| Error::Fatal(e.to_string()))?;
        }
        Ok(Db {
            pool,
            lock: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    pub async fn read(&self) -> Result<ReadGuard<'_>, Error> {
        let permit = self.lock.read().await;
        let conn = self.pool.get()?;
        Ok(ReadGuard {
            conn,
            _permit: permit,
        })
    }

    pub async fn write(&self) -> Result<WriteGuard<'_>, Error> {
        let permit = self.lock.write().await;
        let conn = self.pool.get()?;
        Ok(WriteGuard {
            conn,
            _permit: permit,
        })
    }

    pub async fn vacuum(&self) -> Result<(), Error> {
        let guard = self.write().await?;
        guard.conn.execute("VACUUM", [])?;
        Ok(())
    }
}
