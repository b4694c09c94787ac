// src/db/pool.rs — Bounded SQLite connection pool
//
// The pool is the only point of mutual exclusion for database access. A
// checkout holds a semaphore permit plus one connection; dropping the
// `PooledConnection` rolls back anything left open and returns both.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::db::schema;
use crate::infra::errors::{Result, WharfError};

enum PoolTarget {
    File(PathBuf),
    Memory(String),
}

struct PoolInner {
    target: PoolTarget,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
    busy_timeout: Duration,
    // Keeps a shared in-memory database alive while every pooled
    // connection is checked out or has been discarded.
    _anchor: Option<Mutex<Connection>>,
}

impl PoolInner {
    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.target {
            PoolTarget::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn
            }
            PoolTarget::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!("Discarding pooled connection after failed rollback: {}", e);
                return;
            }
        }
        self.idle.lock().push(conn);
    }
}

/// Process-wide pool of SQLite connections. Cloning shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.inner.size)
            .field("available", &self.available())
            .finish()
    }
}

impl ConnectionPool {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path, size: usize, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::build(PoolTarget::File(path.to_path_buf()), size, busy_timeout)
    }

    /// Private shared in-memory database (for tests and tooling). Holds a
    /// single connection, so every checkout is serialized.
    pub fn in_memory() -> Result<Self> {
        let uri = format!(
            "file:wharf-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::build(PoolTarget::Memory(uri), 1, Duration::from_secs(5))
    }

    fn build(target: PoolTarget, size: usize, busy_timeout: Duration) -> Result<Self> {
        let size = size.max(1);
        let mut inner = PoolInner {
            target,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            size,
            busy_timeout,
            _anchor: None,
        };

        let first = inner.open_connection()?;
        schema::run_migrations(&first)?;
        if matches!(inner.target, PoolTarget::Memory(_)) {
            inner._anchor = Some(Mutex::new(inner.open_connection()?));
        }
        inner.idle.lock().push(first);

        debug!("Connection pool ready ({} connections)", size);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Check out a connection, waiting while all of them are in use.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WharfError::config("connection pool is shut down"))?;

        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.inner.open_connection()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Check out a connection for the duration of `f` only.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.acquire().await?;
        conn.run(f).await
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections that can be checked out right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

/// A checked-out connection. Released on drop, on every exit path.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Run blocking SQLite work on the blocking thread pool.
    pub async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.pool.open_connection()?,
        };
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await?;
        self.conn = Some(conn);
        Ok(result?)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_migrated() {
        let pool = ConnectionPool::in_memory().unwrap();
        let version = pool.run(|c| schema::current_version(c)).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_checkout_returns_permit_on_drop() {
        let pool = ConnectionPool::in_memory().unwrap();
        assert_eq!(pool.available(), 1);
        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_open_transaction_rolled_back_on_release() {
        let pool = ConnectionPool::in_memory().unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.run(|c| {
                c.execute_batch(
                    "BEGIN; INSERT INTO future_call (name, run_at, created_at)
                     VALUES ('leak', 'x', 'x');",
                )
            })
            .await
            .unwrap();
        }
        let count: i64 = pool
            .run(|c| c.query_row("SELECT COUNT(*) FROM future_call", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_pool_shares_data_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("t.db"), 2, Duration::from_secs(1))
            .unwrap();

        let mut a = pool.acquire().await.unwrap();
        let mut b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        a.run(|c| {
            c.execute(
                "INSERT INTO future_call (name, run_at, created_at) VALUES ('x', 'a', 'a')",
                [],
            )
        })
        .await
        .unwrap();
        let seen: i64 = b
            .run(|c| c.query_row("SELECT COUNT(*) FROM future_call", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }
}
