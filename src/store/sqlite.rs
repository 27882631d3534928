use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::kv::{KvBackend, KvRead, KvTxn};
use super::StoreResult;
use crate::error::StoreError;

fn map_sqlite_err(prefix: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{prefix}: {err}"))
}

/// Smallest key greater than every key starting with `prefix`, if any.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Idle read connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Durable backend over a single SQLite table of `(key, value)` blobs.
///
/// Writers are serialized by the writer connection mutex and each update
/// runs in one SQLite transaction. Views run on separate read-only
/// connections, so under WAL they proceed alongside each other and
/// alongside a writer.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_sqlite_err("create parent dir", e))?;
            }
        }

        let conn = Connection::open(&path).map_err(|e| map_sqlite_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_sqlite_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_sqlite_err("set synchronous", e))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )
        .map_err(|e| map_sqlite_err("ensure schema", e))?;

        tracing::info!(path = %path.display(), "Opened sqlite execution store");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| map_sqlite_err("lock poisoned", "mutex poisoned"))
    }

    fn checkout_reader(&self) -> StoreResult<Connection> {
        let idle = self
            .readers
            .lock()
            .map_err(|_| map_sqlite_err("lock poisoned", "mutex poisoned"))?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| map_sqlite_err("open read connection", e)),
        }
    }

    fn checkin_reader(&self, conn: Connection) {
        if let Ok(mut readers) = self.readers.lock() {
            if readers.len() < MAX_IDLE_READERS {
                readers.push(conn);
            }
        }
    }
}

/// Reads and writes through a connection or an open transaction.
struct SqliteKv<'c> {
    conn: &'c Connection,
}

impl KvRead for SqliteKv<'_> {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| map_sqlite_err("read key", e))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT key, value FROM kv WHERE key >= ?1 AND (?2 IS NULL OR key < ?2) ORDER BY key",
            )
            .map_err(|e| map_sqlite_err("prepare scan", e))?;
        let rows = stmt
            .query_map(params![prefix, prefix_successor(prefix)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| map_sqlite_err("scan prefix", e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite_err("read scan row", e))
    }
}

impl KvTxn for SqliteKv<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| map_sqlite_err("write key", e))?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| map_sqlite_err("delete key", e))?;
        Ok(())
    }
}

impl KvBackend for SqliteBackend {
    fn view<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn KvRead) -> StoreResult<T>,
    {
        let conn = self.checkout_reader()?;
        // one read transaction so multi-statement views see one snapshot
        conn.execute_batch("BEGIN")
            .map_err(|e| map_sqlite_err("begin read", e))?;
        let result = f(&SqliteKv { conn: &conn });
        conn.execute_batch("COMMIT")
            .map_err(|e| map_sqlite_err("end read", e))?;
        self.checkin_reader(conn);
        result
    }

    fn update_then<T, F, C>(&self, f: F, on_commit: C) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn KvTxn) -> StoreResult<T>,
        C: FnOnce(&T),
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_err("begin tx", e))?;

        // dropping `tx` on the error path rolls back
        let result = f(&mut SqliteKv { conn: &tx })?;

        tx.commit().map_err(|e| map_sqlite_err("commit tx", e))?;
        on_commit(&result);
        Ok(result)
    }
}
