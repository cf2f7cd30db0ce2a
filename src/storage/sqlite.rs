//! SQLite Persistent Storage
//!
//! Durable transparency store that survives service restarts. Uses
//! connection pooling via r2d2. Writes are staged in memory and flushed to
//! the database in a single transaction on `commit`, so a failed mutation
//! never leaves partial state behind.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use super::traits::{
    LogStore, PrefixStore, StorageError, StorageResult, TileId, TransparencyStore,
};

/// Staged writes awaiting commit. `None` values are tombstones.
#[derive(Default)]
struct Overlay {
    tree_head: Option<Vec<u8>>,
    chunks: BTreeMap<u64, Vec<u8>>,
    tiles: BTreeMap<TileId, Vec<u8>>,
    indices: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    versions: BTreeMap<(Vec<u8>, u32), Option<Vec<u8>>>,
    entries: BTreeMap<u64, Vec<u8>>,
}

struct Inner {
    pool: Pool<SqliteConnectionManager>,
    staged: RwLock<Overlay>,
}

impl Inner {
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

/// SQLite-backed transparency store with connection pooling.
pub struct SqliteStore {
    inner: Arc<Inner>,
    log: SqliteLogStore,
    prefix: SqlitePrefixStore,
}

impl SqliteStore {
    /// Create a store at the given database path, running migrations if
    /// needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(db_path);
        Self::with_manager(manager, 10)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_manager(SqliteConnectionManager::memory(), 1)
    }

    fn with_manager(
        manager: SqliteConnectionManager,
        max_size: u32,
    ) -> Result<Self, StorageError> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let inner = Arc::new(Inner {
            pool,
            staged: RwLock::new(Overlay::default()),
        });
        let store = Self {
            log: SqliteLogStore {
                inner: inner.clone(),
            },
            prefix: SqlitePrefixStore {
                inner: inner.clone(),
            },
            inner,
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.inner.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_chunks (
                id INTEGER PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tiles (
                version INTEGER NOT NULL,
                counter INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (version, counter)
            );

            CREATE TABLE IF NOT EXISTS label_index (
                label BLOB PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS label_versions (
                label BLOB NOT NULL,
                version INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (label, version)
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                pos INTEGER PRIMARY KEY,
                data BLOB NOT NULL
            );
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}

pub struct SqliteLogStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn batch_get(&self, ids: &[u64]) -> StorageResult<HashMap<u64, Vec<u8>>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        {
            let staged = self.inner.staged.read().expect("lock poisoned");
            for id in ids {
                match staged.chunks.get(id) {
                    Some(data) => {
                        out.insert(*id, data.clone());
                    }
                    None => missing.push(*id),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let conn = self.inner.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT data FROM log_chunks WHERE id = ?1")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        for id in missing {
            let row: Option<Vec<u8>> = stmt
                .query_row(params![id as i64], |row| row.get(0))
                .optional()
                .map_err(|e| StorageError::Database(e.to_string()))?;
            if let Some(data) = row {
                out.insert(id, data);
            }
        }
        Ok(out)
    }

    async fn batch_put(&self, chunks: &[(u64, Vec<u8>)]) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        for (id, data) in chunks {
            staged.chunks.insert(*id, data.clone());
        }
        Ok(())
    }
}

pub struct SqlitePrefixStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl PrefixStore for SqlitePrefixStore {
    async fn batch_get(&self, ids: &[TileId]) -> StorageResult<HashMap<TileId, Vec<u8>>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        {
            let staged = self.inner.staged.read().expect("lock poisoned");
            for id in ids {
                match staged.tiles.get(id) {
                    Some(data) => {
                        out.insert(*id, data.clone());
                    }
                    None => missing.push(*id),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let conn = self.inner.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT data FROM tiles WHERE version = ?1 AND counter = ?2")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        for id in missing {
            let row: Option<Vec<u8>> = stmt
                .query_row(params![id.version as i64, id.counter as i64], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| StorageError::Database(e.to_string()))?;
            if let Some(data) = row {
                out.insert(id, data);
            }
        }
        Ok(out)
    }

    async fn batch_put(&self, tiles: &[(TileId, Vec<u8>)]) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        for (id, data) in tiles {
            staged.tiles.insert(*id, data.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl TransparencyStore for SqliteStore {
    fn log_store(&self) -> &dyn LogStore {
        &self.log
    }

    fn prefix_store(&self) -> &dyn PrefixStore {
        &self.prefix
    }

    fn clone_reader(&self) -> Box<dyn TransparencyStore> {
        // Readers share the pool and see only committed rows: the snapshot
        // carries a fresh, empty staging overlay.
        let inner = Arc::new(Inner {
            pool: self.inner.pool.clone(),
            staged: RwLock::new(Overlay::default()),
        });
        Box::new(SqliteStore {
            log: SqliteLogStore {
                inner: inner.clone(),
            },
            prefix: SqlitePrefixStore {
                inner: inner.clone(),
            },
            inner,
        })
    }

    async fn commit(&self) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        let mut conn = self.inner.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let result = (|| -> Result<(), rusqlite::Error> {
            if let Some(head) = &staged.tree_head {
                tx.execute(
                    "INSERT INTO meta (key, value) VALUES ('tree_head', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = ?1",
                    params![head],
                )?;
            }
            for (id, data) in &staged.chunks {
                tx.execute(
                    "INSERT INTO log_chunks (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = ?2",
                    params![*id as i64, data],
                )?;
            }
            for (id, data) in &staged.tiles {
                tx.execute(
                    "INSERT INTO tiles (version, counter, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(version, counter) DO UPDATE SET data = ?3",
                    params![id.version as i64, id.counter as i64, data],
                )?;
            }
            for (label, entry) in &staged.indices {
                match entry {
                    Some(data) => tx.execute(
                        "INSERT INTO label_index (label, data) VALUES (?1, ?2)
                         ON CONFLICT(label) DO UPDATE SET data = ?2",
                        params![label, data],
                    )?,
                    None => tx.execute(
                        "DELETE FROM label_index WHERE label = ?1",
                        params![label],
                    )?,
                };
            }
            for ((label, version), entry) in &staged.versions {
                match entry {
                    Some(data) => tx.execute(
                        "INSERT INTO label_versions (label, version, data) VALUES (?1, ?2, ?3)
                         ON CONFLICT(label, version) DO UPDATE SET data = ?3",
                        params![label, *version as i64, data],
                    )?,
                    None => tx.execute(
                        "DELETE FROM label_versions WHERE label = ?1 AND version = ?2",
                        params![label, *version as i64],
                    )?,
                };
            }
            for (pos, data) in &staged.entries {
                tx.execute(
                    "INSERT INTO log_entries (pos, data) VALUES (?1, ?2)
                     ON CONFLICT(pos) DO UPDATE SET data = ?2",
                    params![*pos as i64, data],
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                tx.commit()
                    .map_err(|e| StorageError::Database(e.to_string()))?;
                *staged = Overlay::default();
                Ok(())
            }
            Err(e) => Err(StorageError::Database(e.to_string())),
        }
    }

    async fn rollback(&self) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        *staged = Overlay::default();
        Ok(())
    }

    async fn get_tree_head(&self) -> StorageResult<Option<Vec<u8>>> {
        {
            let staged = self.inner.staged.read().expect("lock poisoned");
            if let Some(head) = &staged.tree_head {
                return Ok(Some(head.clone()));
            }
        }
        let conn = self.inner.conn()?;
        conn.query_row("SELECT value FROM meta WHERE key = 'tree_head'", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn put_tree_head(&self, head: &[u8]) -> StorageResult<()> {
        self.inner.staged.write().expect("lock poisoned").tree_head = Some(head.to_vec());
        Ok(())
    }

    async fn batch_get_index(&self, labels: &[Vec<u8>]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let conn = self.inner.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT data FROM label_index WHERE label = ?1")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let staged = self.inner.staged.read().expect("lock poisoned");
        let mut out = Vec::with_capacity(labels.len());
        for label in labels {
            if let Some(entry) = staged.indices.get(label) {
                out.push(entry.clone());
                continue;
            }
            let row: Option<Vec<u8>> = stmt
                .query_row(params![label], |row| row.get(0))
                .optional()
                .map_err(|e| StorageError::Database(e.to_string()))?;
            out.push(row);
        }
        Ok(out)
    }

    async fn put_index(&self, label: &[u8], index: &[u8]) -> StorageResult<()> {
        self.inner
            .staged
            .write()
            .expect("lock poisoned")
            .indices
            .insert(label.to_vec(), Some(index.to_vec()));
        Ok(())
    }

    async fn delete_index(&self, label: &[u8]) -> StorageResult<()> {
        self.inner
            .staged
            .write()
            .expect("lock poisoned")
            .indices
            .insert(label.to_vec(), None);
        Ok(())
    }

    async fn get_version(&self, label: &[u8], version: u32) -> StorageResult<Option<Vec<u8>>> {
        {
            let staged = self.inner.staged.read().expect("lock poisoned");
            if let Some(entry) = staged.versions.get(&(label.to_vec(), version)) {
                return Ok(entry.clone());
            }
        }
        let conn = self.inner.conn()?;
        conn.query_row(
            "SELECT data FROM label_versions WHERE label = ?1 AND version = ?2",
            params![label, version as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn put_version(&self, label: &[u8], version: u32, value: &[u8]) -> StorageResult<()> {
        self.inner
            .staged
            .write()
            .expect("lock poisoned")
            .versions
            .insert((label.to_vec(), version), Some(value.to_vec()));
        Ok(())
    }

    async fn delete_version(&self, label: &[u8], version: u32) -> StorageResult<()> {
        self.inner
            .staged
            .write()
            .expect("lock poisoned")
            .versions
            .insert((label.to_vec(), version), None);
        Ok(())
    }

    async fn get_entry(&self, pos: u64) -> StorageResult<Vec<u8>> {
        {
            let staged = self.inner.staged.read().expect("lock poisoned");
            if let Some(data) = staged.entries.get(&pos) {
                return Ok(data.clone());
            }
        }
        let conn = self.inner.conn()?;
        conn.query_row(
            "SELECT data FROM log_entries WHERE pos = ?1",
            params![pos as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))?
        .ok_or_else(|| StorageError::NotFound(format!("log entry {pos}")))
    }

    async fn put_entry(&self, pos: u64, entry: &[u8]) -> StorageResult<()> {
        self.inner
            .staged
            .write()
            .expect("lock poisoned")
            .entries
            .insert(pos, entry.to_vec());
        Ok(())
    }

    async fn batch_get_entries(&self, positions: &[u64]) -> StorageResult<HashMap<u64, Vec<u8>>> {
        let conn = self.inner.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT data FROM log_entries WHERE pos = ?1")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let staged = self.inner.staged.read().expect("lock poisoned");
        let mut out = HashMap::new();
        for pos in positions {
            if let Some(data) = staged.entries.get(pos) {
                out.insert(*pos, data.clone());
                continue;
            }
            let row: Option<Vec<u8>> = stmt
                .query_row(params![*pos as i64], |row| row.get(0))
                .optional()
                .map_err(|e| StorageError::Database(e.to_string()))?;
            if let Some(data) = row {
                out.insert(*pos, data);
            }
        }
        Ok(out)
    }
}
