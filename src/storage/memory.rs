//! In-Memory Storage Implementation
//!
//! Staged/committed map pairs for testing and demos. Writes land in a
//! staged overlay the sequencer can read back; `commit` folds the overlay
//! into the committed maps atomically and `rollback` discards it. Reader
//! snapshots copy only the committed state.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::traits::{
    LogStore, PrefixStore, StorageError, StorageResult, TileId, TransparencyStore,
};

#[derive(Default, Clone)]
struct Maps {
    tree_head: Option<Vec<u8>>,
    chunks: BTreeMap<u64, Vec<u8>>,
    tiles: BTreeMap<TileId, Vec<u8>>,
    indices: BTreeMap<Vec<u8>, Vec<u8>>,
    versions: BTreeMap<(Vec<u8>, u32), Vec<u8>>,
    entries: BTreeMap<u64, Vec<u8>>,
}

/// Staged writes. `None` values are tombstones for deletes.
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
    committed: RwLock<Maps>,
    staged: RwLock<Overlay>,
}

/// In-memory transparency store.
pub struct MemoryStore {
    inner: Arc<Inner>,
    log: MemoryLogStore,
    prefix: MemoryPrefixStore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_maps(Maps::default())
    }

    fn with_maps(maps: Maps) -> Self {
        let inner = Arc::new(Inner {
            committed: RwLock::new(maps),
            staged: RwLock::new(Overlay::default()),
        });
        Self {
            log: MemoryLogStore {
                inner: inner.clone(),
            },
            prefix: MemoryPrefixStore {
                inner: inner.clone(),
            },
            inner,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryLogStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn batch_get(&self, ids: &[u64]) -> StorageResult<HashMap<u64, Vec<u8>>> {
        let staged = self.inner.staged.read().expect("lock poisoned");
        let committed = self.inner.committed.read().expect("lock poisoned");
        let mut out = HashMap::new();
        for id in ids {
            if let Some(data) = staged.chunks.get(id).or_else(|| committed.chunks.get(id)) {
                out.insert(*id, data.clone());
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

pub struct MemoryPrefixStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl PrefixStore for MemoryPrefixStore {
    async fn batch_get(&self, ids: &[TileId]) -> StorageResult<HashMap<TileId, Vec<u8>>> {
        let staged = self.inner.staged.read().expect("lock poisoned");
        let committed = self.inner.committed.read().expect("lock poisoned");
        let mut out = HashMap::new();
        for id in ids {
            if let Some(data) = staged.tiles.get(id).or_else(|| committed.tiles.get(id)) {
                out.insert(*id, data.clone());
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
impl TransparencyStore for MemoryStore {
    fn log_store(&self) -> &dyn LogStore {
        &self.log
    }

    fn prefix_store(&self) -> &dyn PrefixStore {
        &self.prefix
    }

    fn clone_reader(&self) -> Box<dyn TransparencyStore> {
        let committed = self
            .inner
            .committed
            .read()
            .expect("lock poisoned")
            .clone();
        Box::new(MemoryStore::with_maps(committed))
    }

    async fn commit(&self) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        let mut committed = self.inner.committed.write().expect("lock poisoned");
        if let Some(head) = staged.tree_head.take() {
            committed.tree_head = Some(head);
        }
        for (id, data) in std::mem::take(&mut staged.chunks) {
            committed.chunks.insert(id, data);
        }
        for (id, data) in std::mem::take(&mut staged.tiles) {
            committed.tiles.insert(id, data);
        }
        for (label, entry) in std::mem::take(&mut staged.indices) {
            match entry {
                Some(data) => committed.indices.insert(label, data),
                None => committed.indices.remove(&label),
            };
        }
        for (key, entry) in std::mem::take(&mut staged.versions) {
            match entry {
                Some(data) => committed.versions.insert(key, data),
                None => committed.versions.remove(&key),
            };
        }
        for (pos, data) in std::mem::take(&mut staged.entries) {
            committed.entries.insert(pos, data);
        }
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        let mut staged = self.inner.staged.write().expect("lock poisoned");
        *staged = Overlay::default();
        Ok(())
    }

    async fn get_tree_head(&self) -> StorageResult<Option<Vec<u8>>> {
        let staged = self.inner.staged.read().expect("lock poisoned");
        if let Some(head) = &staged.tree_head {
            return Ok(Some(head.clone()));
        }
        Ok(self.inner.committed.read().expect("lock poisoned").tree_head.clone())
    }

    async fn put_tree_head(&self, head: &[u8]) -> StorageResult<()> {
        self.inner.staged.write().expect("lock poisoned").tree_head = Some(head.to_vec());
        Ok(())
    }

    async fn batch_get_index(&self, labels: &[Vec<u8>]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let staged = self.inner.staged.read().expect("lock poisoned");
        let committed = self.inner.committed.read().expect("lock poisoned");
        Ok(labels
            .iter()
            .map(|label| match staged.indices.get(label) {
                Some(entry) => entry.clone(),
                None => committed.indices.get(label).cloned(),
            })
            .collect())
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
        let key = (label.to_vec(), version);
        let staged = self.inner.staged.read().expect("lock poisoned");
        if let Some(entry) = staged.versions.get(&key) {
            return Ok(entry.clone());
        }
        Ok(self.inner.committed.read().expect("lock poisoned").versions.get(&key).cloned())
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
        let staged = self.inner.staged.read().expect("lock poisoned");
        if let Some(data) = staged.entries.get(&pos) {
            return Ok(data.clone());
        }
        self.inner
            .committed
            .read()
            .expect("lock poisoned")
            .entries
            .get(&pos)
            .cloned()
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
        let staged = self.inner.staged.read().expect("lock poisoned");
        let committed = self.inner.committed.read().expect("lock poisoned");
        let mut out = HashMap::new();
        for pos in positions {
            if let Some(data) = staged
                .entries
                .get(pos)
                .or_else(|| committed.entries.get(pos))
            {
                out.insert(*pos, data.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_staged_reads_and_commit() {
        let store = MemoryStore::new();
        store.put_entry(0, b"entry").await.unwrap();

        // The writer reads its own staged write.
        assert_eq!(store.get_entry(0).await.unwrap(), b"entry");

        // A reader snapshot does not see it until commit.
        let reader = store.clone_reader();
        assert!(reader.get_entry(0).await.is_err());

        store.commit().await.unwrap();
        let reader = store.clone_reader();
        assert_eq!(reader.get_entry(0).await.unwrap(), b"entry");
    }

    #[tokio::test]
    async fn test_rollback_discards_staged() {
        let store = MemoryStore::new();
        store.put_tree_head(b"head").await.unwrap();
        store.put_index(b"label", b"idx").await.unwrap();
        store.rollback().await.unwrap();

        assert_eq!(store.get_tree_head().await.unwrap(), None);
        assert_eq!(
            store.batch_get_index(&[b"label".to_vec()]).await.unwrap(),
            vec![None]
        );
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let store = MemoryStore::new();
        store.put_index(b"label", b"idx").await.unwrap();
        store.put_version(b"label", 0, b"v0").await.unwrap();
        store.commit().await.unwrap();

        store.delete_index(b"label").await.unwrap();
        store.delete_version(b"label", 0).await.unwrap();

        // Tombstones shadow committed data before commit.
        assert_eq!(
            store.batch_get_index(&[b"label".to_vec()]).await.unwrap(),
            vec![None]
        );
        assert_eq!(store.get_version(b"label", 0).await.unwrap(), None);

        store.commit().await.unwrap();
        assert_eq!(store.get_version(b"label", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_log_and_prefix_stores_share_staging() {
        let store = MemoryStore::new();
        store
            .log_store()
            .batch_put(&[(7, b"chunk".to_vec())])
            .await
            .unwrap();
        store
            .prefix_store()
            .batch_put(&[(TileId::new(1, 0), b"tile".to_vec())])
            .await
            .unwrap();

        let chunks = store.log_store().batch_get(&[7]).await.unwrap();
        assert_eq!(chunks[&7], b"chunk");

        let reader = store.clone_reader();
        assert!(reader.log_store().batch_get(&[7]).await.unwrap().is_empty());

        store.commit().await.unwrap();
        let reader = store.clone_reader();
        let tiles = reader
            .prefix_store()
            .batch_get(&[TileId::new(1, 0)])
            .await
            .unwrap();
        assert_eq!(tiles[&TileId::new(1, 0)], b"tile");
    }
}
