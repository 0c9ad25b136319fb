//! In-memory row store: a plain mapping, staged the same way every other
//! backend is (`spec.md` §4.2).

use super::{RowId, RowStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, LocalBoxStream, StreamExt};
use rustc_hash::FxHashMap;
use std::collections::HashSet;

/// `RowStore` backed entirely by in-process hash maps; never persisted.
#[derive(Default)]
pub struct MemoryRowStore {
    committed: FxHashMap<RowId, Vec<u8>>,
    dirty: FxHashMap<RowId, Vec<u8>>,
    tombstones: HashSet<RowId>,
    next_id: RowId,
    dropped: bool,
}

impl MemoryRowStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_dropped(&self) -> Result<()> {
        if self.dropped {
            Err(Error::Dropped)
        } else {
            Ok(())
        }
    }
}

#[async_trait(?Send)]
impl RowStore for MemoryRowStore {
    async fn insert(&mut self, bytes: Vec<u8>) -> Result<RowId> {
        self.check_dropped()?;
        let id = self.next_id;
        self.next_id += 1;
        self.tombstones.remove(&id);
        self.dirty.insert(id, bytes);
        Ok(id)
    }

    async fn get(&self, id: RowId) -> Result<Option<Vec<u8>>> {
        self.check_dropped()?;
        if self.tombstones.contains(&id) {
            return Ok(None);
        }
        if let Some(v) = self.dirty.get(&id) {
            return Ok(Some(v.clone()));
        }
        Ok(self.committed.get(&id).cloned())
    }

    async fn set(&mut self, id: RowId, bytes: Vec<u8>) -> Result<()> {
        self.check_dropped()?;
        self.tombstones.remove(&id);
        self.dirty.insert(id, bytes);
        Ok(())
    }

    async fn remove(&mut self, id: RowId) -> Result<()> {
        self.check_dropped()?;
        self.dirty.remove(&id);
        self.tombstones.insert(id);
        Ok(())
    }

    fn iterate(&self) -> LocalBoxStream<'_, (RowId, Vec<u8>)> {
        let mut rows: Vec<(RowId, Vec<u8>)> = self
            .committed
            .iter()
            .filter(|(id, _)| !self.tombstones.contains(id) && !self.dirty.contains_key(id))
            .map(|(id, v)| (*id, v.clone()))
            .collect();
        rows.extend(
            self.dirty
                .iter()
                .filter(|(id, _)| !self.tombstones.contains(id))
                .map(|(id, v)| (*id, v.clone())),
        );
        rows.sort_by_key(|(id, _)| *id);
        stream::iter(rows).boxed_local()
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_dropped()?;
        for id in self.tombstones.drain() {
            self.committed.remove(&id);
        }
        for (id, v) in self.dirty.drain() {
            self.committed.insert(id, v);
        }
        Ok(())
    }

    async fn drop_store(&mut self) -> Result<()> {
        self.dropped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn get_reads_through_staged_state() {
        let mut store = MemoryRowStore::new();
        let id = store.insert(b"a".to_vec()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(b"a".to_vec()));
        store.commit().await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn remove_of_missing_id_is_noop() {
        let mut store = MemoryRowStore::new();
        assert!(store.remove(999).await.is_ok());
    }

    #[tokio::test]
    async fn commit_after_drop_fails() {
        let mut store = MemoryRowStore::new();
        store.drop_store().await.unwrap();
        assert!(matches!(store.commit().await, Err(Error::Dropped)));
    }

    #[tokio::test]
    async fn iterate_sees_insertion_order_and_staged_removals() {
        let mut store = MemoryRowStore::new();
        let a = store.insert(b"a".to_vec()).await.unwrap();
        let _b = store.insert(b"b".to_vec()).await.unwrap();
        store.commit().await.unwrap();
        store.remove(a).await.unwrap();
        let rows: Vec<_> = store.iterate().collect().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"b".to_vec());
    }
}
