//! Browser local/indexed row stores (`spec.md` §4.2, §6 `local_kv`/`indexed`
//! open calls).
//!
//! Both backends share [`KvRowStore`], generic over a [`KvBackend`] that
//! knows how to load every persisted `(row_id, bytes)` pair and apply a
//! batch of puts/deletes — everything else (staging, tombstones, read-
//! through) is identical to [`super::memory::MemoryRowStore`].
//!
//! Off `wasm32`, both `local_kv` and `indexed` fall back to
//! [`InProcessKv`], an in-memory stand-in, so the same code path builds and
//! tests natively. On `wasm32` with the `wasm` feature, `local_kv` is backed
//! by `window.localStorage` via `web-sys`; `indexed` is backed by the same
//! `localStorage` medium under a distinct key namespace rather than a full
//! `IndexedDB` cursor/transaction implementation — the external interface
//! (`indexed(name)` as a separate store from `local_kv(prefix)`) is honored,
//! but the on-disk object-store machinery `IndexedDB` offers is future work
//! (see `DESIGN.md`).

use super::{RowId, RowStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, LocalBoxStream, StreamExt};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashSet;

/// Durable medium a [`KvRowStore`] persists its committed rows to.
pub trait KvBackend {
    /// Every persisted `(row_id, bytes)` pair, in no particular order.
    fn load_all(&self) -> Result<Vec<(RowId, Vec<u8>)>>;

    /// Apply a batch of upserts and deletes atomically from the caller's
    /// point of view.
    fn apply(&mut self, puts: Vec<(RowId, Vec<u8>)>, deletes: Vec<RowId>) -> Result<()>;
}

/// In-process stand-in for a browser storage medium: keeps committed rows
/// in a `RefCell`-guarded map instead of any real persistence. Used as the
/// native fallback and in tests.
#[derive(Default)]
pub struct InProcessKv {
    rows: RefCell<FxHashMap<RowId, Vec<u8>>>,
}

impl InProcessKv {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for InProcessKv {
    fn load_all(&self) -> Result<Vec<(RowId, Vec<u8>)>> {
        Ok(self.rows.borrow().iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn apply(&mut self, puts: Vec<(RowId, Vec<u8>)>, deletes: Vec<RowId>) -> Result<()> {
        let mut rows = self.rows.borrow_mut();
        for id in deletes {
            rows.remove(&id);
        }
        for (id, bytes) in puts {
            rows.insert(id, bytes);
        }
        Ok(())
    }
}

/// `RowStore` over any [`KvBackend`], staged exactly like
/// [`super::memory::MemoryRowStore`].
pub struct KvRowStore<B: KvBackend> {
    backend: B,
    dirty: FxHashMap<RowId, Vec<u8>>,
    tombstones: HashSet<RowId>,
    next_id: RowId,
    dropped: bool,
}

impl<B: KvBackend> KvRowStore<B> {
    /// Attach to `backend`, seeding the row-id counter past whatever is
    /// already persisted.
    pub fn open(backend: B) -> Result<Self> {
        let next_id = backend.load_all()?.into_iter().map(|(id, _)| id + 1).max().unwrap_or(0);
        Ok(KvRowStore {
            backend,
            dirty: FxHashMap::default(),
            tombstones: HashSet::default(),
            next_id,
            dropped: false,
        })
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
impl<B: KvBackend> RowStore for KvRowStore<B> {
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
        Ok(self.backend.load_all()?.into_iter().find(|(k, _)| *k == id).map(|(_, v)| v))
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
            .backend
            .load_all()
            .unwrap_or_default()
            .into_iter()
            .filter(|(id, _)| !self.tombstones.contains(id) && !self.dirty.contains_key(id))
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
        let deletes: Vec<RowId> = self.tombstones.drain().collect();
        let puts: Vec<(RowId, Vec<u8>)> = self.dirty.drain().collect();
        self.backend.apply(puts, deletes)
    }

    async fn drop_store(&mut self) -> Result<()> {
        self.dropped = true;
        Ok(())
    }
}

/// Open the `local_kv` backend: native builds get an in-process stand-in,
/// `wasm32` builds with the `wasm` feature get `window.localStorage` under
/// `prefix`.
pub fn local_kv(prefix: impl Into<String>) -> Result<KvRowStore<impl KvBackend>> {
    #[cfg(all(target_arch = "wasm32", feature = "wasm"))]
    {
        KvRowStore::open(browser::LocalStorageKv::open(prefix.into(), "kv")?)
    }
    #[cfg(not(all(target_arch = "wasm32", feature = "wasm")))]
    {
        let _ = prefix;
        KvRowStore::open(InProcessKv::new())
    }
}

/// Open the `indexed` backend: native builds get an in-process stand-in,
/// `wasm32` builds with the `wasm` feature get `window.localStorage` under a
/// distinct `indexed:{name}` namespace (see module docs for why this isn't
/// a full `IndexedDB` object store).
pub fn indexed(name: impl Into<String>) -> Result<KvRowStore<impl KvBackend>> {
    #[cfg(all(target_arch = "wasm32", feature = "wasm"))]
    {
        KvRowStore::open(browser::LocalStorageKv::open(name.into(), "indexed")?)
    }
    #[cfg(not(all(target_arch = "wasm32", feature = "wasm")))]
    {
        let _ = name;
        KvRowStore::open(InProcessKv::new())
    }
}

#[cfg(all(target_arch = "wasm32", feature = "wasm"))]
mod browser {
    use super::{KvBackend, RowId};
    use crate::error::{Error, Result};

    /// `KvBackend` over `window.localStorage`, keys namespaced as
    /// `{namespace}:{name}:{row_id}`.
    pub struct LocalStorageKv {
        storage: web_sys::Storage,
        key_prefix: String,
    }

    impl LocalStorageKv {
        pub fn open(name: String, namespace: &str) -> Result<Self> {
            let window = web_sys::window().ok_or_else(|| Error::Codec("no global window".into()))?;
            let storage = window
                .local_storage()
                .map_err(|e| Error::Codec(format!("{e:?}")))?
                .ok_or_else(|| Error::Codec("localStorage unavailable".into()))?;
            Ok(LocalStorageKv {
                storage,
                key_prefix: format!("{namespace}:{name}:"),
            })
        }

        fn key(&self, id: RowId) -> String {
            format!("{}{}", self.key_prefix, id)
        }
    }

    impl KvBackend for LocalStorageKv {
        fn load_all(&self) -> Result<Vec<(RowId, Vec<u8>)>> {
            let len = self.storage.length().map_err(|e| Error::Codec(format!("{e:?}")))?;
            let mut rows = Vec::new();
            for i in 0..len {
                let Ok(Some(key)) = self.storage.key(i) else { continue };
                let Some(rest) = key.strip_prefix(&self.key_prefix) else { continue };
                let Ok(id) = rest.parse::<RowId>() else { continue };
                if let Ok(Some(val)) = self.storage.get_item(&key) {
                    let bytes: Vec<u8> =
                        serde_json::from_str(&val).map_err(|e| Error::Codec(e.to_string()))?;
                    rows.push((id, bytes));
                }
            }
            Ok(rows)
        }

        fn apply(&mut self, puts: Vec<(RowId, Vec<u8>)>, deletes: Vec<RowId>) -> Result<()> {
            for id in deletes {
                let _ = self.storage.remove_item(&self.key(id));
            }
            for (id, bytes) in puts {
                let encoded = serde_json::to_string(&bytes).map_err(|e| Error::Codec(e.to_string()))?;
                self.storage
                    .set_item(&self.key(id), &encoded)
                    .map_err(|e| Error::Codec(format!("{e:?}")))?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn round_trips_and_persists_across_reopen() {
        let backend = InProcessKv::new();
        let mut store = KvRowStore::open(backend).unwrap();
        let id = store.insert(b"x".to_vec()).await.unwrap();
        store.commit().await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn iterate_merges_staged_and_persisted() {
        let mut store = KvRowStore::open(InProcessKv::new()).unwrap();
        let a = store.insert(b"a".to_vec()).await.unwrap();
        store.commit().await.unwrap();
        let _b = store.insert(b"b".to_vec()).await.unwrap();
        store.remove(a).await.unwrap();
        let rows: Vec<_> = store.iterate().collect().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"b".to_vec());
    }
}
