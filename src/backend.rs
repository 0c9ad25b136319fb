//! Selects and instantiates the pluggable page/row-storage medium a
//! [`crate::Database`] was opened with (`spec.md` §6 open calls).

use crate::error::Result;
use crate::rowstore::file::{FilePageStore, FileRowStore, SharedPageStore};
use crate::rowstore::kv::{indexed, local_kv};
use crate::rowstore::memory::MemoryRowStore;
use crate::rowstore::RowStore;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

/// The medium new table heaps are carved out of. Held once by the
/// [`crate::catalog::Catalog`] and consulted whenever a table is created.
#[derive(Clone)]
pub enum StoreBackend {
    /// Pure in-memory tables; nothing survives process exit.
    Memory,
    /// A single page file shared by every table, addressed by heap
    /// root-page-id.
    File(SharedPageStore<FilePageStore>),
    /// Browser `localStorage`, namespaced per table by name.
    LocalKv(String),
    /// Browser indexed storage, namespaced per table by name.
    Indexed(String),
}

impl StoreBackend {
    /// Open the file backend, materializing `dir/db` as the shared page
    /// file (`spec.md` §6).
    pub fn file(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let pages = FilePageStore::open(&dir.join("db"))?;
        Ok(StoreBackend::File(SharedPageStore(Rc::new(RefCell::new(pages)))))
    }

    /// Allocate a fresh heap for a newly created table and return its row
    /// store plus the `heap_page_id` to record in `__dbTables`.
    pub fn new_heap(&self, table_name: &str) -> Result<(Box<dyn RowStore>, u64)> {
        match self {
            StoreBackend::Memory => Ok((Box::new(MemoryRowStore::new()), 0)),
            StoreBackend::File(pages) => {
                let store = FileRowStore::create(pages.clone())?;
                let root = store.root_page_id();
                Ok((Box::new(store), root))
            }
            StoreBackend::LocalKv(prefix) => {
                let store = local_kv(format!("{prefix}/{table_name}"))?;
                Ok((Box::new(store), 0))
            }
            StoreBackend::Indexed(name) => {
                let store = indexed(format!("{name}/{table_name}"))?;
                Ok((Box::new(store), 0))
            }
        }
    }

    /// Reattach to an already-allocated heap (reopening after a restart).
    pub fn open_heap(&self, table_name: &str, heap_page_id: u64) -> Result<Box<dyn RowStore>> {
        match self {
            StoreBackend::Memory => Ok(Box::new(MemoryRowStore::new())),
            StoreBackend::File(pages) => {
                Ok(Box::new(FileRowStore::open(pages.clone(), heap_page_id)))
            }
            StoreBackend::LocalKv(prefix) => Ok(Box::new(local_kv(format!("{prefix}/{table_name}"))?)),
            StoreBackend::Indexed(name) => Ok(Box::new(indexed(format!("{name}/{table_name}"))?)),
        }
    }
}
