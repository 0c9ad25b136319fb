//! File-backed paged heap row store (`spec.md` §4.2, §6).
//!
//! Rows are packed into fixed-size pages: a 16-byte header
//! `(next_page_id, slot_count, free_space_offset)` followed by a slot
//! directory (`(payload_offset, payload_len)` pairs, 8 bytes each, growing
//! forward from the header) and variable-width payloads growing backward
//! from the end of the page. A row-id encodes its physical location as
//! `(page_id << 32) | slot_index`, so the heap needs no separate row-id
//! index — the classic trade-off being that `set` can only grow a row
//! within its own page.
//!
//! The page I/O itself is abstracted behind [`PageStore`], generalizing the
//! `Storage` trait's seek/read/write/commit shape to page granularity; a
//! [`FilePageStore`] backs it with `std::fs::File` exactly as a single-file
//! `Storage` implementation would, and [`MemoryPageStore`] is the same
//! abstraction over a `Vec` of pages, used in tests and by the in-process
//! heap variants.

use super::{RowId, RowStore};
use crate::error::{Error, Result};
use crate::util;
use async_trait::async_trait;
use futures::stream::{self, LocalBoxStream, StreamExt};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Page size in bytes for every heap page.
pub const PAGE_SIZE: usize = 4096;
const HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 8;

/// Interface for a medium that stores fixed-size pages, addressed by an
/// opaque, monotonically assigned `u64` id.
pub trait PageStore {
    /// Read the page at `page_id`. Pages never written return all-zero
    /// bytes.
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>>;

    /// Overwrite the page at `page_id`.
    fn write_page(&mut self, page_id: u64, data: &[u8]) -> Result<()>;

    /// Allocate and zero a fresh page, returning its id.
    fn alloc_page(&mut self) -> Result<u64>;
}

/// `PageStore` over a single `std::fs::File`, page `i` at byte offset
/// `i * PAGE_SIZE`.
pub struct FilePageStore {
    file: RefCell<fs::File>,
    page_count: Cell<u64>,
}

impl FilePageStore {
    /// Open (creating if absent) the page file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(FilePageStore {
            file: RefCell::new(file),
            page_count: Cell::new(len / PAGE_SIZE as u64),
        })
    }
}

impl PageStore for FilePageStore {
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        if page_id < self.page_count.get() {
            let mut f = self.file.borrow_mut();
            f.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
            f.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn write_page(&mut self, page_id: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        {
            let mut f = self.file.borrow_mut();
            f.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
            f.write_all(data)?;
        }
        if page_id >= self.page_count.get() {
            self.page_count.set(page_id + 1);
        }
        Ok(())
    }

    fn alloc_page(&mut self) -> Result<u64> {
        let id = self.page_count.get();
        self.write_page(id, &vec![0u8; PAGE_SIZE])?;
        Ok(id)
    }
}

/// `PageStore` over an in-process `Vec`, used by the in-memory heap variant
/// and by tests that want heap semantics without a file.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Vec<Vec<u8>>,
}

impl PageStore for MemoryPageStore {
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        Ok(self
            .pages
            .get(page_id as usize)
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE]))
    }

    fn write_page(&mut self, page_id: u64, data: &[u8]) -> Result<()> {
        let idx = page_id as usize;
        if idx >= self.pages.len() {
            self.pages.resize(idx + 1, vec![0u8; PAGE_SIZE]);
        }
        self.pages[idx] = data.to_vec();
        Ok(())
    }

    fn alloc_page(&mut self) -> Result<u64> {
        let id = self.pages.len() as u64;
        self.write_page(id, &vec![0u8; PAGE_SIZE])?;
        Ok(id)
    }
}

#[derive(Clone, Copy)]
struct PageMeta {
    slot_count: u32,
    free_space_offset: u32,
    next_page_id: u64,
}

impl PageMeta {
    fn fresh() -> Self {
        PageMeta {
            slot_count: 0,
            free_space_offset: PAGE_SIZE as u32,
            next_page_id: 0,
        }
    }

    fn from_page(page: &[u8]) -> Self {
        let next_page_id = util::getu64(page, 0);
        let slot_count = util::getu32(page, 8);
        let free_space_offset = util::getu32(page, 12);
        if free_space_offset == 0 {
            PageMeta::fresh()
        } else {
            PageMeta {
                slot_count,
                free_space_offset,
                next_page_id,
            }
        }
    }

    fn write_into(&self, page: &mut [u8]) {
        util::setu64(page, 0, self.next_page_id);
        util::setu32(page, 8, self.slot_count);
        util::setu32(page, 12, self.free_space_offset);
    }

    fn free_bytes(&self) -> usize {
        self.free_space_offset as usize - (HEADER_LEN + self.slot_count as usize * SLOT_LEN)
    }
}

fn slot_offset(slot: u32) -> usize {
    HEADER_LEN + slot as usize * SLOT_LEN
}

fn make_row_id(page_id: u64, slot: u32) -> RowId {
    (page_id << 32) | slot as u64
}

fn split_row_id(id: RowId) -> (u64, u32) {
    (id >> 32, (id & 0xffff_ffff) as u32)
}

/// Location a staged write will land at once committed.
#[derive(Clone, Copy)]
struct Placement {
    page_id: u64,
    slot: u32,
    offset: u32,
}

/// `RowStore` over a paged heap, generic over the page medium.
pub struct FileRowStore<P: PageStore> {
    pages: P,
    root_page_id: u64,
    tail_page_id: Cell<u64>,
    meta_cache: RefCell<FxHashMap<u64, PageMeta>>,
    dirty: FxHashMap<RowId, Vec<u8>>,
    placements: FxHashMap<RowId, Placement>,
    tombstones: HashSet<RowId>,
    dropped: bool,
}

impl<P: PageStore> FileRowStore<P> {
    /// Attach a heap rooted at `root_page_id` (already allocated by the
    /// catalog and recorded in `__dbTables`).
    pub fn open(pages: P, root_page_id: u64) -> Self {
        FileRowStore {
            pages,
            root_page_id,
            tail_page_id: Cell::new(root_page_id),
            meta_cache: RefCell::new(FxHashMap::default()),
            dirty: FxHashMap::default(),
            placements: FxHashMap::default(),
            tombstones: HashSet::default(),
            dropped: false,
        }
    }

    /// Allocate a fresh heap's root page and attach to it.
    pub fn create(mut pages: P) -> Result<Self> {
        let root = pages.alloc_page()?;
        Ok(FileRowStore::open(pages, root))
    }

    /// The root page-id of this heap, as recorded in `__dbTables`.
    pub fn root_page_id(&self) -> u64 {
        self.root_page_id
    }

    fn check_dropped(&self) -> Result<()> {
        if self.dropped {
            Err(Error::Dropped)
        } else {
            Ok(())
        }
    }

    fn meta_for(&self, page_id: u64) -> Result<PageMeta> {
        if let Some(m) = self.meta_cache.borrow().get(&page_id) {
            return Ok(*m);
        }
        let page = self.pages.read_page(page_id)?;
        let meta = PageMeta::from_page(&page);
        self.meta_cache.borrow_mut().insert(page_id, meta);
        Ok(meta)
    }

    /// Reserve `len` bytes of payload space, walking/allocating pages from
    /// the tail of the heap chain.
    fn reserve(&mut self, len: usize) -> Result<Placement> {
        let mut page_id = self.tail_page_id.get();
        loop {
            let mut meta = self.meta_for(page_id)?;
            if meta.free_bytes() >= SLOT_LEN + len {
                let slot = meta.slot_count;
                meta.slot_count += 1;
                meta.free_space_offset -= len as u32;
                let offset = meta.free_space_offset;
                self.meta_cache.borrow_mut().insert(page_id, meta);
                self.tail_page_id.set(page_id);
                return Ok(Placement {
                    page_id,
                    slot,
                    offset,
                });
            }
            if meta.next_page_id != 0 {
                page_id = meta.next_page_id;
                continue;
            }
            let new_id = self.pages.alloc_page()?;
            meta.next_page_id = new_id;
            self.meta_cache.borrow_mut().insert(page_id, meta);
            self.meta_cache.borrow_mut().insert(new_id, PageMeta::fresh());
            page_id = new_id;
        }
    }

    /// Reserve `len` bytes of payload space within `page_id` for an existing
    /// slot (used by `set`, which must keep a row's `(page, slot)` fixed —
    /// only the slot directory's `(offset, len)` entry moves). The old
    /// payload becomes dead space until compaction, same trade-off the
    /// B-tree's `remove` documents.
    fn reserve_in_page(&mut self, page_id: u64, slot: u32, len: usize) -> Result<Placement> {
        let mut meta = self.meta_for(page_id)?;
        if meta.free_bytes() < len {
            return Err(Error::Codec(format!(
                "row grew beyond page {page_id}'s remaining capacity"
            )));
        }
        meta.free_space_offset -= len as u32;
        let offset = meta.free_space_offset;
        self.meta_cache.borrow_mut().insert(page_id, meta);
        Ok(Placement {
            page_id,
            slot,
            offset,
        })
    }

    fn read_committed(&self, id: RowId) -> Result<Option<Vec<u8>>> {
        let (page_id, slot) = split_row_id(id);
        let page = self.pages.read_page(page_id)?;
        let meta = PageMeta::from_page(&page);
        if slot >= meta.slot_count {
            return Ok(None);
        }
        let so = slot_offset(slot);
        let offset = util::getu32(&page, so) as usize;
        let len = util::getu32(&page, so + 4) as usize;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(page[offset..offset + len].to_vec()))
    }

    fn iterate_committed(&self) -> Result<Vec<(RowId, Vec<u8>)>> {
        let mut rows = Vec::new();
        let mut page_id = self.root_page_id;
        loop {
            let page = self.pages.read_page(page_id)?;
            let meta = PageMeta::from_page(&page);
            for slot in 0..meta.slot_count {
                let so = slot_offset(slot);
                let offset = util::getu32(&page, so) as usize;
                let len = util::getu32(&page, so + 4) as usize;
                if len > 0 {
                    rows.push((make_row_id(page_id, slot), page[offset..offset + len].to_vec()));
                }
            }
            if meta.next_page_id == 0 {
                break;
            }
            page_id = meta.next_page_id;
        }
        Ok(rows)
    }
}

#[async_trait(?Send)]
impl<P: PageStore> RowStore for FileRowStore<P> {
    async fn insert(&mut self, bytes: Vec<u8>) -> Result<RowId> {
        self.check_dropped()?;
        let placement = self.reserve(bytes.len())?;
        let id = make_row_id(placement.page_id, placement.slot);
        self.tombstones.remove(&id);
        self.placements.insert(id, placement);
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
        self.read_committed(id)
    }

    async fn set(&mut self, id: RowId, bytes: Vec<u8>) -> Result<()> {
        self.check_dropped()?;
        let (page_id, slot) = split_row_id(id);
        let placement = self.reserve_in_page(page_id, slot, bytes.len())?;
        self.tombstones.remove(&id);
        self.placements.insert(id, placement);
        self.dirty.insert(id, bytes);
        Ok(())
    }

    async fn remove(&mut self, id: RowId) -> Result<()> {
        self.check_dropped()?;
        self.dirty.remove(&id);
        self.placements.remove(&id);
        self.tombstones.insert(id);
        Ok(())
    }

    fn iterate(&self) -> LocalBoxStream<'_, (RowId, Vec<u8>)> {
        let mut rows = self.iterate_committed().unwrap_or_default();
        rows.retain(|(id, _)| !self.tombstones.contains(id) && !self.dirty.contains_key(id));
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
        let removed = self.tombstones.len();
        let written = self.dirty.len();
        tracing::debug!(removed, written, "committing row store");
        for id in self.tombstones.drain() {
            let (page_id, slot) = split_row_id(id);
            let mut page = self.pages.read_page(page_id)?;
            let so = slot_offset(slot);
            util::setu32(&mut page, so, 0);
            util::setu32(&mut page, so + 4, 0);
            self.pages.write_page(page_id, &page)?;
        }
        let placements = std::mem::take(&mut self.placements);
        for (id, bytes) in self.dirty.drain() {
            let placement = placements
                .get(&id)
                .expect("every dirty row has a reserved placement");
            let mut page = self.pages.read_page(placement.page_id)?;
            let so = slot_offset(placement.slot);
            util::setu32(&mut page, so, placement.offset);
            util::setu32(&mut page, so + 4, bytes.len() as u32);
            page[placement.offset as usize..placement.offset as usize + bytes.len()]
                .copy_from_slice(&bytes);
            self.pages.write_page(placement.page_id, &page)?;
        }
        for (page_id, meta) in self.meta_cache.borrow_mut().drain() {
            let mut page = self.pages.read_page(page_id)?;
            meta.write_into(&mut page);
            self.pages.write_page(page_id, &page)?;
        }
        Ok(())
    }

    async fn drop_store(&mut self) -> Result<()> {
        self.dropped = true;
        Ok(())
    }
}

/// Shares one [`PageStore`] across several heaps (several tables' worth of
/// [`FileRowStore`]s backed by the same physical file), the same way a
/// single `Storage` is shared across the tables in the teacher's design —
/// but via `Rc<RefCell<_>>` rather than `Mutex`, matching this crate's
/// single-threaded ownership model.
pub struct SharedPageStore<P: PageStore>(pub std::rc::Rc<RefCell<P>>);

impl<P: PageStore> Clone for SharedPageStore<P> {
    fn clone(&self) -> Self {
        SharedPageStore(self.0.clone())
    }
}

impl<P: PageStore> PageStore for SharedPageStore<P> {
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        self.0.borrow().read_page(page_id)
    }
    fn write_page(&mut self, page_id: u64, data: &[u8]) -> Result<()> {
        self.0.borrow_mut().write_page(page_id, data)
    }
    fn alloc_page(&mut self) -> Result<u64> {
        self.0.borrow_mut().alloc_page()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn round_trips_through_memory_pages() {
        let mut store = FileRowStore::create(MemoryPageStore::default()).unwrap();
        let id = store.insert(b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(b"hello".to_vec()));
        store.commit().await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn spans_multiple_pages_when_full() {
        let mut store = FileRowStore::create(MemoryPageStore::default()).unwrap();
        let big = vec![7u8; PAGE_SIZE - HEADER_LEN - SLOT_LEN - 8];
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.insert(big.clone()).await.unwrap());
        }
        store.commit().await.unwrap();
        for id in ids {
            assert_eq!(store.get(id).await.unwrap(), Some(big.clone()));
        }
    }

    #[tokio::test]
    async fn remove_tombstones_across_commit() {
        let mut store = FileRowStore::create(MemoryPageStore::default()).unwrap();
        let a = store.insert(b"a".to_vec()).await.unwrap();
        let b = store.insert(b"b".to_vec()).await.unwrap();
        store.commit().await.unwrap();
        store.remove(a).await.unwrap();
        store.commit().await.unwrap();
        assert_eq!(store.get(a).await.unwrap(), None);
        assert_eq!(store.get(b).await.unwrap(), Some(b"b".to_vec()));
        let rows: Vec<_> = store.iterate().collect().await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap");
        let root;
        let id;
        {
            let pages = FilePageStore::open(&path).unwrap();
            let mut store = FileRowStore::create(pages).unwrap();
            root = store.root_page_id;
            id = store.insert(b"durable".to_vec()).await.unwrap();
            store.commit().await.unwrap();
        }
        {
            let pages = FilePageStore::open(&path).unwrap();
            let store = FileRowStore::open(pages, root);
            assert_eq!(store.get(id).await.unwrap(), Some(b"durable".to_vec()));
        }
    }
}
