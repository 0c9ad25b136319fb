//! Table Handle (`spec.md` §4.5): typed insert/lookup/scan/update/remove
//! over a single user table, maintaining its indexes.

use crate::btree::{ArenaNodeList, BTree, RangeBound};
use crate::error::{Error, Result};
use crate::record::{Record, RecordCodec, Schema};
use crate::rowstore::{RowId, RowStore};
use crate::value::{SerialType, Value};
use futures::stream::{self, LocalBoxStream, StreamExt};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Index {
    tree: BTree<ArenaNodeList>,
    /// Synthetic storage id, assigned only once the index is first
    /// materialized (`spec.md` §4.4 `getIndexStoragePageId`).
    storage_id: u64,
}

/// Typed handle over one user table's rows and indexes.
pub struct TableHandle {
    schema: Rc<Schema>,
    codec: RecordCodec,
    rows: RefCell<Box<dyn RowStore>>,
    indexes: RefCell<std::collections::HashMap<String, Index>>,
    next_index_storage_id: Cell<u64>,
    /// Per-column next value for any `serial` column, mirroring
    /// `next_index_storage_id`'s lazy-allocation pattern. Lazily seeded on
    /// first use from the highest value already stored.
    serial_counters: RefCell<std::collections::HashMap<String, u32>>,
    dropped: Rc<Cell<bool>>,
    subscribers: RefCell<Vec<Rc<dyn Fn()>>>,
}

impl TableHandle {
    /// Wrap a freshly opened row store under `schema`.
    pub fn new(schema: Rc<Schema>, rows: Box<dyn RowStore>) -> Result<Rc<TableHandle>> {
        let codec = RecordCodec::new(&schema)?;
        Ok(Rc::new(TableHandle {
            schema,
            codec,
            rows: RefCell::new(rows),
            indexes: RefCell::new(std::collections::HashMap::new()),
            next_index_storage_id: Cell::new(1),
            serial_counters: RefCell::new(std::collections::HashMap::new()),
            dropped: Rc::new(Cell::new(false)),
            subscribers: RefCell::new(Vec::new()),
        }))
    }

    /// This table's schema.
    pub fn schema(&self) -> &Rc<Schema> {
        &self.schema
    }

    /// Mark this handle dropped; every subsequent call fails with
    /// [`Error::Dropped`] (`spec.md` §4.4 migration).
    pub fn mark_dropped(&self) {
        self.dropped.set(true);
    }

    fn check_dropped(&self) -> Result<()> {
        if self.dropped.get() {
            Err(Error::Dropped)
        } else {
            Ok(())
        }
    }

    /// Synthetic storage id for `column`'s index, or `None` if it has not
    /// been materialized yet (no value has been inserted into it).
    pub fn index_storage_id(&self, column: &str) -> Option<u64> {
        self.indexes.borrow().get(column).map(|i| i.storage_id)
    }

    fn ensure_index(&self, column: &str) {
        let mut indexes = self.indexes.borrow_mut();
        if indexes.contains_key(column) {
            return;
        }
        let col = self.schema.column(column).expect("indexed column exists in schema");
        let storage_id = self.next_index_storage_id.get();
        self.next_index_storage_id.set(storage_id + 1);
        indexes.insert(
            column.to_string(),
            Index {
                tree: BTree::new(ArenaNodeList::default(), 32, col.ty.clone()),
                storage_id,
            },
        );
    }

    fn notify(&self) {
        for handler in self.subscribers.borrow().iter() {
            handler();
        }
    }

    /// Register `handler` to be invoked after every commit.
    pub fn subscribe(&self, handler: Rc<dyn Fn()>) {
        self.subscribers.borrow_mut().push(handler);
    }

    /// Fill in any omitted `serial` column with the next value of its
    /// per-table sequence (`spec.md` §3 `serial`, §4.5).
    async fn assign_serials(&self, record: &mut Record) -> Result<()> {
        for col in &self.schema.columns {
            if col.is_stored() && col.ty.as_any().is::<SerialType>() && !record.contains_key(&col.name) {
                let next = self.next_serial(&col.name).await?;
                record.insert(col.name.clone(), Value::U32(next));
            }
        }
        Ok(())
    }

    /// Next value of `column`'s serial sequence, lazily seeded from the
    /// highest value already stored so a reopened or migrated table
    /// resumes above any row already present.
    async fn next_serial(&self, column: &str) -> Result<u32> {
        if let Some(n) = self.serial_counters.borrow().get(column).copied() {
            self.serial_counters.borrow_mut().insert(column.to_string(), n + 1);
            return Ok(n);
        }
        let mut max = 0u32;
        let mut stream = self.rows.borrow().iterate();
        while let Some((_, bytes)) = stream.next().await {
            let record = self.codec.decode(&self.schema, &bytes)?;
            if let Some(Value::U32(v)) = record.get(column) {
                max = max.max(*v);
            }
        }
        let next = max + 1;
        self.serial_counters.borrow_mut().insert(column.to_string(), next + 1);
        Ok(next)
    }

    /// Validate, persist and index a new record. Returns the assigned
    /// row-id.
    pub async fn insert(&self, mut record: Record) -> Result<RowId> {
        self.check_dropped()?;
        self.assign_serials(&mut record).await?;
        let record = self.schema.materialize_for_insert(record)?;
        let mut full = record.clone();
        self.schema.fill_computed(&mut full);

        for col in &self.schema.columns {
            if col.unique {
                if let Some(v) = full.get(&col.name) {
                    if let Some(idx) = self.indexes.borrow().get(&col.name) {
                        if idx.tree.has(v) {
                            return Err(Error::UniqueViolation {
                                index: col.name.clone(),
                            });
                        }
                    }
                }
            }
        }

        let bytes = self.codec.encode(&self.schema, &record)?;
        let row_id = self.rows.borrow_mut().insert(bytes).await?;

        for col in &self.schema.columns {
            if col.needs_index() {
                if let Some(v) = full.get(&col.name) {
                    self.ensure_index(&col.name);
                    self.indexes
                        .borrow_mut()
                        .get_mut(&col.name)
                        .unwrap()
                        .tree
                        .insert(v.clone(), row_id)?;
                }
            }
        }

        self.rows.borrow_mut().commit().await?;
        self.notify();
        tracing::debug!(schema = self.schema.id, row_id, "row inserted");
        Ok(row_id)
    }

    async fn materialize(&self, bytes: &[u8]) -> Result<Record> {
        let mut record = self.codec.decode(&self.schema, bytes)?;
        self.schema.fill_computed(&mut record);
        Ok(record)
    }

    async fn fetch(&self, row_id: RowId) -> Result<Option<Record>> {
        let bytes = self.rows.borrow().get(row_id).await?;
        match bytes {
            Some(b) => Ok(Some(self.materialize(&b).await?)),
            None => Ok(None),
        }
    }

    /// Resolve `column`'s index (or a filtered full scan if unindexed) and
    /// materialize matching records in iteration order.
    pub async fn lookup(&self, column: &str, value: &Value) -> Result<Vec<Record>> {
        self.check_dropped()?;
        let row_ids = {
            let indexes = self.indexes.borrow();
            indexes.get(column).map(|idx| idx.tree.get(value))
        };
        match row_ids {
            Some(row_ids) => {
                let mut out = Vec::new();
                for row_id in row_ids {
                    if let Some(r) = self.fetch(row_id).await? {
                        out.push(r);
                    }
                }
                Ok(out)
            }
            None => self.scan_where(column, value).await,
        }
    }

    /// `lookup` for a unique column: at most one result.
    pub async fn lookup_unique(&self, column: &str, value: &Value) -> Result<Option<Record>> {
        Ok(self.lookup(column, value).await?.into_iter().next())
    }

    /// `lookup_unique`, failing with [`Error::NotFound`] when absent.
    pub async fn lookup_unique_or_throw(&self, column: &str, value: &Value) -> Result<Record> {
        self.lookup_unique(column, value).await?.ok_or(Error::NotFound)
    }

    /// Merge `patch` over the row located by `column = value`, re-validate,
    /// and repair every affected index entry.
    pub async fn update_where(&self, column: &str, value: &Value, patch: Record) -> Result<()> {
        self.check_dropped()?;
        let row_id = {
            let matches = self.lookup_row_ids(column, value).await?;
            match matches.into_iter().next() {
                Some(id) => id,
                None => return Ok(()),
            }
        };
        let old_bytes = self
            .rows
            .borrow()
            .get(row_id)
            .await?
            .ok_or(Error::NotFound)?;
        let old_record = self.codec.decode(&self.schema, &old_bytes)?;
        let mut old_full = old_record.clone();
        self.schema.fill_computed(&mut old_full);

        let new_record = self.schema.materialize_for_update(&old_record, patch)?;
        let mut new_full = new_record.clone();
        self.schema.fill_computed(&mut new_full);

        for col in &self.schema.columns {
            if !col.needs_index() {
                continue;
            }
            let old_v = old_full.get(&col.name);
            let new_v = new_full.get(&col.name);
            let unchanged = matches!((old_v, new_v), (Some(a), Some(b)) if col.ty.equal(a, b));
            if unchanged {
                continue;
            }
            self.ensure_index(&col.name);
            let mut indexes = self.indexes.borrow_mut();
            let idx = indexes.get_mut(&col.name).unwrap();
            if let Some(v) = old_v {
                idx.tree.remove(v, row_id)?;
            }
            if let Some(v) = new_v {
                idx.tree.insert(v.clone(), row_id)?;
            }
        }

        let new_bytes = self.codec.encode(&self.schema, &new_record)?;
        self.rows.borrow_mut().set(row_id, new_bytes).await?;
        self.rows.borrow_mut().commit().await?;
        self.notify();
        tracing::debug!(schema = self.schema.id, row_id, "row updated");
        Ok(())
    }

    async fn lookup_row_ids(&self, column: &str, value: &Value) -> Result<Vec<RowId>> {
        let indexed = self.indexes.borrow().get(column).map(|idx| idx.tree.get(value));
        if let Some(row_ids) = indexed {
            return Ok(row_ids);
        }
        let col = self.schema.column(column).expect("column exists");
        let mut out = Vec::new();
        let mut stream = self.rows.borrow().iterate();
        while let Some((row_id, bytes)) = stream.next().await {
            let mut record = self.codec.decode(&self.schema, &bytes)?;
            self.schema.fill_computed(&mut record);
            if let Some(v) = record.get(&col.name) {
                if col.ty.equal(v, value) {
                    out.push(row_id);
                }
            }
        }
        Ok(out)
    }

    /// Remove a row and every index entry derived from it.
    pub async fn remove(&self, row_id: RowId) -> Result<()> {
        self.check_dropped()?;
        let bytes = match self.rows.borrow().get(row_id).await? {
            Some(b) => b,
            None => return Ok(()),
        };
        let mut record = self.codec.decode(&self.schema, &bytes)?;
        self.schema.fill_computed(&mut record);

        self.rows.borrow_mut().remove(row_id).await?;
        for col in &self.schema.columns {
            if col.needs_index() {
                if let (Some(v), Some(idx)) = (record.get(&col.name), self.indexes.borrow_mut().get_mut(&col.name)) {
                    idx.tree.remove(v, row_id)?;
                }
            }
        }
        self.rows.borrow_mut().commit().await?;
        self.notify();
        tracing::debug!(schema = self.schema.id, row_id, "row removed");
        Ok(())
    }

    /// Materialize every live row, in row-store iteration order, as a
    /// `'static` stream decoupled from any `Ref` borrow of the row store.
    /// The underlying `(row_id, bytes)` pairs are drained eagerly on first
    /// poll (the row store's own `iterate` is borrow-scoped to `&self` and
    /// can't be held across the `await` points a truly lazy decode would
    /// need); decoding into `Record`s still happens one row at a time.
    pub fn iterate(self: &Rc<Self>) -> LocalBoxStream<'static, Result<Record>> {
        let this = self.clone();
        Box::pin(stream::unfold(
            (this, None::<LocalBoxStream<'static, (RowId, Vec<u8>)>>),
            |(this, cursor)| async move {
                let mut cursor = match cursor {
                    Some(c) => c,
                    None => {
                        let rows: Vec<(RowId, Vec<u8>)> = this.rows.borrow().iterate().collect().await;
                        stream::iter(rows).boxed_local()
                    }
                };
                let next = cursor.next().await;
                next.map(|(_row_id, bytes)| {
                    let record = this.materialize_sync(&bytes);
                    (record, (this.clone(), Some(cursor)))
                })
            },
        ))
    }

    fn materialize_sync(&self, bytes: &[u8]) -> Result<Record> {
        let mut record = self.codec.decode(&self.schema, bytes)?;
        self.schema.fill_computed(&mut record);
        Ok(record)
    }

    /// Filtered full scan used when `column` has no index.
    pub async fn scan_where(&self, column: &str, value: &Value) -> Result<Vec<Record>> {
        let col = self.schema.column(column).expect("column exists");
        let mut out = Vec::new();
        let mut stream = self.rows.borrow().iterate();
        while let Some((_row_id, bytes)) = stream.next().await {
            let r = self.materialize(&bytes).await?;
            if let Some(v) = r.get(&col.name) {
                if col.ty.equal(v, value) {
                    out.push(r);
                }
            }
        }
        Ok(out)
    }

    /// Ordered range scan over `column`'s index (used by plan operators
    /// that can push a range predicate down to an index).
    pub fn range(&self, column: &str, bound: &RangeBound) -> Vec<(Value, Vec<RowId>)> {
        match self.indexes.borrow().get(column) {
            Some(idx) => idx.tree.range(bound),
            None => Vec::new(),
        }
    }

    /// Check invariant 1 (`spec.md` §8: every indexed column's `(value,
    /// row-id)` pairs match the table) and invariant 2 (B-tree order/
    /// balance, via each index's own `BTree::verify`) for this table.
    #[cfg(feature = "verify")]
    pub async fn verify(&self) -> Result<()> {
        let mut rows = Vec::new();
        let mut stream = self.rows.borrow().iterate();
        while let Some((row_id, bytes)) = stream.next().await {
            rows.push((row_id, self.materialize_sync(&bytes)?));
        }

        for col in &self.schema.columns {
            if !col.needs_index() {
                continue;
            }
            let indexes = self.indexes.borrow();
            let idx = match indexes.get(&col.name) {
                Some(idx) => idx,
                None => continue,
            };
            idx.tree.verify()?;

            let mut expected: Vec<(RowId, Value)> = rows
                .iter()
                .filter_map(|(row_id, r)| r.get(&col.name).map(|v| (*row_id, v.clone())))
                .collect();
            let mut actual: Vec<(RowId, Value)> = idx
                .tree
                .range(&RangeBound::default())
                .into_iter()
                .flat_map(|(v, ids)| ids.into_iter().map(move |id| (id, v.clone())))
                .collect();
            expected.sort_by_key(|(row_id, _)| *row_id);
            actual.sort_by_key(|(row_id, _)| *row_id);

            let consistent = expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(actual.iter())
                    .all(|((er, ev), (ar, av))| er == ar && col.ty.equal(ev, av));
            if !consistent {
                return Err(Error::InvalidRecord {
                    column: col.name.clone(),
                    reason: "index out of sync with table rows".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;
    use crate::rowstore::memory::MemoryRowStore;
    use crate::value::{StringType, U32Type};

    fn users_schema() -> Rc<Schema> {
        Rc::new(
            Schema::new(
                1,
                0,
                vec![
                    Column::new("id", Rc::new(U32Type)).unique(),
                    Column::new("name", Rc::new(StringType)),
                ],
                0,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_then_lookup_unique() {
        let table = TableHandle::new(users_schema(), Box::new(MemoryRowStore::new())).unwrap();
        assert!(table.index_storage_id("id").is_none());
        table
            .insert(Record::from_pairs([
                ("id", Value::U32(1)),
                ("name", Value::str("Mr. Blue")),
            ]))
            .await
            .unwrap();
        assert!(table.index_storage_id("id").is_some());
        let found = table.lookup_unique("id", &Value::U32(1)).await.unwrap().unwrap();
        assert!(matches!(found.get("name"), Some(Value::Str(s)) if s.as_str() == "Mr. Blue"));
    }

    #[tokio::test]
    async fn duplicate_unique_value_rejected() {
        let table = TableHandle::new(users_schema(), Box::new(MemoryRowStore::new())).unwrap();
        table
            .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("a"))]))
            .await
            .unwrap();
        let err = table
            .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("b"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn remove_clears_index_entry() {
        let table = TableHandle::new(users_schema(), Box::new(MemoryRowStore::new())).unwrap();
        let id = table
            .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("a"))]))
            .await
            .unwrap();
        table.remove(id).await.unwrap();
        assert!(table.lookup_unique("id", &Value::U32(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn operations_fail_after_dropped() {
        let table = TableHandle::new(users_schema(), Box::new(MemoryRowStore::new())).unwrap();
        table.mark_dropped();
        let err = table
            .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("a"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dropped));
    }
}
