//! Catalog (`spec.md` §3, §4.4): the five system tables describing every
//! user table, their versioned schemas, columns and indexes. Grounded on
//! RustDB's `sys.rs` (`create_schema`/`create_table`/`create_index` plus the
//! `sys.Table`/`sys.Column`/`sys.Index` system tables), generalized to the
//! five tables this spec names and to the numeric id scheme (Design Note 9a
//! picks numeric over RustDB's other, string-composite, in-source scheme).
//!
//! The catalog is bootstrapped with its own schema, built the same way as
//! any user schema, and read through the same [`TableHandle`] machinery —
//! there is no separate "system table" code path.

use crate::backend::StoreBackend;
use crate::error::{Error, Result};
use crate::record::{Column, Record, Schema};
use crate::rowstore::file::{FilePageStore, PageStore, SharedPageStore, PAGE_SIZE};
use crate::table::TableHandle;
use crate::util::{getu32, getu64, setu32, setu64};
use crate::value::{StringType, U32Type, Value};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const ROOT_MAGIC: u32 = 0x5061_756c; // "Paul"
const ROOT_VERSION: u32 = 1;
const ROOT_PAGE_ID: u64 = 0;

const SYSTEM_TABLE_NAMES: [&str; 5] = [
    "__dbPageIds",
    "__dbTables",
    "__dbSchemas",
    "__dbTableColumns",
    "__dbIndexes",
];

fn page_ids_schema() -> Rc<Schema> {
    Rc::new(
        Schema::new(
            0,
            0,
            vec![
                Column::new("page_type", Rc::new(StringType)).unique(),
                Column::new("page_id", Rc::new(U32Type)),
            ],
            0,
        )
        .unwrap(),
    )
}

fn tables_schema() -> Rc<Schema> {
    Rc::new(
        Schema::new(
            0,
            0,
            vec![
                Column::new("db", Rc::new(StringType)),
                Column::new("table_name", Rc::new(StringType)),
                Column::new("table_id", Rc::new(U32Type)).unique(),
                Column::new("heap_page_id", Rc::new(U32Type)),
            ],
            2,
        )
        .unwrap(),
    )
}

fn schemas_schema() -> Rc<Schema> {
    Rc::new(
        Schema::new(
            0,
            0,
            vec![
                Column::new("schema_id", Rc::new(U32Type)).unique(),
                Column::new("table_id", Rc::new(U32Type)).indexed(),
                Column::new("version", Rc::new(U32Type)),
            ],
            0,
        )
        .unwrap(),
    )
}

fn table_columns_schema() -> Rc<Schema> {
    Rc::new(
        Schema::new(
            0,
            0,
            vec![
                Column::new("column_id", Rc::new(U32Type)).unique(),
                Column::new("schema_id", Rc::new(U32Type)).indexed(),
                Column::new("column_name", Rc::new(StringType)),
                Column::new("type_descriptor", Rc::new(StringType)),
                Column::new("flags", Rc::new(U32Type)),
            ],
            0,
        )
        .unwrap(),
    )
}

fn indexes_schema() -> Rc<Schema> {
    Rc::new(
        Schema::new(
            0,
            0,
            vec![
                Column::new("table_id", Rc::new(U32Type)).indexed(),
                Column::new("index_name", Rc::new(StringType)),
                Column::new("heap_page_id", Rc::new(U32Type)),
            ],
            0,
        )
        .unwrap(),
    )
}

const COLUMN_FLAG_UNIQUE: u32 = 1 << 0;
const COLUMN_FLAG_INDEXED: u32 = 1 << 1;

fn column_flags(col: &Column) -> u32 {
    let mut flags = 0;
    if col.unique {
        flags |= COLUMN_FLAG_UNIQUE;
    }
    if col.indexed {
        flags |= COLUMN_FLAG_INDEXED;
    }
    flags
}

fn schema_for(name: &str) -> Rc<Schema> {
    match name {
        "__dbPageIds" => page_ids_schema(),
        "__dbTables" => tables_schema(),
        "__dbSchemas" => schemas_schema(),
        "__dbTableColumns" => table_columns_schema(),
        "__dbIndexes" => indexes_schema(),
        _ => unreachable!("not a system table name"),
    }
}

/// The catalog: the five system tables plus a registry of user tables
/// opened against them this session.
pub struct Catalog {
    backend: StoreBackend,
    page_ids: Rc<TableHandle>,
    tables: Rc<TableHandle>,
    schemas: Rc<TableHandle>,
    columns: Rc<TableHandle>,
    #[allow(dead_code)]
    indexes: Rc<TableHandle>,
    open_tables: RefCell<FxHashMap<(String, String), Rc<TableHandle>>>,
    next_table_id: Cell<u32>,
    next_schema_id: Cell<u32>,
    next_column_id: Cell<u32>,
}

impl Catalog {
    /// Bootstrap a fresh database or reattach to an existing one.
    pub async fn open(backend: StoreBackend) -> Result<Catalog> {
        let handles = match &backend {
            StoreBackend::File(pages) => Self::open_file_system_tables(&backend, pages.clone()).await?,
            _ => {
                let mut handles = Vec::with_capacity(5);
                for name in SYSTEM_TABLE_NAMES {
                    let store = backend.open_heap(name, 0)?;
                    handles.push(TableHandle::new(schema_for(name), store)?);
                }
                handles
            }
        };
        let [page_ids, tables, schemas, columns, indexes]: [Rc<TableHandle>; 5] =
            handles.try_into().unwrap_or_else(|_| unreachable!());

        let next_table_id = 1 + Self::max_u32(&tables, "table_id").await?;
        let next_schema_id = 1 + Self::max_u32(&schemas, "schema_id").await?;
        let next_column_id = 1 + Self::max_u32(&columns, "column_id").await?;

        Ok(Catalog {
            backend,
            page_ids,
            tables,
            schemas,
            columns,
            indexes,
            open_tables: RefCell::new(FxHashMap::default()),
            next_table_id: Cell::new(next_table_id),
            next_schema_id: Cell::new(next_schema_id),
            next_column_id: Cell::new(next_column_id),
        })
    }

    /// File-backend bootstrap/reopen: the only medium where a system
    /// table's heap root isn't already addressable by a well-known name, so
    /// the reserved root page (`spec.md` §6 "a root page identifies the
    /// catalog") records `__dbPageIds`'s heap root; `__dbPageIds` itself
    /// then records the other four (`spec.md` §6 "this is the only page
    /// whose location is fixed").
    async fn open_file_system_tables(
        backend: &StoreBackend,
        mut pages: SharedPageStore<FilePageStore>,
    ) -> Result<Vec<Rc<TableHandle>>> {
        let root = pages.read_page(ROOT_PAGE_ID)?;
        let fresh = getu32(&root, 0) != ROOT_MAGIC;

        let page_ids_root = if fresh {
            let reserved = pages.alloc_page()?;
            debug_assert_eq!(reserved, ROOT_PAGE_ID, "manifest page must be the first page allocated");
            let (_, page_ids_root) = backend.new_heap("__dbPageIds")?;
            let mut manifest = vec![0u8; PAGE_SIZE];
            setu32(&mut manifest, 0, ROOT_MAGIC);
            setu32(&mut manifest, 4, ROOT_VERSION);
            setu64(&mut manifest, 8, page_ids_root);
            pages.write_page(ROOT_PAGE_ID, &manifest)?;
            page_ids_root
        } else {
            getu64(&root, 8)
        };
        let page_ids = TableHandle::new(page_ids_schema(), backend.open_heap("__dbPageIds", page_ids_root)?)?;

        let mut known_roots: FxHashMap<String, u64> = FxHashMap::default();
        let mut stream = page_ids.iterate();
        while let Some(row) = stream.next().await {
            let row = row?;
            if let (Some(Value::Str(name)), Some(Value::U32(id))) = (row.get("page_type"), row.get("page_id")) {
                known_roots.insert(name.to_string(), *id as u64);
            }
        }

        let mut handles = vec![page_ids.clone()];
        for name in &SYSTEM_TABLE_NAMES[1..] {
            let root = match known_roots.get(*name) {
                Some(id) => *id,
                None => {
                    let (_, new_root) = backend.new_heap(*name)?;
                    page_ids
                        .insert(Record::from_pairs([
                            ("page_type", Value::str(*name)),
                            ("page_id", Value::U32(new_root as u32)),
                        ]))
                        .await?;
                    new_root
                }
            };
            let store = backend.open_heap(*name, root)?;
            handles.push(TableHandle::new(schema_for(name), store)?);
        }
        Ok(handles)
    }

    async fn max_u32(table: &Rc<TableHandle>, column: &str) -> Result<u32> {
        let mut max = 0u32;
        let mut stream = table.iterate();
        while let Some(row) = stream.next().await {
            let row = row?;
            if let Some(Value::U32(v)) = row.get(column) {
                max = max.max(*v);
            }
        }
        Ok(max)
    }

    /// Resolve `(db, table)` to an already-open handle, or create it lazily
    /// against `schema` if `create` is true (`spec.md` §4.4 user-table
    /// resolution).
    pub async fn open_table(
        &self,
        db: &str,
        table: &str,
        schema: Rc<Schema>,
        create: bool,
    ) -> Result<Rc<TableHandle>> {
        let key = (db.to_string(), table.to_string());
        if let Some(handle) = self.open_tables.borrow().get(&key) {
            return Ok(handle.clone());
        }

        if let Some((table_id, heap_page_id)) = self.find_table_row(db, table).await? {
            let rows = self.backend.open_heap(table, heap_page_id as u64)?;
            let schema_id = self.current_schema_id(table_id).await?.unwrap_or(schema.id as u32);
            let schema = Rc::new(Schema {
                id: schema_id as u64,
                ..(*schema).clone()
            });
            let handle = TableHandle::new(schema, rows)?;
            self.open_tables.borrow_mut().insert(key, handle.clone());
            return Ok(handle);
        }

        if !create {
            return Err(Error::TableNotFound(format!("{db}.{table}")));
        }
        let handle = self.create_table_row(db, table, schema).await?;
        self.open_tables.borrow_mut().insert(key, handle.clone());
        Ok(handle)
    }

    async fn create_table_row(&self, db: &str, table: &str, schema: Rc<Schema>) -> Result<Rc<TableHandle>> {
        let table_id = self.next_table_id.get();
        self.next_table_id.set(table_id + 1);
        let (rows, heap_page_id) = self.backend.new_heap(table)?;

        self.tables
            .insert(Record::from_pairs([
                ("db", Value::str(db)),
                ("table_name", Value::str(table)),
                ("table_id", Value::U32(table_id)),
                ("heap_page_id", Value::U32(heap_page_id as u32)),
            ]))
            .await?;

        let schema_id = self.register_schema(table_id, &schema).await?;
        let schema = Rc::new(Schema {
            id: schema_id as u64,
            ..(*schema).clone()
        });
        TableHandle::new(schema, rows)
    }

    async fn register_schema(&self, table_id: u32, schema: &Schema) -> Result<u32> {
        let schema_id = self.next_schema_id.get();
        self.next_schema_id.set(schema_id + 1);
        self.schemas
            .insert(Record::from_pairs([
                ("schema_id", Value::U32(schema_id)),
                ("table_id", Value::U32(table_id)),
                ("version", Value::U32(schema.version)),
            ]))
            .await?;
        for col in schema.stored_columns() {
            let column_id = self.next_column_id.get();
            self.next_column_id.set(column_id + 1);
            self.columns
                .insert(Record::from_pairs([
                    ("column_id", Value::U32(column_id)),
                    ("schema_id", Value::U32(schema_id)),
                    ("column_name", Value::str(col.name.clone())),
                    ("type_descriptor", Value::str(col.ty.type_name())),
                    ("flags", Value::U32(column_flags(col))),
                ]))
                .await?;
        }
        Ok(schema_id)
    }

    async fn find_table_row(&self, db: &str, table: &str) -> Result<Option<(u32, u32)>> {
        let mut stream = self.tables.iterate();
        while let Some(row) = stream.next().await {
            let row = row?;
            if matches!(row.get("db"), Some(Value::Str(s)) if s.as_str() == db)
                && matches!(row.get("table_name"), Some(Value::Str(s)) if s.as_str() == table)
            {
                if let (Some(Value::U32(table_id)), Some(Value::U32(heap_page_id))) =
                    (row.get("table_id"), row.get("heap_page_id"))
                {
                    return Ok(Some((*table_id, *heap_page_id)));
                }
            }
        }
        Ok(None)
    }

    /// Most recent `__dbSchemas` row registered for `table_id`, if any.
    async fn current_schema_id(&self, table_id: u32) -> Result<Option<u32>> {
        let mut best: Option<u32> = None;
        let mut stream = self.schemas.iterate();
        while let Some(row) = stream.next().await {
            let row = row?;
            if matches!(row.get("table_id"), Some(Value::U32(t)) if *t == table_id) {
                if let Some(Value::U32(schema_id)) = row.get("schema_id") {
                    best = Some(best.map_or(*schema_id, |b| b.max(*schema_id)));
                }
            }
        }
        Ok(best)
    }

    /// Migrate `(db, table)` to `new_schema`, streaming every live row
    /// through `transform` into a freshly created table-id, then dropping
    /// the old handle (`spec.md` §4.4 schema migration; per Design Note 9c
    /// the post-migration table gets a fresh table-id and fresh indexes
    /// rather than inheriting the old ones).
    pub async fn migrate_table(
        &self,
        db: &str,
        table: &str,
        new_schema: Rc<Schema>,
        transform: impl Fn(Record) -> Record,
    ) -> Result<Rc<TableHandle>> {
        let key = (db.to_string(), table.to_string());
        let old_handle = self
            .open_tables
            .borrow()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(format!("{db}.{table}")))?;
        let (old_table_id, _) = self
            .find_table_row(db, table)
            .await?
            .ok_or_else(|| Error::TableNotFound(format!("{db}.{table}")))?;

        let new_table_id = self.next_table_id.get();
        self.next_table_id.set(new_table_id + 1);
        let (new_rows, new_heap_page_id) = self.backend.new_heap(table)?;
        let schema_id = self.register_schema(new_table_id, &new_schema).await?;
        let new_schema = Rc::new(Schema {
            id: schema_id as u64,
            ..(*new_schema).clone()
        });
        let new_handle = TableHandle::new(new_schema, new_rows)?;

        let mut stream = old_handle.iterate();
        while let Some(record) = stream.next().await {
            new_handle.insert(transform(record?)).await?;
        }

        self.tables
            .update_where(
                "table_id",
                &Value::U32(old_table_id),
                Record::from_pairs([
                    ("table_id", Value::U32(new_table_id)),
                    ("heap_page_id", Value::U32(new_heap_page_id as u32)),
                ]),
            )
            .await?;

        old_handle.mark_dropped();
        self.open_tables.borrow_mut().insert(key, new_handle.clone());
        Ok(new_handle)
    }

    /// Mark every open table handle dropped, so any handle a caller is still
    /// holding starts rejecting operations (`spec.md` §6 `shutdown()`), the
    /// same signal `migrate_table` sends a superseded handle.
    pub fn shutdown(&self) {
        for handle in self.open_tables.borrow().values() {
            handle.mark_dropped();
        }
    }

    /// Run `TableHandle::verify` over every table opened this session
    /// (`spec.md` §8 invariants 1-2, surfaced as `Database::verify`).
    #[cfg(feature = "verify")]
    pub async fn verify(&self) -> Result<()> {
        let handles: Vec<_> = self.open_tables.borrow().values().cloned().collect();
        for handle in handles {
            handle.verify().await?;
        }
        Ok(())
    }

    /// Storage id for an index, or `None` until its first insert
    /// materializes it (`spec.md` §4.4 `getIndexStoragePageId`).
    pub fn index_storage_id(&self, table: &TableHandle, column: &str) -> Option<u64> {
        table.index_storage_id(column)
    }
}
