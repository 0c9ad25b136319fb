//! PaulDB: an embeddable relational database — a query execution engine
//! over a B-tree-indexed heap row store (`spec.md` §1-§2).
//!
//! The crate is organized bottom-up: [`value`] and [`record`] describe the
//! data model; [`rowstore`] and [`btree`] are the storage layer; [`table`]
//! and [`catalog`] give that storage typed, multi-table structure;
//! [`expr`], [`agg`] and [`plan`] are the query layer built over it;
//! [`seq`] is the lazy sequence shared between every layer. This module is
//! the host-facing surface (`spec.md` §6): open/close a [`Database`], get a
//! [`Model`] of its tables, and run plans against it.

pub mod agg;
pub mod backend;
pub mod btree;
pub mod catalog;
pub mod error;
pub mod expr;
pub mod plan;
pub mod record;
pub mod rowstore;
pub mod seq;
pub mod table;
mod util;
pub mod value;

use crate::backend::StoreBackend;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::plan::{PlanContext, PlanNode, TableScan};
use crate::record::Record;
use crate::seq::MultiRow;
use crate::table::TableHandle;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

/// Options for [`Database::file`] (`spec.md` §6 `file(dir, {create})`).
/// Currently a single flag: whether a missing database directory should be
/// bootstrapped rather than treated as an error. Kept as a struct, not a
/// bare `bool` parameter, so further open-time knobs can land without
/// breaking callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Create the database directory/file if it does not already exist.
    pub create: bool,
}

/// A row returned from [`Model::query`], unwrapped per `spec.md` §6: a
/// single-table result (the plan's outermost row was `{ "$0": row }`) comes
/// back as `Single`; anything else — a join's multi-table row, an aliased
/// single table — comes back as `Multi` with its alias map intact.
#[derive(Debug, Clone)]
pub enum QueryRow {
    /// The unwrapped row of a plan whose sole output alias was `"$0"`.
    Single(Rc<Record>),
    /// The raw alias-to-row map, for any other shape.
    Multi(MultiRow),
}

const ANONYMOUS_ALIAS: &str = "$0";

fn unwrap_row(row: MultiRow) -> QueryRow {
    if row.len() == 1 {
        if let Some(record) = row.get(ANONYMOUS_ALIAS) {
            return QueryRow::Single(record.clone());
        }
    }
    QueryRow::Multi(row)
}

/// A handle to an open database: the catalog plus the backend it was
/// opened against. `Clone` is cheap (an `Rc` bump) and every clone shares
/// the same open tables, matching the single-process, single-threaded
/// resource model (`spec.md` §5).
#[derive(Clone)]
pub struct Database {
    catalog: Rc<Catalog>,
}

impl Database {
    async fn with_backend(backend: StoreBackend) -> Result<Database> {
        let catalog = Catalog::open(backend).await?;
        Ok(Database { catalog: Rc::new(catalog) })
    }

    /// Open a pure in-memory database; nothing survives process exit.
    pub async fn in_memory() -> Result<Database> {
        Self::with_backend(StoreBackend::Memory).await
    }

    /// Open against browser `localStorage`, namespaced under `prefix`.
    pub async fn local_kv(prefix: impl Into<String>) -> Result<Database> {
        Self::with_backend(StoreBackend::LocalKv(prefix.into())).await
    }

    /// Open against browser indexed storage, namespaced under `name`.
    pub async fn indexed(name: impl Into<String>) -> Result<Database> {
        Self::with_backend(StoreBackend::Indexed(name.into())).await
    }

    /// Open the file backend, materializing `dir/db` as a paged store
    /// (`spec.md` §6). `options.create` is implied true: a missing file is
    /// always bootstrapped, since `StoreBackend::file` itself creates the
    /// directory; the flag exists for forward compatibility with stricter
    /// open modes.
    pub async fn file(dir: impl Into<PathBuf>, _options: OpenOptions) -> Result<Database> {
        let backend = StoreBackend::file(dir)?;
        Self::with_backend(backend).await
    }

    /// Release file handles and flush the row store; after this, every
    /// open [`TableHandle`] fails with [`error::Error::Dropped`]
    /// (`spec.md` §6 "explicit `shutdown()`").
    pub fn shutdown(&self) {
        self.catalog.shutdown();
    }

    /// Check every invariant from `spec.md` §8 (index/table consistency,
    /// B-tree order) over every table opened this session.
    #[cfg(feature = "verify")]
    pub async fn verify(&self) -> Result<()> {
        self.catalog.verify().await
    }

    /// A [`Model`] scoped to `db`: a cache of already-opened table handles
    /// plus the `$query`/`$subscribe` surface (`spec.md` §6 `get_model`).
    pub fn get_model(&self, db: impl Into<String>) -> Model {
        Model {
            catalog: self.catalog.clone(),
            db: db.into(),
            tables: RefCell::new(FxHashMap::default()),
        }
    }
}

/// A named collection of table handles within one [`Database`], plus the
/// query surface run against them (`spec.md` §6 `get_model`).
pub struct Model {
    catalog: Rc<Catalog>,
    db: String,
    tables: RefCell<FxHashMap<String, Rc<TableHandle>>>,
}

impl Model {
    /// Resolve `name` to its table handle, opening (and, if `create` is
    /// true, creating) it against `schema` on first use.
    pub async fn table(&self, name: &str, schema: Rc<record::Schema>, create: bool) -> Result<Rc<TableHandle>> {
        if let Some(handle) = self.tables.borrow().get(name) {
            return Ok(handle.clone());
        }
        let handle = self.catalog.open_table(&self.db, name, schema, create).await?;
        self.tables.borrow_mut().insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Run `plan` to completion and return its rows, each unwrapped per
    /// `spec.md` §6 (`$query(plan)`).
    pub async fn query(&self, plan: Rc<dyn PlanNode>) -> Result<Vec<QueryRow>> {
        let ctx = PlanContext { catalog: &*self.catalog };
        let rows = plan.execute(ctx).to_vec().await?;
        Ok(rows.into_iter().map(unwrap_row).collect())
    }

    /// Register `handler` against every table `plan` reads from, so it
    /// fires after any commit to one of them (`spec.md` §6 `$subscribe`,
    /// §2 "`subscribe(handler)` registers a callback invoked after any
    /// `commit`"). Tables are opened (not created) as a side effect of
    /// discovering them, exactly as `$query` would open them to execute.
    pub async fn subscribe(&self, plan: Rc<dyn PlanNode>, handler: Rc<dyn Fn()>) -> Result<()> {
        for (db, table, schema) in collect_table_scans(plan.as_ref()) {
            let handle = self.catalog.open_table(&db, &table, schema, false).await?;
            handle.subscribe(handler.clone());
        }
        Ok(())
    }

    /// Migrate `name` to `new_schema`, streaming every live row through
    /// `transform` (`spec.md` §4.4 schema migration). The table's cached
    /// handle is dropped in favor of the new one, same as a fresh
    /// [`Model::table`] open after the fact would see.
    pub async fn migrate_table(
        &self,
        name: &str,
        new_schema: Rc<record::Schema>,
        transform: impl Fn(Record) -> Record,
    ) -> Result<Rc<TableHandle>> {
        let handle = self.catalog.migrate_table(&self.db, name, new_schema, transform).await?;
        self.tables.borrow_mut().insert(name.to_string(), handle.clone());
        Ok(handle)
    }
}

/// Walk `node` and its children, collecting `(db, table, schema)` for every
/// `TableScan` leaf (`$subscribe`'s mechanism: a plan only changes when one
/// of the tables it scans changes, so subscribing to those tables' commits
/// is sufficient — joins, filters and aggregations over them have no
/// commit hook of their own).
fn collect_table_scans(node: &dyn PlanNode) -> Vec<(String, String, Rc<record::Schema>)> {
    let mut out = Vec::new();
    collect_table_scans_into(node, &mut out);
    out
}

fn collect_table_scans_into(node: &dyn PlanNode, out: &mut Vec<(String, String, Rc<record::Schema>)>) {
    if let Some(scan) = node.as_any().downcast_ref::<TableScan>() {
        out.push((scan.db.clone(), scan.table.clone(), scan.schema.clone()));
    }
    for child in node.children() {
        collect_table_scans_into(child.as_ref(), out);
    }
}
