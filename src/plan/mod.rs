//! Query Plan Operators (`spec.md` §4.7): a tree of lazy, composable nodes
//! that execute against a [`Catalog`] and produce a [`RowSequence`] of
//! [`MultiRow`]s. RustDB has no counterpart at this level — its `compile.rs`
//! lowers SQL straight to bytecode — so this tree is grounded instead on the
//! streaming-operator shape other production crates use for query execution
//! (one node per physical operator, `execute` building a lazy stream over
//! its children), generalizing the evaluation style `expr.rs` already keeps
//! from RustDB's `run::EvalEnv`.

use crate::agg::{Acc, AggRef, Aggregation};
use crate::btree::{ArenaNodeList, BTree};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::expr::{Expr, ExprContext, ExprRef};
use crate::record::{Record, Schema};
use crate::seq::{single_row, MultiRow, RowSequence};
use crate::value::{Type, TypeRef, Value};
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Everything a plan node needs to execute: a catalog handle to resolve
/// table scans and sub-queries against.
#[derive(Clone, Copy)]
pub struct PlanContext<'a> {
    pub catalog: &'a Catalog,
}

/// A node in the query plan tree.
pub trait PlanNode: fmt::Debug {
    /// Human-readable rendering, for plan printing.
    fn describe(&self) -> String;

    /// JSON rendering, for plan printing/persistence.
    fn to_json(&self) -> serde_json::Value;

    /// Immediate child nodes, for plan tree traversal/printing.
    fn children(&self) -> Vec<Rc<dyn PlanNode>>;

    /// Build the lazy sequence of rows this node produces. Building must not
    /// itself pull rows; only iterating the returned sequence does
    /// (`spec.md` §4.9 back-pressure).
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_>;

    /// Narrow a `dyn PlanNode` back to its concrete type (used by
    /// `$subscribe` to find the `TableScan` leaves of an arbitrary plan).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Wrap an async computation of a whole result set as a single-use
/// [`RowSequence`]. Every operator below except `TableScan`, `Filter`,
/// `Select` and `Limit` needs the full child output before it can produce
/// anything (sort, join, group), so they all settle on this shape: resolve
/// everything inside one future, then replay it as a stream.
fn once_rows<'a>(fut: impl std::future::Future<Output = Result<Vec<Result<MultiRow>>>> + 'a) -> RowSequence<'a> {
    RowSequence::new(
        stream::once(fut)
            .map(|result| match result {
                Ok(rows) => stream::iter(rows).boxed_local(),
                Err(e) => stream::iter(vec![Err(e)]).boxed_local(),
            })
            .flatten()
            .boxed_local(),
    )
}

fn merge_rows(a: &MultiRow, b: &MultiRow) -> MultiRow {
    let mut out = a.clone();
    for (k, v) in b.iter() {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Scans all live rows of a table in insertion order (`table.rs`'s
/// `iterate()` already guarantees this), emitting `{ alias: record }`.
#[derive(Debug)]
pub struct TableScan {
    pub db: String,
    pub table: String,
    pub alias: String,
    pub schema: Rc<Schema>,
}

impl TableScan {
    pub fn new(db: impl Into<String>, table: impl Into<String>, alias: impl Into<String>, schema: Rc<Schema>) -> Rc<Self> {
        Rc::new(TableScan {
            db: db.into(),
            table: table.into(),
            alias: alias.into(),
            schema,
        })
    }
}

impl PlanNode for TableScan {
    fn describe(&self) -> String {
        format!("TableScan({}.{} as {})", self.db, self.table, self.alias)
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "tableScan", "db": self.db, "table": self.table, "alias": self.alias })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let db = self.db.clone();
        let table = self.table.clone();
        let alias = self.alias.clone();
        let schema = self.schema.clone();
        let catalog = ctx.catalog;
        once_rows(async move {
            tracing::debug!(db = %db, table = %table, alias = %alias, "table scan");
            let handle = catalog.open_table(&db, &table, schema, false).await?;
            let mut out = Vec::new();
            let mut stream = handle.iterate();
            while let Some(record) = stream.next().await {
                out.push(record.map(|rec| single_row(alias.clone(), rec)));
            }
            tracing::debug!(rows = out.len(), "table scan complete");
            Ok(out)
        })
    }
}

/// Yields rows for which `predicate` resolves to `true`.
#[derive(Debug)]
pub struct Filter {
    pub child: Rc<dyn PlanNode>,
    pub predicate: ExprRef,
}

impl PlanNode for Filter {
    fn describe(&self) -> String {
        format!("Filter({}, {})", self.child.describe(), self.predicate.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "filter", "child": self.child.to_json(), "predicate": self.predicate.to_json() })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let predicate = self.predicate.clone();
        self.child.execute(ctx).filter(move |row| {
            let predicate = predicate.clone();
            let row = row.clone();
            async move {
                let ectx = ExprContext { catalog, row: &row };
                match predicate.resolve(&ectx).await? {
                    Value::Bool(b) => Ok(b),
                    other => Err(Error::TypeMismatch(format!("filter predicate must be boolean, found {other:?}"))),
                }
            }
        })
    }
}

/// One output column of a [`Select`]: `name` in the computed alias, `expr`
/// the expression producing its value.
#[derive(Debug, Clone)]
pub struct SelectColumn {
    pub name: String,
    pub expr: ExprRef,
}

/// Computes `columns` once per input row, emitting `{ alias: { ... } }`.
#[derive(Debug)]
pub struct Select {
    pub child: Rc<dyn PlanNode>,
    pub alias: String,
    pub columns: Vec<SelectColumn>,
}

impl PlanNode for Select {
    fn describe(&self) -> String {
        let cols: Vec<String> = self.columns.iter().map(|c| format!("{}: {}", c.name, c.expr.describe())).collect();
        format!("Select({}, {} as {{{}}})", self.child.describe(), self.alias, cols.join(", "))
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "select",
            "child": self.child.to_json(),
            "alias": self.alias,
            "columns": self.columns.iter().map(|c| serde_json::json!({"name": c.name, "expr": c.expr.to_json()})).collect::<Vec<_>>(),
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let alias = self.alias.clone();
        let columns = self.columns.clone();
        self.child.execute(ctx).map(move |row| {
            let alias = alias.clone();
            let columns = columns.clone();
            async move {
                let mut out = Record::new();
                let ectx = ExprContext { catalog, row: &row };
                for col in &columns {
                    out.insert(col.name.clone(), col.expr.resolve(&ectx).await?);
                }
                Ok(single_row(alias, out))
            }
        })
    }
}

/// Yields the first `n` rows, never pulling the `n+1`th from the child.
#[derive(Debug)]
pub struct Limit {
    pub child: Rc<dyn PlanNode>,
    pub n: usize,
}

impl PlanNode for Limit {
    fn describe(&self) -> String {
        format!("Limit({}, {})", self.child.describe(), self.n)
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "limit", "child": self.child.to_json(), "n": self.n })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        self.child.execute(ctx).take(self.n)
    }
}

/// One sort key of an [`OrderBy`].
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: ExprRef,
    pub descending: bool,
}

/// Buffers the child, resolves each sort key once per row, sorts stably
/// (ties keep insertion order), emits in sorted order.
#[derive(Debug)]
pub struct OrderBy {
    pub child: Rc<dyn PlanNode>,
    pub keys: Vec<SortKey>,
}

impl PlanNode for OrderBy {
    fn describe(&self) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|k| format!("{}{}", k.expr.describe(), if k.descending { " DESC" } else { "" }))
            .collect();
        format!("OrderBy({}, [{}])", self.child.describe(), keys.join(", "))
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "orderBy",
            "child": self.child.to_json(),
            "keys": self.keys.iter().map(|k| serde_json::json!({"expr": k.expr.to_json(), "descending": k.descending})).collect::<Vec<_>>(),
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let child = self.child.clone();
        let keys = self.keys.clone();
        once_rows(async move {
            let rows = child.execute(PlanContext { catalog }).to_vec().await?;
            let mut keyed = Vec::with_capacity(rows.len());
            for (i, row) in rows.into_iter().enumerate() {
                let ectx = ExprContext { catalog, row: &row };
                let mut key_values = Vec::with_capacity(keys.len());
                for k in &keys {
                    key_values.push(k.expr.resolve(&ectx).await?);
                }
                keyed.push((i, key_values, row));
            }
            keyed.sort_by(|a, b| {
                for (idx, k) in keys.iter().enumerate() {
                    let ty = k.expr.get_type();
                    let c = ty.compare(&a.1[idx], &b.1[idx]);
                    let c = if k.descending { c.reverse() } else { c };
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.0.cmp(&b.0)
            });
            Ok(keyed.into_iter().map(|(_, _, row)| Ok(row)).collect())
        })
    }
}

/// Nested-loops join: materializes both sides (right reused across left
/// rows), emits merged rows where `predicate` holds.
#[derive(Debug)]
pub struct Join {
    pub left: Rc<dyn PlanNode>,
    pub right: Rc<dyn PlanNode>,
    pub predicate: ExprRef,
}

impl PlanNode for Join {
    fn describe(&self) -> String {
        format!("Join({}, {}, {})", self.left.describe(), self.right.describe(), self.predicate.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "join",
            "left": self.left.to_json(),
            "right": self.right.to_json(),
            "predicate": self.predicate.to_json(),
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.left.clone(), self.right.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let left = self.left.clone();
        let right = self.right.clone();
        let predicate = self.predicate.clone();
        once_rows(async move {
            let left_rows = left.execute(PlanContext { catalog }).to_vec().await?;
            let right_rows = right.execute(PlanContext { catalog }).to_vec().await?;
            tracing::debug!(left_rows = left_rows.len(), right_rows = right_rows.len(), "join");
            let mut out = Vec::new();
            for l in &left_rows {
                for r in &right_rows {
                    let merged = merge_rows(l, r);
                    let ectx = ExprContext { catalog, row: &merged };
                    if let Value::Bool(true) = predicate.resolve(&ectx).await? {
                        out.push(Ok(merged));
                    }
                }
            }
            tracing::debug!(rows_out = out.len(), "join complete");
            Ok(out)
        })
    }
}

/// Same as [`Join`], but a left row matching no right row is emitted alone:
/// every right-aliased `ColumnRef` then sees an absent table and resolves to
/// NULL (the caller is expected to have built those column references over
/// the right schema's nullable form, per `spec.md` §4.7).
#[derive(Debug)]
pub struct LeftJoin {
    pub left: Rc<dyn PlanNode>,
    pub right: Rc<dyn PlanNode>,
    pub predicate: ExprRef,
}

impl PlanNode for LeftJoin {
    fn describe(&self) -> String {
        format!("LeftJoin({}, {}, {})", self.left.describe(), self.right.describe(), self.predicate.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "leftJoin",
            "left": self.left.to_json(),
            "right": self.right.to_json(),
            "predicate": self.predicate.to_json(),
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.left.clone(), self.right.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let left = self.left.clone();
        let right = self.right.clone();
        let predicate = self.predicate.clone();
        once_rows(async move {
            let left_rows = left.execute(PlanContext { catalog }).to_vec().await?;
            let right_rows = right.execute(PlanContext { catalog }).to_vec().await?;
            tracing::debug!(left_rows = left_rows.len(), right_rows = right_rows.len(), "left join");
            let mut out = Vec::new();
            for l in &left_rows {
                let mut matched = false;
                for r in &right_rows {
                    let merged = merge_rows(l, r);
                    let ectx = ExprContext { catalog, row: &merged };
                    if let Value::Bool(true) = predicate.resolve(&ectx).await? {
                        matched = true;
                        out.push(Ok(merged));
                    }
                }
                if !matched {
                    out.push(Ok(l.clone()));
                }
            }
            tracing::debug!(rows_out = out.len(), "left join complete");
            Ok(out)
        })
    }
}

/// Composite key type for [`GroupBy`]'s group index: compares each tuple
/// position against that column's own resolved type, unlike
/// `value::ArrayType`, which repeats a single element type across every
/// position.
#[derive(Debug)]
struct GroupKeyType(Vec<TypeRef>);

impl Type for GroupKeyType {
    fn type_name(&self) -> String {
        "group_key".to_string()
    }
    fn is_valid(&self, v: &Value) -> bool {
        match v {
            Value::Array(items) => items.len() == self.0.len() && items.iter().zip(&self.0).all(|(item, ty)| ty.is_valid(item)),
            _ => false,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Array(xs), Value::Array(ys)) => {
                for ((x, y), ty) in xs.iter().zip(ys.iter()).zip(&self.0) {
                    let c = ty.compare(x, y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                Ordering::Equal
            }
            _ => Ordering::Equal,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Maintains one accumulator per distinct group-key tuple, looked up through
/// an in-memory [`BTree`] keyed by the resolved group-key tuple
/// (`spec.md` §4.7). The first row for a key seeds its accumulators;
/// emission order is insertion order of groups, not key order — the tree
/// only resolves a tuple to its group index, it is never iterated.
#[derive(Debug)]
pub struct GroupBy {
    pub child: Rc<dyn PlanNode>,
    pub group_keys: Vec<(String, ExprRef)>,
    pub aggregations: Vec<(String, AggRef)>,
    pub alias: String,
}

impl PlanNode for GroupBy {
    fn describe(&self) -> String {
        let keys: Vec<&str> = self.group_keys.iter().map(|(n, _)| n.as_str()).collect();
        let aggs: Vec<String> = self.aggregations.iter().map(|(n, a)| format!("{n}: {}", a.describe())).collect();
        format!("GroupBy({}, [{}], {{{}}} as {})", self.child.describe(), keys.join(", "), aggs.join(", "), self.alias)
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "groupBy",
            "child": self.child.to_json(),
            "groupKeys": self.group_keys.iter().map(|(n, e)| serde_json::json!({"name": n, "expr": e.to_json()})).collect::<Vec<_>>(),
            "aggregations": self.aggregations.iter().map(|(n, a)| serde_json::json!({"name": n, "agg": a.to_json()})).collect::<Vec<_>>(),
            "alias": self.alias,
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let child = self.child.clone();
        let group_keys = self.group_keys.clone();
        let aggregations = self.aggregations.clone();
        let alias = self.alias.clone();
        once_rows(async move {
            let rows = child.execute(PlanContext { catalog }).to_vec().await?;
            let key_type: TypeRef = Rc::new(GroupKeyType(group_keys.iter().map(|(_, e)| e.get_type()).collect()));
            let mut index = BTree::new(ArenaNodeList::default(), 32, key_type);
            let mut groups: Vec<(Vec<Value>, Vec<Option<Acc>>)> = Vec::new();
            for row in &rows {
                let ectx = ExprContext { catalog, row };
                let mut key = Vec::with_capacity(group_keys.len());
                for (_, expr) in &group_keys {
                    key.push(expr.resolve(&ectx).await?);
                }
                let key_value = Value::array(key.clone());
                let existing = index.get(&key_value).first().copied();
                let idx = match existing {
                    Some(i) => i as usize,
                    None => {
                        groups.push((key, (0..aggregations.len()).map(|_| None).collect()));
                        let i = groups.len() - 1;
                        index.insert(key_value, i as u64)?;
                        i
                    }
                };
                for (i, (_, agg)) in aggregations.iter().enumerate() {
                    let acc = match groups[idx].1[i].take() {
                        Some(acc) => acc,
                        None => agg.init()?,
                    };
                    groups[idx].1[i] = Some(agg.update(acc, &ectx).await?);
                }
            }
            tracing::debug!(rows_in = rows.len(), groups = groups.len(), "group by complete");
            let mut out = Vec::with_capacity(groups.len());
            for (key, accs) in groups {
                let mut record = Record::new();
                for ((name, _), value) in group_keys.iter().zip(key.into_iter()) {
                    record.insert(name.clone(), value);
                }
                for ((name, agg), acc) in aggregations.iter().zip(accs.into_iter()) {
                    let acc = acc.expect("every group seeds every aggregation on its first row");
                    record.insert(name.clone(), agg.result(acc)?);
                }
                out.push(Ok(single_row(alias.clone(), record)));
            }
            Ok(out)
        })
    }
}

/// `GroupBy` with no group keys: always emits exactly one row, seeded
/// before any child row arrives so an empty child still produces a result
/// (e.g. `count(*)` over zero rows is `0`, not an empty sequence).
#[derive(Debug)]
pub struct Aggregate {
    pub child: Rc<dyn PlanNode>,
    pub aggregations: Vec<(String, AggRef)>,
    pub alias: String,
}

impl PlanNode for Aggregate {
    fn describe(&self) -> String {
        let aggs: Vec<String> = self.aggregations.iter().map(|(n, a)| format!("{n}: {}", a.describe())).collect();
        format!("Aggregate({}, {{{}}} as {})", self.child.describe(), aggs.join(", "), self.alias)
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "aggregate",
            "child": self.child.to_json(),
            "aggregations": self.aggregations.iter().map(|(n, a)| serde_json::json!({"name": n, "agg": a.to_json()})).collect::<Vec<_>>(),
            "alias": self.alias,
        })
    }
    fn children(&self) -> Vec<Rc<dyn PlanNode>> {
        vec![self.child.clone()]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn execute(&self, ctx: PlanContext<'_>) -> RowSequence<'_> {
        let catalog = ctx.catalog;
        let child = self.child.clone();
        let aggregations = self.aggregations.clone();
        let alias = self.alias.clone();
        once_rows(async move {
            let rows = child.execute(PlanContext { catalog }).to_vec().await?;
            let mut accs: Vec<Option<Acc>> = aggregations
                .iter()
                .map(|(_, a)| a.init().map(Some))
                .collect::<Result<_>>()?;
            for row in &rows {
                let ectx = ExprContext { catalog, row };
                for (i, (_, agg)) in aggregations.iter().enumerate() {
                    let acc = accs[i].take().expect("seeded above");
                    accs[i] = Some(agg.update(acc, &ectx).await?);
                }
            }
            tracing::debug!(rows_in = rows.len(), "aggregate complete");
            let mut record = Record::new();
            for ((name, agg), acc) in aggregations.iter().zip(accs.into_iter()) {
                record.insert(name.clone(), agg.result(acc.expect("seeded above"))?);
            }
            Ok(vec![Ok(single_row(alias, record))])
        })
    }
}
