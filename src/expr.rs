//! Expression Tree (`spec.md` §4.6): a closed set of node kinds, each
//! resolved against a multi-table row. RustDB's `expr.rs`/`compile.rs` are a
//! SQL-AST-to-bytecode compiler (out of scope); this module keeps the same
//! *evaluation* shape — the tree-walking interpreter RustDB's `run::EvalEnv`
//! implements one level down, at the bytecode level — without a VM, since
//! every node here is already typed at construction time.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::plan::PlanNode;
use crate::record::Column;
use crate::record::ColumnKind;
use crate::seq::MultiRow;
use crate::value::{ArrayType, BoolType, Type, TypeRef, Value};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::rc::Rc;

/// Everything an expression needs to resolve against: the current
/// multi-table row and a catalog handle for sub-queries.
pub struct ExprContext<'a> {
    pub catalog: &'a Catalog,
    pub row: &'a MultiRow,
}

/// A node in the expression tree.
#[async_trait(?Send)]
pub trait Expr: fmt::Debug {
    /// Evaluate this node against `ctx`.
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value>;

    /// The type this node's `resolve` produces.
    fn get_type(&self) -> TypeRef;

    /// Human-readable rendering, for plan printing.
    fn describe(&self) -> String;

    /// JSON rendering, for plan printing/persistence.
    fn to_json(&self) -> serde_json::Value;
}

/// Shared handle to an expression node.
pub type ExprRef = Rc<dyn Expr>;

/// Reads `ctx.row[table_alias][column.name]`.
#[derive(Debug)]
pub struct ColumnRef {
    pub table_alias: String,
    pub column: Column,
}

impl ColumnRef {
    pub fn new(table_alias: impl Into<String>, column: Column) -> ExprRef {
        Rc::new(ColumnRef {
            table_alias: table_alias.into(),
            column,
        })
    }
}

#[async_trait(?Send)]
impl Expr for ColumnRef {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        match ctx.row.get(&self.table_alias) {
            Some(record) => match record.get(&self.column.name) {
                Some(v) => Ok(v.clone()),
                None => match &self.column.kind {
                    ColumnKind::Computed(f) => Ok(f(record)),
                    ColumnKind::Stored => Err(Error::invalid_record(&self.column.name, "missing value")),
                },
            },
            None => {
                if self.column.ty.is_valid(&Value::Null) {
                    Ok(Value::Null)
                } else {
                    Err(Error::TypeMismatch(format!(
                        "table `{}` absent (outer join non-match) and column `{}` is not nullable",
                        self.table_alias, self.column.name
                    )))
                }
            }
        }
    }

    fn get_type(&self) -> TypeRef {
        self.column.ty.clone()
    }

    fn describe(&self) -> String {
        format!("{}.{}", self.table_alias, self.column.name)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "columnRef", "table": self.table_alias, "column": self.column.name })
    }
}

/// A constant value of a known type.
#[derive(Debug)]
pub struct Literal {
    value: Value,
    ty: TypeRef,
}

impl Literal {
    pub fn new(value: Value, ty: TypeRef) -> Result<ExprRef> {
        if !ty.is_valid(&value) {
            return Err(Error::TypeMismatch(format!(
                "literal {value:?} is not a valid {}",
                ty.type_name()
            )));
        }
        Ok(Rc::new(Literal { value, ty }))
    }
}

#[async_trait(?Send)]
impl Expr for Literal {
    async fn resolve(&self, _ctx: &ExprContext<'_>) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn get_type(&self) -> TypeRef {
        self.ty.clone()
    }

    fn describe(&self) -> String {
        format!("{:?}", self.value)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "literal", "type": self.ty.type_name() })
    }
}

/// Logical negation.
#[derive(Debug)]
pub struct Not(pub ExprRef);

#[async_trait(?Send)]
impl Expr for Not {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        match self.0.resolve(ctx).await? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(Error::TypeMismatch(format!("NOT expects boolean, found {other:?}"))),
        }
    }
    fn get_type(&self) -> TypeRef {
        Rc::new(BoolType)
    }
    fn describe(&self) -> String {
        format!("NOT ({})", self.0.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "not", "operand": self.0.to_json() })
    }
}

/// `AND` / `OR`, per `spec.md` §4.6 neither side short-circuits.
#[derive(Debug, Clone, Copy)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug)]
pub struct AndOr {
    pub op: BoolOp,
    pub left: ExprRef,
    pub right: ExprRef,
}

#[async_trait(?Send)]
impl Expr for AndOr {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        let (l, r) = (self.left.resolve(ctx).await?, self.right.resolve(ctx).await?);
        match (l, r) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match self.op {
                BoolOp::And => a && b,
                BoolOp::Or => a || b,
            })),
            (a, b) => Err(Error::TypeMismatch(format!("AND/OR expects booleans, found {a:?}, {b:?}"))),
        }
    }
    fn get_type(&self) -> TypeRef {
        Rc::new(BoolType)
    }
    fn describe(&self) -> String {
        let op = match self.op {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
        };
        format!("({} {} {})", self.left.describe(), op, self.right.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        let op = match self.op {
            BoolOp::And => "and",
            BoolOp::Or => "or",
        };
        serde_json::json!({ "kind": op, "left": self.left.to_json(), "right": self.right.to_json() })
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
pub struct Compare {
    pub left: ExprRef,
    pub op: CompareOp,
    pub right: ExprRef,
}

#[async_trait(?Send)]
impl Expr for Compare {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        let (lv, rv) = (self.left.resolve(ctx).await?, self.right.resolve(ctx).await?);
        let lty = self.left.get_type();
        let rty = self.right.get_type();
        if !lty.is_valid(&rv) || !rty.is_valid(&lv) {
            return Err(Error::TypeMismatch(format!(
                "cannot compare {} to {}",
                lty.type_name(),
                rty.type_name()
            )));
        }
        let result = match self.op {
            CompareOp::Eq => lty.equal(&lv, &rv),
            CompareOp::Ne => !lty.equal(&lv, &rv),
            CompareOp::Lt => lty.compare(&lv, &rv) == std::cmp::Ordering::Less,
            CompareOp::Le => lty.compare(&lv, &rv) != std::cmp::Ordering::Greater,
            CompareOp::Gt => lty.compare(&lv, &rv) == std::cmp::Ordering::Greater,
            CompareOp::Ge => lty.compare(&lv, &rv) != std::cmp::Ordering::Less,
        };
        Ok(Value::Bool(result))
    }
    fn get_type(&self) -> TypeRef {
        Rc::new(BoolType)
    }
    fn describe(&self) -> String {
        let op = match self.op {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        format!("({} {} {})", self.left.describe(), op, self.right.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "compare", "op": format!("{:?}", self.op), "left": self.left.to_json(), "right": self.right.to_json() })
    }
}

/// True iff `left` equals any of `candidates`.
#[derive(Debug)]
pub struct In {
    pub left: ExprRef,
    pub candidates: Vec<ExprRef>,
}

#[async_trait(?Send)]
impl Expr for In {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        let lv = self.left.resolve(ctx).await?;
        let ty = self.left.get_type();
        for c in &self.candidates {
            let cv = c.resolve(ctx).await?;
            if ty.equal(&lv, &cv) {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }
    fn get_type(&self) -> TypeRef {
        Rc::new(BoolType)
    }
    fn describe(&self) -> String {
        let candidates: Vec<String> = self.candidates.iter().map(|c| c.describe()).collect();
        format!("{} IN ({})", self.left.describe(), candidates.join(", "))
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "in",
            "left": self.left.to_json(),
            "candidates": self.candidates.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
        })
    }
}

/// Returns the first non-null of `exprs`, falling back to `last`.
#[derive(Debug)]
pub struct Coalesce {
    pub exprs: Vec<ExprRef>,
    pub last: ExprRef,
}

#[async_trait(?Send)]
impl Expr for Coalesce {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        for e in &self.exprs {
            let v = e.resolve(ctx).await?;
            if !v.is_null() {
                return Ok(v);
            }
        }
        self.last.resolve(ctx).await
    }
    fn get_type(&self) -> TypeRef {
        self.last.get_type()
    }
    fn describe(&self) -> String {
        let mut parts: Vec<String> = self.exprs.iter().map(|e| e.describe()).collect();
        parts.push(self.last.describe());
        format!("COALESCE({})", parts.join(", "))
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "coalesce",
            "exprs": self.exprs.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
            "last": self.last.to_json(),
        })
    }
}

/// True iff any element of `left` equals any element of `right`, under the
/// array element type's equality.
#[derive(Debug)]
pub struct Overlaps {
    pub left: ExprRef,
    pub right: ExprRef,
}

#[async_trait(?Send)]
impl Expr for Overlaps {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        let (lv, rv) = (self.left.resolve(ctx).await?, self.right.resolve(ctx).await?);
        let elem_ty = array_element_type(&self.left.get_type())?;
        match (lv, rv) {
            (Value::Array(xs), Value::Array(ys)) => {
                let found = xs.iter().any(|x| ys.iter().any(|y| elem_ty.equal(x, y)));
                Ok(Value::Bool(found))
            }
            (lv, rv) => Err(Error::TypeMismatch(format!("OVERLAPS expects arrays, found {lv:?}, {rv:?}"))),
        }
    }
    fn get_type(&self) -> TypeRef {
        Rc::new(BoolType)
    }
    fn describe(&self) -> String {
        format!("({} OVERLAPS {})", self.left.describe(), self.right.describe())
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "overlaps", "left": self.left.to_json(), "right": self.right.to_json() })
    }
}

fn array_element_type(ty: &TypeRef) -> Result<TypeRef> {
    ty.as_any()
        .downcast_ref::<ArrayType>()
        .map(|a| a.0.clone())
        .ok_or_else(|| Error::TypeMismatch(format!("{} is not an array type", ty.type_name())))
}

/// Executes `build(outer_row)` (re-built per call so a correlated reference
/// to the outer row is captured fresh), takes at most 2 rows, and returns
/// the sole cell of the sole row (`spec.md` §4.6 sub-query shape checks).
pub struct SubQuery {
    pub build: Rc<dyn Fn(&MultiRow) -> Rc<dyn PlanNode>>,
    pub result_type: TypeRef,
}

impl fmt::Debug for SubQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubQuery").finish()
    }
}

#[async_trait(?Send)]
impl Expr for SubQuery {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value> {
        let plan = (self.build)(ctx.row);
        let seq = plan.execute(crate::plan::PlanContext { catalog: ctx.catalog });
        let rows = seq.take(2).to_vec().await?;
        if rows.is_empty() {
            return Err(Error::SubQueryShape("sub-query returned no rows"));
        }
        if rows.len() > 1 {
            return Err(Error::SubQueryShape("sub-query returned more than one row"));
        }
        let row = &rows[0];
        let mut cells = row.values().flat_map(|r| r.0.values());
        let first = cells.next().ok_or(Error::SubQueryShape("sub-query row has no columns"))?;
        if cells.next().is_some() || row.values().map(|r| r.0.len()).sum::<usize>() != 1 {
            return Err(Error::SubQueryShape("sub-query row has more than one column"));
        }
        Ok(first.clone())
    }
    fn get_type(&self) -> TypeRef {
        self.result_type.clone()
    }
    fn describe(&self) -> String {
        "SUBQUERY(...)".to_string()
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "subquery" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreBackend;
    use crate::record::{Column as RecColumn, Record};
    use crate::value::{I32Type, StringType, U32Type};

    fn ctx_row() -> MultiRow {
        crate::seq::single_row("t", Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("hi"))]))
    }

    fn column(name: &str, ty: TypeRef) -> RecColumn {
        RecColumn::new(name, ty)
    }

    #[tokio::test]
    async fn column_ref_reads_value() {
        let catalog = Catalog::open(StoreBackend::Memory).await.unwrap();
        let row = ctx_row();
        let ctx = ExprContext { catalog: &catalog, row: &row };
        let expr = ColumnRef::new("t", column("id", Rc::new(U32Type)));
        assert!(matches!(expr.resolve(&ctx).await.unwrap(), Value::U32(1)));
    }

    #[tokio::test]
    async fn column_ref_nulls_on_absent_table_when_nullable() {
        let catalog = Catalog::open(StoreBackend::Memory).await.unwrap();
        let row = ctx_row();
        let ctx = ExprContext { catalog: &catalog, row: &row };
        let expr = ColumnRef::new("missing", column("age", crate::value::nullable(Rc::new(U32Type))));
        assert!(matches!(expr.resolve(&ctx).await.unwrap(), Value::Null));

        let expr = ColumnRef::new("missing", column("age", Rc::new(U32Type)));
        assert!(expr.resolve(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn compare_checks_type_compatibility() {
        let catalog = Catalog::open(StoreBackend::Memory).await.unwrap();
        let row = ctx_row();
        let ctx = ExprContext { catalog: &catalog, row: &row };
        let left = Literal::new(Value::I32(1), Rc::new(I32Type)).unwrap();
        let right = Literal::new(Value::str("x"), Rc::new(StringType)).unwrap();
        let cmp = Compare {
            left,
            op: CompareOp::Eq,
            right,
        };
        assert!(cmp.resolve(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn literal_rejects_invalid_value() {
        assert!(Literal::new(Value::I32(1), Rc::new(StringType)).is_err());
        assert!(Literal::new(Value::str("ok"), Rc::new(StringType)).is_ok());
    }

    #[tokio::test]
    async fn coalesce_picks_first_non_null() {
        let catalog = Catalog::open(StoreBackend::Memory).await.unwrap();
        let row = ctx_row();
        let ctx = ExprContext { catalog: &catalog, row: &row };
        let lit_null = Literal::new(Value::Null, crate::value::nullable(Rc::new(I32Type))).unwrap();
        let lit_val = Literal::new(Value::I32(7), Rc::new(I32Type)).unwrap();
        let c = Coalesce {
            exprs: vec![lit_null],
            last: lit_val,
        };
        assert_eq!(c.get_type().type_name(), "int32");
        assert!(matches!(c.resolve(&ctx).await.unwrap(), Value::I32(7)));
    }

    #[tokio::test]
    async fn overlaps_checks_element_equality() {
        let catalog = Catalog::open(StoreBackend::Memory).await.unwrap();
        let row = ctx_row();
        let ctx = ExprContext { catalog: &catalog, row: &row };
        let arr_ty = crate::value::array(Rc::new(I32Type));
        let left = Literal::new(Value::array(vec![Value::I32(1), Value::I32(2)]), arr_ty.clone()).unwrap();
        let right = Literal::new(Value::array(vec![Value::I32(2), Value::I32(3)]), arr_ty).unwrap();
        let overlaps = Overlaps { left, right };
        assert!(matches!(overlaps.resolve(&ctx).await.unwrap(), Value::Bool(true)));
    }
}
