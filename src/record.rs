//! Column, Table Schema, Record and the Record Codec (`spec.md` §3, §4.1).

use crate::error::{Error, Result};
use crate::value::{TypeRef, Value};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Whether a column's value is physically stored or derived on read.
#[derive(Clone)]
pub enum ColumnKind {
    /// Persisted in the row's byte encoding.
    Stored,
    /// Derived from the rest of the record; never supplied by the caller,
    /// never present in the stored byte encoding.
    Computed(Rc<dyn Fn(&Record) -> Value>),
}

/// A single column of a [`Schema`].
#[derive(Clone)]
pub struct Column {
    /// Column name, unique within its schema.
    pub name: String,
    /// Column type.
    pub ty: TypeRef,
    /// Whether a unique index must be maintained over this column.
    pub unique: bool,
    /// Whether a (non-unique) index must be maintained over this column.
    pub indexed: bool,
    /// Default-value producer used when the column is missing on insert.
    pub default: Option<Rc<dyn Fn() -> Value>>,
    /// Stored vs. computed.
    pub kind: ColumnKind,
}

impl Column {
    /// A plain stored column with no default, no indexing.
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Column {
            name: name.into(),
            ty,
            unique: false,
            indexed: false,
            default: None,
            kind: ColumnKind::Stored,
        }
    }

    /// Mark this column unique (implies an index is maintained for it).
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark this column indexed (non-unique secondary index).
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Attach a default-value producer.
    pub fn with_default(mut self, f: impl Fn() -> Value + 'static) -> Self {
        self.default = Some(Rc::new(f));
        self
    }

    /// Turn this column into a computed column.
    pub fn computed(mut self, f: impl Fn(&Record) -> Value + 'static) -> Self {
        self.kind = ColumnKind::Computed(Rc::new(f));
        self
    }

    /// True if this column requires a secondary index (unique or not).
    pub fn needs_index(&self) -> bool {
        self.unique || self.indexed
    }

    /// True if this column is persisted in the row encoding.
    pub fn is_stored(&self) -> bool {
        matches!(self.kind, ColumnKind::Stored)
    }
}

/// An ordered, versioned list of columns. Exactly one column is the
/// row-identity key.
#[derive(Clone)]
pub struct Schema {
    /// Catalog-assigned schema id.
    pub id: u64,
    /// Monotonically increasing version; migrations bump it.
    pub version: u32,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Index into `columns` of the row-identity key column.
    pub key_column: usize,
}

impl Schema {
    /// Build a schema, validating unique column names and the key index.
    pub fn new(id: u64, version: u32, columns: Vec<Column>, key_column: usize) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(Error::invalid_record(&c.name, "duplicate column name"));
            }
        }
        if key_column >= columns.len() {
            return Err(Error::invalid_record("<schema>", "key_column out of range"));
        }
        Ok(Schema {
            id,
            version,
            columns,
            key_column,
        })
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Name of the row-identity key column.
    pub fn key_name(&self) -> &str {
        &self.columns[self.key_column].name
    }

    /// Stored (non-computed) columns, in schema order.
    pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_stored())
    }

    /// Apply defaults for missing stored columns, validate every stored
    /// non-nullable column without a default is present and valid, and
    /// reject caller-supplied values for computed columns
    /// (`spec.md` §3 Record invariants 1 and 3).
    pub fn materialize_for_insert(&self, mut input: Record) -> Result<Record> {
        for col in &self.columns {
            match &col.kind {
                ColumnKind::Computed(_) => {
                    if input.contains_key(&col.name) {
                        return Err(Error::invalid_record(
                            &col.name,
                            "computed columns must not be supplied by the caller",
                        ));
                    }
                }
                ColumnKind::Stored => {
                    if !input.contains_key(&col.name) {
                        if let Some(default) = &col.default {
                            input.insert(col.name.clone(), default());
                        } else {
                            return Err(Error::invalid_record(&col.name, "missing value"));
                        }
                    }
                    let v = input.get(&col.name).unwrap();
                    if !col.ty.is_valid(v) {
                        return Err(Error::invalid_record(
                            &col.name,
                            format!("value does not match type {}", col.ty.type_name()),
                        ));
                    }
                }
            }
        }
        Ok(input)
    }

    /// Merge `patch` over `base`, re-validating stored columns
    /// (`updateWhere`, §4.5).
    pub fn materialize_for_update(&self, base: &Record, patch: Record) -> Result<Record> {
        let mut merged = base.clone();
        for (k, v) in patch.into_iter() {
            merged.insert(k, v);
        }
        for col in &self.columns {
            if !col.is_stored() {
                continue;
            }
            let v = merged
                .get(&col.name)
                .ok_or_else(|| Error::invalid_record(&col.name, "missing value"))?;
            if !col.ty.is_valid(v) {
                return Err(Error::invalid_record(
                    &col.name,
                    format!("value does not match type {}", col.ty.type_name()),
                ));
            }
        }
        Ok(merged)
    }

    /// Compute every computed column's value and insert it into `record`.
    pub fn fill_computed(&self, record: &mut Record) {
        let computed: Vec<(String, Value)> = self
            .columns
            .iter()
            .filter_map(|c| match &c.kind {
                ColumnKind::Computed(f) => Some((c.name.clone(), f(record))),
                ColumnKind::Stored => None,
            })
            .collect();
        for (name, value) in computed {
            record.insert(name, value);
        }
    }
}

/// A mapping from column name to value.
#[derive(Clone, Debug, Default)]
pub struct Record(pub FxHashMap<String, Value>);

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Record(FxHashMap::default())
    }

    /// Build a record from `(name, value)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.0.insert(k.into(), v);
        }
        r
    }

    /// Look up a column's value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

impl std::ops::Deref for Record {
    type Target = FxHashMap<String, Value>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl std::ops::DerefMut for Record {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::hash_map::IntoIter<String, Value>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Packs/unpacks the *stored* columns of a [`Schema`] to/from a byte buffer,
/// in column order. A schema is serializable only if every stored column's
/// type carries a codec.
pub struct RecordCodec {
    stored: Vec<usize>,
}

impl RecordCodec {
    /// Build the codec for `schema`, failing if any stored column lacks a
    /// codec.
    pub fn new(schema: &Schema) -> Result<Self> {
        let mut stored = Vec::new();
        for (i, col) in schema.columns.iter().enumerate() {
            if col.is_stored() {
                if col.ty.codec().is_none() {
                    return Err(Error::Codec(format!(
                        "column `{}` of type {} has no codec",
                        col.name,
                        col.ty.type_name()
                    )));
                }
                stored.push(i);
            }
        }
        Ok(RecordCodec { stored })
    }

    /// Encode the stored columns of `record` in schema order.
    pub fn encode(&self, schema: &Schema, record: &Record) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for &i in &self.stored {
            let col = &schema.columns[i];
            let v = record
                .get(&col.name)
                .ok_or_else(|| Error::invalid_record(&col.name, "missing value for encode"))?;
            col.ty.codec().unwrap().write(v, &mut buf)?;
        }
        Ok(buf)
    }

    /// Decode the stored columns from `buf`, leaving computed columns unset
    /// (call [`Schema::fill_computed`] afterwards).
    pub fn decode(&self, schema: &Schema, buf: &[u8]) -> Result<Record> {
        let mut record = Record::new();
        let mut off = 0;
        for &i in &self.stored {
            let col = &schema.columns[i];
            let v = col.ty.codec().unwrap().read(buf, &mut off)?;
            record.insert(col.name.clone(), v);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{I32Type, StringType};

    fn schema() -> Schema {
        Schema::new(
            1,
            0,
            vec![
                Column::new("id", Rc::new(I32Type)),
                Column::new("name", Rc::new(StringType)),
            ],
            0,
        )
        .unwrap()
    }

    #[test]
    fn round_trips_stored_columns() {
        let s = schema();
        let codec = RecordCodec::new(&s).unwrap();
        let rec = Record::from_pairs([("id", Value::I32(7)), ("name", Value::str("hi"))]);
        let bytes = codec.encode(&s, &rec).unwrap();
        let back = codec.decode(&s, &bytes).unwrap();
        assert!(matches!(back.get("id"), Some(Value::I32(7))));
        assert!(matches!(back.get("name"), Some(Value::Str(s)) if s.as_str() == "hi"));
    }

    #[test]
    fn materialize_for_insert_applies_defaults() {
        let s = Schema::new(
            1,
            0,
            vec![
                Column::new("id", Rc::new(I32Type)),
                Column::new("count", Rc::new(I32Type)).with_default(|| Value::I32(0)),
            ],
            0,
        )
        .unwrap();
        let input = Record::from_pairs([("id", Value::I32(1))]);
        let materialized = s.materialize_for_insert(input).unwrap();
        assert!(matches!(materialized.get("count"), Some(Value::I32(0))));
    }

    #[test]
    fn materialize_for_insert_rejects_computed_input() {
        let s = Schema::new(
            1,
            0,
            vec![
                Column::new("id", Rc::new(I32Type)),
                Column::new("doubled", Rc::new(I32Type)).computed(|r| match r.get("id") {
                    Some(Value::I32(x)) => Value::I32(x * 2),
                    _ => Value::Null,
                }),
            ],
            0,
        )
        .unwrap();
        let input = Record::from_pairs([("id", Value::I32(1)), ("doubled", Value::I32(2))]);
        assert!(s.materialize_for_insert(input).is_err());
    }

    #[test]
    fn fill_computed_derives_value() {
        let s = Schema::new(
            1,
            0,
            vec![
                Column::new("id", Rc::new(I32Type)),
                Column::new("doubled", Rc::new(I32Type)).computed(|r| match r.get("id") {
                    Some(Value::I32(x)) => Value::I32(x * 2),
                    _ => Value::Null,
                }),
            ],
            0,
        )
        .unwrap();
        let mut rec = Record::from_pairs([("id", Value::I32(3))]);
        s.fill_computed(&mut rec);
        assert!(matches!(rec.get("doubled"), Some(Value::I32(6))));
    }
}
