//! Value Types and Record Codec (`spec.md` §4.1).
//!
//! A [`Type`] is a capability table: validity, equality, a total order, an
//! optional minimum (used to seed `Max`/`Min` aggregates) and an optional
//! [`Codec`] for binary (de)serialization. The closed set of primitives is
//! built once and the `nullable`/`array` combinators wrap any `TypeRef`, so
//! the set of types in use is open even though the primitives are fixed —
//! column types are modelled as trait objects rather than a tagged enum for
//! exactly this reason.

use crate::error::{Error, Result};
use crate::util;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Shared handle to a type descriptor.
pub type TypeRef = Rc<dyn Type>;

/// A typed value. `None` values of a nullable type are represented as
/// `Value::Null`, never a missing enum variant, so equality/ordering code
/// has one place to special-case nullability.
#[derive(Clone, Debug)]
pub enum Value {
    /// The NULL sentinel. Only valid where the column's type is `nullable`.
    Null,
    ///
    Bool(bool),
    ///
    I16(i16),
    ///
    I32(i32),
    ///
    U16(u16),
    ///
    U32(u32),
    ///
    Float(f64),
    ///
    Str(Rc<String>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Milliseconds since the Unix epoch (UTC).
    Timestamp(i64),
    ///
    Uuid(uuid::Uuid),
    ///
    Json(Rc<serde_json::Value>),
    ///
    Blob(Rc<Vec<u8>>),
    ///
    Array(Rc<Vec<Value>>),
}

impl Value {
    /// Convenience constructor for a UTF-8 string value.
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    /// Convenience constructor for a blob value.
    pub fn blob(b: impl Into<Vec<u8>>) -> Value {
        Value::Blob(Rc::new(b.into()))
    }

    /// Convenience constructor for an array value.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items))
    }

    /// True if this value is the NULL sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Binary codec for a type. Two shapes: fixed-width (`fixed_width` returns
/// `Some(n)`) and variable-width (`fixed_width` returns `None`, and callers
/// must consult [`Codec::size_of`] before writing).
pub trait Codec: fmt::Debug {
    /// `Some(n)` if every encoded value of this type takes exactly `n`
    /// bytes; `None` for variable-width encodings.
    fn fixed_width(&self) -> Option<usize>;

    /// Number of bytes `write` will append for this value.
    fn size_of(&self, v: &Value) -> usize;

    /// Append the encoding of `v` to `buf`.
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()>;

    /// Decode a value starting at `buf[*offset]`, advancing `*offset` past
    /// the bytes consumed.
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value>;
}

/// Capability table for a column type. `compare` is a total pre-order and
/// agrees with `equal`: `compare(a, b) == Equal` iff `equal(a, b)`.
pub trait Type: fmt::Debug {
    /// Stable, human-readable type name (used in `describe`/error messages).
    fn type_name(&self) -> String;

    /// Whether `v` is a legal value of this type (excluding NULL, which only
    /// `Nullable` admits).
    fn is_valid(&self, v: &Value) -> bool;

    /// Total pre-order over valid values of this type.
    fn compare(&self, a: &Value, b: &Value) -> Ordering;

    /// Equality derived from `compare`.
    fn equal(&self, a: &Value, b: &Value) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Minimum value used to seed `Max`/`Min` aggregates, if one exists.
    fn min_value(&self) -> Option<Value> {
        None
    }

    /// Binary codec, if this type is serializable.
    fn codec(&self) -> Option<Rc<dyn Codec>> {
        None
    }

    /// Narrow a `dyn Type` back to its concrete descriptor (used by
    /// `expr::Overlaps` to reach an array column's element type).
    fn as_any(&self) -> &dyn std::any::Any;
}

macro_rules! scalar_type {
    ($ty:ident, $name:expr, $pat:pat => $inner:expr, $min:expr, $codec:expr) => {
        /// Primitive scalar type descriptor.
        #[derive(Debug, Default)]
        pub struct $ty;

        impl Type for $ty {
            fn type_name(&self) -> String {
                $name.to_string()
            }
            fn is_valid(&self, v: &Value) -> bool {
                matches!(v, $pat)
            }
            fn compare(&self, a: &Value, b: &Value) -> Ordering {
                $inner(a, b)
            }
            fn min_value(&self) -> Option<Value> {
                $min
            }
            fn codec(&self) -> Option<Rc<dyn Codec>> {
                $codec
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
}

fn cmp_bool(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(BoolType, "boolean", Value::Bool(_) => cmp_bool, Some(Value::Bool(false)), Some(Rc::new(FixedCodec::Bool)));

fn cmp_i16(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::I16(x), Value::I16(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(I16Type, "int16", Value::I16(_) => cmp_i16, Some(Value::I16(i16::MIN)), Some(Rc::new(FixedCodec::I16)));

fn cmp_i32(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(I32Type, "int32", Value::I32(_) => cmp_i32, Some(Value::I32(i32::MIN)), Some(Rc::new(FixedCodec::I32)));

fn cmp_u16(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::U16(x), Value::U16(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(U16Type, "uint16", Value::U16(_) => cmp_u16, Some(Value::U16(0)), Some(Rc::new(FixedCodec::U16)));

fn cmp_u32(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::U32(x), Value::U32(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(U32Type, "uint32", Value::U32(_) => cmp_u32, Some(Value::U32(0)), Some(Rc::new(FixedCodec::U32)));

fn cmp_float(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        _ => unreachable!(),
    }
}
scalar_type!(FloatType, "float", Value::Float(_) => cmp_float, Some(Value::Float(f64::MIN)), Some(Rc::new(FixedCodec::Float)));

fn cmp_str(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(StringType, "string", Value::Str(_) => cmp_str, Some(Value::str("")), Some(Rc::new(StringCodec)));

fn cmp_date(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(DateType, "date", Value::Date(_) => cmp_date, Some(Value::Date(i32::MIN)), Some(Rc::new(FixedCodec::Date)));

fn cmp_timestamp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(TimestampType, "timestamp", Value::Timestamp(_) => cmp_timestamp, Some(Value::Timestamp(i64::MIN)), Some(Rc::new(FixedCodec::Timestamp)));

fn cmp_uuid(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(UuidType, "uuid", Value::Uuid(_) => cmp_uuid, None, Some(Rc::new(FixedCodec::Uuid)));

fn cmp_blob(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => unreachable!(),
    }
}
scalar_type!(BlobType, "blob", Value::Blob(_) => cmp_blob, Some(Value::blob(Vec::new())), Some(Rc::new(BlobCodec)));

/// JSON values are ordered only by equality (structural); incomparable
/// values fall back to `Equal` so `compare` stays total, per the `json`
/// type's contract of carrying no user-meaningful order.
#[derive(Debug, Default)]
pub struct JsonType;
impl Type for JsonType {
    fn type_name(&self) -> String {
        "json".to_string()
    }
    fn is_valid(&self, v: &Value) -> bool {
        matches!(v, Value::Json(_))
    }
    fn compare(&self, _a: &Value, _b: &Value) -> Ordering {
        Ordering::Equal
    }
    fn equal(&self, a: &Value, b: &Value) -> bool {
        matches!((a, b), (Value::Json(x), Value::Json(y)) if x == y)
    }
    fn codec(&self) -> Option<Rc<dyn Codec>> {
        Some(Rc::new(JsonCodec))
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Auto-assigned `uint32` row sequence, unique per table. Validates exactly
/// like `uint32`; a value omitted on insert is filled in by the table
/// handle from its per-table sequence counter (§4.5).
#[derive(Debug, Default)]
pub struct SerialType;
impl Type for SerialType {
    fn type_name(&self) -> String {
        "serial".to_string()
    }
    fn is_valid(&self, v: &Value) -> bool {
        matches!(v, Value::U32(_))
    }
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        cmp_u32(a, b)
    }
    fn min_value(&self) -> Option<Value> {
        Some(Value::U32(0))
    }
    fn codec(&self) -> Option<Rc<dyn Codec>> {
        Some(Rc::new(FixedCodec::U32))
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Fixed-width codecs for the scalar primitives.
#[derive(Debug)]
enum FixedCodec {
    Bool,
    I16,
    I32,
    U16,
    U32,
    Float,
    Date,
    Timestamp,
    Uuid,
}

impl Codec for FixedCodec {
    fn fixed_width(&self) -> Option<usize> {
        Some(match self {
            FixedCodec::Bool => 1,
            FixedCodec::I16 | FixedCodec::U16 => 2,
            FixedCodec::I32 | FixedCodec::U32 | FixedCodec::Date => 4,
            FixedCodec::Float | FixedCodec::Timestamp => 8,
            FixedCodec::Uuid => 16,
        })
    }
    fn size_of(&self, _v: &Value) -> usize {
        self.fixed_width().unwrap()
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match (self, v) {
            (FixedCodec::Bool, Value::Bool(x)) => buf.push(if *x { 1 } else { 0 }),
            (FixedCodec::I16, Value::I16(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::I32, Value::I32(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::U16, Value::U16(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::U32, Value::U32(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::Float, Value::Float(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::Date, Value::Date(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::Timestamp, Value::Timestamp(x)) => buf.extend_from_slice(&x.to_le_bytes()),
            (FixedCodec::Uuid, Value::Uuid(x)) => buf.extend_from_slice(x.as_bytes()),
            _ => return Err(Error::Codec(format!("cannot encode {v:?} with {self:?}"))),
        }
        Ok(())
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let off = *offset;
        let v = match self {
            FixedCodec::Bool => Value::Bool(buf[off] != 0),
            FixedCodec::I16 => Value::I16(i16::from_le_bytes(buf[off..off + 2].try_into().unwrap())),
            FixedCodec::I32 => Value::I32(i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())),
            FixedCodec::U16 => Value::U16(u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())),
            FixedCodec::U32 => Value::U32(util::getu32(buf, off)),
            FixedCodec::Float => Value::Float(util::getf64(buf, off)),
            FixedCodec::Date => Value::Date(i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())),
            FixedCodec::Timestamp => Value::Timestamp(util::geti64(buf, off)),
            FixedCodec::Uuid => Value::Uuid(uuid::Uuid::from_slice(&buf[off..off + 16]).unwrap()),
        };
        *offset += self.fixed_width().unwrap();
        Ok(v)
    }
}

/// String codec: u32 length prefix + UTF-8 bytes.
#[derive(Debug)]
struct StringCodec;
impl Codec for StringCodec {
    fn fixed_width(&self) -> Option<usize> {
        None
    }
    fn size_of(&self, v: &Value) -> usize {
        match v {
            Value::Str(s) => 4 + s.len(),
            _ => 0,
        }
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match v {
            Value::Str(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
                Ok(())
            }
            _ => Err(Error::Codec(format!("cannot encode {v:?} as string"))),
        }
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let len = util::getu32(buf, *offset) as usize;
        let start = *offset + 4;
        let s = String::from_utf8(buf[start..start + len].to_vec())
            .map_err(|e| Error::Codec(e.to_string()))?;
        *offset = start + len;
        Ok(Value::str(s))
    }
}

/// Blob codec: u32 length prefix + raw bytes.
#[derive(Debug)]
struct BlobCodec;
impl Codec for BlobCodec {
    fn fixed_width(&self) -> Option<usize> {
        None
    }
    fn size_of(&self, v: &Value) -> usize {
        match v {
            Value::Blob(b) => 4 + b.len(),
            _ => 0,
        }
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match v {
            Value::Blob(b) => {
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
                Ok(())
            }
            _ => Err(Error::Codec(format!("cannot encode {v:?} as blob"))),
        }
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let len = util::getu32(buf, *offset) as usize;
        let start = *offset + 4;
        *offset = start + len;
        Ok(Value::blob(buf[start..start + len].to_vec()))
    }
}

/// JSON codec: u32 length prefix + serialized JSON bytes.
#[derive(Debug)]
struct JsonCodec;
impl Codec for JsonCodec {
    fn fixed_width(&self) -> Option<usize> {
        None
    }
    fn size_of(&self, v: &Value) -> usize {
        match v {
            Value::Json(j) => 4 + serde_json::to_vec(j.as_ref()).map(|b| b.len()).unwrap_or(0),
            _ => 0,
        }
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match v {
            Value::Json(j) => {
                let bytes = serde_json::to_vec(j.as_ref()).map_err(|e| Error::Codec(e.to_string()))?;
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(&bytes);
                Ok(())
            }
            _ => Err(Error::Codec(format!("cannot encode {v:?} as json"))),
        }
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let len = util::getu32(buf, *offset) as usize;
        let start = *offset + 4;
        let val: serde_json::Value =
            serde_json::from_slice(&buf[start..start + len]).map_err(|e| Error::Codec(e.to_string()))?;
        *offset = start + len;
        Ok(Value::Json(Rc::new(val)))
    }
}

/// Nullable combinator: prefixes a one-byte tag (0 = null, 1 = present),
/// and orders NULL strictly below every non-null value.
#[derive(Debug)]
pub struct Nullable(pub TypeRef);

impl Type for Nullable {
    fn type_name(&self) -> String {
        format!("{}?", self.0.type_name())
    }
    fn is_valid(&self, v: &Value) -> bool {
        matches!(v, Value::Null) || self.0.is_valid(v)
    }
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.0.compare(a, b),
        }
    }
    fn min_value(&self) -> Option<Value> {
        Some(Value::Null)
    }
    fn codec(&self) -> Option<Rc<dyn Codec>> {
        self.0.codec().map(|inner| Rc::new(NullableCodec(inner)) as Rc<dyn Codec>)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug)]
struct NullableCodec(Rc<dyn Codec>);
impl Codec for NullableCodec {
    fn fixed_width(&self) -> Option<usize> {
        None
    }
    fn size_of(&self, v: &Value) -> usize {
        1 + match v {
            Value::Null => 0,
            _ => self.0.size_of(v),
        }
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match v {
            Value::Null => {
                buf.push(0);
                Ok(())
            }
            _ => {
                buf.push(1);
                self.0.write(v, buf)
            }
        }
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let tag = buf[*offset];
        *offset += 1;
        if tag == 0 {
            Ok(Value::Null)
        } else {
            self.0.read(buf, offset)
        }
    }
}

/// Array combinator: maps the inner type elementwise, lexicographic order
/// tie-broken by length so two arrays of different length never compare
/// incomparable.
#[derive(Debug)]
pub struct ArrayType(pub TypeRef);

impl Type for ArrayType {
    fn type_name(&self) -> String {
        format!("{}[]", self.0.type_name())
    }
    fn is_valid(&self, v: &Value) -> bool {
        match v {
            Value::Array(items) => items.iter().all(|x| self.0.is_valid(x)),
            _ => false,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Array(xs), Value::Array(ys)) => {
                for (x, y) in xs.iter().zip(ys.iter()) {
                    let c = self.0.compare(x, y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                xs.len().cmp(&ys.len())
            }
            _ => panic!("array: compare called on non-array value"),
        }
    }
    fn codec(&self) -> Option<Rc<dyn Codec>> {
        self.0.codec().map(|inner| Rc::new(ArrayCodec(inner)) as Rc<dyn Codec>)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug)]
struct ArrayCodec(Rc<dyn Codec>);
impl Codec for ArrayCodec {
    fn fixed_width(&self) -> Option<usize> {
        None
    }
    fn size_of(&self, v: &Value) -> usize {
        match v {
            Value::Array(items) => 4 + items.iter().map(|x| self.0.size_of(x)).sum::<usize>(),
            _ => 0,
        }
    }
    fn write(&self, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match v {
            Value::Array(items) => {
                buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items.iter() {
                    self.0.write(item, buf)?;
                }
                Ok(())
            }
            _ => Err(Error::Codec(format!("cannot encode {v:?} as array"))),
        }
    }
    fn read(&self, buf: &[u8], offset: &mut usize) -> Result<Value> {
        let n = util::getu32(buf, *offset) as usize;
        *offset += 4;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.0.read(buf, offset)?);
        }
        Ok(Value::array(items))
    }
}

/// Wrap `t` in the `nullable` combinator.
pub fn nullable(t: TypeRef) -> TypeRef {
    Rc::new(Nullable(t))
}

/// Wrap `t` in the `array` combinator.
pub fn array(t: TypeRef) -> TypeRef {
    Rc::new(ArrayType(t))
}

/// Build the descriptor for one of the closed primitive types by name.
fn primitive(name: &str) -> Option<TypeRef> {
    Some(match name {
        "boolean" => Rc::new(BoolType) as TypeRef,
        "int16" => Rc::new(I16Type),
        "int32" => Rc::new(I32Type),
        "uint16" => Rc::new(U16Type),
        "uint32" => Rc::new(U32Type),
        "float" => Rc::new(FloatType),
        "string" => Rc::new(StringType),
        "date" => Rc::new(DateType),
        "timestamp" => Rc::new(TimestampType),
        "uuid" => Rc::new(UuidType),
        "json" => Rc::new(JsonType),
        "blob" => Rc::new(BlobType),
        "serial" => Rc::new(SerialType),
        _ => return None,
    })
}

/// Parse a type descriptor from a string such as `"string"`, `"int32?"` or
/// `"string[]?"`. Suffixes (`?`, `[]`) are peeled from the right and applied
/// right-to-left, so `"string[]?"` is `nullable(array(string))`.
pub fn parse_type(spec: &str) -> Option<TypeRef> {
    let mut rest = spec;
    let mut suffixes = Vec::new();
    loop {
        if let Some(stripped) = rest.strip_suffix('?') {
            suffixes.push('?');
            rest = stripped;
        } else if let Some(stripped) = rest.strip_suffix("[]") {
            suffixes.push('[');
            rest = stripped;
        } else {
            break;
        }
    }
    let mut t = primitive(rest)?;
    for s in suffixes.into_iter().rev() {
        t = match s {
            '?' => nullable(t),
            '[' => array(t),
            _ => unreachable!(),
        };
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip_scalars() {
        let cases: Vec<(TypeRef, Value)> = vec![
            (Rc::new(BoolType), Value::Bool(true)),
            (Rc::new(I16Type), Value::I16(-7)),
            (Rc::new(I32Type), Value::I32(-70000)),
            (Rc::new(U16Type), Value::U16(7)),
            (Rc::new(U32Type), Value::U32(70000)),
            (Rc::new(FloatType), Value::Float(3.5)),
            (Rc::new(StringType), Value::str("hello")),
            (Rc::new(DateType), Value::Date(19000)),
            (Rc::new(TimestampType), Value::Timestamp(1_700_000_000_000)),
            (Rc::new(BlobType), Value::blob(vec![1, 2, 3])),
        ];
        for (ty, v) in cases {
            let codec = ty.codec().expect("scalar types are serializable");
            let mut buf = Vec::new();
            codec.write(&v, &mut buf).unwrap();
            assert_eq!(buf.len(), codec.size_of(&v));
            let mut off = 0;
            let back = codec.read(&buf, &mut off).unwrap();
            assert!(ty.equal(&v, &back), "{v:?} != {back:?}");
            assert_eq!(off, buf.len());
        }
    }

    #[test]
    fn codec_round_trip_json() {
        let ty: TypeRef = Rc::new(JsonType);
        let v = Value::Json(Rc::new(serde_json::json!({"a": 1, "b": [true, null, "x"]})));
        let codec = ty.codec().expect("json is serializable");
        let mut buf = Vec::new();
        codec.write(&v, &mut buf).unwrap();
        assert_eq!(buf.len(), codec.size_of(&v));
        let mut off = 0;
        let back = codec.read(&buf, &mut off).unwrap();
        assert!(ty.equal(&v, &back), "{v:?} != {back:?}");
        assert_eq!(off, buf.len());
    }

    #[test]
    fn nullable_orders_null_below_everything() {
        let t = nullable(Rc::new(I32Type));
        assert_eq!(t.compare(&Value::Null, &Value::I32(-1000000)), Ordering::Less);
        assert_eq!(t.compare(&Value::I32(5), &Value::Null), Ordering::Greater);
        assert_eq!(t.compare(&Value::Null, &Value::Null), Ordering::Equal);
    }

    #[test]
    fn nullable_codec_round_trip() {
        let t = nullable(Rc::new(StringType));
        let codec = t.codec().unwrap();
        for v in [Value::Null, Value::str("x")] {
            let mut buf = Vec::new();
            codec.write(&v, &mut buf).unwrap();
            let mut off = 0;
            let back = codec.read(&buf, &mut off).unwrap();
            assert!(t.equal(&v, &back));
        }
    }

    #[test]
    fn array_orders_by_elements_then_length() {
        let t = array(Rc::new(I32Type));
        let short = Value::array(vec![Value::I32(1)]);
        let long = Value::array(vec![Value::I32(1), Value::I32(0)]);
        assert_eq!(t.compare(&short, &long), Ordering::Less);

        let a = Value::array(vec![Value::I32(1), Value::I32(2)]);
        let b = Value::array(vec![Value::I32(1), Value::I32(3)]);
        assert_eq!(t.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn array_codec_round_trip() {
        let t = array(Rc::new(I32Type));
        let codec = t.codec().unwrap();
        let v = Value::array(vec![Value::I32(1), Value::I32(-2), Value::I32(3)]);
        let mut buf = Vec::new();
        codec.write(&v, &mut buf).unwrap();
        let mut off = 0;
        let back = codec.read(&buf, &mut off).unwrap();
        assert!(t.equal(&v, &back));
    }

    #[test]
    fn parse_type_suffixes_right_to_left() {
        let t = parse_type("int32[]?").unwrap();
        assert_eq!(t.type_name(), "int32[]?");
        let inner_is_array = {
            let v = Value::Null;
            t.is_valid(&v)
        };
        assert!(inner_is_array);
        assert!(t.is_valid(&Value::array(vec![Value::I32(1)])));
    }

    #[test]
    fn min_value_present_for_ordered_scalars() {
        assert!(I32Type.min_value().is_some());
        assert!(UuidType.min_value().is_none());
    }
}
