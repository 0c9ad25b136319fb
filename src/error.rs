//! Error taxonomy for the query engine and storage layer.
//!
//! Every public fallible operation returns [`Result<T>`]. Nothing inside the
//! engine is swallowed: storage failures, constraint violations and plan
//! failures all surface through this type rather than a panic.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The taxonomy from the specification's error-handling design, by meaning
/// rather than by exhaustive sub-kind.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// insert/update supplied a value failing the column type's `is_valid`.
    #[error("invalid record: column `{column}`: {reason}")]
    InvalidRecord {
        /// Offending column name.
        column: String,
        /// Human readable reason.
        reason: String,
    },

    /// A unique index already contains the key being inserted.
    #[error("unique violation on index `{index}`")]
    UniqueViolation {
        /// Name of the violated index.
        index: String,
    },

    /// `lookupUniqueOrThrow` / `getOrThrow` found nothing.
    #[error("not found")]
    NotFound,

    /// Reference to an unknown `(db, table)` pair.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Operation against a table superseded by migration, or after shutdown.
    #[error("table dropped")]
    Dropped,

    /// Expression operands have incompatible types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A sub-query returned the wrong shape.
    #[error("sub-query shape error: {0}")]
    SubQueryShape(&'static str),

    /// `Max`/`Min` requested over a type with no minimum value.
    #[error("type `{0}` has no minimum value")]
    NoMinValue(String),

    /// A page header or magic value did not match on read. Fatal: the open
    /// is aborted, the store is not usable.
    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage {
        /// Page id that failed validation.
        page_id: u64,
        /// Human readable reason.
        reason: String,
    },

    /// Codec read/write failed (short buffer, invalid UTF-8, ...).
    #[error("codec error: {0}")]
    Codec(String),

    /// Underlying I/O failure from a file-backed store.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construct an [`Error::InvalidRecord`].
    pub fn invalid_record(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRecord {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

/// Marker used in a handful of spots where we need to format a type name
/// without pulling in the full `Type` trait object (e.g. inside `Display`
/// impls that must stay `'static`).
pub(crate) fn type_mismatch(left: impl fmt::Display, right: impl fmt::Display) -> Error {
    Error::TypeMismatch(format!("{left} is not compatible with {right}"))
}
