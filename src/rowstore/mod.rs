//! Paged Row Store (`spec.md` §4.2): the contract every storage backend
//! implements, plus the backends themselves.
//!
//! All backends share the same staging discipline: `insert`/`set`/`remove`
//! land in a dirty buffer and a tombstone set; `get`/`iterate` read through
//! that staged state; only `commit` makes it durable. `drop_store` marks the
//! backend unusable — every subsequent call fails with [`Error::Dropped`].

pub mod file;
pub mod kv;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::LocalBoxStream;

/// Opaque, totally ordered row identifier assigned by the store on insert.
pub type RowId = u64;

/// Storage contract for a single table's rows. One instance per table; a
/// `RowStore` is never shared across tables (`spec.md` §5).
#[async_trait(?Send)]
pub trait RowStore {
    /// Stage `bytes` as a new row and assign it a fresh row-id.
    async fn insert(&mut self, bytes: Vec<u8>) -> Result<RowId>;

    /// Read through staged state. `None` for a missing or tombstoned id.
    async fn get(&self, id: RowId) -> Result<Option<Vec<u8>>>;

    /// Stage an overwrite of an existing row's bytes.
    async fn set(&mut self, id: RowId, bytes: Vec<u8>) -> Result<()>;

    /// Stage a tombstone for `id`. Removing a missing id is a no-op.
    async fn remove(&mut self, id: RowId) -> Result<()>;

    /// Lazily stream every live `(row_id, bytes)` pair, staged state
    /// included, in ascending row-id order.
    fn iterate(&self) -> LocalBoxStream<'_, (RowId, Vec<u8>)>;

    /// Flush staged inserts/updates/removals to the backing medium.
    async fn commit(&mut self) -> Result<()>;

    /// Permanently disable this store; every later call fails with
    /// [`crate::error::Error::Dropped`], including a pending `commit`.
    async fn drop_store(&mut self) -> Result<()>;
}
