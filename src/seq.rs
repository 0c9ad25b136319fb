//! Async Sequence Wrapper (`spec.md` §4.9): the uniform lazy sequence every
//! plan operator produces, and the multi-table row shape operators pass
//! between each other.
//!
//! A thin newtype over [`futures::stream::LocalBoxStream`] rather than
//! `BoxStream` — the engine is `Rc`/`RefCell`-based and single-threaded by
//! design (`spec.md` §5), so sequences are `?Send` throughout, the same
//! choice `table.rs`'s `iterate()` makes.

use crate::error::Result;
use crate::record::Record;
use futures::stream::{LocalBoxStream, Stream, StreamExt};
use rustc_hash::FxHashMap;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// The execution-time record passed between plan operators: a mapping from
/// table alias to that table's (already materialized) row.
pub type MultiRow = FxHashMap<String, Rc<Record>>;

/// Build a single-entry multi-table row under `alias`.
pub fn single_row(alias: impl Into<String>, record: Record) -> MultiRow {
    let mut row = FxHashMap::default();
    row.insert(alias.into(), Rc::new(record));
    row
}

/// A lazy, single-use sequence of multi-table rows. Pulling drives the
/// upstream operator chain; nothing runs ahead of the consumer.
///
/// Parameterized over `'a` rather than fixed to `'static`: a `TableScan`
/// needs to borrow the `Catalog` passed in its [`crate::plan::PlanContext`]
/// across the suspension points of opening and iterating a table, so the
/// sequence a plan produces can't outlive the context it was built from.
pub struct RowSequence<'a>(LocalBoxStream<'a, Result<MultiRow>>);

impl<'a> RowSequence<'a> {
    /// Wrap an already-built stream.
    pub fn new(inner: LocalBoxStream<'a, Result<MultiRow>>) -> Self {
        RowSequence(inner)
    }

    /// Collect every row. Errors short-circuit the collection.
    pub async fn to_vec(mut self) -> Result<Vec<MultiRow>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Yield only the first `n` rows, never pulling the `n+1`th from the
    /// source (`spec.md` §8 invariant 9, `Limit` fidelity).
    pub fn take(self, n: usize) -> Self {
        RowSequence(self.0.take(n).boxed_local())
    }

    /// Map each row through a (possibly async, possibly fallible) function.
    pub fn map<F, Fut>(self, f: F) -> Self
    where
        F: Fn(MultiRow) -> Fut + 'a,
        Fut: std::future::Future<Output = Result<MultiRow>> + 'a,
    {
        let f = Rc::new(f);
        let stream = self.0.then(move |item| {
            let f = f.clone();
            async move {
                match item {
                    Ok(row) => f(row).await,
                    Err(e) => Err(e),
                }
            }
        });
        RowSequence(stream.boxed_local())
    }

    /// Keep only rows for which the (possibly async, possibly fallible)
    /// predicate holds.
    pub fn filter<F, Fut>(self, pred: F) -> Self
    where
        F: Fn(&MultiRow) -> Fut + 'a,
        Fut: std::future::Future<Output = Result<bool>> + 'a,
    {
        let pred = Rc::new(pred);
        let stream = self.0.filter_map(move |item| {
            let pred = pred.clone();
            async move {
                match item {
                    Ok(row) => match pred(&row).await {
                        Ok(true) => Some(Ok(row)),
                        Ok(false) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(e)),
                }
            }
        });
        RowSequence(stream.boxed_local())
    }
}

impl<'a> Stream for RowSequence<'a> {
    type Item = Result<MultiRow>;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use futures::stream;

    fn row(n: i32) -> MultiRow {
        single_row("t", Record::from_pairs([("n", Value::I32(n))]))
    }

    fn seq_of(n: i32) -> RowSequence {
        let rows: Vec<Result<MultiRow>> = (0..n).map(|i| Ok(row(i))).collect();
        RowSequence::new(stream::iter(rows).boxed_local())
    }

    #[tokio::test]
    async fn take_stops_at_n() {
        let out = seq_of(5).take(2).to_vec().await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn map_transforms_each_row() {
        let out = seq_of(3)
            .map(|row| async move {
                let mut row = row;
                row.insert("marker".to_string(), Rc::new(Record::from_pairs([("x", Value::Bool(true))])));
                Ok(row)
            })
            .to_vec()
            .await
            .unwrap();
        assert!(out.iter().all(|r| r.contains_key("marker")));
    }

    #[tokio::test]
    async fn filter_keeps_matching_rows() {
        let out = seq_of(4)
            .filter(|row| {
                let even = matches!(row.get("t").unwrap().get("n"), Some(Value::I32(n)) if n % 2 == 0);
                async move { Ok(even) }
            })
            .to_vec()
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }
}
