//! Iterators over index elements.
//!
//! A file set reads from several files at once, so most iterators here
//! merge per-file iterators into one ordered stream. Files are given
//! newest first and a newer file's statement about an element shadows any
//! older one, which is how deletions mask elements that still exist in
//! older files.

use tsidx_common::iterator::TryIterator;

use crate::error::{IndexError, Result};
use crate::series_id_set::SeriesIdSet;
use crate::SeriesId;

/// A boxed fallible iterator over index elements.
pub type ElemIterator<E> = Box<dyn TryIterator<Item = E, Error = IndexError> + Send>;

/// A boxed fallible iterator over series IDs in ascending order.
pub type SeriesIdIterator = Box<dyn TryIterator<Item = SeriesId, Error = IndexError> + Send>;

/// Anything mergeable by key with a deletion marker.
pub trait MergeElement {
    fn merge_key(&self) -> &[u8];
    fn deleted(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementElem {
    pub name: Vec<u8>,
    pub deleted: bool,
}

impl MergeElement for MeasurementElem {
    fn merge_key(&self) -> &[u8] {
        &self.name
    }
    fn deleted(&self) -> bool {
        self.deleted
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TagKeyElem {
    pub key: Vec<u8>,
    pub deleted: bool,
}

impl MergeElement for TagKeyElem {
    fn merge_key(&self) -> &[u8] {
        &self.key
    }
    fn deleted(&self) -> bool {
        self.deleted
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TagValueElem {
    pub value: Vec<u8>,
    pub deleted: bool,
}

impl MergeElement for TagValueElem {
    fn merge_key(&self) -> &[u8] {
        &self.value
    }
    fn deleted(&self) -> bool {
        self.deleted
    }
}

/// Iterator over an owned, pre-sorted vector of elements.
pub struct VecElemIterator<E> {
    elems: std::vec::IntoIter<E>,
}

impl<E> VecElemIterator<E> {
    pub fn new(elems: Vec<E>) -> Self {
        VecElemIterator {
            elems: elems.into_iter(),
        }
    }
}

impl<E> TryIterator for VecElemIterator<E> {
    type Item = E;
    type Error = IndexError;

    fn try_next(&mut self) -> Result<Option<E>> {
        Ok(self.elems.next())
    }
}

struct Cursor<E> {
    itr: ElemIterator<E>,
    head: Option<E>,
}

/// Merges several key-ordered element iterators. Inputs are newest first;
/// when multiple inputs carry the same key, the newest one wins and the
/// rest are discarded. Elements whose winning statement is a deletion are
/// suppressed unless `keep_deleted` is set, which compaction uses to carry
/// tombstones forward.
pub struct MergeElemIterator<E> {
    cursors: Vec<Cursor<E>>,
    keep_deleted: bool,
}

impl<E: MergeElement> MergeElemIterator<E> {
    pub fn new(itrs: Vec<ElemIterator<E>>) -> Result<Self> {
        Self::with_options(itrs, false)
    }

    pub fn new_keep_deleted(itrs: Vec<ElemIterator<E>>) -> Result<Self> {
        Self::with_options(itrs, true)
    }

    fn with_options(itrs: Vec<ElemIterator<E>>, keep_deleted: bool) -> Result<Self> {
        let mut cursors = Vec::with_capacity(itrs.len());
        for mut itr in itrs {
            let head = itr.try_next()?;
            cursors.push(Cursor { itr, head });
        }
        Ok(MergeElemIterator {
            cursors,
            keep_deleted,
        })
    }
}

impl<E: MergeElement> TryIterator for MergeElemIterator<E> {
    type Item = E;
    type Error = IndexError;

    fn try_next(&mut self) -> Result<Option<E>> {
        loop {
            let mut min: Option<&[u8]> = None;
            for cursor in &self.cursors {
                if let Some(head) = &cursor.head {
                    let smaller = match min {
                        None => true,
                        Some(m) => head.merge_key() < m,
                    };
                    if smaller {
                        min = Some(head.merge_key());
                    }
                }
            }
            let min = match min {
                Some(m) => m.to_vec(),
                None => return Ok(None),
            };

            // consume the key from every input; the newest statement wins
            let mut winner: Option<E> = None;
            for cursor in &mut self.cursors {
                let matches = cursor
                    .head
                    .as_ref()
                    .map_or(false, |h| h.merge_key() == min.as_slice());
                if !matches {
                    continue;
                }
                let head = cursor.head.take();
                if winner.is_none() {
                    winner = head;
                }
                cursor.head = cursor.itr.try_next()?;
            }

            if let Some(w) = winner {
                if self.keep_deleted || !w.deleted() {
                    return Ok(Some(w));
                }
            }
        }
    }
}

/// Iterator over a materialized set of series IDs, ascending.
pub struct SeriesIdSetIterator {
    ids: std::vec::IntoIter<SeriesId>,
}

impl SeriesIdSetIterator {
    pub fn new(set: SeriesIdSet) -> Self {
        let ids: Vec<SeriesId> = set.iter().collect();
        SeriesIdSetIterator {
            ids: ids.into_iter(),
        }
    }
}

impl TryIterator for SeriesIdSetIterator {
    type Item = SeriesId;
    type Error = IndexError;

    fn try_next(&mut self) -> Result<Option<SeriesId>> {
        Ok(self.ids.next())
    }
}

struct IdCursor {
    itr: SeriesIdIterator,
    head: Option<SeriesId>,
}

/// Merges ascending series ID iterators into one deduplicated ascending
/// stream.
pub struct SeriesIdMergeIterator {
    cursors: Vec<IdCursor>,
}

impl SeriesIdMergeIterator {
    pub fn new(itrs: Vec<SeriesIdIterator>) -> Result<Self> {
        let mut cursors = Vec::with_capacity(itrs.len());
        for mut itr in itrs {
            let head = itr.try_next()?;
            cursors.push(IdCursor { itr, head });
        }
        Ok(SeriesIdMergeIterator { cursors })
    }
}

impl TryIterator for SeriesIdMergeIterator {
    type Item = SeriesId;
    type Error = IndexError;

    fn try_next(&mut self) -> Result<Option<SeriesId>> {
        let mut min: Option<SeriesId> = None;
        for cursor in &self.cursors {
            if let Some(head) = cursor.head {
                min = Some(match min {
                    None => head,
                    Some(m) => m.min(head),
                });
            }
        }
        let min = match min {
            Some(m) => m,
            None => return Ok(None),
        };

        for cursor in &mut self.cursors {
            if cursor.head == Some(min) {
                cursor.head = cursor.itr.try_next()?;
            }
        }
        Ok(Some(min))
    }
}

/// Drains a fallible iterator into a vector. Test and tooling helper.
pub fn collect_elems<E>(mut itr: impl TryIterator<Item = E, Error = IndexError>) -> Result<Vec<E>> {
    let mut out = Vec::new();
    while let Some(elem) = itr.try_next()? {
        out.push(elem);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(name: &str, deleted: bool) -> MeasurementElem {
        MeasurementElem {
            name: name.as_bytes().to_vec(),
            deleted,
        }
    }

    fn boxed(elems: Vec<MeasurementElem>) -> ElemIterator<MeasurementElem> {
        Box::new(VecElemIterator::new(elems))
    }

    #[test]
    fn test_merge_newest_statement_wins() {
        // newest file deletes "cpu" and adds "disk"; older file still has both
        let newest = boxed(vec![m("cpu", true), m("disk", false)]);
        let oldest = boxed(vec![m("cpu", false), m("mem", false)]);

        let itr = MergeElemIterator::new(vec![newest, oldest]).unwrap();
        let names: Vec<_> = collect_elems(itr)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![b"disk".to_vec(), b"mem".to_vec()]);
    }

    #[test]
    fn test_merge_keep_deleted_carries_tombstones() {
        let newest = boxed(vec![m("cpu", true)]);
        let oldest = boxed(vec![m("cpu", false), m("mem", false)]);

        let itr = MergeElemIterator::new_keep_deleted(vec![newest, oldest]).unwrap();
        let elems = collect_elems(itr).unwrap();
        assert_eq!(elems, vec![m("cpu", true), m("mem", false)]);
    }

    #[test]
    fn test_merge_empty_inputs() {
        let itr =
            MergeElemIterator::<MeasurementElem>::new(vec![boxed(vec![]), boxed(vec![])]).unwrap();
        assert!(collect_elems(itr).unwrap().is_empty());

        let itr = MergeElemIterator::<MeasurementElem>::new(vec![]).unwrap();
        assert!(collect_elems(itr).unwrap().is_empty());
    }

    #[test]
    fn test_series_id_merge_dedupes() {
        let a: SeriesIdIterator =
            Box::new(SeriesIdSetIterator::new([1u64, 3, 5].into_iter().collect()));
        let b: SeriesIdIterator =
            Box::new(SeriesIdSetIterator::new([2u64, 3, 6].into_iter().collect()));

        let mut itr = SeriesIdMergeIterator::new(vec![a, b]).unwrap();
        let mut out = Vec::new();
        while let Some(id) = itr.try_next().unwrap() {
            out.push(id);
        }
        assert_eq!(out, vec![1, 2, 3, 5, 6]);
    }
}
